use std::time::Duration;

// ======= Query engine =======

/// Default number of service nodes queried per request.
pub const DEFAULT_CONFIRMATIONS: u32 = 1;

/// Default per-command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum parameter count a node accepts per request.
pub const DEFAULT_FETCH_LIMIT: i32 = 50;

/// Sleep between checks of the reply table while a query is in flight.
pub const QUERY_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Upper bound on every shutdown-aware wait loop's sleep slice.
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Bounds on how many nodes a single request may fan out to.
pub const MIN_QUERY_NODES: u32 = 1;
pub const MAX_QUERY_NODES: u32 = 50;

/// Stored replies are kept this long for late retrieval before being purged.
pub const REPLY_RETENTION: Duration = Duration::from_secs(600);

// ======= Connections & configs =======

/// Default port service nodes listen on for overlay traffic.
pub const DEFAULT_P2P_PORT: u16 = 41412;

/// Time allowed for a freshly dialed peer to hand over its config.
pub const DEFAULT_CONFIG_SYNC_TIMEOUT: Duration = Duration::from_secs(4);

/// Time allowed for a dial to complete before the target is penalized.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Cached node configs older than this are refreshed by the background timer.
pub const CONFIG_MAX_AGE: Duration = Duration::from_secs(600);

/// Interval of the background config-refresh timer.
pub const CONFIG_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

// ======= Scoring =======

/// Score at or below which a node is banned at the transport layer.
pub const DEFAULT_BAN_SCORE: i32 = -200;

/// Score assigned to a node once its ban expires.
pub const SCORE_AFTER_BAN: i32 = -30;

// ======= Atomic swaps =======

/// Refund window for the swap initiator ('A').
pub const TIMELOCK_INITIATOR: Duration = Duration::from_secs(7200);

/// Refund window for the swap responder ('B'). Must stay strictly below the
/// initiator's window.
pub const TIMELOCK_RESPONDER: Duration = Duration::from_secs(3600);

/// Interval between contract event scans.
pub const SWAP_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Confirmations a swap deposit needs before it counts as good.
pub const DEFAULT_DEPOSIT_CONFIRMATIONS: u32 = 1;
