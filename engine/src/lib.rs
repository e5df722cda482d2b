//! Client core of a decentralized service-routing overlay: service
//! discovery and connection planning, fee-paid query execution with
//! quorum reconciliation, and cross-chain atomic swaps.

pub mod app;
pub mod constants;
pub mod error;
pub mod fee_payment;
pub mod http_fallback;
pub mod logging;
pub mod node_config;
pub mod packet;
pub mod pending_connections;
pub mod query_manager;
pub mod registry;
pub mod score;
pub mod service;
pub mod settings;
pub mod transport;
pub mod utils;
pub mod wallet;

// Blockchains
pub mod eth;
pub mod swap;

pub use app::{App, CallResult};
pub use error::XRouterError;
pub use packet::{ClientKey, XRouterCommand, XRouterPacket};
pub use settings::Settings;
