//! Top-level service object. Owns the query manager, config cache, score
//! table and pending-connection coordinator, and drives the two halves of a
//! client call: planning (resolve a service to enough suitable peers,
//! dialing and fetching configs as needed) and execution (fan the request
//! out, collect replies under the deadline, reconcile a consensus answer).

use std::{
	collections::{BTreeMap, HashMap, HashSet},
	sync::{Arc, Mutex},
	time::{Duration, Instant},
};

use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
	constants::{
		CONFIG_MAX_AGE, CONFIG_REFRESH_INTERVAL, DIAL_TIMEOUT, MAX_QUERY_NODES,
		MIN_QUERY_NODES, QUERY_POLL_INTERVAL, REPLY_RETENTION, SHUTDOWN_POLL_INTERVAL,
	},
	error::{codes, XRouterError},
	fee_payment::FeePaymentGenerator,
	http_fallback::{HttpCallOutcome, XRouterHttpClient},
	node_config::{ConfigCache, NodeConfig},
	packet::{
		build_request, parse_reply_body, ClientKey, XRouterCommand, XRouterPacket,
	},
	pending_connections::DialAttempt,
	pending_connections::PendingConnections,
	query_manager::QueryManager,
	registry::{NodeAddr, RegistryApi, ServiceNode},
	score::{penalty, ScoreTable, ScoreUpdate},
	service,
	settings::Settings,
	transport::P2pTransport,
	utils::{amount_from_value, is_hash, is_number, Amount, ShutdownFlag},
	wallet::UtxoWalletApi,
};

/// Outcome of one client call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
	pub uuid: Uuid,
	/// Consensus reply, or an `{error, code, uuid}` envelope.
	pub reply: String,
}

/// A peer that must be reached over HTTP because it advertises a
/// non-default overlay port.
#[derive(Debug, Clone)]
struct DirectDialNode {
	snode: ServiceNode,
	port: u16,
}

struct PlannerSelection {
	direct_dial: Vec<DirectDialNode>,
	found: u32,
}

enum QueryRoute {
	P2p,
	Http { host: String, port: u16 },
}

struct QueryTarget {
	snode: ServiceNode,
	route: QueryRoute,
}

pub struct App {
	settings: Settings,
	registry: Arc<dyn RegistryApi>,
	transport: Arc<dyn P2pTransport>,
	http: XRouterHttpClient,
	pub query_mgr: QueryManager,
	pub score_table: ScoreTable,
	configs: ConfigCache,
	pending: PendingConnections,
	fee_gen: FeePaymentGenerator,
	wallet_handle: Arc<dyn UtxoWalletApi>,
	key: ClientKey,
	last_requests: Mutex<HashMap<(NodeAddr, String), Instant>>,
	shutdown: ShutdownFlag,
}

impl App {
	pub fn new(
		settings: Settings,
		registry: Arc<dyn RegistryApi>,
		transport: Arc<dyn P2pTransport>,
		wallet: Arc<dyn UtxoWalletApi>,
		key: ClientKey,
	) -> Arc<Self> {
		let ban_score = settings.ban_score;
		Arc::new(Self {
			settings,
			registry,
			transport,
			http: XRouterHttpClient::new(),
			query_mgr: QueryManager::new(),
			score_table: ScoreTable::new(ban_score),
			configs: ConfigCache::new(),
			pending: PendingConnections::new(),
			fee_gen: FeePaymentGenerator::new(wallet.clone()),
			wallet_handle: wallet,
			key,
			last_requests: Mutex::new(HashMap::new()),
			shutdown: ShutdownFlag::new(),
		})
	}

	pub fn shutdown_flag(&self) -> ShutdownFlag {
		self.shutdown.clone()
	}

	pub fn request_shutdown(&self) {
		self.shutdown.request();
	}

	// ======= Scores =======

	pub fn score(&self, node: &str) -> i32 {
		self.score_table.get(node)
	}

	/// Adjusts a node's score; a node falling to the ban threshold is
	/// disconnected and banned at the transport layer.
	pub fn update_score(&self, node: &str, delta: i32) {
		if let ScoreUpdate::Banned(offending) = self.score_table.adjust(node, delta) {
			tracing::warn!("Banning node {node}, score too low: {offending}");
			self.transport.disconnect(node);
			self.transport.ban(node);
		}
	}

	// ======= Configs =======

	pub fn config(&self, node: &str) -> Option<Arc<NodeConfig>> {
		self.configs.get(node)
	}

	pub fn has_config(&self, node: &str) -> bool {
		self.configs.has(node)
	}

	/// Public JSON view of every cached config.
	pub fn print_configs(&self) -> Value {
		let entries: Vec<Value> = self
			.configs
			.all()
			.into_iter()
			.map(|(addr, config)| {
				config.config_json(self.score(&addr), self.transport.is_banned(&addr))
			})
			.collect();
		Value::Array(entries)
	}

	/// Re-requests configs from connected service nodes. Unless `force`d,
	/// only stale entries are refreshed. Returns how many requests went out.
	pub async fn update_configs(&self, force: bool) -> u32 {
		let snodes: HashMap<NodeAddr, ServiceNode> = self
			.registry
			.service_nodes()
			.into_iter()
			.map(|s| (s.host.clone(), s))
			.collect();

		let mut requested = 0;
		for addr in self.transport.connected_peers() {
			let Some(snode) = snodes.get(&addr) else {
				continue;
			};
			if !snode.has_service(service::XR) {
				continue;
			}
			if !force {
				if !self.configs.needs_update(&addr, CONFIG_MAX_AGE) {
					continue;
				}
				if self.rate_limit_exceeded(
					&addr,
					XRouterCommand::GetConfig.as_str(),
					10_000,
				) {
					continue;
				}
			}
			if self.send_config_request(&addr).await.is_ok() {
				requested += 1;
			}
		}
		requested
	}

	// ======= Rate limiting =======

	fn update_sent_request(&self, node: &str, fq_service: &str) {
		self.last_requests
			.lock()
			.unwrap()
			.insert((node.to_string(), fq_service.to_string()), Instant::now());
	}

	fn rate_limit_exceeded(&self, node: &str, fq_service: &str, rate_limit_ms: i64) -> bool {
		if rate_limit_ms < 0 {
			return false;
		}
		self.last_requests
			.lock()
			.unwrap()
			.get(&(node.to_string(), fq_service.to_string()))
			.map(|last| last.elapsed() < Duration::from_millis(rate_limit_ms as u64))
			.unwrap_or(false)
	}

	// ======= Candidate filtering =======

	/// Rejection checks against a candidate's advertised config. Returns
	/// true when the node must be skipped.
	fn failed_checks(
		&self,
		node: &str,
		config: &NodeConfig,
		command: XRouterCommand,
		service_name: &str,
		parameter_count: usize,
		max_fee: f64,
		spendable: Amount,
	) -> bool {
		let fee = config.command_fee(command, service_name);
		if fee > 0.0 {
			if fee > max_fee {
				tracing::debug!(
					"Skipping node {node}, fee {fee} above max fee {max_fee}"
				);
				return true;
			}
			match amount_from_value(fee) {
				Ok(amount) if amount <= spendable => {},
				_ => {
					tracing::debug!(
						"Skipping node {node}, not enough unspent outputs for fee {fee}"
					);
					return true;
				},
			}
		}
		let fetch_limit = config.command_fetch_limit(command, service_name);
		if fetch_limit >= 0 && parameter_count > fetch_limit as usize {
			tracing::debug!("Skipping node {node}, fetch limit {fetch_limit} too low");
			return true;
		}
		let rate_limit = config.client_request_limit(command, service_name);
		if self.rate_limit_exceeded(
			node,
			&service::fq_service(command, service_name),
			rate_limit,
		) {
			tracing::debug!("Skipping node {node}, rate limited");
			return true;
		}
		false
	}

	/// Sort key: configured nodes first, then higher score, then lower fee.
	fn candidate_order_key(
		&self,
		node: &str,
		command: XRouterCommand,
		service_name: &str,
	) -> (u8, i64, Amount) {
		let config = self.config(node);
		let has_config = config.is_some();
		let fee = config
			.map(|c| c.command_fee(command, service_name))
			.map(|fee| amount_from_value(fee).unwrap_or(Amount::MAX))
			.unwrap_or(Amount::MAX);
		(u8::from(!has_config), -(self.score(node) as i64), fee)
	}

	// ======= Config exchange =======

	async fn send_config_request(&self, node: &str) -> anyhow::Result<Uuid> {
		let uuid = Uuid::new_v4();
		self.query_mgr.add_query(uuid, node);
		let mut packet = XRouterPacket::new(XRouterCommand::GetConfig, uuid);
		packet.append_str("");
		packet.sign(&self.key);
		self.update_sent_request(node, XRouterCommand::GetConfig.as_str());
		self.transport.send_message(node, packet.to_bytes()).await?;
		tracing::debug!("Requesting config from node {node}, query {uuid}");
		Ok(uuid)
	}

	/// Requests a node's config and waits for it under the sync timeout.
	async fn fetch_config(&self, node: &str) -> Option<Arc<NodeConfig>> {
		let uuid = self.send_config_request(node).await.ok()?;
		let notify = self.query_mgr.notifier(uuid, node)?;
		let deadline = Instant::now() + self.settings.config_sync_timeout();
		while !self.shutdown.is_requested() && Instant::now() < deadline {
			if self.query_mgr.has_reply(uuid, node) {
				break;
			}
			let _ = tokio::time::timeout(SHUTDOWN_POLL_INTERVAL, notify.notified()).await;
		}
		self.query_mgr.purge(uuid);
		self.config(node)
	}

	// ======= Planner =======

	/// Makes sure the node passes the filters, dialing and fetching its
	/// config first when missing.
	async fn prepare_candidate(
		&self,
		snode: &ServiceNode,
		command: XRouterCommand,
		service_name: &str,
		parameter_count: usize,
		max_fee: f64,
		spendable: Amount,
	) -> bool {
		let addr = &snode.host;
		if !self.transport.is_connected(addr) {
			match self.pending.begin(addr) {
				DialAttempt::Owner => {
					match tokio::time::timeout(DIAL_TIMEOUT, self.transport.dial(addr)).await
					{
						Err(_) => {
							self.update_score(addr, penalty::MINOR);
							self.pending.finish(addr);
							return false;
						},
						Ok(Err(error)) => {
							tracing::debug!("Failed to connect to node {addr}: {error}");
							self.update_score(addr, penalty::PROTOCOL);
							self.pending.finish(addr);
							return false;
						},
						Ok(Ok(())) => {
							tracing::debug!("Connected to node {addr}");
							self.pending.finish(addr);
						},
					}
				},
				DialAttempt::Pending(notify) => {
					// Someone else is dialing; wait for their outcome.
					let deadline = Instant::now() + self.settings.config_sync_timeout();
					loop {
						if self.shutdown.is_requested() || Instant::now() >= deadline {
							return false;
						}
						if !self.pending.is_pending(addr) {
							break;
						}
						let _ = tokio::time::timeout(
							SHUTDOWN_POLL_INTERVAL,
							notify.notified(),
						)
						.await;
					}
					if !self.transport.is_connected(addr) {
						return false;
					}
				},
			}
		}

		let config = match self.config(addr) {
			Some(config) => config,
			None => match self.fetch_config(addr).await {
				Some(config) => config,
				None => return false,
			},
		};

		!self.failed_checks(
			addr,
			&config,
			command,
			service_name,
			parameter_count,
			max_fee,
			spendable,
		)
	}

	/// Resolves a service request to at least `count` suitable peers,
	/// opening missing connections and fetching missing configs under a
	/// bounded work budget. Peers advertising a non-default overlay port are
	/// returned separately for HTTP dispatch.
	async fn open_connections(
		self: &Arc<Self>,
		command: XRouterCommand,
		service_name: &str,
		count: u32,
		parameter_count: usize,
		skip_nodes: &[NodeAddr],
	) -> Result<PlannerSelection, XRouterError> {
		if !(MIN_QUERY_NODES..=MAX_QUERY_NODES).contains(&count) {
			return Err(XRouterError::InvalidParameters(format!(
				"node count must be within {MIN_QUERY_NODES}..{MAX_QUERY_NODES}, got {count}"
			)));
		}

		let fq_top = service::fq_service_toplevel(command, service_name);
		let max_fee = self.settings.max_fee(command, service_name);
		let spendable = self.wallet_handle.spendable_balance().await.unwrap_or(0);

		let connected: HashSet<NodeAddr> =
			self.transport.connected_peers().into_iter().collect();
		let mut selected: HashSet<NodeAddr> = skip_nodes.iter().cloned().collect();

		// Keep only running nodes that advertise the base capability plus
		// the requested service, and are not banned.
		let mut snodes: HashMap<NodeAddr, ServiceNode> = HashMap::new();
		for snode in self.registry.service_nodes() {
			if snode.host.is_empty() ||
				!snode.running || self.transport.is_banned(&snode.host) ||
				selected.contains(&snode.host)
			{
				continue;
			}
			if !snode.has_service(service::XR) || !snode.has_service(&fq_top) {
				continue;
			}
			snodes.insert(snode.host.clone(), snode);
		}

		// Nodes whose cached config advertises the service but which the
		// registry filter above missed keep their shot only if registered.
		let mut all: Vec<NodeAddr> = snodes.keys().cloned().collect();

		// Direct-dial split: advertised port differs from the overlay
		// default, so the node is contacted over HTTP instead.
		let default_port = self.settings.p2p_port();
		let mut direct_dial = Vec::new();
		all.retain(|addr| match self.config(addr).and_then(|c| c.port()) {
			Some(port) if port != default_port => {
				direct_dial.push(DirectDialNode { snode: snodes[addr].clone(), port });
				false
			},
			_ => true,
		});

		let adjusted_count = count.saturating_sub(direct_dial.len() as u32);
		if (all.len() as u32) < adjusted_count {
			return Err(XRouterError::NotEnoughNodes {
				needed: count,
				found: all.len() as u32 + direct_dial.len() as u32,
			});
		}

		all.sort_by_key(|addr| self.candidate_order_key(addr, command, service_name));

		// Select already-usable peers first.
		let mut found = 0u32;
		let mut dial_list = Vec::new();
		for addr in all {
			if found >= adjusted_count {
				break;
			}
			if connected.contains(&addr) && self.has_config(&addr) {
				let config = self.config(&addr).expect("checked");
				if !self.failed_checks(
					&addr,
					&config,
					command,
					service_name,
					parameter_count,
					max_fee,
					spendable,
				) && selected.insert(addr.clone())
				{
					found += 1;
				}
			} else {
				dial_list.push(snodes[&addr].clone());
			}
		}

		// Dial the rest concurrently, two workers per hardware thread.
		let budget =
			std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4) * 2;
		let deadline =
			Instant::now() + self.settings.command_timeout(command, service_name);
		let mut dialing: FuturesUnordered<BoxFuture<'static, (NodeAddr, bool)>> =
			FuturesUnordered::new();
		let mut queue = dial_list.clone().into_iter();

		loop {
			if found >= adjusted_count ||
				self.shutdown.is_requested() || Instant::now() >= deadline
			{
				break;
			}
			while dialing.len() < budget {
				let Some(snode) = queue.next() else {
					break;
				};
				let app = self.clone();
				let service_name = service_name.to_string();
				dialing.push(
					async move {
						let ok = app
							.prepare_candidate(
								&snode,
								command,
								&service_name,
								parameter_count,
								max_fee,
								spendable,
							)
							.await;
						(snode.host, ok)
					}
					.boxed(),
				);
			}
			if dialing.is_empty() {
				break;
			}
			match tokio::time::timeout(SHUTDOWN_POLL_INTERVAL, dialing.next()).await {
				Ok(Some((addr, true))) =>
					if selected.insert(addr) {
						found += 1;
					},
				Ok(Some((_, false))) => {},
				Ok(None) => break,
				Err(_) => {}, // tick; re-check deadline and shutdown
			}
		}
		drop(dialing);

		// Dials abandoned mid-flight must not wedge later attempts.
		for snode in &dial_list {
			if self.pending.is_pending(&snode.host) {
				self.pending.finish(&snode.host);
			}
		}

		let found_total = found + direct_dial.len() as u32;
		if found_total < count {
			return Err(XRouterError::NotEnoughNodes { needed: count, found: found_total });
		}
		Ok(PlannerSelection { direct_dial, found: found_total })
	}

	/// Re-derives the final usable peer list from cached configs: connected,
	/// advertising the service, passing every filter; best first.
	async fn available_nodes(
		&self,
		command: XRouterCommand,
		service_name: &str,
		parameter_count: usize,
	) -> Vec<ServiceNode> {
		let max_fee = self.settings.max_fee(command, service_name);
		let spendable = self.wallet_handle.spendable_balance().await.unwrap_or(0);
		let fq_top = service::fq_service_toplevel(command, service_name);
		let connected: HashSet<NodeAddr> =
			self.transport.connected_peers().into_iter().collect();
		let snodes: HashMap<NodeAddr, ServiceNode> = self
			.registry
			.service_nodes()
			.into_iter()
			.map(|s| (s.host.clone(), s))
			.collect();

		let mut nodes: Vec<ServiceNode> = self
			.configs
			.all()
			.into_iter()
			.filter_map(|(addr, config)| {
				let snode = snodes.get(&addr)?;
				if !snode.running || !snode.has_service(&fq_top) {
					return None;
				}
				if !connected.contains(&addr) {
					return None;
				}
				if command != XRouterCommand::Service && !config.has_wallet(service_name) {
					return None;
				}
				if !config.is_available(command, service_name) {
					return None;
				}
				if self.failed_checks(
					&addr,
					&config,
					command,
					service_name,
					parameter_count,
					max_fee,
					spendable,
				) {
					return None;
				}
				Some(snode.clone())
			})
			.collect();

		nodes.sort_by_key(|snode| {
			self.candidate_order_key(&snode.host, command, service_name)
		});
		nodes
	}

	// ======= Execution =======

	fn validate_params(
		command: XRouterCommand,
		params: &[String],
	) -> Result<(), XRouterError> {
		let bad = |what: &str, value: &str| {
			Err(XRouterError::InvalidParameters(format!("{what}: {value}")))
		};
		match command {
			XRouterCommand::GetBlockHash | XRouterCommand::GetBlockAtTime => {
				if let Some(p) = params.first() {
					if !is_number(p) {
						return bad("incorrect block number", p);
					}
				}
			},
			XRouterCommand::GetTxBloomFilter => {
				if let Some(p) = params.first() {
					if !is_hash(p) || p.len() % 10 != 0 {
						return bad("incorrect bloom filter", p);
					}
				}
				if let Some(p) = params.get(1) {
					if !is_number(p) {
						return bad("incorrect block number", p);
					}
				}
			},
			XRouterCommand::GetBlock | XRouterCommand::GetTransaction => {
				if let Some(p) = params.first() {
					if !is_hash(p) {
						return bad("incorrect hash", p);
					}
				}
			},
			XRouterCommand::GetBlocks | XRouterCommand::GetTransactions => {
				if params.is_empty() {
					return Err(XRouterError::InvalidParameters(
						"missing parameters".to_string(),
					));
				}
				for p in params {
					if !is_hash(p) {
						return bad("incorrect hash", p);
					}
				}
			},
			_ => {},
		}
		Ok(())
	}

	/// Executes a client call: plans connections, pays fees, fans the
	/// request out to the selected peers and reconciles their replies.
	pub async fn call(
		self: &Arc<Self>,
		command: XRouterCommand,
		service_name: &str,
		confirmations: Option<u32>,
		params: Vec<String>,
	) -> CallResult {
		let uuid = Uuid::new_v4();
		let mut fee_payments: HashMap<NodeAddr, String> = HashMap::new();
		match self
			.call_inner(command, service_name, confirmations, &params, uuid, &mut fee_payments)
			.await
		{
			Ok(reply) => CallResult { uuid, reply },
			Err(error) => {
				for tx in fee_payments.values() {
					self.fee_gen.unlock(tx).await;
				}
				tracing::info!("Query {uuid} failed: {error}");
				CallResult { uuid, reply: error.to_json(Some(uuid)).to_string() }
			},
		}
	}

	async fn call_inner(
		self: &Arc<Self>,
		command: XRouterCommand,
		service_name: &str,
		confirmations: Option<u32>,
		params: &[String],
		uuid: Uuid,
		fee_payments: &mut HashMap<NodeAddr, String>,
	) -> Result<String, XRouterError> {
		if !command.is_wallet_command() && command != XRouterCommand::Service {
			return Err(XRouterError::InvalidParameters(format!(
				"{command} is not a client command"
			)));
		}
		let service_name = service::remove_namespace(service_name)
			.ok_or_else(|| XRouterError::BadService(service_name.to_string()))?;
		Self::validate_params(command, params)?;

		let confs = self.settings.confirmations(command, &service_name, confirmations);
		let fq = service::fq_service(command, &service_name);
		let timeout = self.settings.command_timeout(command, &service_name);

		// Plan connections; retry once to let fresh dials settle.
		let selection = match self
			.open_connections(command, &service_name, confs, params.len(), &[])
			.await
		{
			Ok(selection) => selection,
			Err(XRouterError::NotEnoughNodes { .. }) =>
				self.open_connections(command, &service_name, confs, params.len(), &[])
					.await?,
			Err(error) => return Err(error),
		};

		let available = self.available_nodes(command, &service_name, params.len()).await;
		if (available.len() + selection.direct_dial.len()) < confs as usize {
			return Err(XRouterError::NotEnoughNodes {
				needed: confs,
				found: (available.len() + selection.direct_dial.len()) as u32,
			});
		}

		// Fee payments and the final target list.
		let mut targets: Vec<QueryTarget> = Vec::new();
		let mut node_errors: Vec<XRouterError> = Vec::new();
		let candidates = available
			.into_iter()
			.map(|snode| QueryTarget { snode, route: QueryRoute::P2p })
			.chain(selection.direct_dial.into_iter().map(|direct| {
				let host = direct
					.snode
					.host
					.rsplit_once(':')
					.map(|(ip, _)| ip.to_string())
					.unwrap_or_else(|| direct.snode.host.clone());
				QueryTarget {
					snode: direct.snode,
					route: QueryRoute::Http { host, port: direct.port },
				}
			}));

		for target in candidates {
			if targets.len() >= confs as usize {
				break;
			}
			let addr = &target.snode.host;
			let Some(config) = self.config(addr) else {
				continue;
			};
			let fee = config.command_fee(command, &service_name);
			if fee > 0.0 {
				let fee_amount = match amount_from_value(fee) {
					Ok(amount) => amount,
					Err(error) => {
						node_errors.push(error);
						continue;
					},
				};
				let payment_address = config
					.payment_address(command, &service_name)
					.unwrap_or_else(|| target.snode.payment_address.clone());
				match self.fee_gen.generate(&payment_address, fee_amount).await {
					Ok(Some(tx)) => {
						fee_payments.insert(addr.clone(), tx);
					},
					Ok(None) => {},
					Err(error) => {
						tracing::warn!(
							"Failed to create fee payment to node {addr}: {error}"
						);
						node_errors.push(error);
						continue;
					},
				}
			}
			targets.push(target);
		}

		if targets.len() < confs as usize {
			let mut message = format!(
				"Found {} service node(s) meeting requirements for query {uuid}, {confs} required",
				targets.len()
			);
			for error in &node_errors {
				message.push_str(&format!(" | {error} code {}", error.code()));
			}
			tracing::info!("{message}");
			return Err(XRouterError::NotEnoughNodes {
				needed: confs,
				found: targets.len() as u32,
			});
		}

		// Register every slot before sending so fast replies cannot race.
		for target in &targets {
			self.query_mgr.add_query(uuid, &target.snode.host);
		}

		for target in &targets {
			let addr = target.snode.host.clone();
			let fee_tx = fee_payments.get(&addr).cloned().unwrap_or_default();
			match &target.route {
				QueryRoute::P2p => {
					let packet = build_request(
						command, uuid, &service_name, &fee_tx, params, &self.key,
					);
					if let Err(error) =
						self.transport.send_message(&addr, packet.to_bytes()).await
					{
						tracing::warn!("Failed to send query {uuid} to {addr}: {error}");
					}
					self.update_sent_request(&addr, &fq);
				},
				QueryRoute::Http { host, port } => {
					let app = self.clone();
					let snode = target.snode.clone();
					let url = service::fq_service_to_url(command, &service_name);
					let params = params.to_vec();
					let (host, port) = (host.clone(), *port);
					tokio::spawn(async move {
						app.http_dispatch(
							uuid, snode, host, port, url, params, fee_tx, timeout,
						)
						.await;
					});
					self.update_sent_request(&addr, &fq);
				},
			}
			tracing::debug!("Sent command {fq} query {uuid} to node {addr}");
		}

		// Wait for replies under the deadline.
		let mut review: Vec<NodeAddr> =
			targets.iter().map(|t| t.snode.host.clone()).collect();
		let deadline = Instant::now() + timeout;
		let mut confirmed = 0u32;
		while !self.shutdown.is_requested() &&
			confirmed < confs && Instant::now() < deadline
		{
			tokio::time::sleep(QUERY_POLL_INTERVAL).await;
			review.retain(|addr| {
				if self.query_mgr.has_reply(uuid, addr) {
					confirmed += 1;
					false
				} else {
					true
				}
			});
		}

		// Penalize non-responders and release their fee outputs.
		let failed: HashSet<NodeAddr> = review.into_iter().collect();
		for addr in &failed {
			tracing::warn!("Node {addr} failed to respond in time for query {uuid}");
			self.update_score(addr, penalty::NO_RESPONSE);
			if let Some(tx) = fee_payments.remove(addr) {
				self.fee_gen.unlock(&tx).await;
			}
		}

		// Reconcile: group identical replies, reward the majority.
		let cost_of = |node: &str| -> Amount {
			self.config(node)
				.map(|c| c.command_fee(command, &service_name))
				.map(|fee| amount_from_value(fee).unwrap_or(0))
				.unwrap_or(0)
		};
		let consensus = self.query_mgr.most_common_reply(uuid, cost_of);
		let replies = self.query_mgr.all_replies(uuid);

		for addr in &consensus.diff {
			self.update_score(addr, penalty::MINOR);
		}
		if consensus.count > 1 {
			let boost = 2 * replies.len() as i32;
			for addr in &consensus.agree {
				if !failed.contains(addr) {
					self.update_score(addr, boost);
				}
			}
		}

		// Replies carrying an internal-server-error code are penalized
		// regardless of consensus membership.
		for (addr, reply) in &replies {
			if reply_has_server_error(reply) {
				self.update_score(addr, penalty::SERVER_ERROR);
			}
		}

		// Release fee outputs for peers that answered with an error.
		for (addr, reply) in &replies {
			let is_error = serde_json::from_str::<Value>(reply)
				.ok()
				.and_then(|v| v.get("error").cloned())
				.map(|e| !e.is_null())
				.unwrap_or(false);
			if is_error {
				if let Some(tx) = fee_payments.remove(addr) {
					self.fee_gen.unlock(&tx).await;
				}
			}
		}

		self.query_mgr.purge(uuid);

		if consensus.count == 0 {
			return Err(XRouterError::NoReplies);
		}

		// Single-target calls return the raw reply; fan-outs wrap the
		// consensus value together with every individual reply.
		if targets.len() > 1 {
			let inner = parse_reply_value(&consensus.reply);
			let all: Vec<Value> = replies
				.iter()
				.map(|(addr, reply)| {
					json!({
						"nodepubkey": self
							.registry
							.node_pubkey(addr)
							.map(|k| hex::encode(k.serialize()))
							.unwrap_or_default(),
						"score": self.score(addr),
						"reply": parse_reply_value(reply),
					})
				})
				.collect();
			Ok(json!({ "result": inner, "allreplies": all }).to_string())
		} else {
			Ok(consensus.reply)
		}
	}

	#[allow(clippy::too_many_arguments)]
	async fn http_dispatch(
		self: Arc<Self>,
		uuid: Uuid,
		snode: ServiceNode,
		host: String,
		port: u16,
		url: String,
		params: Vec<String>,
		fee_tx: String,
		timeout: Duration,
	) {
		if self.shutdown.is_requested() {
			return;
		}
		let addr = snode.host.clone();
		match self
			.http
			.call(&host, port, &url, &params, &fee_tx, timeout, &self.key, &snode.pubkey)
			.await
		{
			Ok(outcome) => {
				if !self.query_mgr.has_query(uuid, &addr) ||
					self.query_mgr.has_reply(uuid, &addr)
				{
					return;
				}
				let reply = match outcome {
					HttpCallOutcome::Verified(result) => result,
					HttpCallOutcome::BadSignature(raw) => {
						tracing::warn!(
							"Bad signature on HTTP reply from node {addr}, query {uuid}"
						);
						json!({
							"error": XRouterError::BadSignature.to_string(),
							"code": codes::BAD_SIGNATURE,
							"reply": parse_reply_value(&raw),
						})
						.to_string()
					},
				};
				self.query_mgr.add_reply(uuid, &addr, reply);
				self.query_mgr.purge_slot(uuid, &addr);
			},
			Err(error) => {
				tracing::debug!("HTTP dispatch to {addr} failed for query {uuid}: {error}");
			},
		}
	}

	// ======= Inbound packets =======

	/// Entry point for overlay packets delivered by the transport.
	pub async fn on_message(self: &Arc<Self>, node: &str, message: &[u8]) {
		let packet = match XRouterPacket::from_bytes(message) {
			Ok(packet) => packet,
			Err(error) => {
				tracing::warn!("Invalid packet from node {node}: {error}");
				self.update_score(node, penalty::PROTOCOL);
				return;
			},
		};
		tracing::debug!(
			"Command {} query {} from node {node}",
			packet.command,
			packet.uuid
		);
		match packet.command {
			XRouterCommand::Invalid => self.process_invalid(node, &packet),
			XRouterCommand::Reply => self.process_reply(node, &packet),
			XRouterCommand::ConfigReply => self.process_config_reply(node, &packet),
			// Serving requests is the service-node surface, not ours.
			_ => {},
		}
	}

	fn verify_packet(&self, node: &str, packet: &XRouterPacket) -> bool {
		let Some(expected) = self.registry.node_pubkey(node) else {
			return false;
		};
		if !packet.verify(&expected) {
			tracing::warn!("Unverified packet from node {node}, penalizing");
			self.update_score(node, penalty::PROTOCOL);
			return false;
		}
		true
	}

	/// Protocol-error replies: logged, never stored.
	fn process_invalid(&self, node: &str, packet: &XRouterPacket) {
		if !self.query_mgr.has_node_query(node) {
			return;
		}
		if !self.verify_packet(node, packet) {
			return;
		}
		if let Ok(reply) = parse_reply_body(packet) {
			tracing::warn!(
				"Received error reply to query {} from node {node}: {reply}",
				packet.uuid
			);
		}
	}

	fn process_reply(&self, node: &str, packet: &XRouterPacket) {
		let uuid = packet.uuid;
		// Only the first reply per slot is accepted.
		if !self.query_mgr.has_query(uuid, node) || self.query_mgr.has_reply(uuid, node) {
			return;
		}
		if !self.verify_packet(node, packet) {
			return;
		}
		let Ok(reply) = parse_reply_body(packet) else {
			self.update_score(node, penalty::PROTOCOL);
			return;
		};
		self.query_mgr.add_reply(uuid, node, reply);
		self.query_mgr.purge_slot(uuid, node);
		tracing::debug!("Received reply to query {uuid} from node {node}");
	}

	fn process_config_reply(&self, node: &str, packet: &XRouterPacket) {
		let uuid = packet.uuid;
		if !self.query_mgr.has_query(uuid, node) || self.query_mgr.has_reply(uuid, node) {
			return;
		}
		if !self.verify_packet(node, packet) {
			return;
		}
		let Ok(payload) = parse_reply_body(packet) else {
			self.update_score(node, penalty::PROTOCOL);
			return;
		};
		let Some(pubkey) = self.registry.node_pubkey(node) else {
			return;
		};
		match NodeConfig::from_json(pubkey, &payload) {
			Ok(config) => {
				self.configs.insert(node, config);
				self.query_mgr.add_reply(uuid, node, payload);
				self.query_mgr.purge_slot(uuid, node);
				tracing::debug!("Stored config for node {node}, query {uuid}");
			},
			Err(error) => {
				tracing::warn!("Failed to read config from node {node}: {error}");
				self.update_score(node, penalty::PROTOCOL);
				self.query_mgr
					.add_reply(uuid, node, format!("Failed to parse config: {error}"));
				self.query_mgr.purge_slot(uuid, node);
			},
		}
	}

	// ======= Auxiliary surfaces =======

	/// Opens connections to nodes supporting a fully-qualified service and
	/// returns their configs.
	pub async fn connect_service(
		self: &Arc<Self>,
		fq_service: &str,
		count: u32,
	) -> Result<BTreeMap<NodeAddr, Arc<NodeConfig>>, XRouterError> {
		let parsed = service::parse_fq_service(fq_service)?;
		// Best effort: gather as many as available, the map below decides.
		let _ = self
			.open_connections(parsed.command, &parsed.service, count, 0, &[])
			.await;

		let mut matching = BTreeMap::new();
		for (addr, config) in self.configs.all() {
			if self.transport.is_banned(&addr) {
				continue;
			}
			let has = if parsed.command == XRouterCommand::Service {
				config.has_plugin(&parsed.service)
			} else {
				config.has_wallet(&parsed.service)
			};
			if has {
				matching.insert(addr, config);
			}
		}
		if matching.is_empty() {
			return Err(XRouterError::NotEnoughNodes { needed: count, found: 0 });
		}
		Ok(matching)
	}

	/// Stored replies for a finished query, if any survive retention.
	pub fn get_reply(&self, uuid: Uuid) -> String {
		let replies = self.query_mgr.all_replies(uuid);
		if replies.is_empty() {
			return XRouterError::NoReplies.to_json(Some(uuid)).to_string();
		}
		if replies.len() == 1 {
			return replies.into_values().next().expect("one reply");
		}
		let snodes: HashMap<NodeAddr, ServiceNode> = self
			.registry
			.service_nodes()
			.into_iter()
			.map(|s| (s.host.clone(), s))
			.collect();
		let entries: Vec<Value> = replies
			.iter()
			.map(|(addr, reply)| {
				let mut entry = match serde_json::from_str::<Value>(reply) {
					Ok(Value::Object(obj)) => Value::Object(obj),
					Ok(other) => json!({ "result": other }),
					Err(_) => json!({ "result": reply }),
				};
				entry["nodepubkey"] = Value::String(
					snodes
						.get(addr)
						.map(|s| hex::encode(s.pubkey.serialize()))
						.unwrap_or_default(),
				);
				entry["score"] = json!(self.score(addr));
				if let Some(snode) = snodes.get(addr) {
					entry["address"] = Value::String(snode.payment_address.clone());
				}
				entry
			})
			.collect();
		Value::Array(entries).to_string()
	}

	/// Background timers: periodic config refresh and reply-store cleanup.
	pub async fn run_background(self: Arc<Self>) {
		loop {
			let mut waited = Duration::ZERO;
			while waited < CONFIG_REFRESH_INTERVAL {
				if self.shutdown.is_requested() {
					return;
				}
				tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
				waited += SHUTDOWN_POLL_INTERVAL;
			}
			self.update_configs(false).await;
			self.query_mgr.purge_expired(REPLY_RETENTION);
		}
	}

	// ======= Convenience wrappers =======

	pub async fn get_block_count(
		self: &Arc<Self>,
		currency: &str,
		confirmations: Option<u32>,
	) -> CallResult {
		self.call(XRouterCommand::GetBlockCount, currency, confirmations, vec![]).await
	}

	pub async fn get_block_hash(
		self: &Arc<Self>,
		currency: &str,
		confirmations: Option<u32>,
		block: u64,
	) -> CallResult {
		self.call(
			XRouterCommand::GetBlockHash,
			currency,
			confirmations,
			vec![block.to_string()],
		)
		.await
	}

	pub async fn get_block(
		self: &Arc<Self>,
		currency: &str,
		confirmations: Option<u32>,
		block_hash: &str,
	) -> CallResult {
		self.call(
			XRouterCommand::GetBlock,
			currency,
			confirmations,
			vec![block_hash.to_string()],
		)
		.await
	}

	pub async fn get_blocks(
		self: &Arc<Self>,
		currency: &str,
		confirmations: Option<u32>,
		block_hashes: Vec<String>,
	) -> CallResult {
		self.call(XRouterCommand::GetBlocks, currency, confirmations, block_hashes).await
	}

	pub async fn get_transaction(
		self: &Arc<Self>,
		currency: &str,
		confirmations: Option<u32>,
		tx_hash: &str,
	) -> CallResult {
		self.call(
			XRouterCommand::GetTransaction,
			currency,
			confirmations,
			vec![tx_hash.to_string()],
		)
		.await
	}

	pub async fn get_transactions(
		self: &Arc<Self>,
		currency: &str,
		confirmations: Option<u32>,
		tx_hashes: Vec<String>,
	) -> CallResult {
		self.call(XRouterCommand::GetTransactions, currency, confirmations, tx_hashes)
			.await
	}

	pub async fn decode_raw_transaction(
		self: &Arc<Self>,
		currency: &str,
		confirmations: Option<u32>,
		raw_tx: &str,
	) -> CallResult {
		self.call(
			XRouterCommand::DecodeRawTransaction,
			currency,
			confirmations,
			vec![raw_tx.to_string()],
		)
		.await
	}

	pub async fn get_tx_bloom_filter(
		self: &Arc<Self>,
		currency: &str,
		confirmations: Option<u32>,
		filter: &str,
		number: u64,
	) -> CallResult {
		self.call(
			XRouterCommand::GetTxBloomFilter,
			currency,
			confirmations,
			vec![filter.to_string(), number.to_string()],
		)
		.await
	}

	pub async fn send_transaction(
		self: &Arc<Self>,
		currency: &str,
		confirmations: Option<u32>,
		raw_tx: &str,
	) -> CallResult {
		self.call(
			XRouterCommand::SendTransaction,
			currency,
			confirmations,
			vec![raw_tx.to_string()],
		)
		.await
	}

	pub async fn get_block_at_time(
		self: &Arc<Self>,
		currency: &str,
		confirmations: Option<u32>,
		time: u64,
	) -> CallResult {
		self.call(
			XRouterCommand::GetBlockAtTime,
			currency,
			confirmations,
			vec![time.to_string()],
		)
		.await
	}

	pub async fn get_balance(
		self: &Arc<Self>,
		currency: &str,
		confirmations: Option<u32>,
		address: &str,
	) -> CallResult {
		self.call(
			XRouterCommand::GetBalance,
			currency,
			confirmations,
			vec![address.to_string()],
		)
		.await
	}

	pub async fn call_plugin(
		self: &Arc<Self>,
		plugin: &str,
		confirmations: Option<u32>,
		params: Vec<String>,
	) -> CallResult {
		self.call(XRouterCommand::Service, plugin, confirmations, params).await
	}
}

/// Best-effort JSON view of a reply payload.
fn parse_reply_value(reply: &str) -> Value {
	serde_json::from_str(reply).unwrap_or_else(|_| Value::String(reply.to_string()))
}

/// Whether a reply carries an internal-server-error code, either at the top
/// level or nested under `result`.
fn reply_has_server_error(reply: &str) -> bool {
	let Ok(value) = serde_json::from_str::<Value>(reply) else {
		return false;
	};
	let code_is_500 = |v: &Value| {
		v.get("code").and_then(Value::as_u64) == Some(codes::INTERNAL_SERVER_ERROR as u64)
	};
	code_is_500(&value) || value.get("result").map(code_is_500).unwrap_or(false)
}
