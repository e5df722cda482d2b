//! Cached service-node configuration advertisements. A node's config is a
//! JSON document describing its supported wallets, plugins, fees and limits;
//! it is considered present once fetched successfully at least once and is
//! immutable until refreshed.

use std::{
	collections::{BTreeMap, BTreeSet, HashMap},
	str::FromStr,
	sync::{Arc, Mutex},
	time::{Duration, Instant},
};

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::{
	constants::{DEFAULT_COMMAND_TIMEOUT, DEFAULT_FETCH_LIMIT},
	packet::XRouterCommand,
	registry::NodeAddr,
};

fn default_request_limit() -> i64 {
	-1
}

fn default_fetch_limit() -> i32 {
	DEFAULT_FETCH_LIMIT
}

fn default_timeout() -> u64 {
	DEFAULT_COMMAND_TIMEOUT.as_secs()
}

/// Per-(command, service) advertisement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
	#[serde(default)]
	pub fee: f64,
	#[serde(default)]
	pub payment_address: Option<String>,
	/// Minimum milliseconds between calls; -1 means unlimited.
	#[serde(default = "default_request_limit")]
	pub request_limit_ms: i64,
	/// Maximum accepted parameter count.
	#[serde(default = "default_fetch_limit")]
	pub fetch_limit: i32,
	#[serde(default = "default_timeout")]
	pub timeout_s: u64,
	#[serde(default)]
	pub disabled: bool,
}

impl Default for CommandConfig {
	fn default() -> Self {
		Self {
			fee: 0.0,
			payment_address: None,
			request_limit_ms: default_request_limit(),
			fetch_limit: default_fetch_limit(),
			timeout_s: default_timeout(),
			disabled: false,
		}
	}
}

/// Parameter types a plugin accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
	String,
	Bool,
	Int,
	Double,
}

impl FromStr for ParamType {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"string" => Ok(ParamType::String),
			"bool" => Ok(ParamType::Bool),
			"int" => Ok(ParamType::Int),
			"double" => Ok(ParamType::Double),
			other => Err(format!("unknown parameter type: {other}")),
		}
	}
}

/// Splits a `string,bool,int` style parameter list.
pub fn parse_parameters(spec: &str) -> Result<Vec<ParamType>, String> {
	if spec.trim().is_empty() {
		return Ok(Vec::new());
	}
	spec.split(',').map(ParamType::from_str).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
	/// Comma-separated parameter type list, e.g. `string,int`.
	#[serde(default)]
	pub parameters: String,
	#[serde(default)]
	pub fee: f64,
	#[serde(default)]
	pub payment_address: Option<String>,
	#[serde(default = "default_request_limit")]
	pub request_limit_ms: i64,
	#[serde(default = "default_fetch_limit")]
	pub fetch_limit: i32,
	#[serde(default = "default_timeout")]
	pub timeout_s: u64,
	#[serde(default)]
	pub disabled: bool,
}

/// The JSON document a node advertises.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfigDoc {
	#[serde(default)]
	pub payment_address: String,
	/// SPV wallet currencies this node serves.
	#[serde(default)]
	pub wallets: BTreeSet<String>,
	#[serde(default)]
	pub fee_default: f64,
	/// Per-command fee schedule, keyed by command name.
	#[serde(default)]
	pub fees: BTreeMap<String, f64>,
	/// Specific overrides keyed `<wallet>::<command>` or `<command>`.
	#[serde(default)]
	pub commands: BTreeMap<String, CommandConfig>,
	#[serde(default)]
	pub plugins: BTreeMap<String, PluginConfig>,
	/// Overlay host/port when they differ from the registry defaults.
	#[serde(default)]
	pub host: Option<String>,
	#[serde(default)]
	pub port: Option<u16>,
}

/// A fetched config plus provenance.
#[derive(Debug, Clone)]
pub struct NodeConfig {
	pub pubkey: PublicKey,
	pub doc: NodeConfigDoc,
	/// Raw advertised text, forwarded verbatim to other parties.
	pub public_text: String,
	pub fetched_at: Instant,
}

impl NodeConfig {
	pub fn from_json(pubkey: PublicKey, raw: &str) -> anyhow::Result<Self> {
		let doc: NodeConfigDoc = serde_json::from_str(raw)?;
		Ok(Self { pubkey, doc, public_text: raw.to_string(), fetched_at: Instant::now() })
	}

	pub fn new(pubkey: PublicKey, doc: NodeConfigDoc) -> Self {
		let public_text = serde_json::to_string(&doc).expect("serializable doc");
		Self { pubkey, doc, public_text, fetched_at: Instant::now() }
	}

	pub fn has_wallet(&self, currency: &str) -> bool {
		self.doc.wallets.contains(currency)
	}

	pub fn has_plugin(&self, plugin: &str) -> bool {
		self.doc.plugins.contains_key(plugin)
	}

	fn command_entry(&self, command: XRouterCommand, service: &str) -> Option<&CommandConfig> {
		self.doc
			.commands
			.get(&format!("{service}::{command}"))
			.or_else(|| self.doc.commands.get(command.as_str()))
	}

	pub fn command_fee(&self, command: XRouterCommand, service: &str) -> f64 {
		if command == XRouterCommand::Service {
			return self.doc.plugins.get(service).map(|p| p.fee).unwrap_or(self.doc.fee_default);
		}
		if let Some(entry) = self.command_entry(command, service) {
			return entry.fee;
		}
		self.doc.fees.get(command.as_str()).copied().unwrap_or(self.doc.fee_default)
	}

	/// Fee destination: per-command override, else plugin override, else the
	/// node default.
	pub fn payment_address(&self, command: XRouterCommand, service: &str) -> Option<String> {
		let specific = if command == XRouterCommand::Service {
			self.doc.plugins.get(service).and_then(|p| p.payment_address.clone())
		} else {
			self.command_entry(command, service).and_then(|e| e.payment_address.clone())
		};
		specific.or_else(|| {
			(!self.doc.payment_address.is_empty()).then(|| self.doc.payment_address.clone())
		})
	}

	pub fn client_request_limit(&self, command: XRouterCommand, service: &str) -> i64 {
		if command == XRouterCommand::Service {
			return self
				.doc
				.plugins
				.get(service)
				.map(|p| p.request_limit_ms)
				.unwrap_or_else(default_request_limit);
		}
		self.command_entry(command, service)
			.map(|e| e.request_limit_ms)
			.unwrap_or_else(default_request_limit)
	}

	pub fn command_fetch_limit(&self, command: XRouterCommand, service: &str) -> i32 {
		if command == XRouterCommand::Service {
			return self
				.doc
				.plugins
				.get(service)
				.map(|p| p.fetch_limit)
				.unwrap_or_else(default_fetch_limit);
		}
		self.command_entry(command, service)
			.map(|e| e.fetch_limit)
			.unwrap_or_else(default_fetch_limit)
	}

	pub fn command_timeout(&self, command: XRouterCommand, service: &str) -> Duration {
		let secs = if command == XRouterCommand::Service {
			self.doc.plugins.get(service).map(|p| p.timeout_s).unwrap_or_else(default_timeout)
		} else {
			self.command_entry(command, service)
				.map(|e| e.timeout_s)
				.unwrap_or_else(default_timeout)
		};
		Duration::from_secs(secs)
	}

	pub fn is_available(&self, command: XRouterCommand, service: &str) -> bool {
		if command == XRouterCommand::Service {
			return self.doc.plugins.get(service).map(|p| !p.disabled).unwrap_or(false);
		}
		if !self.has_wallet(service) {
			return false;
		}
		self.command_entry(command, service).map(|e| !e.disabled).unwrap_or(true)
	}

	/// Overlay port the node asks clients to use, when advertised.
	pub fn port(&self) -> Option<u16> {
		self.doc.port
	}

	/// Public JSON view of this config, the shape callers see.
	pub fn config_json(&self, score: i32, banned: bool) -> serde_json::Value {
		let commands_for = |wallet: &str| -> Vec<serde_json::Value> {
			XRouterCommand::wallet_commands()
				.iter()
				.map(|&cmd| {
					serde_json::json!({
						"command": cmd.as_str(),
						"fee": self.command_fee(cmd, wallet),
						"paymentaddress": self.payment_address(cmd, wallet).unwrap_or_default(),
						"requestlimit": self.client_request_limit(cmd, wallet),
						"fetchlimit": self.command_fetch_limit(cmd, wallet),
						"timeout": self.command_timeout(cmd, wallet).as_secs(),
						"disabled": !self.is_available(cmd, wallet),
					})
				})
				.collect()
		};

		let spvconfigs: Vec<serde_json::Value> = self
			.doc
			.wallets
			.iter()
			.map(|wallet| {
				serde_json::json!({
					"spvwallet": wallet,
					"commands": commands_for(wallet),
				})
			})
			.collect();

		let services: serde_json::Map<String, serde_json::Value> = self
			.doc
			.plugins
			.iter()
			.map(|(name, plugin)| {
				(
					name.clone(),
					serde_json::json!({
						"parameters": plugin.parameters,
						"fee": plugin.fee,
						"paymentaddress": plugin
							.payment_address
							.clone()
							.unwrap_or_else(|| self.doc.payment_address.clone()),
						"requestlimit": plugin.request_limit_ms,
						"fetchlimit": plugin.fetch_limit,
						"timeout": plugin.timeout_s,
						"disabled": plugin.disabled,
					}),
				)
			})
			.collect();

		serde_json::json!({
			"nodepubkey": hex::encode(self.pubkey.serialize()),
			"score": score,
			"banned": banned,
			"paymentaddress": self.doc.payment_address,
			"spvwallets": self.doc.wallets,
			"spvconfigs": spvconfigs,
			"feedefault": self.doc.fee_default,
			"fees": self.doc.fees,
			"services": services,
		})
	}
}

/// Thread-safe cache of fetched configs, keyed by node address.
#[derive(Default)]
pub struct ConfigCache {
	configs: Mutex<HashMap<NodeAddr, Arc<NodeConfig>>>,
}

impl ConfigCache {
	pub fn new() -> Self {
		Default::default()
	}

	pub fn has(&self, node: &str) -> bool {
		self.configs.lock().unwrap().contains_key(node)
	}

	pub fn get(&self, node: &str) -> Option<Arc<NodeConfig>> {
		self.configs.lock().unwrap().get(node).cloned()
	}

	pub fn insert(&self, node: &str, config: NodeConfig) {
		self.configs.lock().unwrap().insert(node.to_string(), Arc::new(config));
	}

	pub fn all(&self) -> Vec<(NodeAddr, Arc<NodeConfig>)> {
		self.configs.lock().unwrap().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
	}

	/// True when no config is cached or the cached one has gone stale.
	pub fn needs_update(&self, node: &str, max_age: Duration) -> bool {
		match self.get(node) {
			Some(config) => config.fetched_at.elapsed() >= max_age,
			None => true,
		}
	}
}
