//! Local client configuration. A main file supplies the global knobs
//! (`maxfee`, `consensus`, `timeout`, overlay host/port) plus optional
//! per-call sections; plugin definitions live one-per-file in a plugins
//! directory. Environment variables prefixed `XR__` override file values.

use std::{
	collections::BTreeMap,
	path::Path,
	time::Duration,
};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::{
	constants::{
		DEFAULT_BAN_SCORE, DEFAULT_COMMAND_TIMEOUT, DEFAULT_CONFIG_SYNC_TIMEOUT,
		DEFAULT_CONFIRMATIONS, DEFAULT_DEPOSIT_CONFIRMATIONS, DEFAULT_FETCH_LIMIT,
		DEFAULT_P2P_PORT,
	},
	packet::XRouterCommand,
	service,
};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CommandOverrides {
	pub maxfee: Option<f64>,
	pub consensus: Option<u32>,
	pub timeout: Option<u64>,
}

/// Backend wiring for a locally defined plugin. Private: never forwarded to
/// clients.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PluginBackend {
	Rpc {
		rpcip: String,
		rpcport: u16,
		rpcuser: String,
		rpcpassword: String,
	},
	Docker {
		containername: String,
		command: String,
		#[serde(default)]
		args: String,
		#[serde(default)]
		quoteargs: bool,
	},
}

fn default_clientrequestlimit() -> i64 {
	-1
}

fn default_fetchlimit() -> i32 {
	DEFAULT_FETCH_LIMIT
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginSettings {
	/// Comma-separated parameter types: `string|bool|int|double`.
	#[serde(default)]
	pub parameters: String,
	#[serde(default)]
	pub fee: f64,
	/// Minimum milliseconds between client calls; -1 means unlimited.
	#[serde(default = "default_clientrequestlimit")]
	pub clientrequestlimit: i64,
	#[serde(default = "default_fetchlimit")]
	pub fetchlimit: i32,
	#[serde(default)]
	pub disabled: bool,
	#[serde(default)]
	pub private: Option<PluginBackend>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
	/// Externally reachable host, required when running as a service node.
	pub host: Option<String>,
	pub port: Option<u16>,
	/// Maximum fee paid for a single call; 0 accepts only free peers.
	pub maxfee: f64,
	/// Minimum number of nodes queried per call.
	pub consensus: u32,
	/// Per-command deadline in seconds.
	pub timeout: u64,
	/// Seconds allowed for a peer to hand over its config after a dial.
	pub config_sync_timeout: u64,
	pub ban_score: i32,
	/// Confirmations required before a swap deposit counts as good.
	pub deposit_confirmations: u32,
	/// Per-call overrides keyed `<command>`, `<wallet>::<command>` or
	/// `xrs::<plugin>`.
	pub commands: BTreeMap<String, CommandOverrides>,
	/// Locally defined plugins, keyed by plugin name.
	pub plugins: BTreeMap<String, PluginSettings>,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			host: None,
			port: None,
			maxfee: 0.0,
			consensus: DEFAULT_CONFIRMATIONS,
			timeout: DEFAULT_COMMAND_TIMEOUT.as_secs(),
			config_sync_timeout: DEFAULT_CONFIG_SYNC_TIMEOUT.as_secs(),
			ban_score: DEFAULT_BAN_SCORE,
			deposit_confirmations: DEFAULT_DEPOSIT_CONFIRMATIONS,
			commands: BTreeMap::new(),
			plugins: BTreeMap::new(),
		}
	}
}

impl Settings {
	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		let mut settings: Settings = Config::builder()
			.add_source(File::from(path))
			.add_source(Environment::with_prefix("XR").separator("__").try_parsing(true))
			.build()?
			.try_deserialize()?;
		if settings.consensus < 1 {
			settings.consensus = 1;
		}
		Ok(settings)
	}

	/// Loads every plugin definition file in `dir`, keyed by file stem.
	pub fn load_plugins(&mut self, dir: &Path) -> anyhow::Result<()> {
		if !dir.is_dir() {
			return Ok(());
		}
		for entry in std::fs::read_dir(dir)? {
			let path = entry?.path();
			if path.extension().and_then(|e| e.to_str()) != Some("toml") {
				continue;
			}
			let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
				continue;
			};
			if !service::is_valid_token(name) {
				tracing::warn!("Skipping plugin file with invalid name: {}", path.display());
				continue;
			}
			let plugin: PluginSettings = Config::builder()
				.add_source(File::from(path.as_path()))
				.build()?
				.try_deserialize()?;
			self.plugins.insert(name.to_string(), plugin);
		}
		Ok(())
	}

	// The config layer lowercases table keys on some sources, so lookups
	// fall back to the lowercased form.
	fn override_for(&self, key: &str) -> Option<&CommandOverrides> {
		self.commands.get(key).or_else(|| self.commands.get(&key.to_lowercase()))
	}

	fn command_override(
		&self,
		command: XRouterCommand,
		service_name: &str,
	) -> Option<&CommandOverrides> {
		if command == XRouterCommand::Service {
			return self.override_for(&service::plugin_command_key(service_name));
		}
		self.override_for(&format!("{service_name}::{command}"))
			.or_else(|| self.override_for(command.as_str()))
	}

	/// Maximum fee the caller pays for this command.
	pub fn max_fee(&self, command: XRouterCommand, service_name: &str) -> f64 {
		self.command_override(command, service_name)
			.and_then(|o| o.maxfee)
			.unwrap_or(self.maxfee)
	}

	pub fn command_timeout(&self, command: XRouterCommand, service_name: &str) -> Duration {
		Duration::from_secs(
			self.command_override(command, service_name)
				.and_then(|o| o.timeout)
				.unwrap_or(self.timeout),
		)
	}

	/// Node count for a call: the caller's request wins, then per-command
	/// config, then the global default. Never below 1.
	pub fn confirmations(
		&self,
		command: XRouterCommand,
		service_name: &str,
		requested: Option<u32>,
	) -> u32 {
		requested
			.filter(|&c| c > 0)
			.or_else(|| self.command_override(command, service_name).and_then(|o| o.consensus))
			.unwrap_or(self.consensus)
			.max(1)
	}

	pub fn config_sync_timeout(&self) -> Duration {
		Duration::from_secs(self.config_sync_timeout.max(1))
	}

	pub fn p2p_port(&self) -> u16 {
		self.port.unwrap_or(DEFAULT_P2P_PORT)
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	#[test]
	fn defaults_match_documented_values() {
		let settings = Settings::default();
		assert_eq!(settings.maxfee, 0.0);
		assert_eq!(settings.consensus, 1);
		assert_eq!(settings.timeout, 30);
		assert_eq!(settings.p2p_port(), DEFAULT_P2P_PORT);
		assert_eq!(
			settings.confirmations(XRouterCommand::GetBlockCount, "BLOCK", None),
			1
		);
	}

	#[test]
	fn file_values_and_overrides() {
		let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
		write!(
			file,
			r#"
maxfee = 0.03
consensus = 2
timeout = 15
port = 41414

[commands.xrgetblockcount]
maxfee = 0.01

[commands."block::xrgetblockhash"]
timeout = 5
"#
		)
		.unwrap();

		let settings = Settings::from_file(file.path()).unwrap();
		assert_eq!(settings.maxfee, 0.03);
		assert_eq!(settings.p2p_port(), 41414);
		assert_eq!(settings.max_fee(XRouterCommand::GetBlockCount, "BLOCK"), 0.01);
		assert_eq!(settings.max_fee(XRouterCommand::GetBlock, "BLOCK"), 0.03);
		assert_eq!(
			settings.command_timeout(XRouterCommand::GetBlockHash, "BLOCK"),
			Duration::from_secs(5)
		);
		assert_eq!(
			settings.command_timeout(XRouterCommand::GetBlock, "BLOCK"),
			Duration::from_secs(15)
		);
		assert_eq!(settings.confirmations(XRouterCommand::GetBlock, "BLOCK", None), 2);
		assert_eq!(settings.confirmations(XRouterCommand::GetBlock, "BLOCK", Some(5)), 5);
		assert_eq!(settings.confirmations(XRouterCommand::GetBlock, "BLOCK", Some(0)), 2);
	}

	#[test]
	fn consensus_is_clamped_to_one() {
		let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
		write!(file, "consensus = 0\n").unwrap();
		let settings = Settings::from_file(file.path()).unwrap();
		assert_eq!(settings.consensus, 1);
	}

	#[test]
	fn plugin_files_are_loaded() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(
			dir.path().join("ExampleRPC.toml"),
			r#"
parameters = "string,int"
fee = 0.1
clientrequestlimit = 50

[private]
type = "rpc"
rpcip = "127.0.0.1"
rpcport = 8370
rpcuser = "user"
rpcpassword = "pass"
"#,
		)
		.unwrap();
		std::fs::write(
			dir.path().join("ExampleDocker.toml"),
			r#"
parameters = "string"
disabled = true

[private]
type = "docker"
containername = "syscoin"
command = "syscoin-cli getblock"
args = "$1"
quoteargs = true
"#,
		)
		.unwrap();
		// Invalid plugin names are skipped.
		std::fs::write(dir.path().join("bad_name.toml"), "fee = 1.0\n").unwrap();

		let mut settings = Settings::default();
		settings.load_plugins(dir.path()).unwrap();

		assert_eq!(settings.plugins.len(), 2);
		let rpc = &settings.plugins["ExampleRPC"];
		assert_eq!(rpc.fee, 0.1);
		assert_eq!(rpc.clientrequestlimit, 50);
		assert!(matches!(
			rpc.private,
			Some(PluginBackend::Rpc { ref rpcip, rpcport: 8370, .. }) if rpcip == "127.0.0.1"
		));

		let docker = &settings.plugins["ExampleDocker"];
		assert!(docker.disabled);
		assert_eq!(docker.clientrequestlimit, -1);
		assert!(matches!(
			docker.private,
			Some(PluginBackend::Docker { quoteargs: true, .. })
		));
	}
}
