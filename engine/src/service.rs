//! Service-name grammar: `xr` | `xr::<currency>` | `xr::<currency>::<command>`
//! | `xrs::<plugin>`. Currency and plugin tokens are `[A-Za-z0-9-]`, 1..=100
//! characters.

use crate::{error::XRouterError, packet::XRouterCommand};

pub const XR: &str = "xr";
pub const XRS: &str = "xrs";
pub const XR_DELIMITER: &str = "::";

pub fn is_valid_token(token: &str) -> bool {
	!token.is_empty() &&
		token.len() <= 100 &&
		token.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

/// `xr::<currency>`: the capability a wallet service advertises.
pub fn wallet_service_key(currency: &str) -> String {
	format!("{XR}{XR_DELIMITER}{currency}")
}

/// `xr::<currency>::<command>`: a specific wallet command.
pub fn wallet_command_key(currency: &str, command: XRouterCommand) -> String {
	format!("{XR}{XR_DELIMITER}{currency}{XR_DELIMITER}{command}")
}

/// `xrs::<plugin>`: a custom plugin service.
pub fn plugin_command_key(plugin: &str) -> String {
	format!("{XRS}{XR_DELIMITER}{plugin}")
}

/// The fully-qualified name used for capability matching: plugins use their
/// full key, wallet commands match on the top-level wallet key.
pub fn fq_service(command: XRouterCommand, service: &str) -> String {
	if command == XRouterCommand::Service {
		plugin_command_key(service)
	} else {
		wallet_command_key(service, command)
	}
}

pub fn fq_service_toplevel(command: XRouterCommand, service: &str) -> String {
	if command == XRouterCommand::Service {
		plugin_command_key(service)
	} else {
		wallet_service_key(service)
	}
}

/// Strips a leading `xr::`/`xrs::` namespace, leaving the bare service name.
/// Names without a namespace pass through when they are valid tokens.
pub fn remove_namespace(fq_service: &str) -> Option<String> {
	let stripped = fq_service
		.strip_prefix(&format!("{XRS}{XR_DELIMITER}"))
		.or_else(|| fq_service.strip_prefix(&format!("{XR}{XR_DELIMITER}")))
		.unwrap_or(fq_service);
	let top = stripped.split(XR_DELIMITER).next()?;
	is_valid_token(top).then(|| top.to_string())
}

/// `/xr/<currency>/<command>` or `/xrs/<plugin>` for the HTTP fallback path.
pub fn fq_service_to_url(command: XRouterCommand, service: &str) -> String {
	if command == XRouterCommand::Service {
		format!("/{XRS}/{service}")
	} else {
		format!("/{XR}/{service}/{command}")
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedService {
	pub command: XRouterCommand,
	pub service: String,
}

/// Parses a caller-supplied fully-qualified name, e.g. `xr::BLOCK`,
/// `xr::BLOCK::xrGetBlockCount` or `xrs::SomePlugin`. A bare wallet name
/// resolves to `xrGetBlockCount`, matching the network default.
pub fn parse_fq_service(fq: &str) -> Result<ParsedService, XRouterError> {
	let parts: Vec<&str> = fq.split(XR_DELIMITER).collect();
	if parts.len() < 2 {
		return Err(XRouterError::BadService(format!(
			"{fq} (missing top-level namespace, expected xr:: or xrs::)"
		)));
	}
	let namespace = parts[0];
	match namespace {
		ns if ns == XRS => {
			let plugin = parts[1..].join(XR_DELIMITER);
			if parts[1..].iter().any(|p| !is_valid_token(p)) {
				return Err(XRouterError::BadService(fq.to_string()));
			}
			Ok(ParsedService { command: XRouterCommand::Service, service: plugin })
		},
		ns if ns == XR => {
			let currency = parts[1];
			if !is_valid_token(currency) {
				return Err(XRouterError::BadService(fq.to_string()));
			}
			let command = if parts.len() == 2 {
				XRouterCommand::GetBlockCount
			} else {
				XRouterCommand::from_str_name(parts[2])
					.filter(|c| c.is_wallet_command())
					.ok_or_else(|| XRouterError::BadService(fq.to_string()))?
			};
			Ok(ParsedService { command, service: currency.to_string() })
		},
		_ => Err(XRouterError::BadService(format!(
			"{fq} (missing top-level namespace, expected xr:: or xrs::)"
		))),
	}
}
