use uuid::Uuid;

/// Numeric codes returned to callers in error envelopes.
pub mod codes {
	pub const UNAUTHORIZED: u32 = 1401;
	pub const BAD_REQUEST: u32 = 1400;
	pub const NOT_ENOUGH_NODES: u32 = 1702;
	pub const INVALID_PARAMETERS: u32 = 1018;
	pub const INSUFFICIENT_FUNDS: u32 = 1020;
	pub const TRANSACTION_NOT_FOUND: u32 = 1021;
	pub const NO_SESSION: u32 = 1022;
	pub const BAD_SIGNATURE: u32 = 1024;
	pub const NO_REPLIES: u32 = 1025;
	pub const INTERNAL_SERVER_ERROR: u32 = 500;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum XRouterError {
	#[error("Invalid parameters: {0}")]
	InvalidParameters(String),
	#[error("Bad service name: {0}")]
	BadService(String),
	#[error("{0}")]
	Unauthorized(String),
	#[error("Failed to find {needed} service node(s), found {found}")]
	NotEnoughNodes { needed: u32, found: u32 },
	#[error("{0}")]
	InsufficientFunds(String),
	#[error("Unable to verify if the service node is valid. Received bad signature on this request.")]
	BadSignature,
	#[error("No replies found")]
	NoReplies,
	#[error("Transaction not found: {0}")]
	TransactionNotFound(String),
	#[error("No session for {0}")]
	NoSession(String),
	#[error("Invalid state: {0}")]
	InvalidState(String),
	#[error("Internal Server Error")]
	InternalServerError,
}

impl XRouterError {
	pub fn code(&self) -> u32 {
		match self {
			XRouterError::InvalidParameters(_) => codes::INVALID_PARAMETERS,
			XRouterError::BadService(_) => codes::BAD_REQUEST,
			XRouterError::Unauthorized(_) => codes::UNAUTHORIZED,
			XRouterError::NotEnoughNodes { .. } => codes::NOT_ENOUGH_NODES,
			XRouterError::InsufficientFunds(_) => codes::INSUFFICIENT_FUNDS,
			XRouterError::BadSignature => codes::BAD_SIGNATURE,
			XRouterError::NoReplies => codes::NO_REPLIES,
			XRouterError::TransactionNotFound(_) => codes::TRANSACTION_NOT_FOUND,
			XRouterError::NoSession(_) => codes::NO_SESSION,
			XRouterError::InvalidState(_) => codes::INTERNAL_SERVER_ERROR,
			XRouterError::InternalServerError => codes::INTERNAL_SERVER_ERROR,
		}
	}

	/// The `{error, code, uuid?}` envelope returned to callers.
	pub fn to_json(&self, uuid: Option<Uuid>) -> serde_json::Value {
		let mut obj = serde_json::json!({
			"error": self.to_string(),
			"code": self.code(),
		});
		if let Some(uuid) = uuid {
			obj["uuid"] = serde_json::Value::String(uuid.to_string());
		}
		obj
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn codes_match_wire_values() {
		assert_eq!(XRouterError::NotEnoughNodes { needed: 3, found: 1 }.code(), 1702);
		assert_eq!(XRouterError::InvalidParameters("x".into()).code(), 1018);
		assert_eq!(XRouterError::BadSignature.code(), 1024);
		assert_eq!(XRouterError::NoReplies.code(), 1025);
		assert_eq!(XRouterError::InternalServerError.code(), 500);
	}

	#[test]
	fn error_envelope_includes_uuid_when_present() {
		let uuid = Uuid::new_v4();
		let json = XRouterError::NoReplies.to_json(Some(uuid));
		assert_eq!(json["code"], 1025);
		assert_eq!(json["uuid"], uuid.to_string());
		assert!(XRouterError::NoReplies.to_json(None).get("uuid").is_none());
	}
}
