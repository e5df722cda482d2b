//! HTTP dispatch path for nodes that serve overlay traffic on a port other
//! than the P2P default. Requests are signed with the client key; responses
//! carry a recoverable signature over the result payload which must recover
//! to the node's registered key.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use secp256k1::{
	ecdsa::{RecoverableSignature, RecoveryId},
	Message, PublicKey,
};
use serde_json::Value;

use crate::packet::{double_sha256, ClientKey, SECP};

/// A parsed `{"result", "signature", "pubkey"}` response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedReply {
	/// Canonical serialization of the `result` field; the signed bytes.
	pub result: String,
	pub signature: Vec<u8>,
	pub pubkey: Vec<u8>,
}

/// Outcome of a dispatch whose transport succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpCallOutcome {
	Verified(String),
	/// Signature did not recover to the node's registered key; carries the
	/// unverified payload.
	BadSignature(String),
}

/// Signs a response payload the way a serving node does: a recoverable
/// signature over the double-SHA-256 of the payload bytes, serialized as
/// `recovery_id || r || s`.
pub fn sign_payload(payload: &str, key: &ClientKey) -> Vec<u8> {
	let digest = double_sha256(payload.as_bytes());
	let message = Message::from_slice(&digest).expect("32-byte digest");
	let (recovery_id, compact) =
		SECP.sign_ecdsa_recoverable(&message, key.secret()).serialize_compact();
	let mut out = Vec::with_capacity(65);
	out.push(recovery_id.to_i32() as u8);
	out.extend_from_slice(&compact);
	out
}

/// Recovers the signer of a payload and requires it to equal `expected`.
pub fn verify_payload(payload: &str, signature: &[u8], expected: &PublicKey) -> bool {
	if signature.len() != 65 {
		return false;
	}
	let Ok(recovery_id) = RecoveryId::from_i32(signature[0] as i32) else {
		return false;
	};
	let Ok(signature) = RecoverableSignature::from_compact(&signature[1..], recovery_id) else {
		return false;
	};
	let digest = double_sha256(payload.as_bytes());
	let message = Message::from_slice(&digest).expect("32-byte digest");
	match SECP.recover_ecdsa(&message, &signature) {
		Ok(recovered) => &recovered == expected,
		Err(_) => false,
	}
}

pub fn parse_signed_reply(body: &str) -> Result<SignedReply> {
	let value: Value = serde_json::from_str(body).context("unparseable reply body")?;
	let obj = value.as_object().ok_or_else(|| anyhow!("reply body not an object"))?;
	let result = obj.get("result").ok_or_else(|| anyhow!("reply missing result"))?;
	let result = match result {
		Value::String(s) => s.clone(),
		other => serde_json::to_string(other)?,
	};
	let signature = hex::decode(
		obj.get("signature")
			.and_then(Value::as_str)
			.ok_or_else(|| anyhow!("reply missing signature"))?,
	)?;
	let pubkey = hex::decode(
		obj.get("pubkey")
			.and_then(Value::as_str)
			.ok_or_else(|| anyhow!("reply missing pubkey"))?,
	)?;
	Ok(SignedReply { result, signature, pubkey })
}

pub struct XRouterHttpClient {
	client: reqwest::Client,
}

impl Default for XRouterHttpClient {
	fn default() -> Self {
		Self::new()
	}
}

impl XRouterHttpClient {
	pub fn new() -> Self {
		Self { client: reqwest::Client::new() }
	}

	/// POSTs `{"params": [...]}` to `http://host:port<fq_url>` and verifies
	/// the node's signature over the result payload.
	pub async fn call(
		&self,
		host: &str,
		port: u16,
		fq_url: &str,
		params: &[String],
		fee_tx_hex: &str,
		timeout: Duration,
		key: &ClientKey,
		expected_node_key: &PublicKey,
	) -> Result<HttpCallOutcome> {
		let body = serde_json::to_string(&serde_json::json!({ "params": params }))?;
		let signature = sign_payload(&body, key);

		let mut request = self
			.client
			.post(format!("http://{host}:{port}{fq_url}"))
			.timeout(timeout)
			.header("Content-Type", "application/json")
			.header("X-Signature", hex::encode(signature))
			.header("X-PubKey", hex::encode(key.public().serialize()));
		if !fee_tx_hex.is_empty() {
			request = request.header("X-FeeTx", fee_tx_hex);
		}

		let response = request.body(body).send().await.context("request failed")?;
		let raw = response.text().await.context("unreadable reply body")?;
		let reply = parse_signed_reply(&raw)?;

		let embedded_key_matches = PublicKey::from_slice(&reply.pubkey)
			.map(|k| &k == expected_node_key)
			.unwrap_or(false);
		if embedded_key_matches &&
			verify_payload(&reply.result, &reply.signature, expected_node_key)
		{
			Ok(HttpCallOutcome::Verified(reply.result))
		} else {
			Ok(HttpCallOutcome::BadSignature(reply.result))
		}
	}
}
