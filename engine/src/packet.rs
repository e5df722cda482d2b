//! Binary framing and signatures for overlay packets.
//!
//! Layout on the wire: `u8 version | u8 command | bytes16 uuid | body |
//! bytes33 pubkey | bytes64 signature`. Body fields are length-prefixed
//! (`u32` little-endian length, then the bytes). The signature is a compact
//! ECDSA signature over the double-SHA-256 of everything preceding the
//! pubkey, made with the sender's node key.

use lazy_static::lazy_static;
use secp256k1::{ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const XROUTER_PROTOCOL_VERSION: u8 = 1;

const UUID_LEN: usize = 16;
const PUBKEY_LEN: usize = 33;
const SIG_LEN: usize = 64;

lazy_static! {
	pub static ref SECP: Secp256k1<All> = Secp256k1::new();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum XRouterCommand {
	Invalid = 0,
	Reply = 1,
	ConfigReply = 2,
	GetConfig = 3,
	Service = 4,
	GetBlockCount = 5,
	GetBlockHash = 6,
	GetBlock = 7,
	GetBlocks = 8,
	GetTransaction = 9,
	GetTransactions = 10,
	DecodeRawTransaction = 11,
	GetTxBloomFilter = 12,
	SendTransaction = 13,
	GetBlockAtTime = 14,
	GetBalance = 15,
}

impl XRouterCommand {
	pub fn from_u8(value: u8) -> Option<Self> {
		use XRouterCommand::*;
		Some(match value {
			0 => Invalid,
			1 => Reply,
			2 => ConfigReply,
			3 => GetConfig,
			4 => Service,
			5 => GetBlockCount,
			6 => GetBlockHash,
			7 => GetBlock,
			8 => GetBlocks,
			9 => GetTransaction,
			10 => GetTransactions,
			11 => DecodeRawTransaction,
			12 => GetTxBloomFilter,
			13 => SendTransaction,
			14 => GetBlockAtTime,
			15 => GetBalance,
			_ => return None,
		})
	}

	pub fn as_str(&self) -> &'static str {
		use XRouterCommand::*;
		match self {
			Invalid => "xrInvalid",
			Reply => "xrReply",
			ConfigReply => "xrConfigReply",
			GetConfig => "xrGetConfig",
			Service => "xrService",
			GetBlockCount => "xrGetBlockCount",
			GetBlockHash => "xrGetBlockHash",
			GetBlock => "xrGetBlock",
			GetBlocks => "xrGetBlocks",
			GetTransaction => "xrGetTransaction",
			GetTransactions => "xrGetTransactions",
			DecodeRawTransaction => "xrDecodeRawTransaction",
			GetTxBloomFilter => "xrGetTxBloomFilter",
			SendTransaction => "xrSendTransaction",
			GetBlockAtTime => "xrGetBlockAtTime",
			GetBalance => "xrGetBalance",
		}
	}

	pub fn from_str_name(name: &str) -> Option<Self> {
		use XRouterCommand::*;
		Some(match name {
			"xrReply" => Reply,
			"xrConfigReply" => ConfigReply,
			"xrGetConfig" => GetConfig,
			"xrService" => Service,
			"xrGetBlockCount" => GetBlockCount,
			"xrGetBlockHash" => GetBlockHash,
			"xrGetBlock" => GetBlock,
			"xrGetBlocks" => GetBlocks,
			"xrGetTransaction" => GetTransaction,
			"xrGetTransactions" => GetTransactions,
			"xrDecodeRawTransaction" => DecodeRawTransaction,
			"xrGetTxBloomFilter" => GetTxBloomFilter,
			"xrSendTransaction" => SendTransaction,
			"xrGetBlockAtTime" => GetBlockAtTime,
			"xrGetBalance" => GetBalance,
			_ => return None,
		})
	}

	/// Commands resolved against an SPV wallet rather than a plugin.
	pub fn is_wallet_command(&self) -> bool {
		use XRouterCommand::*;
		matches!(
			self,
			GetBlockCount |
				GetBlockHash | GetBlock |
				GetBlocks | GetTransaction |
				GetTransactions | DecodeRawTransaction |
				GetTxBloomFilter | SendTransaction |
				GetBlockAtTime | GetBalance
		)
	}

	/// Every wallet command, in wire order.
	pub fn wallet_commands() -> &'static [XRouterCommand] {
		use XRouterCommand::*;
		&[
			GetBlockCount,
			GetBlockHash,
			GetBlock,
			GetBlocks,
			GetTransaction,
			GetTransactions,
			DecodeRawTransaction,
			GetTxBloomFilter,
			SendTransaction,
			GetBlockAtTime,
			GetBalance,
		]
	}
}

impl std::fmt::Display for XRouterCommand {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// The key a client signs outgoing requests with.
#[derive(Clone)]
pub struct ClientKey {
	secret: SecretKey,
	public: PublicKey,
}

impl ClientKey {
	pub fn generate() -> Self {
		let secret = SecretKey::new(&mut rand::thread_rng());
		let public = PublicKey::from_secret_key(&SECP, &secret);
		Self { secret, public }
	}

	pub fn from_secret(secret: SecretKey) -> Self {
		let public = PublicKey::from_secret_key(&SECP, &secret);
		Self { secret, public }
	}

	pub fn public(&self) -> PublicKey {
		self.public
	}

	pub fn secret(&self) -> &SecretKey {
		&self.secret
	}
}

pub fn double_sha256(data: &[u8]) -> [u8; 32] {
	let first = Sha256::digest(data);
	let second = Sha256::digest(first);
	second.into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XRouterPacket {
	pub version: u8,
	pub command: XRouterCommand,
	pub uuid: Uuid,
	pub body: Vec<u8>,
	pub pubkey: Option<PublicKey>,
	pub signature: Option<[u8; 64]>,
}

impl XRouterPacket {
	pub fn new(command: XRouterCommand, uuid: Uuid) -> Self {
		Self {
			version: XROUTER_PROTOCOL_VERSION,
			command,
			uuid,
			body: Vec::new(),
			pubkey: None,
			signature: None,
		}
	}

	pub fn append_str(&mut self, value: &str) {
		self.append_bytes(value.as_bytes());
	}

	pub fn append_bytes(&mut self, value: &[u8]) {
		self.body.extend_from_slice(&(value.len() as u32).to_le_bytes());
		self.body.extend_from_slice(value);
	}

	pub fn append_u32(&mut self, value: u32) {
		self.body.extend_from_slice(&value.to_le_bytes());
	}

	fn signed_preimage(&self) -> Vec<u8> {
		let mut data = Vec::with_capacity(2 + UUID_LEN + self.body.len());
		data.push(self.version);
		data.push(self.command as u8);
		data.extend_from_slice(self.uuid.as_bytes());
		data.extend_from_slice(&self.body);
		data
	}

	/// Signs the packet with the sender key, embedding pubkey and signature.
	pub fn sign(&mut self, key: &ClientKey) {
		let digest = double_sha256(&self.signed_preimage());
		let message = Message::from_slice(&digest).expect("32-byte digest");
		let signature = SECP.sign_ecdsa(&message, key.secret());
		self.pubkey = Some(key.public());
		self.signature = Some(signature.serialize_compact());
	}

	/// Checks the embedded signature and requires the embedded key to match
	/// the given registry record for the sender.
	pub fn verify(&self, expected: &PublicKey) -> bool {
		let (Some(pubkey), Some(signature)) = (self.pubkey.as_ref(), self.signature.as_ref())
		else {
			return false;
		};
		if pubkey != expected {
			return false;
		}
		let digest = double_sha256(&self.signed_preimage());
		let message = Message::from_slice(&digest).expect("32-byte digest");
		let Ok(signature) = Signature::from_compact(signature) else {
			return false;
		};
		SECP.verify_ecdsa(&message, &signature, pubkey).is_ok()
	}

	pub fn to_bytes(&self) -> Vec<u8> {
		let mut out = self.signed_preimage();
		if let (Some(pubkey), Some(signature)) = (self.pubkey.as_ref(), self.signature.as_ref()) {
			out.extend_from_slice(&pubkey.serialize());
			out.extend_from_slice(signature);
		}
		out
	}

	pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
		if data.len() < 2 + UUID_LEN + PUBKEY_LEN + SIG_LEN {
			anyhow::bail!("packet too short: {} bytes", data.len());
		}
		let version = data[0];
		if version != XROUTER_PROTOCOL_VERSION {
			anyhow::bail!("unsupported packet version {version}");
		}
		let command = XRouterCommand::from_u8(data[1])
			.ok_or_else(|| anyhow::anyhow!("unknown command byte {}", data[1]))?;
		let uuid = Uuid::from_slice(&data[2..2 + UUID_LEN])?;
		let body_end = data.len() - PUBKEY_LEN - SIG_LEN;
		let body = data[2 + UUID_LEN..body_end].to_vec();
		let pubkey = PublicKey::from_slice(&data[body_end..body_end + PUBKEY_LEN])?;
		let mut signature = [0u8; SIG_LEN];
		signature.copy_from_slice(&data[body_end + PUBKEY_LEN..]);
		Ok(Self { version, command, uuid, body, pubkey: Some(pubkey), signature: Some(signature) })
	}

	pub fn body_reader(&self) -> BodyReader<'_> {
		BodyReader { data: &self.body, offset: 0 }
	}
}

pub struct BodyReader<'a> {
	data: &'a [u8],
	offset: usize,
}

impl<'a> BodyReader<'a> {
	pub fn read_bytes(&mut self) -> anyhow::Result<&'a [u8]> {
		let len = self.read_u32()? as usize;
		if self.offset + len > self.data.len() {
			anyhow::bail!("field length {len} exceeds body");
		}
		let out = &self.data[self.offset..self.offset + len];
		self.offset += len;
		Ok(out)
	}

	pub fn read_str(&mut self) -> anyhow::Result<String> {
		Ok(String::from_utf8(self.read_bytes()?.to_vec())?)
	}

	pub fn read_u32(&mut self) -> anyhow::Result<u32> {
		if self.offset + 4 > self.data.len() {
			anyhow::bail!("truncated u32 field");
		}
		let mut raw = [0u8; 4];
		raw.copy_from_slice(&self.data[self.offset..self.offset + 4]);
		self.offset += 4;
		Ok(u32::from_le_bytes(raw))
	}
}

/// Request packet body: `service | fee_tx_hex | param_count | params...`.
pub fn build_request(
	command: XRouterCommand,
	uuid: Uuid,
	service: &str,
	fee_tx_hex: &str,
	params: &[String],
	key: &ClientKey,
) -> XRouterPacket {
	let mut packet = XRouterPacket::new(command, uuid);
	packet.append_str(service);
	packet.append_str(fee_tx_hex);
	packet.append_u32(params.len() as u32);
	for param in params {
		packet.append_str(param);
	}
	packet.sign(key);
	packet
}

#[derive(Debug, PartialEq, Eq)]
pub struct RequestBody {
	pub service: String,
	pub fee_tx_hex: String,
	pub params: Vec<String>,
}

pub fn parse_request_body(packet: &XRouterPacket) -> anyhow::Result<RequestBody> {
	let mut reader = packet.body_reader();
	let service = reader.read_str()?;
	let fee_tx_hex = reader.read_str()?;
	let count = reader.read_u32()?;
	let mut params = Vec::with_capacity(count as usize);
	for _ in 0..count {
		params.push(reader.read_str()?);
	}
	Ok(RequestBody { service, fee_tx_hex, params })
}

/// Reply packet body: a single JSON payload field.
pub fn build_reply(
	command: XRouterCommand,
	uuid: Uuid,
	payload: &str,
	key: &ClientKey,
) -> XRouterPacket {
	let mut packet = XRouterPacket::new(command, uuid);
	packet.append_str(payload);
	packet.sign(key);
	packet
}

pub fn parse_reply_body(packet: &XRouterPacket) -> anyhow::Result<String> {
	packet.body_reader().read_str()
}
