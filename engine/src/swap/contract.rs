//! Call-data and event encoding for the escrow contract. Methods are
//! addressed by 4-byte keccak selectors; arguments are 32-byte words with
//! `bytes20` values right-padded and addresses/integers left-padded. Event
//! payloads are matched by splitting the data blob into 64-hex-character
//! words and comparing fields as lowercase hex.

use anyhow::{bail, Result};
use ethers::{
	types::{H160, H256, U256},
	utils::keccak256,
};

pub const INITIATE_METHOD: &str = "initiate(bytes20,address,uint256)";
pub const RESPOND_METHOD: &str = "respond(bytes20,address,uint256)";
pub const REFUND_METHOD: &str = "refund(bytes20)";
pub const REDEEM_METHOD: &str = "redeem(bytes20,bytes)";

pub const INITIATED_EVENT: &str = "Initiated(bytes20,address,address,uint256,uint256)";
pub const RESPONDED_EVENT: &str = "Responded(bytes20,address,address,uint256,uint256)";
pub const REFUNDED_EVENT: &str = "Refunded(bytes20,address,uint256)";
pub const REDEEMED_EVENT: &str = "Redeemed(bytes20,bytes,address,uint256)";

const WORD_HEX: usize = 64;

/// First 4 bytes of the keccak hash of a method or event signature.
pub fn encode_sig(signature: &str) -> [u8; 4] {
	let hash = keccak256(signature.as_bytes());
	[hash[0], hash[1], hash[2], hash[3]]
}

/// `bytes20` argument: right-padded to a word.
pub fn encode_bytes20(value: &[u8; 20]) -> [u8; 32] {
	let mut word = [0u8; 32];
	word[..20].copy_from_slice(value);
	word
}

/// Address argument: left-padded to a word.
pub fn encode_address(value: H160) -> [u8; 32] {
	let mut word = [0u8; 32];
	word[12..].copy_from_slice(value.as_bytes());
	word
}

pub fn encode_u256(value: U256) -> [u8; 32] {
	let mut word = [0u8; 32];
	value.to_big_endian(&mut word);
	word
}

/// Topic used to filter contract logs for one swap: the hashed secret as a
/// right-padded word.
pub fn hashed_secret_topic(hashed_secret: &[u8; 20]) -> H256 {
	H256::from(encode_bytes20(hashed_secret))
}

pub fn initiate_call_data(
	hashed_secret: &[u8; 20],
	responder: H160,
	refund_duration: U256,
) -> Vec<u8> {
	let mut data = encode_sig(INITIATE_METHOD).to_vec();
	data.extend_from_slice(&encode_bytes20(hashed_secret));
	data.extend_from_slice(&encode_address(responder));
	data.extend_from_slice(&encode_u256(refund_duration));
	data
}

pub fn respond_call_data(
	hashed_secret: &[u8; 20],
	initiator: H160,
	refund_duration: U256,
) -> Vec<u8> {
	let mut data = encode_sig(RESPOND_METHOD).to_vec();
	data.extend_from_slice(&encode_bytes20(hashed_secret));
	data.extend_from_slice(&encode_address(initiator));
	data.extend_from_slice(&encode_u256(refund_duration));
	data
}

pub fn refund_call_data(hashed_secret: &[u8; 20]) -> Vec<u8> {
	let mut data = encode_sig(REFUND_METHOD).to_vec();
	data.extend_from_slice(&encode_bytes20(hashed_secret));
	data
}

/// `redeem(bytes20,bytes)`: the dynamic secret is emitted as offset, length,
/// then right-padded payload words.
pub fn redeem_call_data(hashed_secret: &[u8; 20], secret: &[u8]) -> Vec<u8> {
	let mut data = encode_sig(REDEEM_METHOD).to_vec();
	data.extend_from_slice(&encode_bytes20(hashed_secret));
	data.extend_from_slice(&encode_u256(U256::from(64)));
	data.extend_from_slice(&encode_u256(U256::from(secret.len())));
	let mut padded = secret.to_vec();
	while padded.len() % 32 != 0 {
		padded.push(0);
	}
	data.extend_from_slice(&padded);
	data
}

/// Splits an event data blob (`0x` + n×64 hex chars) into words.
pub fn split_event_params(data: &str) -> Result<Vec<String>> {
	let stripped = data.strip_prefix("0x").unwrap_or(data);
	if stripped.is_empty() || stripped.len() % WORD_HEX != 0 {
		bail!("bad event data length: {}", data.len());
	}
	Ok((0..stripped.len())
		.step_by(WORD_HEX)
		.map(|i| stripped[i..i + WORD_HEX].to_lowercase())
		.collect())
}

/// Whether a log's `topics[0]` names the given event.
pub fn is_event(event_sig: H256, event: &str) -> bool {
	event_sig.as_bytes()[..4] == encode_sig(event)
}

fn word_hex(word: [u8; 32]) -> String {
	hex::encode(word)
}

/// `Initiated(hashedSecret, initiator, responder, value, refundTime)`: data
/// words are `[initiator, responder, value, ...]`. A match requires our
/// responder address and value; the initiator address comes back out.
pub fn match_initiated(params: &[String], responder: H160, value: U256) -> Option<H160> {
	if params.len() < 3 {
		return None;
	}
	if params[1] != word_hex(encode_address(responder)) ||
		params[2] != word_hex(encode_u256(value))
	{
		return None;
	}
	let bytes = hex::decode(&params[0]).ok()?;
	Some(H160::from_slice(&bytes[12..32]))
}

/// `Responded(hashedSecret, initiator, responder, value, refundTime)`: data
/// words are `[initiator, responder, value, ...]`. A match requires our
/// initiator address and value; the responder address comes back out.
pub fn match_responded(params: &[String], initiator: H160, value: U256) -> Option<H160> {
	if params.len() < 3 {
		return None;
	}
	if params[0] != word_hex(encode_address(initiator)) ||
		params[2] != word_hex(encode_u256(value))
	{
		return None;
	}
	let bytes = hex::decode(&params[1]).ok()?;
	Some(H160::from_slice(&bytes[12..32]))
}

/// `Refunded(hashedSecret, recipient, value)`: data words are
/// `[recipient, value]`.
pub fn match_refunded(params: &[String], recipient: H160, value: U256) -> bool {
	params.len() >= 2 &&
		params[0] == word_hex(encode_address(recipient)) &&
		params[1] == word_hex(encode_u256(value))
}

/// `Redeemed(hashedSecret, secret, recipient, value)`: data words are
/// `[secret_offset, recipient, value, secret_len, secret...]`. A match
/// extracts the revealed preimage.
pub fn match_redeemed(params: &[String], recipient: H160, value: U256) -> Option<Vec<u8>> {
	if params.len() < 4 {
		return None;
	}
	if params[1] != word_hex(encode_address(recipient)) ||
		params[2] != word_hex(encode_u256(value))
	{
		return None;
	}
	let length_word = U256::from_str_radix(&params[3], 16).ok()?;
	if length_word > U256::from(1024u64) {
		return None;
	}
	let length = length_word.as_u64() as usize;
	let mut secret = Vec::with_capacity(length);
	for word in &params[4..] {
		secret.extend_from_slice(&hex::decode(word).ok()?);
		if secret.len() >= length {
			break;
		}
	}
	(secret.len() >= length).then(|| {
		secret.truncate(length);
		secret
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hashed_secret() -> [u8; 20] {
		[0xabu8; 20]
	}

	#[test]
	fn selectors_are_four_bytes_and_distinct() {
		let sigs = [
			encode_sig(INITIATE_METHOD),
			encode_sig(RESPOND_METHOD),
			encode_sig(REFUND_METHOD),
			encode_sig(REDEEM_METHOD),
		];
		for (i, a) in sigs.iter().enumerate() {
			for b in sigs.iter().skip(i + 1) {
				assert_ne!(a, b);
			}
		}
	}

	#[test]
	fn word_encodings_pad_correctly() {
		let bytes20 = encode_bytes20(&hashed_secret());
		assert_eq!(&bytes20[..20], &[0xab; 20]);
		assert_eq!(&bytes20[20..], &[0u8; 12]);

		let address = encode_address(H160::from_slice(&[0x11; 20]));
		assert_eq!(&address[..12], &[0u8; 12]);
		assert_eq!(&address[12..], &[0x11; 20]);

		let value = encode_u256(U256::from(1u64));
		assert_eq!(value[31], 1);
		assert_eq!(&value[..31], &[0u8; 31]);
	}

	#[test]
	fn initiate_call_layout() {
		let responder = H160::from_slice(&[0x22; 20]);
		let data = initiate_call_data(&hashed_secret(), responder, U256::from(7200));
		assert_eq!(data.len(), 4 + 32 * 3);
		assert_eq!(&data[..4], &encode_sig(INITIATE_METHOD));
		assert_eq!(&data[4..36], &encode_bytes20(&hashed_secret()));
	}

	#[test]
	fn redeem_call_carries_dynamic_secret() {
		let secret = [0x5au8; 32];
		let data = redeem_call_data(&hashed_secret(), &secret);
		// selector + hashed secret + offset + length + one payload word
		assert_eq!(data.len(), 4 + 32 * 4);
		assert_eq!(&data[36..68], &encode_u256(U256::from(64)));
		assert_eq!(&data[68..100], &encode_u256(U256::from(32)));
		assert_eq!(&data[100..132], &secret);
	}

	#[test]
	fn event_data_splitting() {
		let word_a = "11".repeat(32);
		let word_b = "22".repeat(32);
		let params = split_event_params(&format!("0x{word_a}{word_b}")).unwrap();
		assert_eq!(params, vec![word_a, word_b]);

		assert!(split_event_params("0x").is_err());
		assert!(split_event_params("0x1234").is_err());
	}

	fn event_data(words: &[[u8; 32]]) -> Vec<String> {
		words.iter().map(|w| hex::encode(w)).collect()
	}

	#[test]
	fn initiated_event_matching() {
		let initiator = H160::from_slice(&[0x11; 20]);
		let responder = H160::from_slice(&[0x22; 20]);
		let value = U256::from(1_000_000u64);
		let params = event_data(&[
			encode_address(initiator),
			encode_address(responder),
			encode_u256(value),
		]);

		assert_eq!(match_initiated(&params, responder, value), Some(initiator));
		assert_eq!(match_initiated(&params, initiator, value), None);
		assert_eq!(match_initiated(&params, responder, U256::from(1u64)), None);
	}

	#[test]
	fn responded_event_matching() {
		let initiator = H160::from_slice(&[0x11; 20]);
		let responder = H160::from_slice(&[0x22; 20]);
		let value = U256::from(5u64);
		let params = event_data(&[
			encode_address(initiator),
			encode_address(responder),
			encode_u256(value),
		]);

		assert_eq!(match_responded(&params, initiator, value), Some(responder));
		assert_eq!(match_responded(&params, responder, value), None);
	}

	#[test]
	fn refunded_event_matching() {
		let recipient = H160::from_slice(&[0x33; 20]);
		let value = U256::from(9u64);
		let params = event_data(&[encode_address(recipient), encode_u256(value)]);

		assert!(match_refunded(&params, recipient, value));
		assert!(!match_refunded(&params, recipient, U256::from(8u64)));
	}

	#[test]
	fn redeemed_event_reveals_secret() {
		let recipient = H160::from_slice(&[0x44; 20]);
		let value = U256::from(3u64);
		let secret = [0x77u8; 32];
		let mut secret_word = [0u8; 32];
		secret_word.copy_from_slice(&secret);
		let params = event_data(&[
			encode_u256(U256::from(0x60)),
			encode_address(recipient),
			encode_u256(value),
			encode_u256(U256::from(32)),
			secret_word,
		]);

		assert_eq!(match_redeemed(&params, recipient, value), Some(secret.to_vec()));
		assert_eq!(match_redeemed(&params, H160::zero(), value), None);
	}

	#[test]
	fn event_recognition_uses_selector_prefix() {
		let mut topic = [0u8; 32];
		topic[..4].copy_from_slice(&encode_sig(INITIATED_EVENT));
		assert!(is_event(H256::from(topic), INITIATED_EVENT));
		assert!(!is_event(H256::from(topic), RESPONDED_EVENT));

		// A full keccak topic still matches on its first four bytes.
		let full = H256::from(keccak256(INITIATED_EVENT.as_bytes()));
		assert!(is_event(full, INITIATED_EVENT));
	}
}
