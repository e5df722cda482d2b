//! UTXO leg of a swap: a P2SH output over a two-path script. The spend path
//! requires both keys; the timeout path opens after an absolute locktime and
//! requires only the owner's key.

use bitcoin::{
	absolute::LockTime,
	blockdata::{opcodes::all as opcodes, script::Builder},
	Address, Network, OutPoint, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
	Witness,
};

use crate::utils::Amount;

/// `OP_IF <counterparty> OP_CHECKSIGVERIFY OP_ELSE <locktime>
/// OP_CHECKLOCKTIMEVERIFY OP_DROP OP_ENDIF <owner> OP_CHECKSIG`.
pub fn htlc_redeem_script(
	counterparty: &PublicKey,
	locktime: u32,
	owner: &PublicKey,
) -> ScriptBuf {
	Builder::new()
		.push_opcode(opcodes::OP_IF)
		.push_key(counterparty)
		.push_opcode(opcodes::OP_CHECKSIGVERIFY)
		.push_opcode(opcodes::OP_ELSE)
		.push_int(locktime as i64)
		.push_opcode(opcodes::OP_CLTV)
		.push_opcode(opcodes::OP_DROP)
		.push_opcode(opcodes::OP_ENDIF)
		.push_key(owner)
		.push_opcode(opcodes::OP_CHECKSIG)
		.into_script()
}

pub fn htlc_address(redeem_script: &ScriptBuf, network: Network) -> anyhow::Result<Address> {
	Ok(Address::p2sh(redeem_script, network)?)
}

fn spend_input(deposit: OutPoint, sequence: Sequence) -> TxIn {
	TxIn {
		previous_output: deposit,
		script_sig: ScriptBuf::new(),
		sequence,
		witness: Witness::default(),
	}
}

/// Unsigned spend of the locked output back to its owner via the timeout
/// path. Valid only once the script locktime has passed; the non-final
/// sequence keeps the locktime enforceable.
pub fn refund_transaction(
	deposit: OutPoint,
	value: Amount,
	fee: Amount,
	destination: &Address,
	locktime: u32,
) -> Transaction {
	Transaction {
		version: 2,
		lock_time: LockTime::from_consensus(locktime),
		input: vec![spend_input(deposit, Sequence(0xFFFF_FFFE))],
		output: vec![TxOut {
			value: value.saturating_sub(fee),
			script_pubkey: destination.script_pubkey(),
		}],
	}
}

/// Unsigned spend of the locked output via the two-key path.
pub fn redeem_transaction(
	deposit: OutPoint,
	value: Amount,
	fee: Amount,
	destination: &Address,
) -> Transaction {
	Transaction {
		version: 2,
		lock_time: LockTime::ZERO,
		input: vec![spend_input(deposit, Sequence::MAX)],
		output: vec![TxOut {
			value: value.saturating_sub(fee),
			script_pubkey: destination.script_pubkey(),
		}],
	}
}

#[cfg(test)]
mod tests {
	use bitcoin::hashes::Hash;

	use super::*;
	use crate::packet::ClientKey;

	fn test_key() -> PublicKey {
		PublicKey::new(ClientKey::generate().public())
	}

	fn test_outpoint() -> OutPoint {
		OutPoint { txid: bitcoin::Txid::all_zeros(), vout: 1 }
	}

	#[test]
	fn redeem_script_structure() {
		let counterparty = test_key();
		let owner = test_key();
		let script = htlc_redeem_script(&counterparty, 1_700_000_000, &owner);

		let asm = script.to_asm_string();
		assert!(asm.contains("OP_IF"));
		assert!(asm.contains("OP_CHECKSIGVERIFY"));
		assert!(asm.contains("OP_ELSE"));
		assert!(asm.contains("OP_CLTV"));
		assert!(asm.contains("OP_DROP"));
		assert!(asm.contains("OP_ENDIF"));
		assert!(asm.ends_with("OP_CHECKSIG"));
		// Both keys are pushed.
		assert!(asm.contains(&counterparty.to_string()));
		assert!(asm.contains(&owner.to_string()));
	}

	#[test]
	fn p2sh_address_derives() {
		let script = htlc_redeem_script(&test_key(), 1_700_000_000, &test_key());
		let address = htlc_address(&script, Network::Regtest).unwrap();
		assert!(address.script_pubkey().is_p2sh());
	}

	#[test]
	fn refund_sets_locktime_and_nonfinal_sequence() {
		let destination = Address::p2pkh(&test_key(), Network::Regtest);
		let tx = refund_transaction(test_outpoint(), 10_000, 500, &destination, 1_700_000_000);

		assert_eq!(tx.lock_time, LockTime::from_consensus(1_700_000_000));
		assert_eq!(tx.input[0].sequence, Sequence(0xFFFF_FFFE));
		assert_eq!(tx.output[0].value, 9_500);
	}

	#[test]
	fn redeem_is_final_and_unlocked() {
		let destination = Address::p2pkh(&test_key(), Network::Regtest);
		let tx = redeem_transaction(test_outpoint(), 10_000, 500, &destination);

		assert_eq!(tx.lock_time, LockTime::ZERO);
		assert_eq!(tx.input[0].sequence, Sequence::MAX);
	}
}
