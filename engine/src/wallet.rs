//! Collaborator trait for the local UTXO wallet. Transaction creation,
//! funding (with output locking), signing and broadcast are provided by the
//! host wallet; the engine drives the sequence and owns the locking policy.

use async_trait::async_trait;

use crate::utils::Amount;

/// One output of a transaction under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawTxOutput {
	/// Standard payment to an address.
	Address { address: String, amount: Amount },
	/// Payment to an explicit script (hex-encoded script pubkey).
	Script { script_hex: String, amount: Amount },
	/// Data-carrier output.
	Data { data_hex: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
	pub hex: String,
	pub complete: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UtxoWalletApi: Send + Sync {
	/// Builds an unfunded raw transaction with the given outputs.
	async fn create_raw_transaction(&self, outputs: Vec<RawTxOutput>) -> anyhow::Result<String>;

	/// Funds a raw transaction from local unspent outputs. With
	/// `lock_unspents` the selected outputs stay locked until released, so
	/// concurrent payments cannot double-select them.
	async fn fund_raw_transaction(
		&self,
		raw_tx_hex: String,
		lock_unspents: bool,
	) -> anyhow::Result<String>;

	async fn sign_raw_transaction(&self, raw_tx_hex: String) -> anyhow::Result<SignedTx>;

	/// Broadcasts a signed transaction, returning its txid.
	async fn send_raw_transaction(&self, raw_tx_hex: String) -> anyhow::Result<String>;

	/// Releases any unspent outputs locked for the given transaction.
	async fn unlock_outputs(&self, raw_tx_hex: String) -> anyhow::Result<()>;

	/// Fresh receive address from the wallet keypool.
	async fn new_address(&self) -> anyhow::Result<String>;

	/// Spendable balance across unlocked outputs.
	async fn spendable_balance(&self) -> anyhow::Result<Amount>;
}
