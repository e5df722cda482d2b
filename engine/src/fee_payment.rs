//! Fee-payment construction. Each selected peer gets its own pre-signed
//! payment; the create/fund/sign sequence for one transaction runs under a
//! process-wide store lock so concurrent queries cannot race the wallet's
//! coin selection. Funding locks the chosen outputs until the peer answers
//! or the query gives up on it.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{
	error::XRouterError,
	utils::{value_from_amount, Amount},
	wallet::{RawTxOutput, UtxoWalletApi},
};

pub struct FeePaymentGenerator {
	wallet: Arc<dyn UtxoWalletApi>,
	/// Held across create/fund/sign for a single transaction.
	store_lock: Mutex<()>,
}

impl FeePaymentGenerator {
	pub fn new(wallet: Arc<dyn UtxoWalletApi>) -> Self {
		Self { wallet, store_lock: Mutex::new(()) }
	}

	/// Builds a signed payment of exactly `fee` to `payment_address`.
	/// Returns `None` for free calls.
	pub async fn generate(
		&self,
		payment_address: &str,
		fee: Amount,
	) -> Result<Option<String>, XRouterError> {
		if fee == 0 {
			return Ok(None);
		}

		let insufficient = || {
			XRouterError::InsufficientFunds(format!(
				"Could not create payment of {} to {}. Please check that your wallet is fully \
				 unlocked and has enough available unspent outputs.",
				value_from_amount(fee),
				payment_address,
			))
		};

		let _guard = self.store_lock.lock().await;

		let raw = self
			.wallet
			.create_raw_transaction(vec![RawTxOutput::Address {
				address: payment_address.to_string(),
				amount: fee,
			}])
			.await
			.map_err(|_| insufficient())?;
		let funded =
			self.wallet.fund_raw_transaction(raw, true).await.map_err(|_| insufficient())?;
		let signed =
			self.wallet.sign_raw_transaction(funded.clone()).await.map_err(|_| insufficient())?;
		if !signed.complete {
			// Partial signatures leave the funded selection locked; release it.
			let _ = self.wallet.unlock_outputs(funded).await;
			return Err(insufficient());
		}

		Ok(Some(signed.hex))
	}

	/// Releases the outputs locked for an abandoned payment.
	pub async fn unlock(&self, raw_tx_hex: &str) {
		if let Err(error) = self.wallet.unlock_outputs(raw_tx_hex.to_string()).await {
			tracing::warn!("Failed to unlock fee payment outputs: {error}");
		}
	}
}
