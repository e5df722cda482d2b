//! Cross-chain atomic swaps over a hashed timelock. The initiator locks the
//! UTXO-side funds in a script output and the responder escrows the
//! account-side funds in the swap contract; the preimage is revealed by the
//! initiator's contract redeem, which in turn lets the responder spend the
//! UTXO leg. Refund windows are role-dependent: the responder's must expire
//! strictly before the initiator's so a responder who revealed nothing can
//! always exit safely.

pub mod contract;
pub mod utxo;

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
	time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use bitcoin::{hashes::Hash, Network, OutPoint};
use ethers::types::{H160, H256, U256};
use rand::RngCore;

use crate::{
	constants::{
		DEFAULT_DEPOSIT_CONFIRMATIONS, SHUTDOWN_POLL_INTERVAL, SWAP_POLL_INTERVAL,
		TIMELOCK_INITIATOR, TIMELOCK_RESPONDER,
	},
	error::XRouterError,
	eth::EthRpcApi,
	service,
	utils::{Amount, ShutdownFlag},
	wallet::{RawTxOutput, UtxoWalletApi},
};

/// Flat fee reserved when spending a swap output.
const SPEND_FEE: Amount = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapRole {
	Initiator,
	Responder,
}

impl SwapRole {
	pub fn as_char(&self) -> char {
		match self {
			SwapRole::Initiator => 'A',
			SwapRole::Responder => 'B',
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapTimelocks {
	pub initiator: Duration,
	pub responder: Duration,
}

impl Default for SwapTimelocks {
	fn default() -> Self {
		Self { initiator: TIMELOCK_INITIATOR, responder: TIMELOCK_RESPONDER }
	}
}

impl SwapTimelocks {
	/// The responder window must close strictly before the initiator's, or a
	/// responder could be left without a safe exit.
	pub fn new(initiator: Duration, responder: Duration) -> Result<Self, XRouterError> {
		if responder >= initiator {
			return Err(XRouterError::InvalidState(format!(
				"responder timelock {}s must be below initiator timelock {}s",
				responder.as_secs(),
				initiator.as_secs(),
			)));
		}
		Ok(Self { initiator, responder })
	}

	pub fn for_role(&self, role: SwapRole) -> Duration {
		match role {
			SwapRole::Initiator => self.initiator,
			SwapRole::Responder => self.responder,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapState {
	New,
	Initiated,
	Responded,
	Redeemed,
	Refunded,
	Failed,
}

/// The agreed terms of one swap.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapOffer {
	/// Currency this side pays.
	pub from_currency: String,
	/// Currency this side receives.
	pub to_currency: String,
	pub from_amount: Amount,
	pub to_amount: Amount,
	/// Escrowed value on the contract leg.
	pub contract_value: U256,
	pub own_contract_address: H160,
	pub counterparty_contract_address: H160,
	pub own_utxo_pubkey: bitcoin::PublicKey,
	pub counterparty_utxo_pubkey: bitcoin::PublicKey,
}

/// The UTXO-side deposit a responder will redeem once the preimage appears.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoHtlc {
	pub outpoint: OutPoint,
	pub value: Amount,
	pub redeem_script_hex: String,
}

#[derive(Debug, Clone)]
pub struct SwapSession {
	pub hashed_secret: [u8; 20],
	secret: Option<[u8; 32]>,
	pub role: SwapRole,
	pub state: SwapState,
	pub offer: SwapOffer,
	pub timelock: Duration,
	started_at: Instant,
	/// Block height the contract event scan resumes from. Only moves forward.
	pub observation_cursor: U256,
	/// Own deposit (initiator) or the counterparty's (responder).
	utxo_deposit: Option<UtxoHtlc>,
	utxo_locktime: u32,
	refund_published: bool,
}

impl SwapSession {
	pub fn secret(&self) -> Option<[u8; 32]> {
		self.secret
	}
}

pub fn hash_secret(secret: &[u8; 32]) -> [u8; 20] {
	bitcoin::hashes::hash160::Hash::hash(secret).to_byte_array()
}

pub fn generate_secret() -> ([u8; 32], [u8; 20]) {
	let mut secret = [0u8; 32];
	rand::thread_rng().fill_bytes(&mut secret);
	let hashed = hash_secret(&secret);
	(secret, hashed)
}

fn unix_time() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before epoch").as_secs()
}

enum SessionAction {
	None,
	InitiatorRedeem { log_block: U256 },
	InitiatorRefund,
	ResponderRedeem { secret: [u8; 32], log_block: U256 },
	ResponderRefundCall,
	ResponderRefunded { log_block: U256 },
}

pub struct SwapManager<Eth> {
	eth: Arc<Eth>,
	wallet: Arc<dyn UtxoWalletApi>,
	contract_address: H160,
	network: Network,
	timelocks: SwapTimelocks,
	deposit_confirmations: u32,
	sessions: Mutex<HashMap<[u8; 20], SwapSession>>,
	shutdown: ShutdownFlag,
}

impl<Eth: EthRpcApi> SwapManager<Eth> {
	pub fn new(
		eth: Arc<Eth>,
		wallet: Arc<dyn UtxoWalletApi>,
		contract_address: H160,
		network: Network,
		timelocks: SwapTimelocks,
		shutdown: ShutdownFlag,
	) -> Self {
		Self {
			eth,
			wallet,
			contract_address,
			network,
			timelocks,
			deposit_confirmations: DEFAULT_DEPOSIT_CONFIRMATIONS,
			sessions: Mutex::new(HashMap::new()),
			shutdown,
		}
	}

	pub fn with_deposit_confirmations(mut self, confirmations: u32) -> Self {
		self.deposit_confirmations = confirmations;
		self
	}

	fn validate_offer(offer: &SwapOffer) -> Result<(), XRouterError> {
		if !service::is_valid_token(&offer.from_currency) ||
			!service::is_valid_token(&offer.to_currency)
		{
			return Err(XRouterError::InvalidParameters("bad currency name".to_string()));
		}
		if offer.from_currency == offer.to_currency {
			return Err(XRouterError::InvalidParameters(
				"cannot swap a currency against itself".to_string(),
			));
		}
		Ok(())
	}

	pub fn session(&self, hashed_secret: &[u8; 20]) -> Option<SwapSession> {
		self.sessions.lock().unwrap().get(hashed_secret).cloned()
	}

	pub fn session_state(&self, hashed_secret: &[u8; 20]) -> Option<SwapState> {
		self.session(hashed_secret).map(|s| s.state)
	}

	/// Starts a swap as the initiator: locks `from_amount` in a script
	/// output whose timeout path opens after the initiator window, then
	/// waits for the counterparty's contract escrow.
	pub async fn initiate(&self, offer: SwapOffer) -> Result<[u8; 20], XRouterError> {
		Self::validate_offer(&offer)?;
		let (secret, hashed_secret) = generate_secret();

		let locktime = (unix_time() + self.timelocks.initiator.as_secs()) as u32;
		let redeem_script = utxo::htlc_redeem_script(
			&offer.counterparty_utxo_pubkey,
			locktime,
			&offer.own_utxo_pubkey,
		);
		let address = utxo::htlc_address(&redeem_script, self.network)
			.map_err(|e| XRouterError::InvalidParameters(e.to_string()))?;
		let script_pubkey = address.script_pubkey();

		let internal = |e: anyhow::Error| {
			tracing::error!("Swap {}: failed to publish deposit: {e}", hex::encode(hashed_secret));
			XRouterError::InsufficientFunds(e.to_string())
		};

		let raw = self
			.wallet
			.create_raw_transaction(vec![RawTxOutput::Script {
				script_hex: hex::encode(script_pubkey.as_bytes()),
				amount: offer.from_amount,
			}])
			.await
			.map_err(internal)?;
		let funded = self.wallet.fund_raw_transaction(raw, true).await.map_err(internal)?;
		let signed = self.wallet.sign_raw_transaction(funded).await.map_err(internal)?;
		let txid = self.wallet.send_raw_transaction(signed.hex.clone()).await.map_err(internal)?;

		let deposit = find_deposit_outpoint(&signed.hex, &txid, &script_pubkey)?;

		let cursor = self
			.eth
			.get_block_number()
			.await
			.map_err(|e| XRouterError::InvalidState(e.to_string()))?;

		let session = SwapSession {
			hashed_secret,
			secret: Some(secret),
			role: SwapRole::Initiator,
			state: SwapState::Initiated,
			timelock: self.timelocks.initiator,
			started_at: Instant::now(),
			observation_cursor: cursor,
			utxo_deposit: Some(UtxoHtlc {
				outpoint: deposit,
				value: offer.from_amount,
				redeem_script_hex: hex::encode(redeem_script.as_bytes()),
			}),
			utxo_locktime: locktime,
			refund_published: false,
			offer,
		};
		tracing::info!(
			"Swap {}: initiated, deposit {} locktime {locktime}",
			hex::encode(hashed_secret),
			deposit,
		);
		self.sessions.lock().unwrap().insert(hashed_secret, session);
		Ok(hashed_secret)
	}

	/// Joins a swap as the responder: escrows `contract_value` in the swap
	/// contract under the responder window. `counterparty_htlc` identifies
	/// the initiator's script deposit for the later redeem.
	pub async fn accept(
		&self,
		hashed_secret: [u8; 20],
		offer: SwapOffer,
		counterparty_htlc: Option<UtxoHtlc>,
	) -> Result<(), XRouterError> {
		Self::validate_offer(&offer)?;
		if self.sessions.lock().unwrap().contains_key(&hashed_secret) {
			return Err(XRouterError::InvalidState(format!(
				"session {} already exists",
				hex::encode(hashed_secret)
			)));
		}

		let data = contract::respond_call_data(
			&hashed_secret,
			offer.counterparty_contract_address,
			U256::from(self.timelocks.responder.as_secs()),
		);
		let gas = self
			.eth
			.get_estimate_gas(
				offer.own_contract_address,
				self.contract_address,
				Some(offer.contract_value),
				data.clone(),
			)
			.await
			.map_err(|e| XRouterError::InvalidState(e.to_string()))?;
		let tx_hash = self
			.eth
			.send_transaction(
				offer.own_contract_address,
				self.contract_address,
				Some(gas),
				Some(offer.contract_value),
				data,
			)
			.await
			.map_err(|e| XRouterError::InvalidState(e.to_string()))?;

		let cursor = self
			.eth
			.get_block_number()
			.await
			.map_err(|e| XRouterError::InvalidState(e.to_string()))?;

		let session = SwapSession {
			hashed_secret,
			secret: None,
			role: SwapRole::Responder,
			state: SwapState::Responded,
			timelock: self.timelocks.responder,
			started_at: Instant::now(),
			observation_cursor: cursor,
			utxo_deposit: counterparty_htlc,
			utxo_locktime: 0,
			refund_published: false,
			offer,
		};
		tracing::info!(
			"Swap {}: responded with escrow tx {tx_hash:#x}",
			hex::encode(hashed_secret),
		);
		self.sessions.lock().unwrap().insert(hashed_secret, session);
		Ok(())
	}

	/// Confirmation check for a contract-side deposit transaction.
	pub async fn check_deposit(&self, tx_hash: H256) -> anyhow::Result<bool> {
		let tx_block = match self.eth.get_transaction_block_number(tx_hash).await {
			Ok(block) => block,
			Err(_) => return Ok(false), // not found yet, keep waiting
		};
		let head = self.eth.get_block_number().await?;
		Ok(self.confirmed(tx_block, head))
	}

	fn confirmed(&self, included: U256, head: U256) -> bool {
		head >= included &&
			head - included + U256::one() >= U256::from(self.deposit_confirmations)
	}

	/// Advances every session one step. Errors against the backends are
	/// logged and retried on the next pass.
	pub async fn poll_once(&self) {
		let sessions: Vec<SwapSession> =
			self.sessions.lock().unwrap().values().cloned().collect();

		for session in sessions {
			if let Err(error) = self.advance(&session).await {
				tracing::warn!(
					"Swap {}: poll failed: {error}",
					hex::encode(session.hashed_secret)
				);
			}
		}
	}

	async fn advance(&self, session: &SwapSession) -> anyhow::Result<()> {
		let action = self.next_action(session).await?;
		match action {
			SessionAction::None => Ok(()),
			SessionAction::InitiatorRedeem { log_block } =>
				self.initiator_redeem(session, log_block).await,
			SessionAction::InitiatorRefund => self.initiator_refund(session).await,
			SessionAction::ResponderRedeem { secret, log_block } =>
				self.responder_redeem(session, secret, log_block).await,
			SessionAction::ResponderRefundCall => self.responder_refund_call(session).await,
			SessionAction::ResponderRefunded { log_block } => {
				self.update(session.hashed_secret, |s| {
					s.state = SwapState::Refunded;
					s.observation_cursor = log_block.max(s.observation_cursor);
				});
				tracing::info!("Swap {}: refunded", hex::encode(session.hashed_secret));
				Ok(())
			},
		}
	}

	async fn next_action(&self, session: &SwapSession) -> anyhow::Result<SessionAction> {
		match (session.role, session.state) {
			(SwapRole::Initiator, SwapState::Initiated) => {
				let logs = self
					.eth
					.get_logs(
						self.contract_address,
						session.observation_cursor,
						contract::hashed_secret_topic(&session.hashed_secret),
					)
					.await?;
				let head = self.eth.get_block_number().await?;
				for log in &logs {
					if !contract::is_event(log.event_sig, contract::RESPONDED_EVENT) {
						continue;
					}
					let params = contract::split_event_params(&log.data)?;
					if contract::match_responded(
						&params,
						session.offer.own_contract_address,
						session.offer.contract_value,
					)
					.is_some()
					{
						// The escrow must be buried deep enough before the
						// preimage goes public.
						if self.confirmed(log.block_number, head) {
							return Ok(SessionAction::InitiatorRedeem {
								log_block: log.block_number,
							});
						}
						return Ok(SessionAction::None);
					}
				}
				if session.started_at.elapsed() >= session.timelock {
					return Ok(SessionAction::InitiatorRefund);
				}
				Ok(SessionAction::None)
			},
			(SwapRole::Responder, SwapState::Responded) => {
				let logs = self
					.eth
					.get_logs(
						self.contract_address,
						session.observation_cursor,
						contract::hashed_secret_topic(&session.hashed_secret),
					)
					.await?;
				for log in &logs {
					let params = contract::split_event_params(&log.data)?;
					if contract::is_event(log.event_sig, contract::REDEEMED_EVENT) {
						if let Some(secret) = contract::match_redeemed(
							&params,
							session.offer.counterparty_contract_address,
							session.offer.contract_value,
						) {
							let secret: [u8; 32] = secret
								.try_into()
								.map_err(|_| anyhow::anyhow!("bad secret length"))?;
							if hash_secret(&secret) != session.hashed_secret {
								anyhow::bail!("revealed secret does not match hashed secret");
							}
							return Ok(SessionAction::ResponderRedeem {
								secret,
								log_block: log.block_number,
							});
						}
					}
					if contract::is_event(log.event_sig, contract::REFUNDED_EVENT) &&
						contract::match_refunded(
							&params,
							session.offer.own_contract_address,
							session.offer.contract_value,
						) {
						return Ok(SessionAction::ResponderRefunded {
							log_block: log.block_number,
						});
					}
				}
				if session.started_at.elapsed() >= session.timelock && !session.refund_published
				{
					return Ok(SessionAction::ResponderRefundCall);
				}
				Ok(SessionAction::None)
			},
			_ => Ok(SessionAction::None),
		}
	}

	async fn initiator_redeem(
		&self,
		session: &SwapSession,
		log_block: U256,
	) -> anyhow::Result<()> {
		let secret = session.secret.ok_or_else(|| anyhow::anyhow!("initiator lost secret"))?;
		let data = contract::redeem_call_data(&session.hashed_secret, &secret);
		let gas = self
			.eth
			.get_estimate_gas(
				session.offer.own_contract_address,
				self.contract_address,
				None,
				data.clone(),
			)
			.await?;
		let tx_hash = self
			.eth
			.send_transaction(
				session.offer.own_contract_address,
				self.contract_address,
				Some(gas),
				None,
				data,
			)
			.await?;
		self.update(session.hashed_secret, |s| {
			s.state = SwapState::Redeemed;
			s.observation_cursor = log_block.max(s.observation_cursor);
		});
		tracing::info!(
			"Swap {}: redeemed escrow with tx {tx_hash:#x}",
			hex::encode(session.hashed_secret),
		);
		Ok(())
	}

	async fn initiator_refund(&self, session: &SwapSession) -> anyhow::Result<()> {
		let deposit = session
			.utxo_deposit
			.as_ref()
			.ok_or_else(|| anyhow::anyhow!("initiator session missing deposit"))?;
		let destination = self.wallet.new_address().await?;
		let destination = destination
			.parse::<bitcoin::Address<bitcoin::address::NetworkUnchecked>>()?
			.require_network(self.network)?;
		let refund = utxo::refund_transaction(
			deposit.outpoint,
			deposit.value,
			SPEND_FEE,
			&destination,
			session.utxo_locktime,
		);
		let raw = bitcoin::consensus::encode::serialize_hex(&refund);
		let signed = self.wallet.sign_raw_transaction(raw).await?;
		let txid = self.wallet.send_raw_transaction(signed.hex).await?;
		self.update(session.hashed_secret, |s| s.state = SwapState::Refunded);
		tracing::info!(
			"Swap {}: deposit refunded in {txid}",
			hex::encode(session.hashed_secret)
		);
		Ok(())
	}

	async fn responder_redeem(
		&self,
		session: &SwapSession,
		secret: [u8; 32],
		log_block: U256,
	) -> anyhow::Result<()> {
		if let Some(deposit) = session.utxo_deposit.as_ref() {
			let destination = self.wallet.new_address().await?;
			let destination = destination
				.parse::<bitcoin::Address<bitcoin::address::NetworkUnchecked>>()?
				.require_network(self.network)?;
			let redeem = utxo::redeem_transaction(
				deposit.outpoint,
				deposit.value,
				SPEND_FEE,
				&destination,
			);
			let raw = bitcoin::consensus::encode::serialize_hex(&redeem);
			let signed = self.wallet.sign_raw_transaction(raw).await?;
			let txid = self.wallet.send_raw_transaction(signed.hex).await?;
			tracing::info!(
				"Swap {}: counterparty deposit redeemed in {txid}",
				hex::encode(session.hashed_secret),
			);
		}
		self.update(session.hashed_secret, |s| {
			s.state = SwapState::Redeemed;
			s.secret = Some(secret);
			s.observation_cursor = log_block.max(s.observation_cursor);
		});
		Ok(())
	}

	async fn responder_refund_call(&self, session: &SwapSession) -> anyhow::Result<()> {
		let data = contract::refund_call_data(&session.hashed_secret);
		let gas = self
			.eth
			.get_estimate_gas(
				session.offer.own_contract_address,
				self.contract_address,
				None,
				data.clone(),
			)
			.await?;
		let tx_hash = self
			.eth
			.send_transaction(
				session.offer.own_contract_address,
				self.contract_address,
				Some(gas),
				None,
				data,
			)
			.await?;
		self.update(session.hashed_secret, |s| s.refund_published = true);
		tracing::info!(
			"Swap {}: refund requested with tx {tx_hash:#x}",
			hex::encode(session.hashed_secret),
		);
		Ok(())
	}

	fn update(&self, hashed_secret: [u8; 20], apply: impl FnOnce(&mut SwapSession)) {
		if let Some(session) = self.sessions.lock().unwrap().get_mut(&hashed_secret) {
			apply(session);
		}
	}

	/// Background driver: scans for contract events and timelock expiries
	/// until shutdown.
	pub async fn run(self: Arc<Self>) {
		loop {
			let mut waited = Duration::ZERO;
			while waited < SWAP_POLL_INTERVAL {
				if self.shutdown.is_requested() {
					return;
				}
				tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
				waited += SHUTDOWN_POLL_INTERVAL;
			}
			self.poll_once().await;
		}
	}
}

/// Locates the vout paying `script_pubkey` in a signed transaction.
fn find_deposit_outpoint(
	signed_hex: &str,
	txid: &str,
	script_pubkey: &bitcoin::ScriptBuf,
) -> Result<OutPoint, XRouterError> {
	let bad_tx = |m: String| XRouterError::InvalidState(m);
	let bytes =
		hex::decode(signed_hex).map_err(|e| bad_tx(format!("bad deposit tx hex: {e}")))?;
	let tx: bitcoin::Transaction = bitcoin::consensus::encode::deserialize(&bytes)
		.map_err(|e| bad_tx(format!("undecodable deposit tx: {e}")))?;
	let vout = tx
		.output
		.iter()
		.position(|out| &out.script_pubkey == script_pubkey)
		.ok_or_else(|| bad_tx("deposit tx missing script output".to_string()))?;
	let txid = txid.parse().map_err(|_| bad_tx(format!("bad txid: {txid}")))?;
	Ok(OutPoint { txid, vout: vout as u32 })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		eth::{rpc::MockEthRpcApi, ContractLog},
		wallet::{MockUtxoWalletApi, SignedTx},
	};

	fn test_pubkey() -> bitcoin::PublicKey {
		bitcoin::PublicKey::new(crate::packet::ClientKey::generate().public())
	}

	fn test_offer() -> SwapOffer {
		SwapOffer {
			from_currency: "BLOCK".to_string(),
			to_currency: "ETH".to_string(),
			from_amount: 100_000,
			to_amount: 200_000,
			contract_value: U256::from(1_000_000u64),
			own_contract_address: H160::from_slice(&[0x11; 20]),
			counterparty_contract_address: H160::from_slice(&[0x22; 20]),
			own_utxo_pubkey: test_pubkey(),
			counterparty_utxo_pubkey: test_pubkey(),
		}
	}

	// The mock wallet materializes the requested script output so the
	// deposit outpoint can be located in the "signed" transaction.
	fn deposit_wallet() -> MockUtxoWalletApi {
		let mut wallet = MockUtxoWalletApi::new();
		wallet.expect_create_raw_transaction().returning(|outputs| {
			let RawTxOutput::Script { script_hex, amount } = &outputs[0] else {
				panic!("expected script output");
			};
			let tx = bitcoin::Transaction {
				version: 2,
				lock_time: bitcoin::absolute::LockTime::ZERO,
				input: vec![],
				output: vec![bitcoin::TxOut {
					value: *amount,
					script_pubkey: bitcoin::ScriptBuf::from_bytes(
						hex::decode(script_hex).unwrap(),
					),
				}],
			};
			Ok(bitcoin::consensus::encode::serialize_hex(&tx))
		});
		wallet.expect_fund_raw_transaction().returning(|raw, _| Ok(raw));
		wallet
			.expect_sign_raw_transaction()
			.returning(|raw| Ok(SignedTx { hex: raw, complete: true }));
		wallet.expect_send_raw_transaction().returning(|raw| {
			let tx: bitcoin::Transaction =
				bitcoin::consensus::encode::deserialize(&hex::decode(&raw).unwrap()).unwrap();
			Ok(tx.txid().to_string())
		});
		wallet
	}

	fn manager(
		eth: MockEthRpcApi,
		wallet: MockUtxoWalletApi,
		timelocks: SwapTimelocks,
	) -> SwapManager<MockEthRpcApi> {
		SwapManager::new(
			Arc::new(eth),
			Arc::new(wallet),
			H160::from_slice(&[0xcc; 20]),
			Network::Regtest,
			timelocks,
			ShutdownFlag::new(),
		)
	}

	fn responded_log(offer: &SwapOffer, block: u64) -> ContractLog {
		let mut topic = [0u8; 32];
		topic[..4].copy_from_slice(&contract::encode_sig(contract::RESPONDED_EVENT));
		let data = format!(
			"0x{}{}{}",
			hex::encode(contract::encode_address(offer.own_contract_address)),
			hex::encode(contract::encode_address(offer.counterparty_contract_address)),
			hex::encode(contract::encode_u256(offer.contract_value)),
		);
		ContractLog { event_sig: H256::from(topic), data, block_number: U256::from(block) }
	}

	#[test]
	fn responder_window_must_close_first() {
		assert!(SwapTimelocks::new(Duration::from_secs(7200), Duration::from_secs(3600)).is_ok());
		assert!(matches!(
			SwapTimelocks::new(Duration::from_secs(3600), Duration::from_secs(3600)),
			Err(XRouterError::InvalidState(_))
		));
		assert!(SwapTimelocks::new(Duration::from_secs(10), Duration::from_secs(20)).is_err());
	}

	#[test]
	fn role_metadata() {
		assert_eq!(SwapRole::Initiator.as_char(), 'A');
		assert_eq!(SwapRole::Responder.as_char(), 'B');
		let timelocks = SwapTimelocks::default();
		assert_eq!(timelocks.for_role(SwapRole::Initiator), TIMELOCK_INITIATOR);
		assert_eq!(timelocks.for_role(SwapRole::Responder), TIMELOCK_RESPONDER);
	}

	#[test]
	fn secret_hashing_is_deterministic() {
		let (secret, hashed) = generate_secret();
		assert_eq!(hash_secret(&secret), hashed);
		let (other, _) = generate_secret();
		assert_ne!(secret, other);
	}

	#[tokio::test]
	async fn initiate_publishes_deposit_and_tracks_session() {
		let mut eth = MockEthRpcApi::new();
		eth.expect_get_block_number().returning(|| Ok(U256::from(500u64)));
		let wallet = deposit_wallet();

		let mgr = manager(eth, wallet, SwapTimelocks::default());
		let hashed = mgr.initiate(test_offer()).await.unwrap();

		let session = mgr.session(&hashed).unwrap();
		assert_eq!(session.state, SwapState::Initiated);
		assert_eq!(session.role, SwapRole::Initiator);
		assert_eq!(session.observation_cursor, U256::from(500u64));
		assert_eq!(hash_secret(&session.secret().unwrap()), hashed);
		assert!(session.utxo_deposit.is_some());
	}

	#[tokio::test]
	async fn initiator_redeems_after_confirmed_respond_event() {
		let offer = test_offer();
		let mut eth = MockEthRpcApi::new();
		eth.expect_get_block_number().returning(|| Ok(U256::from(600u64)));
		{
			let offer = offer.clone();
			eth.expect_get_logs()
				.returning(move |_, _, _| Ok(vec![responded_log(&offer, 595)]));
		}
		eth.expect_get_estimate_gas().returning(|_, _, _, _| Ok(U256::from(60_000u64)));
		eth.expect_send_transaction()
			.withf(|_, _, _, value, data| {
				value.is_none() && data[..4] == contract::encode_sig(contract::REDEEM_METHOD)
			})
			.times(1)
			.returning(|_, _, _, _, _| Ok(H256::from_slice(&[9u8; 32])));

		let wallet = deposit_wallet();
		let mgr = manager(eth, wallet, SwapTimelocks::default());
		let hashed = mgr.initiate(offer).await.unwrap();

		mgr.poll_once().await;
		assert_eq!(mgr.session_state(&hashed), Some(SwapState::Redeemed));
	}

	#[tokio::test]
	async fn initiator_waits_for_deposit_confirmations() {
		let offer = test_offer();
		let mut eth = MockEthRpcApi::new();
		eth.expect_get_block_number().returning(|| Ok(U256::from(600u64)));
		{
			let offer = offer.clone();
			// Two confirmations at this head, below the 3 required.
			eth.expect_get_logs()
				.returning(move |_, _, _| Ok(vec![responded_log(&offer, 599)]));
		}

		let wallet = deposit_wallet();
		let mgr =
			manager(eth, wallet, SwapTimelocks::default()).with_deposit_confirmations(3);
		let hashed = mgr.initiate(offer).await.unwrap();

		mgr.poll_once().await;
		assert_eq!(mgr.session_state(&hashed), Some(SwapState::Initiated));
	}

	#[tokio::test]
	async fn initiator_refunds_after_timelock() {
		let offer = test_offer();
		let mut eth = MockEthRpcApi::new();
		eth.expect_get_block_number().returning(|| Ok(U256::from(600u64)));
		eth.expect_get_logs().returning(|_, _, _| Ok(vec![]));

		let mut wallet = deposit_wallet();
		wallet.expect_new_address().returning(|| {
			Ok(bitcoin::Address::p2pkh(&test_pubkey(), Network::Regtest).to_string())
		});

		let timelocks =
			SwapTimelocks::new(Duration::from_millis(50), Duration::from_millis(10)).unwrap();
		let mgr = manager(eth, wallet, timelocks);
		let hashed = mgr.initiate(offer).await.unwrap();

		tokio::time::sleep(Duration::from_millis(80)).await;
		mgr.poll_once().await;
		assert_eq!(mgr.session_state(&hashed), Some(SwapState::Refunded));
	}

	fn refunded_log(offer: &SwapOffer, block: u64) -> ContractLog {
		let mut topic = [0u8; 32];
		topic[..4].copy_from_slice(&contract::encode_sig(contract::REFUNDED_EVENT));
		let data = format!(
			"0x{}{}",
			hex::encode(contract::encode_address(offer.own_contract_address)),
			hex::encode(contract::encode_u256(offer.contract_value)),
		);
		ContractLog { event_sig: H256::from(topic), data, block_number: U256::from(block) }
	}

	fn redeemed_log(offer: &SwapOffer, secret: &[u8; 32], block: u64) -> ContractLog {
		let mut topic = [0u8; 32];
		topic[..4].copy_from_slice(&contract::encode_sig(contract::REDEEMED_EVENT));
		let mut secret_word = [0u8; 32];
		secret_word.copy_from_slice(secret);
		let data = format!(
			"0x{}{}{}{}{}",
			hex::encode(contract::encode_u256(U256::from(0x60))),
			hex::encode(contract::encode_address(offer.counterparty_contract_address)),
			hex::encode(contract::encode_u256(offer.contract_value)),
			hex::encode(contract::encode_u256(U256::from(32))),
			hex::encode(secret_word),
		);
		ContractLog { event_sig: H256::from(topic), data, block_number: U256::from(block) }
	}

	#[tokio::test]
	async fn responder_refund_flow() {
		let offer = test_offer();
		let mut eth = MockEthRpcApi::new();
		eth.expect_get_block_number().returning(|| Ok(U256::from(700u64)));
		eth.expect_get_estimate_gas().returning(|_, _, _, _| Ok(U256::from(70_000u64)));

		// First the respond escrow, later the refund call.
		let sent: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
		{
			let sent = sent.clone();
			eth.expect_send_transaction().returning(move |_, _, _, _, data| {
				sent.lock().unwrap().push(data);
				Ok(H256::from_slice(&[4u8; 32]))
			});
		}

		// No events until the refund call lands, then a Refunded event.
		let refunded = refunded_log(&offer, 690);
		let calls = Arc::new(Mutex::new(0u32));
		{
			let calls = calls.clone();
			eth.expect_get_logs().returning(move |_, _, _| {
				let mut calls = calls.lock().unwrap();
				*calls += 1;
				if *calls >= 2 {
					Ok(vec![refunded.clone()])
				} else {
					Ok(vec![])
				}
			});
		}

		let wallet = MockUtxoWalletApi::new();
		let timelocks =
			SwapTimelocks::new(Duration::from_secs(7200), Duration::from_millis(20)).unwrap();
		let mgr = manager(eth, wallet, timelocks);
		let hashed = [0x42u8; 20];
		mgr.accept(hashed, offer, None).await.unwrap();
		assert_eq!(mgr.session_state(&hashed), Some(SwapState::Responded));

		tokio::time::sleep(Duration::from_millis(40)).await;
		// First pass publishes the refund call.
		mgr.poll_once().await;
		assert_eq!(mgr.session_state(&hashed), Some(SwapState::Responded));
		{
			let sent = sent.lock().unwrap();
			assert_eq!(sent.len(), 2);
			assert_eq!(&sent[1][..4], &contract::encode_sig(contract::REFUND_METHOD));
		}
		// Second pass observes the Refunded event.
		mgr.poll_once().await;
		assert_eq!(mgr.session_state(&hashed), Some(SwapState::Refunded));
	}

	#[tokio::test]
	async fn responder_extracts_secret_and_redeems_deposit() {
		let offer = test_offer();
		let (secret, hashed) = generate_secret();

		let mut eth = MockEthRpcApi::new();
		eth.expect_get_block_number().returning(|| Ok(U256::from(800u64)));
		eth.expect_get_estimate_gas().returning(|_, _, _, _| Ok(U256::from(70_000u64)));
		eth.expect_send_transaction()
			.returning(|_, _, _, _, _| Ok(H256::from_slice(&[5u8; 32])));
		{
			let log = redeemed_log(&offer, &secret, 790);
			eth.expect_get_logs().returning(move |_, _, _| Ok(vec![log.clone()]));
		}

		let mut wallet = MockUtxoWalletApi::new();
		wallet.expect_new_address().returning(|| {
			Ok(bitcoin::Address::p2pkh(&test_pubkey(), Network::Regtest).to_string())
		});
		wallet
			.expect_sign_raw_transaction()
			.returning(|raw| Ok(SignedTx { hex: raw, complete: true }));
		wallet
			.expect_send_raw_transaction()
			.times(1)
			.returning(|_| Ok("txid".to_string()));

		let mgr = manager(eth, wallet, SwapTimelocks::default());
		let htlc = UtxoHtlc {
			outpoint: OutPoint { txid: bitcoin::Txid::all_zeros(), vout: 0 },
			value: 100_000,
			redeem_script_hex: "51".to_string(),
		};
		mgr.accept(hashed, offer, Some(htlc)).await.unwrap();

		mgr.poll_once().await;
		let session = mgr.session(&hashed).unwrap();
		assert_eq!(session.state, SwapState::Redeemed);
		assert_eq!(session.secret(), Some(secret));
	}

	#[tokio::test]
	async fn mismatched_secret_is_rejected() {
		let offer = test_offer();
		let (wrong_secret, _) = generate_secret();
		let (_, hashed) = generate_secret();

		let mut eth = MockEthRpcApi::new();
		eth.expect_get_block_number().returning(|| Ok(U256::from(800u64)));
		eth.expect_get_estimate_gas().returning(|_, _, _, _| Ok(U256::from(70_000u64)));
		eth.expect_send_transaction()
			.returning(|_, _, _, _, _| Ok(H256::from_slice(&[5u8; 32])));
		{
			let log = redeemed_log(&offer, &wrong_secret, 790);
			eth.expect_get_logs().returning(move |_, _, _| Ok(vec![log.clone()]));
		}

		let wallet = MockUtxoWalletApi::new();
		let mgr = manager(eth, wallet, SwapTimelocks::default());
		mgr.accept(hashed, offer, None).await.unwrap();

		mgr.poll_once().await;
		// The forged reveal does not advance the session.
		assert_eq!(mgr.session_state(&hashed), Some(SwapState::Responded));
	}

	#[test]
	fn offer_validation() {
		let mut offer = test_offer();
		offer.to_currency = offer.from_currency.clone();
		assert!(SwapManager::<MockEthRpcApi>::validate_offer(&offer).is_err());

		let mut offer = test_offer();
		offer.from_currency = "bad name".to_string();
		assert!(SwapManager::<MockEthRpcApi>::validate_offer(&offer).is_err());

		assert!(SwapManager::<MockEthRpcApi>::validate_offer(&test_offer()).is_ok());
	}
}
