//! RPC adapter for the account/contract chain dialect, built on
//! `ethers::providers::Provider<Http>`. The provider handles the JSON-RPC
//! envelope and the 0x hex encoding of addresses, quantities and byte
//! arrays; responses come back as typed values. The client is pinned to an
//! expected chain id and refuses to report a network identity when the node
//! disagrees.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use ethers::{prelude::*, types::transaction::eip2718::TypedTransaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
	Mainnet,
	Testnet,
}

/// One matching contract log: the event selector hash from `topics[0]`, the
/// raw data blob, and the block it landed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractLog {
	pub event_sig: H256,
	pub data: String,
	pub block_number: U256,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EthRpcApi: Send + Sync {
	async fn get_accounts(&self) -> Result<Vec<H160>>;

	async fn get_balance(&self, address: H160) -> Result<U256>;

	async fn send_transaction(
		&self,
		from: H160,
		to: H160,
		gas: Option<U256>,
		value: Option<U256>,
		data: Vec<u8>,
	) -> Result<H256>;

	/// Block height the transaction was included at.
	async fn get_transaction_block_number(&self, tx_hash: H256) -> Result<U256>;

	async fn get_block_number(&self) -> Result<U256>;

	async fn get_chain_id(&self) -> Result<U256>;

	/// Network identity, verified against the node's actual chain id.
	async fn get_net_version(&self) -> Result<NetworkType>;

	async fn get_last_block_time(&self) -> Result<U256>;

	async fn get_gas_price(&self) -> Result<U256>;

	async fn get_estimate_gas(
		&self,
		from: H160,
		to: H160,
		value: Option<U256>,
		data: Vec<u8>,
	) -> Result<U256>;

	/// Logs emitted by `address` from `from_block` onward whose second topic
	/// equals `topic`.
	async fn get_logs(
		&self,
		address: H160,
		from_block: U256,
		topic: H256,
	) -> Result<Vec<ContractLog>>;
}

fn legacy_request(
	from: H160,
	to: H160,
	gas: Option<U256>,
	value: Option<U256>,
	data: Vec<u8>,
) -> TransactionRequest {
	TransactionRequest {
		from: Some(from),
		to: Some(to.into()),
		gas,
		value,
		data: Some(data.into()),
		..Default::default()
	}
}

fn to_contract_log(log: Log, fallback_block: U256) -> Result<ContractLog> {
	let event_sig = *log.topics.first().ok_or_else(|| anyhow!("log without topics"))?;
	Ok(ContractLog {
		event_sig,
		data: format!("0x{}", hex::encode(&log.data)),
		block_number: log
			.block_number
			.map(|number| U256::from(number.as_u64()))
			.unwrap_or(fallback_block),
	})
}

#[derive(Clone)]
pub struct EthRpcClient {
	provider: Arc<Provider<Http>>,
	expected_chain_id: U256,
	network: NetworkType,
}

impl EthRpcClient {
	pub fn new(
		http_endpoint: &str,
		expected_chain_id: U256,
		network: NetworkType,
	) -> Result<Self> {
		let provider = Arc::new(Provider::<Http>::try_from(http_endpoint)?);
		Ok(Self { provider, expected_chain_id, network })
	}
}

#[async_trait]
impl EthRpcApi for EthRpcClient {
	async fn get_accounts(&self) -> Result<Vec<H160>> {
		Ok(self.provider.get_accounts().await?)
	}

	async fn get_balance(&self, address: H160) -> Result<U256> {
		Ok(self.provider.get_balance(address, None).await?)
	}

	async fn send_transaction(
		&self,
		from: H160,
		to: H160,
		gas: Option<U256>,
		value: Option<U256>,
		data: Vec<u8>,
	) -> Result<H256> {
		let request = legacy_request(from, to, gas, value, data);
		Ok(self.provider.send_transaction(request, None).await?.tx_hash())
	}

	/// Errors when the transaction is unknown or still pending.
	async fn get_transaction_block_number(&self, tx_hash: H256) -> Result<U256> {
		let transaction = self
			.provider
			.get_transaction(tx_hash)
			.await?
			.ok_or_else(|| anyhow!("Getting transaction for tx hash {tx_hash} returned None"))?;
		let block_number = transaction
			.block_number
			.ok_or_else(|| anyhow!("Transaction {tx_hash} is not in a block yet"))?;
		Ok(U256::from(block_number.as_u64()))
	}

	async fn get_block_number(&self) -> Result<U256> {
		Ok(U256::from(self.provider.get_block_number().await?.as_u64()))
	}

	async fn get_chain_id(&self) -> Result<U256> {
		Ok(self.provider.get_chainid().await?)
	}

	async fn get_net_version(&self) -> Result<NetworkType> {
		let chain_id = self.provider.get_chainid().await?;
		if chain_id != self.expected_chain_id {
			bail!(
				"Expected chain id {}, node returned {chain_id}",
				self.expected_chain_id
			);
		}
		Ok(self.network)
	}

	async fn get_last_block_time(&self) -> Result<U256> {
		let block = self
			.provider
			.get_block(BlockNumber::Latest)
			.await?
			.ok_or_else(|| anyhow!("Getting the latest block returned None"))?;
		Ok(block.timestamp)
	}

	async fn get_gas_price(&self) -> Result<U256> {
		Ok(self.provider.get_gas_price().await?)
	}

	async fn get_estimate_gas(
		&self,
		from: H160,
		to: H160,
		value: Option<U256>,
		data: Vec<u8>,
	) -> Result<U256> {
		let request = legacy_request(from, to, None, value, data);
		Ok(self
			.provider
			.estimate_gas(&TypedTransaction::Legacy(request), None)
			.await?)
	}

	async fn get_logs(
		&self,
		address: H160,
		from_block: U256,
		topic: H256,
	) -> Result<Vec<ContractLog>> {
		let filter = Filter::new()
			.address(address)
			.from_block(U64::from(from_block.as_u64()))
			.to_block(BlockNumber::Latest)
			.topic1(topic);
		self.provider
			.get_logs(&filter)
			.await?
			.into_iter()
			.map(|log| to_contract_log(log, from_block))
			.collect()
	}
}
