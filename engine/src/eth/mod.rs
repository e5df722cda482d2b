pub mod rpc;

pub use rpc::{ContractLog, EthRpcApi, EthRpcClient, NetworkType};
