//! Read-only view of the service-node registry. The registry itself is an
//! external collaborator; readers always work on owned snapshot copies.

use std::collections::BTreeSet;

use secp256k1::PublicKey;

/// `ip:port` string identifying a node. Doubles as the dial target and the
/// primary key across the config cache and score table.
pub type NodeAddr = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNode {
	/// Compressed node key (33 bytes).
	pub pubkey: PublicKey,
	pub host: NodeAddr,
	/// Default destination for fee payments.
	pub payment_address: String,
	/// Fully-qualified capability names advertised by the node.
	pub services: BTreeSet<String>,
	/// Asserted by the registry.
	pub running: bool,
}

impl ServiceNode {
	pub fn has_service(&self, service: &str) -> bool {
		self.services.contains(service)
	}
}

pub trait RegistryApi: Send + Sync {
	/// Owned snapshot of all registered service nodes.
	fn service_nodes(&self) -> Vec<ServiceNode>;

	fn get(&self, addr: &str) -> Option<ServiceNode> {
		self.service_nodes().into_iter().find(|s| s.host == addr)
	}

	fn node_pubkey(&self, addr: &str) -> Option<PublicKey> {
		self.get(addr).map(|s| s.pubkey)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::packet::ClientKey;

	struct FixedRegistry(Vec<ServiceNode>);

	impl RegistryApi for FixedRegistry {
		fn service_nodes(&self) -> Vec<ServiceNode> {
			self.0.clone()
		}
	}

	#[test]
	fn snapshot_lookup() {
		let node = ServiceNode {
			pubkey: ClientKey::generate().public(),
			host: "127.0.0.1:41412".to_string(),
			payment_address: "pay1".to_string(),
			services: BTreeSet::from(["xr".to_string(), "xr::BLOCK".to_string()]),
			running: true,
		};
		let registry = FixedRegistry(vec![node.clone()]);

		assert_eq!(registry.get("127.0.0.1:41412"), Some(node.clone()));
		assert_eq!(registry.node_pubkey("127.0.0.1:41412"), Some(node.pubkey));
		assert!(registry.get("10.0.0.1:41412").is_none());
		assert!(node.has_service("xr::BLOCK"));
		assert!(!node.has_service("xr::LTC"));
	}
}
