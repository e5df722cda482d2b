//! Collaborator traits for the P2P layer. The gossip transport itself lives
//! outside this crate; the engine only needs to enumerate connections, push
//! packets, dial, and apply transport-level bans.

use async_trait::async_trait;

use crate::registry::NodeAddr;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait P2pTransport: Send + Sync {
	/// Addresses of currently connected peers.
	fn connected_peers(&self) -> Vec<NodeAddr>;

	fn is_connected(&self, node: &str) -> bool;

	/// Pushes an encoded packet to a connected peer.
	async fn send_message(&self, node: &str, message: Vec<u8>) -> anyhow::Result<()>;

	/// Opens a connection and resolves once the peer is usable.
	async fn dial(&self, node: &str) -> anyhow::Result<()>;

	fn disconnect(&self, node: &str);

	/// Long-duration transport ban.
	fn ban(&self, node: &str);

	fn is_banned(&self, node: &str) -> bool;
}
