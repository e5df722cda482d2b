//! Deduplicates concurrent dial attempts. At most one dial per node is in
//! flight; later attempts wait on the first dial's outcome and re-check
//! connection state themselves once woken.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
};

use tokio::sync::Notify;

use crate::registry::NodeAddr;

pub enum DialAttempt {
	/// Caller owns the dial and must call [`PendingConnections::finish`].
	Owner,
	/// Another dial is in flight; wait on the handle, every waiter observes
	/// the terminal outcome.
	Pending(Arc<Notify>),
}

#[derive(Default)]
pub struct PendingConnections {
	pending: Mutex<HashMap<NodeAddr, Arc<Notify>>>,
}

impl PendingConnections {
	pub fn new() -> Self {
		Default::default()
	}

	pub fn begin(&self, node: &str) -> DialAttempt {
		let mut pending = self.pending.lock().unwrap();
		if let Some(notify) = pending.get(node) {
			DialAttempt::Pending(notify.clone())
		} else {
			pending.insert(node.to_string(), Arc::new(Notify::new()));
			DialAttempt::Owner
		}
	}

	pub fn is_pending(&self, node: &str) -> bool {
		self.pending.lock().unwrap().contains_key(node)
	}

	/// Removes the in-flight marker and wakes every waiter.
	pub fn finish(&self, node: &str) {
		if let Some(notify) = self.pending.lock().unwrap().remove(node) {
			notify.notify_waiters();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[test]
	fn second_dial_yields_to_first() {
		let pending = PendingConnections::new();
		assert!(matches!(pending.begin("a"), DialAttempt::Owner));
		assert!(matches!(pending.begin("a"), DialAttempt::Pending(_)));
		assert!(matches!(pending.begin("b"), DialAttempt::Owner));
		assert!(pending.is_pending("a"));

		pending.finish("a");
		assert!(!pending.is_pending("a"));
		assert!(matches!(pending.begin("a"), DialAttempt::Owner));
	}

	#[tokio::test]
	async fn waiters_observe_terminal_outcome() {
		let pending = Arc::new(PendingConnections::new());
		assert!(matches!(pending.begin("a"), DialAttempt::Owner));

		let DialAttempt::Pending(notify) = pending.begin("a") else {
			panic!("expected pending dial");
		};

		let waiter = {
			let pending = pending.clone();
			tokio::spawn(async move {
				// Re-check state on every wakeup slice so a finish that races
				// the notified() registration is still observed.
				loop {
					if !pending.is_pending("a") {
						break;
					}
					let _ = tokio::time::timeout(Duration::from_millis(10), notify.notified())
						.await;
				}
			})
		};

		tokio::time::sleep(Duration::from_millis(20)).await;
		pending.finish("a");
		tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
	}

	#[test]
	fn finish_is_idempotent() {
		let pending = PendingConnections::new();
		assert!(matches!(pending.begin("a"), DialAttempt::Owner));
		pending.finish("a");
		pending.finish("a");
		assert!(!pending.is_pending("a"));
	}
}
