//! In-flight query tracking. Each query fans out to a set of nodes; every
//! `(uuid, node)` pair owns one reply slot with a wait/notify handle. Only
//! the first reply a node sends for a given query is accepted.

use std::{
	collections::{BTreeSet, HashMap},
	sync::{Arc, Mutex},
	time::{Duration, Instant},
};

use itertools::Itertools;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{registry::NodeAddr, utils::Amount};

struct Slot {
	replied: bool,
	notify: Arc<Notify>,
}

struct ReplyAggregate {
	stored_at: Instant,
	replies: HashMap<NodeAddr, String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct MostCommonReply {
	/// Size of the largest agreeing group; 0 when nothing was stored.
	pub count: usize,
	pub reply: String,
	pub agree: BTreeSet<NodeAddr>,
	pub diff: BTreeSet<NodeAddr>,
}

#[derive(Default)]
pub struct QueryManager {
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	slots: HashMap<Uuid, HashMap<NodeAddr, Slot>>,
	replies: HashMap<Uuid, ReplyAggregate>,
}

impl QueryManager {
	pub fn new() -> Self {
		Default::default()
	}

	/// Registers a reply slot. Must happen before the request is sent so a
	/// fast reply cannot race the registration.
	pub fn add_query(&self, uuid: Uuid, node: &str) {
		let mut inner = self.inner.lock().unwrap();
		inner
			.slots
			.entry(uuid)
			.or_default()
			.entry(node.to_string())
			.or_insert_with(|| Slot { replied: false, notify: Arc::new(Notify::new()) });
		inner
			.replies
			.entry(uuid)
			.or_insert_with(|| ReplyAggregate { stored_at: Instant::now(), replies: HashMap::new() });
	}

	/// Stores a reply. Rejected unless the slot exists and is still pending,
	/// so a node cannot overwrite its first answer.
	pub fn add_reply(&self, uuid: Uuid, node: &str, reply: String) -> bool {
		let mut inner = self.inner.lock().unwrap();
		let Some(slot) = inner.slots.get_mut(&uuid).and_then(|slots| slots.get_mut(node)) else {
			return false;
		};
		if slot.replied {
			return false;
		}
		slot.replied = true;
		let notify = slot.notify.clone();
		inner
			.replies
			.entry(uuid)
			.or_insert_with(|| ReplyAggregate { stored_at: Instant::now(), replies: HashMap::new() })
			.replies
			.insert(node.to_string(), reply);
		notify.notify_waiters();
		true
	}

	pub fn has_query(&self, uuid: Uuid, node: &str) -> bool {
		self.inner
			.lock()
			.unwrap()
			.slots
			.get(&uuid)
			.map(|slots| slots.contains_key(node))
			.unwrap_or(false)
	}

	/// Whether any query is outstanding against the node.
	pub fn has_node_query(&self, node: &str) -> bool {
		self.inner.lock().unwrap().slots.values().any(|slots| slots.contains_key(node))
	}

	pub fn has_reply(&self, uuid: Uuid, node: &str) -> bool {
		self.inner
			.lock()
			.unwrap()
			.replies
			.get(&uuid)
			.map(|agg| agg.replies.contains_key(node))
			.unwrap_or(false)
	}

	pub fn reply(&self, uuid: Uuid, node: &str) -> Option<String> {
		self.inner.lock().unwrap().replies.get(&uuid).and_then(|agg| agg.replies.get(node).cloned())
	}

	pub fn all_replies(&self, uuid: Uuid) -> HashMap<NodeAddr, String> {
		self.inner
			.lock()
			.unwrap()
			.replies
			.get(&uuid)
			.map(|agg| agg.replies.clone())
			.unwrap_or_default()
	}

	pub fn reply_count(&self, uuid: Uuid) -> usize {
		self.inner.lock().unwrap().replies.get(&uuid).map(|agg| agg.replies.len()).unwrap_or(0)
	}

	/// Wait handle for a slot; wake-ups fire when its reply lands.
	pub fn notifier(&self, uuid: Uuid, node: &str) -> Option<Arc<Notify>> {
		self.inner
			.lock()
			.unwrap()
			.slots
			.get(&uuid)
			.and_then(|slots| slots.get(node))
			.map(|slot| slot.notify.clone())
	}

	/// Groups stored replies by exact byte match (after trimming) and picks
	/// the largest group. Ties break toward the group with the lower summed
	/// fee cost, then toward the lexicographically smaller payload, so the
	/// result is stable across repeated reconciliations.
	pub fn most_common_reply(
		&self,
		uuid: Uuid,
		cost: impl Fn(&str) -> Amount,
	) -> MostCommonReply {
		let replies = self.all_replies(uuid);
		if replies.is_empty() {
			return MostCommonReply::default();
		}

		let groups: HashMap<String, Vec<NodeAddr>> = replies
			.iter()
			.map(|(node, reply)| (reply.trim().to_string(), node.clone()))
			.into_group_map();

		let (canonical, agree_nodes) = groups
			.into_iter()
			.min_by_key(|(reply, nodes)| {
				let total_cost: Amount = nodes.iter().map(|n| cost(n)).sum();
				(std::cmp::Reverse(nodes.len()), total_cost, reply.clone())
			})
			.expect("non-empty replies");

		let agree: BTreeSet<NodeAddr> = agree_nodes.into_iter().collect();
		// Return the raw payload of an agreeing node, not the trimmed form.
		let reply = agree
			.iter()
			.next()
			.and_then(|node| replies.get(node).cloned())
			.unwrap_or(canonical);
		let diff: BTreeSet<NodeAddr> =
			replies.keys().filter(|node| !agree.contains(*node)).cloned().collect();

		MostCommonReply { count: agree.len(), reply, agree, diff }
	}

	/// Drops the wait machinery for a query. Stored replies remain available
	/// for late retrieval until they expire. Safe to call repeatedly.
	pub fn purge(&self, uuid: Uuid) {
		self.inner.lock().unwrap().slots.remove(&uuid);
	}

	/// Drops a single node's slot.
	pub fn purge_slot(&self, uuid: Uuid, node: &str) {
		let mut inner = self.inner.lock().unwrap();
		if let Some(slots) = inner.slots.get_mut(&uuid) {
			slots.remove(node);
			if slots.is_empty() {
				inner.slots.remove(&uuid);
			}
		}
	}

	/// Evicts reply aggregates older than `retention`.
	pub fn purge_expired(&self, retention: Duration) {
		let mut inner = self.inner.lock().unwrap();
		let cutoff = Instant::now();
		inner
			.replies
			.retain(|_, agg| cutoff.duration_since(agg.stored_at) < retention);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn free(_: &str) -> Amount {
		0
	}

	#[test]
	fn only_first_reply_accepted() {
		let mgr = QueryManager::new();
		let uuid = Uuid::new_v4();
		mgr.add_query(uuid, "node1");

		assert!(mgr.add_reply(uuid, "node1", "first".into()));
		assert!(!mgr.add_reply(uuid, "node1", "second".into()));
		assert_eq!(mgr.reply(uuid, "node1").unwrap(), "first");
	}

	#[test]
	fn reply_without_slot_rejected() {
		let mgr = QueryManager::new();
		let uuid = Uuid::new_v4();
		assert!(!mgr.add_reply(uuid, "node1", "spoofed".into()));
		assert!(!mgr.has_reply(uuid, "node1"));
	}

	#[test]
	fn most_common_reply_empty_aggregate() {
		let mgr = QueryManager::new();
		let result = mgr.most_common_reply(Uuid::new_v4(), free);
		assert_eq!(result.count, 0);
		assert!(result.agree.is_empty());
	}

	#[test]
	fn most_common_reply_majority_wins() {
		let mgr = QueryManager::new();
		let uuid = Uuid::new_v4();
		for node in ["a", "b", "c"] {
			mgr.add_query(uuid, node);
		}
		mgr.add_reply(uuid, "a", "100".into());
		mgr.add_reply(uuid, "b", "100".into());
		mgr.add_reply(uuid, "c", "101".into());

		let result = mgr.most_common_reply(uuid, free);
		assert_eq!(result.count, 2);
		assert_eq!(result.reply, "100");
		assert_eq!(result.agree, BTreeSet::from(["a".to_string(), "b".to_string()]));
		assert_eq!(result.diff, BTreeSet::from(["c".to_string()]));
	}

	#[test]
	fn most_common_reply_tie_prefers_cheaper_group() {
		let mgr = QueryManager::new();
		let uuid = Uuid::new_v4();
		for node in ["a", "b", "c", "d"] {
			mgr.add_query(uuid, node);
		}
		mgr.add_reply(uuid, "a", "x".into());
		mgr.add_reply(uuid, "b", "x".into());
		mgr.add_reply(uuid, "c", "y".into());
		mgr.add_reply(uuid, "d", "y".into());

		let result = mgr.most_common_reply(uuid, |node| match node {
			"a" | "b" => 5,
			_ => 1,
		});
		assert_eq!(result.count, 2);
		assert_eq!(result.reply, "y");
	}

	#[test]
	fn most_common_reply_is_stable() {
		let mgr = QueryManager::new();
		let uuid = Uuid::new_v4();
		for node in ["a", "b", "c"] {
			mgr.add_query(uuid, node);
		}
		mgr.add_reply(uuid, "a", " 100 ".into());
		mgr.add_reply(uuid, "b", "100".into());
		mgr.add_reply(uuid, "c", "101".into());

		let first = mgr.most_common_reply(uuid, free);
		let second = mgr.most_common_reply(uuid, free);
		assert_eq!(first, second);
		assert_eq!(first.count, 2);
	}

	#[test]
	fn purge_is_idempotent_and_keeps_replies() {
		let mgr = QueryManager::new();
		let uuid = Uuid::new_v4();
		mgr.add_query(uuid, "node1");
		mgr.add_reply(uuid, "node1", "r".into());

		mgr.purge(uuid);
		mgr.purge(uuid);
		assert!(!mgr.has_query(uuid, "node1"));
		assert_eq!(mgr.reply(uuid, "node1").unwrap(), "r");

		mgr.purge_expired(Duration::from_secs(0));
		assert!(mgr.all_replies(uuid).is_empty());
	}

	#[test]
	fn purge_slot_removes_only_one_node() {
		let mgr = QueryManager::new();
		let uuid = Uuid::new_v4();
		mgr.add_query(uuid, "a");
		mgr.add_query(uuid, "b");

		mgr.purge_slot(uuid, "a");
		assert!(!mgr.has_query(uuid, "a"));
		assert!(mgr.has_query(uuid, "b"));
		assert!(mgr.has_node_query("b"));
		assert!(!mgr.has_node_query("a"));
	}

	#[tokio::test]
	async fn notifier_wakes_on_reply() {
		let mgr = Arc::new(QueryManager::new());
		let uuid = Uuid::new_v4();
		mgr.add_query(uuid, "node1");
		let notify = mgr.notifier(uuid, "node1").unwrap();

		let waiter = {
			let mgr = mgr.clone();
			tokio::spawn(async move {
				loop {
					if mgr.has_reply(uuid, "node1") {
						break;
					}
					let _ = tokio::time::timeout(Duration::from_millis(10), notify.notified())
						.await;
				}
			})
		};

		tokio::time::sleep(Duration::from_millis(20)).await;
		mgr.add_reply(uuid, "node1", "done".into());
		tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
	}
}
