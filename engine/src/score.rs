//! Per-node behavior scores. Scores saturate, and a node dropping to the ban
//! threshold is reported to the caller so the transport can disconnect and
//! ban it; its stored score resets to the post-ban value.

use std::{
	collections::HashMap,
	sync::Mutex,
};

use crate::{
	constants::{DEFAULT_BAN_SCORE, SCORE_AFTER_BAN},
	registry::NodeAddr,
};

/// Standard adjustments applied by the query engine.
pub mod penalty {
	/// Minor protocol infraction or dial that timed out.
	pub const MINOR: i32 = -5;
	/// Unparseable packet or failed dial.
	pub const PROTOCOL: i32 = -10;
	/// No reply within the command deadline.
	pub const NO_RESPONSE: i32 = -25;
	/// Reply carried an internal-server-error code.
	pub const SERVER_ERROR: i32 = -2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreUpdate {
	Adjusted(i32),
	/// Score fell to the ban threshold; carries the offending value. The
	/// stored score has already been reset.
	Banned(i32),
}

pub struct ScoreTable {
	scores: Mutex<HashMap<NodeAddr, i32>>,
	ban_threshold: i32,
}

impl Default for ScoreTable {
	fn default() -> Self {
		Self::new(DEFAULT_BAN_SCORE)
	}
}

impl ScoreTable {
	pub fn new(ban_threshold: i32) -> Self {
		Self { scores: Mutex::new(HashMap::new()), ban_threshold }
	}

	pub fn get(&self, node: &str) -> i32 {
		self.scores.lock().unwrap().get(node).copied().unwrap_or(0)
	}

	/// Applies a saturating adjustment and runs the ban check.
	pub fn adjust(&self, node: &str, delta: i32) -> ScoreUpdate {
		let mut scores = self.scores.lock().unwrap();
		let entry = scores.entry(node.to_string()).or_insert(0);
		*entry = entry.saturating_add(delta);
		if *entry <= self.ban_threshold {
			let offending = *entry;
			*entry = SCORE_AFTER_BAN;
			ScoreUpdate::Banned(offending)
		} else {
			ScoreUpdate::Adjusted(*entry)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn adjustments_accumulate() {
		let table = ScoreTable::default();
		assert_eq!(table.get("a"), 0);
		assert_eq!(table.adjust("a", penalty::MINOR), ScoreUpdate::Adjusted(-5));
		assert_eq!(table.adjust("a", 4), ScoreUpdate::Adjusted(-1));
		assert_eq!(table.get("a"), -1);
		assert_eq!(table.get("b"), 0);
	}

	#[test]
	fn ban_threshold_resets_score() {
		let table = ScoreTable::new(-200);
		for _ in 0..7 {
			table.adjust("a", penalty::NO_RESPONSE);
		}
		assert_eq!(table.get("a"), -175);
		assert_eq!(table.adjust("a", penalty::NO_RESPONSE), ScoreUpdate::Banned(-200));
		assert_eq!(table.get("a"), SCORE_AFTER_BAN);
	}

	#[test]
	fn saturates_instead_of_overflowing() {
		let table = ScoreTable::new(i32::MIN);
		table.adjust("a", i32::MIN);
		assert_eq!(table.get("a"), SCORE_AFTER_BAN);
	}
}
