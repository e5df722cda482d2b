use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc,
};

use crate::error::XRouterError;

/// Fixed-point currency amount in base units.
pub type Amount = u64;

/// Base units per whole coin.
pub const COIN: u64 = 100_000_000;

const MAX_MONEY: u64 = 21_000_000 * COIN;

/// Converts a decimal currency value into base units. Zero is allowed; fees
/// of zero mean a free call.
pub fn amount_from_value(value: f64) -> Result<Amount, XRouterError> {
	if !value.is_finite() || value < 0.0 || value > 21_000_000.0 {
		return Err(XRouterError::InvalidParameters(format!("Invalid amount: {value}")));
	}
	let amount = (value * COIN as f64 + 0.5) as u64;
	if amount > MAX_MONEY {
		return Err(XRouterError::InvalidParameters(format!("Invalid amount: {value}")));
	}
	Ok(amount)
}

pub fn value_from_amount(amount: Amount) -> f64 {
	amount as f64 / COIN as f64
}

/// Strictly decimal digits, at least one.
pub fn is_number(s: &str) -> bool {
	!s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Even-length hex string, at least one byte.
pub fn is_hash(s: &str) -> bool {
	s.len() >= 2 && s.len() % 2 == 0 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Cooperative shutdown signal shared by all background loops. Every wait
/// loop checks this at each sleep slice.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
	pub fn new() -> Self {
		Default::default()
	}

	pub fn request(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_requested(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn amount_conversion_rounds_to_nearest_base_unit() {
		assert_eq!(amount_from_value(0.0).unwrap(), 0);
		assert_eq!(amount_from_value(0.01).unwrap(), 1_000_000);
		assert_eq!(amount_from_value(1.0).unwrap(), COIN);
		assert!(amount_from_value(-0.1).is_err());
		assert!(amount_from_value(22_000_000.0).is_err());
		assert!(amount_from_value(f64::NAN).is_err());
	}

	#[test]
	fn number_and_hash_checks() {
		assert!(is_number("123456"));
		assert!(!is_number(""));
		assert!(!is_number("12a"));
		assert!(is_hash("deadbeef"));
		assert!(!is_hash("deadbee"));
		assert!(!is_hash("zz"));
	}

	#[test]
	fn shutdown_flag_is_sticky() {
		let flag = ShutdownFlag::new();
		assert!(!flag.is_requested());
		let other = flag.clone();
		other.request();
		assert!(flag.is_requested());
	}
}
