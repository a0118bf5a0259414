pub(crate) mod arith;

pub(crate) const B: u64 = 1;
pub(crate) const KIB: u64 = 1024 * B;
pub(crate) const MIB: u64 = 1024 * KIB;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch. Saturates to 0 for clocks set before
/// 1970 rather than panicking.
pub(crate) fn now_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
		.unwrap_or(0)
}
