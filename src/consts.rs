use std::time::Duration;

use crate::utils::{KIB, MIB};

/// Default size of one data page file. Records are bump-allocated inside the
/// current tail page, so larger pages mean fewer page switches.
pub(crate) const DEFAULT_DATA_PAGE_SIZE: u64 = 128 * MIB;

/// Production floor for the data page size. Smaller powers of two are
/// accepted but logged, so test suites can run on tiny pages.
pub(crate) const MIN_DATA_PAGE_SIZE: u64 = 32 * MIB;

pub(crate) const META_PAGE_SIZE: u64 = 32 * KIB;

/// On-disk size of one record metadata slot. Must be a power of two so that
/// the per-page slot count is a power of two as well.
pub(crate) const META_SLOT_SIZE: u64 = 32;

/// Size of the single-slot pages that persist the head and front cursors.
pub(crate) const CURSOR_PAGE_SIZE: u64 = 8;

pub(crate) const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(10_000);

pub(crate) const DELETE_RETRY_ROUNDS: usize = 10;
pub(crate) const DELETE_RETRY_PAUSE: Duration = Duration::from_millis(200);
