use std::{
	collections::HashMap,
	hash::Hash,
	sync::{
		atomic::{AtomicI64, AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use log::warn;
use parking_lot::RwLock;

#[cfg(test)]
use mockall::automock;

use crate::{files::FileError, tasks::TaskRunner, utils::now_millis};

/// A resource that can release its underlying handles.
#[cfg_attr(test, automock)]
pub(crate) trait Closeable {
	fn close(&self) -> Result<(), FileError>;
}

struct CacheEntry<V> {
	value: Arc<V>,
	refcount: AtomicI64,
	last_access_ms: AtomicU64,
	ttl_ms: u64,
}

impl<V> CacheEntry<V> {
	fn is_expired(&self, now: u64) -> bool {
		self.refcount.load(Ordering::Acquire) <= 0
			&& now.saturating_sub(self.last_access_ms.load(Ordering::Acquire)) > self.ttl_ms
	}
}

/// Keyed cache of closeable resources with acquire/release refcounting and
/// lazy TTL eviction.
///
/// There is no capacity bound and no recency ordering: an entry stays alive
/// until its refcount has dropped to zero *and* its TTL has expired since
/// the last access. That combination is what lets callers keep using a
/// resource they acquired without it being closed under them. Expired
/// entries are collected in a mark-and-sweep pass that runs at the start of
/// every [`put`]; the swept values are closed on the shared task runner so
/// the cache lock is never held across a close.
///
/// [`put`]: RefTtlCache::put
pub(crate) struct RefTtlCache<K, V> {
	entries: RwLock<HashMap<K, CacheEntry<V>>>,
	tasks: Arc<TaskRunner>,
}

impl<K, V> RefTtlCache<K, V>
where
	K: Eq + Hash + Clone,
	V: Closeable + Send + Sync + 'static,
{
	pub fn new(tasks: Arc<TaskRunner>) -> Self {
		Self {
			entries: RwLock::new(HashMap::new()),
			tasks,
		}
	}

	/// Inserts a resource with an initial refcount of one, sweeping expired
	/// entries first. A value replaced under the same key is closed along
	/// with the swept ones.
	pub fn put(&self, key: K, value: Arc<V>, ttl: Duration) {
		let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
		let mut entries = self.entries.write();
		let mut evicted = Self::sweep(&mut entries);
		let previous = entries.insert(
			key,
			CacheEntry {
				value,
				refcount: AtomicI64::new(1),
				last_access_ms: AtomicU64::new(now_millis()),
				ttl_ms,
			},
		);
		drop(entries);

		evicted.extend(previous.map(|entry| entry.value));
		self.close_async(evicted);
	}

	/// On a hit, bumps the refcount and the last-access timestamp. Never
	/// reinserts on a miss.
	pub fn get(&self, key: &K) -> Option<Arc<V>> {
		let entries = self.entries.read();
		let entry = entries.get(key)?;
		entry.refcount.fetch_add(1, Ordering::AcqRel);
		entry.last_access_ms.store(now_millis(), Ordering::Release);
		Some(Arc::clone(&entry.value))
	}

	/// Drops one reference. Eviction stays lazy; the entry lives on until a
	/// later sweep finds it expired.
	pub fn release(&self, key: &K) {
		let entries = self.entries.read();
		if let Some(entry) = entries.get(key) {
			entry.refcount.fetch_sub(1, Ordering::AcqRel);
		}
	}

	/// Removes and synchronously closes one entry. Unknown keys are ignored.
	pub fn remove(&self, key: &K) -> Result<(), FileError> {
		let entry = self.entries.write().remove(key);
		match entry {
			Some(entry) => entry.value.close(),
			None => Ok(()),
		}
	}

	/// Synchronously closes every live entry and empties the cache. All
	/// entries are closed even when some fail; the first error is returned.
	pub fn remove_all(&self) -> Result<(), FileError> {
		let values: Vec<Arc<V>> = {
			let mut entries = self.entries.write();
			entries.drain().map(|(_, entry)| entry.value).collect()
		};
		let mut first_error = None;
		for value in values {
			if let Err(error) = value.close() {
				first_error.get_or_insert(error);
			}
		}
		match first_error {
			Some(error) => Err(error),
			None => Ok(()),
		}
	}

	/// Snapshot of the live values, without touching refcounts.
	pub fn values(&self) -> Vec<Arc<V>> {
		self.entries
			.read()
			.values()
			.map(|entry| Arc::clone(&entry.value))
			.collect()
	}

	pub fn size(&self) -> usize {
		self.entries.read().len()
	}

	fn sweep(entries: &mut HashMap<K, CacheEntry<V>>) -> Vec<Arc<V>> {
		let now = now_millis();
		let expired: Vec<K> = entries
			.iter()
			.filter(|(_, entry)| entry.is_expired(now))
			.map(|(key, _)| key.clone())
			.collect();
		expired
			.into_iter()
			.filter_map(|key| entries.remove(&key))
			.map(|entry| entry.value)
			.collect()
	}

	fn close_async(&self, values: Vec<Arc<V>>) {
		if values.is_empty() {
			return;
		}
		self.tasks.run(async move {
			for value in values {
				if let Err(error) = value.close() {
					warn!("Failed to close an evicted cache entry: {error}");
				}
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use std::{sync::atomic::AtomicBool, thread, time::Duration};

	use super::*;

	struct TestResource {
		closed: AtomicBool,
	}

	impl TestResource {
		fn new() -> Arc<Self> {
			Arc::new(Self {
				closed: AtomicBool::new(false),
			})
		}

		fn is_closed(&self) -> bool {
			self.closed.load(Ordering::Acquire)
		}
	}

	impl Closeable for TestResource {
		fn close(&self) -> Result<(), FileError> {
			self.closed.store(true, Ordering::Release);
			Ok(())
		}
	}

	fn wait_until_closed(resource: &TestResource) {
		for _ in 0..200 {
			if resource.is_closed() {
				return;
			}
			thread::sleep(Duration::from_millis(5));
		}
		panic!("Resource was not closed in time");
	}

	#[test]
	fn stores_and_loads_values() {
		// given
		let tasks = Arc::new(TaskRunner::new().unwrap());
		let cache: RefTtlCache<u64, TestResource> = RefTtlCache::new(tasks);

		// when
		cache.put(69, TestResource::new(), Duration::from_secs(10));

		// then
		assert!(cache.get(&69).is_some());
		assert!(cache.get(&420).is_none());
		assert_eq!(cache.size(), 1);
	}

	#[test]
	fn sweeps_expired_entries_on_put() {
		// given
		let tasks = Arc::new(TaskRunner::new().unwrap());
		let cache: RefTtlCache<u64, TestResource> = RefTtlCache::new(tasks);
		let resource = TestResource::new();
		cache.put(0, Arc::clone(&resource), Duration::ZERO);
		cache.release(&0);
		thread::sleep(Duration::from_millis(10));

		// when
		cache.put(1, TestResource::new(), Duration::from_secs(10));

		// then
		assert!(cache.get(&0).is_none());
		assert_eq!(cache.size(), 1);
		wait_until_closed(&resource);
	}

	#[test]
	fn referenced_entries_survive_the_sweep() {
		// given
		let tasks = Arc::new(TaskRunner::new().unwrap());
		let cache: RefTtlCache<u64, TestResource> = RefTtlCache::new(tasks);
		let resource = TestResource::new();
		// Refcount stays at 1; the TTL alone must not evict.
		cache.put(0, Arc::clone(&resource), Duration::ZERO);
		thread::sleep(Duration::from_millis(10));

		// when
		cache.put(1, TestResource::new(), Duration::from_secs(10));

		// then
		assert!(cache.get(&0).is_some());
		assert!(!resource.is_closed());
	}

	#[test]
	fn get_resurrects_the_ttl() {
		// given
		let tasks = Arc::new(TaskRunner::new().unwrap());
		let cache: RefTtlCache<u64, TestResource> = RefTtlCache::new(tasks);
		cache.put(0, TestResource::new(), Duration::ZERO);
		cache.release(&0);

		// when: get bumps the refcount back above zero before the sweep runs
		let value = cache.get(&0).unwrap();
		thread::sleep(Duration::from_millis(10));
		cache.put(1, TestResource::new(), Duration::from_secs(10));

		// then
		assert!(!value.is_closed());
		assert_eq!(cache.size(), 2);
	}

	#[test]
	fn remove_closes_synchronously() {
		// given
		let tasks = Arc::new(TaskRunner::new().unwrap());
		let cache: RefTtlCache<u64, MockCloseable> = RefTtlCache::new(tasks);
		let mut resource = MockCloseable::new();
		resource.expect_close().once().returning(|| Ok(()));
		cache.put(7, Arc::new(resource), Duration::from_secs(10));

		// when
		cache.remove(&7).unwrap();

		// then
		assert_eq!(cache.size(), 0);
		// Removing an unknown key is fine
		cache.remove(&7).unwrap();
	}

	#[test]
	fn remove_all_closes_every_value() {
		// given
		let tasks = Arc::new(TaskRunner::new().unwrap());
		let cache: RefTtlCache<u64, TestResource> = RefTtlCache::new(tasks);
		let a = TestResource::new();
		let b = TestResource::new();
		cache.put(0, Arc::clone(&a), Duration::from_secs(10));
		cache.put(1, Arc::clone(&b), Duration::from_secs(10));

		// when
		cache.remove_all().unwrap();

		// then
		assert_eq!(cache.size(), 0);
		assert!(a.is_closed());
		assert!(b.is_closed());
	}

	#[test]
	fn values_snapshot_does_not_touch_refcounts() {
		// given
		let tasks = Arc::new(TaskRunner::new().unwrap());
		let cache: RefTtlCache<u64, TestResource> = RefTtlCache::new(tasks);
		cache.put(0, TestResource::new(), Duration::ZERO);
		cache.release(&0);

		// when
		let values = cache.values();
		thread::sleep(Duration::from_millis(10));
		cache.put(1, TestResource::new(), Duration::from_secs(10));

		// then: the snapshot did not keep entry 0 alive
		assert_eq!(values.len(), 1);
		assert!(cache.get(&0).is_none());
	}
}
