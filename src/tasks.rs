use std::io;

use futures::{
	executor::{block_on, ThreadPool},
	Future,
};
use parking_lot::RwLock;
use static_assertions::assert_impl_all;

/// Shared worker pool for background work, primarily the asynchronous closing
/// of resources evicted from page caches.
///
/// One runner is created per process and handed to the queues that need it
/// via `Arc`. `shutdown` exists so test suites can tear the pool down
/// deterministically; tasks submitted afterwards run inline on the caller
/// thread, so nothing is ever silently dropped.
pub struct TaskRunner {
	pool: RwLock<Option<ThreadPool>>,
}

assert_impl_all!(TaskRunner: Send, Sync);

impl TaskRunner {
	pub fn new() -> Result<Self, io::Error> {
		Ok(Self {
			pool: RwLock::new(Some(ThreadPool::new()?)),
		})
	}

	pub fn run(&self, task: impl Future<Output = ()> + Send + 'static) {
		let pool = self.pool.read();
		match &*pool {
			Some(pool) => pool.spawn_ok(task),
			None => block_on(task),
		}
	}

	pub fn shutdown(&self) {
		*self.pool.write() = None;
	}
}
