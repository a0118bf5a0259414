use std::{
	collections::VecDeque,
	path::Path,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use log::warn;
use parking_lot::Mutex;
use static_assertions::assert_impl_all;

use crate::{
	array::{read_cursor, store_cursor, FastArray},
	completion::Completion,
	consts::{CURSOR_PAGE_SIZE, DEFAULT_CACHE_TTL, DEFAULT_DATA_PAGE_SIZE, MIN_DATA_PAGE_SIZE},
	page_store::{PageStore, StorageError},
	tasks::TaskRunner,
	utils::arith,
};

const FRONT_DIR_NAME: &str = "front_index";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
	/// Size of one data page file. Must be a power of two; sizes below the
	/// 32 MiB production floor are accepted with a warning so small
	/// deployments and test suites can use tiny pages.
	pub data_page_size: u64,
	/// How long an unreferenced mapped page stays cached after its last
	/// access.
	pub cache_ttl: Duration,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			data_page_size: DEFAULT_DATA_PAGE_SIZE,
			cache_ttl: DEFAULT_CACHE_TTL,
		}
	}
}

/// The result a pending consumer receives once a record arrives.
pub type RecordCompletion = Completion<Result<Vec<u8>, StorageError>>;

struct Waiters {
	dequeue: VecDeque<RecordCompletion>,
	peek: VecDeque<RecordCompletion>,
}

/// A persistent FIFO queue of byte messages.
///
/// The queue overlays a persisted front cursor (its own single-slot page
/// stream) on a [`FastArray`]: `enqueue` appends to the array, `dequeue`
/// reads at the front cursor and advances it. Dequeue, truncation, flushing
/// and iteration share one queue mutex; enqueues are serialized by the
/// array's append mutex and may run concurrently with reads.
pub struct FastQueue {
	array: FastArray,
	front_store: PageStore,
	front: AtomicU64,
	queue_lock: Mutex<()>,
	waiters: Mutex<Waiters>,
}

assert_impl_all!(FastQueue: Send, Sync);

impl FastQueue {
	/// Opens (or creates) the queue `queue_name` under `queue_dir`. The
	/// queue state lives in `<queue_dir>/<queue_name>/` across the
	/// `data`, `meta`, `index` and `front_index` page streams.
	pub fn open(
		queue_dir: &Path,
		queue_name: &str,
		config: &QueueConfig,
		tasks: Arc<TaskRunner>,
	) -> Result<Self, StorageError> {
		if !config.data_page_size.is_power_of_two() {
			return Err(StorageError::PageSizeNotPowerOfTwo(config.data_page_size));
		}
		if config.data_page_size < MIN_DATA_PAGE_SIZE {
			warn!(
				"Data page size of {} bytes is below the recommended minimum of {} bytes",
				config.data_page_size, MIN_DATA_PAGE_SIZE
			);
		}

		let dir = queue_dir.join(queue_name);
		let array = FastArray::open(
			&dir,
			config.data_page_size,
			config.cache_ttl,
			Arc::clone(&tasks),
		)?;
		let front_store = PageStore::open(
			dir.join(FRONT_DIR_NAME),
			CURSOR_PAGE_SIZE,
			config.cache_ttl,
			tasks,
		)?;
		let front = read_cursor(&front_store)?;
		Ok(Self {
			array,
			front_store,
			front: AtomicU64::new(front),
			queue_lock: Mutex::new(()),
			waiters: Mutex::new(Waiters {
				dequeue: VecDeque::new(),
				peek: VecDeque::new(),
			}),
		})
	}

	/// Appends a message and wakes pending async consumers.
	pub fn enqueue(&self, bytes: &[u8]) -> Result<u64, StorageError> {
		let id = self.array.append(bytes)?;
		self.complete_waiters();
		Ok(id)
	}

	/// Removes and returns the front message, or `None` when the queue is
	/// empty. The new front cursor is persisted before it becomes visible.
	pub fn dequeue(&self) -> Result<Option<Vec<u8>>, StorageError> {
		let _guard = self.queue_lock.lock();
		let front = self.front.load(Ordering::Acquire);
		if front == self.array.head_index() {
			return Ok(None);
		}
		let bytes = self.array.get(front)?;
		let new_front = arith::wrap_add(front, 1);
		store_cursor(&self.front_store, new_front)?;
		self.front.store(new_front, Ordering::Release);
		Ok(Some(bytes))
	}

	/// Returns the front message without advancing the cursor.
	pub fn peek(&self) -> Result<Option<Vec<u8>>, StorageError> {
		let front = self.front.load(Ordering::Acquire);
		if front == self.array.head_index() {
			return Ok(None);
		}
		match self.array.get(front) {
			Ok(bytes) => Ok(Some(bytes)),
			// The record was dequeued between the emptiness check and the
			// read.
			Err(StorageError::OutOfBounds { .. }) => Ok(None),
			Err(error) => Err(error),
		}
	}

	/// Like [`dequeue`], but returns a one-shot completion. A non-empty
	/// queue settles it immediately; otherwise it is parked and settled by
	/// the next successful [`enqueue`]. Every call starts a fresh
	/// completion.
	///
	/// [`dequeue`]: FastQueue::dequeue
	/// [`enqueue`]: FastQueue::enqueue
	pub fn dequeue_async(&self) -> RecordCompletion {
		let completion = Completion::new();
		let mut waiters = self.waiters.lock();
		match self.dequeue() {
			Ok(Some(bytes)) => {
				completion.set(Ok(bytes));
			}
			Ok(None) => waiters.dequeue.push_back(completion.clone()),
			Err(error) => {
				completion.set_error(error);
			}
		}
		completion
	}

	/// Like [`peek`], but returns a one-shot completion with the same
	/// parking behavior as [`dequeue_async`].
	///
	/// [`peek`]: FastQueue::peek
	/// [`dequeue_async`]: FastQueue::dequeue_async
	pub fn peek_async(&self) -> RecordCompletion {
		let completion = Completion::new();
		let mut waiters = self.waiters.lock();
		match self.peek() {
			Ok(Some(bytes)) => {
				completion.set(Ok(bytes));
			}
			Ok(None) => waiters.peek.push_back(completion.clone()),
			Err(error) => {
				completion.set_error(error);
			}
		}
		completion
	}

	fn complete_waiters(&self) {
		let mut waiters = self.waiters.lock();
		if waiters.dequeue.is_empty() && waiters.peek.is_empty() {
			return;
		}

		// All parked peek waiters observe the same front record.
		if !waiters.peek.is_empty() {
			match self.peek() {
				Ok(Some(bytes)) => {
					for completion in waiters.peek.drain(..) {
						completion.set(Ok(bytes.clone()));
					}
				}
				Ok(None) => {}
				// Errors are not cloneable; the frontmost waiter reports it,
				// the rest stay parked for the next enqueue.
				Err(error) => {
					if let Some(completion) = waiters.peek.pop_front() {
						completion.set_error(error);
					}
				}
			}
		}

		// Each parked dequeue waiter consumes one available record, in
		// arrival order.
		while let Some(completion) = waiters.dequeue.pop_front() {
			if completion.is_cancelled() {
				continue;
			}
			match self.dequeue() {
				Ok(Some(bytes)) => {
					completion.set(Ok(bytes));
				}
				Ok(None) => {
					// Drained in the meantime; keep waiting.
					waiters.dequeue.push_front(completion);
					break;
				}
				Err(error) => {
					completion.set_error(error);
					break;
				}
			}
		}
	}

	/// Visits every pending message in order, front to head, without
	/// consuming anything.
	pub fn apply_for_each(
		&self,
		mut visitor: impl FnMut(&[u8]),
	) -> Result<(), StorageError> {
		let _guard = self.queue_lock.lock();
		let mut id = self.front.load(Ordering::Acquire);
		let head = self.array.head_index();
		while id != head {
			visitor(&self.array.get(id)?);
			id = arith::wrap_add(id, 1);
		}
		Ok(())
	}

	/// Number of pending messages.
	pub fn size(&self) -> u64 {
		arith::wrap_sub(
			self.array.head_index(),
			self.front.load(Ordering::Acquire),
		)
	}

	pub fn is_empty(&self) -> bool {
		self.size() == 0
	}

	/// Deletes every page file of the queue and resets both cursors to
	/// zero. The stream files are recreated (reading as zero) on the next
	/// enqueue.
	pub fn remove_all(&self) -> Result<(), StorageError> {
		let _guard = self.queue_lock.lock();
		self.array.remove_all()?;
		self.front_store.delete_all_pages()?;
		self.front.store(0, Ordering::Release);
		Ok(())
	}

	/// Reclaims the pages that only hold already-dequeued messages.
	pub fn gc(&self) -> Result<(), StorageError> {
		let before = arith::wrap_sub(self.front.load(Ordering::Acquire), 1);
		self.array.remove_before_index(before)
	}

	/// Total size in bytes of the queue's backing files on disk.
	pub fn disk_size(&self) -> Result<u64, StorageError> {
		Ok(self.array.disk_size()? + self.front_store.back_page_file_size()?)
	}

	pub fn flush(&self) -> Result<(), StorageError> {
		let _guard = self.queue_lock.lock();
		self.front_store.flush()?;
		self.array.flush()?;
		Ok(())
	}

	/// Cancels pending async consumers and releases every cached page. The
	/// queue must not be used afterwards.
	pub fn close(&self) -> Result<(), StorageError> {
		{
			let mut waiters = self.waiters.lock();
			let waiters = &mut *waiters;
			for completion in waiters.dequeue.drain(..).chain(waiters.peek.drain(..)) {
				completion.cancel();
			}
		}
		self.front_store.release_cached_pages()?;
		self.array.close()?;
		Ok(())
	}
}
