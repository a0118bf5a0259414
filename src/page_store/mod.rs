use std::{
	collections::{BTreeSet, HashMap},
	io,
	path::{Path, PathBuf},
	sync::Arc,
	thread,
	time::{Duration, SystemTime},
};

use log::warn;
use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use thiserror::Error;

use crate::{
	consts::{DELETE_RETRY_PAUSE, DELETE_RETRY_ROUNDS},
	files::{page::MappedPage, FileError, PageFolder},
	tasks::TaskRunner,
};

use cache::{Closeable, RefTtlCache};

pub(crate) mod cache;

#[derive(Debug, Error)]
pub enum StorageError {
	#[error("Record {id} is outside the live range [{tail}, {head})")]
	OutOfBounds { id: u64, tail: u64, head: u64 },

	#[error("A record of {length} bytes does not fit a data page of {page_size} bytes")]
	RecordTooLarge { length: u64, page_size: u64 },

	#[error("Invalid page size {0}: must be a power of two")]
	PageSizeNotPowerOfTwo(u64),

	#[error("Invalid data page size {0}: record offsets are 32-bit, pages can span at most 4 GiB")]
	PageSizeTooLarge(u64),

	#[error(transparent)]
	File(#[from] FileError),
}

impl Closeable for MappedPage {
	fn close(&self) -> Result<(), FileError> {
		MappedPage::close(self)
	}
}

/// Factory for the mapped pages of one page stream.
///
/// Owns one directory and one `(page_size, ttl)` pair. Pages are mapped
/// lazily on first acquire and kept in a [`RefTtlCache`]; callers must pair
/// every [`acquire_page`] with a [`release_page`] once they are done with
/// the returned handle.
///
/// [`acquire_page`]: PageStore::acquire_page
/// [`release_page`]: PageStore::release_page
pub(crate) struct PageStore {
	folder: PageFolder,
	page_size: u64,
	ttl: Duration,
	cache: RefTtlCache<u64, MappedPage>,
	// Per-index creation locks, so concurrent acquires of the same missing
	// page map it exactly once without serializing unrelated creations.
	creation_locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

assert_impl_all!(PageStore: Send, Sync);

impl PageStore {
	pub fn open(
		dir: PathBuf,
		page_size: u64,
		ttl: Duration,
		tasks: Arc<TaskRunner>,
	) -> Result<Self, StorageError> {
		if !page_size.is_power_of_two() {
			return Err(StorageError::PageSizeNotPowerOfTwo(page_size));
		}
		Ok(Self {
			folder: PageFolder::open(dir)?,
			page_size,
			ttl,
			cache: RefTtlCache::new(tasks),
			creation_locks: Mutex::new(HashMap::new()),
		})
	}

	/// Returns the mapped page at `index`, mapping it first when necessary.
	/// At most one mapping operation runs per index at any time.
	pub fn acquire_page(&self, index: u64) -> Result<Arc<MappedPage>, StorageError> {
		if let Some(page) = self.cache.get(&index) {
			return Ok(page);
		}

		let creation_lock = Arc::clone(self.creation_locks.lock().entry(index).or_default());
		let guard = creation_lock.lock();
		let result = self.map_page(index);
		drop(guard);
		self.creation_locks.lock().remove(&index);
		result
	}

	fn map_page(&self, index: u64) -> Result<Arc<MappedPage>, StorageError> {
		// A concurrent acquire may have mapped the page while we waited for
		// the creation lock.
		if let Some(page) = self.cache.get(&index) {
			return Ok(page);
		}
		let file = self.folder.open_page_file(index, self.page_size)?;
		let page = Arc::new(MappedPage::map(
			file,
			index,
			self.folder.page_file_path(index),
			self.page_size,
		)?);
		self.cache.put(index, Arc::clone(&page), self.ttl);
		Ok(page)
	}

	pub fn release_page(&self, index: u64) {
		self.cache.release(&index);
	}

	/// Acquires the page at `index`, runs `handler` on it, and releases it
	/// again regardless of the outcome.
	pub fn use_page<T>(
		&self,
		index: u64,
		handler: impl FnOnce(&MappedPage) -> Result<T, StorageError>,
	) -> Result<T, StorageError> {
		let page = self.acquire_page(index)?;
		let result = handler(&page);
		self.release_page(index);
		result
	}

	/// Closes every cached page. Callers synchronize externally; concurrent
	/// acquires would observe closed pages.
	pub fn release_cached_pages(&self) -> Result<(), StorageError> {
		self.cache.remove_all()?;
		Ok(())
	}

	/// Evicts the page from the cache and deletes its backing file. Busy
	/// files are retried a bounded number of times, then abandoned with a
	/// warning; a file that is already gone counts as deleted.
	pub fn delete_page(&self, index: u64) -> Result<(), StorageError> {
		self.cache.remove(&index)?;

		let mut rounds = DELETE_RETRY_ROUNDS;
		loop {
			match self.folder.delete_page_file(index) {
				Ok(()) => return Ok(()),
				Err(FileError::Io(error)) if error.kind() == io::ErrorKind::NotFound => {
					return Ok(())
				}
				Err(FileError::Io(error)) if is_busy(&error) => {
					rounds -= 1;
					if rounds == 0 {
						warn!(
							"Giving up on deleting busy page file {}: {error}",
							self.folder.page_file_path(index).display()
						);
						return Ok(());
					}
					thread::sleep(DELETE_RETRY_PAUSE);
				}
				Err(error) => return Err(error.into()),
			}
		}
	}

	pub fn delete_pages(&self, indices: &BTreeSet<u64>) -> Result<(), StorageError> {
		for &index in indices {
			self.delete_page(index)?;
		}
		Ok(())
	}

	pub fn delete_all_pages(&self) -> Result<(), StorageError> {
		self.delete_pages(&self.folder.page_indices()?)
	}

	pub fn delete_pages_before(&self, timestamp: SystemTime) -> Result<(), StorageError> {
		self.delete_pages(&self.folder.page_indices_before(timestamp)?)
	}

	pub fn delete_pages_before_index(&self, index: u64) -> Result<(), StorageError> {
		let before = self
			.folder
			.page_indices()?
			.into_iter()
			.take_while(|&existing| existing < index)
			.collect();
		self.delete_pages(&before)
	}

	pub fn existing_back_file_index_set(&self) -> Result<BTreeSet<u64>, StorageError> {
		Ok(self.folder.page_indices()?)
	}

	pub fn page_index_set_before(
		&self,
		timestamp: SystemTime,
	) -> Result<BTreeSet<u64>, StorageError> {
		Ok(self.folder.page_indices_before(timestamp)?)
	}

	/// The largest page index whose file was last modified strictly before
	/// `timestamp`. The name is historical; "first" refers to the first
	/// candidate when walking newest to oldest.
	pub fn first_page_index_before(
		&self,
		timestamp: SystemTime,
	) -> Result<Option<u64>, StorageError> {
		Ok(self
			.folder
			.page_indices_before(timestamp)?
			.into_iter()
			.next_back())
	}

	pub fn flush(&self) -> Result<(), StorageError> {
		for page in self.cache.values() {
			page.flush()?;
		}
		Ok(())
	}

	pub fn cache_size(&self) -> usize {
		self.cache.size()
	}

	pub fn page_size(&self) -> u64 {
		self.page_size
	}

	pub fn page_dir(&self) -> &Path {
		self.folder.path()
	}

	pub fn page_file_last_modified_time(&self, index: u64) -> Result<SystemTime, StorageError> {
		Ok(self.folder.last_modified(index)?)
	}

	pub fn back_page_file_set(&self) -> Result<Vec<PathBuf>, StorageError> {
		Ok(self.folder.page_files()?)
	}

	pub fn back_page_file_size(&self) -> Result<u64, StorageError> {
		Ok(self.folder.total_file_size()?)
	}
}

fn is_busy(error: &io::Error) -> bool {
	// EBUSY on unix; sharing violations surface as PermissionDenied on
	// windows.
	matches!(
		error.kind(),
		io::ErrorKind::ResourceBusy | io::ErrorKind::PermissionDenied
	)
}
