use std::{
	mem,
	path::Path,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::{Duration, SystemTime},
};

use parking_lot::Mutex;
use static_assertions::{assert_impl_all, const_assert_eq};
use zerocopy::{
	byteorder::little_endian::{U32, U64},
	FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::{
	consts::{CURSOR_PAGE_SIZE, META_PAGE_SIZE, META_SLOT_SIZE},
	page_store::{PageStore, StorageError},
	tasks::TaskRunner,
	utils::{arith, now_millis, MIB},
};

const DATA_DIR_NAME: &str = "data";
const META_DIR_NAME: &str = "meta";
const INDEX_DIR_NAME: &str = "index";

/// Data page offsets are stored as u32, so one page can span at most 4 GiB.
const MAX_DATA_PAGE_SIZE: u64 = 4096 * MIB;

/// On-disk metadata slot of one record. Little-endian, padded to a
/// power-of-two size so the per-page slot count is a power of two as well.
#[derive(Debug, Clone, Immutable, KnownLayout, FromBytes, IntoBytes)]
#[repr(C)]
struct RecordMeta {
	data_page_index: U64,
	data_offset: U32,
	data_length: U32,
	timestamp_ms: U64,
	_reserved: [u8; 8],
}

const_assert_eq!(mem::size_of::<RecordMeta>() as u64, META_SLOT_SIZE);

impl RecordMeta {
	#[allow(clippy::cast_possible_truncation)]
	fn new(data_page_index: u64, data_offset: u64, data_length: u64, timestamp_ms: u64) -> Self {
		Self {
			data_page_index: U64::new(data_page_index),
			data_offset: U32::new(data_offset as u32),
			data_length: U32::new(data_length as u32),
			timestamp_ms: U64::new(timestamp_ms),
			_reserved: [0; 8],
		}
	}
}

/// Where the next appended record goes.
struct AppendCursor {
	data_page: u64,
	offset: u64,
}

/// A persistent array of variable-length records, addressed by a
/// monotonically increasing u64 id (wrapping after `u64::MAX`).
///
/// Records live across three parallel page streams in sibling directories:
/// raw payload bytes in `data/`, one fixed-size [`RecordMeta`] slot per
/// record in `meta/`, and the persisted head cursor in `index/`. Appends are
/// serialized by a mutex; any number of concurrent `get` calls are allowed
/// and take no locks beyond the page refcounts.
pub struct FastArray {
	data: PageStore,
	meta: PageStore,
	index: PageStore,
	/// log2 of the number of metadata slots per metadata page.
	meta_slots_shift: u32,
	/// log2 of the metadata slot size.
	meta_slot_size_shift: u32,
	head: AtomicU64,
	tail: AtomicU64,
	append: Mutex<AppendCursor>,
}

assert_impl_all!(FastArray: Send, Sync);

impl FastArray {
	/// Opens (or creates) the array stored under `dir`. An existing array is
	/// recovered from its index stream: the head cursor is read verbatim,
	/// the tail is the first id of the oldest surviving metadata page, and
	/// the append position is rebuilt from the last committed record.
	pub fn open(
		dir: &Path,
		data_page_size: u64,
		cache_ttl: Duration,
		tasks: Arc<TaskRunner>,
	) -> Result<Self, StorageError> {
		if data_page_size > MAX_DATA_PAGE_SIZE {
			return Err(StorageError::PageSizeTooLarge(data_page_size));
		}
		let data = PageStore::open(
			dir.join(DATA_DIR_NAME),
			data_page_size,
			cache_ttl,
			Arc::clone(&tasks),
		)?;
		let meta = PageStore::open(
			dir.join(META_DIR_NAME),
			META_PAGE_SIZE,
			cache_ttl,
			Arc::clone(&tasks),
		)?;
		let index = PageStore::open(dir.join(INDEX_DIR_NAME), CURSOR_PAGE_SIZE, cache_ttl, tasks)?;

		let meta_slots_shift = arith::shift_for(META_PAGE_SIZE / META_SLOT_SIZE);
		let head = read_cursor(&index)?;
		let tail = match meta.existing_back_file_index_set()?.first() {
			Some(&first_meta_page) => arith::mul(first_meta_page, meta_slots_shift),
			None => head,
		};

		let array = Self {
			data,
			meta,
			index,
			meta_slots_shift,
			meta_slot_size_shift: arith::shift_for(META_SLOT_SIZE),
			head: AtomicU64::new(head),
			tail: AtomicU64::new(tail),
			append: Mutex::new(AppendCursor {
				data_page: 0,
				offset: 0,
			}),
		};
		*array.append.lock() = array.restore_append_cursor()?;
		Ok(array)
	}

	fn restore_append_cursor(&self) -> Result<AppendCursor, StorageError> {
		let head = self.head.load(Ordering::Acquire);
		if head == self.tail.load(Ordering::Acquire) {
			return Ok(AppendCursor {
				data_page: 0,
				offset: 0,
			});
		}
		let last = self.read_meta(arith::wrap_sub(head, 1))?;
		Ok(AppendCursor {
			data_page: last.data_page_index.get(),
			offset: u64::from(last.data_offset.get()) + u64::from(last.data_length.get()),
		})
	}

	/// Appends a record and returns its id.
	///
	/// The payload is copied into the current tail data page (or the start
	/// of the next page when it no longer fits), its metadata slot is
	/// written, and only then is the head cursor advanced and persisted. A
	/// crash in between leaves the record invisible but the array
	/// consistent.
	pub fn append(&self, bytes: &[u8]) -> Result<u64, StorageError> {
		let length = bytes.len() as u64;
		let page_size = self.data.page_size();
		if length > page_size {
			return Err(StorageError::RecordTooLarge { length, page_size });
		}

		let mut cursor = self.append.lock();
		let id = self.head.load(Ordering::Acquire);

		// A record never straddles two data pages.
		if length > page_size - cursor.offset {
			cursor.data_page = arith::wrap_add(cursor.data_page, 1);
			cursor.offset = 0;
		}

		self.data.use_page(cursor.data_page, |page| {
			let mut view = page.view(cursor.offset)?;
			view.write(bytes);
			page.set_dirty(true);
			Ok(())
		})?;

		self.write_meta(
			id,
			RecordMeta::new(cursor.data_page, cursor.offset, length, now_millis()),
		)?;

		let new_head = arith::wrap_add(id, 1);
		store_cursor(&self.index, new_head)?;
		self.head.store(new_head, Ordering::Release);
		cursor.offset += length;
		Ok(id)
	}

	/// Copies the record with the given id out of its data page.
	pub fn get(&self, id: u64) -> Result<Vec<u8>, StorageError> {
		let tail = self.tail.load(Ordering::Acquire);
		let head = self.head.load(Ordering::Acquire);
		if !arith::wrap_contains(id, tail, head) {
			return Err(StorageError::OutOfBounds { id, tail, head });
		}

		let meta = self.read_meta(id)?;
		self.data.use_page(meta.data_page_index.get(), |page| {
			let mut view = page.view(u64::from(meta.data_offset.get()))?;
			let mut buf = vec![0; meta.data_length.get() as usize];
			view.read(&mut buf);
			Ok(buf)
		})
	}

	pub fn size(&self) -> u64 {
		arith::wrap_sub(
			self.head.load(Ordering::Acquire),
			self.tail.load(Ordering::Acquire),
		)
	}

	pub fn head_index(&self) -> u64 {
		self.head.load(Ordering::Acquire)
	}

	pub fn tail_index(&self) -> u64 {
		self.tail.load(Ordering::Acquire)
	}

	/// Reclaims the pages that only hold records before `id`: every data
	/// page strictly below the one holding `id`, and every metadata page
	/// strictly below the one holding `id`'s slot. The tail advances to the
	/// first id of the surviving metadata page. Out-of-range ids are
	/// ignored.
	pub fn remove_before_index(&self, id: u64) -> Result<(), StorageError> {
		let tail = self.tail.load(Ordering::Acquire);
		let head = self.head.load(Ordering::Acquire);
		if !arith::wrap_contains(id, tail, head) {
			return Ok(());
		}

		let meta = self.read_meta(id)?;
		self.data
			.delete_pages_before_index(meta.data_page_index.get())?;
		let meta_page = arith::div(id, self.meta_slots_shift);
		self.meta.delete_pages_before_index(meta_page)?;
		self.tail
			.store(arith::mul(meta_page, self.meta_slots_shift), Ordering::Release);
		Ok(())
	}

	/// Reclaims the pages of every record whose metadata page was last
	/// modified strictly before `timestamp`. The newest such metadata page
	/// defines the truncation boundary; nothing happens when there is none.
	pub fn remove_before_timestamp(&self, timestamp: SystemTime) -> Result<(), StorageError> {
		if let Some(meta_page) = self.meta.first_page_index_before(timestamp)? {
			self.remove_before_index(arith::mul(meta_page, self.meta_slots_shift))?;
		}
		Ok(())
	}

	/// Total size in bytes of the backing files of all three streams.
	pub fn disk_size(&self) -> Result<u64, StorageError> {
		Ok(self.data.back_page_file_size()?
			+ self.meta.back_page_file_size()?
			+ self.index.back_page_file_size()?)
	}

	/// Deletes every page in all three streams and resets the array to
	/// empty. The cursors are reset in memory only; the stream files are
	/// recreated (reading as zero) on the next append.
	pub fn remove_all(&self) -> Result<(), StorageError> {
		let mut cursor = self.append.lock();
		self.data.delete_all_pages()?;
		self.meta.delete_all_pages()?;
		self.index.delete_all_pages()?;
		self.head.store(0, Ordering::Release);
		self.tail.store(0, Ordering::Release);
		*cursor = AppendCursor {
			data_page: 0,
			offset: 0,
		};
		Ok(())
	}

	pub fn flush(&self) -> Result<(), StorageError> {
		self.data.flush()?;
		self.meta.flush()?;
		self.index.flush()?;
		Ok(())
	}

	pub fn close(&self) -> Result<(), StorageError> {
		self.data.release_cached_pages()?;
		self.meta.release_cached_pages()?;
		self.index.release_cached_pages()?;
		Ok(())
	}

	fn meta_slot(&self, id: u64) -> (u64, u64) {
		let page = arith::div(id, self.meta_slots_shift);
		let offset = arith::mul(
			arith::modulo(id, self.meta_slots_shift),
			self.meta_slot_size_shift,
		);
		(page, offset)
	}

	fn read_meta(&self, id: u64) -> Result<RecordMeta, StorageError> {
		let (page_index, offset) = self.meta_slot(id);
		self.meta.use_page(page_index, |page| {
			let mut buf = [0; META_SLOT_SIZE as usize];
			page.view(offset)?.read(&mut buf);
			Ok(RecordMeta::read_from_bytes(&buf).unwrap())
		})
	}

	fn write_meta(&self, id: u64, meta: RecordMeta) -> Result<(), StorageError> {
		let (page_index, offset) = self.meta_slot(id);
		self.meta.use_page(page_index, |page| {
			page.view(offset)?.write(meta.as_bytes());
			page.set_dirty(true);
			Ok(())
		})
	}
}

/// Reads the single u64 slot of a one-slot cursor stream (head or front
/// cursor). A freshly created page reads as zero.
pub(crate) fn read_cursor(store: &PageStore) -> Result<u64, StorageError> {
	store.use_page(0, |page| Ok(page.view(0)?.read_u64()))
}

/// Writes the single u64 slot of a one-slot cursor stream.
pub(crate) fn store_cursor(store: &PageStore, value: u64) -> Result<(), StorageError> {
	store.use_page(0, |page| {
		let mut view = page.view(0)?;
		view.write_u64(value);
		page.set_dirty(true);
		Ok(())
	})
}
