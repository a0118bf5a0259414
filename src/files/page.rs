use std::{
	cell::UnsafeCell,
	fs::File,
	marker::PhantomData,
	path::{Path, PathBuf},
	ptr::{self, NonNull},
	sync::atomic::{AtomicBool, Ordering},
	time::SystemTime,
};

use memmap2::MmapMut;
use parking_lot::Mutex;
use static_assertions::assert_impl_all;

use super::FileError;

/// Shared-mutable cell holding a mapping's base pointer.
///
/// The pointer is read lock-free whenever a view is created, and written
/// only while holding the page's map mutex during [`MappedPage::close`].
/// The owning cache closes a page only once its refcount has reached zero,
/// so no read can race the write; that protocol is what makes the
/// lock-free reads sound.
struct RegionCell(UnsafeCell<*mut u8>);

// Safety: the cell stores a bare pointer; all dereferencing happens at the
// call sites, which uphold the contract documented above.
unsafe impl Send for RegionCell {}
unsafe impl Sync for RegionCell {}

impl RegionCell {
	fn new(ptr: *mut u8) -> Self {
		Self(UnsafeCell::new(ptr))
	}

	fn get(&self) -> *mut u8 {
		// Safety: no write can be concurrent with this read, per the
		// contract above.
		unsafe { *self.0.get() }
	}

	fn set(&self, ptr: *mut u8) {
		// Safety: the caller holds the map mutex and no concurrent read
		// exists, per the contract above.
		unsafe { *self.0.get() = ptr }
	}
}

/// A fixed-size memory mapping over one page file.
///
/// The mapped bytes are shared: every [`PageView`] created from the same page
/// reads and writes the same region, and writes reach the file on [`flush`]
/// (or OS writeback). The page itself carries no locking for the byte range;
/// callers must coordinate so that a range is never written concurrently
/// with another access to it. A page must only be closed once no caller
/// holds a view into it anymore, which the owning cache guarantees through
/// refcounting.
///
/// [`flush`]: MappedPage::flush
pub(crate) struct MappedPage {
	index: u64,
	path: PathBuf,
	created_at: SystemTime,
	page_size: usize,
	// Base pointer of the live mapping; null once the page is closed. Kept
	// outside the mutex so views are created without blocking on
	// flush/close.
	region: RegionCell,
	map: Mutex<Option<MmapMut>>,
	dirty: AtomicBool,
}

assert_impl_all!(MappedPage: Send, Sync);

impl MappedPage {
	/// Maps `[0, page_size)` of the backing file. The file descriptor is
	/// closed again right away; the mapping outlives it.
	pub fn map(file: File, index: u64, path: PathBuf, page_size: u64) -> Result<Self, FileError> {
		// Safety: the underlying file is only resized by the folder that
		// created it, before mapping.
		let mut map = unsafe { MmapMut::map_mut(&file)? };
		drop(file);
		let region = RegionCell::new(map.as_mut_ptr());
		#[allow(clippy::cast_possible_truncation)]
		let page_size = page_size as usize;
		debug_assert_eq!(map.len(), page_size);
		Ok(Self {
			index,
			path,
			created_at: SystemTime::now(),
			page_size,
			region,
			map: Mutex::new(Some(map)),
			dirty: AtomicBool::new(false),
		})
	}

	pub fn index(&self) -> u64 {
		self.index
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn created_at(&self) -> SystemTime {
		self.created_at
	}

	pub fn is_dirty(&self) -> bool {
		self.dirty.load(Ordering::Acquire)
	}

	pub fn set_dirty(&self, dirty: bool) {
		self.dirty.store(dirty, Ordering::Release);
	}

	/// An independent byte cursor over the shared mapping, starting at
	/// `position`. Fails once the page is closed.
	pub fn view(&self, position: u64) -> Result<PageView<'_>, FileError> {
		let Some(region) = NonNull::new(self.region.get()) else {
			return Err(FileError::PageClosed);
		};
		#[allow(clippy::cast_possible_truncation)]
		let position = position as usize;
		assert!(position <= self.page_size);
		Ok(PageView {
			region,
			len: self.page_size,
			position,
			_page: PhantomData,
		})
	}

	/// Forces dirty bytes to stable storage and clears the dirty flag.
	/// A no-op when the page is clean or already closed.
	pub fn flush(&self) -> Result<(), FileError> {
		if !self.dirty.swap(false, Ordering::AcqRel) {
			return Ok(());
		}
		let map = self.map.lock();
		if let Some(map) = &*map {
			map.flush()?;
		}
		Ok(())
	}

	/// Unmaps the region. The page is unusable afterwards even when the
	/// final flush fails; closing twice is a no-op.
	pub fn close(&self) -> Result<(), FileError> {
		let mut slot = self.map.lock();
		self.region.set(ptr::null_mut());
		let Some(map) = slot.take() else {
			return Ok(());
		};
		let result = if self.dirty.swap(false, Ordering::AcqRel) {
			map.flush()
		} else {
			Ok(())
		};
		drop(map);
		result.map_err(FileError::from)
	}
}

/// A byte cursor over a mapped page.
///
/// Views created by separate [`MappedPage::view`] calls never share cursor
/// state, but all of them address the same bytes.
pub(crate) struct PageView<'a> {
	region: NonNull<u8>,
	len: usize,
	position: usize,
	_page: PhantomData<&'a MappedPage>,
}

impl PageView<'_> {
	pub fn position(&self) -> usize {
		self.position
	}

	pub fn remaining(&self) -> usize {
		self.len - self.position
	}

	pub fn read(&mut self, buf: &mut [u8]) {
		assert!(buf.len() <= self.remaining());
		// Safety: the range is inside the mapping, and the destination is a
		// distinct allocation.
		unsafe {
			ptr::copy_nonoverlapping(
				self.region.as_ptr().add(self.position),
				buf.as_mut_ptr(),
				buf.len(),
			);
		}
		self.position += buf.len();
	}

	pub fn write(&mut self, buf: &[u8]) {
		assert!(buf.len() <= self.remaining());
		// Safety: the range is inside the mapping, and the source is a
		// distinct allocation. Callers guarantee no concurrent access to the
		// written range.
		unsafe {
			ptr::copy_nonoverlapping(
				buf.as_ptr(),
				self.region.as_ptr().add(self.position),
				buf.len(),
			);
		}
		self.position += buf.len();
	}

	pub fn read_u64(&mut self) -> u64 {
		let mut buf = [0; 8];
		self.read(&mut buf);
		u64::from_le_bytes(buf)
	}

	pub fn write_u64(&mut self, value: u64) {
		self.write(&value.to_le_bytes());
	}
}

#[cfg(test)]
mod tests {
	use std::fs;

	use tempfile::tempdir;

	use crate::files::PageFolder;

	use super::*;

	fn open_page(folder: &PageFolder, index: u64, page_size: u64) -> MappedPage {
		let file = folder.open_page_file(index, page_size).unwrap();
		MappedPage::map(file, index, folder.page_file_path(index), page_size).unwrap()
	}

	#[test]
	fn writes_reach_the_file_on_flush() {
		// given
		let dir = tempdir().unwrap();
		let folder = PageFolder::open(dir.path().to_path_buf()).unwrap();
		let page = open_page(&folder, 0, 64);

		// when
		let mut view = page.view(3).unwrap();
		view.write(b"moin");
		page.set_dirty(true);
		page.flush().unwrap();

		// then
		let bytes = fs::read(folder.page_file_path(0)).unwrap();
		assert_eq!(&bytes[3..7], b"moin");
		assert!(!page.is_dirty());
		assert_eq!(page.index(), 0);
		assert!(page.created_at() <= SystemTime::now());
	}

	#[test]
	fn views_share_bytes_but_not_cursors() {
		// given
		let dir = tempdir().unwrap();
		let folder = PageFolder::open(dir.path().to_path_buf()).unwrap();
		let page = open_page(&folder, 0, 64);

		// when
		let mut writer = page.view(0).unwrap();
		let mut reader = page.view(0).unwrap();
		writer.write(b"tree");

		// then
		assert_eq!(writer.position(), 4);
		assert_eq!(reader.position(), 0);
		let mut buf = [0; 4];
		reader.read(&mut buf);
		assert_eq!(&buf, b"tree");
	}

	#[test]
	fn content_survives_remapping() {
		// given
		let dir = tempdir().unwrap();
		let folder = PageFolder::open(dir.path().to_path_buf()).unwrap();
		let page = open_page(&folder, 5, 64);
		page.view(0).unwrap().write(b"still here");
		page.set_dirty(true);
		page.close().unwrap();

		// when
		let reopened = open_page(&folder, 5, 64);

		// then
		let mut buf = [0; 10];
		reopened.view(0).unwrap().read(&mut buf);
		assert_eq!(&buf, b"still here");
	}

	#[test]
	fn closed_page_rejects_views() {
		// given
		let dir = tempdir().unwrap();
		let folder = PageFolder::open(dir.path().to_path_buf()).unwrap();
		let page = open_page(&folder, 0, 64);

		// when
		page.close().unwrap();

		// then
		assert!(matches!(page.view(0), Err(FileError::PageClosed)));
		// Closing twice is harmless
		page.close().unwrap();
	}

	#[test]
	fn cursor_tracks_remaining_space() {
		// given
		let dir = tempdir().unwrap();
		let folder = PageFolder::open(dir.path().to_path_buf()).unwrap();
		let page = open_page(&folder, 0, 16);

		// when
		let mut view = page.view(8).unwrap();

		// then
		assert_eq!(view.remaining(), 8);
		view.write_u64(u64::MAX);
		assert_eq!(view.remaining(), 0);
	}
}
