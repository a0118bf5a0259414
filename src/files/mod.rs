use std::{
	collections::BTreeSet,
	ffi::OsStr,
	fs::{self, File, OpenOptions},
	io,
	path::{Path, PathBuf},
	time::SystemTime,
};

use thiserror::Error;

pub(crate) mod page;

#[derive(Debug, Error)]
pub enum FileError {
	#[error("The page has been closed")]
	PageClosed,

	#[error(transparent)]
	Io(#[from] io::Error),
}

/// One directory of fixed-size page files, named `page-<index>.dat`.
///
/// The folder only deals in files and names; mapping, caching, and deletion
/// policy live in the page store.
pub(crate) struct PageFolder {
	path: PathBuf,
}

impl PageFolder {
	const PAGE_FILE_SUFFIX: &'static str = ".dat";

	pub fn open(path: PathBuf) -> Result<Self, FileError> {
		fs::create_dir_all(&path)?;
		Ok(Self { path })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn page_file_path(&self, index: u64) -> PathBuf {
		self.path
			.join(format!("page-{index}{}", Self::PAGE_FILE_SUFFIX))
	}

	/// The index encoded in a page file name, delimited by the last `-` and
	/// the `.dat` suffix. Returns `None` for foreign files.
	fn parse_page_file_name(name: &OsStr) -> Option<u64> {
		let name = name.to_str()?;
		let stem = name.strip_suffix(Self::PAGE_FILE_SUFFIX)?;
		let (_, digits) = stem.rsplit_once('-')?;
		digits.parse().ok()
	}

	/// Opens the backing file for a page in read-write mode, creating it on
	/// first use. The file length always equals the page size afterwards.
	pub fn open_page_file(&self, index: u64, page_size: u64) -> Result<File, FileError> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(false)
			.open(self.page_file_path(index))?;
		if file.metadata()?.len() != page_size {
			file.set_len(page_size)?;
		}
		Ok(file)
	}

	pub fn delete_page_file(&self, index: u64) -> Result<(), FileError> {
		fs::remove_file(self.page_file_path(index))?;
		Ok(())
	}

	pub fn last_modified(&self, index: u64) -> Result<SystemTime, FileError> {
		Ok(fs::metadata(self.page_file_path(index))?.modified()?)
	}

	/// Indices of all page files currently on disk. Foreign files are
	/// skipped.
	pub fn page_indices(&self) -> Result<BTreeSet<u64>, FileError> {
		let mut indices = BTreeSet::new();
		for entry in fs::read_dir(&self.path)? {
			let entry = entry?;
			if !entry.path().is_file() {
				continue;
			}
			if let Some(index) = Self::parse_page_file_name(&entry.file_name()) {
				indices.insert(index);
			}
		}
		Ok(indices)
	}

	/// Indices of all page files whose modification time is strictly before
	/// `timestamp`.
	pub fn page_indices_before(&self, timestamp: SystemTime) -> Result<BTreeSet<u64>, FileError> {
		let mut indices = BTreeSet::new();
		for entry in fs::read_dir(&self.path)? {
			let entry = entry?;
			if !entry.path().is_file() {
				continue;
			}
			let Some(index) = Self::parse_page_file_name(&entry.file_name()) else {
				continue;
			};
			if entry.metadata()?.modified()? < timestamp {
				indices.insert(index);
			}
		}
		Ok(indices)
	}

	pub fn page_files(&self) -> Result<Vec<PathBuf>, FileError> {
		Ok(self
			.page_indices()?
			.into_iter()
			.map(|index| self.page_file_path(index))
			.collect())
	}

	/// Total size in bytes of all page files in the folder.
	pub fn total_file_size(&self) -> Result<u64, FileError> {
		let mut total = 0;
		for path in self.page_files()? {
			total += fs::metadata(path)?.len();
		}
		Ok(total)
	}
}

#[cfg(test)]
mod tests {
	use std::{thread, time::Duration};

	use tempfile::tempdir;

	use super::*;

	#[test]
	fn creates_files_with_page_size() {
		// given
		let dir = tempdir().unwrap();
		let folder = PageFolder::open(dir.path().join("pages")).unwrap();

		// when
		let file = folder.open_page_file(3, 4096).unwrap();

		// then
		assert_eq!(file.metadata().unwrap().len(), 4096);
		assert!(dir.path().join("pages/page-3.dat").exists());
	}

	#[test]
	fn scans_page_indices_and_skips_foreign_files() {
		// given
		let dir = tempdir().unwrap();
		let folder = PageFolder::open(dir.path().to_path_buf()).unwrap();
		folder.open_page_file(0, 64).unwrap();
		folder.open_page_file(12, 64).unwrap();
		fs::write(dir.path().join("notes.txt"), b"moin").unwrap();
		fs::write(dir.path().join("page-x.dat"), b"tree").unwrap();

		// when
		let indices = folder.page_indices().unwrap();

		// then
		assert_eq!(indices, BTreeSet::from([0, 12]));
	}

	#[test]
	fn filters_page_indices_by_modification_time() {
		// given
		let dir = tempdir().unwrap();
		let folder = PageFolder::open(dir.path().to_path_buf()).unwrap();
		folder.open_page_file(0, 64).unwrap();
		thread::sleep(Duration::from_millis(30));
		let cutoff = SystemTime::now();
		thread::sleep(Duration::from_millis(30));
		folder.open_page_file(1, 64).unwrap();

		// when
		let indices = folder.page_indices_before(cutoff).unwrap();

		// then
		assert_eq!(indices, BTreeSet::from([0]));
	}

	#[test]
	fn sums_page_file_sizes() {
		// given
		let dir = tempdir().unwrap();
		let folder = PageFolder::open(dir.path().to_path_buf()).unwrap();
		folder.open_page_file(0, 128).unwrap();
		folder.open_page_file(1, 128).unwrap();

		// when
		let total = folder.total_file_size().unwrap();

		// then
		assert_eq!(total, 256);
	}

	#[test]
	fn deletes_page_files() {
		// given
		let dir = tempdir().unwrap();
		let folder = PageFolder::open(dir.path().to_path_buf()).unwrap();
		folder.open_page_file(7, 64).unwrap();

		// when
		folder.delete_page_file(7).unwrap();

		// then
		assert!(folder.page_indices().unwrap().is_empty());
	}
}
