//! `ShadowFile`: a page-granular copy-on-first-write undo log.
//!
//! Entries are appended `[page_offset: u64 BE][page_bytes; PAGE_SIZE]`, with a tiny header at
//! offset 0 recording how many entries are valid. The header is written *after* the entry bytes
//! it counts (payload first, count pointer last) so that a crash mid-append leaves the header
//! under-counting rather than pointing past garbage.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::Result;
use crate::io::file::{AnyFile, FileOpenKind};
use crate::io::RandomAccessFile;

pub const SHADOW_PAGE_SIZE: u64 = 1 << 14; // 16 KiB

const HEADER_SIZE: u64 = 8;
const ENTRY_SIZE: u64 = 8 + SHADOW_PAGE_SIZE;

pub struct ShadowFile {
    path: PathBuf,
    file: AnyFile,
    entry_count: Mutex<u64>,
    shadowed_pages: Mutex<HashSet<u64>>,
}

impl ShadowFile {
    /// Create a fresh, empty shadow file at `path`. `path` must not already hold a live shadow.
    pub fn create(path: &Path) -> Result<Self> {
        let file = AnyFile::open(FileOpenKind::ReadWrite { mapped: false }, path)?;
        file.ensure_length(HEADER_SIZE)?;
        file.write_i64_at(0, 0)?;
        file.synch()?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            entry_count: Mutex::new(0),
            shadowed_pages: Mutex::new(HashSet::new()),
        })
    }

    fn page_index(offset: u64) -> u64 {
        offset / SHADOW_PAGE_SIZE
    }

    /// Shadow every page overlapping `[orig_offset, orig_offset + len)` that has not already
    /// been shadowed this commit cycle, reading the *current* (pre-write) bytes from `data_file`.
    #[tracing::instrument(skip(self, data_file))]
    pub fn copy(&self, data_file: &dyn RandomAccessFile, orig_offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let first_page = Self::page_index(orig_offset);
        let last_page = Self::page_index(orig_offset + len - 1);
        let data_len = data_file.len()?;

        for page_idx in first_page..=last_page {
            {
                let shadowed = self.shadowed_pages.lock();
                if shadowed.contains(&page_idx) {
                    continue;
                }
            }

            let page_offset = page_idx * SHADOW_PAGE_SIZE;
            let mut buf = vec![0u8; SHADOW_PAGE_SIZE as usize];
            if page_offset < data_len {
                let avail = (data_len - page_offset).min(SHADOW_PAGE_SIZE) as usize;
                data_file.read_exact_at(&mut buf[..avail], page_offset)?;
            }

            let mut count = self.entry_count.lock();
            let entry_offset = HEADER_SIZE + *count * ENTRY_SIZE;
            self.file
                .write_all_at(&page_offset.to_be_bytes(), entry_offset)?;
            self.file.write_all_at(&buf, entry_offset + 8)?;
            *count += 1;
            self.file.write_i64_at(*count as i64, 0)?;

            self.shadowed_pages.lock().insert(page_idx);
            tracing::trace!(page_idx, "shadowed page");
        }

        Ok(())
    }

    pub fn synch(&self) -> Result<()> {
        self.file.synch()
    }

    pub fn close(&self) -> Result<()> {
        self.synch()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total bytes shadowed so far.
    pub fn saved_length(&self) -> u64 {
        *self.entry_count.lock() * SHADOW_PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        *self.entry_count.lock() == 0
    }

    /// Discard the shadow without replaying it (used by a clean commit/close).
    pub fn discard(self) -> Result<()> {
        drop(self.file);
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Replay every entry in the shadow at `shadow_path` back over `data_path`, then delete the
    /// shadow. Used on `open` when the header was observed with `ISSAVED=0` in incremental mode.
    #[tracing::instrument]
    pub fn restore_file(shadow_path: &Path, data_path: &Path) -> Result<()> {
        let shadow = AnyFile::open(FileOpenKind::ReadOnly, shadow_path)?;
        let data_file = AnyFile::open(FileOpenKind::ReadWrite { mapped: false }, data_path)?;

        let entry_count = shadow.read_i64_at(0)? as u64;
        let mut buf = vec![0u8; SHADOW_PAGE_SIZE as usize];
        for i in 0..entry_count {
            let entry_offset = HEADER_SIZE + i * ENTRY_SIZE;
            let page_offset = shadow.read_i64_at(entry_offset)? as u64;
            shadow.read_exact_at(&mut buf, entry_offset + 8)?;
            data_file.ensure_length(page_offset + SHADOW_PAGE_SIZE)?;
            data_file.write_all_at(&buf, page_offset)?;
            tracing::debug!(page_offset, "restored shadow page");
        }
        data_file.synch()?;
        drop(shadow);
        fs::remove_file(shadow_path)?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    fn make_data_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn copy_shadows_each_page_once() {
        let dir = tempdir().unwrap();
        let data_path = make_data_file(dir.path(), "t.data", &vec![1u8; SHADOW_PAGE_SIZE as usize * 2]);
        let data_file = AnyFile::open(FileOpenKind::ReadWrite { mapped: false }, &data_path).unwrap();

        let shadow_path = dir.path().join("t.backup");
        let shadow = ShadowFile::create(&shadow_path).unwrap();

        shadow.copy(&data_file, 0, 10).unwrap();
        assert_eq!(shadow.saved_length(), SHADOW_PAGE_SIZE);

        // Same page again: no-op.
        shadow.copy(&data_file, 5, 10).unwrap();
        assert_eq!(shadow.saved_length(), SHADOW_PAGE_SIZE);

        // A write spanning into the second page shadows it too.
        shadow.copy(&data_file, SHADOW_PAGE_SIZE - 5, 10).unwrap();
        assert_eq!(shadow.saved_length(), SHADOW_PAGE_SIZE * 2);
    }

    #[test]
    fn restore_undoes_overwrite() {
        let dir = tempdir().unwrap();
        let original = vec![0xAAu8; SHADOW_PAGE_SIZE as usize];
        let data_path = make_data_file(dir.path(), "t.data", &original);
        let data_file = AnyFile::open(FileOpenKind::ReadWrite { mapped: false }, &data_path).unwrap();

        let shadow_path = dir.path().join("t.backup");
        let shadow = ShadowFile::create(&shadow_path).unwrap();
        shadow.copy(&data_file, 100, 4).unwrap();
        shadow.synch().unwrap();

        // Simulate the write that followed the shadow copy.
        data_file.write_all_at(b"AAAA", 100).unwrap();
        data_file.synch().unwrap();
        drop(data_file);

        ShadowFile::restore_file(&shadow_path, &data_path).unwrap();
        assert!(!shadow_path.exists());

        let restored = fs::read(&data_path).unwrap();
        assert_eq!(&restored[100..104], &[0xAA, 0xAA, 0xAA, 0xAA]);
    }

    #[test]
    fn copy_past_eof_shadows_zeroes() {
        let dir = tempdir().unwrap();
        let data_path = make_data_file(dir.path(), "t.data", &[]);
        let data_file = AnyFile::open(FileOpenKind::ReadWrite { mapped: false }, &data_path).unwrap();

        let shadow_path = dir.path().join("t.backup");
        let shadow = ShadowFile::create(&shadow_path).unwrap();
        shadow.copy(&data_file, 0, 32).unwrap();
        assert_eq!(shadow.saved_length(), SHADOW_PAGE_SIZE);
    }
}
