//! `DataFileCache`: open/close/commit lifecycle, header and flag maintenance, and the single
//! entry point through which every read or write of the data file passes.
//!
//! A single `parking_lot::RwLock` guards all mutable state. A cache hit is served under the read
//! guard; a miss (or any mutation) escalates to the write guard and rechecks the cache before
//! touching disk, the same double-checked-locking shape used anywhere a cache sits in front of a
//! more expensive lookup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backup::BackupManager;
use crate::cache::ObjectCache;
use crate::config::PageStoreConfig;
use crate::error::{Error, Result};
use crate::flags::HeaderFlags;
use crate::freespace::{BlocksFreeSpaceManager, FreeSpaceManager, SimpleFreeSpaceManager, Tail};
use crate::header::FileHeader;
use crate::io::file::{AnyFile, FileOpenKind};
use crate::io::RandomAccessFile;
use crate::scale::{DataFileScale, ROW_RECORD_HEADER_BYTES};
use crate::shadow::ShadowFile;
use crate::store::CachedObject;

fn backup_path_for(data_path: &Path) -> PathBuf {
    let mut p = data_path.as_os_str().to_owned();
    p.push(".backup");
    PathBuf::from(p)
}

fn shadow_path_for(data_path: &Path) -> PathBuf {
    backup_path_for(data_path)
}

struct Inner {
    file: AnyFile,
    header: FileHeader,
    shadow: Option<ShadowFile>,
    free_space: Box<dyn FreeSpaceManager>,
    cache: ObjectCache,
    file_modified: bool,
    cache_modified: bool,
    row_buf: Vec<u8>,
}

/// Lets the free-space managers grow or retract the file tail without owning the file or header
/// themselves.
struct TailCursor<'a> {
    header: &'a mut FileHeader,
    file: &'a dyn RandomAccessFile,
    scale: DataFileScale,
    max_size: u64,
}

impl Tail for TailCursor<'_> {
    fn position(&self) -> u64 {
        self.scale.to_pos(self.header.file_free_position)
    }

    fn grow(&mut self, new_tail_units: u64) -> Result<u64> {
        let old_units = self.position();
        let new_bytes = self.scale.to_offset(new_tail_units);
        if new_bytes > self.max_size {
            return Err(Error::FileFull { max_size: self.max_size });
        }
        self.file.ensure_length(new_bytes)?;
        self.header.file_free_position = new_bytes;
        Ok(old_units)
    }

    fn shrink(&mut self, new_tail_units: u64) {
        self.header.file_free_position = self.scale.to_offset(new_tail_units);
    }
}

pub struct DataFileCache {
    data_path: PathBuf,
    config: PageStoreConfig,
    backup: BackupManager,
    inner: RwLock<Inner>,
}

impl DataFileCache {
    /// Open (creating if absent) the data file at `data_path`, running crash recovery first if
    /// the header indicates the previous session did not commit cleanly.
    #[tracing::instrument(skip(config, data_path))]
    pub fn open(data_path: impl Into<PathBuf>, config: PageStoreConfig) -> Result<Self> {
        let data_path = data_path.into();
        let backup_path = backup_path_for(&data_path);
        let backup = BackupManager::new(config.increment_backup);

        let is_new = !data_path.exists();

        if !is_new {
            let probe = AnyFile::open(FileOpenKind::ReadOnly, &data_path)?;
            let header = FileHeader::read(&probe)?;
            drop(probe);

            if header.flags.contains(HeaderFlags::WRONG_VERSION) {
                return Err(Error::WrongVersion);
            }

            let is_saved = header.flags.contains(HeaderFlags::ISSAVED);
            if is_saved && backup_path.exists() {
                if config.increment_backup {
                    backup.discard(&backup_path)?;
                } else {
                    tracing::trace!("keeping full backup across clean restart");
                }
            } else if !is_saved {
                tracing::warn!("prior session left the store dirty, running recovery");
                if backup_path.exists() {
                    if config.increment_backup {
                        backup.apply_incremental(&shadow_path_for(&data_path), &data_path)?;
                    } else {
                        backup.restore_full_backup(&backup_path, &data_path)?;
                    }
                }
            }
        }

        let file = AnyFile::open(
            FileOpenKind::ReadWrite { mapped: config.nio_data_file },
            &data_path,
        )?;

        if is_new {
            let h = FileHeader {
                lost_space_size: 0,
                file_free_position: config.data_file_scale.min_initial_free_pos(),
                space_manager_position: 0,
                flags: HeaderFlags::ISSAVED | HeaderFlags::V_NEW,
            };
            file.ensure_length(h.file_free_position)?;
            h.write(&file)?;
            file.synch()?;
            tracing::info!(path = %data_path.display(), "initialised new data file");
        }

        // Every open marks the file dirty on disk until the next commit, so a crash any time
        // before that commit is detected (and recovery run) on the following open.
        let mut header = FileHeader::read(&file)?;
        header.flags = HeaderFlags::with_flag(&file, |f| f.difference(HeaderFlags::ISSAVED))?;
        file.synch()?;

        let shadow = if config.increment_backup {
            Some(ShadowFile::create(&shadow_path_for(&data_path))?)
        } else {
            None
        };

        let free_space: Box<dyn FreeSpaceManager> = if config.file_spaces {
            Box::new(BlocksFreeSpaceManager::open(
                &file,
                config.data_file_scale,
                header.space_manager_position,
            )?)
        } else {
            Box::new(SimpleFreeSpaceManager::new())
        };

        let cache = ObjectCache::new(config.cache_max_rows, config.cache_max_size);

        Ok(Self {
            data_path,
            backup,
            inner: RwLock::new(Inner {
                file,
                header,
                shadow,
                free_space,
                cache,
                file_modified: false,
                cache_modified: false,
                row_buf: Vec::new(),
            }),
            config,
        })
    }

    /// In-memory bookkeeping only: the on-disk `ISSAVED` bit was already cleared at `open`, so a
    /// commit that finds nothing changed can skip rewriting header and free-space metadata.
    fn mark_file_modified(inner: &mut Inner) {
        inner.file_modified = true;
    }

    /// Read-through lookup: a hit is served without ever taking the write lock.
    #[tracing::instrument(skip(self, decode))]
    pub fn get(
        &self,
        pos: u64,
        size: Option<u32>,
        decode: impl FnOnce(&[u8]) -> Arc<CachedObject>,
    ) -> Result<Arc<CachedObject>> {
        {
            let inner = self.inner.read();
            if let Some(obj) = inner.cache.get(pos) {
                return Ok(obj);
            }
        }

        let mut inner = self.inner.write();
        if let Some(obj) = inner.cache.get(pos) {
            return Ok(obj);
        }

        self.read_from_file(&mut inner, pos, size, decode)
    }

    /// Every on-disk row record opens with a 4-byte big-endian total size (itself included); a
    /// caller that already knows the payload length may pass it via `size` to skip that read, but
    /// the payload itself always starts 4 bytes past `pos*scale` either way.
    fn read_from_file(
        &self,
        inner: &mut Inner,
        pos: u64,
        size: Option<u32>,
        decode: impl FnOnce(&[u8]) -> Arc<CachedObject>,
    ) -> Result<Arc<CachedObject>> {
        let record_offset = self.config.data_file_scale.to_offset(pos);
        let payload_len = match size {
            Some(s) => s as u64,
            None => {
                let record_len = inner.file.read_i32_at(record_offset)?;
                if record_len < ROW_RECORD_HEADER_BYTES as i32 {
                    return Err(Error::data_file(format!(
                        "corrupt row size prefix {record_len} at position {pos}"
                    )));
                }
                record_len as u64 - ROW_RECORD_HEADER_BYTES
            }
        };
        let payload_offset = record_offset + ROW_RECORD_HEADER_BYTES;
        let mut buf = vec![0u8; payload_len as usize];
        inner.file.read_exact_at(&mut buf, payload_offset)?;

        let obj = decode(&buf);
        match inner.cache.put(obj.clone(), inner.shadow.as_ref(), &inner.file, self.config.data_file_scale) {
            Ok(()) => Ok(obj),
            Err(Error::OutOfMemory) => {
                inner.cache.force_clean_up(inner.shadow.as_ref(), &inner.file, self.config.data_file_scale)?;
                inner
                    .cache
                    .put(obj.clone(), inner.shadow.as_ref(), &inner.file, self.config.data_file_scale)?;
                Ok(obj)
            }
            Err(e) => Err(e),
        }
    }

    /// Allocate space for a new row and insert it into the cache, dirty. The allocated footprint
    /// accounts for the 4-byte size prefix every record carries on disk, not just the payload.
    #[tracing::instrument(skip(self, payload))]
    pub fn add(&self, payload: Vec<u8>, as_block: bool) -> Result<Arc<CachedObject>> {
        let mut inner = self.inner.write();
        let scale = self.config.data_file_scale;
        let record_len = payload.len() as u64 + ROW_RECORD_HEADER_BYTES;
        let size_units = (scale.pad_row_size(record_len as u32) as u64).div_ceil(scale.get() as u64).max(1);

        let pos = {
            let max_size = self.config.max_data_file_size();
            let inner = &mut *inner;
            let mut cursor = TailCursor {
                header: &mut inner.header,
                file: &inner.file,
                scale,
                max_size,
            };
            inner.free_space.get_file_position(size_units, as_block, &mut cursor)?
        };

        let obj = Arc::new(CachedObject::new(pos, payload));
        obj.mark_dirty();
        Self::mark_file_modified(&mut inner);
        inner.cache_modified = true;
        inner.cache.put(obj.clone(), inner.shadow.as_ref(), &inner.file, scale)?;
        Ok(obj)
    }

    /// Overwrite the bytes of an already-cached row in place.
    #[tracing::instrument(skip(self, payload))]
    pub fn save_row(&self, pos: u64, payload: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.write();
        let obj = inner
            .cache
            .get(pos)
            .ok_or_else(|| Error::data_file(format!("no cached row at position {pos}")))?;
        obj.replace_payload(payload);
        obj.mark_dirty();
        Self::mark_file_modified(&mut inner);
        inner.cache_modified = true;
        Ok(())
    }

    /// Remove a row from the cache and release its space. Both branches size the release in terms
    /// of the full on-disk record (payload plus its 4-byte size prefix), matching how `add`
    /// sized the original allocation.
    #[tracing::instrument(skip(self))]
    pub fn remove(&self, pos: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let scale = self.config.data_file_scale;
        let size_units = match inner.cache.remove(pos) {
            Some(obj) => {
                let record_len = obj.size() as u64 + ROW_RECORD_HEADER_BYTES;
                (scale.pad_row_size(record_len as u32) as u64).div_ceil(scale.get() as u64).max(1)
            }
            None => {
                let offset = scale.to_offset(pos);
                let record_len = inner.file.read_i32_at(offset)? as u64;
                record_len.div_ceil(scale.get() as u64).max(1)
            }
        };

        Self::mark_file_modified(&mut inner);
        let max_size = self.config.max_data_file_size();
        let inner = &mut *inner;
        let mut cursor = TailCursor {
            header: &mut inner.header,
            file: &inner.file,
            scale,
            max_size,
        };
        inner.free_space.release(pos, size_units, &mut cursor);
        inner.cache_modified = true;
        Ok(())
    }

    pub fn release_range(&self, start: u64, limit: u64) {
        self.inner.write().cache.remove_range(start, limit);
    }

    #[tracing::instrument(skip(self))]
    pub fn enlarge_file_space(&self, delta_units: u64) -> Result<u64> {
        let mut inner = self.inner.write();
        let scale = self.config.data_file_scale;
        let max_size = self.config.max_data_file_size();
        let current_units = scale.to_pos(inner.header.file_free_position);
        let inner = &mut *inner;
        let mut cursor = TailCursor {
            header: &mut inner.header,
            file: &inner.file,
            scale,
            max_size,
        };
        cursor.grow(current_units + delta_units)
    }

    /// Flush dirty rows, persist header state, sync, and drop the shadow. Never errors on a
    /// caller-visible `close(false)` path (see `close`); `commit` itself can fail.
    #[tracing::instrument(skip(self))]
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.write();
        self.commit_locked(&mut inner)
    }

    fn commit_locked(&self, inner: &mut Inner) -> Result<()> {
        let scale = self.config.data_file_scale;
        let mut dirty: Vec<Arc<CachedObject>> =
            inner.cache.snapshot().into_iter().filter(|o| o.is_dirty()).collect();
        dirty.sort_by_key(|o| o.pos());
        inner.cache.save_all(&dirty, inner.shadow.as_ref(), &inner.file, scale)?;

        if inner.file_modified || inner.free_space.is_modified() {
            let max_size = self.config.max_data_file_size();
            {
                let mut cursor = TailCursor {
                    header: &mut inner.header,
                    file: &inner.file,
                    scale,
                    max_size,
                };
                inner.free_space.close(&mut cursor, &inner.file)?;
            }
            inner.header.space_manager_position = inner.free_space.root_position();
            inner.header.lost_space_size = inner.free_space.lost_blocks_size();
            inner.header.write(&inner.file)?;
            inner.header.flags = HeaderFlags::with_flag(&inner.file, |f| f | HeaderFlags::ISSAVED)?;
        }

        inner.file.synch()?;

        if let Some(shadow) = inner.shadow.take() {
            shadow.discard()?;
        }
        if self.config.increment_backup {
            inner.shadow = Some(ShadowFile::create(&shadow_path_for(&self.data_path))?);
        }

        inner.file_modified = false;
        inner.cache_modified = false;
        tracing::debug!(flushed = dirty.len(), "commit complete");
        Ok(())
    }

    /// `close(true)` behaves exactly like `commit`; `close(false)` abandons uncommitted state
    /// (the next `open` replays the shadow or restores the backup) and never propagates errors.
    pub fn close(&self, commit: bool) {
        let mut inner = self.inner.write();
        if commit {
            if let Err(e) = self.commit_locked(&mut inner) {
                tracing::warn!(error = %e, "commit during close failed, state left for recovery");
            }
        } else if let Some(shadow) = inner.shadow.take() {
            if let Err(e) = shadow.close() {
                tracing::warn!(error = %e, "failed to sync shadow during abandonment");
            }
        }
        if let Err(e) = inner.file.synch() {
            tracing::warn!(error = %e, "failed to sync data file on close");
        }
    }

    pub fn create_full_backup(&self) -> Result<()> {
        let inner = self.inner.read();
        inner.file.synch()?;
        self.backup.create_full_backup(&self.data_path, &backup_path_for(&self.data_path))
    }

    /// Current header flag word, read fresh from disk for diagnostics; falls back to the
    /// last-known-good in-memory value if the read fails.
    pub fn flags(&self) -> HeaderFlags {
        let inner = self.inner.read();
        match HeaderFlags::load(&inner.file) {
            Ok(f) => f,
            Err(e) => {
                tracing::trace!(error = %e, "flag read failed, returning cached value");
                inner.header.flags
            }
        }
    }

    pub fn cache_len(&self) -> usize {
        self.inner.read().cache.len()
    }

    pub fn free_block_size(&self) -> u64 {
        self.inner.read().free_space.free_block_size()
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    fn cfg() -> PageStoreConfig {
        PageStoreConfig::builder()
            .data_file_scale(8)
            .unwrap()
            .cache_max_rows(10)
            .unwrap()
            .build()
    }

    #[test]
    fn create_add_commit_reopen_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.data");

        let store = DataFileCache::open(&path, cfg()).unwrap();
        let obj = store.add(b"hello-row".to_vec(), false).unwrap();
        let pos = obj.pos();
        store.commit().unwrap();
        store.close(true);

        let store2 = DataFileCache::open(&path, cfg()).unwrap();
        let fetched = store2
            .get(pos, Some(9), |bytes| Arc::new(CachedObject::new(pos, bytes.to_vec())))
            .unwrap();
        fetched.with_payload(|b| assert_eq!(b, b"hello-row"));
    }

    #[test]
    fn incremental_mode_recovers_uncommitted_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.data");
        let mut config = cfg();
        config.increment_backup = true;

        let store = DataFileCache::open(&path, config.clone()).unwrap();
        let obj = store.add(b"first-row".to_vec(), false).unwrap();
        store.commit().unwrap();
        let pos = obj.pos();

        // Simulate a crash mid-write: dirty a row, flush it once (shadowing the pre-write bytes),
        // but never run commit's header-sync step.
        store.save_row(pos, b"corrupted".to_vec()).unwrap();
        {
            let inner = store.inner.write();
            inner
                .cache
                .save_all(&inner.cache.snapshot(), inner.shadow.as_ref(), &inner.file, config.data_file_scale)
                .unwrap();
        }
        // No commit: the header on disk still has ISSAVED=0 and a shadow log exists.
        drop(store);

        let store2 = DataFileCache::open(&path, config).unwrap();
        let fetched = store2
            .get(pos, Some(9), |bytes| Arc::new(CachedObject::new(pos, bytes.to_vec())))
            .unwrap();
        fetched.with_payload(|b| assert_eq!(b, b"first-row"));
    }

    #[test]
    fn remove_frees_space_for_reuse() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.data");
        let store = DataFileCache::open(&path, cfg()).unwrap();

        let a = store.add(b"aaaaaaaa".to_vec(), false).unwrap();
        store.remove(a.pos()).unwrap();
        let b = store.add(b"bbbbbbbb".to_vec(), false).unwrap();
        assert_eq!(a.pos(), b.pos());
    }

    /// `get` with no explicit size must recover the payload length from the 4-byte record prefix
    /// `add`/`commit` wrote on disk, not from anything the caller remembers.
    #[test]
    fn get_without_explicit_size_reads_length_from_record_prefix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.data");

        let store = DataFileCache::open(&path, cfg()).unwrap();
        let obj = store.add(b"hello-row".to_vec(), false).unwrap();
        let pos = obj.pos();
        store.commit().unwrap();
        store.close(true);

        let store2 = DataFileCache::open(&path, cfg()).unwrap();
        let fetched = store2
            .get(pos, None, |bytes| Arc::new(CachedObject::new(pos, bytes.to_vec())))
            .unwrap();
        fetched.with_payload(|b| assert_eq!(b, b"hello-row"));
    }

    /// `remove` on a position the cache has never seen (e.g. right after reopening the store) must
    /// size the released space from the on-disk record prefix, not from a cached object.
    #[test]
    fn remove_uncached_row_reads_size_from_record_prefix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.data");

        let store = DataFileCache::open(&path, cfg()).unwrap();
        let a = store.add(b"aaaaaaaa".to_vec(), false).unwrap();
        let pos = a.pos();
        store.commit().unwrap();
        store.close(true);

        let store2 = DataFileCache::open(&path, cfg()).unwrap();
        assert_eq!(store2.cache_len(), 0);
        store2.remove(pos).unwrap();

        let b = store2.add(b"bbbbbbbb".to_vec(), false).unwrap();
        assert_eq!(pos, b.pos());
    }
}
