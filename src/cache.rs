//! `ObjectCache`: a size-and-count-bounded map from file position to row object.
//!
//! Mutations only ever happen under the coordinator's write lock; a lookup hit can be served
//! under its read lock, so every method here takes `&self` and relies on interior mutability
//! (`parking_lot::Mutex` for the map, atomics on [`CachedObject`] itself) rather than requiring
//! `&mut self`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::io::RandomAccessFile;
use crate::scale::{DataFileScale, ROW_RECORD_HEADER_BYTES};
use crate::shadow::ShadowFile;
use crate::store::CachedObject;

pub struct ObjectCache {
    entries: Mutex<HashMap<u64, Arc<CachedObject>>>,
    access_seq: AtomicU64,
    max_rows: usize,
    max_bytes: u64,
}

impl ObjectCache {
    pub fn new(max_rows: usize, max_bytes: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            access_seq: AtomicU64::new(0),
            max_rows,
            max_bytes,
        }
    }

    fn next_seq(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn touch(&self, pos: u64) {
        if let Some(obj) = self.entries.lock().get(&pos) {
            obj.touch(self.next_seq());
        }
    }

    pub fn get(&self, pos: u64) -> Option<Arc<CachedObject>> {
        let obj = self.entries.lock().get(&pos).cloned();
        if let Some(obj) = &obj {
            obj.touch(self.next_seq());
        }
        obj
    }

    /// Insert a freshly-read or newly-created object, then run a cleanup pass if either ceiling
    /// is now exceeded.
    #[tracing::instrument(skip(self, obj, shadow, file))]
    pub fn put(
        &self,
        obj: Arc<CachedObject>,
        shadow: Option<&ShadowFile>,
        file: &dyn RandomAccessFile,
        scale: DataFileScale,
    ) -> Result<()> {
        obj.touch(self.next_seq());
        self.entries.lock().insert(obj.pos(), obj);
        self.enforce_bounds(shadow, file, scale)
    }

    pub fn replace(&self, pos: u64, obj: Arc<CachedObject>) {
        obj.touch(self.next_seq());
        self.entries.lock().insert(pos, obj);
    }

    /// Drop an entry outright, regardless of pin state. Used when a row is deleted and its space
    /// released: the object can no longer be observed, pinned or not.
    pub fn remove(&self, pos: u64) -> Option<Arc<CachedObject>> {
        self.entries.lock().remove(&pos)
    }

    pub fn remove_range(&self, start: u64, limit: u64) {
        self.entries.lock().retain(|&pos, _| pos < start || pos >= limit);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_cached_block_size(&self) -> u64 {
        self.entries.lock().values().map(|o| o.size() as u64).sum()
    }

    pub fn snapshot(&self) -> Vec<Arc<CachedObject>> {
        self.entries.lock().values().cloned().collect()
    }

    /// Flush every dirty, unpinned object in `targets`: shadow its old bytes, then overwrite it
    /// in place, clearing the dirty flag. Targets are expected pre-sorted by `pos` so the writes
    /// land sequentially on disk.
    #[tracing::instrument(skip(self, targets, shadow, file))]
    pub fn save_all(
        &self,
        targets: &[Arc<CachedObject>],
        shadow: Option<&ShadowFile>,
        file: &dyn RandomAccessFile,
        scale: DataFileScale,
    ) -> Result<()> {
        for obj in targets {
            if !obj.is_dirty() {
                continue;
            }
            let record_offset = scale.to_offset(obj.pos());
            let record_len = obj.size() as u64 + ROW_RECORD_HEADER_BYTES;
            if let Some(shadow) = shadow {
                shadow.copy(file, record_offset, record_len)?;
            }
            file.write_i32_at(record_len as i32, record_offset)?;
            obj.with_payload(|bytes| file.write_all_at(bytes, record_offset + ROW_RECORD_HEADER_BYTES))?;
            obj.clear_dirty();
        }
        if let Some(shadow) = shadow {
            shadow.synch()?;
        }
        tracing::debug!(count = targets.len(), "flushed dirty objects");
        Ok(())
    }

    /// Force a cleanup pass regardless of current occupancy, used as the retry step when an
    /// allocation would otherwise exceed the configured cache ceilings.
    pub fn force_clean_up(
        &self,
        shadow: Option<&ShadowFile>,
        file: &dyn RandomAccessFile,
        scale: DataFileScale,
    ) -> Result<()> {
        self.run_cleanup(shadow, file, scale, true)
    }

    fn enforce_bounds(
        &self,
        shadow: Option<&ShadowFile>,
        file: &dyn RandomAccessFile,
        scale: DataFileScale,
    ) -> Result<()> {
        let over = self.len() > self.max_rows || self.total_cached_block_size() > self.max_bytes;
        if !over {
            return Ok(());
        }
        self.run_cleanup(shadow, file, scale, false)?;
        let still_over = self.len() > self.max_rows || self.total_cached_block_size() > self.max_bytes;
        if still_over {
            return Err(crate::error::Error::OutOfMemory);
        }
        Ok(())
    }

    /// Evict unpinned objects, oldest first, until both ceilings are satisfied (or every unpinned
    /// object has been considered). The oldest ~1/3 unpinned are flushed up front as one batch,
    /// sorted by `pos`, to make that I/O sequential; eviction beyond that batch flushes the rest
    /// one at a time only if actually needed to clear the ceilings.
    fn run_cleanup(
        &self,
        shadow: Option<&ShadowFile>,
        file: &dyn RandomAccessFile,
        scale: DataFileScale,
        force: bool,
    ) -> Result<()> {
        let mut candidates: Vec<Arc<CachedObject>> = self
            .entries
            .lock()
            .values()
            .filter(|o| !o.is_pinned())
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }
        candidates.sort_by_key(|o| o.last_access());

        let batch_len = (candidates.len() / 3).max(1).min(candidates.len());
        let mut dirty: Vec<Arc<CachedObject>> = candidates[..batch_len]
            .iter()
            .filter(|o| o.is_dirty())
            .cloned()
            .collect();
        dirty.sort_by_key(|o| o.pos());
        self.save_all(&dirty, shadow, file, scale)?;

        let mut evicted = 0usize;
        for obj in &candidates {
            if !force && self.len() <= self.max_rows && self.total_cached_block_size() <= self.max_bytes {
                break;
            }
            if obj.is_dirty() {
                self.save_all(std::slice::from_ref(obj), shadow, file, scale)?;
            }
            if self.entries.lock().remove(&obj.pos()).is_some() {
                evicted += 1;
            }
        }
        tracing::debug!(evicted, remaining = self.len(), "cache cleanup pass");
        Ok(())
    }
}
