//! Collaborator interfaces: row (de)serialisation and external position bookkeeping are left to
//! the caller. This crate only ever sees opaque byte buffers and scaled positions.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("row decode failed: {0}")]
    Decode(String),
    #[error("row encode failed: {0}")]
    Encode(String),
}

/// A read cursor over a row's raw bytes, handed to [`PersistentStore::get`].
pub struct RowInput<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> RowInput<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> &[u8] {
        &self.bytes[self.pos..]
    }

    pub fn read_bytes(&mut self, n: usize) -> &'a [u8] {
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        slice
    }

    pub fn read_i32(&mut self) -> i32 {
        i32::from_be_bytes(self.read_bytes(4).try_into().unwrap())
    }

    pub fn read_i64(&mut self) -> i64 {
        i64::from_be_bytes(self.read_bytes(8).try_into().unwrap())
    }
}

/// A write cursor into a row's raw bytes, handed to [`PersistentStore::set`].
pub struct RowOutput<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> RowOutput<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
}

/// An in-memory row object bound to a file position, tracked by [`crate::cache::ObjectCache`].
///
/// `pin_count`, `dirty` and `last_access` are mutated through shared references (the cache hands
/// out `Arc<CachedObject>` to concurrent readers), so they live behind atomics; `payload` is
/// replaced wholesale on a row rewrite and so sits behind a small mutex.
pub struct CachedObject {
    pos: u64,
    size: AtomicU32,
    pin_count: AtomicU32,
    dirty: AtomicBool,
    last_access: AtomicU64,
    payload: Mutex<Vec<u8>>,
}

impl CachedObject {
    pub fn new(pos: u64, payload: Vec<u8>) -> Self {
        let size = payload.len() as u32;
        Self {
            pos,
            size: AtomicU32::new(size),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            last_access: AtomicU64::new(0),
            payload: Mutex::new(payload),
        }
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Relaxed);
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Relaxed)
    }

    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the pin count; a pin count already at zero is a caller bug elsewhere, not
    /// something this type can recover from usefully, so it saturates rather than panicking.
    pub fn unpin(&self) {
        let _ = self
            .pin_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some(c.saturating_sub(1))
            });
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn touch(&self, seq: u64) {
        self.last_access.store(seq, Ordering::Relaxed);
    }

    pub fn with_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.payload.lock())
    }

    pub fn replace_payload(&self, bytes: Vec<u8>) {
        self.size.store(bytes.len() as u32, Ordering::Relaxed);
        *self.payload.lock() = bytes;
    }
}

/// Materialises row bytes into a caller-defined in-memory representation and back.
pub trait PersistentStore: Send + Sync {
    fn get(&self, input: &mut RowInput<'_>) -> Result<CachedObject, StoreError>;
    fn set(&self, object: &CachedObject, output: &mut RowOutput<'_>);
}

/// External position bookkeeping for a table space that spans more than one data file.
pub trait TableSpaceManager: Send + Sync {
    fn get_file_position(&mut self, size: u32, as_block: bool) -> crate::error::Result<u64>;
    fn release(&mut self, pos: u64, size: u32);
}
