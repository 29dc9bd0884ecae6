//! The header flag word, stored as the four bytes at `[28..32)` of the file header.
//!
//! Every read-modify-write of the word funnels through one routine, `HeaderFlags::with_flag`,
//! called only from [`crate::coordinator::DataFileCache`] under its write lock, the same way a
//! shared on-disk header word is handled in a single place elsewhere in this crate's I/O layer.

use crate::error::Result;
use crate::io::RandomAccessFile;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        /// A shadow file exists and may hold undo pages for the current commit cycle.
        const ISSHADOWED      = 0b0000_0001;
        /// The file is in sync with the in-memory state: no uncommitted writes are pending.
        const ISSAVED         = 0b0000_0010;
        /// Row metadata (column types / nullability) is stored alongside row bytes.
        const ROWINFO         = 0b0000_0100;
        /// The file was created by this version of the format (as opposed to upgraded).
        const V_NEW           = 0b0000_1000;
        /// The header indicates a file format this build does not understand.
        const WRONG_VERSION   = 0b0001_0000;
        /// Defrag has produced a new file but the rotation has not yet completed; used to make a
        /// crash mid-defrag recoverable.
        const FILES_MODIFIED_NEW = 0b0010_0000;
    }
}

pub const FLAGS_OFFSET: u64 = 28;

impl HeaderFlags {
    pub fn load(file: &dyn RandomAccessFile) -> Result<Self> {
        let raw = file.read_i32_at(FLAGS_OFFSET)? as u32;
        Ok(Self::from_bits_truncate(raw))
    }

    pub fn store(self, file: &dyn RandomAccessFile) -> Result<()> {
        file.write_i32_at(self.bits() as i32, FLAGS_OFFSET)
    }

    /// Read-modify-write: apply `f` to the flags currently on disk and persist the result,
    /// syncing so the new word is durable before the caller proceeds with payload writes.
    pub fn with_flag(file: &dyn RandomAccessFile, f: impl FnOnce(Self) -> Self) -> Result<Self> {
        let current = Self::load(file)?;
        let updated = f(current);
        updated.store(file)?;
        file.synch()?;
        Ok(updated)
    }
}
