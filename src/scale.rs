//! Address-unit scaling.
//!
//! Cached objects carry a `pos` that counts `DataFileScale`-byte units; the physical byte offset
//! is always `pos * scale`.

use crate::error::{Error, Result};

/// Minimum padding applied to every row record's size, regardless of scale.
pub const MIN_ROW_PADDING: u32 = 8;

/// Every row record on disk opens with a 4-byte big-endian total size (itself included), followed
/// by that many minus 4 opaque payload bytes.
pub const ROW_RECORD_HEADER_BYTES: u64 = 4;

/// Size, in units of `DataFileScale`, of one free-space metadata block in the `Blocks` variant.
pub const SPACE_MANAGER_BLOCK_UNITS: u64 = 1024;

/// The fixed header occupies the first 32 bytes of the file.
pub const HEADER_SIZE: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataFileScale(u32);

impl DataFileScale {
    const VALID: [u32; 8] = [8, 16, 32, 64, 128, 256, 512, 1024];

    pub fn new(scale: u32) -> Result<Self> {
        if Self::VALID.contains(&scale) {
            Ok(Self(scale))
        } else {
            Err(Error::data_file(format!(
                "invalid data file scale {scale}: must be one of {:?}",
                Self::VALID
            )))
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Physical byte offset of a scaled position.
    pub fn to_offset(self, pos: u64) -> u64 {
        pos * self.0 as u64
    }

    /// Scaled position of a physical byte offset. The offset must be a multiple of the scale.
    pub fn to_pos(self, offset: u64) -> u64 {
        offset / self.0 as u64
    }

    /// First usable payload offset: `max(32, scale)`.
    pub fn min_initial_free_pos(self) -> u64 {
        HEADER_SIZE.max(self.0 as u64)
    }

    /// `cachedRowPadding`: every row record's total size is rounded up to a multiple of this.
    pub fn row_padding(self) -> u32 {
        self.0.max(MIN_ROW_PADDING)
    }

    /// Round `size` up to the nearest multiple of `row_padding()`.
    pub fn pad_row_size(self, size: u32) -> u32 {
        let padding = self.row_padding();
        let rem = size % padding;
        if rem == 0 {
            size
        } else {
            size + (padding - rem)
        }
    }
}

impl Default for DataFileScale {
    fn default() -> Self {
        Self(32)
    }
}
