//! The fixed 32-byte file header.

use crate::error::Result;
use crate::flags::HeaderFlags;
use crate::io::RandomAccessFile;

const EMPTY_SIZE_OFFSET: u64 = 4;
const FREE_POS_OFFSET: u64 = 12;
const SPACE_LIST_POS_OFFSET: u64 = 24;

#[derive(Debug, Clone, Copy)]
pub struct FileHeader {
    /// Bytes belonging to released regions the free-space manager could not coalesce.
    pub lost_space_size: u64,
    /// File-tail pointer: next free byte offset.
    pub file_free_position: u64,
    /// Offset (in scaled units) of the free-space manager's root block.
    pub space_manager_position: i32,
    pub flags: HeaderFlags,
}

impl FileHeader {
    pub fn read(file: &dyn RandomAccessFile) -> Result<Self> {
        Ok(Self {
            lost_space_size: file.read_i64_at(EMPTY_SIZE_OFFSET)? as u64,
            file_free_position: file.read_i64_at(FREE_POS_OFFSET)? as u64,
            space_manager_position: file.read_i32_at(SPACE_LIST_POS_OFFSET)?,
            flags: HeaderFlags::load(file)?,
        })
    }

    pub fn write(&self, file: &dyn RandomAccessFile) -> Result<()> {
        file.write_i64_at(self.lost_space_size as i64, EMPTY_SIZE_OFFSET)?;
        file.write_i64_at(self.file_free_position as i64, FREE_POS_OFFSET)?;
        file.write_i32_at(self.space_manager_position, SPACE_LIST_POS_OFFSET)?;
        self.flags.store(file)?;
        Ok(())
    }
}
