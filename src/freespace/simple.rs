use super::{FreeList, FreeSpaceManager, Tail};
use crate::error::Result;
use crate::io::RandomAccessFile;

/// In-memory free-region list with zero persisted metadata: on close there is nothing to flush,
/// and on open the list simply starts empty (every row in the file between the header and the
/// tail is assumed either live or leaked into `lost_space_size`, which the coordinator already
/// tracks via the header).
#[derive(Default)]
pub struct SimpleFreeSpaceManager {
    list: FreeList,
}

impl SimpleFreeSpaceManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FreeSpaceManager for SimpleFreeSpaceManager {
    #[tracing::instrument(skip(self, tail))]
    fn get_file_position(
        &mut self,
        row_size_units: u64,
        as_block: bool,
        tail: &mut dyn Tail,
    ) -> Result<u64> {
        if let Some(pos) = self.list.allocate(row_size_units, as_block) {
            return Ok(pos);
        }

        // Miss: grow the file by exactly what's needed (Simple variant's growth policy).
        let old_tail = tail.position();
        let aligned_start = if as_block {
            super::align_up(old_tail, crate::scale::SPACE_MANAGER_BLOCK_UNITS)
        } else {
            old_tail
        };
        let slack = aligned_start - old_tail;
        let new_tail = aligned_start + row_size_units;
        tail.grow(new_tail)?;
        if slack > 0 {
            self.list.extend([(old_tail, slack)]);
        }
        tracing::debug!(pos = aligned_start, "extended file for allocation");
        Ok(aligned_start)
    }

    fn release(&mut self, pos: u64, size_units: u64, tail: &mut dyn Tail) {
        let (region_pos, region_len) = self.list.release(pos, size_units);
        if region_pos + region_len == tail.position() {
            self.list.remove_region(region_pos);
            tail.shrink(region_pos);
        }
    }

    fn free_block_count(&self) -> usize {
        self.list.len()
    }

    fn free_block_size(&self) -> u64 {
        self.list.total_free()
    }

    fn lost_blocks_size(&self) -> u64 {
        self.list.lost_units()
    }

    fn is_modified(&self) -> bool {
        false
    }

    fn root_position(&self) -> i32 {
        0
    }

    fn close(&mut self, _tail: &mut dyn Tail, _file: &dyn RandomAccessFile) -> Result<()> {
        Ok(())
    }
}
