use super::{align_up, FreeList, FreeSpaceManager, Tail};
use crate::error::Result;
use crate::io::RandomAccessFile;
use crate::scale::{DataFileScale, SPACE_MANAGER_BLOCK_UNITS};

const BLOCK_HEADER_BYTES: u64 = 16; // next_block_pos: i64, entry_count: i64
const ENTRY_BYTES: u64 = 16; // pos: u64, len: u64

/// Persistent free-space manager: the region set is serialized into a linked chain of fixed-size
/// (1024-unit) metadata blocks rooted at `root_position`, rebuilt by walking the chain on open.
pub struct BlocksFreeSpaceManager {
    list: FreeList,
    scale: DataFileScale,
    root: i32,
    /// Physical positions (scaled units) of blocks currently holding serialized metadata; reused
    /// across `close` calls before asking for more space.
    block_positions: Vec<u64>,
    dirty: bool,
}

impl BlocksFreeSpaceManager {
    pub fn new(scale: DataFileScale) -> Self {
        Self {
            list: FreeList::default(),
            scale,
            root: 0,
            block_positions: Vec::new(),
            dirty: false,
        }
    }

    fn block_bytes(&self) -> u64 {
        SPACE_MANAGER_BLOCK_UNITS * self.scale.get() as u64
    }

    fn entries_per_block(&self) -> u64 {
        (self.block_bytes() - BLOCK_HEADER_BYTES) / ENTRY_BYTES
    }

    /// Rebuild a manager from the chain rooted at `root_units` (0 means "no chain yet").
    #[tracing::instrument(skip(file))]
    pub fn open(
        file: &dyn RandomAccessFile,
        scale: DataFileScale,
        root_units: i32,
    ) -> Result<Self> {
        let mut mgr = Self::new(scale);
        mgr.root = root_units;
        if root_units == 0 {
            return Ok(mgr);
        }

        let mut block_pos = root_units as u64;
        loop {
            mgr.block_positions.push(block_pos);
            let byte_offset = scale.to_offset(block_pos);
            let next_block = file.read_i64_at(byte_offset)? as u64;
            let entry_count = file.read_i64_at(byte_offset + 8)? as u64;

            for i in 0..entry_count {
                let entry_offset = byte_offset + BLOCK_HEADER_BYTES + i * ENTRY_BYTES;
                let pos = file.read_i64_at(entry_offset)? as u64;
                let len = file.read_i64_at(entry_offset + 8)? as u64;
                mgr.list.extend([(pos, len)]);
            }

            if next_block == 0 {
                break;
            }
            block_pos = next_block;
        }

        tracing::debug!(blocks = mgr.block_positions.len(), "rebuilt free-space chain");
        Ok(mgr)
    }
}

impl FreeSpaceManager for BlocksFreeSpaceManager {
    #[tracing::instrument(skip(self, tail))]
    fn get_file_position(
        &mut self,
        row_size_units: u64,
        as_block: bool,
        tail: &mut dyn Tail,
    ) -> Result<u64> {
        if let Some(pos) = self.list.allocate(row_size_units, as_block) {
            self.dirty = true;
            return Ok(pos);
        }

        let old_tail = tail.position();
        let aligned_start = align_up(old_tail, SPACE_MANAGER_BLOCK_UNITS);
        let slack = aligned_start - old_tail;
        let new_tail = aligned_start + row_size_units;
        tail.grow(new_tail)?;
        if slack > 0 {
            self.list.extend([(old_tail, slack)]);
        }
        self.dirty = true;
        tracing::debug!(pos = aligned_start, "extended file for block allocation");
        Ok(aligned_start)
    }

    fn release(&mut self, pos: u64, size_units: u64, tail: &mut dyn Tail) {
        let (region_pos, region_len) = self.list.release(pos, size_units);
        if region_pos + region_len == tail.position() {
            self.list.remove_region(region_pos);
            tail.shrink(region_pos);
        }
        self.dirty = true;
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
        self.dirty
    }

    fn root_position(&self) -> i32 {
        self.root
    }

    #[tracing::instrument(skip(self, tail, file))]
    fn close(&mut self, tail: &mut dyn Tail, file: &dyn RandomAccessFile) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let entries: Vec<(u64, u64)> = self.list.regions().collect();
        let per_block = self.entries_per_block();
        let blocks_needed = entries.chunks(per_block as usize).count().max(1);

        // Free the previously-used block positions into the region list before computing the
        // layout that will be written, then (re)allocate exactly what's needed. This keeps the
        // chain's own footprint from leaking on every commit.
        let old_blocks = std::mem::take(&mut self.block_positions);
        for pos in old_blocks {
            self.release(pos, SPACE_MANAGER_BLOCK_UNITS, tail);
        }

        let mut new_positions = Vec::with_capacity(blocks_needed);
        for _ in 0..blocks_needed {
            let pos = self.get_file_position(SPACE_MANAGER_BLOCK_UNITS, true, tail)?;
            new_positions.push(pos);
        }

        let chunks: Vec<&[(u64, u64)]> = if entries.is_empty() {
            vec![&[][..]]
        } else {
            entries.chunks(per_block as usize).collect()
        };

        for (i, chunk) in chunks.iter().enumerate() {
            let block_pos = new_positions[i];
            let byte_offset = self.scale.to_offset(block_pos);
            let next = new_positions.get(i + 1).copied().unwrap_or(0);
            file.write_i64_at(next as i64, byte_offset)?;
            file.write_i64_at(chunk.len() as i64, byte_offset + 8)?;
            for (j, (pos, len)) in chunk.iter().enumerate() {
                let entry_offset = byte_offset + BLOCK_HEADER_BYTES + j as u64 * ENTRY_BYTES;
                file.write_i64_at(*pos as i64, entry_offset)?;
                file.write_i64_at(*len as i64, entry_offset + 8)?;
            }
        }

        self.root = *new_positions.first().unwrap_or(&0) as i32;
        self.block_positions = new_positions;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::file::{AnyFile, FileOpenKind};
    use tempfile::tempdir;

    struct FakeTail(u64);
    impl Tail for FakeTail {
        fn position(&self) -> u64 {
            self.0
        }
        fn grow(&mut self, new_tail: u64) -> Result<u64> {
            let old = self.0;
            self.0 = new_tail;
            Ok(old)
        }
        fn shrink(&mut self, new_tail: u64) {
            self.0 = new_tail;
        }
    }

    #[test]
    fn persists_and_reopens_free_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.data");
        let file = AnyFile::open(FileOpenKind::ReadWrite { mapped: false }, &path).unwrap();
        file.ensure_length(32).unwrap();

        let scale = DataFileScale::new(16).unwrap();
        let mut mgr = BlocksFreeSpaceManager::new(scale);
        let mut tail = FakeTail(2);

        let a = mgr.get_file_position(2, false, &mut tail).unwrap();
        let _b = mgr.get_file_position(2, false, &mut tail).unwrap();
        mgr.release(a, 2, &mut tail);

        mgr.close(&mut tail, &file).unwrap();
        let root = mgr.root_position();
        assert_ne!(root, 0);

        let reopened = BlocksFreeSpaceManager::open(&file, scale, root).unwrap();
        assert_eq!(reopened.free_block_size(), mgr.free_block_size());
    }
}
