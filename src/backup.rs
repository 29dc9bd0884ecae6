//! Backup creation, restore and staleness handling.
//!
//! Two strategies behind one trait, selected by [`crate::config::PageStoreConfig::increment_backup`]:
//! a zip'd full copy of the data file (`ZipBackup`), or delegation to the shadow file's own replay
//! (`ShadowBackup`). A small trait with two implementations picked by config, rather than one type
//! branching internally, keeps each strategy's failure modes independently testable.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::shadow::ShadowFile;

pub trait BackupStrategy: Send + Sync {
    fn create(&self, data_path: &Path, backup_path: &Path) -> Result<()>;
    fn restore(&self, backup_path: &Path, data_path: &Path) -> Result<()>;
    fn discard(&self, backup_path: &Path) -> Result<()>;
}

/// Full-file backup: the data file compressed into a single-entry zip archive.
pub struct ZipBackup;

const ZIP_ENTRY_NAME: &str = "data";

impl BackupStrategy for ZipBackup {
    #[tracing::instrument(skip(self))]
    fn create(&self, data_path: &Path, backup_path: &Path) -> Result<()> {
        let mut data = File::open(data_path)?;
        let out = File::create(backup_path)?;
        let mut zip = zip::ZipWriter::new(out);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        zip.start_file(ZIP_ENTRY_NAME, options)
            .map_err(|e| Error::data_file(format!("zip backup failed: {e}")))?;
        std::io::copy(&mut data, &mut zip)?;
        zip.finish()
            .map_err(|e| Error::data_file(format!("zip backup failed: {e}")))?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn restore(&self, backup_path: &Path, data_path: &Path) -> Result<()> {
        let archive_file = File::open(backup_path)?;
        let mut archive = zip::ZipArchive::new(archive_file)
            .map_err(|e| Error::data_file(format!("corrupt backup archive: {e}")))?;
        let mut entry = archive
            .by_name(ZIP_ENTRY_NAME)
            .map_err(|e| Error::data_file(format!("backup missing data entry: {e}")))?;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        drop(entry);

        let mut out = File::create(data_path)?;
        out.write_all(&bytes)?;
        out.sync_all()?;
        tracing::info!(bytes = bytes.len(), "restored full backup");
        Ok(())
    }

    fn discard(&self, backup_path: &Path) -> Result<()> {
        if backup_path.exists() {
            std::fs::remove_file(backup_path)?;
        }
        Ok(())
    }
}

/// Incremental backup: the "backup" is the shadow log itself, replayed in place.
pub struct ShadowBackup;

impl BackupStrategy for ShadowBackup {
    /// Incremental backups are produced as a side effect of normal writes (`ShadowFile::copy`);
    /// there is nothing to snapshot up front.
    fn create(&self, _data_path: &Path, _backup_path: &Path) -> Result<()> {
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn restore(&self, backup_path: &Path, data_path: &Path) -> Result<()> {
        ShadowFile::restore_file(backup_path, data_path)
    }

    fn discard(&self, backup_path: &Path) -> Result<()> {
        if backup_path.exists() {
            std::fs::remove_file(backup_path)?;
        }
        Ok(())
    }
}

pub struct BackupManager {
    strategy: Box<dyn BackupStrategy>,
}

impl BackupManager {
    pub fn new(incremental: bool) -> Self {
        let strategy: Box<dyn BackupStrategy> = if incremental {
            Box::new(ShadowBackup)
        } else {
            Box::new(ZipBackup)
        };
        Self { strategy }
    }

    pub fn create_full_backup(&self, data_path: &Path, backup_path: &Path) -> Result<()> {
        self.strategy.create(data_path, backup_path)
    }

    pub fn restore_full_backup(&self, backup_path: &Path, data_path: &Path) -> Result<()> {
        self.strategy.restore(backup_path, data_path)
    }

    pub fn apply_incremental(&self, shadow_path: &Path, data_path: &Path) -> Result<()> {
        ShadowFile::restore_file(shadow_path, data_path)
    }

    pub fn discard(&self, backup_path: &Path) -> Result<()> {
        self.strategy.discard(backup_path)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn zip_backup_roundtrip() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("t.data");
        std::fs::write(&data_path, b"hello world, this is page store data").unwrap();

        let backup_path = dir.path().join("t.backup");
        let mgr = BackupManager::new(false);
        mgr.create_full_backup(&data_path, &backup_path).unwrap();
        assert!(backup_path.exists());

        std::fs::write(&data_path, b"corrupted").unwrap();
        mgr.restore_full_backup(&backup_path, &data_path).unwrap();

        let restored = std::fs::read(&data_path).unwrap();
        assert_eq!(restored, b"hello world, this is page store data");
    }

    #[test]
    fn shadow_backup_applies_incremental_log() {
        use crate::io::file::{AnyFile, FileOpenKind};
        use crate::io::RandomAccessFile;

        let dir = tempdir().unwrap();
        let data_path = dir.path().join("t.data");
        let original = vec![0x11u8; crate::shadow::SHADOW_PAGE_SIZE as usize];
        std::fs::write(&data_path, &original).unwrap();
        let data_file = AnyFile::open(FileOpenKind::ReadWrite { mapped: false }, &data_path).unwrap();

        let shadow_path = dir.path().join("t.backup");
        let shadow = ShadowFile::create(&shadow_path).unwrap();
        shadow.copy(&data_file, 0, 16).unwrap();
        shadow.synch().unwrap();

        data_file.write_all_at(b"overwritten-junk", 0).unwrap();
        data_file.synch().unwrap();
        drop(data_file);

        let mgr = BackupManager::new(true);
        mgr.apply_incremental(&shadow_path, &data_path).unwrap();

        let restored = std::fs::read(&data_path).unwrap();
        assert_eq!(&restored[..16], &original[..16]);
    }
}
