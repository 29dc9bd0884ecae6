use std::sync::Arc;

use pagestore::{CachedObject, DataFileCache, Error, PageStoreConfig};
use tempfile::tempdir;

fn small_cache_config() -> PageStoreConfig {
    PageStoreConfig::builder()
        .data_file_scale(8)
        .unwrap()
        .cache_max_rows(2)
        .unwrap()
        .cache_max_size(64)
        .unwrap()
        .build()
}

#[test]
fn create_and_store_single_row() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.data");

    let store = DataFileCache::open(&path, small_cache_config()).unwrap();
    let obj = store.add(b"a single row".to_vec(), false).unwrap();
    store.commit().unwrap();

    let pos = obj.pos();
    let fetched = store
        .get(pos, Some(12), |bytes| Arc::new(CachedObject::new(pos, bytes.to_vec())))
        .unwrap();
    fetched.with_payload(|b| assert_eq!(b, b"a single row"));
    assert!(store.flags().bits() != 0);
}

// Every `open` marks the header dirty on disk until the session's next `commit`, so the crash
// window these two tests target is "opened again, then dropped without ever committing" — that
// is exactly what leaves `ISSAVED=0` on disk for the following `open` to notice and recover from.

#[test]
fn crash_before_commit_full_backup_mode_restores_last_snapshot() {
    use pagestore::io::file::{AnyFile, FileOpenKind};
    use pagestore::io::RandomAccessFile;

    let dir = tempdir().unwrap();
    let path = dir.path().join("t.data");
    let config = small_cache_config();

    let store = DataFileCache::open(&path, config.clone()).unwrap();
    let obj = store.add(b"committed-row".to_vec(), false).unwrap();
    store.commit().unwrap();
    let pos = obj.pos();
    store.create_full_backup().unwrap();
    drop(store);

    // Reopen (clears ISSAVED on disk), then crash before any commit: overwrite the row's bytes
    // directly, the way an interrupted in-place write would, and drop the handle without closing.
    let crashed = DataFileCache::open(&path, config.clone()).unwrap();
    drop(crashed);
    let payload_offset = config.data_file_scale.to_offset(pos) + 4;
    let file = AnyFile::open(FileOpenKind::ReadWrite { mapped: false }, &path).unwrap();
    file.write_all_at(b"post-crash-gb", payload_offset).unwrap();
    file.synch().unwrap();
    drop(file);

    let store2 = DataFileCache::open(&path, config).unwrap();
    let fetched = store2
        .get(pos, Some(13), |bytes| Arc::new(CachedObject::new(pos, bytes.to_vec())))
        .unwrap();
    fetched.with_payload(|b| assert_eq!(b, b"committed-row"));
}

#[test]
fn crash_before_commit_incremental_mode_undoes_partial_write() {
    use pagestore::flags::HeaderFlags;
    use pagestore::io::file::{AnyFile, FileOpenKind};
    use pagestore::io::RandomAccessFile;
    use pagestore::shadow::ShadowFile;

    let dir = tempdir().unwrap();
    let path = dir.path().join("t.data");
    let mut config = small_cache_config();
    config.increment_backup = true;

    let store = DataFileCache::open(&path, config.clone()).unwrap();
    let obj = store.add(b"stable-before".to_vec(), false).unwrap();
    store.commit().unwrap();
    let pos = obj.pos();
    drop(store);

    // Stand in for a session that shadowed a page, wrote over it, and crashed before its commit
    // could mark the header saved again: shadow the row's page by hand, corrupt the row bytes in
    // place, and clear ISSAVED directly, exactly as a real write-then-crash would leave the file.
    let payload_offset = config.data_file_scale.to_offset(pos) + 4;
    let shadow_path = {
        let mut p = path.as_os_str().to_owned();
        p.push(".backup");
        std::path::PathBuf::from(p)
    };
    let file = AnyFile::open(FileOpenKind::ReadWrite { mapped: false }, &path).unwrap();
    let shadow = ShadowFile::create(&shadow_path).unwrap();
    shadow.copy(&file, payload_offset, 13).unwrap();
    shadow.synch().unwrap();
    file.write_all_at(b"post-crash-gb", payload_offset).unwrap();
    HeaderFlags::with_flag(&file, |f| f.difference(HeaderFlags::ISSAVED)).unwrap();
    file.synch().unwrap();
    drop(file);
    drop(shadow);

    let store2 = DataFileCache::open(&path, config).unwrap();
    let fetched = store2
        .get(pos, Some(13), |bytes| Arc::new(CachedObject::new(pos, bytes.to_vec())))
        .unwrap();
    fetched.with_payload(|b| assert_eq!(b, b"stable-before"));
}

#[test]
fn allocate_release_reallocate_reuses_freed_region() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.data");
    let store = DataFileCache::open(&path, small_cache_config()).unwrap();

    let a = store.add(b"row-aaaaaa".to_vec(), false).unwrap();
    let b = store.add(b"row-bbbbbb".to_vec(), false).unwrap();
    store.remove(a.pos()).unwrap();

    let c = store.add(b"row-cccccc".to_vec(), false).unwrap();
    assert_eq!(a.pos(), c.pos());
    assert_ne!(b.pos(), c.pos());
}

#[test]
fn growing_past_the_configured_cap_fails_cleanly() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.data");
    let config = PageStoreConfig::builder()
        .data_file_scale(8)
        .unwrap()
        .data_file_factor(1)
        .unwrap()
        .build();
    let max_units = config.max_data_file_size() / 8;

    let store = DataFileCache::open(&path, config).unwrap();
    let err = store.enlarge_file_space(max_units).unwrap_err();
    assert!(matches!(err, Error::FileFull { .. }));
}

#[test]
fn cache_bound_enforcement_evicts_unpinned_entries() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.data");
    let store = DataFileCache::open(&path, small_cache_config()).unwrap();

    store.add(b"rowrowrow".to_vec(), false).unwrap();
    store.add(b"rowrowrow".to_vec(), false).unwrap();
    store.add(b"rowrowrow".to_vec(), false).unwrap();
    store.commit().unwrap();

    assert!(store.cache_len() <= 2);
}
