//! End-to-end scenarios across the member crates: build on one storage,
//! read through another, package, merge, recover.

use indexfs::core::{
    path, EntryTable, FsError, FsPrimitives, FsResult, LoadConfigList, LocalFs, OpenType,
    SimpleEntryTable,
};
use indexfs::package::{DirectoryMerger, PACKAGE_META_FILE_NAME};
use indexfs::storage::flush::{FlushMode, FlushScheduler, RetryPolicy};
use indexfs::storage::{
    DiskStorage, FileNodeCache, MemStorage, PackageDiskStorage, PackageMemStorage, StorageMetrics,
    WriterOptions,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
});

fn table() -> Arc<SimpleEntryTable> {
    Lazy::force(&TRACING);
    Arc::new(SimpleEntryTable::new())
}

fn cache() -> Arc<FileNodeCache> {
    Arc::new(FileNodeCache::new(Arc::new(StorageMetrics::new())))
}

fn scheduler(mode: FlushMode) -> Arc<FlushScheduler> {
    Arc::new(FlushScheduler::new(mode, RetryPolicy::none()))
}

fn write_through(storage: &MemStorage, logical: &str, data: &[u8]) {
    let mut writer = storage
        .create_file_writer(logical, WriterOptions::default())
        .unwrap();
    writer.write(data).unwrap();
    writer.close().unwrap();
}

/// Delegating filesystem that records the order of structural calls.
struct RecordingFs {
    inner: LocalFs,
    log: Mutex<Vec<(&'static str, String)>>,
}

impl RecordingFs {
    fn new() -> Self {
        RecordingFs {
            inner: LocalFs::new(),
            log: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, op: &'static str, p: &str) {
        self.log.lock().push((op, p.to_string()));
    }
}

impl FsPrimitives for RecordingFs {
    fn read_file(&self, p: &str) -> FsResult<Vec<u8>> {
        self.inner.read_file(p)
    }
    fn read_range(&self, p: &str, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        self.inner.read_range(p, offset, len)
    }
    fn write_file(&self, p: &str, data: &[u8]) -> FsResult<()> {
        self.record("write", p);
        self.inner.write_file(p, data)
    }
    fn create_write(&self, p: &str) -> FsResult<Box<dyn Write + Send>> {
        self.record("write", p);
        self.inner.create_write(p)
    }
    fn atomic_store(&self, p: &str, data: &[u8]) -> FsResult<()> {
        self.record("write", p);
        self.inner.atomic_store(p, data)
    }
    fn atomic_load(&self, p: &str) -> FsResult<Vec<u8>> {
        self.inner.atomic_load(p)
    }
    fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        self.inner.rename(from, to)
    }
    fn delete_file(&self, p: &str) -> FsResult<()> {
        self.inner.delete_file(p)
    }
    fn delete_dir(&self, p: &str) -> FsResult<()> {
        self.inner.delete_dir(p)
    }
    fn list_dir(&self, p: &str) -> FsResult<Vec<String>> {
        self.inner.list_dir(p)
    }
    fn mkdir(&self, p: &str, recursive: bool) -> FsResult<()> {
        self.record("mkdir", p);
        self.inner.mkdir(p, recursive)
    }
    fn is_exist(&self, p: &str) -> FsResult<bool> {
        self.inner.is_exist(p)
    }
    fn is_dir(&self, p: &str) -> FsResult<bool> {
        self.inner.is_dir(p)
    }
    fn file_length(&self, p: &str) -> FsResult<u64> {
        self.inner.file_length(p)
    }
}

#[test]
fn test_mem_build_then_disk_read_back() {
    let dir = tempdir().unwrap();
    let root = dir.path().to_string_lossy().to_string();
    let table = table();

    let mem = MemStorage::new(
        Arc::new(LocalFs::new()),
        &root,
        Arc::clone(&table) as Arc<dyn EntryTable>,
        cache(),
        scheduler(FlushMode::Inline),
        true,
    );
    mem.make_directory("/seg", true).unwrap();
    write_through(&mem, "/seg/postings", b"payload bytes");
    mem.wait_sync_finish().unwrap();

    // a fresh disk view over the same physical tree and entry table
    let disk = DiskStorage::new(
        Arc::new(LocalFs::new()),
        &root,
        Arc::clone(&table) as Arc<dyn EntryTable>,
        cache(),
        LoadConfigList::new().with_default(OpenType::Mem),
    );
    let reader = disk.create_file_reader("/seg/postings").unwrap();
    assert_eq!(reader.read_at(0, 13).unwrap(), b"payload bytes");
    assert!(table.find("/seg/postings").unwrap().frozen);
}

#[test]
fn test_flush_runs_mkdirs_before_file_writes() {
    let dir = tempdir().unwrap();
    let root = dir.path().to_string_lossy().to_string();
    let fs = Arc::new(RecordingFs::new());

    let mem = MemStorage::new(
        Arc::clone(&fs) as Arc<dyn FsPrimitives>,
        &root,
        table() as Arc<dyn EntryTable>,
        cache(),
        scheduler(FlushMode::Inline),
        true,
    );
    // interleave file writes with directory creation
    mem.make_directory("/a", true).unwrap();
    write_through(&mem, "/a/f1", b"one");
    mem.make_directory("/a/b/c", true).unwrap();
    write_through(&mem, "/a/b/c/f2", b"two");
    mem.wait_sync_finish().unwrap();

    let log = fs.log.lock();
    let last_mkdir = log.iter().rposition(|(op, _)| *op == "mkdir").unwrap();
    let first_write = log.iter().position(|(op, _)| *op == "write").unwrap();
    assert!(last_mkdir < first_write, "directory creation must precede file writes: {log:?}");
    assert_eq!(log.iter().filter(|(op, _)| *op == "write").count(), 2);
}

#[test]
fn test_package_flush_and_disk_read_back() {
    let dir = tempdir().unwrap();
    let root = dir.path().to_string_lossy().to_string();
    let table = table();

    let pkg = PackageMemStorage::new(
        Arc::new(LocalFs::new()),
        &root,
        Arc::clone(&table) as Arc<dyn EntryTable>,
        cache(),
        scheduler(FlushMode::Inline),
        16,
    );
    pkg.make_directory("/unit", true, true).unwrap();
    let mut writer = pkg
        .create_file_writer("/unit/a", WriterOptions::default())
        .unwrap();
    writer.write(b"aaaaa").unwrap();
    writer.close().unwrap();
    let mut writer = pkg
        .create_file_writer("/unit/b", WriterOptions::default())
        .unwrap();
    writer.write(b"bb").unwrap();
    writer.close().unwrap();

    pkg.flush_package("/unit").unwrap();
    pkg.wait_sync_finish().unwrap();

    // the sealed meta is a self-describing JSON document
    let meta_raw = std::fs::read(format!("{root}/unit/{PACKAGE_META_FILE_NAME}")).unwrap();
    let meta: serde_json::Value = serde_json::from_slice(&meta_raw).unwrap();
    assert_eq!(meta["file_align_size"], 16);
    assert_eq!(meta["inner_files"].as_array().unwrap().len(), 2);

    // packaged entries resolve through a fresh disk view as mapped slices
    let disk = DiskStorage::new(
        Arc::new(LocalFs::new()),
        &root,
        Arc::clone(&table) as Arc<dyn EntryTable>,
        cache(),
        LoadConfigList::new().with_default(OpenType::Mmap),
    );
    let reader = disk.create_file_reader("/unit/b").unwrap();
    assert!(reader.node().in_package());
    assert_eq!(reader.read_at(0, 2).unwrap(), b"bb");
    let reader = disk.create_file_reader("/unit/a").unwrap();
    assert_eq!(reader.read_at(0, 5).unwrap(), b"aaaaa");
}

#[test]
fn test_versioned_commits_merge_into_final_package() {
    let dir = tempdir().unwrap();
    let root = dir.path().to_string_lossy().to_string();
    let fs: Arc<dyn FsPrimitives> = Arc::new(LocalFs::new());

    // two builders append to the same unit under different descriptions
    for (description, name, content) in
        [("seg1", "/unit/left", b"left".as_slice()), ("seg2", "/unit/right", b"right".as_slice())]
    {
        let storage = PackageDiskStorage::new(
            Arc::clone(&fs),
            &root,
            table() as Arc<dyn EntryTable>,
            cache(),
            description,
            16,
        );
        storage.make_directory("/unit", true, true).unwrap();
        let mut writer = storage
            .create_file_writer(name, WriterOptions::default())
            .unwrap();
        writer.write(content).unwrap();
        writer.close().unwrap();
        storage.commit_package().unwrap();
    }

    let merged = DirectoryMerger::new()
        .merge_package_files(fs.as_ref(), &format!("{root}/unit"))
        .unwrap()
        .expect("two versioned sources to merge");
    assert_eq!(merged.inner_file_count(), 2);
    // physical files renumbered contiguously from 0
    assert_eq!(merged.physical_file_names[0], "package_file.__data__0");
    assert_eq!(merged.physical_file_names[1], "package_file.__data__1");

    // readable through a disk view built from the merged document
    let table = table();
    for inner in &merged.inner_files {
        let logical = path::join("/unit", &inner.relative_path);
        let physical = format!(
            "{root}/unit/{}",
            merged.physical_file_names[inner.data_file_idx as usize]
        );
        let mut entry = indexfs::EntryMeta::new_file(&logical, &physical, inner.length);
        entry.offset = inner.offset;
        entry.frozen = true;
        table.add_entry_meta(entry).unwrap();
    }
    let disk = DiskStorage::new(
        Arc::clone(&fs),
        &root,
        Arc::clone(&table) as Arc<dyn EntryTable>,
        cache(),
        LoadConfigList::new().with_default(OpenType::Mmap),
    );
    let reader = disk.create_file_reader("/unit/right").unwrap();
    assert_eq!(reader.read_at(0, 5).unwrap(), b"right");
}

#[test]
fn test_external_lock_blocks_freeze() {
    let dir = tempdir().unwrap();
    let root = dir.path().to_string_lossy().to_string();
    let lock = Arc::new(Mutex::new(()));

    let mem = MemStorage::new(
        Arc::new(LocalFs::new()),
        &root,
        table() as Arc<dyn EntryTable>,
        cache(),
        scheduler(FlushMode::Background),
        true,
    )
    .with_external_lock(Arc::clone(&lock));
    mem.make_directory("/seg", true).unwrap();
    write_through(&mem, "/seg/f", b"guarded");

    let guard = lock.lock();
    let future = mem.sync().unwrap();
    // the worker lands the bytes but cannot freeze while the lock is held
    assert_eq!(future.wait_timeout(Duration::from_millis(200)), None);
    drop(guard);
    assert!(future.wait());
}

#[test]
fn test_deferred_flush_error_resurfaces_across_syncs() {
    let dir = tempdir().unwrap();
    let root = dir.path().to_string_lossy().to_string();

    let mem = MemStorage::new(
        Arc::new(LocalFs::new()),
        &root,
        table() as Arc<dyn EntryTable>,
        cache(),
        scheduler(FlushMode::Background),
        true,
    );
    mem.make_directory("/seg", true).unwrap();
    // occupy the destination so the background flush loses the race
    std::fs::create_dir_all(format!("{root}/seg")).unwrap();
    std::fs::write(format!("{root}/seg/f"), b"occupied").unwrap();
    write_through(&mem, "/seg/f", b"loser");

    let future = mem.sync().unwrap();
    assert!(!future.wait());
    match mem.sync() {
        Err(FsError::AlreadyExists(_)) => {}
        other => panic!("expected the parked failure, got {other:?}"),
    }
    // raised exactly once; the pipeline is usable again
    mem.wait_sync_finish().unwrap();
}
