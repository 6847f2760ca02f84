//! Memory-mapped backing for file nodes
//!
//! Two flavors:
//! - `MappedFile`: read-only mapping shared across readers of the same
//!   physical path via `MmapRegistry`, so every reader observes the same
//!   base address.
//! - `SharedMmap`: mutable mapping used by the swap-mmap write path. A
//!   writer appends directly into the mapping while readers holding the
//!   same `Arc` observe the bytes immediately — previously returned
//!   pointers stay valid as the logical file grows.

use indexfs_core::{FsError, FsResult};
use memmap2::{Mmap, MmapMut};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Read-only shared mapping of one physical file
pub struct MappedFile {
    mmap: Mmap,
    path: String,
}

impl MappedFile {
    /// Map `path` read-only. With `warm`, touch every page so the mapping
    /// is resident up front (the locked open type).
    pub fn open(path: &str, warm: bool) -> FsResult<Arc<MappedFile>> {
        let file = std::fs::File::open(path).map_err(|e| FsError::from_io(e, path))?;
        // Safety: the mapping is read-only and the backing file is owned by
        // this storage; concurrent truncation is excluded by the flush
        // pipeline's freeze discipline.
        let mmap = unsafe { Mmap::map(&file) }.map_err(FsError::Io)?;
        if warm {
            let mut checksum = 0u8;
            for chunk in mmap.chunks(4096) {
                checksum ^= chunk[0];
            }
            std::hint::black_box(checksum);
        }
        Ok(Arc::new(MappedFile {
            mmap,
            path: path.to_string(),
        }))
    }

    /// Mapped bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// Mapped length.
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Physical path backing the mapping.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Deduplicates read-only mappings by physical path
///
/// Holds weak references only: a mapping lives exactly as long as some
/// node still uses it.
#[derive(Default)]
pub struct MmapRegistry {
    map: Mutex<FxHashMap<String, Weak<MappedFile>>>,
}

impl MmapRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or reuse) the shared mapping for `path`. Two callers with the
    /// same path get pointer-equal base addresses.
    pub fn open_shared(&self, path: &str, warm: bool) -> FsResult<Arc<MappedFile>> {
        let mut map = self.map.lock();
        if let Some(existing) = map.get(path).and_then(Weak::upgrade) {
            debug!(target: "indexfs::storage", path, "reusing shared mapping");
            return Ok(existing);
        }
        let mapped = MappedFile::open(path, warm)?;
        map.insert(path.to_string(), Arc::downgrade(&mapped));
        Ok(mapped)
    }

    /// Drop registry entries whose mapping is gone.
    pub fn evict_dead(&self) {
        self.map.lock().retain(|_, weak| weak.strong_count() > 0);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.map
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Whether no live mappings are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mutable mapping for the swap-mmap write path
///
/// Content is written directly into a fixed-capacity mapping instead of a
/// growable buffer, so pointers handed to readers stay valid while the
/// writer appends. While the owning node is dirty only the producing
/// thread writes; visibility of freshly written bytes to concurrent
/// readers is immediate and needs no flush.
pub struct SharedMmap {
    mmap: UnsafeCell<MmapMut>,
    capacity: usize,
    path: String,
}

// Safety: writes go through `write_at` with bounds checks; the single
// producer rule (§ ownership discipline) excludes write-write races, and
// readers accept racing with the producer on not-yet-frozen suffixes.
unsafe impl Send for SharedMmap {}
unsafe impl Sync for SharedMmap {}

impl SharedMmap {
    /// Create the backing file at `path` with `capacity` bytes and map it.
    pub fn create(path: &str, capacity: usize) -> FsResult<Arc<SharedMmap>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| FsError::from_io(e, path))?;
        file.set_len(capacity as u64).map_err(FsError::Io)?;
        // Safety: file just sized to `capacity`; mapping outlives no handle.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(FsError::Io)?;
        Ok(Arc::new(SharedMmap {
            mmap: UnsafeCell::new(mmap),
            capacity,
            path: path.to_string(),
        }))
    }

    /// Mapping capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Backing file path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *const u8 {
        unsafe { (*self.mmap.get()).as_ptr() }
    }

    /// Copy `data` into the mapping at `offset`. `BadArgs` past capacity.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> FsResult<()> {
        if offset + data.len() > self.capacity {
            return Err(FsError::BadArgs(format!(
                "swap-mmap write [{}, {}) exceeds capacity {}",
                offset,
                offset + data.len(),
                self.capacity
            )));
        }
        unsafe {
            let base = (*self.mmap.get()).as_mut_ptr();
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset), data.len());
        }
        Ok(())
    }

    /// Copy bytes out of the mapping at `offset`. `BadArgs` past capacity.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> FsResult<()> {
        if offset + buf.len() > self.capacity {
            return Err(FsError::BadArgs(format!(
                "swap-mmap read [{}, {}) exceeds capacity {}",
                offset,
                offset + buf.len(),
                self.capacity
            )));
        }
        unsafe {
            let base = (*self.mmap.get()).as_ptr();
            std::ptr::copy_nonoverlapping(base.add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Persist mapped bytes to the backing file.
    pub fn sync(&self) -> FsResult<()> {
        unsafe { (*self.mmap.get()).flush() }.map_err(FsError::Io)
    }
}
