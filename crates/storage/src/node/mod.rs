//! In-memory representation of one logical file
//!
//! A `FileNode` pairs a logical identity (path, type, length, dirty flag)
//! with one of a closed set of content representations. A node is owned
//! exclusively by whichever component constructed it until it enters the
//! `FileNodeCache`; from then on it is shared between the cache, any open
//! reader/writer handles, and (transiently) a queued flush operation.
//!
//! While dirty, only the producing thread mutates content. `freeze()`
//! clears the dirty flag, after which the content is immutable and safe
//! for lock-free concurrent reads.

pub mod mmap;

pub use mmap::{MappedFile, MmapRegistry, SharedMmap};

use crate::metrics::{FileType, MetricGroup};
use indexfs_core::{FsError, FsPrimitives, FsResult, OpenType};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Default chunk size for `Block` reads
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

enum NodeContent {
    Mem(RwLock<Vec<u8>>),
    Mmap(Arc<MappedFile>),
    SwapMmap(Arc<SharedMmap>),
    Slice { base: Arc<FileNode>, offset: u64 },
    Buffered { fs: Arc<dyn FsPrimitives>, block_size: usize },
    Directory,
    Resource(Mutex<Option<Arc<dyn Any + Send + Sync>>>),
}

/// One logical file's in-memory state and content
pub struct FileNode {
    logical_path: String,
    physical_path: String,
    file_type: FileType,
    open_type: OpenType,
    length: AtomicU64,
    dirty: AtomicBool,
    in_package: AtomicBool,
    metric_group: MetricGroup,
    content: NodeContent,
}

impl std::fmt::Debug for FileNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileNode")
            .field("logical_path", &self.logical_path)
            .field("physical_path", &self.physical_path)
            .field("file_type", &self.file_type)
            .field("length", &self.length())
            .field("dirty", &self.is_dirty())
            .field("in_package", &self.in_package())
            .finish()
    }
}

impl FileNode {
    fn base(
        logical_path: &str,
        physical_path: &str,
        file_type: FileType,
        open_type: OpenType,
        length: u64,
        dirty: bool,
        metric_group: MetricGroup,
        content: NodeContent,
    ) -> FileNode {
        FileNode {
            logical_path: logical_path.to_string(),
            physical_path: physical_path.to_string(),
            file_type,
            open_type,
            length: AtomicU64::new(length),
            dirty: AtomicBool::new(dirty),
            in_package: AtomicBool::new(false),
            metric_group,
            content,
        }
    }

    /// Growable in-memory buffer node. Dirty nodes come from the write
    /// path; clean ones from fully loading a disk file.
    pub fn new_mem(
        logical_path: &str,
        physical_path: &str,
        data: Vec<u8>,
        dirty: bool,
        metric_group: MetricGroup,
    ) -> FileNode {
        let len = data.len() as u64;
        Self::base(
            logical_path,
            physical_path,
            FileType::Mem,
            OpenType::Mem,
            len,
            dirty,
            metric_group,
            NodeContent::Mem(RwLock::new(data)),
        )
    }

    /// Read-only mapped node (shared mapping).
    pub fn new_mmap(
        logical_path: &str,
        physical_path: &str,
        mapped: Arc<MappedFile>,
        locked: bool,
    ) -> FileNode {
        let len = mapped.len() as u64;
        let (file_type, open_type) = if locked {
            (FileType::MmapLocked, OpenType::MmapLocked)
        } else {
            (FileType::Mmap, OpenType::Mmap)
        };
        Self::base(
            logical_path,
            physical_path,
            file_type,
            open_type,
            len,
            false,
            MetricGroup::Local,
            NodeContent::Mmap(mapped),
        )
    }

    /// Mutable swap-mmap node. Starts dirty with logical length 0; length
    /// grows as the writer appends.
    pub fn new_swap_mmap(
        logical_path: &str,
        physical_path: &str,
        shared: Arc<SharedMmap>,
    ) -> FileNode {
        Self::base(
            logical_path,
            physical_path,
            FileType::Mmap,
            OpenType::Mmap,
            0,
            true,
            MetricGroup::Mem,
            NodeContent::SwapMmap(shared),
        )
    }

    /// View into a frozen base node.
    pub fn new_slice(
        logical_path: &str,
        base: Arc<FileNode>,
        offset: u64,
        length: u64,
    ) -> FsResult<FileNode> {
        let end = offset.checked_add(length).ok_or_else(|| {
            FsError::BadArgs(format!("slice offset {offset} + {length} overflows"))
        })?;
        if end > base.length() {
            return Err(FsError::BadArgs(format!(
                "slice [{}, {}) exceeds base node length {}",
                offset,
                end,
                base.length()
            )));
        }
        let physical = base.physical_path().to_string();
        let group = base.metric_group();
        Ok(Self::base(
            logical_path,
            &physical,
            FileType::Slice,
            base.open_type(),
            length,
            false,
            group,
            NodeContent::Slice { base, offset },
        ))
    }

    /// Node backed by positional reads against the physical file.
    /// `block_size` of 0 means plain buffered reads; nonzero means
    /// chunked block reads.
    pub fn new_buffered(
        logical_path: &str,
        physical_path: &str,
        fs: Arc<dyn FsPrimitives>,
        length: u64,
        block_size: usize,
    ) -> FileNode {
        let (file_type, open_type) = if block_size > 0 {
            (FileType::Block, OpenType::Block)
        } else {
            (FileType::Buffered, OpenType::Buffered)
        };
        Self::base(
            logical_path,
            physical_path,
            file_type,
            open_type,
            length,
            false,
            MetricGroup::Local,
            NodeContent::Buffered { fs, block_size },
        )
    }

    /// Directory marker node. Always dirty so it is never lazily evicted.
    pub fn new_directory(
        logical_path: &str,
        physical_path: &str,
        metric_group: MetricGroup,
    ) -> FileNode {
        Self::base(
            logical_path,
            physical_path,
            FileType::Directory,
            OpenType::Buffered,
            0,
            true,
            metric_group,
            NodeContent::Directory,
        )
    }

    /// Opaque resource handle.
    pub fn new_resource(logical_path: &str, metric_group: MetricGroup) -> FileNode {
        Self::base(
            logical_path,
            "",
            FileType::Resource,
            OpenType::Mem,
            0,
            true,
            metric_group,
            NodeContent::Resource(Mutex::new(None)),
        )
    }

    /// Logical path identity.
    pub fn logical_path(&self) -> &str {
        &self.logical_path
    }

    /// Physical location realized for this node.
    pub fn physical_path(&self) -> &str {
        &self.physical_path
    }

    /// Content representation.
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    /// Open type this node was created with.
    pub fn open_type(&self) -> OpenType {
        self.open_type
    }

    /// Current logical length in bytes.
    pub fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    /// Whether content may still change.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Whether this is a directory marker.
    pub fn is_directory(&self) -> bool {
        matches!(self.content, NodeContent::Directory)
    }

    /// Whether the node's bytes live inside a package data file.
    pub fn in_package(&self) -> bool {
        self.in_package.load(Ordering::Relaxed)
    }

    /// Flag the node as packaged (set before cache insertion).
    pub fn mark_in_package(&self) {
        self.in_package.store(true, Ordering::Relaxed);
    }

    /// Metric group the node is accounted against.
    pub fn metric_group(&self) -> MetricGroup {
        self.metric_group
    }

    /// Make the node immutable. Directory markers stay dirty: they are
    /// removed explicitly, never evicted by `clean()`.
    pub fn freeze(&self) {
        if !self.is_directory() {
            self.dirty.store(false, Ordering::Release);
        }
    }

    /// Bytes this node keeps resident in memory (quota accounting).
    pub fn resident_bytes(&self) -> u64 {
        match &self.content {
            NodeContent::Mem(_) => self.length(),
            NodeContent::SwapMmap(shared) => shared.capacity() as u64,
            _ => 0,
        }
    }

    /// Underlying shared swap mapping, if this is a swap-mmap node.
    pub fn swap_mmap(&self) -> Option<Arc<SharedMmap>> {
        match &self.content {
            NodeContent::SwapMmap(shared) => Some(Arc::clone(shared)),
            _ => None,
        }
    }

    /// Underlying read-only mapping, if any.
    pub fn mapped_file(&self) -> Option<Arc<MappedFile>> {
        match &self.content {
            NodeContent::Mmap(mapped) => Some(Arc::clone(mapped)),
            _ => None,
        }
    }

    /// Copy bytes out of the node at `offset`. Reading outside
    /// `[0, length)` is `BadArgs`; directory and resource nodes do not
    /// support reads.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| {
                FsError::BadArgs(format!(
                    "read offset {offset} + {} overflows",
                    buf.len()
                ))
            })?;
        if end > self.length() {
            return Err(FsError::BadArgs(format!(
                "read [{}, {}) past end of {} (len {})",
                offset,
                end,
                self.logical_path,
                self.length()
            )));
        }
        match &self.content {
            NodeContent::Mem(data) => {
                let guard = data.read();
                buf.copy_from_slice(&guard[offset as usize..end as usize]);
                Ok(buf.len())
            }
            NodeContent::Mmap(mapped) => {
                buf.copy_from_slice(&mapped.as_bytes()[offset as usize..end as usize]);
                Ok(buf.len())
            }
            NodeContent::SwapMmap(shared) => {
                shared.read_at(offset as usize, buf)?;
                Ok(buf.len())
            }
            NodeContent::Slice { base, offset: start } => base.read_at(start + offset, buf),
            NodeContent::Buffered { fs, block_size } => {
                if *block_size == 0 {
                    let bytes = fs.read_range(&self.physical_path, offset, buf.len())?;
                    buf.copy_from_slice(&bytes);
                    return Ok(buf.len());
                }
                // Block type: chunked reads on block boundaries
                let mut copied = 0usize;
                while copied < buf.len() {
                    let pos = offset + copied as u64;
                    let within_block = (pos % *block_size as u64) as usize;
                    let take = (*block_size - within_block).min(buf.len() - copied);
                    let bytes = fs.read_range(&self.physical_path, pos, take)?;
                    buf[copied..copied + take].copy_from_slice(&bytes);
                    copied += take;
                }
                Ok(buf.len())
            }
            NodeContent::Directory => Err(FsError::NotSupported("read on a directory node")),
            NodeContent::Resource(_) => Err(FsError::NotSupported("read on a resource node")),
        }
    }

    /// Copy the whole content out.
    pub fn read_all(&self) -> FsResult<Vec<u8>> {
        let mut buf = vec![0u8; self.length() as usize];
        self.read_at(0, &mut buf)?;
        Ok(buf)
    }

    /// Append bytes. Valid only while dirty, for the mem and swap-mmap
    /// representations; the single producer rule applies.
    pub fn append(&self, data: &[u8]) -> FsResult<()> {
        if !self.is_dirty() {
            return Err(FsError::Inconsistent(format!(
                "append to frozen node {}",
                self.logical_path
            )));
        }
        match &self.content {
            NodeContent::Mem(buf) => {
                let mut guard = buf.write();
                guard.extend_from_slice(data);
                self.length.store(guard.len() as u64, Ordering::Release);
                Ok(())
            }
            NodeContent::SwapMmap(shared) => {
                let offset = self.length();
                shared.write_at(offset as usize, data)?;
                // Length is published after the bytes so readers bounded by
                // length() never observe unwritten content.
                self.length
                    .store(offset + data.len() as u64, Ordering::Release);
                Ok(())
            }
            _ => Err(FsError::NotSupported("append on a read-only node")),
        }
    }

    /// Adjust the logical length in place (growable writer shrink/extend).
    pub fn set_length(&self, new_length: u64) -> FsResult<()> {
        match &self.content {
            NodeContent::Mem(buf) => {
                let mut guard = buf.write();
                guard.resize(new_length as usize, 0);
                self.length.store(new_length, Ordering::Release);
                Ok(())
            }
            NodeContent::SwapMmap(shared) => {
                if new_length as usize > shared.capacity() {
                    return Err(FsError::BadArgs(format!(
                        "truncate past swap-mmap capacity {}",
                        shared.capacity()
                    )));
                }
                self.length.store(new_length, Ordering::Release);
                Ok(())
            }
            _ => Err(FsError::NotSupported("set_length on a read-only node")),
        }
    }

    /// Attach an opaque payload to a resource node.
    pub fn set_resource(&self, payload: Arc<dyn Any + Send + Sync>) -> FsResult<()> {
        match &self.content {
            NodeContent::Resource(slot) => {
                *slot.lock() = Some(payload);
                Ok(())
            }
            _ => Err(FsError::NotSupported("set_resource on a non-resource node")),
        }
    }

    /// Fetch the opaque payload of a resource node.
    pub fn resource(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        match &self.content {
            NodeContent::Resource(slot) => slot.lock().clone(),
            _ => None,
        }
    }
}
