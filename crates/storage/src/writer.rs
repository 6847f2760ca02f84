//! Write handles
//!
//! `FileWriter` buffers a whole file in memory and hands the finished
//! bytes to a store callback on `close()`; the callback is supplied by
//! the owning storage and does the cache, entry-table and flush-queue
//! wiring. `SwapMmapWriter` appends straight into a shared mutable
//! mapping whose readers see bytes as the logical length advances.

use crate::node::{FileNode, SharedMmap};
use indexfs_core::{FsError, FsResult};
use std::sync::Arc;
use tracing::warn;

/// Callback invoked with the finished content on close
pub type StoreFn = Box<dyn FnOnce(Vec<u8>) -> FsResult<()> + Send>;

/// Buffering writer for whole-file content
pub struct FileWriter {
    logical_path: String,
    buf: Vec<u8>,
    store: Option<StoreFn>,
}

impl FileWriter {
    /// Create a writer whose content is delivered to `store` on close.
    pub fn new(logical_path: &str, store: StoreFn) -> Self {
        FileWriter {
            logical_path: logical_path.to_string(),
            buf: Vec::new(),
            store: Some(store),
        }
    }

    /// Logical path being written.
    pub fn logical_path(&self) -> &str {
        &self.logical_path
    }

    /// Bytes buffered so far.
    pub fn length(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Append bytes to the buffer.
    pub fn write(&mut self, data: &[u8]) -> FsResult<()> {
        if self.store.is_none() {
            return Err(FsError::Inconsistent(format!(
                "write to closed writer for {}",
                self.logical_path
            )));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Finish the file: the buffered content is handed to the store
    /// callback exactly once.
    pub fn close(mut self) -> FsResult<()> {
        let store = self.store.take().ok_or_else(|| {
            FsError::Inconsistent(format!("double close of writer for {}", self.logical_path))
        })?;
        store(std::mem::take(&mut self.buf))
    }
}

impl std::io::Write for FileWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        FileWriter::write(self, data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if self.store.is_some() {
            warn!(
                target: "indexfs::storage",
                path = %self.logical_path,
                buffered = self.buf.len(),
                "writer dropped without close, content discarded"
            );
        }
    }
}

/// Appending writer over a shared mutable mapping
pub struct SwapMmapWriter {
    node: Arc<FileNode>,
    shared: Arc<SharedMmap>,
    closed: bool,
}

impl SwapMmapWriter {
    /// Wrap a swap-mmap node created by the owning storage.
    pub fn new(node: Arc<FileNode>) -> FsResult<Self> {
        let shared = node.swap_mmap().ok_or_else(|| {
            FsError::BadArgs(format!(
                "{} is not a swap-mmap node",
                node.logical_path()
            ))
        })?;
        Ok(SwapMmapWriter {
            node,
            shared,
            closed: false,
        })
    }

    /// The node readers concurrently observe.
    pub fn node(&self) -> &Arc<FileNode> {
        &self.node
    }

    /// Bytes written so far.
    pub fn length(&self) -> u64 {
        self.node.length()
    }

    /// Remaining capacity of the backing mapping.
    pub fn remaining(&self) -> u64 {
        self.shared.capacity() as u64 - self.node.length()
    }

    /// Append bytes; readers bounded by the node length see them once the
    /// length is published.
    pub fn write(&mut self, data: &[u8]) -> FsResult<()> {
        if self.closed {
            return Err(FsError::Inconsistent(format!(
                "write to closed swap writer for {}",
                self.node.logical_path()
            )));
        }
        self.node.append(data)
    }

    /// Flush the mapping to its backing file and freeze the node.
    pub fn close(mut self) -> FsResult<()> {
        self.closed = true;
        self.shared.sync()?;
        self.node.freeze();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    #[test]
    fn test_writer_delivers_content_on_close() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&sink);
        let mut writer = FileWriter::new(
            "/f",
            Box::new(move |data| {
                *captured.lock() = data;
                Ok(())
            }),
        );
        writer.write(b"part one ").unwrap();
        writer.write(b"part two").unwrap();
        writer.close().unwrap();
        assert_eq!(&*sink.lock(), b"part one part two");
    }

    #[test]
    fn test_writer_store_error_propagates() {
        let mut writer = FileWriter::new(
            "/f",
            Box::new(|_| Err(FsError::Inconsistent("store failed".into()))),
        );
        writer.write(b"x").unwrap();
        assert!(writer.close().is_err());
    }

    #[test]
    fn test_swap_writer_visible_before_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("swap").to_string_lossy().to_string();
        let shared = SharedMmap::create(&path, 4096).unwrap();
        let node = Arc::new(FileNode::new_swap_mmap("/f", &path, shared));

        let mut writer = SwapMmapWriter::new(Arc::clone(&node)).unwrap();
        writer.write(b"early bytes").unwrap();

        // a concurrent reader of the same node sees the appended prefix
        assert_eq!(node.read_all().unwrap(), b"early bytes");

        writer.close().unwrap();
        assert!(!node.is_dirty());
        assert!(node.append(b"more").is_err());
    }
}
