//! Read handles over cached file nodes
//!
//! A `FileReader` pins one `Arc<FileNode>`, so its view stays stable even
//! if the cache replaces the entry behind the same logical path.

use crate::node::FileNode;
use indexfs_core::{FsError, FsResult};
use smallvec::SmallVec;
use std::future::{ready, Ready};
use std::sync::Arc;

/// Positional and sequential reads over one pinned node
#[derive(Debug)]
pub struct FileReader {
    node: Arc<FileNode>,
    position: u64,
}

impl FileReader {
    /// Open a reader over `node` starting at offset 0.
    pub fn new(node: Arc<FileNode>) -> Self {
        FileReader { node, position: 0 }
    }

    /// The node this reader is pinned to.
    pub fn node(&self) -> &Arc<FileNode> {
        &self.node
    }

    /// Total readable length.
    pub fn length(&self) -> u64 {
        self.node.length()
    }

    /// Current sequential position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the sequential position.
    pub fn seek(&mut self, offset: u64) -> FsResult<()> {
        if offset > self.node.length() {
            return Err(FsError::BadArgs(format!(
                "seek to {offset} past end of {}",
                self.node.logical_path()
            )));
        }
        self.position = offset;
        Ok(())
    }

    /// Sequential read; returns the bytes actually read, short at EOF.
    pub fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let remaining = self.node.length() - self.position;
        let take = (buf.len() as u64).min(remaining) as usize;
        if take == 0 {
            return Ok(0);
        }
        self.node.read_at(self.position, &mut buf[..take])?;
        self.position += take as u64;
        Ok(take)
    }

    /// Positional read of exactly `length` bytes.
    pub fn read_at(&self, offset: u64, length: usize) -> FsResult<Vec<u8>> {
        let mut buf = vec![0u8; length];
        self.node.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Positional batch read. Ranges must be given in ascending offset
    /// order, non-overlapping, and all inside the file.
    pub fn batch_read_ordered(
        &self,
        ranges: &[(u64, usize)],
    ) -> FsResult<SmallVec<[Vec<u8>; 4]>> {
        let mut previous_end = 0u64;
        for &(offset, length) in ranges {
            if offset < previous_end {
                return Err(FsError::BadArgs(format!(
                    "batch ranges out of order at offset {offset}"
                )));
            }
            let end = offset.checked_add(length as u64).ok_or_else(|| {
                FsError::BadArgs(format!("batch range offset {offset} + {length} overflows"))
            })?;
            if end > self.node.length() {
                return Err(FsError::BadArgs(format!(
                    "batch range [{offset}, {end}) past end of {}",
                    self.node.logical_path()
                )));
            }
            previous_end = end;
        }
        let mut results = SmallVec::new();
        for &(offset, length) in ranges {
            let mut buf = vec![0u8; length];
            self.node.read_at(offset, &mut buf)?;
            results.push(buf);
        }
        Ok(results)
    }

    /// Async positional read. Content is already resident or directly
    /// readable, so the future resolves immediately.
    pub fn read_async(&self, offset: u64, length: usize) -> Ready<FsResult<Vec<u8>>> {
        ready(self.read_at(offset, length))
    }
}
