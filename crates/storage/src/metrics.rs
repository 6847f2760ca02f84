//! Storage metrics
//!
//! One `StorageMetrics` instance lives per storage; every cache insert,
//! remove, and truncate mutates it. The (group × file-type) table is a
//! fixed-size two-dimensional array keyed by bounded enum discriminants —
//! indices come from the enums themselves, never raw arithmetic.

use std::sync::atomic::{AtomicU64, Ordering};

/// How a file's content is represented in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    /// Growable in-memory buffer
    Mem,
    /// Read-only memory mapping
    Mmap,
    /// Memory mapping with resident pages
    MmapLocked,
    /// Fixed-size block reads
    Block,
    /// Buffered positional reads
    Buffered,
    /// View into another node
    Slice,
    /// Directory marker
    Directory,
    /// Opaque resource handle
    Resource,
}

impl FileType {
    /// Number of variants (table dimension)
    pub const COUNT: usize = 8;

    /// Dense index for table lookups.
    pub fn index(self) -> usize {
        match self {
            FileType::Mem => 0,
            FileType::Mmap => 1,
            FileType::MmapLocked => 2,
            FileType::Block => 3,
            FileType::Buffered => 4,
            FileType::Slice => 5,
            FileType::Directory => 6,
            FileType::Resource => 7,
        }
    }
}

/// Which pool a node's bytes are accounted against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricGroup {
    /// Backed by local disk
    Local,
    /// Memory-resident build content
    Mem,
}

impl MetricGroup {
    /// Number of variants (table dimension)
    pub const COUNT: usize = 2;

    /// Dense index for table lookups.
    pub fn index(self) -> usize {
        match self {
            MetricGroup::Local => 0,
            MetricGroup::Mem => 1,
        }
    }
}

#[derive(Debug, Default)]
struct Cell {
    total_length: AtomicU64,
    count: AtomicU64,
}

/// Point-in-time view of one (group, file-type) cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSnapshot {
    /// Sum of node lengths
    pub total_length: u64,
    /// Number of nodes
    pub count: u64,
}

/// Fixed 2-D table of (length, count) counters plus cache counters
#[derive(Debug, Default)]
pub struct StorageMetrics {
    table: [[Cell; FileType::COUNT]; MetricGroup::COUNT],
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_replaces: AtomicU64,
    cache_removes: AtomicU64,
}

impl StorageMetrics {
    /// Zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, group: MetricGroup, file_type: FileType) -> &Cell {
        &self.table[group.index()][file_type.index()]
    }

    /// Account a node entering the cache.
    pub fn on_insert(&self, group: MetricGroup, file_type: FileType, length: u64) {
        let cell = self.cell(group, file_type);
        cell.total_length.fetch_add(length, Ordering::Relaxed);
        cell.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Account a node leaving the cache.
    pub fn on_remove(&self, group: MetricGroup, file_type: FileType, length: u64) {
        let cell = self.cell(group, file_type);
        cell.total_length.fetch_sub(length, Ordering::Relaxed);
        cell.count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Account a length change without a count change.
    pub fn on_truncate(
        &self,
        group: MetricGroup,
        file_type: FileType,
        old_length: u64,
        new_length: u64,
    ) {
        let cell = self.cell(group, file_type);
        if new_length >= old_length {
            cell.total_length
                .fetch_add(new_length - old_length, Ordering::Relaxed);
        } else {
            cell.total_length
                .fetch_sub(old_length - new_length, Ordering::Relaxed);
        }
    }

    /// Read one cell.
    pub fn snapshot(&self, group: MetricGroup, file_type: FileType) -> CellSnapshot {
        let cell = self.cell(group, file_type);
        CellSnapshot {
            total_length: cell.total_length.load(Ordering::Relaxed),
            count: cell.count.load(Ordering::Relaxed),
        }
    }

    /// Record a cache hit.
    pub fn increase_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cache miss.
    pub fn increase_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an insert that replaced a live entry.
    pub fn increase_cache_replace(&self) {
        self.cache_replaces.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an explicit removal.
    pub fn increase_cache_remove(&self) {
        self.cache_removes.fetch_add(1, Ordering::Relaxed);
    }

    /// Cache hit count.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Cache miss count.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Cache replace count.
    pub fn cache_replaces(&self) -> u64 {
        self.cache_replaces.load(Ordering::Relaxed)
    }

    /// Cache remove count.
    pub fn cache_removes(&self) -> u64 {
        self.cache_removes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove_balance() {
        let metrics = StorageMetrics::new();
        metrics.on_insert(MetricGroup::Mem, FileType::Mem, 100);
        metrics.on_insert(MetricGroup::Mem, FileType::Mem, 50);

        let snap = metrics.snapshot(MetricGroup::Mem, FileType::Mem);
        assert_eq!(snap.count, 2);
        assert_eq!(snap.total_length, 150);

        metrics.on_remove(MetricGroup::Mem, FileType::Mem, 100);
        let snap = metrics.snapshot(MetricGroup::Mem, FileType::Mem);
        assert_eq!(snap.count, 1);
        assert_eq!(snap.total_length, 50);
    }

    #[test]
    fn test_groups_are_independent() {
        let metrics = StorageMetrics::new();
        metrics.on_insert(MetricGroup::Local, FileType::Mmap, 4096);

        assert_eq!(metrics.snapshot(MetricGroup::Mem, FileType::Mmap).count, 0);
        assert_eq!(
            metrics.snapshot(MetricGroup::Local, FileType::Mmap).count,
            1
        );
    }

    #[test]
    fn test_truncate_adjusts_length_only() {
        let metrics = StorageMetrics::new();
        metrics.on_insert(MetricGroup::Mem, FileType::Mem, 100);
        metrics.on_truncate(MetricGroup::Mem, FileType::Mem, 100, 40);

        let snap = metrics.snapshot(MetricGroup::Mem, FileType::Mem);
        assert_eq!(snap.count, 1);
        assert_eq!(snap.total_length, 40);

        metrics.on_truncate(MetricGroup::Mem, FileType::Mem, 40, 200);
        assert_eq!(
            metrics.snapshot(MetricGroup::Mem, FileType::Mem).total_length,
            200
        );
    }

    #[test]
    fn test_cache_counters() {
        let metrics = StorageMetrics::new();
        metrics.increase_cache_hit();
        metrics.increase_cache_hit();
        metrics.increase_cache_miss();
        metrics.increase_cache_replace();
        metrics.increase_cache_remove();

        assert_eq!(metrics.cache_hits(), 2);
        assert_eq!(metrics.cache_misses(), 1);
        assert_eq!(metrics.cache_replaces(), 1);
        assert_eq!(metrics.cache_removes(), 1);
    }
}
