//! Refcounted cache of live file nodes
//!
//! The cache is the single authority for which `FileNode` is current for a
//! logical path. It keeps exactly one `Arc` per entry, so
//! `Arc::strong_count > 1` on a stored node means some reader, writer or
//! queued flush still holds it. Structural operations refuse to remove an
//! in-use node; replacement parks the displaced node on a deferred list
//! until the last outside handle drops.
//!
//! Both a hash index (point lookups) and an ordered index (prefix scans)
//! are maintained under one mutex. Prefix scans append `/` to the query
//! path first so `/a/bb` never matches `/a/bbb.txt`.

use crate::metrics::StorageMetrics;
use crate::node::FileNode;
use indexfs_core::{BlockMemoryQuotaController, FsError, FsResult};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Default)]
struct CacheInner {
    fast: FxHashMap<String, Arc<FileNode>>,
    ordered: BTreeMap<String, ()>,
    deferred: Vec<Arc<FileNode>>,
}

/// Shared node cache with metric and quota accounting
pub struct FileNodeCache {
    inner: Mutex<CacheInner>,
    metrics: Arc<StorageMetrics>,
    quota: Option<Arc<BlockMemoryQuotaController>>,
}

impl FileNodeCache {
    /// Create an empty cache reporting to `metrics`.
    pub fn new(metrics: Arc<StorageMetrics>) -> Self {
        FileNodeCache {
            inner: Mutex::new(CacheInner::default()),
            metrics,
            quota: None,
        }
    }

    /// Create a cache that additionally reports resident bytes to `quota`.
    pub fn with_quota(
        metrics: Arc<StorageMetrics>,
        quota: Arc<BlockMemoryQuotaController>,
    ) -> Self {
        FileNodeCache {
            inner: Mutex::new(CacheInner::default()),
            metrics,
            quota: Some(quota),
        }
    }

    /// Metrics sink shared with the owning storage.
    pub fn metrics(&self) -> &Arc<StorageMetrics> {
        &self.metrics
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().fast.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().fast.is_empty()
    }

    /// Install `node` as the current entry for its logical path. An
    /// existing entry is displaced; if it is still referenced outside the
    /// cache it is parked on the deferred list instead of dropped, so its
    /// readers keep a stable view.
    pub fn insert(&self, node: Arc<FileNode>) {
        let path = node.logical_path().to_string();
        self.account_insert(&node);
        trace!(target: "indexfs::cache", path = %path, len = node.length(), "insert");

        let mut inner = self.inner.lock();
        inner.ordered.insert(path.clone(), ());
        if let Some(old) = inner.fast.insert(path, node) {
            self.metrics.increase_cache_replace();
            self.account_remove_metrics(&old);
            self.release_node(&mut inner, old);
        }
    }

    /// Look up a node by exact logical path. Hit/miss counters are the
    /// caller's concern; lookups on behalf of internal bookkeeping go
    /// through here too and must not skew them.
    pub fn find(&self, path: &str) -> Option<Arc<FileNode>> {
        self.inner.lock().fast.get(path).cloned()
    }

    /// Remove a single file entry. Refuses directories and nodes with
    /// outstanding handles.
    pub fn remove_file(&self, path: &str) -> FsResult<()> {
        let mut inner = self.inner.lock();
        let node = inner
            .fast
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if node.is_directory() {
            return Err(FsError::IsDirectory(path.to_string()));
        }
        if Arc::strong_count(node) > 1 {
            return Err(FsError::Inconsistent(format!(
                "remove of {path} while handles are open"
            )));
        }
        let node = inner.fast.remove(path).unwrap_or_else(|| unreachable!());
        inner.ordered.remove(path);
        self.metrics.increase_cache_remove();
        self.account_remove_metrics(&node);
        self.account_free(&node);
        debug!(target: "indexfs::cache", path = %path, "remove_file");
        Ok(())
    }

    /// Remove a directory entry and everything beneath it, or nothing at
    /// all. The whole subtree is checked for outstanding handles before
    /// the first entry is touched.
    pub fn remove_directory(&self, path: &str) -> FsResult<()> {
        let mut inner = self.inner.lock();
        let node = inner
            .fast
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if !node.is_directory() {
            return Err(FsError::NotADirectory(path.to_string()));
        }

        let mut targets = vec![path.to_string()];
        let prefix = format!("{path}/");
        targets.extend(
            inner
                .ordered
                .range(prefix.clone()..)
                .take_while(|(p, _)| p.starts_with(&prefix))
                .map(|(p, _)| p.clone()),
        );

        for target in &targets {
            let node = &inner.fast[target.as_str()];
            if Arc::strong_count(node) > 1 {
                return Err(FsError::Inconsistent(format!(
                    "remove of directory {path} while {target} has open handles"
                )));
            }
        }

        for target in &targets {
            let node = inner.fast.remove(target.as_str()).unwrap_or_else(|| unreachable!());
            inner.ordered.remove(target.as_str());
            self.metrics.increase_cache_remove();
            self.account_remove_metrics(&node);
            self.account_free(&node);
        }
        debug!(target: "indexfs::cache", path = %path, removed = targets.len(), "remove_directory");
        Ok(())
    }

    /// List cached entries under a directory, as paths relative to it.
    /// Non-recursive listings keep only direct children; recursive
    /// listings include the whole subtree with a `/` suffix on directory
    /// entries. `physical_only` skips entries living inside a package.
    pub fn list_dir(
        &self,
        path: &str,
        recursive: bool,
        physical_only: bool,
    ) -> FsResult<Vec<String>> {
        let inner = self.inner.lock();
        if let Some(node) = inner.fast.get(path) {
            if !node.is_directory() {
                return Err(FsError::NotADirectory(path.to_string()));
            }
        }
        let prefix = if path.is_empty() || path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let mut names: Vec<String> = Vec::new();
        for (p, _) in inner
            .ordered
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
        {
            let rest = &p[prefix.len()..];
            if !recursive && rest.contains('/') {
                continue;
            }
            let node = &inner.fast[p.as_str()];
            if physical_only && node.in_package() {
                continue;
            }
            if recursive && node.is_directory() {
                names.push(format!("{rest}/"));
            } else {
                names.push(rest.to_string());
            }
        }
        Ok(names)
    }

    /// All cached nodes at or below `path`, sorted by logical path.
    pub fn subtree(&self, path: &str) -> Vec<Arc<FileNode>> {
        let inner = self.inner.lock();
        let prefix = format!("{path}/");
        let mut nodes = Vec::new();
        if let Some(node) = inner.fast.get(path) {
            nodes.push(Arc::clone(node));
        }
        for (p, _) in inner
            .ordered
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
        {
            nodes.push(Arc::clone(&inner.fast[p.as_str()]));
        }
        nodes
    }

    /// Evict every clean entry with no outside handles and drain the
    /// deferred list. Dirty nodes (including all directory markers) stay.
    /// Returns the number of entries evicted.
    pub fn clean(&self) -> usize {
        let mut inner = self.inner.lock();
        let evictable: Vec<String> = inner
            .fast
            .iter()
            .filter(|(_, node)| !node.is_dirty() && Arc::strong_count(node) == 1)
            .map(|(p, _)| p.clone())
            .collect();
        for path in &evictable {
            let node = inner.fast.remove(path.as_str()).unwrap_or_else(|| unreachable!());
            inner.ordered.remove(path.as_str());
            self.account_remove_metrics(&node);
            self.account_free(&node);
        }
        let before = inner.deferred.len();
        let mut kept = Vec::new();
        for node in inner.deferred.drain(..) {
            if Arc::strong_count(&node) > 1 {
                kept.push(node);
            } else {
                self.account_free(&node);
            }
        }
        inner.deferred = kept;
        let drained = before - inner.deferred.len();
        if !evictable.is_empty() || drained > 0 {
            debug!(
                target: "indexfs::cache",
                evicted = evictable.len(),
                drained,
                "clean"
            );
        }
        evictable.len()
    }

    /// Evict specific paths if clean and unreferenced; in-use or dirty
    /// entries are silently skipped. Returns the number evicted.
    pub fn clean_files(&self, paths: &[String]) -> usize {
        let mut inner = self.inner.lock();
        let mut evicted = 0;
        for path in paths {
            let eligible = match inner.fast.get(path.as_str()) {
                Some(node) => !node.is_dirty() && Arc::strong_count(node) == 1,
                None => false,
            };
            if !eligible {
                continue;
            }
            let node = inner.fast.remove(path.as_str()).unwrap_or_else(|| unreachable!());
            inner.ordered.remove(path.as_str());
            self.account_remove_metrics(&node);
            self.account_free(&node);
            evicted += 1;
        }
        evicted
    }

    /// Change a cached file's logical length, keeping metric and quota
    /// totals in step.
    pub fn truncate(&self, path: &str, new_length: u64) -> FsResult<()> {
        let node = self
            .find(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let old_length = node.length();
        let old_resident = node.resident_bytes();
        node.set_length(new_length)?;
        self.metrics
            .on_truncate(node.metric_group(), node.file_type(), old_length, new_length);
        if let Some(quota) = &self.quota {
            let new_resident = node.resident_bytes();
            if new_resident >= old_resident {
                quota.allocate(new_resident - old_resident);
            } else {
                quota.free(old_resident - new_resident);
            }
        }
        Ok(())
    }

    fn account_insert(&self, node: &FileNode) {
        self.metrics
            .on_insert(node.metric_group(), node.file_type(), node.length());
        if let Some(quota) = &self.quota {
            quota.allocate(node.resident_bytes());
        }
    }

    fn account_remove_metrics(&self, node: &FileNode) {
        self.metrics
            .on_remove(node.metric_group(), node.file_type(), node.length());
    }

    fn account_free(&self, node: &FileNode) {
        if let Some(quota) = &self.quota {
            quota.free(node.resident_bytes());
        }
    }

    // Quota for a displaced node is released when its last outside handle
    // lets go, either here at replacement time or at the deferred drain.
    fn release_node(&self, inner: &mut CacheInner, old: Arc<FileNode>) {
        if Arc::strong_count(&old) > 1 {
            inner.deferred.push(old);
        } else {
            self.account_free(&old);
        }
    }
}

impl std::fmt::Debug for FileNodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FileNodeCache")
            .field("entries", &inner.fast.len())
            .field("deferred", &inner.deferred.len())
            .finish()
    }
}
