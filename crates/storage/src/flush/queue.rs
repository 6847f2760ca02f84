//! Ordered accumulation and dumping of flush operations

use super::operation::{FlushOperation, RetryPolicy};
use crate::cache::FileNodeCache;
use indexfs_core::{EntryTable, FsResult};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Shared state the queue updates as operations land
///
/// After each successful operation its nodes are frozen in the cache and
/// its logical paths are frozen in the entry table, under the external
/// lock when one is supplied, so observers never see a node clean while
/// the table still calls it mutable.
pub struct FreezeContext {
    /// External logical→physical index
    pub entry_table: Arc<dyn EntryTable>,
    /// Cache holding the flushed nodes
    pub cache: Arc<FileNodeCache>,
    /// Optional lock serializing freeze with external table readers
    pub external_lock: Option<Arc<Mutex<()>>>,
}

impl FreezeContext {
    // Consumes the operation so its node references are gone before the
    // eviction pass; otherwise the operation's own handle would keep
    // every flushed node pinned in the cache.
    fn freeze(&self, op: FlushOperation) -> FsResult<()> {
        let _guard = self.external_lock.as_ref().map(|lock| lock.lock());
        let nodes = op.nodes();
        let paths = op.logical_paths();
        drop(op);
        for node in &nodes {
            node.freeze();
        }
        drop(nodes);
        self.entry_table.freeze(&paths)?;
        // the durable copy supersedes the in-memory one; entries still
        // held by readers are skipped
        self.cache.clean_files(&paths);
        Ok(())
    }
}

/// FIFO of pending flush operations for one sync cycle
#[derive(Default)]
pub struct FlushOperationQueue {
    ops: Mutex<Vec<FlushOperation>>,
}

impl FlushOperationQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue one operation.
    pub fn push(&self, op: FlushOperation) {
        self.ops.lock().push(op);
    }

    /// Number of pending operations.
    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }

    /// Move every pending operation out, directory creations first so a
    /// file flush never races its parent directory.
    pub fn take_ordered(&self) -> Vec<FlushOperation> {
        let mut ops = std::mem::take(&mut *self.ops.lock());
        // stable: enqueue order is preserved within each class
        ops.sort_by_key(|op| !op.is_mkdir());
        ops
    }

    /// Execute everything pending. Each operation freezes its paths as it
    /// lands; the first final failure stops the dump and is returned, with
    /// already-landed operations staying frozen.
    pub fn dump(&self, policy: RetryPolicy, context: &FreezeContext) -> FsResult<()> {
        let ops = self.take_ordered();
        if ops.is_empty() {
            return Ok(());
        }
        let count = ops.len();
        debug!(target: "indexfs::flush", operations = count, "dump start");
        for op in ops {
            op.execute_with_retry(policy)?;
            context.freeze(op)?;
        }
        debug!(target: "indexfs::flush", operations = count, "dump done");
        Ok(())
    }
}
