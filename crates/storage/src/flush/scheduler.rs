//! Flush execution: inline or on a dedicated worker thread
//!
//! Background mode owns one worker named `indexfs-flush` driven by a
//! mutex/condvar pair. A failed background dump is parked as a deferred
//! error and re-surfaced to the caller on the next synchronous wait, so
//! asynchronous failures are never silently dropped.

use super::future::{FlushFuture, FlushPromise};
use super::operation::RetryPolicy;
use super::queue::{FlushOperationQueue, FreezeContext};
use indexfs_core::FsError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info};

/// Where submitted flushes run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Execute on the submitting thread before `submit` returns
    Inline,
    /// Execute on the scheduler's worker thread
    Background,
}

struct FlushTask {
    queue: Arc<FlushOperationQueue>,
    context: FreezeContext,
    promise: FlushPromise,
}

#[derive(Default)]
struct WorkerState {
    pending: VecDeque<FlushTask>,
    in_flight: usize,
    shutdown: bool,
}

struct SchedulerShared {
    state: Mutex<WorkerState>,
    cond: Condvar,
    idle: Condvar,
    policy: RetryPolicy,
    deferred_error: Mutex<Option<FsError>>,
}

/// Runs flush queue dumps and tracks deferred failures
pub struct FlushScheduler {
    mode: FlushMode,
    shared: Arc<SchedulerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FlushScheduler {
    /// Create a scheduler; background mode spawns the worker immediately.
    pub fn new(mode: FlushMode, policy: RetryPolicy) -> Self {
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(WorkerState::default()),
            cond: Condvar::new(),
            idle: Condvar::new(),
            policy,
            deferred_error: Mutex::new(None),
        });
        let worker = if mode == FlushMode::Background {
            let worker_shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name("indexfs-flush".to_string())
                .spawn(move || worker_loop(worker_shared))
                .unwrap_or_else(|e| panic!("failed to spawn flush worker: {e}"));
            Some(handle)
        } else {
            None
        };
        FlushScheduler {
            mode,
            shared,
            worker: Mutex::new(worker),
        }
    }

    /// Active mode.
    pub fn mode(&self) -> FlushMode {
        self.mode
    }

    /// Submit one queue for dumping. Inline mode completes before
    /// returning; background mode hands the queue to the worker.
    pub fn submit(&self, queue: Arc<FlushOperationQueue>, context: FreezeContext) -> FlushFuture {
        let (future, promise) = FlushFuture::channel();
        match self.mode {
            FlushMode::Inline => match queue.dump(self.shared.policy, &context) {
                Ok(()) => promise.set(true),
                Err(err) => {
                    error!(target: "indexfs::flush", error = %err, "inline flush failed");
                    self.park_error(err);
                    promise.set(false);
                }
            },
            FlushMode::Background => {
                let mut state = self.shared.state.lock();
                state.pending.push_back(FlushTask {
                    queue,
                    context,
                    promise,
                });
                drop(state);
                self.shared.cond.notify_one();
            }
        }
        future
    }

    /// Block until every submitted flush has finished.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while !state.pending.is_empty() || state.in_flight > 0 {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Take the deferred error from an earlier failed flush, if any.
    pub fn take_error(&self) -> Option<FsError> {
        self.shared.deferred_error.lock().take()
    }

    fn park_error(&self, err: FsError) {
        let mut slot = self.shared.deferred_error.lock();
        // keep the first failure; later ones are usually knock-on effects
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            {
                let mut state = self.shared.state.lock();
                state.shutdown = true;
            }
            self.shared.cond.notify_all();
            if handle.join().is_err() {
                error!(target: "indexfs::flush", "flush worker panicked during shutdown");
            }
        }
    }
}

fn worker_loop(shared: Arc<SchedulerShared>) {
    info!(target: "indexfs::flush", "flush worker started");
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.pending.pop_front() {
                    state.in_flight += 1;
                    break task;
                }
                if state.shutdown {
                    info!(target: "indexfs::flush", "flush worker stopping");
                    return;
                }
                shared.cond.wait(&mut state);
            }
        };

        let result = task.queue.dump(shared.policy, &task.context);
        match result {
            Ok(()) => task.promise.set(true),
            Err(err) => {
                error!(target: "indexfs::flush", error = %err, "background flush failed");
                let mut slot = shared.deferred_error.lock();
                if slot.is_none() {
                    *slot = Some(err);
                }
                drop(slot);
                task.promise.set(false);
            }
        }

        let mut state = shared.state.lock();
        state.in_flight -= 1;
        if state.pending.is_empty() && state.in_flight == 0 {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FileNodeCache;
    use crate::flush::operation::FlushOperation;
    use crate::metrics::{MetricGroup, StorageMetrics};
    use crate::node::FileNode;
    use indexfs_core::{EntryTable, FsPrimitives, LocalFs, SimpleEntryTable};
    use tempfile::tempdir;

    fn context() -> (FreezeContext, Arc<SimpleEntryTable>) {
        let table = Arc::new(SimpleEntryTable::new());
        let context = FreezeContext {
            entry_table: Arc::clone(&table) as Arc<dyn EntryTable>,
            cache: Arc::new(FileNodeCache::new(Arc::new(StorageMetrics::new()))),
            external_lock: None,
        };
        (context, table)
    }

    fn single_op(fs: &Arc<dyn FsPrimitives>, logical: &str, physical: &str) -> FlushOperation {
        FlushOperation::Single {
            fs: Arc::clone(fs),
            node: Arc::new(FileNode::new_mem(
                logical,
                physical,
                b"content".to_vec(),
                true,
                MetricGroup::Mem,
            )),
            physical_path: physical.to_string(),
            atomic: true,
            snapshot: None,
        }
    }

    #[test]
    fn test_background_flush_completes() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FsPrimitives> = Arc::new(LocalFs::new());
        let target = dir.path().join("f").to_string_lossy().to_string();
        let (context, table) = context();
        table.create_file("/f", &target).unwrap();

        let scheduler = FlushScheduler::new(FlushMode::Background, RetryPolicy::none());
        let queue = Arc::new(FlushOperationQueue::new());
        queue.push(single_op(&fs, "/f", &target));

        let future = scheduler.submit(queue, context);
        assert!(future.wait());
        scheduler.wait_idle();
        assert_eq!(std::fs::read(&target).unwrap(), b"content");
        assert!(table.find("/f").unwrap().frozen);
        assert!(scheduler.take_error().is_none());
    }

    #[test]
    fn test_deferred_error_surfaces_once() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FsPrimitives> = Arc::new(LocalFs::new());
        let target = dir.path().join("f").to_string_lossy().to_string();
        std::fs::write(&target, b"occupied").unwrap();
        let (context, _) = context();

        let scheduler = FlushScheduler::new(FlushMode::Background, RetryPolicy::none());
        let queue = Arc::new(FlushOperationQueue::new());
        queue.push(single_op(&fs, "/f", &target));

        let future = scheduler.submit(queue, context);
        assert!(!future.wait());
        let err = scheduler.take_error().unwrap();
        assert!(err.is_race());
        assert!(scheduler.take_error().is_none());
    }

    #[test]
    fn test_inline_mode_runs_on_caller() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FsPrimitives> = Arc::new(LocalFs::new());
        let target = dir.path().join("f").to_string_lossy().to_string();
        let (context, _) = context();

        let scheduler = FlushScheduler::new(FlushMode::Inline, RetryPolicy::none());
        let queue = Arc::new(FlushOperationQueue::new());
        queue.push(single_op(&fs, "/f", &target));

        let future = scheduler.submit(queue, context);
        // already resolved when submit returns
        assert_eq!(future.try_wait(), Some(true));
        assert_eq!(std::fs::read(&target).unwrap(), b"content");
    }
}
