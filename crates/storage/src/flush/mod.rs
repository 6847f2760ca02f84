//! Durability pipeline
//!
//! Mutations accumulate as `FlushOperation`s in a `FlushOperationQueue`;
//! `sync` hands the queue to a `FlushScheduler`, which dumps it inline or
//! on a background worker. Directory creations run before file writes,
//! and every landed operation freezes its nodes and entry-table paths
//! before the next one starts.

pub mod future;
pub mod operation;
pub mod queue;
pub mod scheduler;

pub use future::{FlushFuture, FlushPromise};
pub use operation::{FlushOperation, PackagedNode, RetryPolicy};
pub use queue::{FlushOperationQueue, FreezeContext};
pub use scheduler::{FlushMode, FlushScheduler};
