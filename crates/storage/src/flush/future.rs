//! Completion signalling for submitted flush work

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

struct Shared {
    state: Mutex<Option<bool>>,
    cond: Condvar,
}

/// Caller-side handle to one submitted flush
pub struct FlushFuture {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for FlushFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushFuture")
            .field("state", &*self.shared.state.lock())
            .finish()
    }
}

/// Worker-side completion handle
pub struct FlushPromise {
    shared: Arc<Shared>,
}

impl FlushFuture {
    /// Create a linked future/promise pair.
    pub fn channel() -> (FlushFuture, FlushPromise) {
        let shared = Arc::new(Shared {
            state: Mutex::new(None),
            cond: Condvar::new(),
        });
        (
            FlushFuture {
                shared: Arc::clone(&shared),
            },
            FlushPromise { shared },
        )
    }

    /// Block until the flush finishes; `true` means every operation
    /// succeeded.
    pub fn wait(&self) -> bool {
        let mut state = self.shared.state.lock();
        while state.is_none() {
            self.shared.cond.wait(&mut state);
        }
        state.unwrap_or(false)
    }

    /// Non-blocking probe.
    pub fn try_wait(&self) -> Option<bool> {
        *self.shared.state.lock()
    }

    /// Bounded wait; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<bool> {
        let mut state = self.shared.state.lock();
        if state.is_none() {
            self.shared.cond.wait_for(&mut state, timeout);
        }
        *state
    }
}

impl FlushPromise {
    /// Publish the outcome and wake every waiter. Later calls are ignored.
    pub fn set(self, success: bool) {
        let mut state = self.shared.state.lock();
        if state.is_none() {
            *state = Some(success);
        }
        drop(state);
        self.shared.cond.notify_all();
    }
}

impl Drop for FlushPromise {
    fn drop(&mut self) {
        // a promise dropped without set() counts as failure
        let mut state = self.shared.state.lock();
        if state.is_none() {
            *state = Some(false);
            drop(state);
            self.shared.cond.notify_all();
        }
    }
}
