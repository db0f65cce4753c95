//! Synchronization contexts decide where the run loop executes.
//!
//! The executor never spawns threads itself. It posts each run-loop turn onto
//! the context the host supplied through
//! [`ActivityExecutor::open`](super::ActivityExecutor::open), and brackets a
//! run with `operation_started` / `operation_completed` so the host can tell
//! when the instance is genuinely at rest.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;

pub type PostedWork = Box<dyn FnOnce() + Send + 'static>;

pub trait SynchronizationContext: Send + Sync {
    fn post(&self, work: PostedWork);

    fn operation_started(&self) {}

    fn operation_completed(&self) {}
}

/// Runs posted work on the posting thread.
///
/// Work posted while a drain is in progress is queued and run by that drain
/// once the current item returns, so a host calling back into the executor
/// from a notification never re-enters the loop on the same stack.
#[derive(Default)]
pub struct InlineSynchronizationContext {
    pending: Mutex<VecDeque<PostedWork>>,
    draining: AtomicBool,
    outstanding: AtomicUsize,
}

impl InlineSynchronizationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations started and not yet completed.
    pub fn outstanding_operations(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn next(&self) -> Option<PostedWork> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

impl SynchronizationContext for InlineSynchronizationContext {
    fn post(&self, work: PostedWork) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(work);

        loop {
            if self.draining.swap(true, Ordering::SeqCst) {
                return;
            }
            while let Some(work) = self.next() {
                work();
            }
            self.draining.store(false, Ordering::SeqCst);

            // Work posted between the last pop and the reset would be stranded.
            let stranded = !self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty();
            if !stranded {
                return;
            }
        }
    }

    fn operation_started(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    fn operation_completed(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs each posted turn on a tokio runtime's blocking pool.
///
/// [`wait_for_idle`](TokioSynchronizationContext::wait_for_idle) resolves once
/// every started operation has completed.
pub struct TokioSynchronizationContext {
    handle: Handle,
    outstanding: AtomicUsize,
    idle: Notify,
}

impl TokioSynchronizationContext {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Uses the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn outstanding_operations(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl SynchronizationContext for TokioSynchronizationContext {
    fn post(&self, work: PostedWork) {
        // Blocking pool: activity code is synchronous and may take locks.
        drop(self.handle.spawn_blocking(work));
    }

    fn operation_started(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    fn operation_completed(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_inline_runs_nested_posts_after_current() {
        let sync = Arc::new(InlineSynchronizationContext::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let inner_sync = sync.clone();
        let inner_order = order.clone();
        sync.post(Box::new(move || {
            inner_order.lock().unwrap().push("outer start");
            let nested = inner_order.clone();
            inner_sync.post(Box::new(move || nested.lock().unwrap().push("nested")));
            inner_order.lock().unwrap().push("outer end");
        }));

        assert_eq!(
            *order.lock().unwrap(),
            vec!["outer start", "outer end", "nested"]
        );
    }

    #[test]
    fn test_inline_counts_operations() {
        let sync = InlineSynchronizationContext::new();
        sync.operation_started();
        assert_eq!(sync.outstanding_operations(), 1);
        sync.operation_completed();
        assert_eq!(sync.outstanding_operations(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_context_waits_for_idle() {
        let sync = Arc::new(TokioSynchronizationContext::current());
        let ran = Arc::new(AtomicBool::new(false));

        sync.operation_started();
        let worker_sync = sync.clone();
        let worker_ran = ran.clone();
        sync.post(Box::new(move || {
            worker_ran.store(true, Ordering::SeqCst);
            worker_sync.operation_completed();
        }));

        sync.wait_for_idle().await;
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(sync.outstanding_operations(), 0);
    }
}
