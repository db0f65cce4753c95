//! The cooperative run loop.
//!
//! The [`Scheduler`] holds the ordered work queue: one "first" slot kept
//! outside the deque for the hot path, followed by the deque itself.
//!
//! - [`push_work`](Scheduler::push_work) preempts everything queued (LIFO at
//!   the head). Used for cancellation, completion and fault delivery.
//! - [`enqueue_work`](Scheduler::enqueue_work) appends (FIFO at the tail).
//!   Used for bookmark resumptions, so simultaneous resumptions run in
//!   arrival order.
//!
//! The loop itself, [`run_loop`], never touches work items directly. It asks
//! its [`SchedulerOwner`] to execute the next item and reacts to the returned
//! [`RequestedAction`] only.

use super::instance::ActivityInstanceRef;
use super::sync_context::SynchronizationContext;
use super::work_item::WorkItem;
use crate::core::WorkflowFault;
use std::collections::VecDeque;
use std::sync::Arc;

/// What the run loop should do after a work item ran.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestedAction {
    Continue,
    /// The item went asynchronous. Stop without going idle; the item's
    /// completion restarts the loop.
    YieldSilently,
    /// Unwind immediately.
    Abort,
    /// A fault reached the top of the tree. Stop and tell the host.
    NotifyUnhandledException {
        fault: WorkflowFault,
        source: Option<ActivityInstanceRef>,
    },
}

/// Callbacks the run loop drives.
pub trait SchedulerOwner: Send + Sync + 'static {
    fn synchronization_context(&self) -> Arc<dyn SynchronizationContext>;

    /// True when the queue holds work and no pause or abort is pending.
    fn has_runnable_work(&self) -> bool;

    /// Executes the next work item. Returns `None` when the queue is empty
    /// or a pause was requested.
    fn execute_next(&self) -> Option<RequestedAction>;

    /// The loop went idle. Returns true if idle processing scheduled new
    /// work and the loop should keep going.
    fn scheduler_idle(&self) -> bool;

    fn scheduler_aborted(&self);

    fn notify_unhandled_exception(&self, fault: WorkflowFault, source: Option<ActivityInstanceRef>);
}

#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    first: Option<Box<WorkItem>>,
    queue: VecDeque<Box<WorkItem>>,
    is_running: bool,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a queue from items in execution order.
    pub(crate) fn from_items(items: Vec<WorkItem>) -> Self {
        let mut scheduler = Self::new();
        for item in items {
            scheduler.enqueue_work(Box::new(item));
        }
        scheduler
    }

    pub(crate) fn push_work(&mut self, item: Box<WorkItem>) {
        if let Some(previous) = self.first.replace(item) {
            self.queue.push_front(previous);
        }
    }

    pub(crate) fn enqueue_work(&mut self, item: Box<WorkItem>) {
        if self.first.is_none() && self.queue.is_empty() {
            self.first = Some(item);
        } else {
            self.queue.push_back(item);
        }
    }

    pub(crate) fn pop(&mut self) -> Option<Box<WorkItem>> {
        let item = self.first.take()?;
        self.first = self.queue.pop_front();
        Some(item)
    }

    /// Empty queue.
    pub(crate) fn is_idle(&self) -> bool {
        self.first.is_none()
    }

    pub(crate) fn len(&self) -> usize {
        self.first.iter().count() + self.queue.len()
    }

    /// Queued items in the order they would run.
    pub(crate) fn items(&self) -> impl Iterator<Item = &WorkItem> {
        self.first
            .iter()
            .chain(self.queue.iter())
            .map(|item| item.as_ref())
    }

    /// Drains every queued item; the caller returns them to the pool.
    pub(crate) fn clear_all_work_items(&mut self) -> Vec<Box<WorkItem>> {
        let mut drained: Vec<_> = self.first.take().into_iter().collect();
        drained.extend(self.queue.drain(..));
        drained
    }

    /// Returns false if a loop is already active.
    pub(crate) fn mark_running(&mut self) -> bool {
        !std::mem::replace(&mut self.is_running, true)
    }

    pub(crate) fn mark_stopped(&mut self) {
        self.is_running = false;
    }

    pub(crate) fn is_running(&self) -> bool {
        self.is_running
    }
}

/// Starts a loop on the owner's synchronization context.
///
/// The caller must have marked the scheduler running. When there is nothing
/// runnable the owner is told it is idle right away, on the calling thread.
pub fn resume<O: SchedulerOwner>(owner: Arc<O>) {
    let sync = owner.synchronization_context();
    sync.operation_started();
    if !owner.has_runnable_work() {
        run_loop(owner.as_ref());
        return;
    }
    sync.post(Box::new(move || run_loop(owner.as_ref())));
}

/// Restarts a loop that yielded. The operation started by [`resume`] is
/// still outstanding, so this does not start another one.
pub fn internal_resume<O: SchedulerOwner>(owner: Arc<O>) {
    resume_after(owner, RequestedAction::Continue);
}

/// Restarts a yielded loop with the action its asynchronous item finished
/// with.
pub fn resume_after<O: SchedulerOwner>(owner: Arc<O>, action: RequestedAction) {
    let sync = owner.synchronization_context();
    sync.post(Box::new(move || drive(owner.as_ref(), action)));
}

pub fn run_loop<O: SchedulerOwner + ?Sized>(owner: &O) {
    drive(owner, RequestedAction::Continue);
}

fn drive<O: SchedulerOwner + ?Sized>(owner: &O, first: RequestedAction) {
    let mut pending = Some(first);
    loop {
        let next = match pending.take() {
            Some(RequestedAction::Continue) | None => owner.execute_next(),
            Some(action) => Some(action),
        };
        match next {
            Some(RequestedAction::Continue) => continue,
            Some(RequestedAction::YieldSilently) => return,
            Some(RequestedAction::Abort) => {
                owner.scheduler_aborted();
                break;
            }
            Some(RequestedAction::NotifyUnhandledException { fault, source }) => {
                owner.notify_unhandled_exception(fault, source);
                break;
            }
            None => {
                if owner.scheduler_idle() {
                    continue;
                }
                break;
            }
        }
    }
    owner.synchronization_context().operation_completed();
}
