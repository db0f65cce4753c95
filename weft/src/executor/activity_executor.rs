//! The executor handle hosts drive.
//!
//! [`ActivityExecutor`] is a cheap `Clone` handle. All state sits behind one
//! mutex that is only held for the duration of a single work item, so a host
//! may call into the executor from any thread, including from inside its own
//! notifications.

use super::bookmark::{Bookmark, BookmarkInfo, BookmarkResumptionResult};
use super::bookmark_scope::BookmarkScope;
use super::config::ExecutorConfig;
use super::error::{ExecutionError, Result};
use super::host::WorkflowHost;
use super::instance::{ActivityInstanceRef, ActivityInstanceState, InstanceId};
use super::persistence::{ExecutorSnapshot, PersistCompletion};
use super::runtime::{ExecutorCore, ExecutorFlags, HostNotification};
use super::scheduler::{self, RequestedAction, SchedulerOwner};
use super::sync_context::{InlineSynchronizationContext, SynchronizationContext};
use super::tracking::TrackingProvider;
use crate::core::{CoreError, WorkflowFault};
use crate::definition::WorkflowDefinition;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tracing::{debug, error, info, warn};

pub(crate) struct ExecutorShared {
    core: Mutex<ExecutorCore>,
    flags: Arc<ExecutorFlags>,
    host: Arc<dyn WorkflowHost>,
    tracking: Option<Arc<dyn TrackingProvider>>,
    sync: RwLock<Arc<dyn SynchronizationContext>>,
    self_ref: Weak<ExecutorShared>,
}

impl ExecutorShared {
    fn lock(&self) -> MutexGuard<'_, ExecutorCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delivers buffered notifications. Must be called without the lock.
    fn dispatch(&self, notifications: Vec<HostNotification>) {
        for notification in notifications {
            let host = &self.host;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| match &notification {
                HostNotification::Paused => host.notify_paused(),
                HostNotification::UnhandledException { fault, source } => {
                    host.notify_unhandled_exception(fault, *source)
                }
                HostNotification::RequestAbort(reason) => host.on_request_abort(reason),
                HostNotification::DisassociateKeys(keys) => host.disassociate_keys(keys),
                HostNotification::Track(records) => {
                    if let Some(provider) = &self.tracking {
                        for record in records {
                            provider.add_record(record.clone());
                        }
                    }
                }
            }));
            if outcome.is_err() {
                error!(?notification, "host callback panicked");
                self.flags.request_abort(WorkflowFault::callback(
                    "host callback panicked",
                    None,
                ));
            }
        }
    }

    /// Hands a snapshot to the host. Returns the action to continue with, or
    /// `YieldSilently` when the host completes later.
    fn run_host_persist(&self, snapshot: ExecutorSnapshot) -> RequestedAction {
        let (completion, slot) = PersistCompletion::new(self.self_ref.clone());
        let host = Arc::clone(&self.host);
        debug!(instance_id = %snapshot.instance_id(), "handing snapshot to host");
        if panic::catch_unwind(AssertUnwindSafe(|| host.on_begin_persist(snapshot, completion))).is_err() {
            error!("host panicked in on_begin_persist");
        }
        match slot.detach() {
            Some(result) => {
                let (action, notifications) = {
                    let mut core = self.lock();
                    let action = core.complete_persist(result);
                    (action, core.take_notifications())
                };
                self.dispatch(notifications);
                action
            }
            None => RequestedAction::YieldSilently,
        }
    }

    /// Called by [`PersistCompletion`] when the host finished after
    /// `on_begin_persist` returned.
    pub(crate) fn finish_persist(&self, result: std::result::Result<(), WorkflowFault>) {
        let (action, notifications) = {
            let mut core = self.lock();
            let action = core.complete_persist(result);
            (action, core.take_notifications())
        };
        self.dispatch(notifications);
        match self.self_ref.upgrade() {
            Some(shared) => scheduler::resume_after(shared, action),
            None => warn!("executor dropped while a persist was in flight"),
        }
    }
}

impl SchedulerOwner for ExecutorShared {
    fn synchronization_context(&self) -> Arc<dyn SynchronizationContext> {
        self.sync.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn has_runnable_work(&self) -> bool {
        !self.flags.is_abort_requested()
            && !self.flags.is_pause_requested()
            && !self.lock().scheduler.is_idle()
    }

    fn execute_next(&self) -> Option<RequestedAction> {
        let (action, persist, notifications) = {
            let mut core = self.lock();
            if self.flags.is_abort_requested() {
                return Some(RequestedAction::Abort);
            }
            if self.flags.is_pause_requested() {
                return None;
            }
            let item = core.scheduler.pop()?;
            let action = core.on_execute_work_item(item);
            let persist = match action {
                RequestedAction::YieldSilently => core.pending_persist.take(),
                _ => None,
            };
            (action, persist, core.take_notifications())
        };
        self.dispatch(notifications);
        match persist {
            Some(snapshot) => Some(self.run_host_persist(snapshot)),
            None => Some(action),
        }
    }

    fn scheduler_idle(&self) -> bool {
        let (keep_going, notifications) = {
            let mut core = self.lock();
            let keep_going = core.on_scheduler_idle();
            if !keep_going {
                core.scheduler.mark_stopped();
                self.flags.clear_pause();
            }
            (keep_going, core.take_notifications())
        };
        self.dispatch(notifications);
        keep_going
    }

    fn scheduler_aborted(&self) {
        let notifications = {
            let mut core = self.lock();
            let reason = self
                .flags
                .abort_reason()
                .unwrap_or_else(|| WorkflowFault::canceled("workflow instance aborted"));
            core.abort(&reason);
            core.scheduler.mark_stopped();
            core.take_notifications()
        };
        self.dispatch(notifications);
    }

    fn notify_unhandled_exception(&self, fault: WorkflowFault, source: Option<ActivityInstanceRef>) {
        let mut notifications = {
            let mut core = self.lock();
            core.scheduler.mark_stopped();
            self.flags.clear_pause();
            core.take_notifications()
        };
        notifications.push(HostNotification::UnhandledException { fault, source });
        self.dispatch(notifications);
    }
}

/// Runs one workflow instance.
///
/// ```
/// use std::sync::Arc;
/// use weft::prelude::*;
///
/// struct Hello;
///
/// impl Activity for Hello {
///     fn metadata(&self) -> ActivityMetadata {
///         ActivityMetadata::new("Hello").with_result()
///     }
///
///     fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
///         ctx.set_result(Value::from("hello"))
///     }
/// }
///
/// struct Host(uuid::Uuid);
///
/// impl WorkflowHost for Host {
///     fn instance_id(&self) -> uuid::Uuid {
///         self.0
///     }
/// }
///
/// let mut builder = DefinitionBuilder::new(WorkflowIdentity::new("hello", "1"));
/// let root = builder.add(Hello);
/// let definition = Arc::new(builder.build(root).unwrap());
///
/// let executor = ActivityExecutor::new(definition, Arc::new(Host(uuid::Uuid::new_v4())));
/// executor.schedule_root_activity(Default::default(), Default::default()).unwrap();
/// executor.run().unwrap();
///
/// assert_eq!(executor.state(), ActivityInstanceState::Closed);
/// assert_eq!(executor.workflow_outputs()["Result"], "hello");
/// ```
#[derive(Clone)]
pub struct ActivityExecutor {
    shared: Arc<ExecutorShared>,
}

impl ActivityExecutor {
    pub fn new(definition: Arc<WorkflowDefinition>, host: Arc<dyn WorkflowHost>) -> Self {
        Self::with_config(definition, host, ExecutorConfig::default())
    }

    pub fn with_config(
        definition: Arc<WorkflowDefinition>,
        host: Arc<dyn WorkflowHost>,
        config: ExecutorConfig,
    ) -> Self {
        let flags = Arc::new(ExecutorFlags::default());
        let core = ExecutorCore::new(definition, Arc::clone(&host), Arc::clone(&flags), config);
        Self::from_core(core, host, flags)
    }

    fn from_core(core: ExecutorCore, host: Arc<dyn WorkflowHost>, flags: Arc<ExecutorFlags>) -> Self {
        let tracking = core.tracking_provider();
        let shared = Arc::new_cyclic(|weak| ExecutorShared {
            core: Mutex::new(core),
            flags,
            host,
            tracking,
            sync: RwLock::new(Arc::new(InlineSynchronizationContext::new())),
            self_ref: weak.clone(),
        });
        Self { shared }
    }

    /// Restores an executor from a snapshot.
    ///
    /// The snapshot must have been taken for the same definition identity and
    /// structure, and for the instance `host` identifies. Every persisted
    /// callback is checked against the definition's registrations.
    pub fn on_deserialized(
        definition: Arc<WorkflowDefinition>,
        host: Arc<dyn WorkflowHost>,
        snapshot: ExecutorSnapshot,
    ) -> Result<Self> {
        Self::on_deserialized_with_config(definition, host, snapshot, ExecutorConfig::default())
    }

    pub fn on_deserialized_with_config(
        definition: Arc<WorkflowDefinition>,
        host: Arc<dyn WorkflowHost>,
        snapshot: ExecutorSnapshot,
        config: ExecutorConfig,
    ) -> Result<Self> {
        if snapshot.identity() != definition.identity() {
            return Err(ExecutionError::IdentityMismatch {
                expected: snapshot.identity().to_string(),
                found: definition.identity().to_string(),
            });
        }
        if let Some(expected) = host.definition_identity() {
            if &expected != snapshot.identity() {
                return Err(ExecutionError::IdentityMismatch {
                    expected: expected.to_string(),
                    found: snapshot.identity().to_string(),
                });
            }
        }
        if snapshot.definition_hash() != definition.hash() {
            return Err(CoreError::DefinitionMismatch {
                expected: snapshot.definition_hash(),
                found: definition.hash(),
            }
            .into());
        }
        if host.instance_id() != snapshot.instance_id() {
            return Err(ExecutionError::invalid_operation(format!(
                "snapshot belongs to instance {}, host is {}",
                snapshot.instance_id(),
                host.instance_id()
            )));
        }

        let flags = Arc::new(ExecutorFlags::default());
        let core = ExecutorCore::restore(definition, Arc::clone(&host), Arc::clone(&flags), config, snapshot)?;
        info!(instance_id = %host.instance_id(), "workflow instance restored");
        Ok(Self::from_core(core, host, flags))
    }

    /// Installs the context the run loop is posted to. Defaults to
    /// [`InlineSynchronizationContext`].
    pub fn open(&self, sync: Arc<dyn SynchronizationContext>) {
        *self.shared.sync.write().unwrap_or_else(|e| e.into_inner()) = sync;
    }

    /// Creates the root instance and queues it. May only be called once.
    ///
    /// `argument_overrides` supply values for the root's input arguments;
    /// `host_properties` become execution properties of the root.
    pub fn schedule_root_activity(
        &self,
        argument_overrides: BTreeMap<String, Value>,
        host_properties: BTreeMap<String, Value>,
    ) -> Result<InstanceId> {
        if self.shared.host.instance_id().is_nil() {
            return Err(ExecutionError::invalid_operation(
                "the host must supply a non-nil instance id",
            ));
        }
        self.shared
            .lock()
            .schedule_root(argument_overrides, host_properties)
    }

    /// Starts the run loop on the synchronization context.
    ///
    /// Fails if the instance was aborted or a loop is already active.
    pub fn run(&self) -> Result<()> {
        {
            let mut core = self.shared.lock();
            if core.is_aborted() {
                return Err(ExecutionError::invalid_operation(
                    "the workflow instance was aborted",
                ));
            }
            if !core.scheduler.mark_running() {
                return Err(ExecutionError::invalid_operation(
                    "the scheduler is already running",
                ));
            }
        }
        self.shared.flags.clear_pause();
        scheduler::resume(Arc::clone(&self.shared));
        Ok(())
    }

    /// Stops the loop before the next work item. Safe from any thread.
    pub fn pause_scheduler(&self) {
        self.shared.flags.request_pause();
    }

    /// Stops the loop at the next point the instance is persistable. Safe
    /// from any thread.
    pub fn pause_when_persistable(&self) {
        self.shared.flags.set_pause_when_persistable(true);
    }

    /// Flags the instance for abort and tells the host. The run loop unwinds
    /// before its next work item. Safe from any thread.
    pub fn abort_workflow_instance(&self, reason: WorkflowFault) {
        if !self.shared.flags.request_abort(reason.clone()) {
            return;
        }
        warn!(%reason, "workflow instance abort requested");
        self.shared
            .dispatch(vec![HostNotification::RequestAbort(reason)]);
    }

    /// Unwinds every instance without changing the recorded completion
    /// state.
    pub fn abort(&self, reason: WorkflowFault) {
        let notifications = {
            let mut core = self.shared.lock();
            self.shared.flags.request_abort(reason.clone());
            core.abort(&reason);
            core.take_notifications()
        };
        self.shared.dispatch(notifications);
    }

    /// Forces the workflow into `Faulted`. Applied immediately when the loop
    /// is stopped, otherwise once the current turn ends.
    pub fn terminate(&self, reason: WorkflowFault) {
        let notifications = {
            let mut core = self.shared.lock();
            core.terminate(reason);
            core.take_notifications()
        };
        self.shared.dispatch(notifications);
    }

    /// Requests cancellation of the root. Takes effect on the next `run`.
    pub fn cancel_root_activity(&self) -> bool {
        self.shared.lock().cancel_root()
    }

    /// Resumes a bookmark on behalf of the host. A scope attached to the
    /// bookmark is honored; otherwise only non-scoped bookmarks are searched.
    pub fn try_resume_host_bookmark(&self, bookmark: &Bookmark, value: Value) -> BookmarkResumptionResult {
        self.shared
            .lock()
            .try_resume_host_bookmark(bookmark, value, None)
    }

    /// Resumes a bookmark in `scope`, or in the non-scoped set when `None`.
    pub fn try_resume_bookmark(
        &self,
        bookmark: &Bookmark,
        value: Value,
        scope: Option<&BookmarkScope>,
    ) -> BookmarkResumptionResult {
        self.shared
            .lock()
            .try_resume_host_bookmark(bookmark, value, scope.cloned())
    }

    /// Named bookmarks across the non-scoped set and every scope.
    pub fn get_all_bookmarks(&self) -> Vec<BookmarkInfo> {
        self.shared.lock().all_bookmarks()
    }

    pub fn get_bookmarks(&self, scope: Option<&BookmarkScope>) -> Vec<BookmarkInfo> {
        self.shared.lock().bookmarks_in(scope)
    }

    /// Out and InOut values of the root after it closed.
    pub fn workflow_outputs(&self) -> BTreeMap<String, Value> {
        self.shared.lock().workflow_outputs().clone()
    }

    pub fn termination_exception(&self) -> Option<WorkflowFault> {
        self.shared.lock().termination_fault().cloned()
    }

    pub fn state(&self) -> ActivityInstanceState {
        self.shared.lock().state()
    }

    pub fn root_instance(&self) -> Option<InstanceId> {
        self.shared.lock().root()
    }

    pub fn instance_id(&self) -> uuid::Uuid {
        self.shared.lock().instance_id
    }

    /// True when no work is queued.
    pub fn is_idle(&self) -> bool {
        self.shared.lock().is_idle()
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.lock().is_aborted()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().scheduler.is_running()
    }

    /// No no-persist zone is open and no work item is in flight.
    pub fn is_persistable(&self) -> bool {
        self.shared.lock().is_persistable()
    }

    /// Captures the executor state. The loop must be stopped and the
    /// instance persistable.
    pub fn prepare_for_serialization(&self) -> Result<ExecutorSnapshot> {
        let core = self.shared.lock();
        if core.scheduler.is_running() {
            return Err(ExecutionError::invalid_operation(
                "cannot serialize while the scheduler is running",
            ));
        }
        if !core.is_persistable() {
            return Err(ExecutionError::invalid_operation(
                "cannot serialize while a no-persist zone is open",
            ));
        }
        core.prepare_for_serialization()
    }

    /// Refuses every later snapshot, including host persist points.
    pub fn make_non_serializable(&self) {
        self.shared.lock().make_non_serializable();
    }

    pub fn throw_if_non_serializable(&self) -> Result<()> {
        if self.shared.lock().is_non_serializable() {
            Err(ExecutionError::NonSerializable)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for ActivityExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.shared.lock();
        f.debug_struct("ActivityExecutor").field("core", &*core).finish()
    }
}
