//! The executor core: the instance tree and the state machine that drives it.
//!
//! Everything in here runs with the executor lock held and on the run loop's
//! thread. Host notifications produced while the lock is held are buffered in
//! the core and dispatched by [`ExecutorShared`](super::activity_executor::ExecutorShared)
//! after the lock is released.

use super::bookmark::{
    Bookmark, BookmarkInfo, BookmarkManager, BookmarkOptions, BookmarkRecord,
    BookmarkResumptionResult, ExclusiveHandles, Resumption,
};
use super::bookmark_scope::{BookmarkScope, BookmarkScopeManager};
use super::callback::{
    BookmarkCallback, CallbackArgs, CallbackWrapper, CompletionCallback, FaultCallback,
    OutputGathering,
};
use super::config::ExecutorConfig;
use super::context::{AbortContext, ActivityContext, ResolutionContext};
use super::error::{ExecutionError, Result};
use super::host::WorkflowHost;
use super::instance::{
    ActivityInstance, ActivityInstanceRef, ActivityInstanceState, InstanceId, SubState,
};
use super::persistence::{ExecutorSnapshot, PersistenceWaiter};
use super::scheduler::{RequestedAction, Scheduler};
use super::tracking::{
    Tracking, TrackingProvider, TrackingRecord, TrackingRecordKind, WorkflowInstanceRecordState,
};
use super::work_item::{WorkItem, WorkItemKind};
use crate::core::{Pool, WorkflowFault};
use crate::definition::{Activity, ActivityId, ArgumentBinding, WorkflowDefinition, RESULT_ARGUMENT};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, debug_span, error, info, warn};
use uuid::Uuid;

/// Result of delivering a fault to a handler.
#[derive(Debug)]
pub(crate) struct FaultOutcome {
    pub(crate) handled: bool,
    pub(crate) raised: Option<WorkflowFault>,
}

#[derive(Debug)]
pub(crate) enum PersistStart {
    /// A snapshot is ready for the host; the item goes asynchronous.
    Pending,
    /// The instance cannot be persisted; the fault is raised on the waiter.
    Refused(WorkflowFault),
}

/// Buffered host calls, dispatched outside the lock.
#[derive(Debug)]
pub(crate) enum HostNotification {
    Paused,
    UnhandledException {
        fault: WorkflowFault,
        source: Option<ActivityInstanceRef>,
    },
    RequestAbort(WorkflowFault),
    DisassociateKeys(Vec<Uuid>),
    Track(Vec<TrackingRecord>),
}

/// Flags touched from arbitrary threads without taking the executor lock.
#[derive(Debug, Default)]
pub(crate) struct ExecutorFlags {
    abort_requested: AtomicBool,
    pause_requested: AtomicBool,
    pause_when_persistable: AtomicBool,
    abort_reason: Mutex<Option<WorkflowFault>>,
}

impl ExecutorFlags {
    /// Returns true for the first request only.
    pub(crate) fn request_abort(&self, reason: WorkflowFault) -> bool {
        let mut slot = self.abort_reason.lock().unwrap_or_else(|e| e.into_inner());
        if self.abort_requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        *slot = Some(reason);
        true
    }

    pub(crate) fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn abort_reason(&self) -> Option<WorkflowFault> {
        self.abort_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_pause(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn set_pause_when_persistable(&self, value: bool) {
        self.pause_when_persistable.store(value, Ordering::SeqCst);
    }

    pub(crate) fn is_pause_when_persistable(&self) -> bool {
        self.pause_when_persistable.load(Ordering::SeqCst)
    }
}

struct Invocation {
    raised: Option<WorkflowFault>,
    fault_handled: bool,
}

enum Resolution {
    Done,
    Pending,
    Faulted(WorkflowFault),
}

/// One step of the walk up the tree looking for a fault handler.
#[derive(Debug, Clone)]
struct FaultHop {
    reference: ActivityInstanceRef,
    parent: Option<InstanceId>,
    fault_callback: Option<FaultCallback>,
    cancellation_requested: bool,
}

/// Where a fault starts travelling, captured before `post_process` aborts
/// the source.
#[derive(Debug, Clone)]
pub(crate) struct FaultOrigin {
    hop: FaultHop,
    original: Option<ActivityInstanceRef>,
}

pub(crate) struct ExecutorCore {
    pub(crate) definition: Arc<WorkflowDefinition>,
    pub(crate) host: Arc<dyn WorkflowHost>,
    pub(crate) flags: Arc<ExecutorFlags>,
    pub(crate) config: ExecutorConfig,
    pub(crate) instance_id: Uuid,
    pub(crate) scheduler: Scheduler,
    pub(crate) instances: BTreeMap<InstanceId, ActivityInstance>,
    pub(crate) bookmarks: BookmarkManager,
    pub(crate) scopes: BookmarkScopeManager,
    pub(crate) exclusive_handles: ExclusiveHandles,
    pub(crate) tracking: Tracking,
    root: Option<InstanceId>,
    root_scheduled: bool,
    root_completed: bool,
    secondary_roots: Vec<InstanceId>,
    next_instance_id: u64,
    next_bookmark_id: u64,
    no_persist_count: u32,
    execution_state: ActivityInstanceState,
    workflow_outputs: BTreeMap<String, Value>,
    termination_fault: Option<WorkflowFault>,
    pending_terminate: Option<WorkflowFault>,
    should_raise_main_body_complete: bool,
    main_root_complete_bookmark: Option<Bookmark>,
    persistence_waiters: VecDeque<PersistenceWaiter>,
    pool: Pool<Box<WorkItem>>,
    non_serializable: bool,
    disposed: bool,
    aborting: bool,
    aborted: bool,
    pub(crate) pending_async: Option<Box<WorkItem>>,
    pub(crate) pending_persist: Option<ExecutorSnapshot>,
    notifications: Vec<HostNotification>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl ExecutorCore {
    pub(crate) fn new(
        definition: Arc<WorkflowDefinition>,
        host: Arc<dyn WorkflowHost>,
        flags: Arc<ExecutorFlags>,
        config: ExecutorConfig,
    ) -> Self {
        let instance_id = host.instance_id();
        let tracking = Tracking::new(host.tracking_provider(), instance_id, 0);
        let pool = Pool::new(config.work_item_pool_capacity);
        Self {
            definition,
            host,
            flags,
            config,
            instance_id,
            scheduler: Scheduler::new(),
            instances: BTreeMap::new(),
            bookmarks: BookmarkManager::new(),
            scopes: BookmarkScopeManager::new(),
            exclusive_handles: ExclusiveHandles::default(),
            tracking,
            root: None,
            root_scheduled: false,
            root_completed: false,
            secondary_roots: Vec::new(),
            next_instance_id: 0,
            next_bookmark_id: 0,
            no_persist_count: 0,
            execution_state: ActivityInstanceState::Executing,
            workflow_outputs: BTreeMap::new(),
            termination_fault: None,
            pending_terminate: None,
            should_raise_main_body_complete: false,
            main_root_complete_bookmark: None,
            persistence_waiters: VecDeque::new(),
            pool,
            non_serializable: false,
            disposed: false,
            aborting: false,
            aborted: false,
            pending_async: None,
            pending_persist: None,
            notifications: Vec::new(),
        }
    }

    /// Rebuilds a core from a snapshot, checking every persisted callback
    /// against `definition`.
    pub(crate) fn restore(
        definition: Arc<WorkflowDefinition>,
        host: Arc<dyn WorkflowHost>,
        flags: Arc<ExecutorFlags>,
        config: ExecutorConfig,
        snapshot: ExecutorSnapshot,
    ) -> Result<Self> {
        for instance in &snapshot.instances {
            if !definition.contains(instance.activity) {
                return Err(ExecutionError::internal(format!(
                    "instance {} refers to unknown activity {}",
                    instance.id, instance.activity
                )));
            }
            if let Some(callback) = &instance.completion_callback {
                callback.rebind(&definition)?;
            }
            if let Some(callback) = &instance.fault_callback {
                callback.rebind(&definition)?;
            }
        }
        for record in snapshot.bookmarks.records().iter().chain(snapshot.scopes.records()) {
            if let Some(callback) = &record.callback {
                callback.rebind(&definition)?;
            }
        }
        for item in &snapshot.work_items {
            match &item.kind {
                WorkItemKind::Completion { callback, .. } => callback.rebind(&definition)?,
                WorkItemKind::Bookmark {
                    callback: Some(callback),
                    ..
                } => callback.rebind(&definition)?,
                WorkItemKind::Fault { callback, .. } => callback.rebind(&definition)?,
                _ => {}
            }
        }

        let mut core = Self::new(definition, host, flags, config);
        core.tracking = Tracking::new(
            core.host.tracking_provider(),
            snapshot.instance_id,
            snapshot.tracking_record_number,
        );
        core.instance_id = snapshot.instance_id;
        core.scheduler = Scheduler::from_items(snapshot.work_items);
        core.no_persist_count = snapshot
            .instances
            .iter()
            .map(|i| i.no_persist_count)
            .sum();
        core.instances = snapshot
            .instances
            .into_iter()
            .map(|i| (i.id, i))
            .collect();
        core.bookmarks = snapshot.bookmarks;
        core.scopes = snapshot.scopes;
        core.exclusive_handles = snapshot.exclusive_handles;
        core.root = snapshot.root;
        core.root_scheduled = snapshot.root_scheduled;
        core.root_completed = snapshot.root_completed;
        core.secondary_roots = snapshot.secondary_roots;
        core.next_instance_id = snapshot.next_instance_id;
        core.next_bookmark_id = snapshot.next_bookmark_id;
        core.execution_state = snapshot.execution_state;
        core.workflow_outputs = snapshot.workflow_outputs;
        core.termination_fault = snapshot.termination_fault;
        core.should_raise_main_body_complete = snapshot.should_raise_main_body_complete;
        core.main_root_complete_bookmark = snapshot.main_root_complete_bookmark;
        core.persistence_waiters = snapshot.persistence_waiters.into();
        core.disposed = snapshot.disposed;
        Ok(core)
    }

    pub(crate) fn prepare_for_serialization(&self) -> Result<ExecutorSnapshot> {
        if self.non_serializable {
            return Err(ExecutionError::NonSerializable);
        }
        Ok(ExecutorSnapshot {
            instance_id: self.instance_id,
            identity: self.definition.identity().clone(),
            definition_hash: self.definition.hash(),
            work_items: self.scheduler.items().cloned().collect(),
            instances: self.instances.values().cloned().collect(),
            bookmarks: self.bookmarks.clone(),
            scopes: self.scopes.clone(),
            exclusive_handles: self.exclusive_handles.clone(),
            root: self.root,
            root_scheduled: self.root_scheduled,
            root_completed: self.root_completed,
            secondary_roots: self.secondary_roots.clone(),
            next_instance_id: self.next_instance_id,
            next_bookmark_id: self.next_bookmark_id,
            execution_state: self.execution_state,
            workflow_outputs: self.workflow_outputs.clone(),
            termination_fault: self.termination_fault.clone(),
            should_raise_main_body_complete: self.should_raise_main_body_complete,
            main_root_complete_bookmark: self.main_root_complete_bookmark.clone(),
            persistence_waiters: self.persistence_waiters.iter().cloned().collect(),
            tracking_record_number: self.tracking.next_record_number(),
            disposed: self.disposed,
        })
    }

    pub(crate) fn take_notifications(&mut self) -> Vec<HostNotification> {
        self.flush_tracking();
        std::mem::take(&mut self.notifications)
    }

    fn flush_tracking(&mut self) {
        let records = self.tracking.take_records();
        if !records.is_empty() {
            self.notifications.push(HostNotification::Track(records));
        }
    }

    pub(crate) fn tracking_provider(&self) -> Option<Arc<dyn TrackingProvider>> {
        self.tracking.provider()
    }

    // -- state queries --

    pub(crate) fn state(&self) -> ActivityInstanceState {
        if self.root_scheduled && (!self.root_completed || !self.secondary_roots.is_empty()) {
            ActivityInstanceState::Executing
        } else {
            self.execution_state
        }
    }

    pub(crate) fn is_instance_executing(&self, id: InstanceId) -> bool {
        self.instances.get(&id).is_some_and(|i| i.is_executing())
    }

    pub(crate) fn instance_ref(&self, id: InstanceId) -> Option<ActivityInstanceRef> {
        self.instances.get(&id).map(|i| i.to_ref())
    }

    pub(crate) fn is_persistable(&self) -> bool {
        self.no_persist_count == 0 && self.pending_async.is_none()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.disposed || self.scheduler.is_idle()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub(crate) fn workflow_outputs(&self) -> &BTreeMap<String, Value> {
        &self.workflow_outputs
    }

    pub(crate) fn termination_fault(&self) -> Option<&WorkflowFault> {
        self.termination_fault.as_ref()
    }

    pub(crate) fn root(&self) -> Option<InstanceId> {
        self.root
    }

    pub(crate) fn make_non_serializable(&mut self) {
        self.non_serializable = true;
    }

    pub(crate) fn is_non_serializable(&self) -> bool {
        self.non_serializable
    }

    pub(crate) fn bookmark_infos<'a>(
        &self,
        records: impl Iterator<Item = &'a BookmarkRecord>,
    ) -> Vec<BookmarkInfo> {
        records
            .filter_map(|record| {
                let name = record.bookmark.name()?;
                let activity = self.instances.get(&record.owner).map(|i| i.activity);
                Some(BookmarkInfo {
                    name: name.to_string(),
                    owner: record.owner,
                    owner_display_name: activity
                        .map(|a| self.definition.display_name(a))
                        .unwrap_or_default(),
                    scope: record.bookmark.scope().cloned(),
                })
            })
            .collect()
    }

    // -- work items --

    fn new_item(&mut self, instance: InstanceId, kind: WorkItemKind) -> Box<WorkItem> {
        if kind.is_poolable() {
            let mut item = self
                .pool
                .acquire(|| Box::new(WorkItem::new(instance, WorkItemKind::Empty)));
            item.instance = instance;
            item.kind = kind;
            item
        } else {
            Box::new(WorkItem::new(instance, kind))
        }
    }

    fn dispose_work_item(&mut self, item: Box<WorkItem>) {
        if item.kind.is_poolable() {
            self.pool.release(item);
        }
    }

    /// Queues a callback delivery for `owner`, holding it busy until the
    /// delivery's `post_process`.
    fn schedule_callback(&mut self, owner: InstanceId, kind: WorkItemKind, front: bool) {
        if kind.holds_owner() {
            if let Some(instance) = self.instances.get_mut(&owner) {
                instance.busy_count += 1;
            }
        }
        let item = self.new_item(owner, kind);
        if front {
            self.scheduler.push_work(item);
        } else {
            self.scheduler.enqueue_work(item);
        }
    }

    pub(crate) fn release_callback_hold(&mut self, owner: InstanceId) {
        if let Some(instance) = self.instances.get_mut(&owner) {
            instance.busy_count = instance.busy_count.saturating_sub(1);
        }
    }

    pub(crate) fn push_abort(&mut self, id: InstanceId, reason: WorkflowFault) {
        let item = self.new_item(id, WorkItemKind::AbortActivity { reason });
        self.scheduler.push_work(item);
    }

    fn allocate_instance_id(&mut self) -> InstanceId {
        self.next_instance_id += 1;
        InstanceId::new(self.next_instance_id)
    }

    pub(crate) fn new_internal_bookmark(&mut self) -> Bookmark {
        self.next_bookmark_id += 1;
        Bookmark::internal(self.next_bookmark_id)
    }

    // -- the pipeline --

    pub(crate) fn on_execute_work_item(&mut self, mut item: Box<WorkItem>) -> RequestedAction {
        let span = debug_span!("work_item", instance = %item.instance, kind = item.kind.name());
        let _entered = span.enter();

        if !item.is_valid(self) {
            debug!("skipping stale work item");
            if item.kind.holds_owner() {
                self.release_callback_hold(item.instance);
            }
            self.dispose_work_item(item);
            return RequestedAction::Continue;
        }

        if !item.is_empty() {
            match item.execute(self) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("work item went asynchronous");
                    self.pending_async = Some(item);
                    return RequestedAction::YieldSilently;
                }
                Err(error) => return self.fail(item, error),
            }
        }
        self.finish_work_item(item)
    }

    fn fail(&mut self, item: Box<WorkItem>, error: ExecutionError) -> RequestedAction {
        error!(%error, instance = %item.instance, "fatal failure while running work item");
        self.dispose_work_item(item);
        self.request_abort(error.to_fault());
        RequestedAction::Abort
    }

    pub(crate) fn finish_work_item(&mut self, mut item: Box<WorkItem>) -> RequestedAction {
        let origin = match item.exception_to_propagate {
            Some(_) => self.capture_origin(&item),
            None => None,
        };
        if let Err(error) = item.post_process(self) {
            return self.fail(item, error);
        }
        let mut unhandled_source = None;
        if item.exception_to_propagate.is_some() {
            unhandled_source = self.propagate_exception(&mut item, origin);
        }
        self.flush_tracking();
        self.finish_work_item_after_tracking(item, unhandled_source)
    }

    fn finish_work_item_after_tracking(
        &mut self,
        mut item: Box<WorkItem>,
        source: Option<ActivityInstanceRef>,
    ) -> RequestedAction {
        let action = match item.exception_to_propagate.take() {
            Some(fault) => {
                self.tracking
                    .workflow_state(WorkflowInstanceRecordState::UnhandledException);
                self.flush_tracking();
                RequestedAction::NotifyUnhandledException { fault, source }
            }
            None => RequestedAction::Continue,
        };
        self.schedule_runtime_work_items();
        self.dispose_work_item(item);
        action
    }

    /// Follow-on work that is only allowed once a work item fully finished.
    fn schedule_runtime_work_items(&mut self) {
        if !self.is_persistable() {
            return;
        }
        if self.flags.is_pause_when_persistable() {
            self.flags.request_pause();
        }
        while let Some(waiter) = self.persistence_waiters.pop_front() {
            if self.is_instance_executing(waiter.owner) {
                let owner = waiter.owner;
                let item = self.new_item(owner, WorkItemKind::Persist { waiter });
                self.scheduler.push_work(item);
                break;
            }
        }
    }

    /// Finishes the item that went asynchronous for a host persist.
    pub(crate) fn complete_persist(&mut self, result: std::result::Result<(), WorkflowFault>) -> RequestedAction {
        self.pending_persist = None;
        let Some(item) = self.pending_async.take() else {
            debug!("persist completed after the instance was aborted");
            return RequestedAction::Continue;
        };
        match result {
            Ok(()) => {
                self.tracking
                    .workflow_state(WorkflowInstanceRecordState::Persisted);
                info!(instance_id = %self.instance_id, "workflow instance persisted");
            }
            Err(fault) => {
                error!(%fault, "host persistence failed");
                self.request_abort(WorkflowFault::callback("host persistence failed", Some(fault)));
            }
        }
        self.finish_work_item(item)
    }

    // -- faults --

    fn fault_hop(&self, id: InstanceId) -> Option<FaultHop> {
        let instance = self.instances.get(&id)?;
        Some(FaultHop {
            reference: instance.to_ref(),
            parent: instance.parent,
            fault_callback: instance.fault_callback.clone(),
            cancellation_requested: instance.is_cancellation_requested,
        })
    }

    fn capture_origin(&self, item: &WorkItem) -> Option<FaultOrigin> {
        let mut hop = self.fault_hop(item.instance)?;
        if !item.skip_abort {
            hop.reference.state = ActivityInstanceState::Faulted;
        }
        let original = match &item.kind {
            WorkItemKind::RethrowException { original_source } => *original_source,
            WorkItemKind::Fault {
                original_source, ..
            } if item.skip_abort => *original_source,
            _ if item.original_exception_source == Some(item.instance) => Some(hop.reference),
            _ => item
                .original_exception_source
                .and_then(|id| self.instance_ref(id)),
        };
        Some(FaultOrigin { hop, original })
    }

    /// Returns the fault's original source when no handler took it.
    fn propagate_exception(
        &mut self,
        item: &mut WorkItem,
        origin: Option<FaultOrigin>,
    ) -> Option<ActivityInstanceRef> {
        let fault = item.exception_to_propagate.clone()?;
        let guard = !self.config.persist_exceptions;
        if guard {
            self.no_persist_count += 1;
        }

        let source = origin.as_ref().and_then(|o| o.original);
        let routed = match origin {
            Some(origin) => self.route_fault(fault, origin),
            None => false,
        };

        if guard {
            self.no_persist_count = self.no_persist_count.saturating_sub(1);
        }
        if routed {
            item.exception_to_propagate = None;
            item.original_exception_source = None;
        }
        source
    }

    fn route_fault(&mut self, fault: WorkflowFault, origin: FaultOrigin) -> bool {
        let FaultOrigin { mut hop, original } = origin;
        loop {
            if hop.cancellation_requested {
                let wrapped = WorkflowFault::invalid_operation(format!(
                    "fault reached instance {} while it was being canceled",
                    hop.reference.id
                ))
                .with_inner(fault);
                error!(fault = %wrapped, "fault during cancellation");
                self.request_abort(wrapped);
                return true;
            }
            if let Some(callback) = hop.fault_callback.take() {
                let owner = callback.owner();
                if self.tracking.tracks_fault_propagation() {
                    let handler = self.instance_ref(owner);
                    self.tracking.record(TrackingRecordKind::FaultPropagation {
                        fault: fault.clone(),
                        source: original,
                        handler,
                    });
                }
                debug!(handler = %owner, from = %hop.reference.id, "delivering fault to handler");
                let kind = WorkItemKind::Fault {
                    callback,
                    fault,
                    propagated_from: hop.reference,
                    original_source: original,
                };
                self.schedule_callback(owner, kind, true);
                return true;
            }
            match hop.parent.and_then(|p| self.fault_hop(p)) {
                Some(next) => hop = next,
                None => break,
            }
        }

        if self.tracking.tracks_fault_propagation() {
            self.tracking.record(TrackingRecordKind::FaultPropagation {
                fault: fault.clone(),
                source: original,
                handler: None,
            });
        }
        warn!(%fault, "unhandled fault reached the top of the tree");
        false
    }

    /// Raises `fault` again from `id`, which must be a fault handler that
    /// took it. The fault starts travelling from `id` itself.
    pub(crate) fn rethrow(
        &mut self,
        id: InstanceId,
        fault: WorkflowFault,
        original_source: Option<ActivityInstanceRef>,
    ) {
        debug!(instance = %id, %fault, "fault rethrown");
        let mut item = self.new_item(id, WorkItemKind::RethrowException { original_source });
        item.exception_to_propagate = Some(fault);
        item.original_exception_source = original_source.map(|s| s.id);
        self.scheduler.push_work(item);
    }

    pub(crate) fn request_abort(&mut self, reason: WorkflowFault) {
        if self.flags.request_abort(reason.clone()) {
            warn!(%reason, "aborting workflow instance");
            self.notifications.push(HostNotification::RequestAbort(reason));
        }
    }

    // -- invocation --

    fn invoke<F>(&mut self, instance: InstanceId, call: F) -> Result<Invocation>
    where
        F: FnOnce(&dyn Activity, &mut ActivityContext<'_>) -> std::result::Result<(), WorkflowFault>,
    {
        let activity_id = self
            .instances
            .get(&instance)
            .map(|i| i.activity)
            .ok_or_else(|| ExecutionError::internal(format!("instance {instance} is gone")))?;
        let activity = self.definition.activity(activity_id).cloned().ok_or_else(|| {
            ExecutionError::internal(format!("activity {activity_id} is not in the definition"))
        })?;

        let mut ctx = ActivityContext::new(self, instance, activity_id);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| call(activity.as_ref(), &mut ctx)));
        let fault_handled = ctx.is_fault_handled();

        match outcome {
            Ok(Ok(())) => Ok(Invocation {
                raised: None,
                fault_handled,
            }),
            Ok(Err(fault)) if fault.is_fatal() => Err(ExecutionError::Fatal(fault)),
            Ok(Err(fault)) => {
                debug!(%fault, instance = %instance, "activity raised a fault");
                Ok(Invocation {
                    raised: Some(fault),
                    fault_handled,
                })
            }
            Err(payload) => Err(ExecutionError::Fatal(WorkflowFault::fatal(format!(
                "activity panicked: {}",
                panic_message(payload.as_ref())
            )))),
        }
    }

    fn invoke_callback(&mut self, callback: &CallbackWrapper, args: CallbackArgs) -> Result<Invocation> {
        let handler = callback.handler().to_string();
        self.invoke(callback.owner(), move |activity, ctx| {
            activity.on_callback(ctx, &handler, args)
        })
    }

    pub(crate) fn callback(
        &self,
        owner: InstanceId,
        activity: ActivityId,
        handler: &str,
    ) -> std::result::Result<CallbackWrapper, WorkflowFault> {
        let registered = self
            .definition
            .metadata(activity)
            .is_some_and(|m| m.has_callback(handler));
        if registered {
            Ok(CallbackWrapper::new(owner, activity, handler))
        } else {
            Err(WorkflowFault::invalid_operation(format!(
                "activity '{}' registers no callback '{handler}'",
                self.definition.display_name(activity)
            )))
        }
    }

    // -- starting instances --

    pub(crate) fn start_instance(&mut self, id: InstanceId, from: usize) -> Result<Option<WorkflowFault>> {
        let Some(instance) = self.instances.get_mut(&id) else {
            return Err(ExecutionError::internal(format!("instance {id} is gone")));
        };
        if instance.is_cancellation_requested {
            return Ok(None);
        }
        if instance.sub_state == SubState::Created {
            instance.sub_state = SubState::ResolvingArguments;
            self.initialize_environment(id)?;
        }

        match self.resolve_arguments(id, from)? {
            Resolution::Pending => return Ok(None),
            Resolution::Faulted(fault) => return Ok(Some(fault)),
            Resolution::Done => {}
        }

        if let Some(instance) = self.instances.get_mut(&id) {
            instance.sub_state = SubState::Executing;
        }
        if let Some(reference) = self.instance_ref(id) {
            self.track_state(reference);
        }
        let invocation = self.invoke(id, |activity, ctx| activity.execute(ctx))?;
        Ok(invocation.raised)
    }

    fn initialize_environment(&mut self, id: InstanceId) -> Result<()> {
        let definition = Arc::clone(&self.definition);
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or_else(|| ExecutionError::internal(format!("instance {id} is gone")))?;
        let metadata = definition.metadata(instance.activity).ok_or_else(|| {
            ExecutionError::internal(format!("activity {} has no metadata", instance.activity))
        })?;
        for argument in metadata.arguments() {
            instance.environment.declare(argument.name.clone(), Value::Null);
        }
        for variable in metadata.variables() {
            instance
                .environment
                .declare(variable.name.clone(), variable.default.clone());
        }
        Ok(())
    }

    fn resolve_arguments(&mut self, id: InstanceId, from: usize) -> Result<Resolution> {
        let definition = Arc::clone(&self.definition);
        let (activity, parent) = self
            .instances
            .get(&id)
            .map(|i| (i.activity, i.parent))
            .ok_or_else(|| ExecutionError::internal(format!("instance {id} is gone")))?;
        let metadata = definition.metadata(activity).ok_or_else(|| {
            ExecutionError::internal(format!("activity {activity} has no metadata"))
        })?;

        for (index, argument) in metadata.arguments().iter().enumerate().skip(from) {
            if !argument.direction.is_input() {
                continue;
            }
            let overridden = self
                .instances
                .get(&id)
                .and_then(|i| i.argument_overrides.get(&argument.name).cloned());
            let value = match (overridden, &argument.binding) {
                (Some(value), _) => value,
                (None, ArgumentBinding::None) => continue,
                (None, ArgumentBinding::Literal(value)) => value.clone(),
                (None, ArgumentBinding::Variable(variable)) => {
                    match parent.and_then(|p| self.lookup_location(p, variable).cloned()) {
                        Some(value) => value,
                        None => {
                            return Ok(Resolution::Faulted(WorkflowFault::invalid_operation(
                                format!(
                                    "variable '{variable}' bound to argument '{}' is not in scope",
                                    argument.name
                                ),
                            )))
                        }
                    }
                }
                (None, ArgumentBinding::Expression(expression)) => {
                    let fast = definition
                        .metadata(*expression)
                        .is_some_and(|m| m.is_fast_path());
                    if fast {
                        let reserved = self.allocate_instance_id();
                        if let Some(instance) = self.instances.get_mut(&id) {
                            instance.busy_count += 1;
                        }
                        let item = self.new_item(
                            id,
                            WorkItemKind::ExecuteSynchronousExpression {
                                expression: *expression,
                                reserved,
                                argument: index,
                            },
                        );
                        self.scheduler.push_work(item);
                    } else {
                        let completion = CompletionCallback::ResolveArgument {
                            owner: id,
                            argument: index,
                        };
                        let child = match self.create_instance(
                            *expression,
                            Some(id),
                            Some(completion),
                            None,
                            BTreeMap::new(),
                        ) {
                            Ok(child) => child,
                            Err(fault) => return Ok(Resolution::Faulted(fault)),
                        };
                        let item = self.new_item(child, WorkItemKind::ExecuteExpression);
                        self.scheduler.push_work(item);
                    }
                    return Ok(Resolution::Pending);
                }
            };
            if let Some(instance) = self.instances.get_mut(&id) {
                instance.environment.set(&argument.name, value);
            }
        }
        Ok(Resolution::Done)
    }

    fn argument_name(&self, owner: InstanceId, index: usize) -> Result<String> {
        self.instances
            .get(&owner)
            .and_then(|i| self.definition.metadata(i.activity))
            .and_then(|m| m.arguments().get(index))
            .map(|a| a.name.clone())
            .ok_or_else(|| {
                ExecutionError::internal(format!("instance {owner} has no argument #{index}"))
            })
    }

    pub(crate) fn evaluate_inline(
        &mut self,
        owner: InstanceId,
        expression: ActivityId,
        argument: usize,
    ) -> Result<Option<WorkflowFault>> {
        let activity = self.definition.activity(expression).cloned().ok_or_else(|| {
            ExecutionError::internal(format!("expression {expression} is not in the definition"))
        })?;
        let name = self.argument_name(owner, argument)?;

        let outcome = {
            let ctx = ResolutionContext { core: &*self, owner };
            panic::catch_unwind(AssertUnwindSafe(|| activity.evaluate(&ctx)))
        };
        match outcome {
            Ok(Ok(value)) => {
                if let Some(instance) = self.instances.get_mut(&owner) {
                    instance.environment.set(&name, value);
                }
                Ok(None)
            }
            Ok(Err(fault)) if fault.is_fatal() => Err(ExecutionError::Fatal(fault)),
            Ok(Err(fault)) => Ok(Some(fault)),
            Err(payload) => Err(ExecutionError::Fatal(WorkflowFault::fatal(format!(
                "expression panicked: {}",
                panic_message(payload.as_ref())
            )))),
        }
    }

    /// Continues resolution after an inline evaluation. A failed evaluation
    /// gets a real instance under the reserved id so the fault has a source
    /// to travel from.
    pub(crate) fn finish_inline_expression(
        &mut self,
        owner: InstanceId,
        expression: ActivityId,
        reserved: InstanceId,
        argument: usize,
        fault: Option<WorkflowFault>,
    ) -> Result<()> {
        self.release_callback_hold(owner);
        if !self.is_instance_executing(owner) {
            return Ok(());
        }
        let next = self.new_item(
            owner,
            WorkItemKind::ResolveNextArgument {
                next_index: argument + 1,
            },
        );
        self.scheduler.push_work(next);

        if let Some(fault) = fault {
            let mut instance = ActivityInstance::new(reserved, expression, Some(owner));
            instance.sub_state = SubState::Executing;
            self.instances.insert(reserved, instance);
            if let Some(parent) = self.instances.get_mut(&owner) {
                parent.children.push(reserved);
            }
            let mut item = self.new_item(reserved, WorkItemKind::PropagateException);
            item.exception_to_propagate = Some(fault);
            item.original_exception_source = Some(reserved);
            self.scheduler.push_work(item);
        }
        Ok(())
    }

    // -- callbacks --

    pub(crate) fn invoke_completion(
        &mut self,
        callback: &CompletionCallback,
        child: ActivityInstanceRef,
        outputs: BTreeMap<String, Value>,
        result: Option<Value>,
    ) -> Result<Option<WorkflowFault>> {
        match callback {
            CompletionCallback::ResolveArgument { owner, argument } => {
                if child.state == ActivityInstanceState::Closed {
                    let name = self.argument_name(*owner, *argument)?;
                    if let Some(instance) = self.instances.get_mut(owner) {
                        instance.environment.set(&name, result.unwrap_or(Value::Null));
                    }
                    self.start_instance(*owner, argument + 1)
                } else {
                    if let Some(instance) = self.instances.get_mut(owner) {
                        if instance.is_cancellation_requested {
                            instance.marked_canceled = true;
                        }
                    }
                    Ok(None)
                }
            }
            CompletionCallback::Activity(wrapper)
            | CompletionCallback::Function(wrapper)
            | CompletionCallback::Delegate(wrapper) => {
                let args = CallbackArgs::Completed {
                    child,
                    outputs,
                    result,
                };
                Ok(self.invoke_callback(wrapper, args)?.raised)
            }
        }
    }

    pub(crate) fn invoke_bookmark(
        &mut self,
        callback: &BookmarkCallback,
        bookmark: Bookmark,
        value: Value,
        is_external: bool,
    ) -> Result<Option<WorkflowFault>> {
        let owner = callback.owner();
        if is_external {
            self.enter_no_persist(owner);
        }
        let invocation = self.invoke_callback(callback, CallbackArgs::BookmarkResumed { bookmark, value });
        if is_external {
            if let Err(fault) = self.exit_no_persist(owner) {
                warn!(%fault, "no-persist guard was already released");
            }
        }
        Ok(invocation?.raised)
    }

    pub(crate) fn invoke_fault(
        &mut self,
        callback: &FaultCallback,
        fault: WorkflowFault,
        propagated_from: ActivityInstanceRef,
        original_source: Option<ActivityInstanceRef>,
    ) -> Result<FaultOutcome> {
        let args = CallbackArgs::Faulted {
            fault,
            propagated_from,
            original_source,
        };
        let invocation = self.invoke_callback(callback, args)?;
        Ok(FaultOutcome {
            handled: invocation.fault_handled,
            raised: invocation.raised,
        })
    }

    /// A handler accepted the fault: the child it came through is torn down.
    pub(crate) fn abort_handled_source(&mut self, id: InstanceId, fault: &WorkflowFault) -> Result<()> {
        if self.is_instance_executing(id) {
            self.abort_activity_instance(id, fault)?;
        }
        Ok(())
    }

    pub(crate) fn invoke_cancel(&mut self, id: InstanceId) -> Result<Option<WorkflowFault>> {
        if let Some(instance) = self.instances.get_mut(&id) {
            instance.sub_state = SubState::Canceling;
        }
        Ok(self.invoke(id, |activity, ctx| activity.cancel(ctx))?.raised)
    }

    pub(crate) fn begin_persist(&mut self, waiter: &PersistenceWaiter) -> Result<PersistStart> {
        let resumed = self.try_generate_bookmark_item(
            &waiter.bookmark,
            Value::Null,
            waiter.bookmark.scope().cloned(),
            false,
            true,
        );
        if resumed != BookmarkResumptionResult::Success {
            warn!(bookmark = %waiter.bookmark, result = %resumed, "persist waiter bookmark did not resume");
        }
        match self.prepare_for_serialization() {
            Ok(snapshot) => {
                self.pending_persist = Some(snapshot);
                Ok(PersistStart::Pending)
            }
            Err(ExecutionError::NonSerializable) => Ok(PersistStart::Refused(
                WorkflowFault::invalid_operation("workflow instance is not serializable"),
            )),
            Err(error) => Err(error),
        }
    }

    // -- instance lifecycle --

    fn create_instance(
        &mut self,
        activity: ActivityId,
        parent: Option<InstanceId>,
        completion: Option<CompletionCallback>,
        fault: Option<FaultCallback>,
        overrides: BTreeMap<String, Value>,
    ) -> std::result::Result<InstanceId, WorkflowFault> {
        if !self.definition.contains(activity) {
            return Err(WorkflowFault::invalid_operation(format!(
                "activity {activity} is not part of the workflow definition"
            )));
        }
        if let Some(parent) = parent {
            if !self.is_instance_executing(parent) {
                return Err(WorkflowFault::invalid_operation(format!(
                    "cannot schedule under instance {parent}, which is not executing"
                )));
            }
        }
        if let Some(metadata) = self.definition.metadata(activity) {
            for name in overrides.keys() {
                let accepts = metadata
                    .argument(name)
                    .is_some_and(|a| a.direction.is_input());
                if !accepts {
                    return Err(WorkflowFault::invalid_operation(format!(
                        "activity '{}' has no input argument '{name}'",
                        metadata.display_name()
                    )));
                }
            }
        }

        let id = self.allocate_instance_id();
        let mut instance = ActivityInstance::new(id, activity, parent);
        instance.completion_callback = completion;
        instance.fault_callback = fault;
        instance.argument_overrides = overrides;
        let reference = instance.to_ref();
        self.instances.insert(id, instance);

        if let Some(parent) = parent {
            if let Some(parent) = self.instances.get_mut(&parent) {
                parent.children.push(id);
            }
        }
        if self.tracking.tracks_activity_scheduled() {
            let parent = parent.and_then(|p| self.instance_ref(p));
            let display_name = self.definition.display_name(activity);
            self.tracking.record(TrackingRecordKind::ActivityScheduled {
                parent,
                child: reference,
                display_name,
            });
        }
        debug!(instance = %id, activity = %activity, parent = ?parent, "activity scheduled");
        Ok(id)
    }

    pub(crate) fn schedule_root(
        &mut self,
        overrides: BTreeMap<String, Value>,
        properties: BTreeMap<String, Value>,
    ) -> Result<InstanceId> {
        if self.root_scheduled {
            return Err(ExecutionError::invalid_operation(
                "the root activity was already scheduled",
            ));
        }
        let root_activity = self.definition.root();
        let id = self
            .create_instance(root_activity, None, None, None, overrides)
            .map_err(|fault| ExecutionError::invalid_operation(fault.message()))?;
        if let Some(root) = self.instances.get_mut(&id) {
            root.properties = properties;
        }
        self.root = Some(id);
        self.root_scheduled = true;
        self.execution_state = ActivityInstanceState::Executing;
        let item = self.new_item(id, WorkItemKind::ExecuteRoot);
        self.scheduler.enqueue_work(item);
        self.tracking
            .workflow_state(WorkflowInstanceRecordState::Started);
        info!(
            instance_id = %self.instance_id,
            workflow = %self.definition.identity(),
            "root activity scheduled"
        );
        Ok(id)
    }

    pub(crate) fn schedule_child(
        &mut self,
        parent: InstanceId,
        child: ActivityId,
        completion: Option<CompletionCallback>,
        fault: Option<FaultCallback>,
        inputs: BTreeMap<String, Value>,
        kind: WorkItemKind,
    ) -> std::result::Result<ActivityInstanceRef, WorkflowFault> {
        let parent_activity = self
            .instances
            .get(&parent)
            .map(|i| i.activity)
            .ok_or_else(|| WorkflowFault::invalid_operation(format!("instance {parent} is gone")))?;
        if self.definition.parent(child) != Some(parent_activity) {
            return Err(WorkflowFault::invalid_operation(format!(
                "activity '{}' is not a child of '{}'",
                self.definition.display_name(child),
                self.definition.display_name(parent_activity)
            )));
        }
        let id = self.create_instance(child, Some(parent), completion, fault, inputs)?;
        let item = self.new_item(id, kind);
        self.scheduler.push_work(item);
        self.instance_ref(id)
            .ok_or_else(|| WorkflowFault::invalid_operation(format!("instance {id} is gone")))
    }

    pub(crate) fn schedule_secondary_root(
        &mut self,
        scheduler: InstanceId,
        activity: ActivityId,
        inputs: BTreeMap<String, Value>,
    ) -> std::result::Result<ActivityInstanceRef, WorkflowFault> {
        if !self.is_instance_executing(scheduler) {
            return Err(WorkflowFault::invalid_operation(
                "secondary roots can only be scheduled by an executing instance",
            ));
        }
        let id = self.create_instance(activity, None, None, None, inputs)?;
        self.secondary_roots.push(id);
        let item = self.new_item(id, WorkItemKind::ExecuteActivity);
        self.scheduler.push_work(item);
        debug!(instance = %id, "secondary root scheduled");
        self.instance_ref(id)
            .ok_or_else(|| WorkflowFault::invalid_operation(format!("instance {id} is gone")))
    }

    pub(crate) fn register_main_root_complete(
        &mut self,
        owner: InstanceId,
        callback: BookmarkCallback,
    ) -> std::result::Result<(), WorkflowFault> {
        if self.main_root_complete_bookmark.is_some() {
            return Err(WorkflowFault::invalid_operation(
                "a main-root-complete callback is already registered",
            ));
        }
        let bookmark = self.new_internal_bookmark();
        let bookmark = self.add_bookmark(
            owner,
            bookmark,
            Some(callback),
            BookmarkOptions::NONE.non_blocking(),
            None,
        )?;
        self.main_root_complete_bookmark = Some(bookmark);
        Ok(())
    }

    /// Requests cancellation. Returns false when the instance is not
    /// executing or cancellation was already requested.
    pub(crate) fn cancel_activity(&mut self, id: InstanceId) -> bool {
        let Some(instance) = self.instances.get_mut(&id) else {
            return false;
        };
        if !instance.is_executing() || instance.is_cancellation_requested {
            return false;
        }
        instance.is_cancellation_requested = true;
        let kind = if instance.has_not_executed() {
            WorkItemKind::Empty
        } else {
            WorkItemKind::CancelActivity
        };
        debug!(instance = %id, kind = kind.name(), "cancellation requested");
        let item = self.new_item(id, kind);
        self.scheduler.push_work(item);
        true
    }

    pub(crate) fn update_state(&mut self, id: InstanceId) -> Result<()> {
        let Some(instance) = self.instances.get_mut(&id) else {
            return Ok(());
        };
        if !instance.is_executing() {
            return Ok(());
        }

        if instance.has_not_executed() {
            if !instance.is_cancellation_requested {
                return Ok(());
            }
            if instance.children.is_empty() && instance.busy_count == 0 {
                instance.marked_canceled = true;
                return self.complete_activity_instance(id, true);
            }
            let children = instance.children.clone();
            for child in children.into_iter().rev() {
                self.cancel_activity(child);
            }
            return Ok(());
        }

        if instance.performing_default_cancelation
            && instance.children.is_empty()
            && instance.busy_count == 0
        {
            instance.marked_canceled = true;
            self.remove_bookmarks_owned_by(id);
            return self.complete_activity_instance(id, true);
        }
        if !instance.has_pending_work() {
            return self.complete_activity_instance(id, true);
        }
        Ok(())
    }

    pub(crate) fn complete_activity_instance(&mut self, id: InstanceId, notify_parent: bool) -> Result<()> {
        let Some(mut instance) = self.instances.remove(&id) else {
            return Err(ExecutionError::internal(format!(
                "instance {id} completed twice"
            )));
        };
        if instance.is_executing() {
            let state = instance.closing_state();
            instance.finish(state)?;
        }
        let state = instance.state;
        let reference = instance.to_ref();

        let definition = Arc::clone(&self.definition);
        let metadata = definition.metadata(instance.activity).ok_or_else(|| {
            ExecutionError::internal(format!("activity {} has no metadata", instance.activity))
        })?;
        let mut outputs = BTreeMap::new();
        let mut result = None;
        if state == ActivityInstanceState::Closed {
            for argument in metadata.arguments().iter().filter(|a| a.direction.is_output()) {
                let value = instance
                    .environment
                    .get(&argument.name)
                    .cloned()
                    .unwrap_or(Value::Null);
                if let (ArgumentBinding::Variable(variable), Some(parent)) =
                    (&argument.binding, instance.parent)
                {
                    if !self.set_location(parent, variable, value.clone()) {
                        warn!(variable = %variable, "output variable is not in scope");
                    }
                }
                if argument.name == RESULT_ARGUMENT {
                    result = Some(value.clone());
                }
                outputs.insert(argument.name.clone(), value);
            }
        }

        let owned = self
            .bookmarks
            .remove_owned_by(id)
            .into_iter()
            .chain(self.scopes.remove_owned_by(id));
        for record in owned {
            self.exclusive_handles.remove_bookmark(&record.bookmark);
        }
        self.exclusive_handles.remove_owned_by(id);
        let unregistered = self.scopes.unregister_owned_by(id);
        for record in &unregistered.bookmarks {
            self.on_bookmark_removed(record);
        }
        if !unregistered.disassociated.is_empty() {
            self.notifications
                .push(HostNotification::DisassociateKeys(unregistered.disassociated));
        }

        self.no_persist_count = self.no_persist_count.saturating_sub(instance.no_persist_count);
        self.persistence_waiters.retain(|w| w.owner != id);
        if let Some(parent) = instance.parent.and_then(|p| self.instances.get_mut(&p)) {
            parent.remove_child(id);
        }
        self.track_state(reference);
        debug!(instance = %id, state = %state, "activity instance completed");

        if self.root == Some(id) {
            self.root_completed = true;
            if !self.aborting {
                self.execution_state = state;
                if state == ActivityInstanceState::Closed {
                    self.workflow_outputs = outputs.clone();
                }
                self.tracking.workflow_state(state.into());
                info!(instance_id = %self.instance_id, state = %state, "workflow root completed");
            }
            if !self.secondary_roots.is_empty() {
                self.should_raise_main_body_complete = true;
            }
        } else if let Some(position) = self.secondary_roots.iter().position(|r| *r == id) {
            self.secondary_roots.remove(position);
        }

        if notify_parent {
            if let Some(parent) = instance.parent {
                match instance.completion_callback.take() {
                    Some(callback) => {
                        let (outputs, result) = match callback.gathering() {
                            OutputGathering::Nothing => (BTreeMap::new(), None),
                            OutputGathering::Result => (BTreeMap::new(), result),
                            OutputGathering::All => (outputs, result),
                        };
                        let owner = callback.owner();
                        let kind = WorkItemKind::Completion {
                            callback,
                            child: reference,
                            outputs,
                            result,
                        };
                        self.schedule_callback(owner, kind, true);
                    }
                    None => {
                        let item = self.new_item(parent, WorkItemKind::Empty);
                        self.scheduler.push_work(item);
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn abort_activity_instance(&mut self, id: InstanceId, reason: &WorkflowFault) -> Result<()> {
        if !self.instances.contains_key(&id) {
            return Ok(());
        }
        self.abort_children(id, reason)?;
        self.retire(id, reason, true)
    }

    fn abort_children(&mut self, id: InstanceId, reason: &WorkflowFault) -> Result<()> {
        let children = self
            .instances
            .get(&id)
            .map(|i| i.children.clone())
            .unwrap_or_default();
        for child in children.into_iter().rev() {
            self.abort_children(child, reason)?;
            self.retire(child, reason, false)?;
        }
        Ok(())
    }

    fn retire(&mut self, id: InstanceId, reason: &WorkflowFault, notify_parent: bool) -> Result<()> {
        let Some(instance) = self.instances.get_mut(&id) else {
            return Ok(());
        };
        if instance.is_executing() {
            instance.finish(ActivityInstanceState::Faulted)?;
        }
        let reference = instance.to_ref();
        if let Some(activity) = self.definition.activity(reference.activity).cloned() {
            let ctx = AbortContext {
                instance: reference,
                reason,
                workflow_instance_id: self.instance_id,
            };
            if panic::catch_unwind(AssertUnwindSafe(|| activity.abort(&ctx))).is_err() {
                error!(instance = %id, "activity panicked while aborting");
            }
        }
        self.complete_activity_instance(id, notify_parent)
    }

    fn track_state(&mut self, reference: ActivityInstanceRef) {
        if self.tracking.tracks_activity_state() {
            let display_name = self.definition.display_name(reference.activity);
            self.tracking.record(TrackingRecordKind::ActivityState {
                instance: reference,
                display_name,
            });
        }
    }

    // -- locations and properties --

    pub(crate) fn lookup_location(&self, start: InstanceId, name: &str) -> Option<&Value> {
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            let instance = self.instances.get(&id)?;
            if let Some(value) = instance.environment.get(name) {
                return Some(value);
            }
            cursor = instance.parent;
        }
        None
    }

    pub(crate) fn set_location(&mut self, start: InstanceId, name: &str, value: Value) -> bool {
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            let Some(instance) = self.instances.get(&id) else {
                return false;
            };
            if instance.environment.contains(name) {
                break;
            }
            cursor = instance.parent;
        }
        match cursor.and_then(|id| self.instances.get_mut(&id)) {
            Some(instance) => instance.environment.set(name, value),
            None => false,
        }
    }

    pub(crate) fn find_property(&self, start: InstanceId, name: &str) -> Option<&Value> {
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            let instance = self.instances.get(&id)?;
            if let Some(value) = instance.properties.get(name) {
                return Some(value);
            }
            cursor = instance.parent;
        }
        None
    }

    // -- bookmarks --

    pub(crate) fn add_bookmark(
        &mut self,
        owner: InstanceId,
        mut bookmark: Bookmark,
        callback: Option<BookmarkCallback>,
        options: BookmarkOptions,
        scope: Option<BookmarkScope>,
    ) -> std::result::Result<Bookmark, WorkflowFault> {
        if !self.is_instance_executing(owner) {
            return Err(WorkflowFault::invalid_operation(format!(
                "instance {owner} is not executing"
            )));
        }
        let scope = scope.or_else(|| bookmark.scope().cloned());
        let record = BookmarkRecord {
            bookmark: bookmark.clone(),
            callback,
            owner,
            options,
        };
        let blocking = record.is_blocking();
        match &scope {
            Some(scope) => {
                self.scopes.add_bookmark(scope, record)?;
                bookmark.set_scope(Some(scope.clone()));
            }
            None => self.bookmarks.add(record)?,
        }
        if blocking {
            if let Some(instance) = self.instances.get_mut(&owner) {
                instance.blocking_bookmarks += 1;
            }
        }
        debug!(bookmark = %bookmark, owner = %owner, "bookmark created");
        Ok(bookmark)
    }

    fn on_bookmark_removed(&mut self, record: &BookmarkRecord) {
        self.exclusive_handles.remove_bookmark(&record.bookmark);
        if record.is_blocking() {
            if let Some(instance) = self.instances.get_mut(&record.owner) {
                instance.blocking_bookmarks = instance.blocking_bookmarks.saturating_sub(1);
            }
        }
    }

    pub(crate) fn remove_bookmark(&mut self, owner: InstanceId, bookmark: &Bookmark) -> bool {
        let owns = |records: &[BookmarkRecord]| {
            records
                .iter()
                .any(|r| &r.bookmark == bookmark && r.owner == owner)
        };
        let removed = match bookmark.scope() {
            Some(scope) if owns(self.scopes.records_in(scope)) => {
                self.scopes.remove_bookmark(bookmark, scope)
            }
            Some(_) => None,
            None if owns(self.bookmarks.records()) => self.bookmarks.remove(bookmark),
            None => None,
        };
        match removed {
            Some(record) => {
                self.on_bookmark_removed(&record);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_bookmarks_owned_by(&mut self, owner: InstanceId) {
        let removed = self
            .bookmarks
            .remove_owned_by(owner)
            .into_iter()
            .chain(self.scopes.remove_owned_by(owner));
        for record in removed {
            self.on_bookmark_removed(&record);
        }
    }

    pub(crate) fn try_resume_user_bookmark(&mut self, bookmark: &Bookmark, value: Value) -> BookmarkResumptionResult {
        let scope = bookmark.scope().cloned();
        self.try_generate_bookmark_item(bookmark, value, scope, false, false)
    }

    /// Resumes on behalf of the host. Without a scope only the non-scoped
    /// bookmarks are searched.
    pub(crate) fn try_resume_host_bookmark(
        &mut self,
        bookmark: &Bookmark,
        value: Value,
        scope: Option<BookmarkScope>,
    ) -> BookmarkResumptionResult {
        let scope = scope.or_else(|| bookmark.scope().cloned());
        self.try_generate_bookmark_item(bookmark, value, scope, true, false)
    }

    fn try_generate_bookmark_item(
        &mut self,
        bookmark: &Bookmark,
        value: Value,
        scope: Option<BookmarkScope>,
        is_external: bool,
        front: bool,
    ) -> BookmarkResumptionResult {
        let resumption = match &scope {
            None => self
                .bookmarks
                .take_for_resumption(bookmark, &self.exclusive_handles),
            Some(scope) => {
                let scoped = self
                    .scopes
                    .take_for_resumption(bookmark, scope, &self.exclusive_handles);
                if let Some(id) = scoped.promoted {
                    debug!(scope = %id, "uninitialized bookmark scope promoted");
                }
                scoped.resumption
            }
        };
        let resumed = match resumption {
            Resumption::NotFound => return BookmarkResumptionResult::NotFound,
            Resumption::NotReady => return BookmarkResumptionResult::NotReady,
            Resumption::Ready(resumed) => resumed,
        };
        if resumed.removed {
            self.on_bookmark_removed(&resumed.record);
        }
        let owner = resumed.record.owner;
        let Some(owner_ref) = self.instance_ref(owner).filter(|r| r.state == ActivityInstanceState::Executing) else {
            return BookmarkResumptionResult::NotFound;
        };
        if self.tracking.tracks_bookmark_resumption() {
            self.tracking.record(TrackingRecordKind::BookmarkResumption {
                bookmark: resumed.record.bookmark.to_string(),
                owner: owner_ref,
                value: value.clone(),
            });
        }
        debug!(bookmark = %resumed.record.bookmark, owner = %owner, "bookmark resumed");
        let kind = WorkItemKind::Bookmark {
            callback: resumed.record.callback,
            bookmark: resumed.record.bookmark,
            value,
            is_external,
        };
        self.schedule_callback(owner, kind, front);
        BookmarkResumptionResult::Success
    }

    pub(crate) fn add_persistence_waiter(&mut self, owner: InstanceId, bookmark: Bookmark) {
        self.persistence_waiters
            .push_back(PersistenceWaiter { bookmark, owner });
    }

    pub(crate) fn associate_keys(&mut self, keys: &[Uuid]) -> std::result::Result<(), WorkflowFault> {
        let host = Arc::clone(&self.host);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| host.associate_keys(keys)));
        let failure = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(fault)) => WorkflowFault::callback("host failed to associate keys", Some(fault)),
            Err(payload) => WorkflowFault::callback(
                format!("host panicked associating keys: {}", panic_message(payload.as_ref())),
                None,
            ),
        };
        error!(fault = %failure, "host callback failed");
        self.request_abort(failure.clone());
        Err(failure)
    }

    // -- no-persist zones --

    pub(crate) fn enter_no_persist(&mut self, id: InstanceId) {
        if let Some(instance) = self.instances.get_mut(&id) {
            instance.no_persist_count += 1;
            self.no_persist_count += 1;
        }
    }

    pub(crate) fn exit_no_persist(&mut self, id: InstanceId) -> std::result::Result<(), WorkflowFault> {
        match self.instances.get_mut(&id) {
            Some(instance) if instance.no_persist_count > 0 => {
                instance.no_persist_count -= 1;
                self.no_persist_count = self.no_persist_count.saturating_sub(1);
                Ok(())
            }
            _ => Err(WorkflowFault::invalid_operation(
                "exit_no_persist without a matching enter_no_persist",
            )),
        }
    }

    // -- idle, abort, terminate --

    /// Runs when the loop stops. Returns true when new work was scheduled
    /// and the loop should keep going.
    pub(crate) fn on_scheduler_idle(&mut self) -> bool {
        if let Some(reason) = self.pending_terminate.take() {
            self.terminate_now(reason);
        }

        if self.scheduler.is_idle() {
            if self.should_raise_main_body_complete {
                self.should_raise_main_body_complete = false;
                if let Some(bookmark) = self.main_root_complete_bookmark.take() {
                    let state = serde_json::to_value(self.execution_state).unwrap_or_default();
                    let result = self.try_generate_bookmark_item(&bookmark, state, None, false, false);
                    if result == BookmarkResumptionResult::Success {
                        return true;
                    }
                }
            }
            if self.root_completed && self.secondary_roots.is_empty() && !self.disposed {
                self.dispose();
            }
        }

        if self.flags.is_pause_when_persistable() && self.is_persistable() {
            self.flags.set_pause_when_persistable(false);
        }
        self.notifications.push(HostNotification::Paused);
        false
    }

    fn dispose(&mut self) {
        self.bookmarks.clear();
        self.scopes.clear();
        self.exclusive_handles.clear();
        self.persistence_waiters.clear();
        self.main_root_complete_bookmark = None;
        self.disposed = true;
        debug!(instance_id = %self.instance_id, "workflow instance disposed");
    }

    fn abort_roots(&mut self, reason: &WorkflowFault) {
        let roots: Vec<InstanceId> = self
            .root
            .into_iter()
            .chain(self.secondary_roots.iter().copied())
            .collect();
        for id in roots.into_iter().rev() {
            if let Err(error) = self.abort_activity_instance(id, reason) {
                error!(%error, instance = %id, "failed to abort root");
            }
        }
    }

    fn clear_work(&mut self) {
        for item in self.scheduler.clear_all_work_items() {
            self.dispose_work_item(item);
        }
        self.pending_async = None;
        self.pending_persist = None;
        self.persistence_waiters.clear();
    }

    /// Tears the instance down without touching its recorded completion
    /// state.
    pub(crate) fn abort(&mut self, reason: &WorkflowFault) {
        if self.aborted {
            return;
        }
        self.aborting = true;
        self.abort_roots(reason);
        self.clear_work();
        self.aborting = false;
        self.aborted = true;
        self.tracking
            .workflow_state(WorkflowInstanceRecordState::Aborted);
        info!(instance_id = %self.instance_id, %reason, "workflow instance aborted");
    }

    /// Terminates now, or after the running turn if the loop is active.
    pub(crate) fn terminate(&mut self, reason: WorkflowFault) {
        if self.root_completed && self.secondary_roots.is_empty() {
            warn!(%reason, "terminate ignored, the workflow already completed");
            return;
        }
        if self.scheduler.is_running() {
            self.pending_terminate = Some(reason);
            self.flags.request_pause();
        } else {
            self.terminate_now(reason);
        }
    }

    fn terminate_now(&mut self, reason: WorkflowFault) {
        self.aborting = true;
        self.abort_roots(&reason);
        self.clear_work();
        self.aborting = false;
        self.root_completed = true;
        self.secondary_roots.clear();
        self.execution_state = ActivityInstanceState::Faulted;
        self.workflow_outputs.clear();
        self.tracking
            .workflow_state(WorkflowInstanceRecordState::Terminated);
        info!(instance_id = %self.instance_id, %reason, "workflow instance terminated");
        self.termination_fault = Some(reason);
        if !self.scheduler.is_running() {
            self.dispose();
        }
    }

    pub(crate) fn cancel_root(&mut self) -> bool {
        match self.root {
            Some(root) => self.cancel_activity(root),
            None => false,
        }
    }

    pub(crate) fn all_bookmarks(&self) -> Vec<BookmarkInfo> {
        self.bookmark_infos(self.bookmarks.records().iter().chain(self.scopes.records()))
    }

    pub(crate) fn bookmarks_in(&self, scope: Option<&BookmarkScope>) -> Vec<BookmarkInfo> {
        match scope {
            Some(scope) => self.bookmark_infos(self.scopes.records_in(scope).iter()),
            None => self.bookmark_infos(self.bookmarks.records().iter()),
        }
    }
}

impl std::fmt::Debug for ExecutorCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorCore")
            .field("instance_id", &self.instance_id)
            .field("workflow", &self.definition.identity())
            .field("instances", &self.instances.len())
            .field("queued", &self.scheduler.len())
            .field("state", &self.state())
            .finish()
    }
}
