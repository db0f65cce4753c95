//! What an activity sees of the running workflow.
//!
//! An [`ActivityContext`] is handed to every `execute`, `cancel` and
//! `on_callback` call. It borrows the executor core for the duration of the
//! call, so everything an activity does is applied immediately and in order:
//! scheduled children land on the queue, bookmarks are registered, locations
//! are written.

use super::bookmark::{Bookmark, BookmarkOptions, BookmarkResumptionResult, ExclusiveHandleId};
use super::bookmark_scope::BookmarkScope;
use super::callback::CompletionCallback;
use super::instance::{ActivityInstanceRef, ActivityInstanceState, InstanceId};
use super::runtime::ExecutorCore;
use super::tracking::TrackingRecordKind;
use super::work_item::WorkItemKind;
use crate::core::{from_workflow_value, WorkflowFault};
use crate::definition::{ActivityId, RESULT_ARGUMENT};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub struct ActivityContext<'a> {
    core: &'a mut ExecutorCore,
    instance: InstanceId,
    activity: ActivityId,
    fault_handled: bool,
}

impl<'a> ActivityContext<'a> {
    pub(crate) fn new(core: &'a mut ExecutorCore, instance: InstanceId, activity: ActivityId) -> Self {
        Self {
            core,
            instance,
            activity,
            fault_handled: false,
        }
    }

    pub(crate) fn is_fault_handled(&self) -> bool {
        self.fault_handled
    }

    pub fn instance(&self) -> ActivityInstanceRef {
        self.core
            .instance_ref(self.instance)
            .unwrap_or(ActivityInstanceRef {
                id: self.instance,
                activity: self.activity,
                state: ActivityInstanceState::Executing,
            })
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    pub fn activity_id(&self) -> ActivityId {
        self.activity
    }

    pub fn workflow_instance_id(&self) -> Uuid {
        self.core.instance_id
    }

    pub fn display_name(&self) -> String {
        self.core.definition.display_name(self.activity)
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.core
            .instances
            .get(&self.instance)
            .is_some_and(|i| i.is_cancellation_requested)
    }

    // -- locations --

    /// Reads a location visible from this instance: its own arguments and
    /// variables first, then those of its ancestors.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.core.lookup_location(self.instance, name)
    }

    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, WorkflowFault> {
        let value = self.get(name).cloned().ok_or_else(|| {
            WorkflowFault::invalid_operation(format!("location '{name}' is not in scope"))
        })?;
        from_workflow_value(name, value).map_err(|e| WorkflowFault::activity(e.to_string()))
    }

    /// Writes the nearest declaration of `name`.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), WorkflowFault> {
        if self.core.set_location(self.instance, name, value) {
            Ok(())
        } else {
            Err(WorkflowFault::invalid_operation(format!(
                "location '{name}' is not in scope"
            )))
        }
    }

    pub fn set_result(&mut self, value: Value) -> Result<(), WorkflowFault> {
        let declared = self
            .core
            .instances
            .get(&self.instance)
            .is_some_and(|i| i.environment.contains(RESULT_ARGUMENT));
        if !declared {
            return Err(WorkflowFault::invalid_operation(format!(
                "activity '{}' declares no result",
                self.display_name()
            )));
        }
        self.set(RESULT_ARGUMENT, value)
    }

    // -- scheduling --

    pub fn children(&self) -> Vec<ActivityInstanceRef> {
        let Some(instance) = self.core.instances.get(&self.instance) else {
            return Vec::new();
        };
        instance
            .children
            .iter()
            .filter_map(|c| self.core.instance_ref(*c))
            .collect()
    }

    /// Schedules a child. `on_completed` receives
    /// [`CallbackArgs::Completed`](super::CallbackArgs::Completed) without
    /// outputs; `on_faulted` intercepts faults raised at or below the child.
    pub fn schedule_activity(
        &mut self,
        child: ActivityId,
        on_completed: Option<&str>,
        on_faulted: Option<&str>,
    ) -> Result<ActivityInstanceRef, WorkflowFault> {
        let completion = on_completed
            .map(|h| self.core.callback(self.instance, self.activity, h))
            .transpose()?
            .map(CompletionCallback::Activity);
        self.schedule(child, completion, on_faulted, BTreeMap::new(), WorkItemKind::ExecuteActivity)
    }

    /// Schedules a child whose `Result` is delivered to `on_completed`.
    pub fn schedule_function(
        &mut self,
        child: ActivityId,
        on_completed: &str,
        on_faulted: Option<&str>,
    ) -> Result<ActivityInstanceRef, WorkflowFault> {
        let completion = self.core.callback(self.instance, self.activity, on_completed)?;
        self.schedule(
            child,
            Some(CompletionCallback::Function(completion)),
            on_faulted,
            BTreeMap::new(),
            WorkItemKind::ExecuteActivity,
        )
    }

    /// Schedules an expression child. Its result is delivered like a function's.
    pub fn schedule_expression(
        &mut self,
        expression: ActivityId,
        on_completed: &str,
        on_faulted: Option<&str>,
    ) -> Result<ActivityInstanceRef, WorkflowFault> {
        let completion = self.core.callback(self.instance, self.activity, on_completed)?;
        self.schedule(
            expression,
            Some(CompletionCallback::Function(completion)),
            on_faulted,
            BTreeMap::new(),
            WorkItemKind::ExecuteExpression,
        )
    }

    /// Schedules a delegate handler with values for its In arguments. Every
    /// Out and InOut value is delivered to `on_completed`.
    pub fn schedule_delegate(
        &mut self,
        handler: ActivityId,
        inputs: BTreeMap<String, Value>,
        on_completed: Option<&str>,
        on_faulted: Option<&str>,
    ) -> Result<ActivityInstanceRef, WorkflowFault> {
        let completion = on_completed
            .map(|h| self.core.callback(self.instance, self.activity, h))
            .transpose()?
            .map(CompletionCallback::Delegate);
        self.schedule(handler, completion, on_faulted, inputs, WorkItemKind::ExecuteActivity)
    }

    fn schedule(
        &mut self,
        child: ActivityId,
        completion: Option<CompletionCallback>,
        on_faulted: Option<&str>,
        inputs: BTreeMap<String, Value>,
        kind: WorkItemKind,
    ) -> Result<ActivityInstanceRef, WorkflowFault> {
        let fault = on_faulted
            .map(|h| self.core.callback(self.instance, self.activity, h))
            .transpose()?;
        self.core
            .schedule_child(self.instance, child, completion, fault, inputs, kind)
    }

    /// Starts an activity that outlives this instance and runs beside the
    /// root. The workflow stays executing until every secondary root ends.
    pub fn schedule_secondary_root(
        &mut self,
        activity: ActivityId,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ActivityInstanceRef, WorkflowFault> {
        self.core.schedule_secondary_root(self.instance, activity, inputs)
    }

    /// `handler` runs once the root completed while secondary roots are
    /// still running.
    pub fn register_main_root_complete_callback(&mut self, handler: &str) -> Result<(), WorkflowFault> {
        let callback = self.core.callback(self.instance, self.activity, handler)?;
        self.core.register_main_root_complete(self.instance, callback)
    }

    pub fn cancel_child(&mut self, child: InstanceId) -> Result<(), WorkflowFault> {
        self.ensure_child(child)?;
        self.core.cancel_activity(child);
        Ok(())
    }

    pub fn cancel_children(&mut self) {
        let children = self
            .core
            .instances
            .get(&self.instance)
            .map(|i| i.children.clone())
            .unwrap_or_default();
        for child in children.into_iter().rev() {
            self.core.cancel_activity(child);
        }
    }

    /// Cancels every child and completes as canceled once only bookmarks
    /// remain.
    pub fn cancel_default(&mut self) {
        self.cancel_children();
        if let Some(instance) = self.core.instances.get_mut(&self.instance) {
            instance.performing_default_cancelation = true;
        }
    }

    /// Completes this instance as `Canceled` instead of `Closed`.
    pub fn mark_canceled(&mut self) -> Result<(), WorkflowFault> {
        let Some(instance) = self.core.instances.get_mut(&self.instance) else {
            return Err(WorkflowFault::invalid_operation("instance is gone"));
        };
        if !instance.is_cancellation_requested {
            return Err(WorkflowFault::invalid_operation(
                "an instance can only be marked canceled after cancellation was requested",
            ));
        }
        instance.marked_canceled = true;
        Ok(())
    }

    pub fn abort_child(&mut self, child: InstanceId, reason: WorkflowFault) -> Result<(), WorkflowFault> {
        self.ensure_child(child)?;
        self.core.push_abort(child, reason);
        Ok(())
    }

    fn ensure_child(&self, child: InstanceId) -> Result<(), WorkflowFault> {
        let is_child = self
            .core
            .instances
            .get(&self.instance)
            .is_some_and(|i| i.children.contains(&child));
        if is_child {
            Ok(())
        } else {
            Err(WorkflowFault::invalid_operation(format!(
                "instance {child} is not a child of instance {}",
                self.instance
            )))
        }
    }

    // -- bookmarks --

    pub fn create_bookmark(
        &mut self,
        name: &str,
        callback: Option<&str>,
        options: BookmarkOptions,
    ) -> Result<Bookmark, WorkflowFault> {
        self.add_bookmark(Bookmark::new(name), callback, options, None)
    }

    /// A bookmark only this workflow can resume.
    pub fn create_internal_bookmark(
        &mut self,
        callback: Option<&str>,
        options: BookmarkOptions,
    ) -> Result<Bookmark, WorkflowFault> {
        let bookmark = self.core.new_internal_bookmark();
        self.add_bookmark(bookmark, callback, options, None)
    }

    pub fn create_bookmark_in_scope(
        &mut self,
        name: &str,
        callback: Option<&str>,
        scope: &BookmarkScope,
        options: BookmarkOptions,
    ) -> Result<Bookmark, WorkflowFault> {
        self.add_bookmark(Bookmark::new(name), callback, options, Some(scope.clone()))
    }

    fn add_bookmark(
        &mut self,
        bookmark: Bookmark,
        callback: Option<&str>,
        options: BookmarkOptions,
        scope: Option<BookmarkScope>,
    ) -> Result<Bookmark, WorkflowFault> {
        let callback = callback
            .map(|h| self.core.callback(self.instance, self.activity, h))
            .transpose()?;
        self.core
            .add_bookmark(self.instance, bookmark, callback, options, scope)
    }

    pub fn remove_bookmark(&mut self, bookmark: &Bookmark) -> bool {
        self.core.remove_bookmark(self.instance, bookmark)
    }

    pub fn remove_all_bookmarks(&mut self) {
        self.core.remove_bookmarks_owned_by(self.instance);
    }

    /// Resumes a bookmark from inside the workflow. The resumption is queued
    /// behind work already waiting.
    pub fn resume_bookmark(&mut self, bookmark: &Bookmark, value: Value) -> BookmarkResumptionResult {
        self.core.try_resume_user_bookmark(bookmark, value)
    }

    /// A scope whose correlation id is decided later.
    pub fn create_bookmark_scope(&mut self) -> BookmarkScope {
        self.core.scopes.create_uninitialized(self.instance)
    }

    /// Registers an initialized scope and associates its id with the host.
    pub fn register_bookmark_scope(&mut self, id: Uuid) -> Result<BookmarkScope, WorkflowFault> {
        let scope = self.core.scopes.register(id, self.instance)?;
        self.core.associate_keys(&[id])?;
        Ok(scope)
    }

    pub fn initialize_bookmark_scope(
        &mut self,
        scope: &BookmarkScope,
        id: Uuid,
    ) -> Result<BookmarkScope, WorkflowFault> {
        let initialized = self.core.scopes.initialize(scope, id)?;
        self.core.associate_keys(&[id])?;
        debug!(scope = %initialized, "bookmark scope initialized");
        Ok(initialized)
    }

    pub fn create_exclusive_handle(&mut self) -> ExclusiveHandleId {
        self.core.exclusive_handles.create(self.instance)
    }

    /// Important bookmarks of a handle report `NotReady` while any
    /// unimportant bookmark of the same handle is outstanding.
    pub fn add_to_exclusive_handle(
        &mut self,
        handle: ExclusiveHandleId,
        bookmark: &Bookmark,
        important: bool,
    ) -> Result<(), WorkflowFault> {
        if self.core.exclusive_handles.add(handle, bookmark.clone(), important) {
            Ok(())
        } else {
            Err(WorkflowFault::invalid_operation(format!(
                "exclusive handle {handle:?} does not exist"
            )))
        }
    }

    // -- persistence --

    /// Asks the host to persist at the next point the instance is
    /// persistable. The returned bookmark fires, optionally into `callback`,
    /// once the snapshot was taken.
    pub fn request_persist(&mut self, callback: Option<&str>) -> Result<Bookmark, WorkflowFault> {
        let bookmark = self.create_internal_bookmark(callback, BookmarkOptions::NONE)?;
        self.core.add_persistence_waiter(self.instance, bookmark.clone());
        Ok(bookmark)
    }

    pub fn enter_no_persist(&mut self) {
        self.core.enter_no_persist(self.instance);
    }

    pub fn exit_no_persist(&mut self) -> Result<(), WorkflowFault> {
        self.core.exit_no_persist(self.instance)
    }

    // -- properties and extensions --

    /// Registers an execution property visible to this instance and every
    /// descendant until this instance completes.
    pub fn add_property(&mut self, name: &str, value: Value) -> Result<(), WorkflowFault> {
        let Some(instance) = self.core.instances.get_mut(&self.instance) else {
            return Err(WorkflowFault::invalid_operation("instance is gone"));
        };
        if instance.properties.contains_key(name) {
            return Err(WorkflowFault::invalid_operation(format!(
                "property '{name}' is already registered on this instance"
            )));
        }
        instance.properties.insert(name.to_string(), value);
        Ok(())
    }

    pub fn find_property(&self, name: &str) -> Option<&Value> {
        self.core.find_property(self.instance, name)
    }

    pub fn get_extension<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.core
            .host
            .get_extension(TypeId::of::<T>())
            .and_then(|extension| extension.downcast::<T>().ok())
    }

    // -- faults and tracking --

    /// Inside a fault callback: the fault is handled and must not travel
    /// further. The child it came through is aborted.
    pub fn handle_fault(&mut self) {
        self.fault_handled = true;
    }

    /// Inside a fault callback: takes the fault and raises it again from
    /// this instance. The child it came through is aborted, then this
    /// instance faults with `original_source` kept as the fault's source.
    pub fn rethrow(&mut self, fault: WorkflowFault, original_source: Option<ActivityInstanceRef>) {
        self.fault_handled = true;
        self.core.rethrow(self.instance, fault, original_source);
    }

    pub fn track(&mut self, name: &str, data: Value) {
        if !self.core.tracking.tracks_custom() {
            return;
        }
        let instance = self.instance();
        self.core.tracking.record(TrackingRecordKind::Custom {
            name: name.to_string(),
            instance,
            data,
        });
    }
}

/// Handed to [`Activity::abort`](crate::definition::Activity::abort).
#[derive(Debug)]
pub struct AbortContext<'a> {
    pub(crate) instance: ActivityInstanceRef,
    pub(crate) reason: &'a WorkflowFault,
    pub(crate) workflow_instance_id: Uuid,
}

impl AbortContext<'_> {
    pub fn instance(&self) -> ActivityInstanceRef {
        self.instance
    }

    pub fn reason(&self) -> &WorkflowFault {
        self.reason
    }

    pub fn workflow_instance_id(&self) -> Uuid {
        self.workflow_instance_id
    }
}

/// Read-only view handed to [`Activity::evaluate`](crate::definition::Activity::evaluate).
///
/// Lookups start at the instance whose argument is being resolved and walk
/// up from there.
pub struct ResolutionContext<'a> {
    pub(crate) core: &'a ExecutorCore,
    pub(crate) owner: InstanceId,
}

impl ResolutionContext<'_> {
    /// The instance whose argument this expression produces.
    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        let start = self
            .core
            .instances
            .get(&self.owner)
            .and_then(|i| i.parent)
            .unwrap_or(self.owner);
        self.core.lookup_location(start, name)
    }

    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, WorkflowFault> {
        let value = self.get(name).cloned().ok_or_else(|| {
            WorkflowFault::invalid_operation(format!("location '{name}' is not in scope"))
        })?;
        from_workflow_value(name, value).map_err(|e| WorkflowFault::activity(e.to_string()))
    }

    pub fn find_property(&self, name: &str) -> Option<&Value> {
        self.core.find_property(self.owner, name)
    }
}
