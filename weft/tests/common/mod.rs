//! Shared test activities and a host that records everything it is told.

#![allow(dead_code)]

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use weft::executor::{InMemoryTrackingProvider, TrackingProvider};
use weft::prelude::*;

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Appends a fixed line to a shared log.
pub struct Record {
    pub text: &'static str,
    pub log: Log,
}

impl Activity for Record {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new(format!("Record({})", self.text))
    }

    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        self.log.lock().unwrap().push(self.text.to_string());
        Ok(())
    }
}

/// Runs its children one after another.
pub struct Sequence {
    pub name: &'static str,
    pub children: Vec<ActivityId>,
    pub variables: Vec<(&'static str, Value)>,
}

impl Sequence {
    pub fn new(name: &'static str, children: Vec<ActivityId>) -> Self {
        Self {
            name,
            children,
            variables: Vec::new(),
        }
    }

    pub fn with_variable(mut self, name: &'static str, default: Value) -> Self {
        self.variables.push((name, default));
        self
    }

    fn schedule_next(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        let index: usize = ctx.get_as("index")?;
        if let Some(child) = self.children.get(index) {
            ctx.set("index", json!(index + 1))?;
            ctx.schedule_activity(*child, Some("next"), None)?;
        }
        Ok(())
    }
}

impl Activity for Sequence {
    fn metadata(&self) -> ActivityMetadata {
        let mut metadata = ActivityMetadata::new(self.name)
            .with_children(self.children.iter().copied())
            .with_variable("index", json!(0))
            .with_callback("next");
        for (name, default) in &self.variables {
            metadata = metadata.with_variable(*name, default.clone());
        }
        metadata
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        self.schedule_next(ctx)
    }

    fn on_callback(
        &self,
        ctx: &mut ActivityContext<'_>,
        handler: &str,
        _args: CallbackArgs,
    ) -> Result<(), WorkflowFault> {
        match handler {
            "next" if ctx.is_cancellation_requested() => Ok(()),
            "next" => self.schedule_next(ctx),
            other => Err(WorkflowFault::invalid_operation(format!("unknown handler {other}"))),
        }
    }
}

/// Waits on a named bookmark and returns the resumption value.
pub struct WaitForBookmark {
    pub name: &'static str,
}

impl Activity for WaitForBookmark {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new(format!("Wait({})", self.name))
            .with_result()
            .with_callback("resumed")
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        ctx.create_bookmark(self.name, Some("resumed"), BookmarkOptions::NONE)?;
        Ok(())
    }

    fn on_callback(
        &self,
        ctx: &mut ActivityContext<'_>,
        _handler: &str,
        args: CallbackArgs,
    ) -> Result<(), WorkflowFault> {
        match args {
            CallbackArgs::BookmarkResumed { value, .. } => ctx.set_result(value),
            _ => Ok(()),
        }
    }
}

/// Raises an activity fault when executed.
pub struct Thrower {
    pub message: &'static str,
}

impl Activity for Thrower {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Thrower")
    }

    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        Err(WorkflowFault::activity(self.message))
    }
}

/// Runs `body` and intercepts faults raised anywhere below it.
pub struct TryCatch {
    pub body: ActivityId,
    pub handles: bool,
    pub seen: Arc<Mutex<Vec<CallbackArgs>>>,
}

impl TryCatch {
    pub fn new(body: ActivityId, handles: bool) -> Self {
        Self {
            body,
            handles,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Activity for TryCatch {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("TryCatch")
            .with_child(self.body)
            .with_callback("faulted")
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        ctx.schedule_activity(self.body, None, Some("faulted"))?;
        Ok(())
    }

    fn on_callback(
        &self,
        ctx: &mut ActivityContext<'_>,
        _handler: &str,
        args: CallbackArgs,
    ) -> Result<(), WorkflowFault> {
        self.seen.lock().unwrap().push(args);
        if self.handles {
            ctx.handle_fault();
        }
        Ok(())
    }
}

/// Returns its `Value` argument as its result.
pub struct Echo {
    pub binding: ArgumentBinding,
    pub result_to: Option<&'static str>,
}

impl Echo {
    pub fn new(binding: ArgumentBinding) -> Self {
        Self {
            binding,
            result_to: None,
        }
    }

    pub fn into_variable(mut self, variable: &'static str) -> Self {
        self.result_to = Some(variable);
        self
    }
}

impl Activity for Echo {
    fn metadata(&self) -> ActivityMetadata {
        let metadata = ActivityMetadata::new("Echo").with_in_argument("Value", self.binding.clone());
        match self.result_to {
            Some(variable) => metadata.with_result_to(variable),
            None => metadata.with_result(),
        }
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        let value = ctx.get("Value").cloned().unwrap_or(Value::Null);
        ctx.set_result(value)
    }
}

/// Logs `name=value` for a location visible from this instance.
pub struct Capture {
    pub name: &'static str,
    pub log: Log,
}

impl Activity for Capture {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new(format!("Capture({})", self.name))
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        let value = ctx.get(self.name).cloned().unwrap_or(Value::Null);
        self.log
            .lock()
            .unwrap()
            .push(format!("{}={}", self.name, value));
        Ok(())
    }
}

/// Schedules every child at once; they start in declaration order.
pub struct Parallel {
    pub children: Vec<ActivityId>,
}

impl Activity for Parallel {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Parallel").with_children(self.children.iter().copied())
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        for child in self.children.iter().rev() {
            ctx.schedule_activity(*child, None, None)?;
        }
        Ok(())
    }
}

/// Waits on a named bookmark and logs `name=value` when resumed.
pub struct LoggingWait {
    pub name: &'static str,
    pub log: Log,
}

impl Activity for LoggingWait {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new(format!("LoggingWait({})", self.name)).with_callback("resumed")
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        ctx.create_bookmark(self.name, Some("resumed"), BookmarkOptions::NONE)?;
        Ok(())
    }

    fn on_callback(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _handler: &str,
        args: CallbackArgs,
    ) -> Result<(), WorkflowFault> {
        if let CallbackArgs::BookmarkResumed { value, .. } = args {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}={}", self.name, value));
        }
        Ok(())
    }
}

/// Fast-path expression adding two integer locations.
pub struct Sum {
    pub left: &'static str,
    pub right: &'static str,
}

impl Activity for Sum {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Sum").with_result().with_fast_path()
    }

    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        Err(WorkflowFault::invalid_operation("Sum only evaluates inline"))
    }

    fn evaluate(&self, ctx: &ResolutionContext<'_>) -> Result<Value, WorkflowFault> {
        let left: i64 = ctx.get_as(self.left)?;
        let right: i64 = ctx.get_as(self.right)?;
        Ok(json!(left + right))
    }
}

/// Expression that runs as a full child instance.
pub struct Constant {
    pub value: Value,
}

impl Activity for Constant {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Constant").with_result()
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        ctx.set_result(self.value.clone())
    }
}

/// Asks the host for a snapshot and logs once it was taken.
pub struct Checkpoint {
    pub log: Log,
}

impl Activity for Checkpoint {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Checkpoint").with_callback("persisted")
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        ctx.request_persist(Some("persisted"))?;
        Ok(())
    }

    fn on_callback(
        &self,
        _ctx: &mut ActivityContext<'_>,
        handler: &str,
        _args: CallbackArgs,
    ) -> Result<(), WorkflowFault> {
        self.log.lock().unwrap().push(handler.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unhandled {
    pub fault: WorkflowFault,
    pub source: Option<ActivityInstanceRef>,
}

/// A host that records notifications and stores snapshots in memory.
#[derive(Default)]
pub struct RecordingHost {
    pub id: Uuid,
    pub paused: Mutex<usize>,
    pub unhandled: Mutex<Vec<Unhandled>>,
    pub abort_requests: Mutex<Vec<WorkflowFault>>,
    pub snapshots: Mutex<Vec<ExecutorSnapshot>>,
    pub associated: Mutex<Vec<Uuid>>,
    pub disassociated: Mutex<Vec<Uuid>>,
    pub tracking: Option<Arc<InMemoryTrackingProvider>>,
    pub fail_persist: bool,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            ..Default::default()
        })
    }

    pub fn with_id(id: Uuid) -> Arc<Self> {
        Arc::new(Self {
            id,
            ..Default::default()
        })
    }

    pub fn tracked() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            tracking: Some(Arc::new(InMemoryTrackingProvider::new())),
            ..Default::default()
        })
    }

    pub fn failing_persist() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            fail_persist: true,
            ..Default::default()
        })
    }

    pub fn paused_count(&self) -> usize {
        *self.paused.lock().unwrap()
    }

    pub fn unhandled(&self) -> Vec<Unhandled> {
        self.unhandled.lock().unwrap().clone()
    }

    pub fn snapshots(&self) -> Vec<ExecutorSnapshot> {
        self.snapshots.lock().unwrap().clone()
    }
}

impl WorkflowHost for RecordingHost {
    fn instance_id(&self) -> Uuid {
        self.id
    }

    fn on_request_abort(&self, reason: &WorkflowFault) {
        self.abort_requests.lock().unwrap().push(reason.clone());
    }

    fn notify_paused(&self) {
        *self.paused.lock().unwrap() += 1;
    }

    fn notify_unhandled_exception(&self, fault: &WorkflowFault, source: Option<ActivityInstanceRef>) {
        self.unhandled.lock().unwrap().push(Unhandled {
            fault: fault.clone(),
            source,
        });
    }

    fn on_begin_persist(&self, snapshot: ExecutorSnapshot, completion: PersistCompletion) {
        self.snapshots.lock().unwrap().push(snapshot);
        if self.fail_persist {
            completion.complete(Err(WorkflowFault::activity("disk full")));
        } else {
            completion.complete(Ok(()));
        }
    }

    fn associate_keys(&self, keys: &[Uuid]) -> Result<(), WorkflowFault> {
        self.associated.lock().unwrap().extend_from_slice(keys);
        Ok(())
    }

    fn disassociate_keys(&self, keys: &[Uuid]) {
        self.disassociated.lock().unwrap().extend_from_slice(keys);
    }

    fn tracking_provider(&self) -> Option<Arc<dyn TrackingProvider>> {
        self.tracking
            .clone()
            .map(|p| p as Arc<dyn TrackingProvider>)
    }
}

pub fn identity() -> WorkflowIdentity {
    WorkflowIdentity::new("test-workflow", "1")
}

/// Builds a definition with `build`, which receives the builder and returns the root.
pub fn definition(build: impl FnOnce(&mut DefinitionBuilder) -> ActivityId) -> Arc<WorkflowDefinition> {
    let mut builder = DefinitionBuilder::new(identity());
    let root = build(&mut builder);
    Arc::new(builder.build(root).unwrap())
}

/// Schedules the root with no arguments and runs the loop to rest.
pub fn start(executor: &ActivityExecutor) {
    executor
        .schedule_root_activity(BTreeMap::new(), BTreeMap::new())
        .unwrap();
    executor.run().unwrap();
}
