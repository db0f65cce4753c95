//! Work items: the scheduler's only currency.
//!
//! Every work item targets exactly one instance and moves through a fixed
//! pipeline:
//!
//! 1. [`WorkItem::is_valid`] skips items whose instance has already left
//!    `Executing` (a queued cancel for an instance that finished meanwhile).
//!    Persist items target the workflow and only lapse once it is disposed.
//! 2. [`WorkItem::execute`] does the work, unless the item is *empty*.
//!    `Ok(true)` means it completed synchronously, `Ok(false)` means it went
//!    asynchronous and will be finished later. Faults raised by activity code
//!    are stored on the item, never returned; only fatal failures come back
//!    as `Err`.
//! 3. [`WorkItem::post_process`] always runs and advances the instance state
//!    machine (abort on fault, or complete when nothing is pending).
//!
//! Empty items exist only so that step 3 runs against an otherwise inert
//! instance.

use super::bookmark::Bookmark;
use super::callback::{BookmarkCallback, CompletionCallback, FaultCallback};
use super::error::Result;
use super::instance::{ActivityInstanceRef, InstanceId};
use super::persistence::PersistenceWaiter;
use super::runtime::{ExecutorCore, PersistStart};
use crate::core::{Poolable, WorkflowFault};
use crate::definition::ActivityId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum WorkItemKind {
    /// Runs only `post_process`.
    Empty,
    ExecuteRoot,
    ExecuteActivity,
    ExecuteExpression,
    /// Evaluates a fast-path expression for argument `argument` of the
    /// target instance, without creating an instance for it.
    ExecuteSynchronousExpression {
        expression: ActivityId,
        /// Id handed to the expression instance if evaluation faults.
        reserved: InstanceId,
        argument: usize,
    },
    /// Continues argument resolution of the target at `next_index`.
    ResolveNextArgument { next_index: usize },
    Completion {
        callback: CompletionCallback,
        child: ActivityInstanceRef,
        outputs: BTreeMap<String, Value>,
        result: Option<Value>,
    },
    Bookmark {
        callback: Option<BookmarkCallback>,
        bookmark: Bookmark,
        value: Value,
        is_external: bool,
    },
    Fault {
        callback: FaultCallback,
        fault: WorkflowFault,
        propagated_from: ActivityInstanceRef,
        original_source: Option<ActivityInstanceRef>,
    },
    CancelActivity,
    AbortActivity { reason: WorkflowFault },
    /// Carries a fault into `post_process` of an inert instance.
    PropagateException,
    /// Re-raises a fault from a handler, keeping where it first came from.
    RethrowException {
        original_source: Option<ActivityInstanceRef>,
    },
    Persist { waiter: PersistenceWaiter },
}

impl WorkItemKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            WorkItemKind::Empty => "empty",
            WorkItemKind::ExecuteRoot => "execute_root",
            WorkItemKind::ExecuteActivity => "execute_activity",
            WorkItemKind::ExecuteExpression => "execute_expression",
            WorkItemKind::ExecuteSynchronousExpression { .. } => "execute_synchronous_expression",
            WorkItemKind::ResolveNextArgument { .. } => "resolve_next_argument",
            WorkItemKind::Completion { .. } => "completion",
            WorkItemKind::Bookmark { .. } => "bookmark",
            WorkItemKind::Fault { .. } => "fault",
            WorkItemKind::CancelActivity => "cancel_activity",
            WorkItemKind::AbortActivity { .. } => "abort_activity",
            WorkItemKind::PropagateException => "propagate_exception",
            WorkItemKind::RethrowException { .. } => "rethrow_exception",
            WorkItemKind::Persist { .. } => "persist",
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(
            self,
            WorkItemKind::Empty
                | WorkItemKind::AbortActivity { .. }
                | WorkItemKind::PropagateException
                | WorkItemKind::RethrowException { .. }
        )
    }

    /// Callback deliveries keep their owner busy from scheduling until
    /// `post_process`, so the owner cannot complete before it hears back.
    pub(crate) fn holds_owner(&self) -> bool {
        matches!(
            self,
            WorkItemKind::Completion { .. } | WorkItemKind::Bookmark { .. } | WorkItemKind::Fault { .. }
        )
    }

    /// Kinds acquired from the executor's pool.
    pub(crate) fn is_poolable(&self) -> bool {
        matches!(
            self,
            WorkItemKind::Empty
                | WorkItemKind::ExecuteActivity
                | WorkItemKind::ExecuteSynchronousExpression { .. }
                | WorkItemKind::ResolveNextArgument { .. }
                | WorkItemKind::Completion { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct WorkItem {
    pub(crate) instance: InstanceId,
    pub(crate) kind: WorkItemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) exception_to_propagate: Option<WorkflowFault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) original_exception_source: Option<InstanceId>,
    /// Propagate without aborting the target (a handler declined the fault).
    #[serde(default)]
    pub(crate) skip_abort: bool,
}

impl WorkItem {
    pub(crate) fn new(instance: InstanceId, kind: WorkItemKind) -> Self {
        Self {
            instance,
            kind,
            exception_to_propagate: None,
            original_exception_source: None,
            skip_abort: false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.kind.is_empty()
    }

    pub(crate) fn is_valid(&self, core: &ExecutorCore) -> bool {
        match self.kind {
            // Persists the whole workflow; the waiter's owner may be gone.
            WorkItemKind::Persist { .. } => !core.is_disposed(),
            _ => core.is_instance_executing(self.instance),
        }
    }

    /// Stores a fault raised by the target itself.
    pub(crate) fn raise(&mut self, fault: WorkflowFault) {
        self.exception_to_propagate = Some(fault);
        self.original_exception_source = Some(self.instance);
        self.skip_abort = false;
    }

    pub(crate) fn execute(&mut self, core: &mut ExecutorCore) -> Result<bool> {
        let instance = self.instance;
        let raised = match &mut self.kind {
            WorkItemKind::ExecuteRoot
            | WorkItemKind::ExecuteActivity
            | WorkItemKind::ExecuteExpression => core.start_instance(instance, 0)?,
            WorkItemKind::ResolveNextArgument { next_index } => {
                core.start_instance(instance, *next_index)?
            }
            WorkItemKind::ExecuteSynchronousExpression {
                expression,
                reserved,
                argument,
            } => {
                let fault = core.evaluate_inline(instance, *expression, *argument)?;
                if let Some(fault) = fault {
                    self.exception_to_propagate = Some(fault);
                    self.original_exception_source = Some(*reserved);
                }
                return Ok(true);
            }
            WorkItemKind::Completion {
                callback,
                child,
                outputs,
                result,
            } => core.invoke_completion(
                callback,
                *child,
                std::mem::take(outputs),
                result.take(),
            )?,
            WorkItemKind::Bookmark {
                callback,
                bookmark,
                value,
                is_external,
            } => match callback {
                Some(callback) => core.invoke_bookmark(
                    callback,
                    bookmark.clone(),
                    std::mem::take(value),
                    *is_external,
                )?,
                None => None,
            },
            WorkItemKind::Fault {
                callback,
                fault,
                propagated_from,
                original_source,
            } => {
                let outcome = core.invoke_fault(
                    callback,
                    fault.clone(),
                    *propagated_from,
                    *original_source,
                )?;
                if let Some(raised) = outcome.raised {
                    Some(raised)
                } else if !outcome.handled {
                    // Keep travelling up from the handler, which stays alive.
                    self.exception_to_propagate = Some(fault.clone());
                    self.original_exception_source = original_source.map(|s| s.id);
                    self.skip_abort = true;
                    None
                } else {
                    core.abort_handled_source(propagated_from.id, fault)?;
                    None
                }
            }
            WorkItemKind::CancelActivity => core.invoke_cancel(instance)?,
            WorkItemKind::Persist { waiter } => match core.begin_persist(waiter)? {
                PersistStart::Pending => return Ok(false),
                PersistStart::Refused(fault) => Some(fault),
            },
            WorkItemKind::Empty
            | WorkItemKind::AbortActivity { .. }
            | WorkItemKind::PropagateException
            | WorkItemKind::RethrowException { .. } => None,
        };

        if let Some(fault) = raised {
            self.raise(fault);
        }
        Ok(true)
    }

    pub(crate) fn post_process(&mut self, core: &mut ExecutorCore) -> Result<()> {
        if self.kind.holds_owner() {
            core.release_callback_hold(self.instance);
        }
        match &self.kind {
            WorkItemKind::ExecuteSynchronousExpression {
                expression,
                reserved,
                argument,
            } => {
                let fault = self.exception_to_propagate.take();
                self.original_exception_source = None;
                core.finish_inline_expression(self.instance, *expression, *reserved, *argument, fault)
            }
            WorkItemKind::AbortActivity { reason } => {
                let reason = reason.clone();
                core.abort_activity_instance(self.instance, &reason)
            }
            _ => match &self.exception_to_propagate {
                Some(fault) if !self.skip_abort => {
                    let fault = fault.clone();
                    core.abort_activity_instance(self.instance, &fault)
                }
                Some(_) => Ok(()),
                None => core.update_state(self.instance),
            },
        }
    }
}

impl Poolable for WorkItem {
    fn clear_for_reuse(&mut self) {
        self.kind = WorkItemKind::Empty;
        self.exception_to_propagate = None;
        self.original_exception_source = None;
        self.skip_abort = false;
    }
}
