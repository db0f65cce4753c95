//! Snapshots and the persistence handshake.
//!
//! An [`ExecutorSnapshot`] is the whole executor state as data: instances,
//! queued work items, bookmarks, scopes and bookkeeping. Callbacks are stored
//! by handler name, so a snapshot taken by one process can be restored by
//! another that built the same [`WorkflowDefinition`](crate::definition::WorkflowDefinition).
//!
//! When an activity calls `request_persist` the executor parks a
//! [`PersistenceWaiter`], and once the instance is persistable it hands a
//! snapshot to [`WorkflowHost::on_begin_persist`](super::WorkflowHost::on_begin_persist)
//! together with a [`PersistCompletion`]. The run loop stays yielded until
//! the completion fires.

use super::activity_executor::ExecutorShared;
use super::bookmark::{Bookmark, BookmarkManager, ExclusiveHandles};
use super::bookmark_scope::BookmarkScopeManager;
use super::instance::{ActivityInstance, ActivityInstanceState, InstanceId};
use super::work_item::WorkItem;
use crate::core::{deserialize_value, serialize_value, Result as CoreResult, WorkflowFault};
use crate::definition::WorkflowIdentity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;
use uuid::Uuid;

/// An activity waiting for the next persistence point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PersistenceWaiter {
    pub(crate) bookmark: Bookmark,
    pub(crate) owner: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSnapshot {
    pub(crate) instance_id: Uuid,
    pub(crate) identity: WorkflowIdentity,
    pub(crate) definition_hash: u64,
    pub(crate) work_items: Vec<WorkItem>,
    pub(crate) instances: Vec<ActivityInstance>,
    pub(crate) bookmarks: BookmarkManager,
    pub(crate) scopes: BookmarkScopeManager,
    pub(crate) exclusive_handles: ExclusiveHandles,
    pub(crate) root: Option<InstanceId>,
    pub(crate) root_scheduled: bool,
    pub(crate) root_completed: bool,
    pub(crate) secondary_roots: Vec<InstanceId>,
    pub(crate) next_instance_id: u64,
    pub(crate) next_bookmark_id: u64,
    pub(crate) execution_state: ActivityInstanceState,
    pub(crate) workflow_outputs: BTreeMap<String, Value>,
    pub(crate) termination_fault: Option<WorkflowFault>,
    pub(crate) should_raise_main_body_complete: bool,
    pub(crate) main_root_complete_bookmark: Option<Bookmark>,
    pub(crate) persistence_waiters: Vec<PersistenceWaiter>,
    pub(crate) tracking_record_number: u64,
    pub(crate) disposed: bool,
}

impl ExecutorSnapshot {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn identity(&self) -> &WorkflowIdentity {
        &self.identity
    }

    pub fn definition_hash(&self) -> u64 {
        self.definition_hash
    }

    pub fn state(&self) -> ActivityInstanceState {
        self.execution_state
    }

    pub fn pending_work_items(&self) -> usize {
        self.work_items.len()
    }

    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        serialize_value(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        deserialize_value(bytes)
    }
}

#[derive(Debug)]
pub(crate) enum PersistState {
    Pending,
    /// The host completed before `on_begin_persist` returned.
    CompletedInline(Result<(), WorkflowFault>),
    /// The run loop yielded; completion restarts it.
    Detached,
    Finished,
}

/// Shared between the executor and one [`PersistCompletion`].
#[derive(Debug)]
pub(crate) struct PersistSlot {
    state: Mutex<PersistState>,
}

impl PersistSlot {
    /// Called once `on_begin_persist` returned. Yields the result when the
    /// host already completed, otherwise marks the slot detached.
    pub(crate) fn detach(&self) -> Option<Result<(), WorkflowFault>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match std::mem::replace(&mut *state, PersistState::Finished) {
            PersistState::CompletedInline(result) => Some(result),
            PersistState::Pending => {
                *state = PersistState::Detached;
                None
            }
            other => {
                *state = other;
                None
            }
        }
    }
}

/// Single-use completion handle for a host persistence call.
///
/// Dropping it without calling [`complete`](PersistCompletion::complete)
/// counts as a failed persist.
#[must_use = "the workflow stays suspended until the completion fires"]
pub struct PersistCompletion {
    slot: Option<Arc<PersistSlot>>,
    executor: Weak<ExecutorShared>,
}

impl PersistCompletion {
    pub(crate) fn new(executor: Weak<ExecutorShared>) -> (Self, Arc<PersistSlot>) {
        let slot = Arc::new(PersistSlot {
            state: Mutex::new(PersistState::Pending),
        });
        let completion = Self {
            slot: Some(slot.clone()),
            executor,
        };
        (completion, slot)
    }

    pub fn complete(mut self, result: Result<(), WorkflowFault>) {
        self.finish(result);
    }

    fn finish(&mut self, result: Result<(), WorkflowFault>) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let mut state = slot.state.lock().unwrap_or_else(|e| e.into_inner());
        match std::mem::replace(&mut *state, PersistState::Finished) {
            PersistState::Pending => *state = PersistState::CompletedInline(result),
            PersistState::Detached => {
                drop(state);
                match self.executor.upgrade() {
                    Some(executor) => executor.finish_persist(result),
                    None => warn!("persist completed after its executor was dropped"),
                }
            }
            other => *state = other,
        }
    }
}

impl Drop for PersistCompletion {
    fn drop(&mut self) {
        if self.slot.is_some() {
            self.finish(Err(WorkflowFault::callback(
                "persist completion dropped without completing",
                None,
            )));
        }
    }
}

impl std::fmt::Debug for PersistCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistCompletion")
            .field("pending", &self.slot.is_some())
            .finish()
    }
}
