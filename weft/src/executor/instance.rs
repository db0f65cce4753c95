//! Activity instances.
//!
//! One [`ActivityInstance`] exists per scheduled activity. Instances live in
//! an arena keyed by [`InstanceId`] inside the executor and refer to each
//! other by id only, so completing an instance is a map removal plus an
//! index update on its parent.
//!
//! # State machine
//!
//! ```text
//! Executing ──(cancel requested)──> Executing/Canceling ──┐
//!     │                                                   ├──> Closed | Canceled | Faulted
//!     └───────────────────────────────────────────────────┘
//! ```
//!
//! A terminal state is never left. [`ActivityInstance::finish`] refuses any
//! second transition.

use super::callback::{CompletionCallback, FaultCallback};
use super::environment::LocationEnvironment;
use super::error::{ExecutionError, Result};
use crate::definition::ActivityId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Per-executor, monotonically increasing instance id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

/// State of an activity instance, and of the workflow as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityInstanceState {
    Executing,
    Closed,
    Canceled,
    Faulted,
}

impl ActivityInstanceState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ActivityInstanceState::Executing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityInstanceState::Executing => "executing",
            ActivityInstanceState::Closed => "closed",
            ActivityInstanceState::Canceled => "canceled",
            ActivityInstanceState::Faulted => "faulted",
        }
    }
}

impl fmt::Display for ActivityInstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refinement of [`ActivityInstanceState::Executing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) enum SubState {
    /// Scheduled, nothing ran yet.
    Created,
    /// Waiting on argument expressions.
    ResolvingArguments,
    /// `execute` has been called.
    Executing,
    /// `cancel` has been called.
    Canceling,
}

/// A lightweight, copyable view of an instance handed to callbacks and hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityInstanceRef {
    pub id: InstanceId,
    pub activity: ActivityId,
    pub state: ActivityInstanceState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ActivityInstance {
    pub(crate) id: InstanceId,
    pub(crate) activity: ActivityId,
    pub(crate) parent: Option<InstanceId>,
    pub(crate) children: Vec<InstanceId>,
    pub(crate) state: ActivityInstanceState,
    pub(crate) sub_state: SubState,
    pub(crate) environment: LocationEnvironment,
    /// Values supplied by the scheduler of this instance for its In arguments.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) argument_overrides: BTreeMap<String, Value>,
    /// Execution properties, visible to every descendant.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) properties: BTreeMap<String, Value>,
    pub(crate) completion_callback: Option<CompletionCallback>,
    pub(crate) fault_callback: Option<FaultCallback>,
    pub(crate) is_cancellation_requested: bool,
    pub(crate) performing_default_cancelation: bool,
    pub(crate) marked_canceled: bool,
    pub(crate) busy_count: u32,
    pub(crate) blocking_bookmarks: u32,
    pub(crate) no_persist_count: u32,
}

impl ActivityInstance {
    pub(crate) fn new(id: InstanceId, activity: ActivityId, parent: Option<InstanceId>) -> Self {
        Self {
            id,
            activity,
            parent,
            children: Vec::new(),
            state: ActivityInstanceState::Executing,
            sub_state: SubState::Created,
            environment: LocationEnvironment::new(),
            argument_overrides: BTreeMap::new(),
            properties: BTreeMap::new(),
            completion_callback: None,
            fault_callback: None,
            is_cancellation_requested: false,
            performing_default_cancelation: false,
            marked_canceled: false,
            busy_count: 0,
            blocking_bookmarks: 0,
            no_persist_count: 0,
        }
    }

    pub(crate) fn to_ref(&self) -> ActivityInstanceRef {
        ActivityInstanceRef {
            id: self.id,
            activity: self.activity,
            state: self.state,
        }
    }

    pub(crate) fn is_executing(&self) -> bool {
        self.state == ActivityInstanceState::Executing
    }

    /// True until `execute` has been invoked.
    pub(crate) fn has_not_executed(&self) -> bool {
        matches!(self.sub_state, SubState::Created | SubState::ResolvingArguments)
    }

    /// Children, blocking bookmarks or outstanding async work keep an
    /// instance from completing.
    pub(crate) fn has_pending_work(&self) -> bool {
        !self.children.is_empty() || self.blocking_bookmarks > 0 || self.busy_count > 0
    }

    /// Moves to a terminal state.
    pub(crate) fn finish(&mut self, state: ActivityInstanceState) -> Result<()> {
        if self.state.is_terminal() {
            return Err(ExecutionError::internal(format!(
                "instance {} is already {} and cannot become {}",
                self.id, self.state, state
            )));
        }
        if !state.is_terminal() {
            return Err(ExecutionError::internal(format!(
                "instance {} cannot transition back to {}",
                self.id, state
            )));
        }
        self.state = state;
        Ok(())
    }

    /// The terminal state this instance would close with right now.
    pub(crate) fn closing_state(&self) -> ActivityInstanceState {
        if self.marked_canceled {
            ActivityInstanceState::Canceled
        } else {
            ActivityInstanceState::Closed
        }
    }

    pub(crate) fn remove_child(&mut self, child: InstanceId) {
        self.children.retain(|c| *c != child);
    }
}
