//! Faults as data.
//!
//! A [`WorkflowFault`] is what activity code raises and what travels up the
//! instance tree. It is a plain serializable value so that a fault captured on
//! a work item survives a snapshot, and so that a fault handler can inspect it
//! after the workflow was reloaded in another process.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a [`WorkflowFault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum FaultKind {
    /// Raised by activity logic. The expected, recoverable case.
    Activity,
    /// An operation was attempted in a state that does not allow it.
    InvalidOperation,
    /// The workflow or an operation was canceled or aborted.
    OperationCanceled,
    /// A host-supplied callback failed. Always fatal to the instance.
    Callback,
    /// Dedicated fatal class: the engine's invariants may no longer hold.
    Fatal,
    /// Allocation failure reported by activity code.
    OutOfMemory,
    /// Wrapper produced while invoking a handler; classified by its inner faults.
    Invocation,
    /// Wrapper over several faults; classified by its inner faults.
    Aggregate,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Activity => "activity",
            FaultKind::InvalidOperation => "invalid operation",
            FaultKind::OperationCanceled => "operation canceled",
            FaultKind::Callback => "callback",
            FaultKind::Fatal => "fatal",
            FaultKind::OutOfMemory => "out of memory",
            FaultKind::Invocation => "invocation",
            FaultKind::Aggregate => "aggregate",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exception raised inside a workflow, represented as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowFault {
    kind: FaultKind,
    message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    inner: Vec<WorkflowFault>,
}

impl WorkflowFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            inner: Vec::new(),
        }
    }

    /// A recoverable fault raised by activity logic.
    pub fn activity(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Activity, message)
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(FaultKind::InvalidOperation, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(FaultKind::OperationCanceled, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Fatal, message)
    }

    /// Wraps a failure reported by a host callback.
    pub fn callback(message: impl Into<String>, inner: Option<WorkflowFault>) -> Self {
        Self {
            kind: FaultKind::Callback,
            message: message.into(),
            inner: inner.into_iter().collect(),
        }
    }

    /// Wraps `inner` the way a handler invocation would.
    pub fn invocation(inner: WorkflowFault) -> Self {
        Self {
            kind: FaultKind::Invocation,
            message: "handler invocation failed".to_string(),
            inner: vec![inner],
        }
    }

    pub fn aggregate(message: impl Into<String>, inner: Vec<WorkflowFault>) -> Self {
        Self {
            kind: FaultKind::Aggregate,
            message: message.into(),
            inner,
        }
    }

    /// Attaches `inner` as the cause of this fault.
    pub fn with_inner(mut self, inner: WorkflowFault) -> Self {
        self.inner.push(inner);
        self
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn inner(&self) -> &[WorkflowFault] {
        &self.inner
    }

    /// Returns true for faults that must never be caught and converted.
    ///
    /// Out-of-memory, the fatal class and host callback failures are fatal.
    /// Invocation and aggregate wrappers are fatal when any wrapped fault is.
    pub fn is_fatal(&self) -> bool {
        match self.kind {
            FaultKind::Fatal | FaultKind::OutOfMemory | FaultKind::Callback => true,
            FaultKind::Invocation | FaultKind::Aggregate => {
                self.inner.iter().any(WorkflowFault::is_fatal)
            }
            _ => false,
        }
    }
}

impl fmt::Display for WorkflowFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(first) = self.inner.first() {
            write!(f, " ({})", first)?;
        }
        Ok(())
    }
}

impl std::error::Error for WorkflowFault {}

impl From<String> for WorkflowFault {
    fn from(message: String) -> Self {
        WorkflowFault::activity(message)
    }
}

impl From<&str> for WorkflowFault {
    fn from(message: &str) -> Self {
        WorkflowFault::activity(message)
    }
}
