//! Persistable callback handles.
//!
//! A callback never holds a function pointer. It names the owning instance,
//! the owner's activity and a handler string the activity registered in its
//! metadata. Invocation looks the activity up in the definition and calls
//! [`Activity::on_callback`](crate::definition::Activity::on_callback) with
//! the handler name, so a callback survives a snapshot round trip unchanged.
//! After a restore every wrapper is checked against the registration table
//! with [`CallbackWrapper::rebind`].

use super::bookmark::Bookmark;
use super::error::{ExecutionError, Result};
use super::instance::{ActivityInstanceRef, InstanceId};
use crate::core::WorkflowFault;
use crate::definition::{ActivityId, WorkflowDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackWrapper {
    owner: InstanceId,
    activity: ActivityId,
    handler: String,
}

impl CallbackWrapper {
    pub(crate) fn new(owner: InstanceId, activity: ActivityId, handler: impl Into<String>) -> Self {
        Self {
            owner,
            activity,
            handler: handler.into(),
        }
    }

    /// The instance whose handler runs.
    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    pub fn activity(&self) -> ActivityId {
        self.activity
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    /// Checks that the handler is still registered by its activity.
    pub(crate) fn rebind(&self, definition: &WorkflowDefinition) -> Result<()> {
        match definition.metadata(self.activity) {
            Some(metadata) if metadata.has_callback(&self.handler) => Ok(()),
            _ => Err(ExecutionError::CallbackRebind {
                activity: self.activity,
                handler: self.handler.clone(),
            }),
        }
    }
}

/// Handler in a parent that intercepts faults of one child.
pub type FaultCallback = CallbackWrapper;

/// Handler that runs when a bookmark is resumed.
pub type BookmarkCallback = CallbackWrapper;

/// What an instance's completion delivers to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionCallback {
    /// Plain notification.
    Activity(CallbackWrapper),
    /// Delivers the child's `Result` argument.
    Function(CallbackWrapper),
    /// Delivers every Out and InOut argument of a delegate handler.
    Delegate(CallbackWrapper),
    /// Stores the expression's result into argument `argument` of `owner`
    /// and continues resolving the owner's remaining arguments.
    ResolveArgument { owner: InstanceId, argument: usize },
}

/// Outputs a completion callback needs gathered before the child's
/// environment is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputGathering {
    Nothing,
    Result,
    All,
}

impl CompletionCallback {
    pub fn owner(&self) -> InstanceId {
        match self {
            CompletionCallback::Activity(w)
            | CompletionCallback::Function(w)
            | CompletionCallback::Delegate(w) => w.owner(),
            CompletionCallback::ResolveArgument { owner, .. } => *owner,
        }
    }

    pub fn wrapper(&self) -> Option<&CallbackWrapper> {
        match self {
            CompletionCallback::Activity(w)
            | CompletionCallback::Function(w)
            | CompletionCallback::Delegate(w) => Some(w),
            CompletionCallback::ResolveArgument { .. } => None,
        }
    }

    pub(crate) fn gathering(&self) -> OutputGathering {
        match self {
            CompletionCallback::Activity(_) => OutputGathering::Nothing,
            CompletionCallback::Function(_) | CompletionCallback::ResolveArgument { .. } => {
                OutputGathering::Result
            }
            CompletionCallback::Delegate(_) => OutputGathering::All,
        }
    }

    pub(crate) fn rebind(&self, definition: &WorkflowDefinition) -> Result<()> {
        match self.wrapper() {
            Some(wrapper) => wrapper.rebind(definition),
            None => Ok(()),
        }
    }
}

/// Arguments handed to [`Activity::on_callback`](crate::definition::Activity::on_callback).
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackArgs {
    /// A child scheduled by this activity finished.
    Completed {
        child: ActivityInstanceRef,
        /// Gathered Out and InOut values (delegate callbacks only).
        outputs: BTreeMap<String, Value>,
        /// The child's `Result` (function and delegate callbacks only).
        result: Option<Value>,
    },
    /// A fault raised below a child reached this handler.
    Faulted {
        fault: WorkflowFault,
        /// The child of the handling activity the fault arrived through.
        propagated_from: ActivityInstanceRef,
        /// The instance that raised the fault.
        original_source: Option<ActivityInstanceRef>,
    },
    /// A bookmark owned by this activity was resumed.
    BookmarkResumed { bookmark: Bookmark, value: Value },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Activity, ActivityMetadata, DefinitionBuilder, WorkflowIdentity};
    use crate::executor::ActivityContext;

    struct Registered;

    impl Activity for Registered {
        fn metadata(&self) -> ActivityMetadata {
            ActivityMetadata::new("Registered").with_callback("on_done")
        }

        fn execute(&self, _ctx: &mut ActivityContext<'_>) -> std::result::Result<(), WorkflowFault> {
            Ok(())
        }
    }

    #[test]
    fn test_rebind_checks_registration() {
        let mut builder = DefinitionBuilder::new(WorkflowIdentity::new("cb", "1"));
        let root = builder.add(Registered);
        let definition = builder.build(root).unwrap();

        let good = CallbackWrapper::new(InstanceId::new(1), root, "on_done");
        assert!(good.rebind(&definition).is_ok());

        let renamed = CallbackWrapper::new(InstanceId::new(1), root, "on_finished");
        let err = renamed.rebind(&definition).unwrap_err();
        assert!(matches!(err, ExecutionError::CallbackRebind { handler, .. } if handler == "on_finished"));
    }

    #[test]
    fn test_gathering_follows_callback_contract() {
        let w = CallbackWrapper::new(InstanceId::new(1), ActivityId::new(0), "h");
        assert_eq!(
            CompletionCallback::Activity(w.clone()).gathering(),
            OutputGathering::Nothing
        );
        assert_eq!(
            CompletionCallback::Function(w.clone()).gathering(),
            OutputGathering::Result
        );
        assert_eq!(CompletionCallback::Delegate(w).gathering(), OutputGathering::All);
        let resolve = CompletionCallback::ResolveArgument {
            owner: InstanceId::new(4),
            argument: 0,
        };
        assert_eq!(resolve.owner(), InstanceId::new(4));
        assert!(resolve.wrapper().is_none());
    }
}
