//! The host contract.
//!
//! The executor is passive: it never persists, never spawns, never decides
//! what happens to an instance after it goes idle. Everything that leaves the
//! executor goes through a [`WorkflowHost`]. Every method except
//! [`instance_id`](WorkflowHost::instance_id) has a default, so a host only
//! implements what it cares about.
//!
//! Host callbacks are invoked without the executor's internal lock held,
//! except [`associate_keys`](WorkflowHost::associate_keys) which must answer
//! synchronously and must not call back into the executor.

use super::instance::ActivityInstanceRef;
use super::persistence::{ExecutorSnapshot, PersistCompletion};
use super::tracking::TrackingProvider;
use crate::core::WorkflowFault;
use crate::definition::WorkflowIdentity;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub type Extension = Arc<dyn Any + Send + Sync>;

pub trait WorkflowHost: Send + Sync {
    /// Identifies the workflow instance. Must not be nil.
    fn instance_id(&self) -> Uuid;

    /// When set, a snapshot is only accepted if it was taken for this
    /// definition identity.
    fn definition_identity(&self) -> Option<WorkflowIdentity> {
        None
    }

    fn get_extension(&self, _type_id: TypeId) -> Option<Extension> {
        None
    }

    /// The executor decided to abort. It unwinds on its own; the host may
    /// want to discard in-flight persistence.
    fn on_request_abort(&self, _reason: &WorkflowFault) {}

    /// The run loop stopped and nothing is runnable.
    fn notify_paused(&self) {}

    fn notify_unhandled_exception(
        &self,
        _fault: &WorkflowFault,
        _source: Option<ActivityInstanceRef>,
    ) {
    }

    /// Store `snapshot`, then call [`PersistCompletion::complete`], either
    /// before returning or later from any thread. The run loop stays yielded
    /// until then.
    fn on_begin_persist(&self, _snapshot: ExecutorSnapshot, completion: PersistCompletion) {
        completion.complete(Ok(()));
    }

    /// A bookmark scope was initialized with these correlation keys.
    fn associate_keys(&self, _keys: &[Uuid]) -> Result<(), WorkflowFault> {
        Ok(())
    }

    fn disassociate_keys(&self, _keys: &[Uuid]) {}

    fn tracking_provider(&self) -> Option<Arc<dyn TrackingProvider>> {
        None
    }
}

/// A type map hosts can use to serve [`WorkflowHost::get_extension`].
#[derive(Default, Clone)]
pub struct HostExtensions {
    entries: HashMap<TypeId, Extension>,
}

impl HostExtensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any + Send + Sync>(mut self, extension: T) -> Self {
        self.insert(extension);
        self
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, extension: T) {
        self.entries.insert(TypeId::of::<T>(), Arc::new(extension));
    }

    pub fn get(&self, type_id: TypeId) -> Option<Extension> {
        self.entries.get(&type_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for HostExtensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostExtensions")
            .field("len", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Clock(u64);

    #[test]
    fn test_extensions_by_type() {
        let extensions = HostExtensions::new().with(Clock(7)).with(String::from("x"));
        assert_eq!(extensions.len(), 2);

        let clock = extensions
            .get(TypeId::of::<Clock>())
            .and_then(|e| e.downcast::<Clock>().ok())
            .unwrap();
        assert_eq!(*clock, Clock(7));
        assert!(extensions.get(TypeId::of::<u8>()).is_none());
    }
}
