//! Tracking records.
//!
//! A host that wants an audit trail supplies a [`TrackingProvider`]. Every
//! record type sits behind a `should_track_*` gate that the executor checks
//! before building the record, so a provider that tracks nothing costs one
//! boolean check per event. Records are buffered during a work item and
//! handed to the provider after the item finishes, outside the executor
//! lock.

use super::instance::{ActivityInstanceRef, ActivityInstanceState};
use crate::core::WorkflowFault;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub trait TrackingProvider: Send + Sync {
    fn should_track_workflow_instance_records(&self) -> bool {
        true
    }

    fn should_track_activity_scheduled_records(&self) -> bool {
        true
    }

    fn should_track_activity_state_records(&self) -> bool {
        true
    }

    fn should_track_fault_propagation_records(&self) -> bool {
        true
    }

    fn should_track_bookmark_resumption_records(&self) -> bool {
        true
    }

    fn should_track_custom_records(&self) -> bool {
        true
    }

    fn add_record(&self, record: TrackingRecord);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowInstanceRecordState {
    Started,
    Completed,
    Canceled,
    Faulted,
    Terminated,
    Aborted,
    UnhandledException,
    Persisted,
}

impl From<ActivityInstanceState> for WorkflowInstanceRecordState {
    fn from(state: ActivityInstanceState) -> Self {
        match state {
            ActivityInstanceState::Canceled => WorkflowInstanceRecordState::Canceled,
            ActivityInstanceState::Faulted => WorkflowInstanceRecordState::Faulted,
            _ => WorkflowInstanceRecordState::Completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrackingRecordKind {
    WorkflowInstance {
        state: WorkflowInstanceRecordState,
    },
    ActivityScheduled {
        /// None when the host scheduled the root.
        parent: Option<ActivityInstanceRef>,
        child: ActivityInstanceRef,
        display_name: String,
    },
    ActivityState {
        instance: ActivityInstanceRef,
        display_name: String,
    },
    FaultPropagation {
        fault: WorkflowFault,
        source: Option<ActivityInstanceRef>,
        /// None when no handler was found.
        handler: Option<ActivityInstanceRef>,
    },
    BookmarkResumption {
        bookmark: String,
        owner: ActivityInstanceRef,
        value: Value,
    },
    Custom {
        name: String,
        instance: ActivityInstanceRef,
        data: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub instance_id: Uuid,
    pub record_number: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: TrackingRecordKind,
}

/// The executor's buffer in front of the provider.
pub(crate) struct Tracking {
    provider: Option<Arc<dyn TrackingProvider>>,
    instance_id: Uuid,
    next_record_number: u64,
    pending: Vec<TrackingRecord>,
}

impl Tracking {
    pub(crate) fn new(
        provider: Option<Arc<dyn TrackingProvider>>,
        instance_id: Uuid,
        next_record_number: u64,
    ) -> Self {
        Self {
            provider,
            instance_id,
            next_record_number,
            pending: Vec::new(),
        }
    }

    fn gate(&self, check: impl FnOnce(&dyn TrackingProvider) -> bool) -> bool {
        self.provider.as_deref().is_some_and(check)
    }

    pub(crate) fn tracks_workflow_instance(&self) -> bool {
        self.gate(|p| p.should_track_workflow_instance_records())
    }

    pub(crate) fn tracks_activity_scheduled(&self) -> bool {
        self.gate(|p| p.should_track_activity_scheduled_records())
    }

    pub(crate) fn tracks_activity_state(&self) -> bool {
        self.gate(|p| p.should_track_activity_state_records())
    }

    pub(crate) fn tracks_fault_propagation(&self) -> bool {
        self.gate(|p| p.should_track_fault_propagation_records())
    }

    pub(crate) fn tracks_bookmark_resumption(&self) -> bool {
        self.gate(|p| p.should_track_bookmark_resumption_records())
    }

    pub(crate) fn tracks_custom(&self) -> bool {
        self.gate(|p| p.should_track_custom_records())
    }

    pub(crate) fn record(&mut self, kind: TrackingRecordKind) {
        self.next_record_number += 1;
        self.pending.push(TrackingRecord {
            instance_id: self.instance_id,
            record_number: self.next_record_number,
            timestamp: Utc::now(),
            kind,
        });
    }

    pub(crate) fn workflow_state(&mut self, state: WorkflowInstanceRecordState) {
        if self.tracks_workflow_instance() {
            self.record(TrackingRecordKind::WorkflowInstance { state });
        }
    }

    /// Hands over the buffered records. They reach the provider once the
    /// executor lock is released.
    pub(crate) fn take_records(&mut self) -> Vec<TrackingRecord> {
        if self.provider.is_none() {
            self.pending.clear();
        }
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn provider(&self) -> Option<Arc<dyn TrackingProvider>> {
        self.provider.clone()
    }

    pub(crate) fn next_record_number(&self) -> u64 {
        self.next_record_number
    }
}

/// Keeps every record in memory. Useful for tests and demos.
#[derive(Default)]
pub struct InMemoryTrackingProvider {
    records: Mutex<Vec<TrackingRecord>>,
}

impl InMemoryTrackingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TrackingRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl TrackingProvider for InMemoryTrackingProvider {
    fn add_record(&self, record: TrackingRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StatesOnly(InMemoryTrackingProvider);

    impl TrackingProvider for StatesOnly {
        fn should_track_activity_scheduled_records(&self) -> bool {
            false
        }

        fn add_record(&self, record: TrackingRecord) {
            self.0.add_record(record)
        }
    }

    #[test]
    fn test_without_provider_everything_is_gated_off() {
        let tracking = Tracking::new(None, Uuid::new_v4(), 0);
        assert!(!tracking.tracks_workflow_instance());
        assert!(!tracking.tracks_custom());
    }

    #[test]
    fn test_records_are_buffered_until_taken() {
        let provider = Arc::new(InMemoryTrackingProvider::new());
        let mut tracking = Tracking::new(Some(provider.clone()), Uuid::new_v4(), 5);

        tracking.workflow_state(WorkflowInstanceRecordState::Started);
        assert!(provider.records().is_empty());

        let records = tracking.take_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_number, 6);
        assert_eq!(tracking.next_record_number(), 6);
        assert!(tracking.take_records().is_empty());
        assert!(provider.records().is_empty());
    }

    #[test]
    fn test_individual_gates() {
        let provider: Arc<dyn TrackingProvider> =
            Arc::new(StatesOnly(InMemoryTrackingProvider::new()));
        let tracking = Tracking::new(Some(provider), Uuid::new_v4(), 0);
        assert!(tracking.tracks_activity_state());
        assert!(!tracking.tracks_activity_scheduled());
    }
}
