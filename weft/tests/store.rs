//! Persisting through an instance store on a tokio runtime.
//!
//! Verifies that:
//! 1. A host can complete a persist asynchronously from a store write
//! 2. The run loop yields during the write and finishes afterwards
//! 3. The stored snapshot restores into an executor that runs to completion

mod common;

use common::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use weft::prelude::*;
use weft::storage::persist_to_store;

struct StoreHost {
    id: Uuid,
    store: Arc<InMemoryInstanceStore>,
    handle: Handle,
}

impl WorkflowHost for StoreHost {
    fn instance_id(&self) -> Uuid {
        self.id
    }

    fn on_begin_persist(&self, snapshot: ExecutorSnapshot, completion: PersistCompletion) {
        persist_to_store(self.store.clone(), &self.handle, snapshot, completion);
    }
}

fn checkpointed(log: &Log) -> Arc<WorkflowDefinition> {
    definition(|b| {
        let checkpoint = b.add(Checkpoint { log: log.clone() });
        let wait = b.add(WaitForBookmark { name: "approve" });
        b.add(Sequence::new("Main", vec![checkpoint, wait]))
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_persist_through_store_and_restore() {
    let log = new_log();
    let store = Arc::new(InMemoryInstanceStore::new());
    let host = Arc::new(StoreHost {
        id: Uuid::new_v4(),
        store: store.clone(),
        handle: Handle::current(),
    });

    let sync = Arc::new(TokioSynchronizationContext::current());
    let executor = ActivityExecutor::new(checkpointed(&log), host.clone());
    executor.open(sync.clone());
    executor
        .schedule_root_activity(BTreeMap::new(), BTreeMap::new())
        .unwrap();
    executor.run().unwrap();
    sync.wait_for_idle().await;

    assert_eq!(entries(&log), vec!["persisted"]);
    assert_eq!(executor.get_all_bookmarks().len(), 1);
    assert_eq!(store.len(), 1);

    let stored = store.load(host.id).await.unwrap().expect("stored instance");
    assert_eq!(stored.version, 1);
    assert_eq!(stored.state, ActivityInstanceState::Executing);
    drop(executor);

    // The snapshot was taken with the persisted callback still queued.
    let snapshot = store.load_snapshot(host.id).await.unwrap();
    assert!(snapshot.pending_work_items() > 0);
    let restored =
        ActivityExecutor::on_deserialized(checkpointed(&log), RecordingHost::with_id(host.id), snapshot)
            .unwrap();
    restored.run().unwrap();
    assert_eq!(entries(&log), vec!["persisted", "persisted"]);

    assert_eq!(
        restored.try_resume_host_bookmark(&Bookmark::new("approve"), json!(true)),
        BookmarkResumptionResult::Success
    );
    restored.run().unwrap();
    assert_eq!(restored.state(), ActivityInstanceState::Closed);

    assert!(store.delete(host.id).await.unwrap());
    assert!(store.is_empty());
}
