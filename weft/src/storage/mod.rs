//! Storage layer for weft snapshots.
//!
//! The executor never persists anything itself. A host receives an
//! [`ExecutorSnapshot`] in
//! [`WorkflowHost::on_begin_persist`](crate::executor::WorkflowHost::on_begin_persist)
//! and decides where it goes. This module provides a trait-based interface
//! for that decision:
//!
//! - [`InstanceStore`]: async save/load/delete/list of stored instances
//! - [`InMemoryInstanceStore`]: DashMap-backed store for tests and development
//! - [`persist_to_store`]: bridges a host persist call onto a tokio runtime
//!
//! # Example
//!
//! ```no_run
//! use weft::storage::{InMemoryInstanceStore, InstanceStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryInstanceStore::new();
//! for stored in store.list().await? {
//!     println!("{} saved at {}", stored.instance_id, stored.saved_at);
//! }
//! # Ok(())
//! # }
//! ```

use crate::core::WorkflowFault;
use crate::definition::WorkflowIdentity;
use crate::executor::{ActivityInstanceState, ExecutorSnapshot, PersistCompletion};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error};
use uuid::Uuid;

mod error;
pub mod memory;

pub use error::{Result, StorageError};
pub use memory::InMemoryInstanceStore;

/// A snapshot as it sits in a store, with the metadata needed to list and
/// pick instances without decoding them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredInstance {
    pub instance_id: Uuid,
    pub identity: WorkflowIdentity,
    pub state: ActivityInstanceState,
    /// Encoded [`ExecutorSnapshot`].
    pub snapshot: Vec<u8>,
    pub saved_at: DateTime<Utc>,
    /// Bumped by the store on every save; zero before the first.
    pub version: u64,
}

impl StoredInstance {
    pub fn from_snapshot(snapshot: &ExecutorSnapshot) -> Result<Self> {
        Ok(Self {
            instance_id: snapshot.instance_id(),
            identity: snapshot.identity().clone(),
            state: snapshot.state(),
            snapshot: snapshot.to_bytes()?,
            saved_at: Utc::now(),
            version: 0,
        })
    }

    pub fn snapshot(&self) -> Result<ExecutorSnapshot> {
        Ok(ExecutorSnapshot::from_bytes(&self.snapshot)?)
    }
}

/// Trait for snapshot storage backends.
///
/// Implementations must be thread-safe. Using `async_trait` allows truly
/// async backends without forcing blocking calls in async contexts.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Stores `instance`, replacing any earlier save of the same instance.
    /// Returns the stored version.
    async fn save(&self, instance: StoredInstance) -> Result<u64>;

    async fn load(&self, id: Uuid) -> Result<Option<StoredInstance>>;

    /// Returns false if nothing was stored under `id`.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn list(&self) -> Result<Vec<StoredInstance>>;

    /// Loads and decodes a snapshot, failing if it is missing.
    async fn load_snapshot(&self, id: Uuid) -> Result<ExecutorSnapshot> {
        self.load(id)
            .await?
            .ok_or(StorageError::InstanceNotFound(id))?
            .snapshot()
    }

    /// Close the store.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Saves `snapshot` to `store` on `handle` and completes the persist with
/// the outcome. Meant to be called from
/// [`WorkflowHost::on_begin_persist`](crate::executor::WorkflowHost::on_begin_persist).
pub fn persist_to_store(
    store: Arc<dyn InstanceStore>,
    handle: &Handle,
    snapshot: ExecutorSnapshot,
    completion: PersistCompletion,
) {
    let instance_id = snapshot.instance_id();
    let stored = match StoredInstance::from_snapshot(&snapshot) {
        Ok(stored) => stored,
        Err(e) => {
            error!(error = %e, %instance_id, "failed to encode snapshot");
            completion.complete(Err(WorkflowFault::callback(e.to_string(), None)));
            return;
        }
    };
    handle.spawn(async move {
        let result = match store.save(stored).await {
            Ok(version) => {
                debug!(%instance_id, version, "snapshot stored");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, %instance_id, "failed to store snapshot");
                Err(WorkflowFault::callback(e.to_string(), None))
            }
        };
        completion.complete(result);
    });
}
