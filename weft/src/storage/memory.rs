use super::{InstanceStore, Result, StoredInstance};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

/// In-memory snapshot store using DashMap for concurrent access.
///
/// Suitable for tests and single-process development. Nothing survives the
/// process.
#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    instances: DashMap<Uuid, StoredInstance>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn save(&self, mut instance: StoredInstance) -> Result<u64> {
        let mut entry = self
            .instances
            .entry(instance.instance_id)
            .or_insert_with(|| instance.clone());
        instance.version = entry.version + 1;
        instance.saved_at = Utc::now();
        let version = instance.version;
        *entry = instance;
        Ok(version)
    }

    async fn load(&self, id: Uuid) -> Result<Option<StoredInstance>> {
        Ok(self.instances.get(&id).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.instances.remove(&id).is_some())
    }

    async fn list(&self) -> Result<Vec<StoredInstance>> {
        let mut all: Vec<StoredInstance> = self
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by_key(|s| s.saved_at);
        Ok(all)
    }
}
