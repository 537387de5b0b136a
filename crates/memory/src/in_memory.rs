//! In-memory backend: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use toolweave_core::error::MemoryError;
use toolweave_core::memory::{MemoryBackend, MemoryLayer, MemoryRecord, StoredMemory};

/// A backend that keeps records in process memory, keyed by layer and id.
/// Nothing survives a restart.
pub struct InMemoryBackend {
    records: Arc<RwLock<HashMap<(MemoryLayer, String), MemoryRecord>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of persisted records across all layers.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn load(&self) -> Result<StoredMemory, MemoryError> {
        let records = self.records.read().await;
        let mut stored = StoredMemory::default();
        for record in records.values() {
            match record {
                MemoryRecord::Episode(e) => stored.episodes.push(e.clone()),
                MemoryRecord::Rule(r) => stored.rules.push(r.clone()),
                MemoryRecord::Strategy(s) => stored.strategies.push(s.clone()),
            }
        }
        stored.episodes.sort_by_key(|e| e.timestamp);
        stored.rules.sort_by_key(|r| r.created_at);
        stored.strategies.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stored)
    }

    async fn persist(&self, record: &MemoryRecord) -> Result<(), MemoryError> {
        self.records
            .write()
            .await
            .insert((record.layer(), record.id().to_string()), record.clone());
        Ok(())
    }

    async fn remove(&self, layer: MemoryLayer, id: &str) -> Result<bool, MemoryError> {
        Ok(self
            .records
            .write()
            .await
            .remove(&(layer, id.to_string()))
            .is_some())
    }
}
