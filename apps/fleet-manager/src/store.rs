use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use panel_client::InstanceId;
use tokio::sync::Mutex;

/// Durable per-instance settings the engine reads back after a restart.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InstanceConfigRecord {
    pub instance_id: InstanceId,
    /// Last console timestamp delivered before the stream stopped.
    pub console_cursor_ms: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceConfigRecord {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            console_cursor_ms: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Store(String),
}

#[async_trait]
pub trait InstanceConfigStore: Send + Sync {
    async fn get_instance_config(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceConfigRecord>, StoreError>;

    async fn upsert_instance_config(&self, record: InstanceConfigRecord) -> Result<(), StoreError>;

    /// Stores `cursor_ms` without touching other fields. Never moves a stored
    /// cursor backwards.
    async fn save_console_cursor(
        &self,
        instance_id: &InstanceId,
        cursor_ms: i64,
    ) -> Result<(), StoreError> {
        let mut record = self
            .get_instance_config(instance_id)
            .await?
            .unwrap_or_else(|| InstanceConfigRecord::new(instance_id.clone()));
        record.console_cursor_ms = Some(
            record
                .console_cursor_ms
                .map_or(cursor_ms, |current| current.max(cursor_ms)),
        );
        record.updated_at = Utc::now();
        self.upsert_instance_config(record).await
    }
}

/// In-memory adapter for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryInstanceConfigStore {
    records: Mutex<HashMap<InstanceId, InstanceConfigRecord>>,
}

impl InMemoryInstanceConfigStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl InstanceConfigStore for InMemoryInstanceConfigStore {
    async fn get_instance_config(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceConfigRecord>, StoreError> {
        Ok(self.records.lock().await.get(instance_id).cloned())
    }

    async fn upsert_instance_config(&self, record: InstanceConfigRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .await
            .insert(record.instance_id.clone(), record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upserts_and_reads_back() {
        let store = InMemoryInstanceConfigStore::new();
        let id = InstanceId::new("a");
        assert!(store.get_instance_config(&id).await.unwrap().is_none());

        let mut record = InstanceConfigRecord::new(id.clone());
        record.console_cursor_ms = Some(10);
        store.upsert_instance_config(record).await.unwrap();
        let stored = store.get_instance_config(&id).await.unwrap().unwrap();
        assert_eq!(stored.console_cursor_ms, Some(10));
    }

    #[tokio::test]
    async fn saved_cursor_never_regresses() {
        let store = InMemoryInstanceConfigStore::new();
        let id = InstanceId::new("a");
        store.save_console_cursor(&id, 50).await.unwrap();
        store.save_console_cursor(&id, 20).await.unwrap();
        let stored = store.get_instance_config(&id).await.unwrap().unwrap();
        assert_eq!(stored.console_cursor_ms, Some(50));
    }
}
