// Handle Repository Port (Interface)

use crate::domain::{TaskRecord, TaskRecordState};
use crate::error::Result;
use async_trait::async_trait;

/// Persistence for task handle identities
#[async_trait]
pub trait HandleRepository: Send + Sync {
    /// Insert or replace the record for `record.task_name`
    async fn upsert(&self, record: &TaskRecord) -> Result<()>;

    /// Find record by task name
    async fn find_by_name(&self, task_name: &str) -> Result<Option<TaskRecord>>;

    /// Find all records in a state (for recovery)
    async fn find_by_state(&self, state: TaskRecordState) -> Result<Vec<TaskRecord>>;

    /// List every record, newest first
    async fn list(&self) -> Result<Vec<TaskRecord>>;

    /// Delete a record, returns whether it existed
    async fn delete(&self, task_name: &str) -> Result<bool>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryHandleRepository {
        records: Mutex<HashMap<String, TaskRecord>>,
    }

    impl InMemoryHandleRepository {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl HandleRepository for InMemoryHandleRepository {
        async fn upsert(&self, record: &TaskRecord) -> Result<()> {
            self.records
                .lock()
                .unwrap()
                .insert(record.task_name.clone(), record.clone());
            Ok(())
        }

        async fn find_by_name(&self, task_name: &str) -> Result<Option<TaskRecord>> {
            Ok(self.records.lock().unwrap().get(task_name).cloned())
        }

        async fn find_by_state(&self, state: TaskRecordState) -> Result<Vec<TaskRecord>> {
            let mut records: Vec<TaskRecord> = self
                .records
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.state == state)
                .cloned()
                .collect();
            records.sort_by(|a, b| a.task_name.cmp(&b.task_name));
            Ok(records)
        }

        async fn list(&self) -> Result<Vec<TaskRecord>> {
            let mut records: Vec<TaskRecord> =
                self.records.lock().unwrap().values().cloned().collect();
            records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(records)
        }

        async fn delete(&self, task_name: &str) -> Result<bool> {
            Ok(self.records.lock().unwrap().remove(task_name).is_some())
        }
    }
}
