use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::controller::status::ExecutionStatus;
use crate::error::{Result, SlicerError};
use crate::scheduler::{Slice, SliceState};
use crate::store::{
    ExecutionMetadata, ExecutionRecord, ExecutionStore, ExecutionUpdate, SliceRecord, StateStore,
};

/// Everything a store holds, in a serializable shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
    pub executions: HashMap<String, ExecutionRecord>,
    /// ex_id -> slice_id -> record
    pub slices: HashMap<String, HashMap<String, SliceRecord>>,
    #[serde(default)]
    pub status_history: HashMap<String, Vec<ExecutionStatus>>,
    /// ex_id -> number of `create_state` calls
    #[serde(skip)]
    pub creates: HashMap<String, usize>,
}

/// In-memory state and execution store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<StoreData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: StoreData) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    pub async fn snapshot(&self) -> StoreData {
        self.data.read().await.clone()
    }

    /// Every status the execution has been moved to, oldest first.
    pub async fn status_history(&self, ex_id: &str) -> Vec<ExecutionStatus> {
        self.data
            .read()
            .await
            .status_history
            .get(ex_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn create_calls(&self, ex_id: &str) -> usize {
        self.data
            .read()
            .await
            .creates
            .get(ex_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn slices(&self, ex_id: &str) -> Vec<SliceRecord> {
        let data = self.data.read().await;
        let mut records: Vec<SliceRecord> = data
            .slices
            .get(ex_id)
            .map(|slices| slices.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by_key(|r| (r.slicer_id, r.slicer_order));
        records
    }

    /// Insert a slice record directly, e.g. to seed a crashed execution.
    pub async fn insert_slice(&self, record: SliceRecord) {
        self.data
            .write()
            .await
            .slices
            .entry(record.ex_id.clone())
            .or_default()
            .insert(record.slice_id.clone(), record);
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create_state(&self, ex_id: &str, slice: &Slice, state: SliceState) -> Result<()> {
        let mut data = self.data.write().await;
        *data.creates.entry(ex_id.to_string()).or_default() += 1;
        data.slices
            .entry(ex_id.to_string())
            .or_default()
            .insert(slice.slice_id.clone(), SliceRecord::new(ex_id, slice, state));
        Ok(())
    }

    async fn update_state(
        &self,
        ex_id: &str,
        slice_id: &str,
        state: SliceState,
        error: Option<String>,
    ) -> Result<()> {
        let mut data = self.data.write().await;
        let record = data
            .slices
            .get_mut(ex_id)
            .and_then(|slices| slices.get_mut(slice_id))
            .ok_or_else(|| {
                SlicerError::Store(format!("slice {} not found for execution {}", slice_id, ex_id))
            })?;
        record.state = state;
        record.error = error;
        record.updated = Utc::now();
        Ok(())
    }

    async fn get_state(&self, ex_id: &str, slice_id: &str) -> Result<Option<SliceRecord>> {
        Ok(self
            .data
            .read()
            .await
            .slices
            .get(ex_id)
            .and_then(|slices| slices.get(slice_id))
            .cloned())
    }

    async fn count(&self, ex_id: &str, state: SliceState) -> Result<usize> {
        Ok(self
            .data
            .read()
            .await
            .slices
            .get(ex_id)
            .map(|slices| slices.values().filter(|r| r.state == state).count())
            .unwrap_or(0))
    }

    async fn query(
        &self,
        ex_id: &str,
        slicer_id: usize,
        states: &[SliceState],
        from: usize,
        size: usize,
    ) -> Result<Vec<SliceRecord>> {
        let data = self.data.read().await;
        let mut records: Vec<&SliceRecord> = data
            .slices
            .get(ex_id)
            .map(|slices| {
                slices
                    .values()
                    .filter(|r| r.slicer_id == slicer_id && states.contains(&r.state))
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by_key(|r| r.slicer_order);
        Ok(records.into_iter().skip(from).take(size).cloned().collect())
    }

    async fn last_slice(&self, ex_id: &str, slicer_id: usize) -> Result<Option<SliceRecord>> {
        Ok(self
            .data
            .read()
            .await
            .slices
            .get(ex_id)
            .and_then(|slices| {
                slices
                    .values()
                    .filter(|r| r.slicer_id == slicer_id)
                    .max_by_key(|r| r.slicer_order)
            })
            .cloned())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create(&self, record: ExecutionRecord) -> Result<()> {
        let mut data = self.data.write().await;
        if data.executions.contains_key(&record.ex_id) {
            return Err(SlicerError::Store(format!(
                "execution {} already exists",
                record.ex_id
            )));
        }
        data.status_history
            .entry(record.ex_id.clone())
            .or_default()
            .push(record.status);
        data.executions.insert(record.ex_id.clone(), record);
        Ok(())
    }

    async fn get(&self, ex_id: &str) -> Result<ExecutionRecord> {
        self.data
            .read()
            .await
            .executions
            .get(ex_id)
            .cloned()
            .ok_or_else(|| SlicerError::ExecutionNotFound(ex_id.to_string()))
    }

    async fn set_status(
        &self,
        ex_id: &str,
        status: ExecutionStatus,
        metadata: Option<ExecutionMetadata>,
    ) -> Result<()> {
        let mut data = self.data.write().await;
        let record = data
            .executions
            .get_mut(ex_id)
            .ok_or_else(|| SlicerError::ExecutionNotFound(ex_id.to_string()))?;
        if !record.status.can_transition_to(status) {
            return Err(SlicerError::InvalidTransition {
                ex_id: ex_id.to_string(),
                from: record.status,
                to: status,
            });
        }
        record.status = status;
        if let Some(metadata) = metadata {
            record.metadata = metadata;
        }
        record.updated = Utc::now();
        data.status_history
            .entry(ex_id.to_string())
            .or_default()
            .push(status);
        Ok(())
    }

    async fn update(&self, ex_id: &str, update: ExecutionUpdate) -> Result<()> {
        let mut data = self.data.write().await;
        let record = data
            .executions
            .get_mut(ex_id)
            .ok_or_else(|| SlicerError::ExecutionNotFound(ex_id.to_string()))?;
        if let Some(metadata) = update.metadata {
            record.metadata = metadata;
        }
        if let Some(operations) = update.operations {
            record.operations = operations;
        }
        if let Some(finished) = update.slicers_finished {
            record.slicers_finished = finished;
        }
        record.updated = Utc::now();
        Ok(())
    }
}
