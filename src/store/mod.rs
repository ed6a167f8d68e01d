//! Persistence for slice state and execution records.

pub mod file;
pub mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::controller::analytics::ExecutionStats;
use crate::controller::status::ExecutionStatus;
use crate::error::Result;
use crate::scheduler::{Slice, SliceState};

/// Persisted record of one slice of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceRecord {
    pub ex_id: String,
    pub slice_id: String,
    pub job_id: String,
    pub slicer_id: usize,
    pub slicer_order: u64,
    pub request: Value,
    pub state: SliceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl SliceRecord {
    pub fn new(ex_id: &str, slice: &Slice, state: SliceState) -> Self {
        let now = Utc::now();
        Self {
            ex_id: ex_id.to_string(),
            slice_id: slice.slice_id.clone(),
            job_id: slice.job_id.clone(),
            slicer_id: slice.slicer_id,
            slicer_order: slice.slicer_order,
            request: slice.request.clone(),
            state,
            error: None,
            created: slice.created.unwrap_or(now),
            updated: now,
        }
    }

    /// Rebuild the slice this record was written for, without the persisted marker.
    pub fn to_slice(&self) -> Slice {
        Slice {
            slice_id: self.slice_id.clone(),
            ex_id: self.ex_id.clone(),
            job_id: self.job_id.clone(),
            slicer_id: self.slicer_id,
            slicer_order: self.slicer_order,
            request: self.request.clone(),
            created: None,
        }
    }
}

/// Status metadata written alongside an execution status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub stats: ExecutionStats,
    pub has_errors: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl ExecutionMetadata {
    pub fn new(stats: ExecutionStats, error: Option<String>) -> Self {
        Self {
            stats,
            has_errors: error.is_some(),
            failure_reason: error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub ex_id: String,
    pub job_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
    #[serde(default)]
    pub operations: Vec<Value>,
    /// Set once every slicer ran out of work
    #[serde(default)]
    pub slicers_finished: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(ex_id: impl Into<String>, job_id: impl Into<String>, status: ExecutionStatus) -> Self {
        let now = Utc::now();
        Self {
            ex_id: ex_id.into(),
            job_id: job_id.into(),
            status,
            metadata: ExecutionMetadata::default(),
            operations: Vec::new(),
            slicers_finished: false,
            created: now,
            updated: now,
        }
    }
}

/// Partial update of an execution record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionUpdate {
    pub metadata: Option<ExecutionMetadata>,
    pub operations: Option<Vec<Value>>,
    pub slicers_finished: Option<bool>,
}

impl ExecutionUpdate {
    pub fn metadata(metadata: ExecutionMetadata) -> Self {
        Self {
            metadata: Some(metadata),
            ..Default::default()
        }
    }

    pub fn operations(operations: Vec<Value>) -> Self {
        Self {
            operations: Some(operations),
            ..Default::default()
        }
    }

    pub fn slicers_finished() -> Self {
        Self {
            slicers_finished: Some(true),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Write the initial record for a slice.
    async fn create_state(&self, ex_id: &str, slice: &Slice, state: SliceState) -> Result<()>;

    async fn update_state(
        &self,
        ex_id: &str,
        slice_id: &str,
        state: SliceState,
        error: Option<String>,
    ) -> Result<()>;

    async fn get_state(&self, ex_id: &str, slice_id: &str) -> Result<Option<SliceRecord>>;

    async fn count(&self, ex_id: &str, state: SliceState) -> Result<usize>;

    /// Page through one slicer's records in `states`, ordered by slicer order.
    async fn query(
        &self,
        ex_id: &str,
        slicer_id: usize,
        states: &[SliceState],
        from: usize,
        size: usize,
    ) -> Result<Vec<SliceRecord>>;

    /// Record with the highest slicer order for one slicer.
    async fn last_slice(&self, ex_id: &str, slicer_id: usize) -> Result<Option<SliceRecord>>;

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create(&self, record: ExecutionRecord) -> Result<()>;

    async fn get(&self, ex_id: &str) -> Result<ExecutionRecord>;

    async fn get_status(&self, ex_id: &str) -> Result<ExecutionStatus> {
        Ok(self.get(ex_id).await?.status)
    }

    /// Move the execution to `status`. Leaving a terminal status is rejected.
    async fn set_status(
        &self,
        ex_id: &str,
        status: ExecutionStatus,
        metadata: Option<ExecutionMetadata>,
    ) -> Result<()>;

    async fn update(&self, ex_id: &str, update: ExecutionUpdate) -> Result<()>;

    /// Metadata to persist alongside a status change.
    fn execution_metadata(&self, stats: ExecutionStats, error: Option<String>) -> ExecutionMetadata {
        ExecutionMetadata::new(stats, error)
    }

    fn terminal_statuses(&self) -> &'static [ExecutionStatus] {
        &ExecutionStatus::TERMINAL
    }

    fn running_statuses(&self) -> &'static [ExecutionStatus] {
        &ExecutionStatus::RUNNING
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
