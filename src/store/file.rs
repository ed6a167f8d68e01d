use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::controller::status::ExecutionStatus;
use crate::error::{Result, SlicerError};
use crate::scheduler::{Slice, SliceState};
use crate::store::memory::{MemoryStore, StoreData};
use crate::store::{
    ExecutionMetadata, ExecutionRecord, ExecutionStore, ExecutionUpdate, SliceRecord, StateStore,
};

/// Store that keeps everything in memory and rewrites a JSON snapshot after
/// every mutation. Writes go to a temporary file that is renamed into place.
#[derive(Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    memory: MemoryStore,
    write_lock: std::sync::Arc<Mutex<()>>,
}

impl JsonFileStore {
    /// Open the store at `path`, loading an existing snapshot if there is one.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<StoreData>(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), executions = data.executions.len(), "Opened store");
        Ok(Self {
            path,
            memory: MemoryStore::from_data(data),
            write_lock: std::sync::Arc::new(Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// In-memory view of the store.
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.memory.snapshot().await;
        let body = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            SlicerError::Store(format!(
                "failed to replace {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn create_state(&self, ex_id: &str, slice: &Slice, state: SliceState) -> Result<()> {
        self.memory.create_state(ex_id, slice, state).await?;
        self.persist().await
    }

    async fn update_state(
        &self,
        ex_id: &str,
        slice_id: &str,
        state: SliceState,
        error: Option<String>,
    ) -> Result<()> {
        self.memory
            .update_state(ex_id, slice_id, state, error)
            .await?;
        self.persist().await
    }

    async fn get_state(&self, ex_id: &str, slice_id: &str) -> Result<Option<SliceRecord>> {
        self.memory.get_state(ex_id, slice_id).await
    }

    async fn count(&self, ex_id: &str, state: SliceState) -> Result<usize> {
        StateStore::count(&self.memory, ex_id, state).await
    }

    async fn query(
        &self,
        ex_id: &str,
        slicer_id: usize,
        states: &[SliceState],
        from: usize,
        size: usize,
    ) -> Result<Vec<SliceRecord>> {
        self.memory
            .query(ex_id, slicer_id, states, from, size)
            .await
    }

    async fn last_slice(&self, ex_id: &str, slicer_id: usize) -> Result<Option<SliceRecord>> {
        self.memory.last_slice(ex_id, slicer_id).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.persist().await
    }
}

#[async_trait]
impl ExecutionStore for JsonFileStore {
    async fn create(&self, record: ExecutionRecord) -> Result<()> {
        self.memory.create(record).await?;
        self.persist().await
    }

    async fn get(&self, ex_id: &str) -> Result<ExecutionRecord> {
        self.memory.get(ex_id).await
    }

    async fn set_status(
        &self,
        ex_id: &str,
        status: ExecutionStatus,
        metadata: Option<ExecutionMetadata>,
    ) -> Result<()> {
        self.memory.set_status(ex_id, status, metadata).await?;
        self.persist().await
    }

    async fn update(&self, ex_id: &str, update: ExecutionUpdate) -> Result<()> {
        self.memory.update(ex_id, update).await?;
        self.persist().await
    }

    async fn shutdown(&self) -> Result<()> {
        self.persist().await
    }
}
