use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::messaging::client::{ClientOptions, MessengerClient};
use crate::messaging::protocol::{names, DispatchResponse, SliceRecorded};
use crate::scheduler::{Slice, SliceCompletion};

/// Worker side of the slice protocol.
pub struct WorkerMessenger {
    client: MessengerClient,
    worker_id: String,
    slice_complete_retries: u32,
    available: Arc<AtomicBool>,
    slice_tx: mpsc::UnboundedSender<Slice>,
    slices: tokio::sync::Mutex<mpsc::UnboundedReceiver<Slice>>,
    finished: CancellationToken,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerMessenger {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        config.validate()?;
        let client = MessengerClient::new(ClientOptions::from_worker(config))?;
        let (slice_tx, slices) = mpsc::unbounded_channel();
        Ok(Self {
            client,
            worker_id: config.worker_id.clone(),
            slice_complete_retries: config.slice_complete_retries,
            available: Arc::new(AtomicBool::new(false)),
            slice_tx,
            slices: tokio::sync::Mutex::new(slices),
            finished: CancellationToken::new(),
            reconnect_task: Mutex::new(None),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn client(&self) -> &MessengerClient {
        &self.client
    }

    /// Register handlers and connect to the controller.
    pub async fn start(&self) -> Result<()> {
        let available = self.available.clone();
        let slice_tx = self.slice_tx.clone();
        self.client.on_request(names::SLICE_NEW, move |_, msg| {
            let will_process = match serde_json::from_value::<Slice>(msg.payload.clone()) {
                Ok(slice) => {
                    available
                        .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                        && slice_tx.send(slice).is_ok()
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Received malformed slice");
                    false
                }
            };
            serde_json::to_value(DispatchResponse { will_process }).ok()
        });

        let finished = self.finished.clone();
        self.client
            .on_request(names::EXECUTION_FINISHED, move |_, msg| {
                tracing::info!(payload = %msg.payload, "Execution finished, stopping worker");
                finished.cancel();
                None
            });

        self.client.connect().await?;

        // re-announce availability after a reconnect
        let mut reconnects = self.client.reconnects();
        let client = self.client.clone();
        let available = self.available.clone();
        let finished = self.finished.clone();
        let worker_id = self.worker_id.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = reconnects.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if available.load(Ordering::SeqCst) {
                            if let Err(e) = client.send(names::WORKER_READY, json!({ "worker_id": worker_id })) {
                                tracing::warn!(error = %e, "Failed to re-announce availability");
                            }
                        }
                    }
                    _ = finished.cancelled() => break,
                }
            }
        });
        *self
            .reconnect_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    /// Tell the controller this worker can take a slice.
    pub fn ready(&self) -> Result<()> {
        self.client
            .send(names::WORKER_READY, json!({ "worker_id": self.worker_id }))
    }

    /// Announce availability and wait for the next slice.
    ///
    /// Returns None once the execution finished or `cancel` fired.
    pub async fn wait_for_slice(&self, cancel: &CancellationToken) -> Option<Slice> {
        let mut slices = self.slices.lock().await;
        if let Ok(slice) = slices.try_recv() {
            return Some(slice);
        }

        self.available.store(true, Ordering::SeqCst);
        if let Err(e) = self.ready() {
            tracing::warn!(error = %e, "Failed to send ready, waiting for reconnect");
        }

        let slice = tokio::select! {
            slice = slices.recv() => slice,
            _ = self.finished.cancelled() => None,
            _ = cancel.cancelled() => None,
        };
        if slice.is_some() {
            return slice;
        }

        self.available.store(false, Ordering::SeqCst);
        // accepted just before we stopped waiting
        slices.try_recv().ok()
    }

    /// Report a processed slice, retrying across reconnects.
    pub async fn slice_complete(&self, completion: &SliceCompletion) -> Result<SliceRecorded> {
        let payload = serde_json::to_value(completion)?;
        let response = self
            .client
            .send_with_response(names::SLICE_COMPLETE, payload, self.slice_complete_retries)
            .await?;
        Ok(serde_json::from_value(response.payload)?)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    pub fn finished(&self) -> CancellationToken {
        self.finished.clone()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.available.store(false, Ordering::SeqCst);
        let task = self
            .reconnect_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.client.shutdown().await
    }
}
