use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::json;

use crate::config::ControllerConfig;
use crate::error::{Result, SlicerError};
use crate::events::{EventHub, ListenerHandle};
use crate::messaging::protocol::{names, ClientState, DispatchResponse, SliceRecorded};
use crate::messaging::server::{MessengerServer, ServerOptions};
use crate::messaging::ServerEvent;
use crate::scheduler::{Slice, SliceCompletion};

#[derive(Default)]
struct DispatchTable {
    /// Workers with a slice in flight
    active: HashSet<String>,
    /// slice_id -> (worker_id, slice) for every accepted dispatch
    in_flight: HashMap<String, (String, Slice)>,
}

impl DispatchTable {
    fn holds_slice(&self, worker_id: &str) -> bool {
        self.in_flight.values().any(|(owner, _)| owner == worker_id)
    }

    /// Forget `worker_id` and hand back the slices it was holding.
    fn take_worker(&mut self, worker_id: &str) -> Vec<Slice> {
        self.active.remove(worker_id);
        let orphaned: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (owner, _))| owner == worker_id)
            .map(|(slice_id, _)| slice_id.clone())
            .collect();
        orphaned
            .iter()
            .filter_map(|slice_id| self.in_flight.remove(slice_id))
            .map(|(_, slice)| slice)
            .collect()
    }
}

fn orphan(events: &EventHub<ServerEvent>, worker_id: String, slices: Vec<Slice>) {
    if slices.is_empty() {
        return;
    }
    tracing::warn!(
        worker_id = %worker_id,
        count = slices.len(),
        "Requeueing slices held by a worker that left"
    );
    events.emit(ServerEvent::SlicesOrphaned { worker_id, slices });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Controller-side messenger specialised for slice dispatch.
///
/// A worker receives at most one slice at a time: it is claimed from the
/// available queue before the slice is sent and only becomes available again
/// once it reports ready. A ready from a worker still holding a slice is
/// refused. A worker that declares itself unavailable gives up its slices.
#[derive(Clone)]
pub struct ExecutionControllerServer {
    messenger: MessengerServer,
    table: Arc<Mutex<DispatchTable>>,
    listener: Arc<Mutex<Option<ListenerHandle>>>,
}

impl ExecutionControllerServer {
    pub fn new(config: &ControllerConfig, ex_id: &str, events: EventHub<ServerEvent>) -> Result<Self> {
        if config.worker_disconnect_timeout_ms == 0 {
            return Err(SlicerError::InvalidConfig(
                "ExecutionControllerServer requires a valid worker_disconnect_timeout".into(),
            ));
        }
        let options = ServerOptions::from_controller(config, format!("execution_controller:{}", ex_id));
        Ok(Self {
            messenger: MessengerServer::new(options, events)?,
            table: Arc::new(Mutex::new(DispatchTable::default())),
            listener: Arc::new(Mutex::new(None)),
        })
    }

    pub async fn start(&self) -> Result<SocketAddr> {
        let table = self.table.clone();
        let events = self.messenger.events().clone();
        self.messenger.on_client_state_change(move |worker_id, state| match state {
            ClientState::Available => {
                let holding = lock(&table).holds_slice(worker_id);
                if holding {
                    tracing::warn!(worker_id = %worker_id, "Ignoring ready from worker with a slice in flight");
                }
                !holding
            }
            ClientState::Unavailable => {
                let slices = lock(&table).take_worker(worker_id);
                orphan(&events, worker_id.to_string(), slices);
                true
            }
            _ => true,
        });

        let table = self.table.clone();
        let events = self.messenger.events().clone();
        self.messenger
            .on_request(names::SLICE_COMPLETE, move |client_id, msg| {
                let completion: SliceCompletion = match serde_json::from_value(msg.payload.clone()) {
                    Ok(completion) => completion,
                    Err(e) => {
                        tracing::warn!(client_id = %client_id, error = %e, "Malformed slice completion");
                        return Some(json!({ "recorded": false }));
                    }
                };

                let slice_id = completion.slice.slice_id.clone();
                let in_flight = {
                    let mut table = lock(&table);
                    table.active.remove(client_id);
                    table.in_flight.remove(&slice_id).is_some()
                };

                if in_flight {
                    if completion.is_failure() {
                        events.emit(ServerEvent::SliceFailure(completion));
                    } else {
                        events.emit(ServerEvent::SliceSuccess(completion));
                    }
                } else {
                    tracing::debug!(slice_id = %slice_id, client_id = %client_id, "Ignoring completion for slice not in flight");
                }

                serde_json::to_value(SliceRecorded {
                    recorded: true,
                    slice_id,
                })
                .ok()
            });

        let table = self.table.clone();
        let events = self.messenger.events().clone();
        let handle = self.messenger.events().on(move |event| {
            let table = table.clone();
            let events = events.clone();
            async move {
                match event {
                    ServerEvent::ClientDisconnect(worker_id) => {
                        lock(&table).active.remove(&worker_id);
                    }
                    ServerEvent::ClientOffline(worker_id) => {
                        let slices = lock(&table).take_worker(&worker_id);
                        orphan(&events, worker_id, slices);
                    }
                    _ => {}
                }
            }
        });
        *lock(&self.listener) = Some(handle);

        self.messenger.listen().await
    }

    pub fn messenger(&self) -> &MessengerServer {
        &self.messenger
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.messenger.local_addr()
    }

    /// Put a connected worker back on the available queue. Idempotent.
    /// Refused while the worker still holds a slice.
    pub fn enqueue_available(&self, worker_id: &str) -> bool {
        if lock(&self.table).holds_slice(worker_id) {
            return false;
        }
        self.messenger
            .update_client_state(worker_id, ClientState::Available)
    }

    /// Take an available worker for `slice`, honouring a requested worker.
    pub fn dequeue_worker(&self, slice: &Slice) -> Option<String> {
        let worker_id = self.messenger.dequeue_available(slice.requested_worker())?;
        lock(&self.table).active.remove(&worker_id);
        Some(worker_id)
    }

    /// Offer `slice` to `worker_id`. Returns true if the worker accepted it.
    ///
    /// A worker that explicitly refuses stays unavailable until it reports
    /// ready again; one that cannot be reached goes back to the queue.
    pub async fn dispatch_slice(&self, slice: &Slice, worker_id: &str) -> bool {
        if !self.messenger.reserve_available(worker_id) {
            tracing::debug!(worker_id = %worker_id, "Worker is no longer available");
            return false;
        }

        {
            let mut table = lock(&self.table);
            table.active.insert(worker_id.to_string());
            table
                .in_flight
                .insert(slice.slice_id.clone(), (worker_id.to_string(), slice.clone()));
        }

        let payload = match serde_json::to_value(slice) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(slice_id = %slice.slice_id, error = %e, "Failed to encode slice");
                self.release(slice, worker_id, false);
                return false;
            }
        };

        let (dispatched, refused) = match self
            .messenger
            .send(worker_id, names::SLICE_NEW, payload)
            .await
        {
            Ok(response) => {
                let will_process = serde_json::from_value::<DispatchResponse>(response.payload)
                    .map(|r| r.will_process)
                    .unwrap_or(false);
                (will_process, !will_process)
            }
            Err(e) => {
                tracing::debug!(worker_id = %worker_id, slice_id = %slice.slice_id, error = %e, "Dispatch failed");
                (false, false)
            }
        };

        if dispatched {
            return true;
        }
        // a completion may have raced ahead of a lost response
        !self.release(slice, worker_id, refused)
    }

    /// Undo a reservation. Returns false if the slice already completed.
    fn release(&self, slice: &Slice, worker_id: &str, refused: bool) -> bool {
        {
            let mut table = lock(&self.table);
            if table.in_flight.remove(&slice.slice_id).is_none() {
                return false;
            }
            table.active.remove(worker_id);
        }
        if !refused {
            self.messenger.restore_available(worker_id);
        }
        true
    }

    pub fn worker_queue_size(&self) -> usize {
        self.messenger.available_queue_len()
    }

    pub fn active_worker_count(&self) -> usize {
        lock(&self.table).active.len()
    }

    pub fn active_workers(&self) -> Vec<String> {
        let mut workers: Vec<String> = lock(&self.table).active.iter().cloned().collect();
        workers.sort();
        workers
    }

    pub fn is_worker_active(&self, worker_id: &str) -> bool {
        lock(&self.table).active.contains(worker_id)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.table).in_flight.len()
    }

    /// Tell every connected worker the execution is over.
    pub fn send_execution_finished_to_all(&self, ex_id: &str) -> usize {
        self.messenger
            .send_to_all(names::EXECUTION_FINISHED, json!({ "ex_id": ex_id }))
    }

    pub fn set_shutting_down(&self, shutting_down: bool) {
        self.messenger.set_shutting_down(shutting_down);
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = lock(&self.listener).take() {
            handle.remove();
        }
        self.messenger.shutdown().await
    }
}
