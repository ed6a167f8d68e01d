pub mod client;
pub mod execution_server;
pub mod heartbeat;
pub mod protocol;
pub mod requests;
pub mod server;
pub mod worker_messenger;

pub use client::{ClientOptions, MessengerClient};
pub use execution_server::ExecutionControllerServer;
pub use protocol::{ClientState, Message};
pub use server::{MessengerServer, ServerOptions};
pub use worker_messenger::WorkerMessenger;

use crate::scheduler::{Slice, SliceCompletion};

/// Events published by the controller-side messenger.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientOnline(String),
    ClientAvailable(String),
    ClientUnavailable(String),
    ClientDisconnect(String),
    ClientReconnect(String),
    ClientOffline(String),
    SliceSuccess(SliceCompletion),
    SliceFailure(SliceCompletion),
    /// Slices that were in flight on a worker that went offline
    SlicesOrphaned {
        worker_id: String,
        slices: Vec<Slice>,
    },
}
