use thiserror::Error;

use crate::controller::status::ExecutionStatus;

#[derive(Error, Debug)]
pub enum SlicerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Client {0} is not connected")]
    NotConnected(String),

    #[error("Timed out after {timeout_ms}ms waiting for response to {message}")]
    Timeout { message: String, timeout_ms: u64 },

    #[error("Remote error in response to {message}: {error}")]
    Remote { message: String, error: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Messenger is closed")]
    Closed,

    #[error("Unable to connect to {addr}, caused by: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution {ex_id} cannot move from {from} to {to}")]
    InvalidTransition {
        ex_id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Slicer error: {0}")]
    Slicer(String),

    #[error("Failed to shutdown correctly: {}", .0.join(", and "))]
    Shutdown(Vec<String>),
}

pub type Result<T> = std::result::Result<T, SlicerError>;
