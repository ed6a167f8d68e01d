use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Persisted lifecycle state of a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceState {
    Start,
    Completed,
    Error,
}

impl std::fmt::Display for SliceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SliceState::Start => write!(f, "start"),
            SliceState::Completed => write!(f, "completed"),
            SliceState::Error => write!(f, "error"),
        }
    }
}

/// A unit of work produced by a slicer and processed by exactly one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    pub slice_id: String,
    pub ex_id: String,
    pub job_id: String,
    pub slicer_id: usize,
    /// Position of this slice in its slicer's output
    pub slicer_order: u64,
    pub request: Value,
    /// Set once the `start` state has been persisted
    #[serde(rename = "_created", default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl Slice {
    pub fn new(
        ex_id: impl Into<String>,
        job_id: impl Into<String>,
        slicer_id: usize,
        slicer_order: u64,
        request: Value,
    ) -> Self {
        Self {
            slice_id: Uuid::new_v4().to_string(),
            ex_id: ex_id.into(),
            job_id: job_id.into(),
            slicer_id,
            slicer_order,
            request,
            created: None,
        }
    }

    /// Worker this slice should stick to, if the slicer asked for one.
    pub fn requested_worker(&self) -> Option<&str> {
        self.request.get("request_worker").and_then(Value::as_str)
    }

    pub fn is_persisted(&self) -> bool {
        self.created.is_some()
    }
}

/// Per-slice timing reported by the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SliceAnalytics {
    pub time_ms: u64,
}

/// Completion report sent by a worker after processing a slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceCompletion {
    pub worker_id: String,
    pub slice: Slice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analytics: Option<SliceAnalytics>,
}

impl SliceCompletion {
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}
