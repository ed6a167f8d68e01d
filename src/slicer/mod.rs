//! Slicers turn a job description into a stream of slice requests.
//!
//! A [`Slicer`] builds one [`SlicerFn`] per parallel slicer. The scheduler
//! polls each function until it reports [`SliceOutput::Done`].

pub mod builtin;

pub use builtin::{GeneratorSlicer, ListSlicer};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Lifecycle;
use crate::controller::analytics::ExecutionStats;
use crate::controller::ControllerEvent;
use crate::error::Result;
use crate::events::EventHub;
use crate::scheduler::{Slice, SliceCompletion};

pub const DEFAULT_QUEUE_LENGTH: usize = 10_000;

/// One poll of a slicer function.
#[derive(Debug, Clone, PartialEq)]
pub enum SliceOutput {
    /// A new slice request
    Slice(Value),
    /// A slice carried over from a previous execution, keeping its id
    Recovered(Slice),
    /// Nothing right now, poll again later
    Empty,
    /// This slicer is exhausted
    Done,
}

#[async_trait]
pub trait SlicerFn: Send {
    async fn next_slice(&mut self) -> Result<SliceOutput>;
}

/// Adapter for closure-based slicer functions.
pub struct FnSlicer<F> {
    f: F,
}

impl<F> FnSlicer<F>
where
    F: FnMut() -> Result<SliceOutput> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> SlicerFn for FnSlicer<F>
where
    F: FnMut() -> Result<SliceOutput> + Send,
{
    async fn next_slice(&mut self) -> Result<SliceOutput> {
        (self.f)()
    }
}

/// Box a closure as a slicer function.
pub fn from_fn<F>(f: F) -> Box<dyn SlicerFn>
where
    F: FnMut() -> Result<SliceOutput> + Send + 'static,
{
    Box::new(FnSlicer::new(f))
}

/// Where a slicer left off in the execution being recovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartingPoint {
    pub slicer_id: usize,
    /// Request of the last slice this slicer produced
    pub request: Value,
}

/// Upper bound on queued slices a slicer asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLength {
    Fixed(usize),
    /// Track the number of connected workers, starting at the requested count
    WorkerMinimum,
}

/// What a slicer gets to know about the execution it slices for.
#[derive(Clone)]
pub struct SlicerContext {
    pub ex_id: String,
    pub job_id: String,
    pub lifecycle: Lifecycle,
    pub slicers: usize,
    pub workers: usize,
    pub operations: Vec<Value>,
    pub recovered: bool,
    /// Lets a slicer publish operation updates
    pub events: EventHub<ControllerEvent>,
}

impl SlicerContext {
    pub fn is_once(&self) -> bool {
        self.lifecycle == Lifecycle::Once
    }
}

/// Optional notifications a slicer opts into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlicerCapabilities {
    pub on_slice_enqueued: bool,
    pub on_slice_dispatch: bool,
    pub on_slice_complete: bool,
    pub on_execution_stats: bool,
}

#[async_trait]
pub trait Slicer: Send + Sync {
    /// Build one function per parallel slicer, resuming from `starting_points`
    /// when recovering.
    async fn new_slicer(
        &self,
        ctx: &SlicerContext,
        starting_points: &[StartingPoint],
    ) -> Result<Vec<Box<dyn SlicerFn>>>;

    fn queue_length(&self, _ctx: &SlicerContext) -> QueueLength {
        QueueLength::Fixed(DEFAULT_QUEUE_LENGTH)
    }

    fn capabilities(&self) -> SlicerCapabilities {
        SlicerCapabilities::default()
    }

    async fn on_slice_enqueued(&self, _slice: &Slice) {}

    async fn on_slice_dispatch(&self, _slice: &Slice, _worker_id: &str) {}

    async fn on_slice_complete(&self, _completion: &SliceCompletion) {}

    async fn on_execution_stats(&self, _stats: &ExecutionStats) {}
}

/// A slicer plus the notifications it opted into, resolved once.
#[derive(Clone)]
pub struct SlicerHooks {
    slicer: Arc<dyn Slicer>,
    capabilities: SlicerCapabilities,
}

impl SlicerHooks {
    pub fn new(slicer: Arc<dyn Slicer>) -> Self {
        let capabilities = slicer.capabilities();
        Self {
            slicer,
            capabilities,
        }
    }

    pub fn slicer(&self) -> &Arc<dyn Slicer> {
        &self.slicer
    }

    pub fn capabilities(&self) -> SlicerCapabilities {
        self.capabilities
    }

    pub async fn slice_enqueued(&self, slice: &Slice) {
        if self.capabilities.on_slice_enqueued {
            self.slicer.on_slice_enqueued(slice).await;
        }
    }

    pub async fn slice_dispatch(&self, slice: &Slice, worker_id: &str) {
        if self.capabilities.on_slice_dispatch {
            self.slicer.on_slice_dispatch(slice, worker_id).await;
        }
    }

    pub async fn slice_complete(&self, completion: &SliceCompletion) {
        if self.capabilities.on_slice_complete {
            self.slicer.on_slice_complete(completion).await;
        }
    }

    pub async fn execution_stats(&self, stats: &ExecutionStats) {
        if self.capabilities.on_execution_stats {
            self.slicer.on_execution_stats(stats).await;
        }
    }
}
