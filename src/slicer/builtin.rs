use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::Lifecycle;
use crate::error::{Result, SlicerError};
use crate::slicer::{
    QueueLength, SliceOutput, Slicer, SlicerContext, SlicerFn, StartingPoint, DEFAULT_QUEUE_LENGTH,
};

/// Generates `{offset, count}` requests covering `size` records.
///
/// In once mode the range is split evenly across the slicers and each one
/// walks its part `chunk` records at a time. In persistent mode every
/// request asks for `size` records and the slicer never finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSlicer {
    pub size: u64,
    pub chunk: u64,
    /// Queue length; 0 tracks the connected worker count
    pub queue_length: usize,
}

impl Default for GeneratorSlicer {
    fn default() -> Self {
        Self {
            size: 10_000,
            chunk: 1_000,
            queue_length: DEFAULT_QUEUE_LENGTH,
        }
    }
}

impl GeneratorSlicer {
    pub fn new(size: u64, chunk: u64) -> Self {
        Self {
            size,
            chunk,
            ..Default::default()
        }
    }

    /// Read the generator settings from a reader operation.
    pub fn from_operation(operation: &Value) -> Result<Self> {
        let slicer: Self = serde_json::from_value(operation.clone())?;
        if slicer.chunk == 0 {
            return Err(SlicerError::InvalidConfig(
                "generator chunk must be greater than 0".into(),
            ));
        }
        Ok(slicer)
    }

    fn range_for(&self, slicer_id: usize, slicers: usize) -> (u64, u64) {
        let slicers = slicers.max(1) as u64;
        let part = self.size / slicers;
        let start = part * slicer_id as u64;
        let end = if slicer_id as u64 == slicers - 1 {
            self.size
        } else {
            start + part
        };
        (start, end)
    }
}

struct GeneratorFn {
    next: u64,
    end: u64,
    chunk: u64,
}

#[async_trait]
impl SlicerFn for GeneratorFn {
    async fn next_slice(&mut self) -> Result<SliceOutput> {
        if self.next >= self.end {
            return Ok(SliceOutput::Done);
        }
        let count = self.chunk.min(self.end - self.next);
        let request = json!({ "offset": self.next, "count": count });
        self.next += count;
        Ok(SliceOutput::Slice(request))
    }
}

struct PersistentGeneratorFn {
    size: u64,
}

#[async_trait]
impl SlicerFn for PersistentGeneratorFn {
    async fn next_slice(&mut self) -> Result<SliceOutput> {
        Ok(SliceOutput::Slice(json!({ "count": self.size })))
    }
}

#[async_trait]
impl Slicer for GeneratorSlicer {
    async fn new_slicer(
        &self,
        ctx: &SlicerContext,
        starting_points: &[StartingPoint],
    ) -> Result<Vec<Box<dyn SlicerFn>>> {
        let mut fns: Vec<Box<dyn SlicerFn>> = Vec::with_capacity(ctx.slicers);
        for slicer_id in 0..ctx.slicers {
            if ctx.lifecycle == Lifecycle::Persistent {
                fns.push(Box::new(PersistentGeneratorFn { size: self.size }));
                continue;
            }

            let (start, end) = self.range_for(slicer_id, ctx.slicers);
            let resume = starting_points
                .iter()
                .find(|p| p.slicer_id == slicer_id)
                .and_then(|p| {
                    let offset = p.request.get("offset")?.as_u64()?;
                    let count = p.request.get("count")?.as_u64()?;
                    Some(offset + count)
                });
            fns.push(Box::new(GeneratorFn {
                next: resume.unwrap_or(start).max(start),
                end,
                chunk: self.chunk.max(1),
            }));
        }
        Ok(fns)
    }

    fn queue_length(&self, _ctx: &SlicerContext) -> QueueLength {
        if self.queue_length == 0 {
            QueueLength::WorkerMinimum
        } else {
            QueueLength::Fixed(self.queue_length)
        }
    }
}

/// Hands out a fixed list of requests, round-robin across slicers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListSlicer {
    requests: Vec<Value>,
}

impl ListSlicer {
    pub fn new(requests: Vec<Value>) -> Self {
        Self { requests }
    }
}

struct ListFn {
    requests: std::vec::IntoIter<Value>,
}

#[async_trait]
impl SlicerFn for ListFn {
    async fn next_slice(&mut self) -> Result<SliceOutput> {
        Ok(match self.requests.next() {
            Some(request) => SliceOutput::Slice(request),
            None => SliceOutput::Done,
        })
    }
}

#[async_trait]
impl Slicer for ListSlicer {
    async fn new_slicer(
        &self,
        ctx: &SlicerContext,
        starting_points: &[StartingPoint],
    ) -> Result<Vec<Box<dyn SlicerFn>>> {
        let slicers = ctx.slicers.max(1);
        let mut fns: Vec<Box<dyn SlicerFn>> = Vec::with_capacity(slicers);
        for slicer_id in 0..slicers {
            let mine: Vec<Value> = self
                .requests
                .iter()
                .enumerate()
                .filter(|(i, _)| i % slicers == slicer_id)
                .map(|(_, r)| r.clone())
                .collect();
            let skip = starting_points
                .iter()
                .find(|p| p.slicer_id == slicer_id)
                .and_then(|p| mine.iter().position(|r| *r == p.request))
                .map(|pos| pos + 1)
                .unwrap_or(0);
            fns.push(Box::new(ListFn {
                requests: mine.into_iter().skip(skip).collect::<Vec<_>>().into_iter(),
            }));
        }
        Ok(fns)
    }
}
