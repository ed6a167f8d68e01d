use std::collections::VecDeque;

use crate::scheduler::slice::Slice;

const DEFAULT_MAX_QUEUE_LENGTH: usize = 10_000;

/// Ready queue of slices waiting for a worker.
///
/// New slices go to the back; requeued slices go to the front so a retry is
/// dispatched before anything produced after it.
#[derive(Debug)]
pub struct SliceQueue {
    slices: VecDeque<Slice>,
    max_length: usize,
}

impl Default for SliceQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SliceQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_QUEUE_LENGTH)
    }

    pub fn with_capacity(max_length: usize) -> Self {
        Self {
            slices: VecDeque::new(),
            max_length: max_length.max(1),
        }
    }

    pub fn push_back(&mut self, slice: Slice) {
        self.slices.push_back(slice);
    }

    pub fn push_front(&mut self, slice: Slice) {
        self.slices.push_front(slice);
    }

    pub fn pop_front(&mut self) -> Option<Slice> {
        self.slices.pop_front()
    }

    /// Remove up to `count` slices from the front.
    pub fn take(&mut self, count: usize) -> Vec<Slice> {
        let count = count.min(self.slices.len());
        self.slices.drain(..count).collect()
    }

    /// Drop every queued slice, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.slices.len();
        self.slices.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Returns true once production should wait for consumption.
    /// Requeued slices may push the length past this point.
    pub fn is_full(&self) -> bool {
        self.slices.len() >= self.max_length
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn set_max_length(&mut self, max_length: usize) {
        self.max_length = max_length.max(1);
    }
}
