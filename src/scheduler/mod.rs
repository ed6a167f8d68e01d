pub mod engine;
pub mod queue;
pub mod slice;

pub use engine::Scheduler;
pub use queue::SliceQueue;
pub use slice::{Slice, SliceAnalytics, SliceCompletion, SliceState};
