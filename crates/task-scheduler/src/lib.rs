//! Task scheduling for the sketch orchestrator
//!
//! Processing requests run through a [`SingleFlightQueue`]: strict FIFO, one
//! task executing at a time. [`TaskProgress`] tracks each task through its
//! lifecycle states.

mod queue;
mod task;

pub use queue::SingleFlightQueue;
pub use task::{ProcessingTask, TaskId, TaskProgress, TaskState};
