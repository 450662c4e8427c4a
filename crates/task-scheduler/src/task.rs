//! Processing tasks and their lifecycle
//!
//! A task moves through
//! `Queued -> ResolvingEngine -> AwaitingResult -> {Succeeded | RetryingFallback} -> Done`,
//! where `RetryingFallback` loops back to `ResolvingEngine` for the next style
//! in the chain and `Failed` ends a task that could not produce an image. An
//! engine that is not registered moves a task straight from `ResolvingEngine`
//! to `RetryingFallback`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use common::error::{Error, Result};

/// Task identifier
pub type TaskId = Uuid;

/// One queued processing request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingTask {
    /// Unique identifier
    pub id: TaskId,
    /// Position in submission order, starting at 1
    pub sequence: u64,
    /// Style the caller asked for
    pub style_id: String,
    /// Submission time
    pub submitted_at: DateTime<Utc>,
}

impl ProcessingTask {
    pub fn new(sequence: u64, style_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            style_id: style_id.into(),
            submitted_at: Utc::now(),
        }
    }
}

impl fmt::Display for ProcessingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task #{} ({})", self.sequence, self.style_id)
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    ResolvingEngine,
    AwaitingResult,
    Succeeded,
    RetryingFallback,
    Failed,
    Done,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done)
    }

    /// Whether `next` may follow this state
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, ResolvingEngine)
                | (ResolvingEngine, AwaitingResult)
                | (ResolvingEngine, RetryingFallback)
                | (ResolvingEngine, Failed)
                | (AwaitingResult, Succeeded)
                | (AwaitingResult, RetryingFallback)
                | (AwaitingResult, Failed)
                | (RetryingFallback, ResolvingEngine)
                | (RetryingFallback, Failed)
                | (Succeeded, Done)
                | (Failed, Done)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Queued => "queued",
            TaskState::ResolvingEngine => "resolving_engine",
            TaskState::AwaitingResult => "awaiting_result",
            TaskState::Succeeded => "succeeded",
            TaskState::RetryingFallback => "retrying_fallback",
            TaskState::Failed => "failed",
            TaskState::Done => "done",
        };
        f.write_str(name)
    }
}

/// A task together with its current state and the states it passed through
#[derive(Debug, Clone)]
pub struct TaskProgress {
    task: ProcessingTask,
    state: TaskState,
    history: Vec<TaskState>,
}

impl TaskProgress {
    pub fn new(task: ProcessingTask) -> Self {
        Self {
            task,
            state: TaskState::Queued,
            history: vec![TaskState::Queued],
        }
    }

    pub fn task(&self) -> &ProcessingTask {
        &self.task
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn history(&self) -> &[TaskState] {
        &self.history
    }

    /// Moves to `next`, rejecting transitions the lifecycle does not allow
    pub fn advance(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "{}: invalid transition {} -> {}",
                self.task, self.state, next
            )));
        }
        trace!("{}: {} -> {}", self.task, self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Number of engine attempts made so far
    pub fn attempts(&self) -> usize {
        self.history
            .iter()
            .filter(|s| **s == TaskState::AwaitingResult)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_lifecycle() {
        let mut progress = TaskProgress::new(ProcessingTask::new(1, "ai_sketch"));
        for state in [
            TaskState::ResolvingEngine,
            TaskState::AwaitingResult,
            TaskState::RetryingFallback,
            TaskState::ResolvingEngine,
            TaskState::AwaitingResult,
            TaskState::Succeeded,
            TaskState::Done,
        ] {
            progress.advance(state).unwrap();
        }
        assert!(progress.state().is_terminal());
        assert_eq!(progress.attempts(), 2);
        assert_eq!(progress.history().len(), 8);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut progress = TaskProgress::new(ProcessingTask::new(7, "pencil"));
        assert!(matches!(progress.advance(TaskState::Succeeded), Err(Error::Internal(_))));
        assert_eq!(progress.state(), TaskState::Queued);

        progress.advance(TaskState::ResolvingEngine).unwrap();
        progress.advance(TaskState::Failed).unwrap();
        progress.advance(TaskState::Done).unwrap();
        assert!(progress.advance(TaskState::ResolvingEngine).is_err());
    }

    #[test]
    fn test_task_display() {
        let task = ProcessingTask::new(3, "charcoal");
        assert_eq!(task.to_string(), "task #3 (charcoal)");
        assert_ne!(task.id, ProcessingTask::new(3, "charcoal").id);
    }
}
