use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by pool construction, submission, and lifecycle calls.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  #[error("a task is required for submission")]
  InvalidTask,

  #[error("pool is closed and cannot accept new work")]
  Closed,

  #[error("pool was closed before it was started")]
  ClosedBeforeStart,

  #[error("pool has already been started")]
  AlreadyStarted,

  #[error("pool is in the wrong state for this operation: {0}")]
  BadState(String),

  #[error("operation was cancelled")]
  Cancelled,

  #[error("deadline exceeded")]
  DeadlineExceeded,
}

/// Errors produced by executing a single task.
///
/// A task run that returns `Err` marks the task as errored; the pool never
/// retries. Timeout and cancellation outcomes imposed by the pool are
/// recorded with the same type so a managed task carries one last-error slot.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
  /// The task's own execution failed.
  #[error("execution failed: {error}")]
  Failed { error: String },

  /// The long-tier deadline expired before the task completed.
  #[error("timed out after {timeout:?}")]
  Timeout { timeout: Duration },

  /// The task was cancelled, typically by `shutdown_now`.
  #[error("task was cancelled")]
  Cancelled,

  /// The task body panicked; the panic was caught by the worker.
  #[error("task panicked during execution")]
  Panicked,
}

impl TaskError {
  /// Creates a `Failed` error from any displayable cause.
  pub fn failed(error: impl std::fmt::Display) -> Self {
    TaskError::Failed {
      error: error.to_string(),
    }
  }

  /// Short stable label for logs and metrics.
  pub fn as_label(&self) -> &'static str {
    match self {
      TaskError::Failed { .. } => "task_failed",
      TaskError::Timeout { .. } => "task_timeout",
      TaskError::Cancelled => "task_cancelled",
      TaskError::Panicked => "task_panicked",
    }
  }
}
