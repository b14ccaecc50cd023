use crate::error::TaskError;
use crate::signal::CancelSignal;
use crate::task::TaskRef;

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifecycle state of a task inside the two-tier pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
  PendingNormal,
  RunningNormal,
  PendingLong,
  RunningLong,
  Finished,
  Errored,
}

impl TaskState {
  /// Terminal states admit no further transitions.
  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskState::Finished | TaskState::Errored)
  }

  /// The transition DAG. Pending states may error directly when the pool is
  /// shut down immediately while the task is still queued.
  fn allows(&self, next: TaskState) -> bool {
    use TaskState::*;
    match self {
      PendingNormal => matches!(next, RunningNormal | Errored),
      RunningNormal => matches!(next, Finished | Errored | PendingLong),
      PendingLong => matches!(next, RunningLong | Errored),
      RunningLong => matches!(next, Finished | Errored),
      Finished | Errored => false,
    }
  }

  pub fn as_label(&self) -> &'static str {
    match self {
      TaskState::PendingNormal => "pending_normal",
      TaskState::RunningNormal => "running_normal",
      TaskState::PendingLong => "pending_long",
      TaskState::RunningLong => "running_long",
      TaskState::Finished => "finished",
      TaskState::Errored => "errored",
    }
  }
}

impl std::fmt::Display for TaskState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_label())
  }
}

/// Entry times for each state a task has passed through. `None` means the
/// state was never entered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskTimestamps {
  pub pending_normal: Option<SystemTime>,
  pub running_normal: Option<SystemTime>,
  pub pending_long: Option<SystemTime>,
  pub running_long: Option<SystemTime>,
  /// Set exactly once, on entering `Finished` or `Errored`.
  pub terminal: Option<SystemTime>,
}

/// Point-in-time snapshot of a managed task, as returned by
/// [`ManagedTask::status`].
#[derive(Debug, Clone)]
pub struct TaskStatus {
  pub id: String,
  pub state: TaskState,
  pub timestamps: TaskTimestamps,
  pub last_error: Option<TaskError>,
}

struct ManagedState {
  state: TaskState,
  timestamps: TaskTimestamps,
  /// Present only while the task is in a `Running*` state.
  cancel: Option<CancelSignal>,
  last_error: Option<TaskError>,
}

/// A task wrapped with identity, lifecycle state, and a cancel handle for
/// the two-tier pool.
pub struct ManagedTask {
  task: TaskRef,
  id: OnceLock<String>,
  inner: Mutex<ManagedState>,
}

impl std::fmt::Debug for ManagedTask {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let guard = self.inner.lock();
    f.debug_struct("ManagedTask")
      .field("id", &self.id())
      .field("state", &guard.state)
      .field("last_error", &guard.last_error)
      .finish_non_exhaustive()
  }
}

impl ManagedTask {
  pub(crate) fn new(task: TaskRef) -> Arc<Self> {
    Arc::new(Self {
      task,
      id: OnceLock::new(),
      inner: Mutex::new(ManagedState {
        state: TaskState::PendingNormal,
        timestamps: TaskTimestamps {
          pending_normal: Some(SystemTime::now()),
          ..TaskTimestamps::default()
        },
        cancel: None,
        last_error: None,
      }),
    })
  }

  /// The task's globally unique identifier, generated on first read.
  pub fn id(&self) -> &str {
    self.id.get_or_init(|| Uuid::new_v4().to_string())
  }

  /// The wrapped task, e.g. for resubmission after `shutdown_now`.
  pub fn task(&self) -> &TaskRef {
    &self.task
  }

  /// Current lifecycle state.
  pub fn state(&self) -> TaskState {
    self.inner.lock().state
  }

  /// Snapshot of state, timestamps, and last error.
  pub fn status(&self) -> TaskStatus {
    let guard = self.inner.lock();
    TaskStatus {
      id: self.id().to_string(),
      state: guard.state,
      timestamps: guard.timestamps,
      last_error: guard.last_error.clone(),
    }
  }

  /// Aborts the current execution, if any.
  ///
  /// A no-op while the task is not running; the pending and terminal states
  /// hold no cancel handle.
  pub fn cancel(&self) {
    let handle = self.inner.lock().cancel.clone();
    if let Some(signal) = handle {
      debug!(task_id = %self.id(), "cancel requested for running task");
      signal.cancel();
    }
  }

  /// Moves the task into a running state and installs its cancel handle.
  /// Returns `false` if the task is no longer eligible to run, e.g. it was
  /// cancelled while queued.
  pub(crate) fn try_begin(&self, to: TaskState, signal: CancelSignal) -> bool {
    let mut guard = self.inner.lock();
    if !guard.state.allows(to) {
      debug!(task_id = %self.id(), from = %guard.state, to = %to, "skipping ineligible task");
      return false;
    }
    debug_assert!(matches!(to, TaskState::RunningNormal | TaskState::RunningLong));
    let now = SystemTime::now();
    match to {
      TaskState::RunningNormal => guard.timestamps.running_normal = Some(now),
      TaskState::RunningLong => guard.timestamps.running_long = Some(now),
      _ => {}
    }
    guard.state = to;
    guard.cancel = Some(signal);
    true
  }

  /// Promotes a normal-tier execution that exceeded its deadline. The cancel
  /// handle is cleared; the long tier installs a fresh one.
  pub(crate) fn promote(&self) -> bool {
    let mut guard = self.inner.lock();
    if !guard.state.allows(TaskState::PendingLong) {
      warn!(task_id = %self.id(), state = %guard.state, "promotion from unexpected state");
      return false;
    }
    guard.state = TaskState::PendingLong;
    guard.timestamps.pending_long = Some(SystemTime::now());
    guard.cancel = None;
    debug!(task_id = %self.id(), "task promoted to long tier");
    true
  }

  /// Marks the task finished. A no-op once terminal.
  pub(crate) fn finish(&self) {
    let mut guard = self.inner.lock();
    if !guard.state.allows(TaskState::Finished) {
      return;
    }
    guard.state = TaskState::Finished;
    guard.timestamps.terminal = Some(SystemTime::now());
    guard.cancel = None;
  }

  /// Marks the task errored with `error`. A no-op once terminal, so the
  /// first terminal outcome wins.
  pub(crate) fn fail(&self, error: TaskError) {
    let mut guard = self.inner.lock();
    if !guard.state.allows(TaskState::Errored) {
      return;
    }
    debug!(task_id = %self.id(), error = %error, "task errored");
    guard.state = TaskState::Errored;
    guard.timestamps.terminal = Some(SystemTime::now());
    guard.cancel = None;
    guard.last_error = Some(error);
  }
}
