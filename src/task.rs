use crate::error::TaskError;
use crate::signal::CancelSignal;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

/// Shared handle to a task, suitable for queueing and returning from
/// `shutdown_now`.
pub type TaskRef = Arc<dyn Task>;

type TaskFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;

/// A unit of work with a single asynchronous entry point.
///
/// `run` receives a [`CancelSignal`] carrying the pool's abort flag and, in
/// the two-tier pool, the current tier's deadline. Implementations should
/// check the signal at reasonable granularity and exit promptly when it
/// fires. Tasks submitted to the two-tier pool may be re-run from scratch
/// after promotion and must therefore be idempotent.
#[async_trait]
pub trait Task: Send + Sync + 'static {
  /// Executes the task until completion or cancellation.
  async fn run(&self, signal: CancelSignal) -> Result<(), TaskError>;
}

/// Function-backed [`Task`] for closures.
///
/// ```
/// use task_ensemble::{CancelSignal, TaskFn, TaskRef};
///
/// let task: TaskRef = TaskFn::arc(|_signal: CancelSignal| async move { Ok(()) });
/// ```
pub struct TaskFn {
  f: Box<dyn Fn(CancelSignal) -> TaskFuture + Send + Sync>,
}

impl TaskFn {
  /// Wraps an async closure into a shareable [`TaskRef`].
  pub fn arc<F, Fut>(f: F) -> TaskRef
  where
    F: Fn(CancelSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
  {
    Arc::new(Self {
      f: Box::new(move |signal| Box::pin(f(signal))),
    })
  }
}

#[async_trait]
impl Task for TaskFn {
  async fn run(&self, signal: CancelSignal) -> Result<(), TaskError> {
    (self.f)(signal).await
  }
}
