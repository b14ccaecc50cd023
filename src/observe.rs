use crate::error::{PoolError, TaskError};
use crate::pool::Pool;
use crate::signal::CancelSignal;
use crate::task::{Task, TaskRef};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::warn;

/// Sink invoked after each observed task completes.
///
/// Observers must not block the caller; long work belongs elsewhere. Any
/// `Fn(&CancelSignal, &TaskRef, &Result<(), TaskError>, Duration)` closure
/// qualifies.
pub trait TaskObserver: Send + Sync {
  fn observe_task(
    &self,
    signal: &CancelSignal,
    task: &TaskRef,
    outcome: &Result<(), TaskError>,
    elapsed: Duration,
  );
}

impl<F> TaskObserver for F
where
  F: Fn(&CancelSignal, &TaskRef, &Result<(), TaskError>, Duration) + Send + Sync,
{
  fn observe_task(
    &self,
    signal: &CancelSignal,
    task: &TaskRef,
    outcome: &Result<(), TaskError>,
    elapsed: Duration,
  ) {
    self(signal, task, outcome, elapsed)
  }
}

/// Sink invoked once when an observed pool's start call returns.
pub trait PoolObserver: Send + Sync {
  fn observe_start(&self, elapsed: Duration);
}

impl<F> PoolObserver for F
where
  F: Fn(Duration) + Send + Sync,
{
  fn observe_start(&self, elapsed: Duration) {
    self(elapsed)
  }
}

/// Decorator timing each run of the wrapped task.
///
/// Delegates to the inner task, then reports wall-clock duration and the
/// outcome to the observer. A failing run is logged but reported and
/// returned unchanged; observation never alters the outcome.
pub struct MetricTask {
  inner: TaskRef,
  observer: Arc<dyn TaskObserver>,
}

impl MetricTask {
  pub fn arc(inner: TaskRef, observer: Arc<dyn TaskObserver>) -> TaskRef {
    Arc::new(Self { inner, observer })
  }
}

#[async_trait]
impl Task for MetricTask {
  async fn run(&self, signal: CancelSignal) -> Result<(), TaskError> {
    let started = Instant::now();
    let outcome = self.inner.run(signal.clone()).await;
    let elapsed = started.elapsed();

    if let Err(error) = &outcome {
      warn!(%error, elapsed_ns = elapsed.as_nanos() as u64, "observed task failed");
    }
    self
      .observer
      .observe_task(&signal, &self.inner, &outcome, elapsed);
    outcome
  }
}

/// Decorator timing the start call of the wrapped pool.
pub struct MetricPool<P> {
  inner: P,
  observer: Arc<dyn PoolObserver>,
}

impl<P: Pool> MetricPool<P> {
  pub fn new(inner: P, observer: Arc<dyn PoolObserver>) -> Self {
    Self { inner, observer }
  }

  /// The wrapped pool, for variant-specific calls such as shutdown.
  pub fn inner(&self) -> &P {
    &self.inner
  }
}

#[async_trait]
impl<P: Pool> Pool for MetricPool<P> {
  async fn submit(&self, signal: &CancelSignal, task: TaskRef) -> Result<(), PoolError> {
    self.inner.submit(signal, task).await
  }

  fn start(&self) -> Result<(), PoolError> {
    let started = Instant::now();
    let result = self.inner.start();
    let elapsed = started.elapsed();

    if let Err(error) = &result {
      warn!(%error, "observed pool failed to start");
    }
    self.observer.observe_start(elapsed);
    result
  }
}
