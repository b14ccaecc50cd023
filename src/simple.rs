use crate::error::PoolError;
use crate::pool::{DrainSignal, Pool};
use crate::queue::TaskQueue;
use crate::signal::CancelSignal;
use crate::task::{Task, TaskRef};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// A fixed set of workers draining one bounded FIFO queue.
///
/// Submitters block when the queue is full, bounded by their cancellation
/// signal. `shutdown` lets workers drain the queue naturally; `shutdown_now`
/// aborts and hands back everything still queued.
pub struct SimplePool {
  pool_name: Arc<String>,
  concurrency: usize,
  queue: Arc<TaskQueue>,
  /// Pool-wide abort, fired by `shutdown_now`; every running task observes
  /// a child of it.
  cancel_signal: CancelSignal,
  drained: DrainSignal,
  started: AtomicBool,
  closed: AtomicBool,
  workers_active: Arc<AtomicUsize>,
  tokio_handle: TokioHandle,
}

impl SimplePool {
  /// Creates a pool with `concurrency` workers and a waiting queue holding
  /// at most `queue_capacity` tasks. Both may be zero: a pool with no
  /// workers never executes, and a zero-capacity queue blocks every submit.
  pub fn new(
    concurrency: usize,
    queue_capacity: usize,
    tokio_handle: TokioHandle,
    pool_name: &str,
  ) -> Arc<Self> {
    Arc::new(Self {
      pool_name: Arc::new(pool_name.to_string()),
      concurrency,
      queue: Arc::new(TaskQueue::new(queue_capacity)),
      cancel_signal: CancelSignal::new(),
      drained: DrainSignal::new(),
      started: AtomicBool::new(false),
      closed: AtomicBool::new(false),
      workers_active: Arc::new(AtomicUsize::new(0)),
      tokio_handle,
    })
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  /// Number of tasks currently waiting in the queue.
  pub fn queued_task_count(&self) -> usize {
    self.queue.len()
  }

  /// The drain broadcast, ready once all admitted work has settled. Also
  /// returned by [`shutdown`](Self::shutdown).
  pub fn drain_signal(&self) -> DrainSignal {
    self.drained.clone()
  }

  /// Enqueues `task`, waiting for queue space.
  ///
  /// Submission is permitted both before and after `start`. The wait is
  /// bounded by `signal`: if it fires first, its reason is returned. A
  /// closed pool refuses with [`PoolError::Closed`].
  pub async fn submit(&self, signal: &CancelSignal, task: TaskRef) -> Result<(), PoolError> {
    if self.closed.load(AtomicOrdering::Acquire) {
      warn!(pool_name = %self.pool_name, "submit refused: pool is closed");
      return Err(PoolError::Closed);
    }
    self.queue.send(task, signal).await?;
    trace!(pool_name = %self.pool_name, queued = self.queue.len(), "task enqueued");
    Ok(())
  }

  /// Launches the worker set.
  pub fn start(&self) -> Result<(), PoolError> {
    if self.closed.load(AtomicOrdering::Acquire) {
      return Err(PoolError::Closed);
    }
    if self
      .started
      .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
      .is_err()
    {
      return Err(PoolError::AlreadyStarted);
    }

    info!(pool_name = %self.pool_name, concurrency = self.concurrency, "starting workers");
    self
      .workers_active
      .store(self.concurrency, AtomicOrdering::Release);

    for worker_id in 0..self.concurrency {
      let pool_name = self.pool_name.clone();
      let queue = self.queue.clone();
      let cancel_signal = self.cancel_signal.clone();
      let drained = self.drained.clone();
      let workers_active = self.workers_active.clone();

      self.tokio_handle.spawn(
        Self::run_worker(queue, cancel_signal, drained, workers_active)
          .instrument(info_span!("simple_pool_worker", pool_name = %*pool_name, worker_id)),
      );
    }
    Ok(())
  }

  /// Closes the pool and lets workers drain the queue naturally.
  ///
  /// Returns the drain broadcast; running and queued tasks are not
  /// interrupted. On a pool that was never started the broadcast is fired
  /// immediately and [`PoolError::ClosedBeforeStart`] is returned (the
  /// signal stays reachable via [`drain_signal`](Self::drain_signal)).
  pub fn shutdown(&self) -> Result<DrainSignal, PoolError> {
    if self.closed.swap(true, AtomicOrdering::AcqRel) {
      return Err(PoolError::Closed);
    }
    info!(pool_name = %self.pool_name, "graceful shutdown initiated");
    self.queue.close();

    if !self.started.load(AtomicOrdering::Acquire) {
      self.drained.fire();
      return Err(PoolError::ClosedBeforeStart);
    }
    if self.concurrency == 0 {
      // Nothing will ever drain the queue; the pool is as settled as it
      // can get.
      self.drained.fire();
    }
    Ok(self.drained.clone())
  }

  /// Closes the pool immediately.
  ///
  /// Fires the pool-wide abort (running tasks observe their signal), then
  /// returns every task that was still queued, unexecuted. A task dequeued
  /// concurrently with the abort counts as running and is not returned; its
  /// signal is already cancelled when it starts. Does not wait for running
  /// tasks to return.
  pub fn shutdown_now(&self) -> Result<Vec<TaskRef>, PoolError> {
    if self.closed.swap(true, AtomicOrdering::AcqRel) {
      return Err(PoolError::Closed);
    }
    info!(pool_name = %self.pool_name, "immediate shutdown initiated");
    self.cancel_signal.cancel();
    self.queue.close();

    let remaining = self.queue.drain();
    self.drained.fire();
    info!(pool_name = %self.pool_name, unexecuted = remaining.len(), "immediate shutdown complete");
    Ok(remaining)
  }

  async fn run_worker(
    queue: Arc<TaskQueue>,
    cancel_signal: CancelSignal,
    drained: DrainSignal,
    workers_active: Arc<AtomicUsize>,
  ) {
    trace!("worker started");
    loop {
      tokio::select! {
        biased;

        _ = cancel_signal.fired() => {
          debug!("worker exiting on pool abort");
          break;
        }

        received = queue.recv() => {
          let task = match received {
            Ok(task) => task,
            Err(_) => {
              debug!("queue closed and drained, worker exiting");
              break;
            }
          };

          // The abort may fire between the select poll and the dequeue
          // completing. Either the drain in `shutdown_now` got the task or
          // this worker did; a dequeued task always runs, and its child
          // signal is already cancelled in that window.
          let outcome = AssertUnwindSafe(task.run(cancel_signal.child()))
            .catch_unwind()
            .await;
          match outcome {
            Ok(Ok(())) => trace!("task completed"),
            // Errors are consumed here; this pool records nothing per task
            // and never retries.
            Ok(Err(error)) => debug!(%error, "task failed"),
            Err(_) => warn!("task panicked during execution"),
          }
        }
      }
    }

    if workers_active.fetch_sub(1, AtomicOrdering::AcqRel) == 1 {
      drained.fire();
    }
  }
}

#[async_trait]
impl Pool for SimplePool {
  async fn submit(&self, signal: &CancelSignal, task: TaskRef) -> Result<(), PoolError> {
    SimplePool::submit(self, signal, task).await
  }

  fn start(&self) -> Result<(), PoolError> {
    SimplePool::start(self)
  }
}

impl Drop for SimplePool {
  fn drop(&mut self) {
    // Implicit shutdown for pools dropped without an explicit one; never
    // blocks on workers.
    if !self.closed.swap(true, AtomicOrdering::AcqRel) {
      info!(pool_name = %*self.pool_name, "pool dropped without explicit shutdown, closing");
      self.cancel_signal.cancel();
      self.queue.close();
      // With no workers running, nothing else will ever fire the drain.
      if !self.started.load(AtomicOrdering::Acquire) || self.concurrency == 0 {
        self.drained.fire();
      }
    }
  }
}
