use crate::error::{PoolError, TaskError};
use crate::managed::{ManagedTask, TaskState};
use crate::pool::{DrainSignal, Pool};
use crate::signal::{CancelReason, CancelSignal};
use crate::task::{Task, TaskRef};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, Instrument};

/// Configuration for [`TieredPool`]. Non-positive overrides are ignored and
/// the default is kept.
#[derive(Debug, Clone)]
pub struct TieredPoolOptions {
  pub(crate) normal_workers: usize,
  pub(crate) long_workers: usize,
  pub(crate) normal_deadline: Duration,
  pub(crate) long_deadline: Duration,
  pub(crate) check_interval: Duration,
}

impl Default for TieredPoolOptions {
  fn default() -> Self {
    Self {
      normal_workers: 100,
      long_workers: 10,
      normal_deadline: Duration::from_secs(60),
      long_deadline: Duration::from_secs(60 * 60),
      check_interval: Duration::from_secs(1),
    }
  }
}

impl TieredPoolOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Worker count for the normal tier; doubles as the normal queue bound.
  pub fn normal_workers(mut self, count: usize) -> Self {
    if count > 0 {
      self.normal_workers = count;
    }
    self
  }

  /// Worker count for the long tier; doubles as the long queue bound.
  pub fn long_workers(mut self, count: usize) -> Self {
    if count > 0 {
      self.long_workers = count;
    }
    self
  }

  /// Execution budget in the normal tier before promotion.
  pub fn normal_deadline(mut self, deadline: Duration) -> Self {
    if !deadline.is_zero() {
      self.normal_deadline = deadline;
    }
    self
  }

  /// Execution budget in the long tier before the task times out.
  pub fn long_deadline(mut self, deadline: Duration) -> Self {
    if !deadline.is_zero() {
      self.long_deadline = deadline;
    }
    self
  }

  /// How often the reaper checks for drain completion after close.
  pub fn check_interval(mut self, interval: Duration) -> Self {
    if !interval.is_zero() {
      self.check_interval = interval;
    }
    self
  }
}

/// A two-tier pool that promotes long-running work.
///
/// Every task starts in the normal tier with deadline `normal_deadline`.
/// If the deadline expires before completion, the in-flight run is aborted
/// and the task is re-run from scratch in the long tier under
/// `long_deadline`; exceeding that errors the task with a timeout. Tasks
/// must therefore be idempotent.
pub struct TieredPool {
  pool_name: Arc<String>,
  opts: TieredPoolOptions,
  normal_tx: Sender<Arc<ManagedTask>>,
  normal_rx: Receiver<Arc<ManagedTask>>,
  long_tx: Sender<Arc<ManagedTask>>,
  long_rx: Receiver<Arc<ManagedTask>>,
  /// Every managed task not yet settled, by id. Shared with both worker
  /// tiers, the reaper, and `shutdown_now`.
  tasks: Arc<DashMap<String, Arc<ManagedTask>>>,
  started: AtomicBool,
  closed: Arc<AtomicBool>,
  /// Broadcast that releases every worker loop; cancelled exactly once.
  close_token: CancellationToken,
  finish: DrainSignal,
  tokio_handle: TokioHandle,
}

impl TieredPool {
  pub fn new(opts: TieredPoolOptions, tokio_handle: TokioHandle, pool_name: &str) -> Arc<Self> {
    let (normal_tx, normal_rx) = async_channel::bounded(opts.normal_workers);
    let (long_tx, long_rx) = async_channel::bounded(opts.long_workers);
    Arc::new(Self {
      pool_name: Arc::new(pool_name.to_string()),
      opts,
      normal_tx,
      normal_rx,
      long_tx,
      long_rx,
      tasks: Arc::new(DashMap::new()),
      started: AtomicBool::new(false),
      closed: Arc::new(AtomicBool::new(false)),
      close_token: CancellationToken::new(),
      finish: DrainSignal::new(),
      tokio_handle,
    })
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  /// Number of managed tasks not yet settled (queued or running, either tier).
  pub fn task_count(&self) -> usize {
    self.tasks.len()
  }

  /// The drain broadcast, also returned by [`shutdown`](Self::shutdown).
  pub fn drain_signal(&self) -> DrainSignal {
    self.finish.clone()
  }

  /// Wraps `task` into a managed task, registers it, and enqueues it into
  /// the normal tier.
  ///
  /// Blocks only when the normal queue is at capacity, bounded by `signal`.
  /// Returns the handle used to cancel the task or inspect its status.
  pub async fn submit(
    &self,
    signal: &CancelSignal,
    task: TaskRef,
  ) -> Result<Arc<ManagedTask>, PoolError> {
    if self.closed.load(AtomicOrdering::Acquire) {
      return Err(PoolError::Closed);
    }

    let managed = ManagedTask::new(task);
    self
      .tasks
      .insert(managed.id().to_string(), managed.clone());
    debug!(pool_name = %self.pool_name, task_id = %managed.id(), "submitting task");

    tokio::select! {
      biased;
      reason = signal.fired() => {
        self.tasks.remove(managed.id());
        Err(reason.into())
      }
      _ = self.close_token.cancelled() => {
        self.tasks.remove(managed.id());
        Err(PoolError::Closed)
      }
      sent = self.normal_tx.send(managed.clone()) => {
        if sent.is_err() {
          self.tasks.remove(managed.id());
          return Err(PoolError::Closed);
        }
        Ok(managed)
      }
    }
  }

  /// Launches both worker tiers and the reaper.
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

    info!(
      pool_name = %self.pool_name,
      normal_workers = self.opts.normal_workers,
      long_workers = self.opts.long_workers,
      "starting tiered pool"
    );

    for worker_id in 0..self.opts.normal_workers {
      let pool_name = self.pool_name.clone();
      self.tokio_handle.spawn(
        Self::run_normal_worker(
          self.normal_rx.clone(),
          self.long_tx.clone(),
          self.tasks.clone(),
          self.close_token.clone(),
          self.opts.normal_deadline,
        )
        .instrument(
          info_span!("tiered_pool_worker", pool_name = %*pool_name, tier = "normal", worker_id),
        ),
      );
    }

    for worker_id in 0..self.opts.long_workers {
      let pool_name = self.pool_name.clone();
      self.tokio_handle.spawn(
        Self::run_long_worker(
          self.long_rx.clone(),
          self.tasks.clone(),
          self.close_token.clone(),
          self.opts.long_deadline,
        )
        .instrument(
          info_span!("tiered_pool_worker", pool_name = %*pool_name, tier = "long", worker_id),
        ),
      );
    }

    let pool_name = self.pool_name.clone();
    self.tokio_handle.spawn(
      Self::run_reaper(
        self.opts.check_interval,
        self.tasks.clone(),
        self.closed.clone(),
        self.close_token.clone(),
        self.finish.clone(),
      )
      .instrument(info_span!("tiered_pool_reaper", pool_name = %*pool_name)),
    );

    Ok(())
  }

  /// Closes the pool; in-flight and queued tasks drain naturally.
  ///
  /// Returns the drain broadcast, which the reaper fires once every managed
  /// task has settled.
  pub fn shutdown(&self) -> Result<DrainSignal, PoolError> {
    if self.closed.swap(true, AtomicOrdering::AcqRel) {
      return Err(PoolError::Closed);
    }
    info!(pool_name = %self.pool_name, in_flight = self.tasks.len(), "graceful shutdown initiated");

    if !self.started.load(AtomicOrdering::Acquire) {
      // No reaper is running; nothing will ever drain.
      self.finish.fire();
      self.close_token.cancel();
    }
    Ok(self.finish.clone())
  }

  /// Closes the pool immediately.
  ///
  /// Cancels every known managed task (running tasks observe their signal,
  /// queued ones are errored in place), releases both worker tiers, and
  /// returns all tasks that had not settled. Does not wait for running
  /// tasks to return.
  pub fn shutdown_now(&self) -> Result<Vec<Arc<ManagedTask>>, PoolError> {
    if self.closed.swap(true, AtomicOrdering::AcqRel) {
      return Err(PoolError::Closed);
    }
    info!(pool_name = %self.pool_name, in_flight = self.tasks.len(), "immediate shutdown initiated");

    // Close the intake before snapshotting: a submission whose send won the
    // race is already registered in the index and shows up below, while a
    // later send fails and the submitter unregisters the task itself.
    self.normal_tx.close();
    self.long_tx.close();

    // Snapshot-and-clear, so the reaper and workers see an empty index.
    let remaining: Vec<Arc<ManagedTask>> =
      self.tasks.iter().map(|entry| entry.value().clone()).collect();
    self.tasks.clear();

    for managed in &remaining {
      managed.cancel();
      managed.fail(TaskError::Cancelled);
    }

    self.finish.fire();
    self.close_token.cancel();
    Ok(remaining)
  }

  async fn run_normal_worker(
    normal_rx: Receiver<Arc<ManagedTask>>,
    long_tx: Sender<Arc<ManagedTask>>,
    tasks: Arc<DashMap<String, Arc<ManagedTask>>>,
    close_token: CancellationToken,
    deadline: Duration,
  ) {
    loop {
      let managed = tokio::select! {
        biased;
        _ = close_token.cancelled() => break,
        received = normal_rx.recv() => match received {
          Ok(managed) => managed,
          Err(_) => break,
        }
      };

      let signal = CancelSignal::with_timeout(deadline);
      if !managed.try_begin(TaskState::RunningNormal, signal.clone()) {
        // Settled while queued, e.g. cancelled by an immediate shutdown.
        tasks.remove(managed.id());
        continue;
      }
      trace!(task_id = %managed.id(), "running in normal tier");

      tokio::select! {
        biased;

        reason = signal.fired() => match reason {
          CancelReason::DeadlineExceeded => {
            // The in-flight run is dropped here and restarted from scratch
            // by the long tier.
            if managed.promote() {
              if long_tx.send(managed.clone()).await.is_err() {
                managed.fail(TaskError::Cancelled);
                tasks.remove(managed.id());
              }
            } else {
              tasks.remove(managed.id());
            }
          }
          CancelReason::Cancelled => {
            managed.fail(TaskError::Cancelled);
            tasks.remove(managed.id());
          }
        },

        outcome = AssertUnwindSafe(managed.task().run(signal.child())).catch_unwind() => {
          Self::settle(&managed, outcome);
          tasks.remove(managed.id());
        }
      }
    }
  }

  async fn run_long_worker(
    long_rx: Receiver<Arc<ManagedTask>>,
    tasks: Arc<DashMap<String, Arc<ManagedTask>>>,
    close_token: CancellationToken,
    deadline: Duration,
  ) {
    loop {
      let managed = tokio::select! {
        biased;
        _ = close_token.cancelled() => break,
        received = long_rx.recv() => match received {
          Ok(managed) => managed,
          Err(_) => break,
        }
      };

      let signal = CancelSignal::with_timeout(deadline);
      if !managed.try_begin(TaskState::RunningLong, signal.clone()) {
        tasks.remove(managed.id());
        continue;
      }
      trace!(task_id = %managed.id(), "running in long tier");

      tokio::select! {
        biased;

        reason = signal.fired() => {
          match reason {
            // Terminal in the long tier; there is nowhere left to promote.
            CancelReason::DeadlineExceeded => {
              managed.fail(TaskError::Timeout { timeout: deadline });
            }
            CancelReason::Cancelled => managed.fail(TaskError::Cancelled),
          }
          tasks.remove(managed.id());
        }

        outcome = AssertUnwindSafe(managed.task().run(signal.child())).catch_unwind() => {
          Self::settle(&managed, outcome);
          tasks.remove(managed.id());
        }
      }
    }
  }

  /// Periodically checks whether a closed pool has fully drained, then fires
  /// the finish broadcast and releases the workers. Fires at most once; the
  /// immediate-shutdown path exits it through the close broadcast instead.
  async fn run_reaper(
    check_interval: Duration,
    tasks: Arc<DashMap<String, Arc<ManagedTask>>>,
    closed: Arc<AtomicBool>,
    close_token: CancellationToken,
    finish: DrainSignal,
  ) {
    let mut ticker = tokio::time::interval(check_interval);
    loop {
      tokio::select! {
        biased;
        _ = close_token.cancelled() => break,
        _ = ticker.tick() => {
          if closed.load(AtomicOrdering::Acquire) && tasks.is_empty() {
            debug!("pool drained, signalling completion");
            finish.fire();
            close_token.cancel();
            break;
          }
        }
      }
    }
  }

  fn settle(
    managed: &ManagedTask,
    outcome: Result<Result<(), TaskError>, Box<dyn std::any::Any + Send>>,
  ) {
    match outcome {
      Ok(Ok(())) => managed.finish(),
      Ok(Err(error)) => managed.fail(error),
      Err(_) => managed.fail(TaskError::Panicked),
    }
  }
}

#[async_trait]
impl Pool for TieredPool {
  async fn submit(&self, signal: &CancelSignal, task: TaskRef) -> Result<(), PoolError> {
    TieredPool::submit(self, signal, task).await.map(|_| ())
  }

  fn start(&self) -> Result<(), PoolError> {
    TieredPool::start(self)
  }
}

impl Drop for TieredPool {
  fn drop(&mut self) {
    if !self.closed.swap(true, AtomicOrdering::AcqRel) {
      info!(pool_name = %*self.pool_name, "pool dropped without explicit shutdown, closing");
      self.normal_tx.close();
      self.long_tx.close();
      self.close_token.cancel();
      // The reaper goes away with the pool; the drain broadcast fires here
      // so outstanding waiters are released.
      self.finish.fire();
    }
  }
}
