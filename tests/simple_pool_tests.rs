use task_ensemble::{CancelSignal, PoolError, SimplePool, TaskError, TaskFn, TaskRef};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter =
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,task_ensemble=trace"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

/// A task that sleeps for `duration`, bumping `completions` on success and
/// returning a cancellation error if its signal fires first.
fn sleep_task(duration: Duration, completions: Arc<AtomicUsize>) -> TaskRef {
  TaskFn::arc(move |signal: CancelSignal| {
    let completions = completions.clone();
    async move {
      tokio::select! {
        _ = signal.fired() => Err(TaskError::Cancelled),
        _ = sleep(duration) => {
          completions.fetch_add(1, Ordering::SeqCst);
          Ok(())
        }
      }
    }
  })
}

#[tokio::test]
async fn submit_before_start_runs_everything() {
  setup_tracing_for_test();
  let pool = SimplePool::new(2, 4, tokio::runtime::Handle::current(), "sbp_basic");
  let signal = CancelSignal::new();
  let completions = Arc::new(AtomicUsize::new(0));

  for _ in 0..4 {
    pool
      .submit(&signal, sleep_task(Duration::from_millis(10), completions.clone()))
      .await
      .unwrap();
  }
  pool.start().unwrap();

  // All four settle quickly, then the drain broadcast follows the close.
  sleep(Duration::from_millis(200)).await;
  assert_eq!(completions.load(Ordering::SeqCst), 4);

  let drain = pool.shutdown().unwrap();
  tokio::time::timeout(Duration::from_millis(100), drain.wait())
    .await
    .expect("drain signal should fire promptly once the queue is empty");
}

#[tokio::test(start_paused = true)]
async fn backpressure_submission_expires_with_deadline() {
  setup_tracing_for_test();
  let pool = SimplePool::new(0, 0, tokio::runtime::Handle::current(), "sbp_backpressure");
  let signal = CancelSignal::with_timeout(Duration::from_secs(1));
  let completions = Arc::new(AtomicUsize::new(0));

  let result = pool
    .submit(&signal, sleep_task(Duration::from_millis(1), completions))
    .await;
  assert_eq!(result, Err(PoolError::DeadlineExceeded));
}

#[tokio::test]
async fn shutdown_now_returns_queued_tasks_unexecuted() {
  setup_tracing_for_test();
  let pool = SimplePool::new(2, 10, tokio::runtime::Handle::current(), "sbp_shutdown_now");
  let signal = CancelSignal::new();
  let completions = Arc::new(AtomicUsize::new(0));

  for _ in 0..5 {
    pool
      .submit(&signal, sleep_task(Duration::from_millis(10), completions.clone()))
      .await
      .unwrap();
  }

  // Never started: everything is still queued.
  let remaining = pool.shutdown_now().unwrap();
  assert_eq!(remaining.len(), 5);
  assert!(pool.drain_signal().is_ready());

  sleep(Duration::from_millis(50)).await;
  assert_eq!(completions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn shutdown_now_cancels_running_tasks_without_waiting() {
  setup_tracing_for_test();
  let pool = SimplePool::new(1, 5, tokio::runtime::Handle::current(), "sbp_cancel_running");
  let signal = CancelSignal::new();
  let completions = Arc::new(AtomicUsize::new(0));
  let cancellations = Arc::new(AtomicUsize::new(0));

  let cancellations_for_task = cancellations.clone();
  let slow: TaskRef = TaskFn::arc(move |signal: CancelSignal| {
    let cancellations = cancellations_for_task.clone();
    async move {
      tokio::select! {
        _ = signal.fired() => {
          cancellations.fetch_add(1, Ordering::SeqCst);
          Err(TaskError::Cancelled)
        }
        _ = sleep(Duration::from_secs(30)) => Ok(())
      }
    }
  });
  pool.submit(&signal, slow).await.unwrap();
  pool
    .submit(&signal, sleep_task(Duration::from_secs(30), completions.clone()))
    .await
    .unwrap();
  pool.start().unwrap();
  sleep(Duration::from_millis(50)).await;

  let called_at = Instant::now();
  let remaining = pool.shutdown_now().unwrap();
  assert!(
    called_at.elapsed() < Duration::from_millis(100),
    "shutdown_now must not wait for running tasks"
  );
  // The running task is not part of the remaining list; only the queued one.
  assert_eq!(remaining.len(), 1);

  sleep(Duration::from_millis(100)).await;
  assert_eq!(cancellations.load(Ordering::SeqCst), 1);
  assert_eq!(completions.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_now_accounts_for_every_submitted_task() {
  setup_tracing_for_test();
  for _ in 0..100 {
    let pool = SimplePool::new(2, 16, tokio::runtime::Handle::current(), "sbp_accounting");
    let signal = CancelSignal::new();
    let started = Arc::new(AtomicUsize::new(0));

    for _ in 0..8 {
      let started = started.clone();
      let task: TaskRef = TaskFn::arc(move |signal: CancelSignal| {
        let started = started.clone();
        async move {
          started.fetch_add(1, Ordering::SeqCst);
          signal.fired().await;
          Err(TaskError::Cancelled)
        }
      });
      pool.submit(&signal, task).await.unwrap();
    }
    pool.start().unwrap();
    tokio::task::yield_now().await;

    let remaining = pool.shutdown_now().unwrap();

    // Every task either came back unexecuted or reached a worker; none may
    // vanish in the dequeue-vs-abort window.
    let deadline = Instant::now() + Duration::from_secs(1);
    loop {
      let accounted = started.load(Ordering::SeqCst) + remaining.len();
      if accounted == 8 {
        break;
      }
      assert!(
        Instant::now() < deadline,
        "{} tasks neither ran nor were returned",
        8 - accounted
      );
      sleep(Duration::from_millis(5)).await;
    }
  }
}

#[tokio::test]
async fn dropping_a_started_zero_worker_pool_releases_drain_waiters() {
  setup_tracing_for_test();
  let pool = SimplePool::new(0, 4, tokio::runtime::Handle::current(), "sbp_drop_zero");
  pool.start().unwrap();
  let drain = pool.drain_signal();

  drop(pool);
  tokio::time::timeout(Duration::from_millis(100), drain.wait())
    .await
    .expect("drain signal should fire when the pool is dropped");
}

#[tokio::test]
async fn at_most_c_tasks_execute_concurrently() {
  setup_tracing_for_test();
  let pool = SimplePool::new(2, 8, tokio::runtime::Handle::current(), "sbp_concurrency_cap");
  let signal = CancelSignal::new();
  let running = Arc::new(AtomicUsize::new(0));
  let observed_max = Arc::new(AtomicUsize::new(0));
  let completions = Arc::new(AtomicUsize::new(0));

  for _ in 0..6 {
    let running = running.clone();
    let observed_max = observed_max.clone();
    let completions = completions.clone();
    let task: TaskRef = TaskFn::arc(move |_signal: CancelSignal| {
      let running = running.clone();
      let observed_max = observed_max.clone();
      let completions = completions.clone();
      async move {
        let now_running = running.fetch_add(1, Ordering::SeqCst) + 1;
        observed_max.fetch_max(now_running, Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;
        running.fetch_sub(1, Ordering::SeqCst);
        completions.fetch_add(1, Ordering::SeqCst);
        Ok(())
      }
    });
    pool.submit(&signal, task).await.unwrap();
  }
  pool.start().unwrap();

  let drain = {
    // Give workers time to pick everything up before closing.
    sleep(Duration::from_millis(300)).await;
    pool.shutdown().unwrap()
  };
  tokio::time::timeout(Duration::from_secs(1), drain.wait())
    .await
    .expect("drain signal should fire");

  assert_eq!(completions.load(Ordering::SeqCst), 6);
  assert!(
    observed_max.load(Ordering::SeqCst) <= 2,
    "no more than two tasks may run at once"
  );
}

#[tokio::test]
async fn single_worker_preserves_fifo_order() {
  setup_tracing_for_test();
  let pool = SimplePool::new(1, 8, tokio::runtime::Handle::current(), "sbp_fifo");
  let signal = CancelSignal::new();
  let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

  for task_no in 0..4usize {
    let order = order.clone();
    let task: TaskRef = TaskFn::arc(move |_signal: CancelSignal| {
      let order = order.clone();
      async move {
        sleep(Duration::from_millis(10)).await;
        order.lock().push(task_no);
        Ok(())
      }
    });
    pool.submit(&signal, task).await.unwrap();
  }
  pool.start().unwrap();

  sleep(Duration::from_millis(300)).await;
  assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
  pool.shutdown().unwrap();
}

#[tokio::test]
async fn lifecycle_flags_are_one_shot() {
  setup_tracing_for_test();
  let pool = SimplePool::new(1, 1, tokio::runtime::Handle::current(), "sbp_lifecycle");

  pool.start().unwrap();
  assert_eq!(pool.start(), Err(PoolError::AlreadyStarted));

  pool.shutdown().unwrap();
  assert!(matches!(pool.shutdown(), Err(PoolError::Closed)));
  assert!(matches!(pool.shutdown_now(), Err(PoolError::Closed)));
  assert_eq!(pool.start(), Err(PoolError::Closed));
}

#[tokio::test]
async fn shutdown_before_start_fires_drain_and_reports_it() {
  setup_tracing_for_test();
  let pool = SimplePool::new(2, 4, tokio::runtime::Handle::current(), "sbp_never_started");

  let result = pool.shutdown();
  assert!(matches!(result, Err(PoolError::ClosedBeforeStart)));
  assert!(pool.drain_signal().is_ready());
}

#[tokio::test]
async fn submit_after_close_is_refused() {
  setup_tracing_for_test();
  let pool = SimplePool::new(1, 4, tokio::runtime::Handle::current(), "sbp_submit_closed");
  let signal = CancelSignal::new();
  pool.start().unwrap();
  pool.shutdown().unwrap();

  let completions = Arc::new(AtomicUsize::new(0));
  let result = pool
    .submit(&signal, sleep_task(Duration::from_millis(1), completions))
    .await;
  assert_eq!(result, Err(PoolError::Closed));
}

#[tokio::test]
async fn graceful_shutdown_drains_queued_work() {
  setup_tracing_for_test();
  let pool = SimplePool::new(1, 10, tokio::runtime::Handle::current(), "sbp_graceful_drain");
  let signal = CancelSignal::new();
  let completions = Arc::new(AtomicUsize::new(0));

  pool.start().unwrap();
  for _ in 0..5 {
    pool
      .submit(&signal, sleep_task(Duration::from_millis(20), completions.clone()))
      .await
      .unwrap();
  }

  // Close immediately: queued tasks must still run to completion.
  let drain = pool.shutdown().unwrap();
  tokio::time::timeout(Duration::from_secs(2), drain.wait())
    .await
    .expect("drain signal should fire after the queue empties");
  assert_eq!(completions.load(Ordering::SeqCst), 5);
}
