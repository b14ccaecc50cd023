use crate::error::PoolError;
use crate::signal::CancelSignal;
use crate::task::TaskRef;

use std::fmt;
use std::sync::Arc;

use async_channel::{Receiver, Sender, TryRecvError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// An internal message pairing a task with the capacity permit it holds.
///
/// The permit is released when the slot is dropped, which happens once a
/// worker has extracted the task. A queue position is therefore freed only
/// after the task has been fully dequeued.
pub(crate) struct QueueSlot {
  pub(crate) task: TaskRef,
  _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for QueueSlot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueSlot").finish_non_exhaustive()
  }
}

/// A bounded, multi-producer multi-consumer waiting queue.
///
/// Capacity is enforced by a semaphore gate layered over an unbounded
/// channel, so a capacity of zero is expressible: every send then blocks
/// until the submission signal fires. Closing the queue refuses further
/// sends while letting consumers drain what is already buffered.
pub(crate) struct TaskQueue {
  tx: Sender<QueueSlot>,
  rx: Receiver<QueueSlot>,
  gate: Arc<Semaphore>,
}

impl fmt::Debug for TaskQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskQueue")
      .field("len", &self.tx.len())
      .field("free_slots", &self.gate.available_permits())
      .finish_non_exhaustive()
  }
}

impl TaskQueue {
  pub(crate) fn new(capacity: usize) -> Self {
    let (tx, rx) = async_channel::unbounded();
    Self {
      tx,
      rx,
      gate: Arc::new(Semaphore::new(capacity)),
    }
  }

  /// Enqueues a task, waiting for a free slot.
  ///
  /// The wait is bounded by `signal`: if it fires first, the signal's reason
  /// is returned. A send into a queue closed by a concurrent shutdown maps
  /// to [`PoolError::Closed`], never a fault.
  pub(crate) async fn send(&self, task: TaskRef, signal: &CancelSignal) -> Result<(), PoolError> {
    let permit = tokio::select! {
      biased;
      reason = signal.fired() => return Err(reason.into()),
      acquired = self.gate.clone().acquire_owned() => {
        match acquired {
          Ok(permit) => permit,
          // The gate is closed as part of shutdown.
          Err(_) => return Err(PoolError::Closed),
        }
      }
    };

    let slot = QueueSlot {
      task,
      _permit: permit,
    };
    self.tx.send(slot).await.map_err(|_| PoolError::Closed)
  }

  /// Receives the next task. `Err` means the queue is closed and drained.
  pub(crate) async fn recv(&self) -> Result<TaskRef, PoolError> {
    match self.rx.recv().await {
      // The slot's permit is dropped here, freeing its queue position.
      Ok(slot) => Ok(slot.task),
      Err(_) => Err(PoolError::Closed),
    }
  }

  /// Drains every currently buffered task without waiting.
  pub(crate) fn drain(&self) -> Vec<TaskRef> {
    let mut drained = Vec::new();
    loop {
      match self.rx.try_recv() {
        Ok(slot) => drained.push(slot.task),
        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
      }
    }
    drained
  }

  /// Refuses further sends and wakes producers blocked on the gate.
  /// Buffered tasks remain receivable.
  pub(crate) fn close(&self) {
    self.tx.close();
    self.gate.close();
  }

  pub(crate) fn len(&self) -> usize {
    self.tx.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::task::TaskFn;
  use std::time::Duration;

  fn dummy_task() -> TaskRef {
    TaskFn::arc(|_signal| async move { Ok(()) })
  }

  #[tokio::test]
  async fn send_recv_releases_capacity() {
    let queue = TaskQueue::new(2);
    let signal = CancelSignal::new();

    queue.send(dummy_task(), &signal).await.unwrap();
    assert_eq!(queue.gate.available_permits(), 1);

    queue.recv().await.unwrap();
    assert_eq!(queue.gate.available_permits(), 2);
  }

  #[tokio::test]
  async fn full_queue_blocks_send_until_dequeue() {
    let queue = TaskQueue::new(1);
    let signal = CancelSignal::new();

    queue.send(dummy_task(), &signal).await.unwrap();

    let blocked = queue.send(dummy_task(), &signal);
    tokio::pin!(blocked);
    tokio::select! {
      _ = &mut blocked => panic!("send should block while the queue is full"),
      _ = tokio::time::sleep(Duration::from_millis(50)) => {}
    }

    queue.recv().await.unwrap();
    tokio::time::timeout(Duration::from_millis(50), blocked)
      .await
      .expect("send should complete once a slot frees")
      .unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn zero_capacity_send_expires_with_deadline() {
    let queue = TaskQueue::new(0);
    let signal = CancelSignal::with_timeout(Duration::from_secs(1));

    let result = queue.send(dummy_task(), &signal).await;
    assert_eq!(result, Err(PoolError::DeadlineExceeded));
  }

  #[tokio::test]
  async fn close_refuses_sends_but_drains_buffered() {
    let queue = TaskQueue::new(4);
    let signal = CancelSignal::new();

    queue.send(dummy_task(), &signal).await.unwrap();
    queue.send(dummy_task(), &signal).await.unwrap();
    queue.close();

    let refused = queue.send(dummy_task(), &signal).await;
    assert_eq!(refused, Err(PoolError::Closed));

    assert_eq!(queue.drain().len(), 2);
    assert!(queue.recv().await.is_err());
  }
}
