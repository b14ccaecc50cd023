use crate::error::PoolError;
use crate::signal::CancelSignal;
use crate::task::TaskRef;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// The submission surface shared by both pool variants, so decorators and
/// callers can stay agnostic of which one they hold.
#[async_trait]
pub trait Pool: Send + Sync {
  /// Submits a task. May block on backpressure, bounded by `signal`.
  async fn submit(&self, signal: &CancelSignal, task: TaskRef) -> Result<(), PoolError>;

  /// Launches the pool's workers. Fails on a second call or after close.
  fn start(&self) -> Result<(), PoolError>;
}

#[async_trait]
impl<P: Pool + ?Sized> Pool for std::sync::Arc<P> {
  async fn submit(&self, signal: &CancelSignal, task: TaskRef) -> Result<(), PoolError> {
    (**self).submit(signal, task).await
  }

  fn start(&self) -> Result<(), PoolError> {
    (**self).start()
  }
}

/// A one-shot broadcast that becomes ready once every admitted task has
/// reached a terminal state.
///
/// Internally this is a token that is cancelled exactly once (a closed
/// channel broadcast, never a send), so any number of listeners may wait on
/// it and a listener arriving late still observes it.
#[derive(Debug, Clone)]
pub struct DrainSignal {
  token: CancellationToken,
}

impl DrainSignal {
  pub(crate) fn new() -> Self {
    Self {
      token: CancellationToken::new(),
    }
  }

  /// Marks the signal ready. Idempotent.
  pub(crate) fn fire(&self) {
    self.token.cancel();
  }

  /// Returns `true` once the pool has drained.
  pub fn is_ready(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Waits until the pool has drained.
  pub async fn wait(&self) {
    self.token.cancelled().await;
  }
}
