use crate::error::PoolError;

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a [`CancelSignal`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
  /// The abort flag was raised explicitly.
  Cancelled,
  /// The signal's absolute deadline passed.
  DeadlineExceeded,
}

impl From<CancelReason> for PoolError {
  fn from(reason: CancelReason) -> Self {
    match reason {
      CancelReason::Cancelled => PoolError::Cancelled,
      CancelReason::DeadlineExceeded => PoolError::DeadlineExceeded,
    }
  }
}

/// A cooperative cancellation signal handed to tasks and submission calls.
///
/// The signal carries an abort flag (a [`CancellationToken`]) and an optional
/// absolute deadline. Tasks are expected to check it at reasonable
/// granularity; tasks that never check cannot be preempted and are treated
/// as cooperating best-effort.
#[derive(Debug, Clone)]
pub struct CancelSignal {
  token: CancellationToken,
  deadline: Option<Instant>,
}

impl CancelSignal {
  /// A signal with no deadline; it fires only when [`cancel`](Self::cancel)
  /// is called.
  pub fn new() -> Self {
    Self {
      token: CancellationToken::new(),
      deadline: None,
    }
  }

  /// A signal that fires with [`CancelReason::DeadlineExceeded`] at `deadline`.
  pub fn with_deadline(deadline: Instant) -> Self {
    Self {
      token: CancellationToken::new(),
      deadline: Some(deadline),
    }
  }

  /// A signal whose deadline is `timeout` from now.
  pub fn with_timeout(timeout: Duration) -> Self {
    Self::with_deadline(Instant::now() + timeout)
  }

  /// Raises the abort flag. Idempotent.
  pub fn cancel(&self) {
    self.token.cancel();
  }

  /// Returns `true` once the signal has fired, for either reason.
  pub fn is_cancelled(&self) -> bool {
    if self.token.is_cancelled() {
      return true;
    }
    matches!(self.deadline, Some(d) if Instant::now() >= d)
  }

  /// The absolute deadline, if one was set.
  pub fn deadline(&self) -> Option<Instant> {
    self.deadline
  }

  /// Resolves when the signal fires, reporting why.
  ///
  /// Explicit cancellation wins over a simultaneous deadline expiry.
  pub async fn fired(&self) -> CancelReason {
    match self.deadline {
      Some(deadline) => {
        tokio::select! {
          biased;
          _ = self.token.cancelled() => CancelReason::Cancelled,
          _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
        }
      }
      None => {
        self.token.cancelled().await;
        CancelReason::Cancelled
      }
    }
  }

  /// Derives a signal that fires when `self` fires, with the same deadline,
  /// but whose own `cancel` does not propagate back to `self`.
  pub fn child(&self) -> CancelSignal {
    Self {
      token: self.token.child_token(),
      deadline: self.deadline,
    }
  }
}

impl Default for CancelSignal {
  fn default() -> Self {
    Self::new()
  }
}
