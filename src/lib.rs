//! Tokio-based task pools with bounded queueing, cooperative cancellation,
//! and two-tier promotion of long-running work.
//!
//! Two variants share one submission surface: [`SimplePool`], a fixed worker
//! set over a bounded FIFO queue, and [`TieredPool`], which starts every
//! task under a short deadline and promotes work that outlives it to a
//! second tier of long-running workers. [`MetricTask`] and [`MetricPool`]
//! decorate either with latency observers.

mod error;
mod managed;
mod observe;
mod pool;
mod queue;
mod signal;
mod simple;
mod task;
mod tiered;

pub use error::{PoolError, TaskError};
pub use managed::{ManagedTask, TaskState, TaskStatus, TaskTimestamps};
pub use observe::{MetricPool, MetricTask, PoolObserver, TaskObserver};
pub use pool::{DrainSignal, Pool};
pub use signal::{CancelReason, CancelSignal};
pub use simple::SimplePool;
pub use task::{Task, TaskFn, TaskRef};
pub use tiered::{TieredPool, TieredPoolOptions};
