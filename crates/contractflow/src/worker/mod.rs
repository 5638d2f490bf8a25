//! Job execution: handlers, cancellation, and the worker pool.

pub mod context;
mod executor;
pub mod handler;
pub mod handlers;
pub mod pool;

pub use context::{CancellationToken, JobContext};
pub use executor::{Executor, JobRun, RunOutcome};
pub use handler::{HandlerError, HandlerRegistry, JobHandler};
pub use handlers::HandlerDeps;
pub use pool::WorkerPool;
