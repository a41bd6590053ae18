//! hatchery-pool: a warm pool of long-lived, interactive child
//! processes.
//!
//! This crate targets workloads where spawning a fresh child per request
//! is prohibitively expensive (interpreters, model servers, external
//! engines) but each child can be *scripted* through a line-oriented
//! protocol on stdin/stdout/stderr. The pool keeps children alive,
//! dispatches submissions to idle ones, and lets client-supplied
//! predicates decide when a response is complete — the pool itself never
//! parses the child's protocol.
//!
//! # Example
//!
//! ```no_run
//! use hatchery_pool::{
//!     PoolConfig, ProcessPool, SimpleCommand, SimpleProcessManager, SimpleSubmission,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! // `cat` echoes every line straight back, so the echo of the
//! // instruction itself marks the response as complete.
//! let factory = SimpleProcessManager::new("cat").into_factory();
//! let pool = ProcessPool::new(factory, PoolConfig::elastic(1, 4, 1)).await?;
//!
//! let handle = pool.submit(SimpleSubmission::single(SimpleCommand::new(
//!     "ping",
//!     |line| line == "ping",
//! )))?;
//! let latency = handle.wait().await?;
//! println!("round trip in {latency:?}");
//!
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod manager;
pub mod pool;
mod pump;
pub mod shell;
pub mod submission;

pub use manager::{ProcessManager, ProcessManagerFactory, SimpleProcessManager};
pub use pool::ProcessPool;
pub use shell::{ProcessShell, ShellConsole};
pub use submission::SubmissionHandle;

// Re-export the contract crate so callers need only one dependency.
pub use hatchery_types::{
    BoxError, Charset, Command, PoolConfig, PoolError, PoolResult, PoolStats, ShellId, ShellState,
    SimpleCommand, SimpleSubmission, Submission,
};
