//! The pool error taxonomy.

use thiserror::Error;

/// Boxed error type for client callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by the process pool.
///
/// Errors on a single shell are isolated to that shell's current
/// submission and its own lifecycle; the pool replaces the shell and
/// keeps accepting work.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Bad pool parameters, rejected up front.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// The pool has been shut down; no new submissions are accepted.
    #[error("pool is shut down")]
    Closed,

    /// The operating system failed to spawn a child process.
    #[error("failed to spawn child process: {0}")]
    Spawn(std::io::Error),

    /// Reading from or writing to the child's standard streams failed.
    #[error("stream I/O error: {0}")]
    StreamIo(std::io::Error),

    /// The child closed its output streams before the current command's
    /// completion predicate fired.
    #[error("process exited during submission")]
    ProcessExited,

    /// The submission was cancelled before completion.
    #[error("submission cancelled")]
    Cancelled,

    /// A deadline passed while waiting for a submission result.
    #[error("timed out waiting for submission result")]
    WaitTimeout,

    /// A client-supplied callback returned an error.
    #[error("client callback failed: {0}")]
    Callback(#[source] BoxError),
}
