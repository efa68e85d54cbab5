use std::io;
use std::time::Duration;

/// Errors returned by [`Pool`](crate::Pool) operations.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// An empty task was submitted. The pool state is left untouched.
    #[error("invalid task, must not be empty")]
    InvalidTask,

    /// An empty function was submitted through `submit_func`.
    #[error("invalid task function, must not be empty")]
    InvalidTaskFunc,

    /// The pool has been closed and no longer accepts work.
    #[error("pool has been closed")]
    Closed,

    /// More workers are alive than the capacity allows. Workers use this to
    /// retire themselves after `adjust` shrank the pool; it is not surfaced
    /// through the public API.
    #[error("pool overload, live workers exceed capacity")]
    Overload,

    /// The OS refused to create a thread.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] io::Error),

    /// `close_graceful_timeout` gave up before every worker exited.
    #[error("workers still alive after waiting {0:?} for shutdown")]
    ShutdownTimeout(Duration),
}

impl PoolError {
    pub fn is_closed(&self) -> bool {
        matches!(self, PoolError::Closed)
    }

    /// Whether submitting the same task again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Spawn(_))
    }
}

impl PartialEq for PoolError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidTask, Self::InvalidTask) => true,
            (Self::InvalidTaskFunc, Self::InvalidTaskFunc) => true,
            (Self::Closed, Self::Closed) => true,
            (Self::Overload, Self::Overload) => true,
            (Self::Spawn(a), Self::Spawn(b)) => a.kind() == b.kind(),
            (Self::ShutdownTimeout(a), Self::ShutdownTimeout(b)) => a == b,
            _ => false,
        }
    }
}
