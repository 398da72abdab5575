//! Caller-facing contract of an in-flight entity invocation.

use std::fmt;

use crate::utils::EntityError;

use tokio::time::Duration;

/// Error returned to a caller observing an invocation future.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum InvokeError {
    /// The operation completed on the server with a failure.
    Failed(EntityError),

    /// Illegal usage of an operation this future does not support. This is
    /// a programming error and must not be retried.
    Unsupported(&'static str),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "invocation failed: {}", e),
            Self::Unsupported(op) => write!(f, "{} not supported", op),
        }
    }
}

impl std::error::Error for InvokeError {}

impl From<EntityError> for InvokeError {
    fn from(e: EntityError) -> Self {
        InvokeError::Failed(e)
    }
}

/// Future of an entity invocation, as exposed to application code.
pub trait InvokeFuture<T> {
    /// Returns whether the invocation has completed, without blocking.
    fn is_done(&self) -> bool;

    /// Blocks the calling thread until the invocation completes, then returns
    /// its result or its failure. Calling again after completion returns the
    /// same outcome immediately.
    fn get(&self) -> Result<T, InvokeError>;

    /// Bounded variant of `get()`.
    fn get_with_timeout(&self, timeout: Duration) -> Result<T, InvokeError>;

    /// Requests cooperative cancellation of the wait.
    fn interrupt(&self) -> Result<(), InvokeError>;
}
