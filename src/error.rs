//! Error types for the request pipeline
//!
//! Failures travel through decorators, the request log, retry rules, and the
//! response future as a [`Cause`]: a shared, type-erased error. Every layer
//! hands the same `Arc` onward, so callers can still `downcast_ref` to the
//! concrete error type and compare identity with `Arc::ptr_eq`.
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Shared failure value recorded in the request log and surfaced to callers.
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// Wrap a concrete error into a [`Cause`].
pub fn cause<E>(error: E) -> Cause
where
    E: StdError + Send + Sync + 'static,
{
    Arc::new(error)
}

/// Borrow the concrete error behind a cause, if it has type `E`.
pub fn downcast_cause<E>(cause: &Cause) -> Option<&E>
where
    E: StdError + 'static,
{
    let inner: &(dyn StdError + 'static) = &**cause;
    inner.downcast_ref::<E>()
}

/// Completion error of a [`ResponseFuture`](crate::ResponseFuture).
///
/// `Failed` carries the original cause untouched; `Cancelled` is reported when
/// the logical request was cancelled before it produced an outcome.
/// `Panicked` means the code driving the request panicked; it is never the
/// result of [`cancel`](crate::ResponseFuture::cancel).
#[derive(Debug, Clone)]
pub enum ResponseError {
    /// The request failed; the cause is exactly what the last attempt recorded.
    Failed(Cause),
    /// The request was cancelled before completion.
    Cancelled,
    /// A decorator, rule, or the client itself panicked. Holds the panic message.
    Panicked(String),
}

impl ResponseError {
    /// The original cause, if the request failed.
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Self::Failed(cause) => Some(cause),
            Self::Cancelled | Self::Panicked(_) => None,
        }
    }

    /// Consume the error, returning the original cause if present.
    pub fn into_cause(self) -> Option<Cause> {
        match self {
            Self::Failed(cause) => Some(cause),
            Self::Cancelled | Self::Panicked(_) => None,
        }
    }

    /// Check if the request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_panicked(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }

    /// Borrow the cause as a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.cause().and_then(downcast_cause::<E>)
    }
}

impl From<Cause> for ResponseError {
    fn from(cause: Cause) -> Self {
        Self::Failed(cause)
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(cause) => write!(f, "request failed: {}", cause),
            Self::Cancelled => write!(f, "request cancelled"),
            Self::Panicked(message) => write!(f, "request panicked: {}", message),
        }
    }
}

impl StdError for ResponseError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Failed(cause) => Some(&**cause),
            Self::Cancelled | Self::Panicked(_) => None,
        }
    }
}

/// Deadline failures raised by the retrying client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutError {
    /// A single attempt exceeded its deadline.
    #[error("attempt timed out after {0:?}")]
    Attempt(Duration),
    /// The logical request exceeded its overall deadline.
    #[error("response timed out after {0:?}")]
    Response(Duration),
}

/// Recorded on an attempt's log when the attempt is dropped before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, thiserror::Error)]
#[error("attempt cancelled before completion")]
pub struct AttemptCancelled;

/// Errors produced while building clients and retry rules.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// `max_total_attempts` must be > 0.
    #[error("max_total_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(u32),
    /// A backoff was given to a rule builder without any retry condition.
    #[error("should set at least one retry condition if a backoff was set")]
    EmptyRule,
    /// A configured timeout was zero.
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}
