//! Convenient re-exports for common redial types.
pub use crate::{
    backoff::{Backoff, BackoffError, MAX_BACKOFF},
    client::{Client, ClientBuilder},
    config::ClientConfig,
    context::RequestContext,
    error::{cause, BuildError, Cause, ResponseError, TimeoutError},
    future::ResponseFuture,
    jitter::Jitter,
    limiter::{RetryBudget, RetryLimiter},
    log::{LogProperty, RequestLog},
    message::{Request, Response},
    pipeline::{Decorator, Next},
    rule::{RetryDecision, RetryRule},
    telemetry::{logging_decorator, ClientEvent, MemorySink},
    transport::{transport_fn, Transport},
};
