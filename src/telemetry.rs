//! Telemetry for the retrying client.
//!
//! The client emits a [`ClientEvent`] at each step of a logical request:
//! attempts starting and failing, retries being scheduled or running out, and
//! the final outcome. Events flow through a [`TelemetrySink`], which is a
//! `tower::Service<ClientEvent>` so sinks compose with ordinary tower tooling.
//!
//! ```rust
//! use redial::telemetry::{ClientEvent, RetryEvent, RequestOutcome};
//! use std::time::Duration;
//!
//! let scheduled = ClientEvent::Retry(RetryEvent::Scheduled {
//!     attempt: 1,
//!     delay: Duration::from_millis(100),
//! });
//! assert_eq!(scheduled.to_string(), "Retry::Scheduled(#1, delay=100ms)");
//!
//! let done = ClientEvent::Request(RequestOutcome::Success {
//!     attempts: 2,
//!     duration: Duration::from_millis(50),
//! });
//! assert!(done.to_string().starts_with("Request::Success"));
//! ```
//!
//! Independent of the event stream, [`logging_decorator`] observes every
//! attempt through its [`RequestLog`](crate::RequestLog) and writes one log line
//! per attempt.

use crate::log::LogProperty;
use crate::pipeline::Decorator;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// A telemetry sink that consumes client events.
///
/// # Implementing a Custom Sink
///
/// ```rust
/// use redial::telemetry::{ClientEvent, TelemetrySink};
/// use std::future::Future;
/// use std::pin::Pin;
/// use std::task::{Context, Poll};
/// use tower::Service;
///
/// #[derive(Clone)]
/// struct PrintSink;
///
/// impl Service<ClientEvent> for PrintSink {
///     type Response = ();
///     type Error = std::convert::Infallible;
///     type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;
///
///     fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
///         Poll::Ready(Ok(()))
///     }
///
///     fn call(&mut self, event: ClientEvent) -> Self::Future {
///         println!("{}", event);
///         Box::pin(async { Ok(()) })
///     }
/// }
///
/// impl TelemetrySink for PrintSink {
///     type SinkError = std::convert::Infallible;
/// }
/// ```
pub trait TelemetrySink:
    Service<ClientEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: std::error::Error + Send + 'static;
}

/// Deliver `event` to `sink`, dropping it if the sink is not ready or fails.
///
/// Telemetry never changes the outcome of a request.
pub async fn emit_best_effort<S>(sink: S, event: ClientEvent)
where
    S: Service<ClientEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Events emitted while a logical request runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Attempt(AttemptEvent),
    Retry(RetryEvent),
    /// Final outcome of the logical request.
    Request(RequestOutcome),
}

/// Per-attempt events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptEvent {
    /// An attempt is about to enter the pipeline.
    Started {
        /// 1-based attempt index
        attempt: u32,
    },
    /// The pipeline failed for this attempt.
    Failed {
        attempt: u32,
        /// Rendered cause
        error: String,
    },
}

/// Events about retry scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// Another attempt will start after `delay`.
    Scheduled {
        /// The attempt that is being retried
        attempt: u32,
        delay: Duration,
    },
    /// The rule asked for a retry but attempts or time ran out.
    Exhausted {
        total_attempts: u32,
        /// Time since the logical request started
        total_duration: Duration,
    },
}

/// Final outcome of a logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success { attempts: u32, duration: Duration },
    Failure { attempts: u32, duration: Duration },
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::Attempt(event) => write!(f, "Attempt::{}", event),
            ClientEvent::Retry(event) => write!(f, "Retry::{}", event),
            ClientEvent::Request(event) => write!(f, "Request::{}", event),
        }
    }
}

impl fmt::Display for AttemptEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptEvent::Started { attempt } => write!(f, "Started(#{})", attempt),
            AttemptEvent::Failed { attempt, error } => {
                write!(f, "Failed(#{}, error={})", attempt, error)
            }
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Scheduled { attempt, delay } => {
                write!(f, "Scheduled(#{}, delay={:?})", attempt, delay)
            }
            RetryEvent::Exhausted { total_attempts, total_duration } => {
                write!(f, "Exhausted(attempts={}, duration={:?})", total_attempts, total_duration)
            }
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { attempts, duration } => {
                write!(f, "Success(attempts={}, duration={:?})", attempts, duration)
            }
            RequestOutcome::Failure { attempts, duration } => {
                write!(f, "Failure(attempts={}, duration={:?})", attempts, duration)
            }
        }
    }
}

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// A sink that discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<ClientEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: ClientEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A sink that logs every event through `tracing` at INFO level.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<ClientEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ClientEvent) -> Self::Future {
        tracing::info!(event = %event, "client_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A sink that keeps events in memory, evicting the oldest past `capacity`.
///
/// ```rust
/// use redial::telemetry::{AttemptEvent, ClientEvent, MemorySink};
/// use tower::Service;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let mut sink = MemorySink::with_capacity(1);
/// sink.call(ClientEvent::Attempt(AttemptEvent::Started { attempt: 1 })).await.unwrap();
/// sink.call(ClientEvent::Attempt(AttemptEvent::Started { attempt: 2 })).await.unwrap();
///
/// assert_eq!(sink.events(), vec![ClientEvent::Attempt(AttemptEvent::Started { attempt: 2 })]);
/// assert_eq!(sink.evicted(), 1);
/// # });
/// ```
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ClientEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded sink holding up to 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of the stored events.
    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<ClientEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ClientEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Decorator logging one line per attempt once the attempt's log completes.
///
/// Successful attempts are logged at INFO with the response status, failed
/// ones at WARN with the cause.
pub fn logging_decorator() -> Decorator {
    Decorator::from_fn(|next, ctx| {
        let method = ctx.request().method().clone();
        let uri = ctx.request().uri().clone();
        let session = ctx.session().id();
        ctx.log().on_available(LogProperty::Complete, move |log| {
            let elapsed = log.duration().unwrap_or_default();
            match log.response_cause() {
                Some(cause) => tracing::warn!(
                    session,
                    attempt = log.attempt(),
                    %method,
                    %uri,
                    ?elapsed,
                    error = %cause,
                    "attempt failed"
                ),
                None => tracing::info!(
                    session,
                    attempt = log.attempt(),
                    %method,
                    %uri,
                    status = log.response_headers().map(|head| head.status.as_u16()),
                    ?elapsed,
                    "attempt completed"
                ),
            }
        });
        next.send(ctx)
    })
}
