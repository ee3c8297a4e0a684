//! Per-attempt request log.
//!
//! A request log is an append-only set of single-assignment properties. Each
//! property moves from *unavailable* to *available* exactly once and never
//! reverts. Independent observers (telemetry, retry rules, tests) learn about
//! an attempt through the log without taking part in the request itself.
//!
//! Two handles share one log:
//! - [`RequestLogBuilder`] is the single writer owned by the attempt.
//! - [`RequestLog`] is the read view handed to any number of observers.
//!
//! Observers either register a callback with [`RequestLog::on_available`] or
//! await [`RequestLog::when_available`]. Callbacks run outside the log's lock on
//! the thread that made the property available (or inline, if it already is).
//! Every callback registered for a property runs before the log is marked
//! [`LogProperty::Complete`], because the writer marks properties in sequence.
//!
//! ```rust
//! use redial::log::{LogProperty, RequestLogBuilder};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let builder = RequestLogBuilder::new(1);
//! let fired = Arc::new(AtomicUsize::new(0));
//! let seen = fired.clone();
//! builder.log().on_available(LogProperty::ResponseEnd, move |_| {
//!     seen.fetch_add(1, Ordering::SeqCst);
//! });
//! builder.start_request();
//! builder.end_response(None);
//! assert_eq!(fired.load(Ordering::SeqCst), 1);
//! assert!(builder.log().is_complete());
//! ```

use crate::error::Cause;
use crate::message::{RequestHead, ResponseHead};
use futures::future::BoxFuture;
use http::HeaderMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Keys of the request log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogProperty {
    /// The attempt started.
    RequestStart,
    /// The request head was handed to the transport.
    RequestHeaders,
    /// Response status and headers arrived.
    ResponseHeaders,
    /// Response trailers arrived (possibly empty).
    ResponseTrailers,
    /// The attempt failed. Only ever populated on failure.
    ResponseCause,
    /// The attempt's outcome is known.
    ResponseEnd,
    /// Every property that will ever be available is available.
    Complete,
}

impl LogProperty {
    /// All properties, in lifecycle order.
    pub const ALL: [LogProperty; 7] = [
        LogProperty::RequestStart,
        LogProperty::RequestHeaders,
        LogProperty::ResponseHeaders,
        LogProperty::ResponseTrailers,
        LogProperty::ResponseCause,
        LogProperty::ResponseEnd,
        LogProperty::Complete,
    ];

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl fmt::Display for LogProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogProperty::RequestStart => "REQUEST_START",
            LogProperty::RequestHeaders => "REQUEST_HEADERS",
            LogProperty::ResponseHeaders => "RESPONSE_HEADERS",
            LogProperty::ResponseTrailers => "RESPONSE_TRAILERS",
            LogProperty::ResponseCause => "RESPONSE_CAUSE",
            LogProperty::ResponseEnd => "RESPONSE_END",
            LogProperty::Complete => "REQUEST_COMPLETE",
        };
        f.write_str(name)
    }
}

/// A value being made available, tagged with its property.
#[derive(Debug, Clone)]
pub enum PropertyValue {
    RequestStart(Instant),
    RequestHeaders(RequestHead),
    ResponseHeaders(ResponseHead),
    ResponseTrailers(HeaderMap),
    ResponseCause(Cause),
    ResponseEnd(Instant),
    Complete,
}

impl PropertyValue {
    pub fn property(&self) -> LogProperty {
        match self {
            PropertyValue::RequestStart(_) => LogProperty::RequestStart,
            PropertyValue::RequestHeaders(_) => LogProperty::RequestHeaders,
            PropertyValue::ResponseHeaders(_) => LogProperty::ResponseHeaders,
            PropertyValue::ResponseTrailers(_) => LogProperty::ResponseTrailers,
            PropertyValue::ResponseCause(_) => LogProperty::ResponseCause,
            PropertyValue::ResponseEnd(_) => LogProperty::ResponseEnd,
            PropertyValue::Complete => LogProperty::Complete,
        }
    }
}

type Callback = Box<dyn FnOnce(&RequestLog) + Send + 'static>;

struct Pending {
    property: LogProperty,
    callback: Callback,
}

struct Inner {
    attempt: u32,
    request_start: OnceLock<Instant>,
    request_headers: OnceLock<RequestHead>,
    response_headers: OnceLock<ResponseHead>,
    response_trailers: OnceLock<HeaderMap>,
    response_cause: OnceLock<Cause>,
    response_end: OnceLock<Instant>,
    // Availability bitset. Only written while `pending` is locked.
    flags: watch::Sender<u32>,
    pending: Mutex<Vec<Pending>>,
}

impl Inner {
    fn lock_pending(&self) -> MutexGuard<'_, Vec<Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flags(&self) -> u32 {
        *self.flags.borrow()
    }

    // Returns false if the cell was already filled.
    fn store(&self, value: PropertyValue) -> bool {
        match value {
            PropertyValue::RequestStart(at) => self.request_start.set(at).is_ok(),
            PropertyValue::RequestHeaders(head) => self.request_headers.set(head).is_ok(),
            PropertyValue::ResponseHeaders(head) => self.response_headers.set(head).is_ok(),
            PropertyValue::ResponseTrailers(trailers) => {
                self.response_trailers.set(trailers).is_ok()
            }
            PropertyValue::ResponseCause(cause) => self.response_cause.set(cause).is_ok(),
            PropertyValue::ResponseEnd(at) => self.response_end.set(at).is_ok(),
            PropertyValue::Complete => true,
        }
    }
}

/// Read view of an attempt's log. Cheap to clone.
#[derive(Clone)]
pub struct RequestLog {
    inner: Arc<Inner>,
}

impl fmt::Debug for RequestLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = self.inner.flags();
        let available: Vec<LogProperty> =
            LogProperty::ALL.into_iter().filter(|p| flags & p.bit() != 0).collect();
        f.debug_struct("RequestLog")
            .field("attempt", &self.inner.attempt)
            .field("available", &available)
            .finish()
    }
}

impl RequestLog {
    /// The 1-based attempt this log belongs to.
    pub fn attempt(&self) -> u32 {
        self.inner.attempt
    }

    pub fn is_available(&self, property: LogProperty) -> bool {
        self.inner.flags() & property.bit() != 0
    }

    pub fn is_complete(&self) -> bool {
        self.is_available(LogProperty::Complete)
    }

    pub fn request_start_time(&self) -> Option<Instant> {
        self.inner.request_start.get().copied()
    }

    pub fn request_headers(&self) -> Option<&RequestHead> {
        self.inner.request_headers.get()
    }

    pub fn response_headers(&self) -> Option<&ResponseHead> {
        self.inner.response_headers.get()
    }

    pub fn response_trailers(&self) -> Option<&HeaderMap> {
        self.inner.response_trailers.get()
    }

    /// The failure recorded for this attempt. `None` for successful attempts.
    pub fn response_cause(&self) -> Option<&Cause> {
        self.inner.response_cause.get()
    }

    pub fn response_end_time(&self) -> Option<Instant> {
        self.inner.response_end.get().copied()
    }

    /// Time between request start and response end, once both are known.
    pub fn duration(&self) -> Option<Duration> {
        let start = self.request_start_time()?;
        let end = self.response_end_time()?;
        Some(end.saturating_duration_since(start))
    }

    /// Resolve once `property` becomes available.
    ///
    /// Resolves to `None` if the log completes without the property ever
    /// becoming available (for example `ResponseCause` on a successful attempt).
    pub fn when_available(&self, property: LogProperty) -> BoxFuture<'static, Option<RequestLog>> {
        let log = self.clone();
        let mut flags = self.inner.flags.subscribe();
        let wanted = property.bit();
        let done = LogProperty::Complete.bit();
        Box::pin(async move {
            // The sender lives inside `log`, so the channel cannot close here.
            let seen = match flags.wait_for(|f| f & (wanted | done) != 0).await {
                Ok(current) => *current,
                Err(_) => log.inner.flags(),
            };
            (seen & wanted != 0).then_some(log)
        })
    }

    /// Resolve once the log is complete.
    pub fn when_complete(&self) -> BoxFuture<'static, RequestLog> {
        let log = self.clone();
        let pending = self.when_available(LogProperty::Complete);
        Box::pin(async move { pending.await.unwrap_or(log) })
    }

    /// Run `callback` exactly once when `property` becomes available.
    ///
    /// If the property is already available the callback runs immediately on
    /// the calling thread. If the log is already complete and the property never
    /// became available, the callback is dropped without running.
    pub fn on_available<F>(&self, property: LogProperty, callback: F)
    where
        F: FnOnce(&RequestLog) + Send + 'static,
    {
        let mut pending = self.inner.lock_pending();
        let flags = self.inner.flags();
        if flags & property.bit() != 0 {
            drop(pending);
            callback(self);
            return;
        }
        if flags & LogProperty::Complete.bit() != 0 {
            return;
        }
        pending.push(Pending { property, callback: Box::new(callback) });
    }
}

/// Single writer of an attempt's log.
#[derive(Clone)]
pub struct RequestLogBuilder {
    log: RequestLog,
}

impl fmt::Debug for RequestLogBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RequestLogBuilder").field(&self.log).finish()
    }
}

impl RequestLogBuilder {
    /// Create an empty log for the given 1-based attempt.
    pub fn new(attempt: u32) -> Self {
        let (flags, _) = watch::channel(0);
        let inner = Inner {
            attempt,
            request_start: OnceLock::new(),
            request_headers: OnceLock::new(),
            response_headers: OnceLock::new(),
            response_trailers: OnceLock::new(),
            response_cause: OnceLock::new(),
            response_end: OnceLock::new(),
            flags,
            pending: Mutex::new(Vec::new()),
        };
        Self { log: RequestLog { inner: Arc::new(inner) } }
    }

    /// The read view of this log.
    pub fn log(&self) -> RequestLog {
        self.log.clone()
    }

    pub fn is_available(&self, property: LogProperty) -> bool {
        self.log.is_available(property)
    }

    pub fn is_complete(&self) -> bool {
        self.log.is_complete()
    }

    /// Make a property available and notify its observers.
    ///
    /// # Panics
    ///
    /// Panics if the property is already available or the log is already
    /// complete. Both indicate a bug in the caller.
    pub fn mark_available(&self, value: PropertyValue) {
        let property = value.property();
        let inner = &self.log.inner;
        let mut pending = inner.lock_pending();
        let flags = inner.flags();
        if flags & LogProperty::Complete.bit() != 0 {
            drop(pending);
            panic!("request log is complete; cannot mark {} available", property);
        }
        if flags & property.bit() != 0 || !inner.store(value) {
            drop(pending);
            panic!("{} is already available", property);
        }
        inner.flags.send_modify(|f| *f |= property.bit());

        let (ready, rest): (Vec<Pending>, Vec<Pending>) =
            std::mem::take(&mut *pending).into_iter().partition(|p| p.property == property);
        if property != LogProperty::Complete {
            *pending = rest;
        }
        drop(pending);

        for entry in ready {
            (entry.callback)(&self.log);
        }
    }

    pub fn start_request(&self) {
        self.mark_available(PropertyValue::RequestStart(Instant::now()));
    }

    pub fn request_headers(&self, head: RequestHead) {
        self.mark_available(PropertyValue::RequestHeaders(head));
    }

    pub fn response_headers(&self, head: ResponseHead) {
        self.mark_available(PropertyValue::ResponseHeaders(head));
    }

    pub fn response_trailers(&self, trailers: HeaderMap) {
        self.mark_available(PropertyValue::ResponseTrailers(trailers));
    }

    /// Finish the attempt: record the cause (failures only), the end time, and
    /// completion, in that order.
    ///
    /// A cause that was already recorded is kept as is.
    pub fn end_response(&self, cause: Option<Cause>) {
        if let Some(cause) = cause {
            if !self.is_available(LogProperty::ResponseCause) {
                self.mark_available(PropertyValue::ResponseCause(cause));
            }
        }
        if !self.is_available(LogProperty::ResponseEnd) {
            self.mark_available(PropertyValue::ResponseEnd(Instant::now()));
        }
        self.mark_available(PropertyValue::Complete);
    }
}
