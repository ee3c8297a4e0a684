//! Per-attempt request context and the logical session behind it.

use crate::log::{RequestLog, RequestLogBuilder};
use crate::message::{Request, Response};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Cross-attempt view of one logical request.
///
/// Only the retrying client's driver advances the counters; everything else
/// reads them.
#[derive(Debug)]
pub struct Session {
    id: u64,
    started_at: Instant,
    attempts: AtomicU32,
    backoff_nanos: AtomicU64,
}

impl Session {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            started_at: Instant::now(),
            attempts: AtomicU32::new(0),
            backoff_nanos: AtomicU64::new(0),
        }
    }

    /// Process-unique identifier, useful for correlating attempts in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Time since the logical request started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Total delay spent waiting between attempts.
    pub fn total_backoff(&self) -> Duration {
        Duration::from_nanos(self.backoff_nanos.load(Ordering::Acquire))
    }

    pub(crate) fn begin_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn add_backoff(&self, delay: Duration) {
        let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        let _ = self.backoff_nanos.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some(current.saturating_add(nanos))
        });
    }
}

struct Shared {
    log: RequestLogBuilder,
    response: OnceLock<Response>,
    session: Arc<Session>,
}

/// State of a single attempt.
///
/// Cloning is cheap and every clone refers to the same attempt: the same log,
/// the same session, and the same outcome slot.
#[derive(Clone)]
pub struct RequestContext {
    request: Arc<Request>,
    shared: Arc<Shared>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("session", &self.shared.session.id)
            .field("attempt", &self.attempt())
            .field("method", self.request.method())
            .field("uri", self.request.uri())
            .finish()
    }
}

impl RequestContext {
    /// Standalone context for a single attempt outside of a client.
    ///
    /// Handy for exercising decorators and retry rules directly.
    pub fn new(request: Request) -> Self {
        let session = Arc::new(Session::new());
        let attempt = session.begin_attempt();
        Self::for_attempt(attempt, request, session)
    }

    pub(crate) fn for_attempt(attempt: u32, request: Request, session: Arc<Session>) -> Self {
        Self {
            request: Arc::new(request),
            shared: Arc::new(Shared {
                log: RequestLogBuilder::new(attempt),
                response: OnceLock::new(),
                session,
            }),
        }
    }

    /// The same attempt with a different request for the inner layers.
    pub fn with_request(&self, request: Request) -> Self {
        Self { request: Arc::new(request), shared: self.shared.clone() }
    }

    /// 1-based attempt index.
    pub fn attempt(&self) -> u32 {
        self.shared.log.log().attempt()
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn log(&self) -> RequestLog {
        self.shared.log.log()
    }

    /// Writer for this attempt's log. Transports use it to record what they
    /// sent and received.
    pub fn log_builder(&self) -> &RequestLogBuilder {
        &self.shared.log
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.shared.session
    }

    /// The response this attempt produced, once the pipeline returned one.
    pub fn response(&self) -> Option<&Response> {
        self.shared.response.get()
    }

    pub(crate) fn set_response(&self, response: Response) {
        let _ = self.shared.response.set(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Uri;

    #[test]
    fn standalone_context_is_first_attempt() {
        let ctx = RequestContext::new(Request::get(Uri::from_static("http://svc/")));
        assert_eq!(ctx.attempt(), 1);
        assert_eq!(ctx.session().attempts(), 1);
        assert!(ctx.response().is_none());
    }

    #[test]
    fn with_request_shares_log_and_session() {
        let ctx = RequestContext::new(Request::get(Uri::from_static("http://svc/a")));
        let rewritten = ctx.with_request(Request::get(Uri::from_static("http://svc/b")));
        rewritten.log_builder().start_request();
        assert!(ctx.log().is_available(crate::log::LogProperty::RequestStart));
        assert_eq!(rewritten.request().uri(), "http://svc/b");
        assert!(Arc::ptr_eq(ctx.session(), rewritten.session()));
    }

    #[test]
    fn sessions_get_distinct_ids() {
        let a = Session::new();
        let b = Session::new();
        assert_ne!(a.id(), b.id());
        a.add_backoff(Duration::from_millis(5));
        a.add_backoff(Duration::from_millis(7));
        assert_eq!(a.total_backoff(), Duration::from_millis(12));
    }
}
