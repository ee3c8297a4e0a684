//! The retrying client.
//!
//! A [`Client`] owns a decorated pipeline, a [`RetryRule`] and a
//! [`ClientConfig`]. Each call to [`Client::send`] starts one logical request
//! on a spawned task and returns its [`ResponseFuture`] right away.
//!
//! Per attempt the driver:
//! 1. creates a fresh [`RequestContext`] with its own log and records the start,
//! 2. sends the context through the pipeline (bounded by the attempt timeout),
//! 3. completes the attempt's log, recording the cause on failure,
//! 4. asks the [`RetryEngine`] whether to retry, and if so sleeps and loops.
//!
//! The caller sees the outcome of the last attempt. Cancelling the returned
//! future stops the driver; an attempt in flight at that moment has its log
//! completed with [`AttemptCancelled`]. A panic anywhere in the driver
//! (decorators and rules included) completes the future with
//! [`ResponseError::Panicked`] and is then resumed on the driver's task.
//!
//! ```rust
//! use redial::{Backoff, Client, Request, Response, RetryRule};
//! use redial::transport::transport_fn;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let calls = Arc::new(AtomicU32::new(0));
//! let counter = calls.clone();
//! let transport = transport_fn(move |_request| {
//!     let n = counter.fetch_add(1, Ordering::SeqCst);
//!     async move {
//!         if n == 0 {
//!             Ok(Response::new(http::StatusCode::SERVICE_UNAVAILABLE))
//!         } else {
//!             Ok(Response::ok())
//!         }
//!     }
//! });
//!
//! let client = Client::builder(transport)
//!     .retry_rule(
//!         RetryRule::builder()
//!             .on_server_error_status()
//!             .then_backoff(Backoff::without_delay())
//!             .unwrap(),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let response = client.send(Request::get(http::Uri::from_static("http://svc/"))).await.unwrap();
//! assert_eq!(response.status(), http::StatusCode::OK);
//! assert_eq!(calls.load(Ordering::SeqCst), 2);
//! # });
//! ```

use crate::config::{ClientConfig, RETRY_COUNT_HEADER};
use crate::context::{RequestContext, Session};
use crate::error::{cause, AttemptCancelled, BuildError, Cause, ResponseError, TimeoutError};
use crate::future::ResponseFuture;
use crate::limiter::RetryLimiter;
use crate::message::{Request, Response};
use crate::pipeline::{self, BoxSender, Decorator, Next};
use crate::retry::{Decision, RetryEngine, SessionState};
use crate::rule::RetryRule;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{emit_best_effort, AttemptEvent, ClientEvent, RequestOutcome, RetryEvent};
use crate::transport::{Transport, TransportSender};
use futures::future::BoxFuture;
use futures::FutureExt;
use http::{HeaderName, HeaderValue};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tower::ServiceExt;
use tower_service::Service;
use tracing::Instrument;

type Emitter = Arc<dyn Fn(ClientEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Builder for [`Client`].
pub struct ClientBuilder {
    sender: BoxSender,
    decorators: Vec<Decorator>,
    rule: Option<RetryRule>,
    limiter: Option<Arc<dyn RetryLimiter>>,
    config: ClientConfig,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Option<Emitter>,
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("decorators", &self.decorators.len())
            .field("rule", &self.rule)
            .field("limiter", &self.limiter.is_some())
            .field("config", &self.config)
            .field("sleeper", &self.sleeper)
            .field("telemetry", &self.telemetry.is_some())
            .finish()
    }
}

impl ClientBuilder {
    /// Start from a transport; the base sender records request and response
    /// heads on each attempt's log.
    pub fn new<T: Transport>(transport: T) -> Self {
        Self::with_sender(TransportSender::new(transport).boxed())
    }

    /// Start from an arbitrary base sender.
    pub fn with_sender(sender: BoxSender) -> Self {
        Self {
            sender,
            decorators: Vec::new(),
            rule: None,
            limiter: None,
            config: ClientConfig::default(),
            sleeper: Arc::new(TokioSleeper),
            telemetry: None,
        }
    }

    /// Add a decorator. The first one added sits closest to the transport.
    pub fn decorator(mut self, decorator: Decorator) -> Self {
        self.decorators.push(decorator);
        self
    }

    /// Add a decorator from an async function. See [`Decorator::from_fn`].
    pub fn decorator_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Next, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, Cause>> + Send + 'static,
    {
        self.decorator(Decorator::from_fn(f))
    }

    /// Rule consulted after every attempt. Without one the client never retries.
    pub fn retry_rule(mut self, rule: RetryRule) -> Self {
        self.rule = Some(rule);
        self
    }

    /// Limiter shared by every request of the client. See [`RetryLimiter`].
    pub fn retry_limiter<L: RetryLimiter>(mut self, limiter: L) -> Self {
        self.limiter = Some(Arc::new(limiter));
        self
    }

    pub fn max_total_attempts(mut self, max_total_attempts: u32) -> Self {
        self.config.max_total_attempts = max_total_attempts;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.config.attempt_timeout = Some(timeout);
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = Some(timeout);
        self
    }

    pub fn use_retry_after(mut self, enabled: bool) -> Self {
        self.config.use_retry_after = enabled;
        self
    }

    pub fn retry_count_header(mut self, enabled: bool) -> Self {
        self.config.retry_count_header = enabled;
        self
    }

    /// Replace every setting at once.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom sleeper between attempts (tests use the instant ones).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Send [`ClientEvent`]s to `sink`, best effort.
    pub fn telemetry<S>(mut self, sink: S) -> Self
    where
        S: Service<ClientEvent, Response = ()> + Clone + Send + Sync + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let emit = move |event: ClientEvent| -> BoxFuture<'static, ()> {
            Box::pin(emit_best_effort(sink.clone(), event))
        };
        self.telemetry = Some(Arc::new(emit));
        self
    }

    pub fn build(self) -> Result<Client, BuildError> {
        self.config.validate()?;
        let sender = pipeline::build(self.sender, &self.decorators);
        let mut engine = RetryEngine::new(
            self.rule.unwrap_or_default(),
            self.config.max_total_attempts,
            self.config.use_retry_after,
        );
        if let Some(limiter) = self.limiter {
            engine = engine.with_limiter(limiter);
        }
        Ok(Client {
            inner: Arc::new(Inner {
                sender: Mutex::new(sender),
                engine,
                config: self.config,
                sleeper: self.sleeper,
                telemetry: self.telemetry,
            }),
        })
    }
}

struct Inner {
    sender: Mutex<BoxSender>,
    engine: RetryEngine,
    config: ClientConfig,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Option<Emitter>,
}

/// A retrying client. Cheap to clone; clones share the pipeline.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("rule", self.inner.engine.rule())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder<T: Transport>(transport: T) -> ClientBuilder {
        ClientBuilder::new(transport)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Start a logical request.
    ///
    /// Must be called within a tokio runtime: the attempts run on a spawned
    /// task, and the returned future completes once the last one is decided.
    pub fn send(&self, request: Request) -> ResponseFuture {
        let sender = self.inner.sender.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let session = Arc::new(Session::new());
        let span = tracing::debug_span!(
            "request",
            session = session.id(),
            method = %request.method(),
            uri = %request.uri()
        );
        let driver = Driver {
            request,
            sender,
            engine: self.inner.engine.clone(),
            config: self.inner.config.clone(),
            sleeper: self.inner.sleeper.clone(),
            telemetry: self.inner.telemetry.clone(),
            session,
        };

        let (completer, future) = ResponseFuture::pending();
        let (task, handle) = futures::future::abortable(driver.run());
        tokio::spawn(
            async move {
                match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(Ok(result)) => completer.complete(result),
                    // An aborted driver drops the completer, which reads as cancelled.
                    Ok(Err(_aborted)) => {}
                    Err(panic) => {
                        let message = panic_message(&*panic);
                        tracing::error!(panic = %message, "request driver panicked");
                        completer.complete(Err(ResponseError::Panicked(message)));
                        std::panic::resume_unwind(panic);
                    }
                }
            }
            .instrument(span),
        );
        future.with_upstream(handle)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Service<Request> for Client {
    type Response = Response;
    type Error = ResponseError;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        self.send(request)
    }
}

/// Ends the attempt's log with [`AttemptCancelled`] if the attempt is dropped
/// before it finished.
struct CompleteOnDrop(RequestContext);

impl Drop for CompleteOnDrop {
    fn drop(&mut self) {
        let log = self.0.log_builder();
        if !log.is_complete() {
            tracing::debug!(attempt = self.0.attempt(), "attempt dropped before completion");
            log.end_response(Some(cause(AttemptCancelled)));
        }
    }
}

// Runs all attempts of one logical request.
struct Driver {
    request: Request,
    sender: BoxSender,
    engine: RetryEngine,
    config: ClientConfig,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Option<Emitter>,
    session: Arc<Session>,
}

impl Driver {
    async fn run(self) -> Result<Response, ResponseError> {
        // A deadline too far out to represent is no deadline.
        let deadline =
            self.config.response_timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut state = SessionState::new(deadline);

        loop {
            let attempt = state.begin_attempt();
            self.session.begin_attempt();
            let limit = self.attempt_limit(&state);

            let ctx = RequestContext::for_attempt(
                attempt,
                self.attempt_request(attempt),
                self.session.clone(),
            );
            ctx.log_builder().start_request();
            let guard = CompleteOnDrop(ctx.clone());

            let started = self.emit(ClientEvent::Attempt(AttemptEvent::Started { attempt }));
            started.await;

            let call = self.sender.clone().oneshot(ctx.clone());
            let outcome = match limit {
                Some((limit, expired)) => match tokio::time::timeout(limit, call).await {
                    Ok(outcome) => outcome,
                    Err(_elapsed) => Err(cause(expired)),
                },
                None => call.await,
            };

            match &outcome {
                Ok(response) => {
                    ctx.set_response(response.clone());
                    ctx.log_builder().end_response(None);
                }
                Err(error) => {
                    tracing::debug!(attempt, error = %error, "attempt failed");
                    ctx.log_builder().end_response(Some(error.clone()));
                    let failed = self.emit(ClientEvent::Attempt(AttemptEvent::Failed {
                        attempt,
                        error: error.to_string(),
                    }));
                    failed.await;
                }
            }
            drop(guard);

            match self.engine.decide(&ctx, outcome, &mut state).await {
                Decision::Retry { delay } => {
                    tracing::debug!(attempt, ?delay, "scheduling retry");
                    let scheduled =
                        self.emit(ClientEvent::Retry(RetryEvent::Scheduled { attempt, delay }));
                    scheduled.await;
                    let sleep = self.sleeper.sleep(delay);
                    sleep.await;
                }
                Decision::Stop(result) => {
                    let finished = self.finish(result, &state);
                    return finished.await;
                }
                Decision::Exhausted(result) => {
                    let exhausted = self.emit(ClientEvent::Retry(RetryEvent::Exhausted {
                        total_attempts: state.total_attempts(),
                        total_duration: self.session.elapsed(),
                    }));
                    exhausted.await;
                    let finished = self.finish(result, &state);
                    return finished.await;
                }
            }
        }
    }

    // Timeout for the next attempt and the error reported when it expires.
    fn attempt_limit(&self, state: &SessionState) -> Option<(Duration, TimeoutError)> {
        let remaining = state.remaining();
        match (self.config.attempt_timeout, remaining) {
            (Some(attempt), Some(remaining)) if attempt <= remaining => {
                Some((attempt, TimeoutError::Attempt(attempt)))
            }
            (_, Some(remaining)) => {
                let total = self.config.response_timeout.unwrap_or(remaining);
                Some((remaining, TimeoutError::Response(total)))
            }
            (Some(attempt), None) => Some((attempt, TimeoutError::Attempt(attempt))),
            (None, None) => None,
        }
    }

    fn attempt_request(&self, attempt: u32) -> Request {
        let mut request = self.request.clone();
        if self.config.retry_count_header && attempt > 1 {
            request
                .headers_mut()
                .insert(HeaderName::from_static(RETRY_COUNT_HEADER), HeaderValue::from(attempt - 1));
        }
        request
    }

    fn emit(&self, event: ClientEvent) -> BoxFuture<'static, ()> {
        match &self.telemetry {
            Some(emit) => emit(event),
            None => Box::pin(async {}),
        }
    }

    // Report the outcome; the returned future owns everything it needs.
    fn finish(
        &self,
        result: Result<Response, Cause>,
        state: &SessionState,
    ) -> impl Future<Output = Result<Response, ResponseError>> + Send + 'static {
        let attempts = state.total_attempts();
        let duration = self.session.elapsed();
        let outcome = match &result {
            Ok(_) => RequestOutcome::Success { attempts, duration },
            Err(_) => RequestOutcome::Failure { attempts, duration },
        };
        let done = self.emit(ClientEvent::Request(outcome));
        async move {
            done.await;
            result.map_err(ResponseError::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::sleeper::InstantSleeper;
    use crate::transport::transport_fn;
    use http::{StatusCode, Uri};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Refused;

    impl fmt::Display for Refused {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "connection refused")
        }
    }

    impl std::error::Error for Refused {}

    fn request() -> Request {
        Request::get(Uri::from_static("http://svc/items"))
    }

    #[test]
    fn build_rejects_invalid_config() {
        let transport = transport_fn(|_req| async { Ok(Response::ok()) });
        let err = Client::builder(transport).max_total_attempts(0).build().unwrap_err();
        assert_eq!(err, BuildError::InvalidMaxAttempts(0));
    }

    #[tokio::test]
    async fn without_rule_sends_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let transport = transport_fn(move |_req| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(cause(Refused)) }
        });
        let client = Client::builder(transport).build().unwrap();
        let err = client.send(request()).await.unwrap_err();
        assert!(err.downcast_ref::<Refused>().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_failures_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let transport = transport_fn(move |_req| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(cause(Refused))
                } else {
                    Ok(Response::new(StatusCode::OK))
                }
            }
        });
        let client = Client::builder(transport)
            .retry_rule(RetryRule::on_exception_with(Backoff::without_delay()))
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();
        let response = client.send(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn attempt_limit_prefers_the_tighter_deadline() {
        let transport = transport_fn(|_req| async { Ok(Response::ok()) });
        let client = Client::builder(transport)
            .attempt_timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        let driver = Driver {
            request: request(),
            sender: client.inner.sender.lock().unwrap().clone(),
            engine: client.inner.engine.clone(),
            config: client.inner.config.clone(),
            sleeper: Arc::new(InstantSleeper),
            telemetry: None,
            session: Arc::new(Session::new()),
        };
        let state = SessionState::new(None);
        assert_eq!(
            driver.attempt_limit(&state),
            Some((Duration::from_secs(1), TimeoutError::Attempt(Duration::from_secs(1))))
        );
    }

    #[test]
    fn panic_message_reads_string_payloads() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&7_u8), "non-string panic payload");
    }

    #[tokio::test]
    async fn unrepresentable_response_timeout_means_no_deadline() {
        let transport = transport_fn(|_req| async { Ok(Response::ok()) });
        let client = Client::builder(transport).response_timeout(Duration::MAX).build().unwrap();
        let response = client.send(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn retry_count_header_only_on_retries() {
        let transport = transport_fn(|_req| async { Ok(Response::ok()) });
        let client = Client::builder(transport).retry_count_header(true).build().unwrap();
        let driver = Driver {
            request: request(),
            sender: client.inner.sender.lock().unwrap().clone(),
            engine: client.inner.engine.clone(),
            config: client.inner.config.clone(),
            sleeper: Arc::new(InstantSleeper),
            telemetry: None,
            session: Arc::new(Session::new()),
        };
        assert!(driver.attempt_request(1).headers().get(RETRY_COUNT_HEADER).is_none());
        assert_eq!(driver.attempt_request(3).headers()[RETRY_COUNT_HEADER], "2");
    }
}
