//! Decorator composition around a base sender.
//!
//! A sender is a `tower::Service<RequestContext>` producing a [`Response`] or a
//! [`Cause`]. A [`Decorator`] turns one sender into another. [`build`] folds
//! decorators over the base sender in declaration order, so the first
//! decorator declared ends up innermost (closest to the transport) and the last
//! declared ends up outermost (closest to the caller):
//!
//! ```text
//! caller -> D3 -> D2 -> D1 -> base sender -> transport
//! ```
//!
//! Decorators may rewrite the request, skip the inner sender, transform the
//! response, or fail. A failure raised while processing a successful response
//! looks exactly like a transport failure to every layer above it.
//!
//! ```rust
//! use redial::pipeline::{self, Decorator};
//! use redial::{Request, RequestContext, Response};
//! use tower::util::BoxCloneService;
//! use tower::ServiceExt;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let base = BoxCloneService::new(tower::service_fn(|_ctx: RequestContext| async {
//!     Ok::<_, redial::Cause>(Response::ok())
//! }));
//! let tag = Decorator::from_fn(|next, ctx| async move {
//!     let response = next.send(ctx).await?;
//!     Ok(response.with_header(
//!         http::header::SERVER,
//!         http::HeaderValue::from_static("decorated"),
//!     ))
//! });
//! let sender = pipeline::build(base, &[tag]);
//! let ctx = RequestContext::new(Request::get(http::Uri::from_static("http://svc/")));
//! let response = sender.oneshot(ctx).await.unwrap();
//! assert_eq!(response.headers()[http::header::SERVER], "decorated");
//! # });
//! ```

use crate::context::RequestContext;
use crate::error::Cause;
use crate::message::Response;
use futures::ready;
use pin_project::pin_project;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::util::BoxCloneService;
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

/// Type-erased sender at any point of the chain.
pub type BoxSender = BoxCloneService<RequestContext, Response, Cause>;

type Wrap = dyn Fn(BoxSender) -> BoxSender + Send + Sync;

/// A composition unit: given the next sender, returns a sender.
#[derive(Clone)]
pub struct Decorator {
    wrap: Arc<Wrap>,
}

impl fmt::Debug for Decorator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decorator").field("wrap", &"<fn>").finish()
    }
}

impl Decorator {
    /// Decorator from a raw `sender -> sender` function.
    pub fn new<F>(wrap: F) -> Self
    where
        F: Fn(BoxSender) -> BoxSender + Send + Sync + 'static,
    {
        Self { wrap: Arc::new(wrap) }
    }

    /// Decorator from any tower layer over senders.
    pub fn layer<L>(layer: L) -> Self
    where
        L: Layer<BoxSender> + Send + Sync + 'static,
        L::Service: Service<RequestContext, Response = Response, Error = Cause>
            + Clone
            + Send
            + 'static,
        <L::Service as Service<RequestContext>>::Future: Send + 'static,
    {
        Self::new(move |inner| BoxCloneService::new(layer.layer(inner)))
    }

    /// Decorator from an async function receiving the rest of the chain.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Next, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, Cause>> + Send + 'static,
    {
        let f = Arc::new(f);
        Self::new(move |inner| {
            let f = f.clone();
            BoxCloneService::new(tower::service_fn(move |ctx: RequestContext| {
                f(Next { inner: inner.clone() }, ctx)
            }))
        })
    }

    /// Decorator that transforms (or rejects) every successful response.
    pub fn map_response<F>(f: F) -> Self
    where
        F: Fn(&RequestContext, Response) -> Result<Response, Cause> + Send + Sync + 'static,
    {
        Self::layer(MapResponseLayer::new(f))
    }

    /// Wrap `sender` with this decorator.
    pub fn apply(&self, sender: BoxSender) -> BoxSender {
        (self.wrap)(sender)
    }
}

/// The remainder of the chain, handed to [`Decorator::from_fn`] functions.
pub struct Next {
    inner: BoxSender,
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

impl Next {
    /// Delegate to the inner sender.
    pub async fn send(self, ctx: RequestContext) -> Result<Response, Cause> {
        self.inner.oneshot(ctx).await
    }
}

/// Compose `decorators` around `base`. The first decorator is innermost.
pub fn build(base: BoxSender, decorators: &[Decorator]) -> BoxSender {
    decorators.iter().fold(base, |sender, decorator| decorator.apply(sender))
}

/// Layer applying a response transform.
pub struct MapResponseLayer<F> {
    f: Arc<F>,
}

impl<F> MapResponseLayer<F> {
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }
}

impl<F> Clone for MapResponseLayer<F> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<S, F> Layer<S> for MapResponseLayer<F> {
    type Service = MapResponse<S, F>;

    fn layer(&self, inner: S) -> Self::Service {
        MapResponse { inner, f: self.f.clone() }
    }
}

/// Service produced by [`MapResponseLayer`].
pub struct MapResponse<S, F> {
    inner: S,
    f: Arc<F>,
}

impl<S: Clone, F> Clone for MapResponse<S, F> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), f: self.f.clone() }
    }
}

impl<S, F> Service<RequestContext> for MapResponse<S, F>
where
    S: Service<RequestContext, Response = Response, Error = Cause>,
    F: Fn(&RequestContext, Response) -> Result<Response, Cause>,
{
    type Response = Response;
    type Error = Cause;
    type Future = MapResponseFuture<S::Future, F>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, ctx: RequestContext) -> Self::Future {
        MapResponseFuture { inner: self.inner.call(ctx.clone()), ctx, f: self.f.clone() }
    }
}

/// Response future of [`MapResponse`].
#[pin_project]
pub struct MapResponseFuture<Fut, F> {
    #[pin]
    inner: Fut,
    ctx: RequestContext,
    f: Arc<F>,
}

impl<Fut, F> Future for MapResponseFuture<Fut, F>
where
    Fut: Future<Output = Result<Response, Cause>>,
    F: Fn(&RequestContext, Response) -> Result<Response, Cause>,
{
    type Output = Result<Response, Cause>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let response = ready!(this.inner.poll(cx))?;
        Poll::Ready((this.f)(this.ctx, response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::cause;
    use crate::message::Request;
    use http::Uri;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct TestError;

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError")
        }
    }

    impl std::error::Error for TestError {}

    fn ok_sender(trace: Arc<Mutex<Vec<String>>>) -> BoxSender {
        BoxCloneService::new(tower::service_fn(move |_ctx: RequestContext| {
            let trace = trace.clone();
            async move {
                trace.lock().unwrap().push("transport".to_string());
                Ok::<_, Cause>(Response::ok())
            }
        }))
    }

    fn tracing_decorator(name: &'static str, trace: Arc<Mutex<Vec<String>>>) -> Decorator {
        Decorator::from_fn(move |next, ctx| {
            let trace = trace.clone();
            async move {
                trace.lock().unwrap().push(format!("{} in", name));
                let result = next.send(ctx).await;
                let tag = if result.is_ok() { "ok" } else { "err" };
                trace.lock().unwrap().push(format!("{} out {}", name, tag));
                result
            }
        })
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Request::get(Uri::from_static("http://svc/")))
    }

    #[tokio::test]
    async fn first_declared_is_innermost() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let decorators = [
            tracing_decorator("d1", trace.clone()),
            tracing_decorator("d2", trace.clone()),
            tracing_decorator("d3", trace.clone()),
        ];
        let sender = build(ok_sender(trace.clone()), &decorators);
        sender.oneshot(ctx()).await.unwrap();

        assert_eq!(
            *trace.lock().unwrap(),
            vec!["d3 in", "d2 in", "d1 in", "transport", "d1 out ok", "d2 out ok", "d3 out ok"]
        );
    }

    #[tokio::test]
    async fn map_response_failure_looks_like_transport_failure() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let reject = Decorator::map_response(|_ctx, _response| Err(cause(TestError)));
        let decorators = [reject, tracing_decorator("outer", trace.clone())];
        let sender = build(ok_sender(trace.clone()), &decorators);

        let err = sender.oneshot(ctx()).await.unwrap_err();
        assert!(err.downcast_ref::<TestError>().is_some());
        assert_eq!(*trace.lock().unwrap(), vec!["outer in", "transport", "outer out err"]);
    }

    #[tokio::test]
    async fn decorator_may_skip_inner() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let short_circuit =
            Decorator::from_fn(|_next, _ctx| async { Ok(Response::new(http::StatusCode::ACCEPTED)) });
        let sender = build(ok_sender(trace.clone()), &[short_circuit]);
        let response = sender.oneshot(ctx()).await.unwrap();
        assert_eq!(response.status(), http::StatusCode::ACCEPTED);
        assert!(trace.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_pipeline_is_base_sender() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let sender = build(ok_sender(trace.clone()), &[]);
        sender.oneshot(ctx()).await.unwrap();
        assert_eq!(*trace.lock().unwrap(), vec!["transport"]);
    }
}
