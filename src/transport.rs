//! The transport collaborator and the base sender wrapping it.
//!
//! A [`Transport`] performs the actual I/O: one request in, one response or
//! failure out. [`TransportSender`] adapts it to the pipeline and records what
//! happened on the attempt's log.

use crate::context::RequestContext;
use crate::error::Cause;
use crate::message::{Request, Response};
use crate::pipeline::BoxSender;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::util::BoxCloneService;
use tower_service::Service;

/// Performs a single request. Must not block the calling task.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: Request) -> Result<Response, Cause>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn send(&self, request: Request) -> Result<Response, Cause> {
        (**self).send(request).await
    }
}

/// Transport backed by an async function.
#[derive(Clone)]
pub struct TransportFn<F> {
    f: F,
}

impl<F> fmt::Debug for TransportFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportFn").finish_non_exhaustive()
    }
}

/// Build a [`Transport`] from an async function.
pub fn transport_fn<F, Fut>(f: F) -> TransportFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, Cause>> + Send + 'static,
{
    TransportFn { f }
}

#[async_trait]
impl<F, Fut> Transport for TransportFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, Cause>> + Send + 'static,
{
    async fn send(&self, request: Request) -> Result<Response, Cause> {
        (self.f)(request).await
    }
}

/// Base sender of every pipeline.
///
/// Records `RequestHeaders` before calling the transport, and on success
/// `ResponseHeaders` followed by `ResponseTrailers` (empty if the response
/// carried none). Failures are left to the caller to record.
#[derive(Clone)]
pub struct TransportSender {
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for TransportSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSender").finish_non_exhaustive()
    }
}

impl TransportSender {
    pub fn new<T: Transport>(transport: T) -> Self {
        Self { transport: Arc::new(transport) }
    }

    pub fn boxed(self) -> BoxSender {
        BoxCloneService::new(self)
    }
}

impl Service<RequestContext> for TransportSender {
    type Response = Response;
    type Error = Cause;
    type Future = BoxFuture<'static, Result<Response, Cause>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, ctx: RequestContext) -> Self::Future {
        let transport = self.transport.clone();
        Box::pin(async move {
            let request = ctx.request().clone();
            let log = ctx.log_builder();
            log.request_headers(request.head());
            let response = transport.send(request).await?;
            log.response_headers(response.head().clone());
            log.response_trailers(response.trailers().clone());
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::cause;
    use crate::log::LogProperty;
    use http::{HeaderName, HeaderValue, StatusCode, Uri};
    use tower::ServiceExt;

    #[derive(Debug)]
    struct ConnectionReset;

    impl fmt::Display for ConnectionReset {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "connection reset")
        }
    }

    impl std::error::Error for ConnectionReset {}

    fn ctx() -> RequestContext {
        RequestContext::new(Request::get(Uri::from_static("http://svc/status")))
    }

    #[tokio::test]
    async fn success_records_response_head_and_trailers() {
        let sender = TransportSender::new(transport_fn(|_req| async {
            Ok(Response::new(StatusCode::CREATED)
                .with_trailer(HeaderName::from_static("x-checksum"), HeaderValue::from_static("1")))
        }));
        let ctx = ctx();
        let response = sender.oneshot(ctx.clone()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let log = ctx.log();
        assert_eq!(log.request_headers().unwrap().uri, "http://svc/status");
        assert_eq!(log.response_headers().unwrap().status, StatusCode::CREATED);
        assert_eq!(log.response_trailers().unwrap()["x-checksum"], "1");
        assert!(!log.is_complete(), "completion belongs to the attempt owner");
    }

    #[tokio::test]
    async fn failure_leaves_response_properties_unset() {
        let sender =
            TransportSender::new(transport_fn(|_req| async { Err(cause(ConnectionReset)) }));
        let ctx = ctx();
        let err = sender.oneshot(ctx.clone()).await.unwrap_err();
        assert!(err.downcast_ref::<ConnectionReset>().is_some());
        assert!(ctx.log().is_available(LogProperty::RequestHeaders));
        assert!(!ctx.log().is_available(LogProperty::ResponseHeaders));
    }
}
