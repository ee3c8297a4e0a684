//! The caller-facing handle of a logical request.
//!
//! A [`ResponseFuture`] completes exactly once, with a value or a
//! [`ResponseError`]. Clones observe the same completion. The write side is a
//! [`ResponseCompleter`], which is consumed by completing, so a second
//! completion cannot be expressed.
//!
//! ```rust
//! use redial::ResponseFuture;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let (completer, future) = ResponseFuture::<u32>::pending();
//! let doubled = future.transform(|n| Ok(n * 2));
//! completer.complete(Ok(21));
//! assert_eq!(doubled.await.unwrap(), 42);
//! assert_eq!(future.await.unwrap(), 21);
//! # });
//! ```

use crate::error::{Cause, ResponseError};
use crate::message::Response;
use futures::channel::oneshot;
use futures::future::{AbortHandle, Abortable, BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

type Completion<T> = Result<T, ResponseError>;

/// Shared, cancellable result of a logical request.
pub struct ResponseFuture<T = Response>
where
    T: Clone + Send + Sync + 'static,
{
    shared: Shared<BoxFuture<'static, Completion<T>>>,
    cancel: AbortHandle,
    upstream: Option<AbortHandle>,
}

impl<T> Clone for ResponseFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            cancel: self.cancel.clone(),
            upstream: self.upstream.clone(),
        }
    }
}

impl<T> fmt::Debug for ResponseFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("done", &self.shared.peek().is_some())
            .field("cancelled", &self.cancel.is_aborted())
            .finish()
    }
}

impl<T> ResponseFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an incomplete future together with its single writer.
    pub fn pending() -> (ResponseCompleter<T>, Self) {
        let (tx, rx) = oneshot::channel();
        let future = Self::from_future(async move {
            match rx.await {
                Ok(result) => result,
                // Writer dropped without completing.
                Err(oneshot::Canceled) => Err(ResponseError::Cancelled),
            }
        });
        (ResponseCompleter { tx }, future)
    }

    /// A future that is already complete.
    pub fn completed(result: Completion<T>) -> Self {
        Self::from_future(futures::future::ready(result))
    }

    pub fn ok(value: T) -> Self {
        Self::completed(Ok(value))
    }

    pub fn failed(cause: Cause) -> Self {
        Self::completed(Err(ResponseError::Failed(cause)))
    }

    fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Completion<T>> + Send + 'static,
    {
        let (cancel, registration) = AbortHandle::new_pair();
        let abortable = Abortable::new(future, registration)
            .map(|outcome| outcome.unwrap_or(Err(ResponseError::Cancelled)));
        Self { shared: abortable.boxed().shared(), cancel, upstream: None }
    }

    /// Attach the handle of the work producing this future, so that
    /// [`cancel`](Self::cancel) stops it too.
    pub(crate) fn with_upstream(mut self, upstream: AbortHandle) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Derive a future that applies `f` to the value once available.
    ///
    /// Failures of this future pass through untouched. If `f` fails, only the
    /// derived future fails. Cancelling the derived future does not cancel
    /// this one.
    pub fn transform<U, F>(&self, f: F) -> ResponseFuture<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U, Cause> + Send + 'static,
    {
        let source = self.shared.clone();
        ResponseFuture::from_future(async move {
            let value = source.await?;
            f(value).map_err(ResponseError::Failed)
        })
    }

    /// Run `listener` with the result once the future completes.
    ///
    /// Runs inline when already complete; otherwise on a spawned tokio task,
    /// so a runtime must be available.
    pub fn on_complete<F>(&self, listener: F)
    where
        F: FnOnce(Completion<T>) + Send + 'static,
    {
        match self.peek() {
            Some(result) => listener(result),
            None => {
                let shared = self.shared.clone();
                tokio::spawn(async move { listener(shared.await) });
            }
        }
    }

    /// The result, if the future has completed.
    pub fn peek(&self) -> Option<Completion<T>> {
        self.shared.clone().now_or_never()
    }

    pub fn is_done(&self) -> bool {
        self.peek().is_some()
    }

    /// Cancel the request. Idempotent.
    ///
    /// The future resolves to [`ResponseError::Cancelled`] unless it had
    /// already completed, and the work producing it is stopped.
    pub fn cancel(&self) {
        self.cancel.abort();
        if let Some(upstream) = &self.upstream {
            upstream.abort();
        }
    }

    /// Block the current thread until the future completes.
    ///
    /// Must not be called from within an async task; use `.await` there.
    pub fn join(&self) -> Completion<T> {
        futures::executor::block_on(self.shared.clone())
    }
}

impl<T> Future for ResponseFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Completion<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.shared).poll(cx)
    }
}

/// Write side of a [`ResponseFuture`].
///
/// Dropping it without completing resolves the future as cancelled.
pub struct ResponseCompleter<T> {
    tx: oneshot::Sender<Completion<T>>,
}

impl<T> fmt::Debug for ResponseCompleter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCompleter").field("cancelled", &self.tx.is_canceled()).finish()
    }
}

impl<T> ResponseCompleter<T> {
    pub fn complete(self, result: Completion<T>) {
        // The reader may be gone; nothing to do then.
        let _ = self.tx.send(result);
    }

    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(self, cause: Cause) {
        self.complete(Err(ResponseError::Failed(cause)));
    }

    /// True once every reader has gone away.
    pub fn is_cancelled(&self) -> bool {
        self.tx.is_canceled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::cause;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[tokio::test]
    async fn completes_once_for_every_clone() {
        let (completer, future) = ResponseFuture::<u32>::pending();
        let other = future.clone();
        assert!(!future.is_done());
        completer.succeed(7);
        assert_eq!(future.await.unwrap(), 7);
        assert_eq!(other.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn transform_failure_does_not_touch_source() {
        let source = ResponseFuture::ok(5u32);
        let derived = source.transform::<u32, _>(|_| Err(cause(TestError("bad value"))));
        let err = derived.await.unwrap_err();
        assert_eq!(err.downcast_ref::<TestError>().unwrap().0, "bad value");
        assert_eq!(source.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn transform_passes_original_cause_through() {
        let original = cause(TestError("root"));
        let source = ResponseFuture::<u32>::failed(original.clone());
        let derived = source.transform(|n| Ok(n + 1)).transform(|n| Ok(n * 2));
        let err = derived.await.unwrap_err();
        assert!(Arc::ptr_eq(err.cause().unwrap(), &original));
    }

    #[tokio::test]
    async fn dropped_completer_cancels() {
        let (completer, future) = ResponseFuture::<u32>::pending();
        drop(completer);
        assert!(future.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_sticks() {
        let (completer, future) = ResponseFuture::<u32>::pending();
        future.cancel();
        future.cancel();
        completer.succeed(1);
        assert!(future.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn cancel_after_completion_keeps_value() {
        let future = ResponseFuture::ok(3u32);
        assert_eq!(future.peek().unwrap().unwrap(), 3);
        future.cancel();
        assert_eq!(future.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn listener_runs_inline_when_done() {
        let future = ResponseFuture::ok(1u32);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        future.on_complete(move |result| {
            assert_eq!(result.unwrap(), 1);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listener_runs_after_completion() {
        let (completer, future) = ResponseFuture::<u32>::pending();
        let (tx, rx) = tokio::sync::oneshot::channel();
        future.on_complete(move |result| {
            let _ = tx.send(result.is_ok());
        });
        completer.succeed(9);
        assert!(rx.await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn join_surfaces_cause() {
        let original = cause(TestError("join"));
        let future = ResponseFuture::<u32>::failed(original.clone());
        let err = tokio::task::spawn_blocking(move || future.join()).await.unwrap().unwrap_err();
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.downcast_ref::<TestError>().is_some());
        assert!(Arc::ptr_eq(err.cause().unwrap(), &original));
    }
}
