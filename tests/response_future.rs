mod common;

use common::test_helpers::{get, AnticipatedError, ScriptedTransport};
use http::StatusCode;
use redial::{cause, Cause, Client, LogProperty, Response, ResponseError, ResponseFuture};
use std::error::Error as _;
use std::sync::{Arc, Mutex};

#[test]
fn join_surfaces_the_original_cause_through_transform() {
    let (completer, future) = ResponseFuture::<Response>::pending();
    let statuses = future.transform(|response| Ok(response.status()));
    let original = cause(AnticipatedError(7));
    let sent = original.clone();

    let writer = std::thread::spawn(move || completer.fail(sent));
    let err = statuses.join().unwrap_err();
    writer.join().unwrap();

    assert!(Arc::ptr_eq(err.cause().unwrap(), &original));
    let source = err.source().unwrap();
    assert_eq!(source.downcast_ref::<AnticipatedError>(), Some(&AnticipatedError(7)));
}

#[test]
fn failing_transform_only_fails_the_derived_future() {
    let future = ResponseFuture::ok(Response::ok());
    let rejected = future.transform(|_| -> Result<StatusCode, Cause> {
        Err(cause(AnticipatedError(1)))
    });

    assert!(matches!(rejected.join(), Err(ResponseError::Failed(_))));
    assert_eq!(future.join().unwrap().status(), StatusCode::OK);
}

#[test]
fn cancelling_a_derived_future_leaves_the_source_alone() {
    let (completer, future) = ResponseFuture::<Response>::pending();
    let derived = future.transform(|response| Ok(response.status()));
    derived.cancel();
    completer.succeed(Response::ok());

    assert!(derived.join().unwrap_err().is_cancelled());
    assert_eq!(future.join().unwrap().status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_failure_keeps_identity_across_join() {
    let transport = ScriptedTransport::new(|n| Err(cause(AnticipatedError(n))));
    let logged: Arc<Mutex<Option<Cause>>> = Arc::new(Mutex::new(None));
    let slot = logged.clone();
    let client = Client::builder(transport)
        .decorator_fn(move |next, ctx| {
            let slot = slot.clone();
            ctx.log().on_available(LogProperty::ResponseCause, move |log| {
                *slot.lock().unwrap() = log.response_cause().cloned();
            });
            next.send(ctx)
        })
        .build()
        .unwrap();

    let statuses = client.send(get("http://svc/items")).transform(|r| Ok(r.status()));
    let err = tokio::task::spawn_blocking(move || statuses.join()).await.unwrap().unwrap_err();

    let logged = logged.lock().unwrap().clone().unwrap();
    assert!(Arc::ptr_eq(err.cause().unwrap(), &logged));
}

#[tokio::test]
async fn listeners_see_the_completion() {
    let client = Client::builder(ScriptedTransport::always(Response::new(StatusCode::ACCEPTED)))
        .build()
        .unwrap();
    let future = client.send(get("http://svc/items"));
    let (tx, rx) = tokio::sync::oneshot::channel();
    future.on_complete(move |result| {
        let _ = tx.send(result.map(|response| response.status()));
    });

    assert_eq!(rx.await.unwrap().unwrap(), StatusCode::ACCEPTED);
    assert!(future.is_done());
    assert_eq!(future.peek().unwrap().unwrap().status(), StatusCode::ACCEPTED);
}
