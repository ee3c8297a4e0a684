//! A flaky service behind a retrying client, with per-attempt logging.
use redial::prelude::*;
use redial::telemetry::LogSink;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("connection reset by peer")]
struct ConnectionReset;

#[tokio::main]
async fn main() -> Result<(), ResponseError> {
    tracing_subscriber::fmt().with_env_filter("info,redial=debug").init();

    // Fails, then answers 503, then succeeds.
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let transport = transport_fn(move |_request| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            match n {
                1 => Err(cause(ConnectionReset)),
                2 => Ok(Response::new(http::StatusCode::SERVICE_UNAVAILABLE)),
                _ => Ok(Response::ok().with_body("hello from redial")),
            }
        }
    });

    let rule = RetryRule::builder()
        .on_exception_type::<ConnectionReset>()
        .on_server_error_status()
        .then_backoff(
            Backoff::exponential(Duration::from_millis(100))
                .with_max(Duration::from_secs(1))
                .expect("valid backoff cap")
                .with_jitter(Jitter::full())
                .with_max_attempts(5),
        )
        .expect("rule has conditions");

    let client = Client::builder(transport)
        .decorator(logging_decorator())
        .retry_rule(rule)
        .attempt_timeout(Duration::from_secs(2))
        .response_timeout(Duration::from_secs(10))
        .retry_count_header(true)
        .telemetry(LogSink)
        .build()
        .expect("valid client configuration");

    let response = client.send(Request::get(http::Uri::from_static("http://svc/greeting"))).await?;
    println!(
        "{} after {} attempts: {}",
        response.status(),
        calls.load(Ordering::SeqCst),
        String::from_utf8_lossy(response.body())
    );
    Ok(())
}
