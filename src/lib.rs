#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # redial
//!
//! A client-side request pipeline for async Rust: composable decorators around
//! a transport, rule-driven retries, and an asynchronous per-attempt request
//! log that independent observers can subscribe to.
//!
//! ## Features
//!
//! - **Decorator pipeline** built on `tower`; the first decorator declared is
//!   innermost, and a decorator failure looks like a transport failure
//! - **Retry rules** composed from conditions on the cause, status, headers,
//!   trailers, response content and elapsed time, each mapped to a [`Backoff`]
//! - **Retry limiters** that see every attempt of a client and can hold back
//!   retries, such as the token bucket [`RetryBudget`]
//! - **Request log** per attempt, with properties that become available one by
//!   one and can be awaited or observed with callbacks
//! - **Response futures** that can be shared, transformed, joined and cancelled,
//!   always surfacing the original cause
//! - **Telemetry** events through `tower::Service` sinks and `tracing`
//!
//! ## Quick Start
//!
//! ```rust
//! use redial::{Backoff, Client, Request, Response, RetryRule};
//! use redial::transport::transport_fn;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = transport_fn(|_request| async { Ok(Response::ok()) });
//!     let rule = RetryRule::builder()
//!         .on_server_error_status()
//!         .on_exception()
//!         .then_backoff(Backoff::exponential(Duration::from_millis(50)).with_max_attempts(4))
//!         .unwrap();
//!
//!     let client = Client::builder(transport)
//!         .retry_rule(rule)
//!         .attempt_timeout(Duration::from_secs(2))
//!         .build()
//!         .unwrap();
//!
//!     let response = client
//!         .send(Request::get(http::Uri::from_static("http://svc/items")))
//!         .await
//!         .unwrap();
//!     assert!(response.status().is_success());
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod future;
pub mod jitter;
pub mod limiter;
pub mod log;
pub mod message;
pub mod pipeline;
pub mod prelude;
pub mod retry;
pub mod rule;
pub mod sleeper;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use backoff::{Backoff, BackoffError, MAX_BACKOFF};
pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use context::{RequestContext, Session};
pub use error::{cause, AttemptCancelled, BuildError, Cause, ResponseError, TimeoutError};
pub use future::{ResponseCompleter, ResponseFuture};
pub use jitter::Jitter;
pub use limiter::{BudgetError, RetryBudget, RetryLimiter};
pub use log::{LogProperty, PropertyValue, RequestLog, RequestLogBuilder};
pub use message::{Request, RequestHead, Response, ResponseHead};
pub use pipeline::{BoxSender, Decorator, Next};
pub use retry::{Decision, RetryEngine, SessionState};
pub use rule::{RetryDecision, RetryPredicate, RetryRule, RetryRuleBuilder};
pub use sleeper::{GateSleeper, InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{ClientEvent, LogSink, MemorySink, NullSink, TelemetrySink};
pub use transport::{transport_fn, Transport, TransportSender};
