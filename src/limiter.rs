//! Retry limiters: a client-wide veto over retries the rule asked for.
//!
//! A [`RetryRule`](crate::RetryRule) judges one attempt in isolation. A
//! [`RetryLimiter`] sees every attempt of every request sent by a client, so
//! it can hold retries back when the upstream is failing across the board.
//!
//! The client calls [`RetryLimiter::on_completed_attempt`] once for every
//! finished attempt, and [`RetryLimiter::should_retry`] only when the rule
//! wants a retry and the attempt and time limits still allow one. A `false`
//! answer ends the request with the current attempt's outcome.
//!
//! [`RetryBudget`] is a token bucket limiter: failed attempts drain it,
//! successful ones refill it, and retries are allowed while more than half of
//! the bucket remains.
//!
//! ```rust
//! use redial::limiter::{RetryBudget, RetryLimiter};
//! use redial::{Request, RequestContext};
//!
//! let budget = RetryBudget::new(4.0, 0.5).unwrap();
//! let ctx = RequestContext::new(Request::get(http::Uri::from_static("http://svc/")));
//! assert!(budget.should_retry(&ctx, 1));
//! ```

use crate::context::RequestContext;
use crate::log::RequestLog;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Client-wide gate on retries.
pub trait RetryLimiter: Send + Sync + 'static {
    /// Whether attempt `attempt` of `ctx`'s request may be followed by a retry.
    fn should_retry(&self, ctx: &RequestContext, attempt: u32) -> bool;

    /// Called once per attempt after its log is complete.
    fn on_completed_attempt(&self, ctx: &RequestContext, log: &RequestLog, attempt: u32) {
        let _ = (ctx, log, attempt);
    }
}

impl<L: RetryLimiter + ?Sized> RetryLimiter for Arc<L> {
    fn should_retry(&self, ctx: &RequestContext, attempt: u32) -> bool {
        (**self).should_retry(ctx, attempt)
    }

    fn on_completed_attempt(&self, ctx: &RequestContext, log: &RequestLog, attempt: u32) {
        (**self).on_completed_attempt(ctx, log, attempt)
    }
}

/// Invalid [`RetryBudget`] parameters.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum BudgetError {
    #[error("max_tokens must be positive and finite (got {0})")]
    InvalidMaxTokens(f64),
    #[error("token_ratio must be positive and finite (got {0})")]
    InvalidTokenRatio(f64),
}

/// Token bucket shared by all requests of a client.
///
/// - Starts full with `max_tokens`.
/// - A failed attempt (a recorded cause or a `5xx` status) takes one token.
/// - Any other attempt returns `token_ratio` tokens, up to `max_tokens`.
/// - Retries are allowed while the bucket holds more than `max_tokens / 2`.
pub struct RetryBudget {
    max_tokens: f64,
    token_ratio: f64,
    tokens: Mutex<f64>,
}

impl fmt::Debug for RetryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryBudget")
            .field("max_tokens", &self.max_tokens)
            .field("token_ratio", &self.token_ratio)
            .field("tokens", &self.tokens())
            .finish()
    }
}

impl RetryBudget {
    pub fn new(max_tokens: f64, token_ratio: f64) -> Result<Self, BudgetError> {
        if !(max_tokens.is_finite() && max_tokens > 0.0) {
            return Err(BudgetError::InvalidMaxTokens(max_tokens));
        }
        if !(token_ratio.is_finite() && token_ratio > 0.0) {
            return Err(BudgetError::InvalidTokenRatio(token_ratio));
        }
        Ok(Self { max_tokens, token_ratio, tokens: Mutex::new(max_tokens) })
    }

    /// Tokens currently in the bucket.
    pub fn tokens(&self) -> f64 {
        *self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, failed: bool) {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        *tokens = if failed {
            (*tokens - 1.0).max(0.0)
        } else {
            (*tokens + self.token_ratio).min(self.max_tokens)
        };
    }
}

impl RetryLimiter for RetryBudget {
    fn should_retry(&self, _ctx: &RequestContext, attempt: u32) -> bool {
        let allowed = self.tokens() > self.max_tokens / 2.0;
        if !allowed {
            tracing::debug!(attempt, tokens = self.tokens(), "retry budget exhausted");
        }
        allowed
    }

    fn on_completed_attempt(&self, _ctx: &RequestContext, log: &RequestLog, _attempt: u32) {
        let failed = log.response_cause().is_some()
            || log.response_headers().is_some_and(|head| head.status.is_server_error());
        self.record(failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::cause;
    use crate::message::{Request, ResponseHead};
    use http::{StatusCode, Uri};

    #[derive(Debug, thiserror::Error)]
    #[error("reset")]
    struct Reset;

    fn finished(status: Option<StatusCode>) -> RequestContext {
        let ctx = RequestContext::new(Request::get(Uri::from_static("http://svc/")));
        let log = ctx.log_builder();
        log.start_request();
        match status {
            Some(status) => {
                log.response_headers(ResponseHead::new(status));
                log.end_response(None);
            }
            None => log.end_response(Some(cause(Reset))),
        }
        ctx
    }

    fn complete(budget: &RetryBudget, ctx: &RequestContext) {
        budget.on_completed_attempt(ctx, &ctx.log(), ctx.attempt());
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert_eq!(RetryBudget::new(0.0, 0.1).unwrap_err(), BudgetError::InvalidMaxTokens(0.0));
        assert!(RetryBudget::new(10.0, f64::NAN).is_err());
    }

    #[test]
    fn failures_drain_until_retries_stop() {
        let budget = RetryBudget::new(4.0, 0.5).unwrap();
        let failed = finished(Some(StatusCode::SERVICE_UNAVAILABLE));
        complete(&budget, &failed);
        assert!(budget.should_retry(&failed, 1));
        complete(&budget, &finished(None));
        assert_eq!(budget.tokens(), 2.0);
        assert!(!budget.should_retry(&failed, 2));
    }

    #[test]
    fn successes_refill_up_to_the_cap() {
        let budget = RetryBudget::new(4.0, 0.5).unwrap();
        for _ in 0..3 {
            complete(&budget, &finished(None));
        }
        assert!(!budget.should_retry(&finished(None), 1));

        complete(&budget, &finished(Some(StatusCode::OK)));
        assert_eq!(budget.tokens(), 1.5);
        for _ in 0..10 {
            complete(&budget, &finished(Some(StatusCode::NOT_FOUND)));
        }
        assert_eq!(budget.tokens(), 4.0);
    }
}
