//! Retry decision engine
//!
//! Turns the outcome of one attempt into "retry after a delay" or "stop".
//!
//! Semantics:
//! - The [`RetryRule`] is consulted first; a rule that fails stops the request
//!   with the rule's own cause.
//! - `max_total_attempts` counts total attempts (initial try + retries) across
//!   every backoff the rule hands out.
//! - Each backoff keeps its own attempt counter; the counter restarts at 1
//!   whenever the decided backoff differs from the previous one.
//! - A backoff reporting `None` ends the request regardless of the rule.
//! - With `use_retry_after`, a numeric `Retry-After` header on the attempt's
//!   response raises the delay to at least that many seconds, capped at
//!   [`MAX_BACKOFF`].
//! - A delay that would end past the response deadline ends the request.
//! - A [`RetryLimiter`] hears about every attempt and has the last word on
//!   retries that passed every other check.
//!
//! Invariants:
//! - Attempts never exceed `max_total_attempts`.
//! - On stop, the surfaced outcome is the current attempt's outcome, unchanged.

use crate::backoff::{Backoff, MAX_BACKOFF};
use crate::context::RequestContext;
use crate::error::Cause;
use crate::limiter::RetryLimiter;
use crate::message::Response;
use crate::rule::{RetryDecision, RetryRule};
use http::HeaderMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// What the client should do after an attempt.
#[derive(Debug)]
pub enum Decision {
    /// Wait `delay`, then start another attempt.
    Retry { delay: Duration },
    /// The rule declined to retry (or failed); surface this outcome.
    Stop(Result<Response, Cause>),
    /// The rule wanted to retry but attempts or time ran out; surface this outcome.
    Exhausted(Result<Response, Cause>),
}

/// Mutable state of one logical request, owned by the client's driver.
#[derive(Debug)]
pub struct SessionState {
    deadline: Option<Instant>,
    total_attempts: u32,
    last_backoff: Option<Backoff>,
    attempts_with_backoff: u32,
    total_backoff: Duration,
}

impl SessionState {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self {
            deadline,
            total_attempts: 0,
            last_backoff: None,
            attempts_with_backoff: 0,
            total_backoff: Duration::ZERO,
        }
    }

    /// Record the start of an attempt.
    pub fn begin_attempt(&mut self) -> u32 {
        self.total_attempts += 1;
        self.total_attempts
    }

    pub fn total_attempts(&self) -> u32 {
        self.total_attempts
    }

    pub fn total_backoff(&self) -> Duration {
        self.total_backoff
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    // Attempts made so far with `backoff`, restarting when the backoff changes.
    fn attempts_with(&mut self, backoff: &Backoff) -> u32 {
        if self.last_backoff.as_ref() != Some(backoff) {
            self.last_backoff = Some(backoff.clone());
            self.attempts_with_backoff = 0;
        }
        self.attempts_with_backoff += 1;
        self.attempts_with_backoff
    }
}

/// Decides, attempt by attempt, whether a logical request continues.
#[derive(Clone)]
pub struct RetryEngine {
    rule: RetryRule,
    max_total_attempts: u32,
    use_retry_after: bool,
    limiter: Option<Arc<dyn RetryLimiter>>,
}

impl fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryEngine")
            .field("rule", &self.rule)
            .field("max_total_attempts", &self.max_total_attempts)
            .field("use_retry_after", &self.use_retry_after)
            .field("limiter", &self.limiter.is_some())
            .finish()
    }
}

impl RetryEngine {
    pub fn new(rule: RetryRule, max_total_attempts: u32, use_retry_after: bool) -> Self {
        Self { rule, max_total_attempts, use_retry_after, limiter: None }
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn RetryLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn rule(&self) -> &RetryRule {
        &self.rule
    }

    pub fn max_total_attempts(&self) -> u32 {
        self.max_total_attempts
    }

    /// Decide what follows the attempt `ctx` that produced `outcome`.
    ///
    /// May suspend while the rule waits on the attempt's log.
    pub async fn decide(
        &self,
        ctx: &RequestContext,
        outcome: Result<Response, Cause>,
        state: &mut SessionState,
    ) -> Decision {
        if let Some(limiter) = &self.limiter {
            limiter.on_completed_attempt(ctx, &ctx.log(), ctx.attempt());
        }

        let decision = match self.rule.should_retry(ctx, outcome.as_ref().err()).await {
            Ok(decision) => decision,
            Err(rule_failure) => {
                tracing::debug!(attempt = ctx.attempt(), error = %rule_failure, "retry rule failed");
                return Decision::Stop(Err(rule_failure));
            }
        };
        let backoff = match decision {
            RetryDecision::Retry(backoff) => backoff,
            RetryDecision::NoRetry | RetryDecision::Next => return Decision::Stop(outcome),
        };

        if state.total_attempts >= self.max_total_attempts {
            tracing::debug!(
                max_total_attempts = self.max_total_attempts,
                "exceeded the default number of max attempts"
            );
            return Decision::Exhausted(outcome);
        }

        let attempts = state.attempts_with(&backoff);
        let Some(mut delay) = backoff.next_delay(attempts) else {
            tracing::debug!(attempts, "exceeded the number of max attempts in the backoff");
            return Decision::Exhausted(outcome);
        };

        if self.use_retry_after {
            let log = ctx.log();
            if let Some(hinted) = log.response_headers().and_then(|head| retry_after(&head.headers)) {
                delay = delay.max(hinted);
            }
        }

        if let Some(deadline) = state.deadline {
            // Unrepresentable instants lie past any deadline.
            let past_deadline = match Instant::now().checked_add(delay) {
                Some(at) => at >= deadline,
                None => true,
            };
            if past_deadline {
                tracing::debug!(?delay, "next attempt would start after the response deadline");
                return Decision::Exhausted(outcome);
            }
        }

        if let Some(limiter) = &self.limiter {
            if !limiter.should_retry(ctx, ctx.attempt()) {
                tracing::debug!(attempt = ctx.attempt(), "retry limiter declined the retry");
                return Decision::Stop(outcome);
            }
        }

        state.total_backoff = state.total_backoff.saturating_add(delay);
        ctx.session().add_backoff(delay);
        Decision::Retry { delay }
    }
}

/// Parse a `Retry-After` header given in delta-seconds, capped at [`MAX_BACKOFF`].
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(|secs| Duration::from_secs(secs).min(MAX_BACKOFF))
}
