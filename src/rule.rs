//! Retry rules: when to retry an attempt and with which backoff.
//!
//! A [`RetryRule`] is an ordered list of predicates over the attempt's context
//! and its failure cause (if any). Each predicate answers
//! [`RetryDecision::Retry`], [`RetryDecision::NoRetry`], or
//! [`RetryDecision::Next`] ("not applicable"). The first definite answer wins;
//! if every predicate answers `Next`, the attempt is not retried.
//!
//! Rules built with [`RetryRule::builder`] OR their conditions together. An
//! optional method filter ([`RetryRule::builder_for`]) is AND-ed in front.
//! Within one builder rule the conditions are checked in a fixed order:
//! exception, response status and headers, response content, response
//! trailers, total duration. Content conditions see the [`Response`] the
//! pipeline returned for the attempt, body included; they never match a
//! failed attempt.
//! Trailer conditions wait for the attempt's log to reach `ResponseTrailers`
//! (or complete without it), so evaluating a rule may suspend.
//!
//! ```rust
//! use redial::{Backoff, RetryRule};
//! use std::time::Duration;
//!
//! let rule = RetryRule::builder()
//!     .on_server_error_status()
//!     .on_exception()
//!     .then_backoff(Backoff::fixed(Duration::from_millis(100)))
//!     .unwrap()
//!     .or_else(
//!         RetryRule::builder()
//!             .on_status([http::StatusCode::TOO_MANY_REQUESTS])
//!             .then_default_backoff()
//!             .unwrap(),
//!     );
//! ```

use crate::backoff::Backoff;
use crate::context::RequestContext;
use crate::error::{BuildError, Cause, TimeoutError};
use crate::log::LogProperty;
use crate::message::{Response, ResponseHead};
use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Methods that may be retried safely by default.
pub const IDEMPOTENT_METHODS: [Method; 6] =
    [Method::GET, Method::HEAD, Method::PUT, Method::DELETE, Method::OPTIONS, Method::TRACE];

/// Answer of a single predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry, using this backoff for the delay.
    Retry(Backoff),
    /// Stop here and surface the current outcome.
    NoRetry,
    /// Not applicable; ask the next predicate.
    Next,
}

impl RetryDecision {
    pub fn retry(backoff: Backoff) -> Self {
        RetryDecision::Retry(backoff)
    }

    /// True for `Retry` and `NoRetry`.
    pub fn is_definite(&self) -> bool {
        !matches!(self, RetryDecision::Next)
    }

    pub fn backoff(&self) -> Option<&Backoff> {
        match self {
            RetryDecision::Retry(backoff) => Some(backoff),
            _ => None,
        }
    }
}

/// A single retry predicate.
///
/// Returning `Err` aborts the logical request with that cause.
#[async_trait]
pub trait RetryPredicate: Send + Sync + 'static {
    async fn should_retry(
        &self,
        ctx: &RequestContext,
        cause: Option<&Cause>,
    ) -> Result<RetryDecision, Cause>;
}

struct FnPredicate<F>(F);

#[async_trait]
impl<F> RetryPredicate for FnPredicate<F>
where
    F: Fn(&RequestContext, Option<&Cause>) -> RetryDecision + Send + Sync + 'static,
{
    async fn should_retry(
        &self,
        ctx: &RequestContext,
        cause: Option<&Cause>,
    ) -> Result<RetryDecision, Cause> {
        Ok((self.0)(ctx, cause))
    }
}

/// Ordered, first-match-wins set of retry predicates.
#[derive(Clone, Default)]
pub struct RetryRule {
    predicates: Vec<Arc<dyn RetryPredicate>>,
}

impl fmt::Debug for RetryRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryRule").field("predicates", &self.predicates.len()).finish()
    }
}

impl RetryRule {
    /// Builder for a rule applying to every method.
    pub fn builder() -> RetryRuleBuilder {
        RetryRuleBuilder::new(None)
    }

    /// Builder for a rule applying only to the given methods.
    pub fn builder_for<I>(methods: I) -> RetryRuleBuilder
    where
        I: IntoIterator<Item = Method>,
    {
        RetryRuleBuilder::new(Some(methods.into_iter().collect()))
    }

    /// Concatenate rules; earlier rules take precedence.
    pub fn of<I>(rules: I) -> Self
    where
        I: IntoIterator<Item = RetryRule>,
    {
        let predicates = rules.into_iter().flat_map(|rule| rule.predicates).collect();
        Self { predicates }
    }

    /// Consult `other` when this rule has no definite answer.
    pub fn or_else(mut self, other: RetryRule) -> Self {
        self.predicates.extend(other.predicates);
        self
    }

    /// Retry on any failure with the default backoff.
    pub fn on_exception() -> Self {
        Self::on_exception_with(Backoff::default())
    }

    /// Retry on any failure with `backoff`.
    pub fn on_exception_with(backoff: Backoff) -> Self {
        Self::builder().on_exception().finish(RetryDecision::Retry(backoff))
    }

    /// Retry with the default backoff when `filter` accepts the attempt's response.
    pub fn on_response<F>(filter: F) -> Self
    where
        F: Fn(&RequestContext, &Response) -> bool + Send + Sync + 'static,
    {
        Self::builder().on_response(filter).finish(RetryDecision::Retry(Backoff::default()))
    }

    /// Retry on `5xx` responses and on any failure, with the default backoff.
    pub fn failsafe() -> Self {
        Self::builder()
            .on_server_error_status()
            .on_exception()
            .finish(RetryDecision::Retry(Backoff::default()))
    }

    /// Rule from a synchronous function.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&RequestContext, Option<&Cause>) -> RetryDecision + Send + Sync + 'static,
    {
        Self::from_predicate(FnPredicate(f))
    }

    /// Rule from a custom (possibly asynchronous) predicate.
    pub fn from_predicate<P>(predicate: P) -> Self
    where
        P: RetryPredicate,
    {
        Self { predicates: vec![Arc::new(predicate)] }
    }

    /// Evaluate predicates in order. Defaults to [`RetryDecision::NoRetry`].
    pub async fn should_retry(
        &self,
        ctx: &RequestContext,
        cause: Option<&Cause>,
    ) -> Result<RetryDecision, Cause> {
        for predicate in &self.predicates {
            let decision = predicate.should_retry(ctx, cause).await?;
            if decision.is_definite() {
                return Ok(decision);
            }
        }
        Ok(RetryDecision::NoRetry)
    }
}

type ExceptionFilter = Arc<dyn Fn(&Cause) -> bool + Send + Sync>;
type HeadFilter = Arc<dyn Fn(&ResponseHead) -> bool + Send + Sync>;
type ResponseFilter = Arc<dyn Fn(&RequestContext, &Response) -> bool + Send + Sync>;
type TrailersFilter = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;
type DurationFilter = Arc<dyn Fn(Duration) -> bool + Send + Sync>;

/// Fluent builder of a single OR-combined retry condition.
#[derive(Clone, Default)]
pub struct RetryRuleBuilder {
    methods: Option<Vec<Method>>,
    exception: Vec<ExceptionFilter>,
    head: Vec<HeadFilter>,
    response: Vec<ResponseFilter>,
    trailers: Vec<TrailersFilter>,
    total_duration: Vec<DurationFilter>,
}

impl fmt::Debug for RetryRuleBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryRuleBuilder")
            .field("methods", &self.methods)
            .field("exception", &self.exception.len())
            .field("head", &self.head.len())
            .field("response", &self.response.len())
            .field("trailers", &self.trailers.len())
            .field("total_duration", &self.total_duration.len())
            .finish()
    }
}

impl RetryRuleBuilder {
    fn new(methods: Option<Vec<Method>>) -> Self {
        Self { methods, ..Self::default() }
    }

    /// Match any failure.
    pub fn on_exception(mut self) -> Self {
        self.exception.push(Arc::new(|_: &Cause| true));
        self
    }

    /// Match failures whose cause is an `E`, directly or anywhere in its
    /// `source` chain.
    pub fn on_exception_type<E>(mut self) -> Self
    where
        E: StdError + 'static,
    {
        self.exception.push(Arc::new(|cause: &Cause| find_cause::<E>(&**cause).is_some()));
        self
    }

    /// Match failures accepted by `filter`.
    pub fn on_exception_where<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Cause) -> bool + Send + Sync + 'static,
    {
        self.exception.push(Arc::new(filter));
        self
    }

    /// Match attempts that exceeded the per-attempt timeout.
    pub fn on_attempt_timeout(self) -> Self {
        self.on_exception_where(|cause| {
            matches!(find_cause::<TimeoutError>(&**cause), Some(TimeoutError::Attempt(_)))
        })
    }

    /// Match any of the given statuses.
    pub fn on_status<I>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = StatusCode>,
    {
        let statuses: Vec<StatusCode> = statuses.into_iter().collect();
        self.head.push(Arc::new(move |head: &ResponseHead| statuses.contains(&head.status)));
        self
    }

    /// Match statuses accepted by `filter`.
    pub fn on_status_where<F>(mut self, filter: F) -> Self
    where
        F: Fn(StatusCode) -> bool + Send + Sync + 'static,
    {
        self.head.push(Arc::new(move |head: &ResponseHead| filter(head.status)));
        self
    }

    /// Match `5xx` statuses.
    pub fn on_server_error_status(self) -> Self {
        self.on_status_where(|status| status.is_server_error())
    }

    /// Match `4xx` statuses.
    pub fn on_client_error_status(self) -> Self {
        self.on_status_where(|status| status.is_client_error())
    }

    /// Match response heads accepted by `filter`.
    pub fn on_response_headers<F>(mut self, filter: F) -> Self
    where
        F: Fn(&ResponseHead) -> bool + Send + Sync + 'static,
    {
        self.head.push(Arc::new(filter));
        self
    }

    /// Match responses accepted by `filter`, which may inspect the body.
    pub fn on_response<F>(mut self, filter: F) -> Self
    where
        F: Fn(&RequestContext, &Response) -> bool + Send + Sync + 'static,
    {
        self.response.push(Arc::new(filter));
        self
    }

    /// Match response trailers accepted by `filter`.
    ///
    /// Waits for trailers to become available on the attempt's log.
    pub fn on_response_trailers<F>(mut self, filter: F) -> Self
    where
        F: Fn(&HeaderMap) -> bool + Send + Sync + 'static,
    {
        self.trailers.push(Arc::new(filter));
        self
    }

    /// Match when the time since the logical request started is accepted by `filter`.
    pub fn on_total_duration<F>(mut self, filter: F) -> Self
    where
        F: Fn(Duration) -> bool + Send + Sync + 'static,
    {
        self.total_duration.push(Arc::new(filter));
        self
    }

    fn has_conditions(&self) -> bool {
        !(self.exception.is_empty()
            && self.head.is_empty()
            && self.response.is_empty()
            && self.trailers.is_empty()
            && self.total_duration.is_empty())
    }

    /// Retry with `backoff` when any condition matches.
    pub fn then_backoff(self, backoff: Backoff) -> Result<RetryRule, BuildError> {
        if !self.has_conditions() {
            return Err(BuildError::EmptyRule);
        }
        Ok(self.finish(RetryDecision::Retry(backoff)))
    }

    /// Retry with [`Backoff::default`] when any condition matches.
    pub fn then_default_backoff(self) -> Result<RetryRule, BuildError> {
        self.then_backoff(Backoff::default())
    }

    /// Stop retrying when any condition matches. Without conditions, stops for
    /// every request passing the method filter.
    pub fn then_no_retry(self) -> RetryRule {
        self.finish(RetryDecision::NoRetry)
    }

    fn finish(self, decision: RetryDecision) -> RetryRule {
        RetryRule::from_predicate(BuiltRule { conditions: self, decision })
    }
}

struct BuiltRule {
    conditions: RetryRuleBuilder,
    decision: RetryDecision,
}

impl BuiltRule {
    async fn matches(&self, ctx: &RequestContext, cause: Option<&Cause>) -> bool {
        let c = &self.conditions;
        if !c.has_conditions() {
            return true;
        }
        if let Some(cause) = cause {
            if c.exception.iter().any(|filter| filter(cause)) {
                return true;
            }
        }
        if !c.head.is_empty() {
            let log = ctx.log();
            if let Some(head) = log.response_headers() {
                if c.head.iter().any(|filter| filter(head)) {
                    return true;
                }
            }
        }
        if let Some(response) = ctx.response() {
            if c.response.iter().any(|filter| filter(ctx, response)) {
                return true;
            }
        }
        if !c.trailers.is_empty() {
            if let Some(log) = ctx.log().when_available(LogProperty::ResponseTrailers).await {
                if let Some(trailers) = log.response_trailers() {
                    if c.trailers.iter().any(|filter| filter(trailers)) {
                        return true;
                    }
                }
            }
        }
        if !c.total_duration.is_empty() {
            let elapsed = ctx.session().elapsed();
            if c.total_duration.iter().any(|filter| filter(elapsed)) {
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl RetryPredicate for BuiltRule {
    async fn should_retry(
        &self,
        ctx: &RequestContext,
        cause: Option<&Cause>,
    ) -> Result<RetryDecision, Cause> {
        if let Some(methods) = &self.conditions.methods {
            if !methods.contains(ctx.request().method()) {
                return Ok(RetryDecision::Next);
            }
        }
        if self.matches(ctx, cause).await {
            Ok(self.decision.clone())
        } else {
            Ok(RetryDecision::Next)
        }
    }
}

// Walks the `source` chain; `ResponseError` exposes its cause there.
fn find_cause<'a, E>(mut error: &'a (dyn StdError + 'static)) -> Option<&'a E>
where
    E: StdError + 'static,
{
    loop {
        if let Some(found) = error.downcast_ref::<E>() {
            return Some(found);
        }
        error = error.source()?;
    }
}
