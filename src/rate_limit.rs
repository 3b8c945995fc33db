//! Rate limiting primitives.
//!
//! This module provides the building blocks for admission control:
//! - [`Limiter`]: The core trait every strategy implements.
//! - [`Admission`]: Closure-style interceptor around a single limiter.
//! - [`AdmissionLayer`]: Tower middleware that enforces a limiter.
//! - [`Decision`]: The result of an admission check (Admit/Reject).
//!
//! # Architecture
//!
//! - **Middleware**: `AdmissionLayer` wraps your service. It doesn't know *how* limiting
//!   works, only that it should ask a `Limiter` before calling the inner service and tell
//!   it when an admitted request is done.
//! - **Logic**: The strategies in [`strategies`] (concurrency, fixed window, sliding
//!   window, token bucket, leaky bucket) each own their state exclusively.
//! - **Storage**: [`store::WindowStore`] holds sliding-window state, in memory or in Redis.

use crate::context::AdmitContext;
use crate::error::AdmissionError;
use crate::telemetry;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub mod middleware;
pub(crate) mod refill;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;
pub mod strategies;
pub use middleware::{AdmissionLayer, AdmissionService, ContextExtractor, DefaultContext};

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Too many requests in flight.
    ConcurrencyLimit,
    /// The current fixed window's quota is used up.
    WindowExhausted,
    /// The sliding window for the key is full.
    SlidingWindowExhausted,
    /// The leaky bucket has no water to drain.
    BucketEmpty,
    /// The token bucket has no tokens.
    TokensExhausted,
    /// The store backing the limiter could not be consulted (fail-closed).
    BackendUnavailable,
    /// The caller's cancellation token had already fired.
    Cancelled,
    /// The caller's deadline had already passed.
    DeadlineExceeded,
    /// The limiter has been shut down.
    ShutDown,
}

impl RejectReason {
    /// Stable snake_case name, used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::ConcurrencyLimit => "concurrency_limit",
            RejectReason::WindowExhausted => "window_exhausted",
            RejectReason::SlidingWindowExhausted => "sliding_window_exhausted",
            RejectReason::BucketEmpty => "bucket_empty",
            RejectReason::TokensExhausted => "tokens_exhausted",
            RejectReason::BackendUnavailable => "backend_unavailable",
            RejectReason::Cancelled => "cancelled",
            RejectReason::DeadlineExceeded => "deadline_exceeded",
            RejectReason::ShutDown => "shut_down",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The decision returned by a limiter. Produced once per request, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Admit,
    /// The request is rejected.
    Reject {
        /// Reason code for the rejection.
        reason: RejectReason,
        /// How long the caller should wait before retrying, when the limiter can tell.
        retry_after: Option<Duration>,
    },
}

impl Decision {
    pub fn reject(reason: RejectReason) -> Self {
        Decision::Reject { reason, retry_after: None }
    }

    pub fn reject_after(reason: RejectReason, retry_after: Duration) -> Self {
        Decision::Reject { reason, retry_after: Some(retry_after) }
    }

    /// Helper to check if admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit)
    }

    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Decision::Admit => None,
            Decision::Reject { reason, .. } => Some(*reason),
        }
    }

    /// Turn a rejection into the matching [`AdmissionError`].
    pub fn into_result<E>(self) -> Result<(), AdmissionError<E>> {
        match self {
            Decision::Admit => Ok(()),
            Decision::Reject { reason, retry_after } => {
                Err(AdmissionError::from_rejection(reason, retry_after))
            }
        }
    }
}

/// Which strategy produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimiterKind {
    Concurrency,
    FixedWindow,
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
}

impl LimiterKind {
    pub const ALL: [LimiterKind; 5] = [
        LimiterKind::Concurrency,
        LimiterKind::FixedWindow,
        LimiterKind::SlidingWindow,
        LimiterKind::TokenBucket,
        LimiterKind::LeakyBucket,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterKind::Concurrency => "concurrency",
            LimiterKind::FixedWindow => "fixed_window",
            LimiterKind::SlidingWindow => "sliding_window",
            LimiterKind::TokenBucket => "token_bucket",
            LimiterKind::LeakyBucket => "leaky_bucket",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            LimiterKind::Concurrency => 0,
            LimiterKind::FixedWindow => 1,
            LimiterKind::SlidingWindow => 2,
            LimiterKind::TokenBucket => 3,
            LimiterKind::LeakyBucket => 4,
        }
    }
}

impl fmt::Display for LimiterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core interface for admission logic.
///
/// `admit` must never wait for capacity: it answers immediately, rejecting rather than
/// queueing. The only suspension allowed is the single store round trip of a distributed
/// limiter.
#[async_trait]
pub trait Limiter: Send + Sync + fmt::Debug {
    /// Strategy name for logs and metrics.
    fn kind(&self) -> LimiterKind;

    /// Decide whether the request described by `ctx` may proceed.
    async fn admit(&self, ctx: &AdmitContext) -> Decision;

    /// Called exactly once for every admitted request when it finishes, however it
    /// finishes.
    fn complete(&self) {}

    /// Stop background work owned by the limiter and wait for it to exit.
    async fn shutdown(&self) {}
}

#[async_trait]
impl<L> Limiter for Arc<L>
where
    L: Limiter + ?Sized,
{
    fn kind(&self) -> LimiterKind {
        (**self).kind()
    }

    async fn admit(&self, ctx: &AdmitContext) -> Decision {
        (**self).admit(ctx).await
    }

    fn complete(&self) {
        (**self).complete()
    }

    async fn shutdown(&self) {
        (**self).shutdown().await
    }
}

/// Calls [`Limiter::complete`] when dropped, so cancelled or panicking requests still
/// hand their slot back.
#[derive(Debug)]
pub(crate) struct CompletionGuard<L: Limiter + ?Sized> {
    limiter: Arc<L>,
}

impl<L: Limiter + ?Sized> CompletionGuard<L> {
    pub(crate) fn new(limiter: Arc<L>) -> Self {
        Self { limiter }
    }
}

impl<L: Limiter + ?Sized> Drop for CompletionGuard<L> {
    fn drop(&mut self) {
        self.limiter.complete();
    }
}

/// Ask `limiter`, log and count the outcome.
pub(crate) async fn decide<L>(limiter: &L, ctx: &AdmitContext) -> Decision
where
    L: Limiter + ?Sized,
{
    let decision = limiter.admit(ctx).await;
    if let Decision::Reject { reason, retry_after } = decision {
        tracing::debug!(
            limiter = %limiter.kind(),
            reason = %reason,
            key = ctx.key().unwrap_or(""),
            ?retry_after,
            "request rejected"
        );
    }
    telemetry::record_decision(limiter.kind(), &decision);
    decision
}

/// Closure-style interceptor around one limiter.
///
/// Clones share the same limiter.
#[derive(Debug)]
pub struct Admission<L: ?Sized> {
    limiter: Arc<L>,
}

impl<L: ?Sized> Clone for Admission<L> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone() }
    }
}

impl<L: Limiter> Admission<L> {
    pub fn new(limiter: L) -> Self {
        Self { limiter: Arc::new(limiter) }
    }
}

impl<L: Limiter + ?Sized> Admission<L> {
    pub fn from_arc(limiter: Arc<L>) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }

    /// Run `operation` if the limiter admits the request.
    ///
    /// # Errors
    /// Returns the rejection as an [`AdmissionError`] without invoking `operation`, or
    /// whatever `operation` returns.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        ctx: &AdmitContext,
        operation: Op,
    ) -> Result<T, AdmissionError<E>>
    where
        Fut: Future<Output = Result<T, AdmissionError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        decide(&*self.limiter, ctx).await.into_result()?;
        let _guard = CompletionGuard::new(self.limiter.clone());
        operation().await
    }

    /// Stop the limiter's background work, if any.
    pub async fn shutdown(&self) {
        self.limiter.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::strategies::{ConcurrencyLimiter, FixedWindowLimiter};
    use crate::ManualClock;

    #[derive(Debug)]
    struct TestError;

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError")
        }
    }

    impl std::error::Error for TestError {}

    #[tokio::test]
    async fn execute_skips_operation_on_reject() {
        let clock = ManualClock::new();
        let admission =
            Admission::new(FixedWindowLimiter::new(1, Duration::from_secs(1)).with_clock(clock));
        let ctx = AdmitContext::default();

        let first = admission.execute(&ctx, || async { Ok::<_, AdmissionError<TestError>>(1) });
        assert_eq!(first.await.unwrap(), 1);

        let mut ran = false;
        let second = admission
            .execute(&ctx, || {
                ran = true;
                async { Ok::<_, AdmissionError<TestError>>(2) }
            })
            .await;
        assert!(!ran);
        assert_eq!(second.unwrap_err().reject_reason(), Some(RejectReason::WindowExhausted));
    }

    #[tokio::test]
    async fn execute_completes_after_handler_error() {
        let admission = Admission::new(ConcurrencyLimiter::new(1));
        let ctx = AdmitContext::default();

        let err = admission
            .execute(&ctx, || async { Err::<(), _>(AdmissionError::Inner(TestError)) })
            .await
            .unwrap_err();
        assert!(err.is_inner());
        assert_eq!(admission.limiter().in_flight(), 0);
    }

    #[test]
    fn decision_into_result_maps_reasons() {
        assert!(Decision::Admit.into_result::<TestError>().is_ok());
        let err = Decision::reject_after(RejectReason::TokensExhausted, Duration::from_millis(5))
            .into_result::<TestError>()
            .unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_millis(5)));
        assert_eq!(Decision::reject(RejectReason::BucketEmpty).reason(), Some(RejectReason::BucketEmpty));
    }

    #[test]
    fn limiter_kind_indexes_are_dense() {
        for (i, kind) in LimiterKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }
}
