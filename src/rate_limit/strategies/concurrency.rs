use crate::config::{normalize_count, DEFAULT_THRESHOLD};
use crate::context::AdmitContext;
use crate::rate_limit::{Decision, Limiter, LimiterKind, RejectReason};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bounds how many requests run at the same time.
///
/// This measures concurrency, not throughput. Every successful [`try_admit`](Self::try_admit)
/// must be paired with one [`release`](Self::release); the middleware and
/// [`try_acquire`](Self::try_acquire) do that for you.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    in_flight: AtomicUsize,
    threshold: usize,
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl ConcurrencyLimiter {
    /// Allow at most `threshold` requests in flight. Zero falls back to the default.
    pub fn new(threshold: usize) -> Self {
        let threshold = normalize_count("concurrency", "threshold", threshold, DEFAULT_THRESHOLD);
        Self { in_flight: AtomicUsize::new(0), threshold }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Take a slot if one is free.
    ///
    /// The increment happens first and is rolled back when it overshoots, keeping the hot
    /// path to a single atomic add.
    pub fn try_admit(&self) -> bool {
        let previous = self.in_flight.fetch_add(1, Ordering::AcqRel);
        if previous >= self.threshold {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Give back a slot taken by [`try_admit`](Self::try_admit). Extra releases are ignored
    /// so the count never goes negative.
    pub fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// RAII variant of [`try_admit`](Self::try_admit): the slot is released when the
    /// permit drops.
    pub fn try_acquire(&self) -> Option<ConcurrencyPermit<'_>> {
        self.try_admit().then(|| ConcurrencyPermit { limiter: self })
    }
}

/// A held concurrency slot.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct ConcurrencyPermit<'a> {
    limiter: &'a ConcurrencyLimiter,
}

impl Drop for ConcurrencyPermit<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[async_trait]
impl Limiter for ConcurrencyLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::Concurrency
    }

    async fn admit(&self, ctx: &AdmitContext) -> Decision {
        if let Some(reason) = ctx.check() {
            return Decision::reject(reason);
        }
        if self.try_admit() {
            Decision::Admit
        } else {
            Decision::reject(RejectReason::ConcurrencyLimit)
        }
    }

    fn complete(&self) {
        self.release();
    }
}
