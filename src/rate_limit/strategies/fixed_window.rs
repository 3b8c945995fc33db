use crate::clock::{Clock, MonotonicClock};
use crate::config::{normalize_count, normalize_duration, DEFAULT_THRESHOLD, DEFAULT_WINDOW};
use crate::context::AdmitContext;
use crate::rate_limit::{Decision, Limiter, LimiterKind, RejectReason};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct WindowState {
    // Set by the first request, then advanced only by a request that lands past the end.
    start: Option<u64>,
    count: usize,
}

/// Coarse per-interval quota.
///
/// At most `threshold` requests are admitted per window. The window resets as a whole, so
/// a burst just before a boundary followed by one just after can admit up to twice the
/// threshold within a short span. That is the accepted cost of O(1) state; use
/// [`SlidingWindowLimiter`](super::SlidingWindowLimiter) when the boundary matters.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    state: Mutex<WindowState>,
    threshold: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for FixedWindowLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_WINDOW)
    }
}

impl FixedWindowLimiter {
    /// `threshold` requests per `window`. Zero values fall back to the defaults.
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            state: Mutex::new(WindowState::default()),
            threshold: normalize_count("fixed_window", "threshold", threshold, DEFAULT_THRESHOLD),
            window: normalize_duration("fixed_window", "window", window, DEFAULT_WINDOW),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count the request against the current window.
    ///
    /// # Errors
    /// Returns the time left until the window resets when the quota is used up.
    pub fn try_admit(&self) -> Result<(), Duration> {
        let now = self.clock.now_millis();
        let window = u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let start = *state.start.get_or_insert(now);
        let elapsed = now.saturating_sub(start);
        if elapsed >= window {
            state.start = Some(now);
            state.count = 0;
        }

        if state.count < self.threshold {
            state.count += 1;
            Ok(())
        } else {
            Err(Duration::from_millis(window - elapsed))
        }
    }

    /// Requests admitted in the current window.
    pub fn current_count(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).count
    }
}

#[async_trait]
impl Limiter for FixedWindowLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::FixedWindow
    }

    async fn admit(&self, ctx: &AdmitContext) -> Decision {
        if let Some(reason) = ctx.check() {
            return Decision::reject(reason);
        }
        match self.try_admit() {
            Ok(()) => Decision::Admit,
            Err(retry_after) => Decision::reject_after(RejectReason::WindowExhausted, retry_after),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(threshold: usize, window_ms: u64) -> (FixedWindowLimiter, ManualClock) {
        let clock = ManualClock::new();
        let limiter = FixedWindowLimiter::new(threshold, Duration::from_millis(window_ms))
            .with_clock(clock.clone());
        (limiter, clock)
    }

    #[test]
    fn three_per_second_scenario() {
        let (limiter, clock) = limiter(3, 1_000);
        for _ in 0..3 {
            assert_eq!(limiter.try_admit(), Ok(()));
        }

        clock.set(10);
        assert_eq!(limiter.try_admit(), Err(Duration::from_millis(990)));

        clock.set(1_005);
        assert_eq!(limiter.try_admit(), Ok(()));
        assert_eq!(limiter.current_count(), 1);
    }

    #[test]
    fn boundary_burst_can_reach_twice_threshold() {
        let (limiter, clock) = limiter(3, 1_000);
        assert_eq!(limiter.try_admit(), Ok(()));

        clock.set(999);
        let before = (0..3).filter(|_| limiter.try_admit().is_ok()).count();
        clock.set(1_000);
        let after = (0..3).filter(|_| limiter.try_admit().is_ok()).count();

        // 2 + 3 admits within two milliseconds.
        assert_eq!(before + after, 5);
    }

    #[test]
    fn never_exceeds_threshold_within_one_window() {
        let (limiter, clock) = limiter(5, 100);
        let mut admitted = 0;
        for t in 0..100 {
            clock.set(t);
            if limiter.try_admit().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[test]
    fn zero_values_use_defaults() {
        let limiter = FixedWindowLimiter::new(0, Duration::ZERO);
        assert_eq!(limiter.threshold(), DEFAULT_THRESHOLD);
        assert_eq!(limiter.window(), DEFAULT_WINDOW);
    }

    #[tokio::test]
    async fn reject_carries_reason_and_retry_hint() {
        let (limiter, clock) = limiter(1, 1_000);
        let ctx = AdmitContext::default();
        assert!(limiter.admit(&ctx).await.is_admitted());
        clock.advance(400);
        assert_eq!(
            limiter.admit(&ctx).await,
            Decision::reject_after(RejectReason::WindowExhausted, Duration::from_millis(600))
        );
    }

    #[test]
    fn concurrent_callers_share_one_quota() {
        let (limiter, _clock) = limiter(50, 60_000);
        let limiter = Arc::new(limiter);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || (0..20).filter(|_| limiter.try_admit().is_ok()).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
