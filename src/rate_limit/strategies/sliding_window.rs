use crate::clock::Clock;
use crate::config::{normalize_count, normalize_duration, DEFAULT_THRESHOLD, DEFAULT_WINDOW};
use crate::context::AdmitContext;
use crate::error::StoreError;
use crate::rate_limit::store::{WindowRequest, WindowStore};
use crate::rate_limit::{Decision, Limiter, LimiterKind, RejectReason};
use crate::telemetry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Prefix put in front of every rate-limit key sent to the store.
pub const DEFAULT_KEY_PREFIX: &str = "turnstile:sw:";

const GLOBAL_KEY: &str = "global";

/// What to do when the window store cannot be consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit everything while the store is down, preserving availability.
    FailOpen,
    /// Reject everything while the store is down, protecting downstream.
    #[default]
    FailClosed,
}

/// Precise moving-window limit shared by every process talking to the same store.
///
/// Each decision is one atomic store operation (prune, count, conditional record). The
/// limiter itself keeps no state, and by default no timestamps either: the store's own
/// clock decides, so skew between callers cannot double-admit.
#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    store: Arc<dyn WindowStore>,
    window: Duration,
    threshold: usize,
    policy: FailurePolicy,
    key_prefix: String,
    timeout: Option<Duration>,
    clock: Option<Arc<dyn Clock>>,
}

impl SlidingWindowLimiter {
    /// `threshold` requests per key within any `window`. Zero values fall back to the
    /// defaults.
    pub fn new<S>(store: S, threshold: usize, window: Duration) -> Self
    where
        S: WindowStore + 'static,
    {
        Self::from_arc(Arc::new(store), threshold, window)
    }

    /// Share one store (and its connection) between several limiters.
    pub fn from_arc(store: Arc<dyn WindowStore>, threshold: usize, window: Duration) -> Self {
        Self {
            store,
            window: normalize_duration("sliding_window", "window", window, DEFAULT_WINDOW),
            threshold: normalize_count("sliding_window", "threshold", threshold, DEFAULT_THRESHOLD),
            policy: FailurePolicy::default(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout: None,
            clock: None,
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Give up on the store after `timeout`; the failure policy then applies.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Send timestamps from `clock` instead of letting the store use its own time.
    ///
    /// Only safe when every caller shares the clock, e.g. a single process or tests.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// One store round trip for `key`, without the failure policy applied.
    ///
    /// # Errors
    /// Returns the store's error, or `StoreError::Timeout` when the configured timeout
    /// elapses first.
    pub async fn try_check(&self, key: &str) -> Result<bool, StoreError> {
        let request = WindowRequest {
            key: format!("{}{}", self.key_prefix, key),
            window_millis: u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX),
            threshold: self.threshold as u64,
            now_millis: self.clock.as_ref().map(|c| c.now_millis()),
            nonce: rand::random::<u64>(),
        };

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.store.record_if_below(&request))
                .await
                .map_err(|_| StoreError::Timeout(limit))?,
            None => self.store.record_if_below(&request).await,
        }
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::SlidingWindow
    }

    async fn admit(&self, ctx: &AdmitContext) -> Decision {
        if let Some(reason) = ctx.check() {
            return Decision::reject(reason);
        }
        let key = ctx.key().unwrap_or(GLOBAL_KEY);
        match self.try_check(key).await {
            Ok(true) => Decision::Admit,
            Ok(false) => Decision::reject(RejectReason::SlidingWindowExhausted),
            Err(err) => {
                telemetry::record_backend_error(self.kind());
                tracing::warn!(
                    key,
                    error = %err,
                    policy = ?self.policy,
                    "sliding window store unavailable"
                );
                match self.policy {
                    FailurePolicy::FailOpen => Decision::Admit,
                    FailurePolicy::FailClosed => Decision::reject(RejectReason::BackendUnavailable),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::store::MemoryWindowStore;
    use futures::future::join_all;

    #[derive(Debug)]
    struct DownStore;

    #[async_trait]
    impl WindowStore for DownStore {
        async fn record_if_below(&self, _: &WindowRequest) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[derive(Debug)]
    struct SlowStore;

    #[async_trait]
    impl WindowStore for SlowStore {
        async fn record_if_below(&self, _: &WindowRequest) -> Result<bool, StoreError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn admits_up_to_threshold_per_key() {
        let store = MemoryWindowStore::new();
        let limiter = SlidingWindowLimiter::new(store.clone(), 2, Duration::from_secs(1));
        let a = AdmitContext::keyed("tenant-a");
        let b = AdmitContext::keyed("tenant-b");

        assert!(limiter.admit(&a).await.is_admitted());
        assert!(limiter.admit(&a).await.is_admitted());
        assert_eq!(limiter.admit(&a).await.reason(), Some(RejectReason::SlidingWindowExhausted));
        assert!(limiter.admit(&b).await.is_admitted());

        assert_eq!(store.recorded("turnstile:sw:tenant-a"), 2);
        assert_eq!(store.recorded("turnstile:sw:tenant-b"), 1);
    }

    #[tokio::test]
    async fn window_moves_with_the_clock() {
        let clock = ManualClock::starting_at(1_000);
        let limiter =
            SlidingWindowLimiter::new(MemoryWindowStore::new(), 2, Duration::from_millis(100))
                .with_clock(clock.clone());
        let ctx = AdmitContext::default();

        assert!(limiter.admit(&ctx).await.is_admitted());
        clock.advance(60);
        assert!(limiter.admit(&ctx).await.is_admitted());
        assert!(!limiter.admit(&ctx).await.is_admitted());

        // First event expires, second is still inside the window.
        clock.advance(40);
        assert!(limiter.admit(&ctx).await.is_admitted());
        assert!(!limiter.admit(&ctx).await.is_admitted());
    }

    #[tokio::test]
    async fn fail_closed_rejects_when_store_is_down() {
        let limiter = SlidingWindowLimiter::new(DownStore, 10, Duration::from_secs(1));
        assert_eq!(limiter.failure_policy(), FailurePolicy::FailClosed);
        let decision = limiter.admit(&AdmitContext::default()).await;
        assert_eq!(decision.reason(), Some(RejectReason::BackendUnavailable));
    }

    #[tokio::test]
    async fn fail_open_admits_when_store_is_down() {
        let limiter = SlidingWindowLimiter::new(DownStore, 10, Duration::from_secs(1))
            .with_failure_policy(FailurePolicy::FailOpen);
        assert!(limiter.admit(&AdmitContext::default()).await.is_admitted());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out_into_policy() {
        let limiter = SlidingWindowLimiter::new(SlowStore, 10, Duration::from_secs(1))
            .with_timeout(Duration::from_millis(20));
        assert_eq!(
            limiter.try_check("k").await,
            Err(StoreError::Timeout(Duration::from_millis(20)))
        );
        let decision = limiter.admit(&AdmitContext::default()).await;
        assert_eq!(decision.reason(), Some(RejectReason::BackendUnavailable));
    }

    #[tokio::test]
    async fn cancelled_context_skips_the_store() {
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let limiter = SlidingWindowLimiter::new(DownStore, 10, Duration::from_secs(1));
        let ctx = AdmitContext::new().with_cancellation(token);
        assert_eq!(limiter.admit(&ctx).await.reason(), Some(RejectReason::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_overshoot() {
        let limiter = Arc::new(SlidingWindowLimiter::new(
            MemoryWindowStore::new(),
            25,
            Duration::from_secs(60),
        ));
        let tasks = (0..200).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.admit(&AdmitContext::keyed("hot")).await })
        });
        let admitted = join_all(tasks)
            .await
            .into_iter()
            .filter(|d| d.as_ref().map(Decision::is_admitted).unwrap_or(false))
            .count();
        assert_eq!(admitted, 25);
    }

    #[test]
    fn custom_prefix_and_zero_timeout() {
        let limiter = SlidingWindowLimiter::new(MemoryWindowStore::new(), 0, Duration::ZERO)
            .with_key_prefix("api:")
            .with_timeout(Duration::ZERO);
        assert_eq!(limiter.key_prefix, "api:");
        assert_eq!(limiter.timeout, None);
        assert_eq!(limiter.threshold(), DEFAULT_THRESHOLD);
        assert_eq!(limiter.window(), DEFAULT_WINDOW);
    }
}
