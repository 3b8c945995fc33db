//! Circuit breaker implementation with lock-free atomics
//!
//! The breaker sits between the limiters and the handler. While CLOSED every call goes
//! through and consecutive handler failures are counted; reaching the threshold trips it
//! OPEN, and calls are refused without touching the handler. Once the recovery timeout
//! has elapsed the next caller moves it to HALF_OPEN and becomes the trial: its outcome
//! closes the breaker or re-opens it for another timeout.
//!
//! Only errors the failure classifier attributes to the handler count as failures. The
//! caller's own cancellation, deadlines and rejections by other admission stages are
//! neutral.

use crate::clock::{Clock, MonotonicClock};
use crate::config::{normalize_count, normalize_duration, ConfigError};
use crate::config::{
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_HALF_OPEN_MAX_CALLS, DEFAULT_RECOVERY_TIMEOUT,
};
use crate::error::AdmissionError;
use crate::telemetry::{self, BreakerEvent};
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

// `opened_at_millis` outside an open period. Reads as "just opened", so a caller that
// sees the Open state before its timestamp lands is still refused.
const NOT_OPEN: u64 = u64::MAX;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until recovery timeout elapses.
    Open,
    /// Trial mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker configuration. Zero values are replaced by the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    recovery_timeout: Duration,
    half_open_max_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(
        failure_threshold: usize,
        recovery_timeout: Duration,
        half_open_max_calls: usize,
    ) -> Self {
        Self {
            failure_threshold: normalize_count(
                "circuit_breaker",
                "failure_threshold",
                failure_threshold,
                DEFAULT_FAILURE_THRESHOLD,
            ),
            recovery_timeout: normalize_duration(
                "circuit_breaker",
                "recovery_timeout",
                recovery_timeout,
                DEFAULT_RECOVERY_TIMEOUT,
            ),
            half_open_max_calls: normalize_count(
                "circuit_breaker",
                "half_open_max_calls",
                half_open_max_calls,
                DEFAULT_HALF_OPEN_MAX_CALLS,
            ),
        }
    }

    /// Creates a disabled circuit breaker that never opens.
    /// Uses `usize::MAX` thresholds and `Duration::MAX` timeout to effectively disable all circuit breaking logic.
    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            recovery_timeout: Duration::MAX,
            half_open_max_calls: usize::MAX,
        }
    }

    /// Consecutive failures before opening from Closed.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Duration to stay Open before Half-Open trials.
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Maximum concurrent calls while Half-Open.
    pub fn half_open_max_calls(&self) -> usize {
        self.half_open_max_calls
    }
}

/// The breaker refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker open: {failure_count} failures, open for {open_duration:?}")]
pub struct CircuitOpen {
    pub failure_count: usize,
    pub open_duration: Duration,
}

impl<E> From<CircuitOpen> for AdmissionError<E> {
    fn from(open: CircuitOpen) -> Self {
        AdmissionError::CircuitOpen {
            failure_count: open.failure_count,
            open_duration: open.open_duration,
        }
    }
}

/// Decides whether a handler error counts against the breaker.
pub type FailureClassifier = Arc<dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync>;

// State and trial round share one word so a reader always sees a consistent pair:
// low two bits hold the state, the rest count Open -> HalfOpen transitions.
fn pack(state: CircuitState, round: u64) -> u64 {
    (round << 2) | u64::from(state.to_u8())
}

fn unpack(word: u64) -> (CircuitState, u64) {
    (CircuitState::from_u8((word & 0b11) as u8), word >> 2)
}

#[derive(Debug)]
struct CircuitBreakerState {
    word: AtomicU64,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
}

/// Circuit breaker policy guarding an async operation.
/// Clones share the same underlying state via `Arc`, so all handles observe and affect the same
/// circuit lifecycle (failure counts, open/half-open/closed transitions).
#[derive(Clone)]
pub struct CircuitBreakerPolicy {
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    classifier: FailureClassifier,
}

impl fmt::Debug for CircuitBreakerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerPolicy")
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerPolicy {
    /// Create a breaker with a single half-open trial.
    ///
    /// # Examples
    /// ```
    /// use turnstile::CircuitBreakerPolicy;
    /// use std::time::Duration;
    /// let breaker = CircuitBreakerPolicy::new(5, Duration::from_secs(30));
    /// assert_eq!(breaker.config().half_open_max_calls(), 1);
    /// ```
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self::with_config(CircuitBreakerConfig::new(
            failure_threshold,
            recovery_timeout,
            DEFAULT_HALF_OPEN_MAX_CALLS,
        ))
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(CircuitBreakerState {
                word: AtomicU64::new(pack(CircuitState::Closed, 0)),
                failure_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(NOT_OPEN),
                half_open_calls: AtomicUsize::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
            classifier: Arc::new(|_: &(dyn Error + 'static)| true),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override the maximum number of half-open trial calls; must be > 0.
    pub fn with_half_open_limit(mut self, limit: usize) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::InvalidHalfOpenLimit { provided: limit });
        }
        self.config.half_open_max_calls = limit;
        Ok(self)
    }

    /// Decide which handler errors count as failures. By default every handler error
    /// does; return `false` for errors that say nothing about the handler's health
    /// (e.g. "not found" or invalid input).
    ///
    /// ```
    /// use turnstile::CircuitBreakerPolicy;
    /// use std::time::Duration;
    ///
    /// let breaker = CircuitBreakerPolicy::new(5, Duration::from_secs(30))
    ///     .with_failure_classifier(|err| {
    ///         err.downcast_ref::<std::io::Error>()
    ///             .map_or(true, |io| io.kind() != std::io::ErrorKind::NotFound)
    ///     });
    /// # let _ = breaker;
    /// ```
    pub fn with_failure_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        unpack(self.load()).0
    }

    /// Consecutive failures recorded since the breaker last closed.
    pub fn failure_count(&self) -> usize {
        self.state.failure_count.load(Ordering::Acquire)
    }

    /// Ask to make a call. Never waits.
    ///
    /// # Errors
    /// Returns [`CircuitOpen`] while the breaker is open, or half-open with its trial
    /// slots taken.
    pub fn allow(&self) -> Result<CallPermit, CircuitOpen> {
        loop {
            let word = self.load();
            let (state, round) = unpack(word);
            match state {
                CircuitState::Closed => return Ok(self.permit(None)),
                CircuitState::Open => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    if self.load() != word {
                        continue;
                    }
                    let elapsed = self.now_millis().saturating_sub(opened_at);
                    if elapsed < self.recovery_millis() {
                        return Err(self.reject(elapsed));
                    }
                    // Clear this period's timestamp before leaving Open; the next trip
                    // stamps its own after winning the transition.
                    let cleared = self
                        .state
                        .opened_at_millis
                        .compare_exchange(opened_at, NOT_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                    if cleared
                        && self.transition(word, CircuitState::HalfOpen, round.wrapping_add(1))
                    {
                        telemetry::record_breaker(BreakerEvent::HalfOpened);
                        tracing::info!("Circuit breaker → half-open");
                    }
                    // Winner or not, compete for a trial slot like everyone else.
                }
                CircuitState::HalfOpen => {
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_calls {
                        self.release_slot();
                        return Err(self.reject(self.recovery_millis()));
                    }
                    if self.load() != word {
                        // The round ended while we were taking the slot; its reset to
                        // zero may already have absorbed our increment.
                        self.release_slot();
                        continue;
                    }
                    tracing::debug!(
                        in_flight = current + 1,
                        max = self.config.half_open_max_calls,
                        "Circuit breaker: half-open test request"
                    );
                    return Ok(self.permit(Some(round)));
                }
            }
        }
    }

    /// Executes the provided async operation under circuit breaker protection.
    ///
    /// # Behavior
    /// - **Closed**: Executes the operation normally. Consecutive failures increment the failure count.
    /// - **Open**: Rejects calls with `AdmissionError::CircuitOpen` until `recovery_timeout` elapses.
    /// - **HalfOpen**: Allows limited test calls (`half_open_max_calls`). Success closes the circuit; failure reopens it.
    ///
    /// # Errors
    /// Returns `AdmissionError::CircuitOpen` if the circuit is open or half-open capacity is exceeded.
    /// Returns `AdmissionError::Inner(E)` if the operation itself fails.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, AdmissionError<E>>
    where
        E: Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, AdmissionError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let permit = self.allow()?;
        let result = operation().await;
        self.report(permit, &result);
        result
    }

    fn report<T, E>(&self, permit: CallPermit, result: &Result<T, AdmissionError<E>>)
    where
        E: Error + 'static,
    {
        match result {
            Ok(_) => permit.mark_success(),
            Err(AdmissionError::Inner(err)) => {
                if (self.classifier)(err) {
                    permit.mark_failed();
                } else {
                    permit.mark_success();
                }
            }
            // Said nothing about the handler: release without a verdict.
            Err(_) => drop(permit),
        }
    }

    fn permit(&self, trial_round: Option<u64>) -> CallPermit {
        CallPermit { breaker: self.clone(), trial_round }
    }

    fn reject(&self, elapsed_millis: u64) -> CircuitOpen {
        telemetry::record_breaker(BreakerEvent::Rejected);
        CircuitOpen {
            failure_count: self.failure_count(),
            open_duration: Duration::from_millis(elapsed_millis),
        }
    }

    fn load(&self) -> u64 {
        self.state.word.load(Ordering::Acquire)
    }

    fn transition(&self, from: u64, to: CircuitState, round: u64) -> bool {
        self.state
            .word
            .compare_exchange(from, pack(to, round), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn recovery_millis(&self) -> u64 {
        u64::try_from(self.config.recovery_timeout.as_millis()).unwrap_or(u64::MAX).max(1)
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Resets consecutive failure count; any success in the closed state resets the counter to 0,
    /// meaning only consecutive failures trip the breaker (patterns like F-F-S-F-F will not open it
    /// unless the final streak meets `failure_threshold`).
    fn on_success(&self, trial_round: Option<u64>) {
        match trial_round {
            Some(round) => {
                if self.transition(pack(CircuitState::HalfOpen, round), CircuitState::Closed, round)
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    telemetry::record_breaker(BreakerEvent::Closed);
                    tracing::info!("Circuit breaker → closed");
                }
            }
            None => {
                // A call admitted while closed that finishes after the breaker moved on
                // says nothing about the current trial.
                if self.state() == CircuitState::Closed {
                    self.state.failure_count.store(0, Ordering::Release);
                }
            }
        }
    }

    fn on_failure(&self, trial_round: Option<u64>) {
        match trial_round {
            Some(round) => {
                let trial = pack(CircuitState::HalfOpen, round);
                if self.load() != trial {
                    return;
                }
                if self.transition(trial, CircuitState::Open, round) {
                    self.stamp_open();
                    let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                    telemetry::record_breaker(BreakerEvent::Opened);
                    tracing::warn!(failures, "Circuit breaker: test failed → open");
                }
            }
            None => {
                let word = self.load();
                let (state, round) = unpack(word);
                if state != CircuitState::Closed {
                    return;
                }
                let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures < self.config.failure_threshold {
                    return;
                }
                // Only the winner of the trip resets the open-period fields.
                if self.transition(word, CircuitState::Open, round) {
                    self.stamp_open();
                    telemetry::record_breaker(BreakerEvent::Opened);
                    tracing::error!(
                        failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker → open"
                    );
                }
            }
        }
    }

    fn stamp_open(&self) {
        self.state.half_open_calls.store(0, Ordering::Release);
        self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
    }

    fn release_trial_slot(&self, round: u64) {
        if unpack(self.load()).1 == round {
            self.release_slot();
        }
    }

    fn release_slot(&self) {
        let _ = self.state.half_open_calls.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| n.checked_sub(1),
        );
    }
}

/// Permission to make one call, obtained from [`CircuitBreakerPolicy::allow`].
///
/// Report the outcome with [`mark_success`](Self::mark_success) or
/// [`mark_failed`](Self::mark_failed). Dropping the permit without a verdict (the call
/// was cancelled, or panicked) releases it without affecting the breaker.
#[must_use = "report the call's outcome or drop the permit"]
pub struct CallPermit {
    breaker: CircuitBreakerPolicy,
    trial_round: Option<u64>,
}

impl fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit").field("trial", &self.is_trial()).finish()
    }
}

impl CallPermit {
    /// Whether this call is a half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial_round.is_some()
    }

    pub fn mark_success(mut self) {
        let round = self.trial_round.take();
        self.breaker.on_success(round);
    }

    pub fn mark_failed(mut self) {
        let round = self.trial_round.take();
        self.breaker.on_failure(round);
    }
}

impl Drop for CallPermit {
    // Only a trial dropped without a verdict hands its slot back. A verdict ends the
    // round, and the next trip resets the slot count.
    fn drop(&mut self) {
        if let Some(round) = self.trial_round {
            self.breaker.release_trial_slot(round);
        }
    }
}

/// Tower layer guarding a service with a [`CircuitBreakerPolicy`].
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerLayer {
    policy: CircuitBreakerPolicy,
}

impl CircuitBreakerLayer {
    pub fn new(policy: CircuitBreakerPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CircuitBreakerPolicy {
        &self.policy
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService { inner, policy: self.policy.clone() }
    }
}

/// Service produced by [`CircuitBreakerLayer`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerService<S> {
    inner: S,
    policy: CircuitBreakerPolicy,
}

impl<S, Req> Service<Req> for CircuitBreakerService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Error + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let permit = match self.policy.allow() {
            Ok(permit) => permit,
            Err(open) => return Box::pin(std::future::ready(Err(open.into()))),
        };
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let policy = self.policy.clone();

        Box::pin(async move {
            let result = inner.call(req).await.map_err(AdmissionError::Inner);
            policy.report(permit, &result);
            result
        })
    }
}
