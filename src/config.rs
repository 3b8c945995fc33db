//! Configuration surface for limiters and the circuit breaker.
//!
//! Bad numbers never fail a deployment: non-positive capacities, thresholds and
//! durations are replaced by the defaults below, with a warning naming the field.
//! [`AdmissionConfig`] describes a whole pipeline and is consumed by
//! [`AdmissionStack::from_config`](crate::AdmissionStack::from_config); reading it from
//! disk is left to the application.

use crate::rate_limit::strategies::FailurePolicy;
use crate::rate_limit::LimiterKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_THRESHOLD: usize = 100;
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);
pub const DEFAULT_FAILURE_THRESHOLD: usize = 5;
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HALF_OPEN_MAX_CALLS: usize = 1;

/// Errors that cannot be normalized away.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Bucket limiters spawn a generator task and need a tokio runtime.
    #[error("bucket limiters must be created inside a tokio runtime")]
    NoRuntime,
    /// A sliding-window limiter was configured without a window store.
    #[error("sliding_window limiter configured but no window store was provided")]
    MissingWindowStore,
    /// Half-open trial limit must be > 0.
    #[error("half_open_max_calls must be > 0 (got {provided})")]
    InvalidHalfOpenLimit {
        /// Value provided by caller.
        provided: usize,
    },
}

pub(crate) fn normalize_count(
    limiter: &'static str,
    field: &'static str,
    value: usize,
    default: usize,
) -> usize {
    if value == 0 {
        tracing::warn!(limiter, field, default, "non-positive value replaced by default");
        default
    } else {
        value
    }
}

pub(crate) fn normalize_duration(
    limiter: &'static str,
    field: &'static str,
    value: Duration,
    default: Duration,
) -> Duration {
    if value.is_zero() {
        tracing::warn!(limiter, field, ?default, "non-positive duration replaced by default");
        default
    } else {
        value
    }
}

// Negative operator input maps to zero, which the constructors then normalize.
fn count(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

fn millis(value: i64) -> Duration {
    u64::try_from(value).map(Duration::from_millis).unwrap_or(Duration::ZERO)
}

/// A whole admission pipeline: limiters in the order they run, then an optional breaker.
///
/// ```
/// use turnstile::AdmissionConfig;
///
/// let config: AdmissionConfig = serde_json::from_str(r#"{
///     "limiters": [
///         { "strategy": "concurrency", "threshold": 64 },
///         { "strategy": "token_bucket", "capacity": 20, "interval_ms": 50 }
///     ],
///     "circuit_breaker": { "failure_threshold": 5, "recovery_timeout_ms": 30000 }
/// }"#).unwrap();
/// assert_eq!(config.limiters.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub limiters: Vec<LimiterSpec>,
    #[serde(default)]
    pub circuit_breaker: Option<BreakerSpec>,
}

/// One limiter, tagged by `strategy`. Omitted numbers mean "use the default".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum LimiterSpec {
    Concurrency {
        #[serde(default)]
        threshold: i64,
    },
    FixedWindow {
        #[serde(default)]
        threshold: i64,
        #[serde(default)]
        window_ms: i64,
    },
    SlidingWindow {
        #[serde(default)]
        threshold: i64,
        #[serde(default)]
        window_ms: i64,
        #[serde(default)]
        failure_policy: FailurePolicy,
        /// Zero or negative disables the store timeout.
        #[serde(default)]
        timeout_ms: i64,
        #[serde(default)]
        key_prefix: Option<String>,
    },
    TokenBucket {
        #[serde(default)]
        capacity: i64,
        #[serde(default)]
        interval_ms: i64,
        #[serde(default)]
        initial_tokens: i64,
    },
    LeakyBucket {
        #[serde(default)]
        capacity: i64,
        #[serde(default)]
        rate_ms: i64,
        /// Omitted means a full bucket.
        #[serde(default)]
        initial_level: Option<i64>,
    },
}

impl LimiterSpec {
    pub fn kind(&self) -> LimiterKind {
        match self {
            LimiterSpec::Concurrency { .. } => LimiterKind::Concurrency,
            LimiterSpec::FixedWindow { .. } => LimiterKind::FixedWindow,
            LimiterSpec::SlidingWindow { .. } => LimiterKind::SlidingWindow,
            LimiterSpec::TokenBucket { .. } => LimiterKind::TokenBucket,
            LimiterSpec::LeakyBucket { .. } => LimiterKind::LeakyBucket,
        }
    }
}

/// Normalized limiter parameters, ready for the constructors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LimiterParams {
    Concurrency { threshold: usize },
    FixedWindow { threshold: usize, window: Duration },
    SlidingWindow {
        threshold: usize,
        window: Duration,
        failure_policy: FailurePolicy,
        timeout: Duration,
        key_prefix: Option<String>,
    },
    TokenBucket { capacity: usize, interval: Duration, initial: usize },
    LeakyBucket { capacity: usize, rate: Duration, initial: usize },
}

impl From<&LimiterSpec> for LimiterParams {
    fn from(spec: &LimiterSpec) -> Self {
        match spec {
            LimiterSpec::Concurrency { threshold } => {
                LimiterParams::Concurrency { threshold: count(*threshold) }
            }
            LimiterSpec::FixedWindow { threshold, window_ms } => LimiterParams::FixedWindow {
                threshold: count(*threshold),
                window: millis(*window_ms),
            },
            LimiterSpec::SlidingWindow {
                threshold,
                window_ms,
                failure_policy,
                timeout_ms,
                key_prefix,
            } => LimiterParams::SlidingWindow {
                threshold: count(*threshold),
                window: millis(*window_ms),
                failure_policy: *failure_policy,
                timeout: millis(*timeout_ms),
                key_prefix: key_prefix.clone(),
            },
            LimiterSpec::TokenBucket { capacity, interval_ms, initial_tokens } => {
                LimiterParams::TokenBucket {
                    capacity: count(*capacity),
                    interval: millis(*interval_ms),
                    initial: count(*initial_tokens),
                }
            }
            LimiterSpec::LeakyBucket { capacity, rate_ms, initial_level } => {
                LimiterParams::LeakyBucket {
                    capacity: count(*capacity),
                    rate: millis(*rate_ms),
                    initial: initial_level.map_or(usize::MAX, count),
                }
            }
        }
    }
}

/// Circuit breaker section of [`AdmissionConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerSpec {
    #[serde(default)]
    pub failure_threshold: i64,
    #[serde(default)]
    pub recovery_timeout_ms: i64,
    #[serde(default)]
    pub half_open_max_calls: i64,
}

impl From<&BreakerSpec> for crate::CircuitBreakerConfig {
    fn from(spec: &BreakerSpec) -> Self {
        crate::CircuitBreakerConfig::new(
            count(spec.failure_threshold),
            millis(spec.recovery_timeout_ms),
            count(spec.half_open_max_calls),
        )
    }
}
