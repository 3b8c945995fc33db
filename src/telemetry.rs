//! Process-wide admission counters.
//!
//! Nothing is registered implicitly: an application that wants counters calls
//! [`install`] once at startup, and every limiter and breaker in the process records
//! into that instance from then on. Until then recording is a no-op. Exporting the
//! numbers (Prometheus, OTLP, logs) is up to the application via [`MetricsSnapshot`].
//!
//! ```rust
//! use turnstile::telemetry::{self, AdmissionMetrics};
//!
//! let metrics = telemetry::install(AdmissionMetrics::new()).expect("first install");
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.limiters.len(), 5);
//! ```

use crate::rate_limit::{Decision, LimiterKind, RejectReason};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

static GLOBAL: OnceLock<AdmissionMetrics> = OnceLock::new();

/// Returned by [`install`] when metrics were already installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("admission metrics are already installed for this process")]
pub struct AlreadyInstalled;

/// Install the process-wide metrics. Succeeds exactly once.
///
/// # Errors
/// Returns [`AlreadyInstalled`] on every call after the first.
pub fn install(metrics: AdmissionMetrics) -> Result<&'static AdmissionMetrics, AlreadyInstalled> {
    let mut fresh = Some(metrics);
    let installed = GLOBAL.get_or_init(|| fresh.take().unwrap_or_default());
    if fresh.is_some() {
        return Err(AlreadyInstalled);
    }
    tracing::debug!("admission metrics installed");
    Ok(installed)
}

/// The installed metrics, if any.
pub fn global() -> Option<&'static AdmissionMetrics> {
    GLOBAL.get()
}

pub(crate) fn record_decision(kind: LimiterKind, decision: &Decision) {
    if let Some(metrics) = global() {
        metrics.record_decision(kind, decision);
    }
}

pub(crate) fn record_backend_error(kind: LimiterKind) {
    if let Some(metrics) = global() {
        metrics.record_backend_error(kind);
    }
}

pub(crate) fn record_breaker(event: BreakerEvent) {
    if let Some(metrics) = global() {
        metrics.record_breaker(event);
    }
}

/// Something the circuit breaker did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// Closed (or half-open) → open.
    Opened,
    /// Open → half-open; a trial request is let through.
    HalfOpened,
    /// Half-open → closed after a successful trial.
    Closed,
    /// A request was turned away without reaching the handler.
    Rejected,
}

impl fmt::Display for BreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerEvent::Opened => write!(f, "CircuitOpened"),
            BreakerEvent::HalfOpened => write!(f, "CircuitHalfOpen"),
            BreakerEvent::Closed => write!(f, "CircuitClosed"),
            BreakerEvent::Rejected => write!(f, "CircuitRejected"),
        }
    }
}

#[derive(Debug, Default)]
struct KindCounters {
    admitted: AtomicU64,
    rejected: AtomicU64,
    abandoned: AtomicU64,
    backend_errors: AtomicU64,
}

#[derive(Debug, Default)]
struct BreakerCounters {
    opened: AtomicU64,
    half_opened: AtomicU64,
    closed: AtomicU64,
    rejected: AtomicU64,
}

/// Lock-free counters for every limiter kind and the circuit breaker.
#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    kinds: [KindCounters; 5],
    breaker: BreakerCounters,
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one decision. Rejections caused by the caller's own cancellation or deadline
    /// are counted as abandoned, not as throttling.
    pub fn record_decision(&self, kind: LimiterKind, decision: &Decision) {
        let counters = &self.kinds[kind.index()];
        let counter = match decision.reason() {
            None => &counters.admitted,
            Some(RejectReason::Cancelled | RejectReason::DeadlineExceeded) => &counters.abandoned,
            Some(_) => &counters.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backend_error(&self, kind: LimiterKind) {
        self.kinds[kind.index()].backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker(&self, event: BreakerEvent) {
        let counter = match event {
            BreakerEvent::Opened => &self.breaker.opened,
            BreakerEvent::HalfOpened => &self.breaker.half_opened,
            BreakerEvent::Closed => &self.breaker.closed,
            BreakerEvent::Rejected => &self.breaker.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let limiters = LimiterKind::ALL
            .iter()
            .map(|kind| {
                let c = &self.kinds[kind.index()];
                LimiterCounts {
                    kind: kind.as_str(),
                    admitted: c.admitted.load(Ordering::Relaxed),
                    rejected: c.rejected.load(Ordering::Relaxed),
                    abandoned: c.abandoned.load(Ordering::Relaxed),
                    backend_errors: c.backend_errors.load(Ordering::Relaxed),
                }
            })
            .collect();

        MetricsSnapshot {
            limiters,
            breaker: BreakerCounts {
                opened: self.breaker.opened.load(Ordering::Relaxed),
                half_opened: self.breaker.half_opened.load(Ordering::Relaxed),
                closed: self.breaker.closed.load(Ordering::Relaxed),
                rejected: self.breaker.rejected.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable copy of [`AdmissionMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub limiters: Vec<LimiterCounts>,
    pub breaker: BreakerCounts,
}

impl MetricsSnapshot {
    pub fn limiter(&self, kind: LimiterKind) -> Option<&LimiterCounts> {
        self.limiters.iter().find(|c| c.kind == kind.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterCounts {
    pub kind: &'static str,
    pub admitted: u64,
    pub rejected: u64,
    pub abandoned: u64,
    pub backend_errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BreakerCounts {
    pub opened: u64,
    pub half_opened: u64,
    pub closed: u64,
    pub rejected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn counts_decisions_per_kind() {
        let metrics = AdmissionMetrics::new();
        metrics.record_decision(LimiterKind::TokenBucket, &Decision::Admit);
        metrics.record_decision(
            LimiterKind::TokenBucket,
            &Decision::reject_after(RejectReason::TokensExhausted, Duration::from_millis(10)),
        );
        metrics.record_decision(LimiterKind::TokenBucket, &Decision::reject(RejectReason::Cancelled));
        metrics.record_backend_error(LimiterKind::SlidingWindow);

        let snapshot = metrics.snapshot();
        let token = snapshot.limiter(LimiterKind::TokenBucket).unwrap();
        assert_eq!((token.admitted, token.rejected, token.abandoned), (1, 1, 1));
        assert_eq!(snapshot.limiter(LimiterKind::SlidingWindow).unwrap().backend_errors, 1);
        assert_eq!(snapshot.limiter(LimiterKind::Concurrency).unwrap().admitted, 0);
    }

    #[test]
    fn counts_breaker_events() {
        let metrics = AdmissionMetrics::new();
        for event in [BreakerEvent::Opened, BreakerEvent::Rejected, BreakerEvent::Rejected] {
            metrics.record_breaker(event);
        }
        let breaker = metrics.snapshot().breaker;
        assert_eq!(breaker, BreakerCounts { opened: 1, rejected: 2, ..Default::default() });
    }

    #[test]
    fn install_succeeds_once() {
        let first = install(AdmissionMetrics::new());
        let second = install(AdmissionMetrics::new());
        // Another test in this binary may have installed first; exactly one call wins.
        assert!(first.is_ok() || global().is_some());
        assert_eq!(second.unwrap_err(), AlreadyInstalled);
        assert!(global().is_some());
    }

    #[test]
    fn snapshot_serializes() {
        let json = serde_json::to_value(AdmissionMetrics::new().snapshot()).unwrap();
        assert_eq!(json["limiters"][0]["kind"], "concurrency");
        assert_eq!(json["breaker"]["opened"], 0);
    }

    #[test]
    fn event_display() {
        assert_eq!(BreakerEvent::HalfOpened.to_string(), "CircuitHalfOpen");
    }
}
