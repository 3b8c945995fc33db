//! Convenient re-exports for common Turnstile types.
pub use crate::{
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerLayer, CircuitBreakerPolicy},
    rate_limit::strategies::{
        ConcurrencyLimiter, FailurePolicy, FixedWindowLimiter, LeakyBucket, SlidingWindowLimiter,
        TokenBucket,
    },
    Admission, AdmissionError, AdmissionLayer, AdmissionStack, AdmitContext, Decision, Limiter,
    RejectReason, WindowStore,
};
