#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Turnstile
//!
//! Admission control for async Rust services: interchangeable rate limiters and a
//! circuit breaker that decide admit/reject for each inbound request before it
//! reaches application code.
//!
//! ## Features
//!
//! - **Concurrency limiter** bounding simultaneous in-flight work (lock-free)
//! - **Fixed-window limiter** with a coarse per-interval quota
//! - **Sliding-window limiter** backed by an atomic store script (Redis or in-memory)
//! - **Token bucket** and **leaky bucket** refilled by cancellable background generators
//! - **Circuit breaker** with half-open trial calls
//! - **tower middleware** for every policy, plus closure-style `execute` helpers
//!
//! ## Quick Start
//!
//! ```rust
//! use turnstile::{Admission, AdmissionError, AdmitContext, FixedWindowLimiter};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = FixedWindowLimiter::new(3, Duration::from_secs(1));
//!     let admission = Admission::new(limiter);
//!
//!     let result = admission
//!         .execute(&AdmitContext::default(), || async {
//!             Ok::<_, AdmissionError<std::io::Error>>("handled")
//!         })
//!         .await;
//!     assert_eq!(result.unwrap(), "handled");
//! }
//! ```

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod prelude;
pub mod rate_limit;
pub mod stack;
pub mod telemetry;

// Re-exports
pub use circuit_breaker::{
    CallPermit, CircuitBreakerConfig, CircuitBreakerLayer, CircuitBreakerPolicy,
    CircuitBreakerService, CircuitOpen, CircuitState, FailureClassifier,
};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{AdmissionConfig, BreakerSpec, ConfigError, LimiterSpec};
pub use context::AdmitContext;
pub use error::{AdmissionError, StatusCode, StoreError};
pub use rate_limit::strategies::{
    ConcurrencyLimiter, ConcurrencyPermit, FailurePolicy, FixedWindowLimiter, LeakyBucket,
    SlidingWindowLimiter, TokenBucket,
};
#[cfg(feature = "redis")]
pub use rate_limit::redis_store::RedisWindowStore;
pub use rate_limit::store::{MemoryWindowStore, WindowRequest, WindowStore};
pub use rate_limit::{
    Admission, AdmissionLayer, AdmissionService, ContextExtractor, Decision, DefaultContext,
    Limiter, LimiterKind, RejectReason,
};
pub use stack::{AdmissionStack, AdmissionStackBuilder};
pub use telemetry::{AdmissionMetrics, MetricsSnapshot};
