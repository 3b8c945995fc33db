//! Admission strategies.
//!
//! Every strategy owns its state exclusively and answers immediately: none of them queue
//! or wait for capacity.
//!
//! | Strategy | Bounds | State |
//! |---|---|---|
//! | [`ConcurrencyLimiter`] | simultaneous requests | one atomic counter |
//! | [`FixedWindowLimiter`] | requests per window, resetting at boundaries | mutex-guarded window |
//! | [`SlidingWindowLimiter`] | requests per moving window, across processes | external [`WindowStore`](crate::rate_limit::store::WindowStore) |
//! | [`TokenBucket`] | sustained rate with burst allowance | refilled bounded pool |
//! | [`LeakyBucket`] | sustained rate with smoothing | refilled bounded pool |

mod concurrency;
mod fixed_window;
mod leaky_bucket;
mod sliding_window;
mod token_bucket;

pub use concurrency::{ConcurrencyLimiter, ConcurrencyPermit};
pub use fixed_window::FixedWindowLimiter;
pub use leaky_bucket::LeakyBucket;
pub use sliding_window::{FailurePolicy, SlidingWindowLimiter, DEFAULT_KEY_PREFIX};
pub use token_bucket::TokenBucket;
