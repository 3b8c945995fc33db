use crate::config::{normalize_count, normalize_duration, ConfigError};
use crate::config::{DEFAULT_CAPACITY, DEFAULT_INTERVAL};
use crate::context::AdmitContext;
use crate::rate_limit::refill::{RefillPool, TakeError};
use crate::rate_limit::{Decision, Limiter, LimiterKind, RejectReason};
use async_trait::async_trait;
use std::time::Duration;

const NAME: &str = "token_bucket";

/// Bursty-but-bounded admission.
///
/// A background task deposits one token every `interval`, discarding it when the bucket
/// already holds `capacity`. Each request takes one token or is rejected; it never waits.
/// The bucket starts empty, so after `T` of idleness at most `min(capacity, T / interval)`
/// requests can be admitted back to back.
///
/// The generator runs on the tokio runtime the bucket was created on. Call
/// [`shutdown`](Limiter::shutdown) to stop it and wait for it to exit.
#[derive(Debug)]
pub struct TokenBucket {
    pool: RefillPool,
}

impl TokenBucket {
    /// Empty bucket refilled with one token per `interval`. Zero values fall back to the
    /// defaults.
    ///
    /// # Errors
    /// Returns `ConfigError::NoRuntime` when called outside a tokio runtime.
    pub fn new(capacity: usize, interval: Duration) -> Result<Self, ConfigError> {
        Self::with_initial_tokens(capacity, interval, 0)
    }

    /// Like [`new`](Self::new), with `initial` tokens (clamped to `capacity`) available
    /// right away.
    pub fn with_initial_tokens(
        capacity: usize,
        interval: Duration,
        initial: usize,
    ) -> Result<Self, ConfigError> {
        let capacity = normalize_count(NAME, "capacity", capacity, DEFAULT_CAPACITY);
        let interval = normalize_duration(NAME, "interval", interval, DEFAULT_INTERVAL);
        Ok(Self { pool: RefillPool::spawn(capacity, interval, initial, NAME)? })
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn interval(&self) -> Duration {
        self.pool.period()
    }

    /// Tokens currently in the bucket.
    pub fn available(&self) -> usize {
        self.pool.available()
    }

    pub fn is_shut_down(&self) -> bool {
        self.pool.is_shut_down()
    }

    /// Take one token without waiting.
    ///
    /// # Errors
    /// `TokensExhausted` when the bucket is empty, `ShutDown` after shutdown.
    pub fn try_admit(&self) -> Result<(), RejectReason> {
        self.pool.try_take().map_err(|err| match err {
            TakeError::Empty => RejectReason::TokensExhausted,
            TakeError::Closed => RejectReason::ShutDown,
        })
    }
}

#[async_trait]
impl Limiter for TokenBucket {
    fn kind(&self) -> LimiterKind {
        LimiterKind::TokenBucket
    }

    async fn admit(&self, ctx: &AdmitContext) -> Decision {
        if let Some(reason) = ctx.check() {
            return Decision::reject(reason);
        }
        match self.try_admit() {
            Ok(()) => Decision::Admit,
            Err(RejectReason::ShutDown) => Decision::reject(RejectReason::ShutDown),
            Err(reason) => Decision::reject_after(reason, self.interval()),
        }
    }

    async fn shutdown(&self) {
        self.pool.shutdown(NAME).await;
    }
}
