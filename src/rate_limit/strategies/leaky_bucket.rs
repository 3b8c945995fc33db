use crate::config::{normalize_count, normalize_duration, ConfigError};
use crate::config::{DEFAULT_CAPACITY, DEFAULT_INTERVAL};
use crate::context::AdmitContext;
use crate::rate_limit::refill::{RefillPool, TakeError};
use crate::rate_limit::{Decision, Limiter, LimiterKind, RejectReason};
use async_trait::async_trait;
use std::time::Duration;

const NAME: &str = "leaky_bucket";

/// Constant-rate smoothing.
///
/// The bucket holds at most `capacity` drops and gains one every `rate`; a request is
/// admitted only if it can take a drop right now. Sustained throughput is capped at one
/// request per `rate`, while `capacity` bounds the burst absorbed before that cap bites.
/// The bucket starts full.
#[derive(Debug)]
pub struct LeakyBucket {
    pool: RefillPool,
}

impl LeakyBucket {
    /// Full bucket of `capacity` drops, one added per `rate`. Zero values fall back to the
    /// defaults.
    ///
    /// # Errors
    /// Returns `ConfigError::NoRuntime` when called outside a tokio runtime.
    pub fn new(capacity: usize, rate: Duration) -> Result<Self, ConfigError> {
        Self::with_initial_level(capacity, rate, usize::MAX)
    }

    /// Start with `level` drops instead of a full bucket.
    pub fn with_initial_level(
        capacity: usize,
        rate: Duration,
        level: usize,
    ) -> Result<Self, ConfigError> {
        let capacity = normalize_count(NAME, "capacity", capacity, DEFAULT_CAPACITY);
        let rate = normalize_duration(NAME, "rate", rate, DEFAULT_INTERVAL);
        Ok(Self { pool: RefillPool::spawn(capacity, rate, level, NAME)? })
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn rate(&self) -> Duration {
        self.pool.period()
    }

    /// Drops currently in the bucket.
    pub fn level(&self) -> usize {
        self.pool.available()
    }

    pub fn is_shut_down(&self) -> bool {
        self.pool.is_shut_down()
    }

    /// Take one drop without waiting.
    ///
    /// # Errors
    /// `BucketEmpty` when there is nothing to take, `ShutDown` after shutdown.
    pub fn try_admit(&self) -> Result<(), RejectReason> {
        match self.pool.try_take() {
            Ok(()) => Ok(()),
            Err(TakeError::Empty) => Err(RejectReason::BucketEmpty),
            Err(TakeError::Closed) => Err(RejectReason::ShutDown),
        }
    }
}

#[async_trait]
impl Limiter for LeakyBucket {
    fn kind(&self) -> LimiterKind {
        LimiterKind::LeakyBucket
    }

    async fn admit(&self, ctx: &AdmitContext) -> Decision {
        if let Some(reason) = ctx.check() {
            return Decision::reject(reason);
        }
        match self.try_admit() {
            Ok(()) => Decision::Admit,
            Err(RejectReason::BucketEmpty) => {
                Decision::reject_after(RejectReason::BucketEmpty, self.rate())
            }
            Err(reason) => Decision::reject(reason),
        }
    }

    async fn shutdown(&self) {
        self.pool.shutdown(NAME).await;
    }
}
