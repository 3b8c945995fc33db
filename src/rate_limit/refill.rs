//! Bounded pool refilled by a background generator.
//!
//! Token bucket and leaky bucket are both "a cancellable periodic task writing into a
//! bounded pool". The pool is a counting semaphore: admission is a non-blocking
//! `try_acquire` whose permit is forgotten, the generator is the only writer and adds one
//! permit per tick when below capacity. Since nothing else ever adds permits, the
//! check-then-add in the generator cannot overshoot the capacity.

use crate::config::ConfigError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TakeError {
    Empty,
    Closed,
}

#[derive(Debug)]
pub(crate) struct RefillPool {
    permits: Arc<Semaphore>,
    capacity: usize,
    period: Duration,
    stop: CancellationToken,
    generator: Mutex<Option<JoinHandle<()>>>,
}

impl RefillPool {
    /// Start the generator on the current tokio runtime. The first refill happens one
    /// `period` after construction.
    pub(crate) fn spawn(
        capacity: usize,
        period: Duration,
        initial: usize,
        name: &'static str,
    ) -> Result<Self, ConfigError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        let capacity = capacity.min(Semaphore::MAX_PERMITS);
        let permits = Arc::new(Semaphore::new(initial.min(capacity)));
        let stop = CancellationToken::new();

        let generator = handle.spawn(generate(permits.clone(), capacity, period, stop.clone()));
        tracing::debug!(limiter = name, capacity, ?period, initial, "refill generator started");

        Ok(Self { permits, capacity, period, stop, generator: Mutex::new(Some(generator)) })
    }

    pub(crate) fn try_take(&self) -> Result<(), TakeError> {
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(TryAcquireError::NoPermits) => Err(TakeError::Empty),
            Err(TryAcquireError::Closed) => Err(TakeError::Closed),
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn period(&self) -> Duration {
        self.period
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.permits.is_closed()
    }

    /// Signal the generator, wait for it to exit, then close the pool.
    ///
    /// Safe to call any number of times from any number of tasks. The first caller joins
    /// the generator; concurrent callers wait on the same lock, so nobody returns before
    /// the generator has exited and the pool is closed.
    pub(crate) async fn shutdown(&self, name: &'static str) {
        self.stop.cancel();
        let mut generator = self.generator.lock().await;
        if let Some(handle) = generator.take() {
            if let Err(err) = handle.await {
                tracing::warn!(limiter = name, error = %err, "refill generator ended abnormally");
            }
            self.permits.close();
            tracing::debug!(limiter = name, "refill generator stopped");
        }
    }
}

impl Drop for RefillPool {
    fn drop(&mut self) {
        // Without an explicit shutdown the generator still exits on its next wake-up.
        self.stop.cancel();
    }
}

async fn generate(
    permits: Arc<Semaphore>,
    capacity: usize,
    period: Duration,
    stop: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    // A missed fill is equivalent to a slower rate; never catch up in bursts.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if permits.available_permits() < capacity {
                    permits.add_permits(1);
                }
            }
        }
    }
}
