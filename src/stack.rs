//! Admission stack builder for composing limiters and a circuit breaker

use crate::config::{AdmissionConfig, ConfigError, LimiterParams};
use crate::rate_limit::store::WindowStore;
use crate::rate_limit::strategies::{
    ConcurrencyLimiter, FixedWindowLimiter, LeakyBucket, SlidingWindowLimiter, TokenBucket,
};
use crate::rate_limit::{decide, CompletionGuard, Limiter};
use crate::{AdmissionError, AdmitContext, CircuitBreakerConfig, CircuitBreakerPolicy};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Limiters in a fixed order, then an optional circuit breaker, then the handler.
///
/// Each stage either rejects or hands over to the next. Limiters that already admitted a
/// request are told it finished (see [`Limiter::complete`]) when it does, including when
/// a later stage rejects it. Clones share every limiter and the breaker.
#[derive(Clone, Debug, Default)]
pub struct AdmissionStack {
    limiters: Vec<Arc<dyn Limiter>>,
    circuit_breaker: Option<CircuitBreakerPolicy>,
}

impl AdmissionStack {
    pub fn builder() -> AdmissionStackBuilder {
        AdmissionStackBuilder::new()
    }

    /// Build the pipeline described by `config`.
    ///
    /// `store` backs every sliding-window limiter in the config. Bucket limiters start
    /// their generators on the current tokio runtime.
    ///
    /// # Errors
    /// `MissingWindowStore` when a sliding window is configured without a store,
    /// `NoRuntime` when buckets are configured outside a runtime.
    pub fn from_config(
        config: &AdmissionConfig,
        store: Option<Arc<dyn WindowStore>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = AdmissionStackBuilder::new();
        for spec in &config.limiters {
            let limiter: Arc<dyn Limiter> = match LimiterParams::from(spec) {
                LimiterParams::Concurrency { threshold } => {
                    Arc::new(ConcurrencyLimiter::new(threshold))
                }
                LimiterParams::FixedWindow { threshold, window } => {
                    Arc::new(FixedWindowLimiter::new(threshold, window))
                }
                LimiterParams::SlidingWindow {
                    threshold,
                    window,
                    failure_policy,
                    timeout,
                    key_prefix,
                } => {
                    let store = store.clone().ok_or(ConfigError::MissingWindowStore)?;
                    let mut limiter = SlidingWindowLimiter::from_arc(store, threshold, window)
                        .with_failure_policy(failure_policy)
                        .with_timeout(timeout);
                    if let Some(prefix) = key_prefix {
                        limiter = limiter.with_key_prefix(prefix);
                    }
                    Arc::new(limiter)
                }
                LimiterParams::TokenBucket { capacity, interval, initial } => {
                    Arc::new(TokenBucket::with_initial_tokens(capacity, interval, initial)?)
                }
                LimiterParams::LeakyBucket { capacity, rate, initial } => {
                    Arc::new(LeakyBucket::with_initial_level(capacity, rate, initial)?)
                }
            };
            builder = builder.shared_limiter(limiter);
        }
        if let Some(spec) = &config.circuit_breaker {
            builder = builder.circuit_breaker_with_config(CircuitBreakerConfig::from(spec));
        }

        let stack = builder.build();
        tracing::debug!(
            limiters = stack.limiters.len(),
            circuit_breaker = stack.circuit_breaker.is_some(),
            "admission stack built from config"
        );
        Ok(stack)
    }

    pub fn limiters(&self) -> &[Arc<dyn Limiter>] {
        &self.limiters
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreakerPolicy> {
        self.circuit_breaker.as_ref()
    }

    /// Run `operation` if every stage admits it.
    ///
    /// # Errors
    /// The first rejection (limiter or breaker) without invoking `operation`, or
    /// whatever `operation` returns.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        ctx: &AdmitContext,
        operation: Op,
    ) -> Result<T, AdmissionError<E>>
    where
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, AdmissionError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let mut admitted = Vec::with_capacity(self.limiters.len());
        for limiter in &self.limiters {
            decide(&**limiter, ctx).await.into_result()?;
            admitted.push(CompletionGuard::new(limiter.clone()));
        }

        match &self.circuit_breaker {
            Some(breaker) => breaker.execute(operation).await,
            None => operation().await,
        }
    }

    /// Stop every limiter's background work and wait for it to exit.
    pub async fn shutdown(&self) {
        for limiter in &self.limiters {
            limiter.shutdown().await;
        }
    }
}

#[derive(Debug, Default)]
pub struct AdmissionStackBuilder {
    limiters: Vec<Arc<dyn Limiter>>,
    circuit_breaker: Option<CircuitBreakerPolicy>,
}

impl AdmissionStackBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a limiter; limiters run in the order they were added.
    pub fn limiter<L: Limiter + 'static>(self, limiter: L) -> Self {
        self.shared_limiter(Arc::new(limiter))
    }

    /// Append a limiter that is also used elsewhere (another stack, a tower layer).
    pub fn shared_limiter(mut self, limiter: Arc<dyn Limiter>) -> Self {
        self.limiters.push(limiter);
        self
    }

    pub fn circuit_breaker(mut self, failures: usize, recovery_timeout: Duration) -> Self {
        self.circuit_breaker = Some(CircuitBreakerPolicy::new(failures, recovery_timeout));
        self
    }

    pub fn circuit_breaker_with_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(CircuitBreakerPolicy::with_config(config));
        self
    }

    pub fn circuit_breaker_policy(mut self, policy: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker = Some(policy);
        self
    }

    pub fn build(self) -> AdmissionStack {
        AdmissionStack { limiters: self.limiters, circuit_breaker: self.circuit_breaker }
    }
}
