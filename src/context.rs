//! Per-request admission context.
//!
//! An [`AdmitContext`] carries what a limiter may need to know about the request it is
//! judging: the rate-limit key (for keyed strategies such as the sliding window), an
//! optional deadline and an optional cancellation token. Checking the context is never a
//! wait: an already-cancelled or already-expired caller is rejected immediately.

use crate::rate_limit::RejectReason;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Request metadata consulted by limiters before they touch their own state.
#[derive(Debug, Clone, Default)]
pub struct AdmitContext {
    key: Option<Arc<str>>,
    deadline: Option<Instant>,
    cancellation: Option<CancellationToken>,
}

impl AdmitContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a keyed request (e.g. client id, tenant or method name).
    pub fn keyed(key: impl Into<Arc<str>>) -> Self {
        Self::default().with_key(key)
    }

    pub fn with_key(mut self, key: impl Into<Arc<str>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the rejection reason if the caller is already gone.
    pub fn check(&self) -> Option<RejectReason> {
        if self.cancellation.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Some(RejectReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(RejectReason::DeadlineExceeded),
            _ => None,
        }
    }
}
