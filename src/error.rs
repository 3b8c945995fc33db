//! Error types for admission policies
use crate::rate_limit::RejectReason;
use std::fmt;
use std::time::Duration;

/// Status code attached to every admission error, mirroring the gRPC codes a transport
/// would put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Throttled by a limiter.
    ResourceExhausted,
    /// Circuit open, or the limiter backend is down and the policy is fail-closed.
    Unavailable,
    /// The caller cancelled before admission.
    Cancelled,
    /// The caller's deadline had already passed at admission time.
    DeadlineExceeded,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
        };
        f.write_str(name)
    }
}

/// Unified error type for all admission policies
#[derive(Debug, Clone)]
pub enum AdmissionError<E> {
    /// A limiter rejected the request
    Rejected { reason: RejectReason, retry_after: Option<Duration> },
    /// The limiter backend could not be consulted and the limiter fails closed
    BackendUnavailable { reason: String },
    /// The circuit breaker is open
    CircuitOpen { failure_count: usize, open_duration: Duration },
    /// The caller's cancellation token fired before admission
    Cancelled,
    /// The caller's deadline passed before admission
    DeadlineExceeded,
    /// The downstream handler failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected { reason, retry_after: Some(wait) } => {
                write!(f, "request rejected: {} (retry after {:?})", reason, wait)
            }
            Self::Rejected { reason, retry_after: None } => {
                write!(f, "request rejected: {}", reason)
            }
            Self::BackendUnavailable { reason } => {
                write!(f, "admission backend unavailable: {}", reason)
            }
            Self::CircuitOpen { failure_count, open_duration } => {
                write!(
                    f,
                    "circuit breaker open ({} failures, open for {:?})",
                    failure_count, open_duration
                )
            }
            Self::Cancelled => write!(f, "request cancelled before admission"),
            Self::DeadlineExceeded => write!(f, "request deadline exceeded before admission"),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> AdmissionError<E> {
    /// Build the error matching a limiter rejection.
    pub fn from_rejection(reason: RejectReason, retry_after: Option<Duration>) -> Self {
        match reason {
            RejectReason::Cancelled => Self::Cancelled,
            RejectReason::DeadlineExceeded => Self::DeadlineExceeded,
            RejectReason::BackendUnavailable => {
                Self::BackendUnavailable { reason: reason.to_string() }
            }
            _ => Self::Rejected { reason, retry_after },
        }
    }

    /// Status code a transport should report for this error.
    ///
    /// `Inner` errors carry no admission status; they belong to the handler.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Rejected { .. } => Some(StatusCode::ResourceExhausted),
            Self::BackendUnavailable { .. } | Self::CircuitOpen { .. } => {
                Some(StatusCode::Unavailable)
            }
            Self::Cancelled => Some(StatusCode::Cancelled),
            Self::DeadlineExceeded => Some(StatusCode::DeadlineExceeded),
            Self::Inner(_) => None,
        }
    }

    /// Check if a limiter throttled the request
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
    /// Check if this error is due to circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
    /// Check if the limiter backend was unreachable
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
    /// Check if this error wraps a handler error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Rejection reason, if a limiter rejected the request.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }
    /// Retry hint attached to a rejection.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Rejected { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Change the inner error type, keeping every admission variant as is.
    pub fn map_inner<F, T>(self, f: F) -> AdmissionError<T>
    where
        F: FnOnce(E) -> T,
    {
        match self {
            Self::Rejected { reason, retry_after } => {
                AdmissionError::Rejected { reason, retry_after }
            }
            Self::BackendUnavailable { reason } => AdmissionError::BackendUnavailable { reason },
            Self::CircuitOpen { failure_count, open_duration } => {
                AdmissionError::CircuitOpen { failure_count, open_duration }
            }
            Self::Cancelled => AdmissionError::Cancelled,
            Self::DeadlineExceeded => AdmissionError::DeadlineExceeded,
            Self::Inner(e) => AdmissionError::Inner(f(e)),
        }
    }
}

impl<E> AdmissionError<AdmissionError<E>> {
    /// Collapse the nesting produced by stacking admission layers.
    pub fn flatten(self) -> AdmissionError<E> {
        match self {
            Self::Inner(inner) => inner,
            Self::Rejected { reason, retry_after } => {
                AdmissionError::Rejected { reason, retry_after }
            }
            Self::BackendUnavailable { reason } => AdmissionError::BackendUnavailable { reason },
            Self::CircuitOpen { failure_count, open_duration } => {
                AdmissionError::CircuitOpen { failure_count, open_duration }
            }
            Self::Cancelled => AdmissionError::Cancelled,
            Self::DeadlineExceeded => AdmissionError::DeadlineExceeded,
        }
    }
}

/// Errors raised by a [`WindowStore`](crate::rate_limit::store::WindowStore) backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The atomic script failed on the server.
    #[error("store script failed: {0}")]
    Script(String),
    /// The round trip exceeded the configured timeout.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    /// The script returned something other than 0/1.
    #[error("unexpected store reply: {0}")]
    UnexpectedReply(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Script(err.to_string())
        }
    }
}
