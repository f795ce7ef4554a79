//! Breaker error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why a call was refused without being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenReason {
    /// Still cooling down after tripping.
    Cooling { retry_after: Duration },
    /// Half-open and every probe slot is taken.
    ProbeLimit,
}

impl fmt::Display for OpenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenReason::Cooling { retry_after } => {
                write!(f, "retry after {}ms", retry_after.as_millis())
            }
            OpenReason::ProbeLimit => f.write_str("half-open probe limit reached"),
        }
    }
}

/// The breaker refused the call; the wrapped function was not invoked.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit breaker '{name}' is open: {reason}")]
pub struct CircuitOpenError {
    pub name: String,
    pub reason: OpenReason,
}

impl CircuitOpenError {
    /// Suggested wait before the next attempt, if known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self.reason {
            OpenReason::Cooling { retry_after } => Some(retry_after),
            OpenReason::ProbeLimit => None,
        }
    }
}

/// Outcome of a guarded call: either refused by the breaker or the
/// callee's own error.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(#[from] CircuitOpenError),

    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }

    /// The callee's error, if the call was attempted.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open(_) => None,
        }
    }
}
