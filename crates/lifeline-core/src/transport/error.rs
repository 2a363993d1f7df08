//! Classified transport failures

use std::fmt;
use std::time::Duration;

use serde_json::Value;

use crate::queue::SendFailure;

/// Why a request is worth trying again later
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
    /// 429 that persisted after one inline retry
    RateLimited { retry_after: Option<Duration> },
    /// 5xx response
    ServerError { status: u16 },
    /// No response at all; `offline` if the device knew it was offline
    NetworkAbsent { offline: bool },
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::RateLimited { .. } => write!(f, "rate limited"),
            RetryReason::ServerError { status } => write!(f, "server error {}", status),
            RetryReason::NetworkAbsent { offline: true } => write!(f, "offline"),
            RetryReason::NetworkAbsent { offline: false } => write!(f, "no response from server"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// The server refused the request; retrying will not help
    #[error("request rejected with status {status}")]
    ClientError { status: u16, body: Option<Value> },

    #[error("temporary failure: {0}")]
    Retryable(RetryReason),

    #[error("request failed: {0}")]
    Fatal(String),

    /// Credentials were cleared; the user must sign in again
    #[error("session expired, please sign in again")]
    SessionExpired,
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Retryable(_))
    }

    /// How the action queue should treat this failure
    ///
    /// An expired session or a device known to be offline pauses the queue
    /// instead of spending retries; the pass resumes after sign-in or once
    /// connectivity returns.
    pub fn into_send_failure(self) -> SendFailure {
        match self {
            TransportError::Retryable(reason @ RetryReason::NetworkAbsent { offline: true }) => {
                SendFailure::Paused(reason.to_string())
            }
            TransportError::Retryable(reason) => SendFailure::Retryable(reason.to_string()),
            TransportError::SessionExpired => SendFailure::Paused(self.to_string()),
            TransportError::ClientError { .. } | TransportError::Fatal(_) => {
                SendFailure::Fatal(self.to_string())
            }
        }
    }
}
