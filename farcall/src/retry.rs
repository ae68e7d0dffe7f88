use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{Error, ErrorClass, ErrorKind, OperationMode, RuntimeConfig};

/// Whether a failed attempt may be reissued at all, before asking the
/// runtime's [`RetryPolicy`].
///
/// Remote failures, argument and mode errors, timeouts and cancellation
/// are never eligible. A missing target always is. A transport failure is
/// eligible when the request was not sent, when the operation is
/// idempotent, or when the server closed the connection gracefully.
#[must_use]
pub fn is_retry_eligible(kind: &ErrorKind, sent: bool, mode: OperationMode) -> bool {
    match kind.class() {
        ErrorClass::TargetNotFound => true,
        ErrorClass::TransportFailure => {
            !sent || mode == OperationMode::Idempotent || kind.is_graceful_close()
        }
        ErrorClass::RemoteFailure
        | ErrorClass::ArgumentError
        | ErrorClass::ModeError
        | ErrorClass::CancelledError => false,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given backoff.
    Retry(Duration),
    Deny,
}

/// Decides whether an eligible failure is retried.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// `attempt` is the number of attempts made so far, from 1.
    fn should_retry(&self, error: &Error, attempt: u32) -> RetryDecision;
}

/// Retries up to a fixed number of times with exponential backoff, and
/// never once the runtime is destroyed.
#[derive(Debug, Clone)]
pub struct BoundedRetryPolicy {
    config: RuntimeConfig,
    destroyed: CancellationToken,
}

impl BoundedRetryPolicy {
    #[must_use]
    pub fn new(config: RuntimeConfig, destroyed: CancellationToken) -> Self {
        Self { config, destroyed }
    }
}

impl RetryPolicy for BoundedRetryPolicy {
    fn should_retry(&self, error: &Error, attempt: u32) -> RetryDecision {
        if self.destroyed.is_cancelled() || error.kind == ErrorKind::RuntimeDestroyed {
            return RetryDecision::Deny;
        }
        if attempt > self.config.max_retry_attempts {
            return RetryDecision::Deny;
        }
        RetryDecision::Retry(self.config.backoff(attempt))
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn should_retry(&self, _: &Error, _: u32) -> RetryDecision {
        RetryDecision::Deny
    }
}
