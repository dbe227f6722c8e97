//! Retry engine errors.

use thiserror::Error;

/// A service class with no policy in the catalog.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("unknown service class: {0}")]
pub struct UnknownServiceClass(pub String);

/// Failure of a retried operation.
///
/// `E` is the operation's own error type. Non-retryable errors come back
/// unmodified inside [`RetryError::Fatal`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// No policy is registered for the requested service class.
    /// No attempt was made.
    #[error("unknown service class: {0}")]
    UnknownServiceClass(String),

    /// The operation failed with an error kind the policy does not retry.
    #[error(transparent)]
    Fatal(E),

    /// Every attempt failed with a retryable error.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made, equal to the policy's `max_attempts`.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        last_error: E,
    },

    /// The call was cancelled while waiting between attempts.
    #[error("retry cancelled after {attempts} attempts")]
    Cancelled {
        /// Attempts made before cancellation.
        attempts: u32,
    },
}

impl<E> RetryError<E> {
    /// The underlying operation error, if one was observed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Fatal(e) | Self::Exhausted { last_error: e, .. } => Some(e),
            Self::UnknownServiceClass(_) | Self::Cancelled { .. } => None,
        }
    }

    /// Attempts made before the error was returned.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::UnknownServiceClass(_) => 0,
            Self::Fatal(_) => 1,
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts } => *attempts,
        }
    }

    /// Whether retries ran out.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

impl<E> From<UnknownServiceClass> for RetryError<E> {
    fn from(err: UnknownServiceClass) -> Self {
        Self::UnknownServiceClass(err.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;
    use tether_core::{DependencyError, ErrorKind};

    #[test]
    fn fatal_is_transparent() {
        let err: RetryError<DependencyError> =
            RetryError::Fatal(DependencyError::new(ErrorKind::InvalidRequest, "bad input"));
        assert_eq!(err.to_string(), "invalid_request: bad input");
        assert_eq!(err.attempts(), 1);
    }

    #[test]
    fn exhausted_wraps_last_error() {
        let err: RetryError<DependencyError> = RetryError::Exhausted {
            attempts: 3,
            last_error: DependencyError::new(ErrorKind::Timeout, "slow"),
        };
        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 3);
        assert!(err.to_string().contains("after 3 attempts"));
        assert!(err.source().is_some());
        let inner = err.into_inner().unwrap();
        assert_eq!(inner.kind, ErrorKind::Timeout);
    }

    #[test]
    fn unknown_class_converts() {
        let err: RetryError<DependencyError> = UnknownServiceClass("cache".into()).into();
        assert_eq!(err.to_string(), "unknown service class: cache");
        assert_eq!(err.attempts(), 0);
        assert!(err.into_inner().is_none());
    }
}
