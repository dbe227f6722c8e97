//! Error classification for calls into external dependencies.
//!
//! Retry policies never match on error messages or type names. Every error
//! that crosses the retry engine exposes an [`ErrorKind`] through the
//! [`Classify`] trait, and each policy declares the set of kinds it retries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// ErrorKind
// ─────────────────────────────────────────────────────────────────────────────

/// Named category of failure from an external dependency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, DNS failure, broken pipe.
    Network,
    /// The dependency did not answer in time.
    Timeout,
    /// Rate limit exceeded (HTTP 429 and friends).
    RateLimited,
    /// Server-side failure (5xx).
    Server,
    /// Dependency temporarily unavailable or overloaded.
    Unavailable,
    /// Optimistic-concurrency conflict or lock contention.
    Conflict,
    /// Invalid or expired credentials.
    Authentication,
    /// Insufficient permissions.
    Authorization,
    /// Malformed request (4xx).
    InvalidRequest,
    /// The requested resource does not exist.
    NotFound,
    /// Anything not covered above.
    Internal,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::Network,
        Self::Timeout,
        Self::RateLimited,
        Self::Server,
        Self::Unavailable,
        Self::Conflict,
        Self::Authentication,
        Self::Authorization,
        Self::InvalidRequest,
        Self::NotFound,
        Self::Internal,
    ];

    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Server => "server",
            Self::Unavailable => "unavailable",
            Self::Conflict => "conflict",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::InvalidRequest => "invalid_request",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }

    /// Kinds that are transient by nature.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimited | Self::Server | Self::Unavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no [`ErrorKind`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("unknown error kind: {0}")]
pub struct UnknownErrorKind(pub String);

impl FromStr for ErrorKind {
    type Err = UnknownErrorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownErrorKind(s.to_owned()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Classify
// ─────────────────────────────────────────────────────────────────────────────

/// An error that can report its [`ErrorKind`].
pub trait Classify {
    /// The category this error falls into.
    fn error_kind(&self) -> ErrorKind;
}

impl<T: Classify + ?Sized> Classify for Box<T> {
    fn error_kind(&self) -> ErrorKind {
        (**self).error_kind()
    }
}

impl<T: Classify + ?Sized> Classify for std::sync::Arc<T> {
    fn error_kind(&self) -> ErrorKind {
        (**self).error_kind()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DependencyError
// ─────────────────────────────────────────────────────────────────────────────

/// A ready-made classified error for call sites without their own error type.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct DependencyError {
    /// Failure category.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Underlying cause, if any.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DependencyError {
    /// Create an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl Classify for DependencyError {
    fn error_kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<std::io::Error> for DependencyError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match err.kind() {
            Io::TimedOut | Io::WouldBlock => ErrorKind::Timeout,
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::AddrNotAvailable => ErrorKind::Network,
            Io::NotFound => ErrorKind::NotFound,
            Io::PermissionDenied => ErrorKind::Authorization,
            Io::InvalidInput | Io::InvalidData => ErrorKind::InvalidRequest,
            _ => ErrorKind::Internal,
        };
        Self::new(kind, err.to_string()).with_source(err)
    }
}
