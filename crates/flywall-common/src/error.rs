//! Error model for the flywall core
//!
//! Every error carries a kind plus key/value attributes used by
//! structured logging and by tests asserting on failure causes.

use std::fmt;
use thiserror::Error;

/// Classified failure cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Input failed validation; attributes carry the offending field path
    Validation,
    /// Referenced object does not exist
    NotFound,
    /// Concurrent modification or version mismatch
    Conflict,
    /// Hash-chain mismatch between replicas
    Divergence,
    /// Authentication or authorization failure
    Unauthorized,
    /// Deadline exceeded or operation cancelled
    Timeout,
    /// Dependency (kernel, peer, disk) not reachable
    Unavailable,
    /// Invariant violation inside the core
    Internal,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Validation => "validation",
            Kind::NotFound => "not_found",
            Kind::Conflict => "conflict",
            Kind::Divergence => "divergence",
            Kind::Unauthorized => "unauthorized",
            Kind::Timeout => "timeout",
            Kind::Unavailable => "unavailable",
            Kind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Core error: a kind, a message and ordered attributes.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: Kind,
    message: String,
    attrs: Vec<(String, String)>,
}

impl Error {
    /// Create an error of the given kind.
    pub fn new(kind: Kind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            attrs: Vec::new(),
        }
    }

    /// Validation failure; pair with a `field` attribute for the path.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(Kind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Kind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(Kind::Conflict, message)
    }

    pub fn divergence(message: impl Into<String>) -> Self {
        Self::new(Kind::Divergence, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(Kind::Unauthorized, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(Kind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Kind::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Kind::Internal, message)
    }

    /// Attach an attribute, preserving insertion order.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attrs.push((key.into(), value.to_string()));
        self
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn attrs(&self) -> &[(String, String)] {
        &self.attrs
    }

    /// First value recorded for `key`, if any.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => Kind::NotFound,
            std::io::ErrorKind::TimedOut => Kind::Timeout,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => Kind::Unavailable,
            _ => Kind::Internal,
        };
        Error::new(kind, e.to_string()).with_attr("io_kind", format!("{:?}", e.kind()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::internal(e.to_string()).with_attr("source", "serde_json")
    }
}

/// Result type for the flywall core.
pub type Result<T> = std::result::Result<T, Error>;
