//! Error model shared by every pipeline component.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only (validation, identifiers, conflicts).
/// Storage and transport failures belong to the infra error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// A conflict occurred (e.g. stale owner / concurrent transition).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}

/// Whether a failure is worth another attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeouts, transient network/service errors, rate limiting.
    Retryable,
    /// Invalid input, auth failure, permanent validation failure.
    Terminal,
}

/// Errors that can be routed through the retry wrapper.
pub trait Classify {
    fn class(&self) -> ErrorClass;

    /// Minimum wait requested by the failing service (e.g. `Retry-After`).
    fn retry_after(&self) -> Option<std::time::Duration> {
        None
    }
}

/// Kind of the terminal error recorded on a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient failure that exhausted its retry budget.
    Retryable,
    /// Permanent failure (bad input, external rejection).
    Terminal,
    /// Liveness failure detected by the stuck-job monitor.
    StuckJobTimeout,
    /// Checkpoint ordering violation (concurrent executor race).
    OutOfOrder,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Retryable => "retryable",
            ErrorKind::Terminal => "terminal",
            ErrorKind::StuckJobTimeout => "stuck_job_timeout",
            ErrorKind::OutOfOrder => "out_of_order",
        }
    }
}

impl core::str::FromStr for ErrorKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retryable" => Ok(ErrorKind::Retryable),
            "terminal" => Ok(ErrorKind::Terminal),
            "stuck_job_timeout" => Ok(ErrorKind::StuckJobTimeout),
            "out_of_order" => Ok(ErrorKind::OutOfOrder),
            other => Err(DomainError::validation(format!("unknown error kind: {other}"))),
        }
    }
}

impl From<ErrorClass> for ErrorKind {
    fn from(class: ErrorClass) -> Self {
        match class {
            ErrorClass::Retryable => ErrorKind::Retryable,
            ErrorClass::Terminal => ErrorKind::Terminal,
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error persisted on a job that reached `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Terminal, message)
    }

    pub fn stuck(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StuckJobTimeout, message)
    }
}

impl core::fmt::Display for JobError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_names_round_trip() {
        for kind in [
            ErrorKind::Retryable,
            ErrorKind::Terminal,
            ErrorKind::StuckJobTimeout,
            ErrorKind::OutOfOrder,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
        assert!("flaky".parse::<ErrorKind>().is_err());
    }

    #[test]
    fn job_error_displays_kind_and_message() {
        let err = JobError::stuck("heartbeat lapsed");
        assert_eq!(err.to_string(), "stuck_job_timeout: heartbeat lapsed");
        assert_eq!(ErrorKind::from(ErrorClass::Retryable), ErrorKind::Retryable);
    }
}
