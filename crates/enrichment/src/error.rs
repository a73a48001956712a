use std::time::Duration;

use thiserror::Error;

use docpipe_core::{Classify, ErrorClass};

/// Failure reported by an external enrichment/embedding operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnrichmentError {
    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rejected by service: {0}")]
    Rejected(String),
}

impl Classify for EnrichmentError {
    fn class(&self) -> ErrorClass {
        match self {
            EnrichmentError::Timeout(_)
            | EnrichmentError::Unavailable(_)
            | EnrichmentError::RateLimited { .. } => ErrorClass::Retryable,
            EnrichmentError::InvalidInput(_)
            | EnrichmentError::Unauthorized(_)
            | EnrichmentError::Rejected(_) => ErrorClass::Terminal,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            EnrichmentError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_are_retryable() {
        assert_eq!(EnrichmentError::Timeout("t".into()).class(), ErrorClass::Retryable);
        assert_eq!(EnrichmentError::Unavailable("503".into()).class(), ErrorClass::Retryable);
        let limited = EnrichmentError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(limited.class(), ErrorClass::Retryable);
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn permanent_failures_are_terminal() {
        assert_eq!(EnrichmentError::InvalidInput("x".into()).class(), ErrorClass::Terminal);
        assert_eq!(EnrichmentError::Unauthorized("key".into()).class(), ErrorClass::Terminal);
        assert_eq!(EnrichmentError::Rejected("schema".into()).class(), ErrorClass::Terminal);
    }
}
