//! Error taxonomy. Every component owns a typed error enum;
//! `HnscError` aggregates them so the controller has one type to match on,
//! and `ErrorKind` is derived from it so the wire envelope can never drift
//! from the internal taxonomy.

use std::time::Duration;
use thiserror::Error;

use crate::audit::AuditError;
use crate::circuit_breaker::BreakerError;
use crate::dual_model::DriverError;
use crate::pool::PoolError;
use crate::rate_limit::RateLimitError;
use crate::registry::RegistryError;
use crate::router::RouterError;
use crate::safety::SafetyError;
use crate::workflow::WorkflowError;

#[derive(Debug, Error)]
pub enum HnscError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("policy denied: {0:?}")]
    PolicyDenied(Vec<String>),

    #[error(transparent)]
    Schema(#[from] RegistryError),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    CircuitOpen(#[from] BreakerError),

    #[error("upstream dependency unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Safety(#[from] SafetyError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    PolicyDenied,
    SchemaError,
    Timeout,
    Cancelled,
    CircuitOpen,
    UpstreamUnavailable,
    Internal,
}

impl HnscError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HnscError::RateLimited { .. } => ErrorKind::RateLimited,
            HnscError::PolicyDenied(_) => ErrorKind::PolicyDenied,
            HnscError::Schema(_) => ErrorKind::SchemaError,
            HnscError::Timeout => ErrorKind::Timeout,
            HnscError::Cancelled => ErrorKind::Cancelled,
            HnscError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            HnscError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            HnscError::Workflow(_) => ErrorKind::Internal,
            HnscError::Router(_) => ErrorKind::Internal,
            HnscError::Safety(_) => ErrorKind::PolicyDenied,
            HnscError::Driver(_) => ErrorKind::UpstreamUnavailable,
            HnscError::Pool(_) => ErrorKind::UpstreamUnavailable,
            HnscError::RateLimit(_) => ErrorKind::RateLimited,
            HnscError::Audit(_) => ErrorKind::Internal,
            HnscError::InvariantViolation(_) => ErrorKind::Internal,
            HnscError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HnscError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// The only channel for user-facing errors.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub kind: ErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
    pub correlation_id: crate::types::RequestId,
}

impl ErrorEnvelope {
    pub fn from_error(err: &HnscError, correlation_id: crate::types::RequestId) -> Self {
        Self {
            code: format!("{:?}", err.kind()),
            kind: err.kind(),
            message: err.to_string(),
            retry_after: err.retry_after(),
            correlation_id,
        }
    }
}

pub type HnscResult<T> = Result<T, HnscError>;
