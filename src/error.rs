//! Error types shared across the indexing, retrieval, and reasoning layers.
//!
//! Library functions return [`Result<T>`] with a [`WeavrError`]; the binary
//! wraps these in `anyhow` with command-level context.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WeavrError>;

#[derive(Debug, Error)]
pub enum WeavrError {
    #[error("not found: {}: {reason}", .path.display())]
    NotFound { path: PathBuf, reason: String },

    #[error("permission denied: {}: {reason}", .path.display())]
    Permission { path: PathBuf, reason: String },

    #[error("security violation: {}: {reason}", .path.display())]
    Security { path: PathBuf, reason: String },

    #[error("invalid generation parameters: {}", join_violations(.0))]
    InvalidParameters(Vec<ParamViolation>),

    #[error("index inconsistency: {0}")]
    IndexInconsistency(String),

    #[error("model call failed: {0}")]
    ModelCall(#[from] ModelCallError),

    #[error("knowledge base root is not configured")]
    NoRoot,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WeavrError {
    pub(crate) fn not_found(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        WeavrError::NotFound {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn permission(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        WeavrError::Permission {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn security(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        WeavrError::Security {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// One violated generation-parameter constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamViolation {
    TemperatureOutOfRange(f32),
    MaxTokensNotPositive(i64),
    TopPOutOfRange(f32),
}

impl fmt::Display for ParamViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamViolation::TemperatureOutOfRange(t) => {
                write!(f, "temperature must be within [0, 1], got {t}")
            }
            ParamViolation::MaxTokensNotPositive(n) => {
                write!(f, "max output length must be a positive integer, got {n}")
            }
            ParamViolation::TopPOutOfRange(p) => {
                write!(f, "top_p must be within (0, 1], got {p}")
            }
        }
    }
}

fn join_violations(violations: &[ParamViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure of the external text-completion service.
#[derive(Debug, Error)]
pub enum ModelCallError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("model not configured: {0}")]
    Unconfigured(String),
}
