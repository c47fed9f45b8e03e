use thiserror::Error;

use crate::events::EventKind;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON serialization error: {}", err))
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(format!("I/O error: {}", err))
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    /// Event is missing payload keys its kind requires. Rejected before append.
    #[error("Schema violation for {kind}: missing required payload fields {missing:?}")]
    SchemaViolation {
        kind: EventKind,
        missing: Vec<String>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    /// A value could not be canonicalized, so it cannot enter the chain.
    #[error("Serialization failure: {0}")]
    Serialization(String),

    #[error("Timestamp authority unavailable: {0}")]
    AnchoringUnavailable(String),

    #[error("Anchor for period {0} already carries a timestamp")]
    AlreadyTimestamped(String),

    #[error("Invalid aggregation period: {0}")]
    InvalidPeriod(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Only raised by callers that escalate a verification report.
    #[error("Tamper detected: {0}")]
    TamperDetected(String),
}

impl LedgerError {
    pub fn schema_violation(kind: EventKind, missing: Vec<&str>) -> Self {
        Self::SchemaViolation {
            kind,
            missing: missing.into_iter().map(str::to_string).collect(),
        }
    }

    /// Whether a retry against the timestamp authority could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AnchoringUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
