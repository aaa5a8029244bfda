//! Error types for Sluice.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Definition errors
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid definition: {0}")]
    Validation(String),

    #[error("Cycle detected in stage dependencies: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Stage '{stage}' references unknown {target}")]
    DanglingReference { stage: String, target: String },

    // Admission errors
    #[error("Admission queue for pipeline {pipeline} is full ({capacity} waiting)")]
    Backpressure { pipeline: String, capacity: usize },

    // Execution errors
    #[error("Data source unreachable: {0}")]
    Connection(String),

    #[error("Execution timed out after {seconds}s")]
    ExecutionTimeout { seconds: u64 },

    #[error("Stage '{stage}' timed out after {seconds}s")]
    StageTimeout { stage: String, seconds: u64 },

    #[error("Schema mismatch: {0}")]
    Schema(String),

    #[error("Execution already terminal: {0}")]
    AlreadyTerminal(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether a failure with this error may be retried.
    ///
    /// Connection failures and transient I/O are retryable; validation and
    /// schema failures, timeouts, and admission rejections are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Io(_))
    }

    /// Whether this is a definition validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::Cycle(_) | Error::DanglingReference { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::Connection("warehouse".into()).is_retryable());
        assert!(!Error::Schema("missing column".into()).is_retryable());
        assert!(!Error::Validation("bad".into()).is_retryable());
        assert!(
            !Error::StageTimeout {
                stage: "load".into(),
                seconds: 5
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_cycle_message_names_stages() {
        let err = Error::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(
            err.to_string(),
            "Cycle detected in stage dependencies: a -> b -> a"
        );
        assert!(err.is_validation());
    }
}
