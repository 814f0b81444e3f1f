use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Engine error taxonomy.
///
/// Only caller errors (see [`EngineError::is_caller_error`]) ever reach a caller of
/// [`crate::Orchestrator::execute`]. Staging and provisioning faults are
/// retried once and then folded into an `InternalError` verdict.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("{field} exceeds maximum size of {limit} bytes")]
    TooLarge { field: &'static str, limit: usize },

    #[error("failed to stage submission {id}: {source}")]
    Staging {
        id: Uuid,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to provision sandbox for submission {id}: {reason}")]
    Provision { id: Uuid, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid language registry {path}: {reason}")]
    Registry { path: PathBuf, reason: String },
}

impl EngineError {
    /// Caller mistakes, surfaced immediately and never retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            EngineError::UnknownLanguage(_)
                | EngineError::InvalidSubmission(_)
                | EngineError::TooLarge { .. }
        )
    }
}
