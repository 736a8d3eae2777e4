//! Pipeline failure taxonomy.

use thiserror::Error;

use crate::anythingllm::ServiceError;
use crate::scoring::{ReportError, ScoringError};
use crate::sheet::SinkError;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Credential missing or rejected
    #[error("Authentication failed: {0}")]
    Auth(ServiceError),

    /// Workspace could not be found or created
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// Question source unreadable
    #[error("Source error: {0}")]
    Source(#[from] SinkError),

    /// A reference document could not be uploaded
    #[error("Ingestion error: {0}")]
    Ingestion(String),

    /// One item's chat call failed or returned nothing usable
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Scoring error: {0}")]
    Scoring(#[from] ScoringError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Persist error: {0}")]
    Persist(String),
}

impl PipelineError {
    /// Fatal errors end the task in Error; the rest are logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Auth(_) | PipelineError::Workspace(_) | PipelineError::Source(_)
        )
    }
}
