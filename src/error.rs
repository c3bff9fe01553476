//! Typed failures surfaced by the study service.
//!
//! Internal plumbing works in `anyhow::Result`; anything that reaches a
//! transport is one of the [`StudyError`] variants so the caller can tell a
//! missing project from a busy generator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StudyError {
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("project already exists: {0}")]
    ProjectExists(String),

    /// The generation lock is held by another request. Never queued.
    #[error("the generation backend is busy with another request; retry later")]
    ResourceBusy,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no text could be extracted from {0}")]
    Unparseable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StudyError {
    /// Machine-readable code used in HTTP error bodies and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            StudyError::ProjectNotFound(_) => "not_found",
            StudyError::ProjectExists(_) => "conflict",
            StudyError::ResourceBusy => "busy",
            StudyError::InvalidInput(_) => "bad_request",
            StudyError::Unparseable(_) => "unparseable",
            StudyError::Other(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, StudyError>;
