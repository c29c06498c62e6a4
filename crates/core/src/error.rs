// Central Error Type for the Application

use thiserror::Error;

use crate::domain::ConfigError;
use crate::port::{ArtifactError, ExecutorError};

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Launch error: {0}")]
    Launch(#[source] ExecutorError),

    #[error("Failed to parse handle {identity:?}: {reason}")]
    InvalidHandle { identity: String, reason: String },

    #[error("Reattach error: {0}")]
    Reattach(#[source] ExecutorError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// The task's executor is gone for good, as opposed to a broken connection
    pub fn is_task_gone(&self) -> bool {
        matches!(self, AppError::Reattach(ExecutorError::ExecutorGone(_)))
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
