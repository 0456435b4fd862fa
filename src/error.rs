use thiserror::Error;

/// Crate-wide error taxonomy. HTTP handlers translate the client-facing
/// variants (`NotFound`, `Forbidden`, `Conflict`, `Validation`) to a status
/// code; everything else collapses to 500. Maintenance loops never let
/// these escape: they log and continue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Caller is not permitted to access job {0}")]
    Forbidden(String),

    #[error("Operation conflicts with current job state: {0}")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Transient backend failure: {0}")]
    TransientBackend(String),

    #[error("Permanent backend failure: {0}")]
    PermanentBackend(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
