//! Error types for Gantry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Job run not found: {0}")]
    JobRunNotFound(String),

    // Workflow errors
    #[error("Invalid workflow definition: {0}")]
    InvalidWorkflow(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Expression error: {0}")]
    Expression(String),

    // Infrastructure errors
    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Authorization backend error: {0}")]
    Authorization(String),

    #[error("Repository client error: {0}")]
    Repository(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
