use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("duplicate job id: {0}")]
    DuplicateJob(String),

    #[error("{0}")]
    Validation(String),

    #[error("unknown config key: {0}")]
    UnknownConfigKey(String),

    #[error("no jobs in dead-letter queue")]
    DlqEmpty,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("control plane unavailable")]
    CoreUnavailable,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server error: {0}")]
    Remote(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
