use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ScraperError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Corrupt stored row: {0}")]
    CorruptRow(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid edit: {0}")]
    InvalidEdit(String),

    /// Insert hit the pending-row uniqueness check; the caller merges instead.
    #[error("Store conflict: already pending as {existing_id}")]
    StoreConflict { existing_id: Uuid },

    /// Decision attempted on a row that is no longer PENDING.
    #[error("Pending show {id} already decided ({status})")]
    DecisionConflict { id: Uuid, status: String },
}

pub type Result<T> = std::result::Result<T, ScraperError>;
