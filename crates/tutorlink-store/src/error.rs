use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An update targeted a record that does not exist.
    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Stored field map could not be (de)serialized.
    #[error("Field encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backend cannot serve the request right now (connection lost,
    /// permission revoked, live query torn down by the backend).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The backend refused a write. Nothing was committed.
    #[error("Write rejected: {0}")]
    Rejected(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
