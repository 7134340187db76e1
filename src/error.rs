// src/error.rs

use thiserror::Error;

/// Core error types for Galena
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to initialize a subsystem (database, HTTP client, ...)
    #[error("Failed to initialize: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Download failed after retries
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Checksum did not match the recorded one
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Malformed on-disk data (ledger record, settings file, timestamp)
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Package or repository entry not found
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// A conflicting entry already exists
    #[error("Conflict: {0}")]
    ConflictError(String),
}

/// Result type alias using Galena's Error type
pub type Result<T> = std::result::Result<T, Error>;
