//! Error types for queryscope

use thiserror::Error;

use crate::types::DatabaseId;

/// Main error type for profiling operations
#[derive(Error, Debug)]
pub enum ProfilerError {
    /// Setting or clearing the profiling level failed on the monitored database
    #[error("Profiling configuration failed for {database}: {message}")]
    Configuration {
        /// Database whose level could not be changed
        database: DatabaseId,
        /// Underlying failure
        message: String,
    },

    /// The tail cursor failed while waiting for the next batch
    #[error("Cursor error: {0}")]
    Cursor(String),

    /// A profiler document could not be turned into a log entry
    #[error("Malformed profiler entry: {0}")]
    MalformedEntry(String),

    /// No monitored database is known under this id
    #[error("Unknown database: {0}")]
    UnknownDatabase(DatabaseId),

    /// Database id failed validation
    #[error("Invalid database id: {0:?}")]
    InvalidDatabaseId(String),

    /// A stop raced with a start that was still configuring the database
    #[error("Session start for {0} was interrupted by a concurrent stop")]
    StartInterrupted(DatabaseId),

    /// MongoDB driver error
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// Configuration file could not be read or is invalid
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ProfilerError {
    /// Wrap any displayable failure as a configuration error for `database`.
    pub fn configuration(database: &DatabaseId, err: impl std::fmt::Display) -> Self {
        ProfilerError::Configuration {
            database: database.clone(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ProfilerError {
    fn from(err: serde_json::Error) -> Self {
        ProfilerError::Serialization(err.to_string())
    }
}

/// Result type alias using ProfilerError
pub type ProfilerResult<T> = Result<T, ProfilerError>;
