//! Error types for the bulk request store.

use thiserror::Error;

/// Bulk store operation result type.
pub type Result<T> = std::result::Result<T, BulkError>;

/// Bulk store errors.
#[derive(Error, Debug)]
pub enum BulkError {
    /// Generic persistence failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// SQLx error (connection, query, constraint, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Subject, restriction, arguments or archive info (de)serialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation requires an existing request
    #[error("Request not found: {0}")]
    RequestNotFound(String),

    /// Caller is not allowed to act on the request
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Rejected query input (unknown sort column, malformed filter)
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Unreadable or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error (config and database files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BulkError {
    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a not found error.
    pub fn not_found(uid: impl Into<String>) -> Self {
        Self::RequestNotFound(uid.into())
    }

    /// Create a permission denied error.
    pub fn permission_denied(uid: impl Into<String>) -> Self {
        Self::PermissionDenied(uid.into())
    }

    /// Create an invalid query error.
    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Self::InvalidQuery(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RequestNotFound(_))
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }
}
