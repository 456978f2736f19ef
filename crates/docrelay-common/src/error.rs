//! Error types for docrelay
//!
//! Every stage returns [`RelayError`]. Stages log the error with context and
//! hand it back unchanged; nothing in the workspace retries or recovers.

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for docrelay
#[derive(Error, Debug)]
pub enum RelayError {
    /// Missing or invalid environment configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Secret store lookup failed or the payload is missing fields
    #[error("Secret error: {0}")]
    Secret(String),

    /// The document repository rejected the client credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Remote file not found: {0}")]
    RemoteFileNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Spreadsheet could not be read or re-serialized as CSV
    #[error("Format conversion failed: {0}")]
    Conversion(String),

    #[error("Object store upload failed: {0}")]
    Upload(String),

    /// A database statement was rejected or could not be executed
    #[error("Statement failed: {message}")]
    Statement {
        message: String,
        sql_state: Option<String>,
    },

    /// The bulk-copy projection does not match the declared table columns
    #[error(
        "Schema mismatch on {table}: copy selects {projected} values for {declared} declared columns"
    )]
    SchemaMismatch {
        table: String,
        declared: usize,
        projected: usize,
    },

    #[error("Network error: {0}")]
    Network(String),
}

impl RelayError {
    pub fn config(message: impl Into<String>) -> Self {
        RelayError::Config(message.into())
    }

    pub fn conversion(message: impl Into<String>) -> Self {
        RelayError::Conversion(message.into())
    }

    pub fn statement(message: impl Into<String>) -> Self {
        RelayError::Statement {
            message: message.into(),
            sql_state: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_mismatch_message() {
        let err = RelayError::SchemaMismatch {
            table: "DB.SCHEMA.SHAREPOINT_FILE".to_string(),
            declared: 3,
            projected: 5,
        };
        assert_eq!(
            err.to_string(),
            "Schema mismatch on DB.SCHEMA.SHAREPOINT_FILE: copy selects 5 values for 3 declared columns"
        );
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err: RelayError = io.into();
        assert!(matches!(err, RelayError::Io(_)));
        assert!(err.to_string().contains("read-only"));
    }
}
