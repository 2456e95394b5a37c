//! Error types for FerriteDB.

use thiserror::Error;

/// Result type alias using FerriteError.
pub type Result<T> = std::result::Result<T, FerriteError>;

/// Errors that can occur in FerriteDB operations.
#[derive(Debug, Error)]
pub enum FerriteError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    // Buffer manager errors
    #[error("Buffer is full, no page can be evicted")]
    BufferFull,

    #[error("Page corrupted: {page_id}, reason: {reason}")]
    PageCorrupted { page_id: u64, reason: String },

    // Record storage errors
    #[error("Page full, unable to place record")]
    PageFull,

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: FerriteError = io_err.into();
        assert!(matches!(err, FerriteError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_buffer_full_display() {
        let err = FerriteError::BufferFull;
        assert_eq!(err.to_string(), "Buffer is full, no page can be evicted");
    }

    #[test]
    fn test_page_corrupted_display() {
        let err = FerriteError::PageCorrupted {
            page_id: 100,
            reason: "bad slot id".to_string(),
        };
        assert_eq!(err.to_string(), "Page corrupted: 100, reason: bad slot id");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(FerriteError::Internal("test".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FerriteError>();
    }
}
