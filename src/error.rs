use thiserror::Error;

/// Recorder error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecorderError {
    #[error("Recording already running")]
    AlreadyRunning,

    #[error("Recording not running")]
    NotRunning,

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("State store error: {0}")]
    StateStore(String),

    #[error("Source failed: {0}")]
    SourceFailed(String),

    #[error("Write queue full, reading dropped")]
    QueueFull,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for recorder operations
pub type Result<T> = std::result::Result<T, RecorderError>;

impl From<std::io::Error> for RecorderError {
    fn from(err: std::io::Error) -> Self {
        RecorderError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for RecorderError {
    fn from(err: serde_json::Error) -> Self {
        RecorderError::StateStore(err.to_string())
    }
}

/// Map a poisoned lock into an `Internal` error naming the lock
pub(crate) fn lock_poisoned(what: &str) -> RecorderError {
    RecorderError::Internal(format!("Failed to acquire {} lock", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: RecorderError = io.into();
        assert!(matches!(err, RecorderError::StorageError(ref msg) if msg.contains("denied")));
    }

    #[test]
    fn test_lock_poisoned_message() {
        assert_eq!(
            lock_poisoned("session").to_string(),
            "Internal error: Failed to acquire session lock"
        );
    }
}
