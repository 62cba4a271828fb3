use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// An operation was issued out of lifecycle order (unbound or ended
    /// session, options changed on a running cursor, ...)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("File {0} not found")]
    FileNotFound(String),

    /// An upload picked an id that already names a file or holds chunks
    #[error("File id {0} is already in use")]
    FileExists(String),

    #[error("Corrupt file {file_id}: {reason}")]
    CorruptFile { file_id: String, reason: String },

    /// Any failure reported by the remote store. Opaque to this layer.
    #[error("Remote operation '{command}' failed: {message}")]
    RemoteOperation { command: String, message: String },

    #[error("Namespace '{0}' not found")]
    NamespaceNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl DbError {
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    pub fn remote(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteOperation {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn is_invalid_operation(&self) -> bool {
        matches!(self, DbError::InvalidOperation(_))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, DbError::RemoteOperation { .. })
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<bson::ser::Error> for DbError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bson::de::Error> for DbError {
    fn from(err: bson::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display() {
        let err = DbError::remote("getMore", "connection reset");
        assert_eq!(
            err.to_string(),
            "Remote operation 'getMore' failed: connection reset"
        );
        assert!(err.is_remote());
        assert!(!err.is_invalid_operation());
    }
}
