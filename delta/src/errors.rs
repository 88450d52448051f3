use thiserror::Error;
use tokio::task::JoinError;

/// Errors raised while building, streaming or receiving a delta.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or incomplete TOC or digest references.
    #[error("corrupt or incomplete image metadata at {path}: {reason}")]
    Metadata { path: String, reason: String },

    /// Upstream layer fetch failures or a channel closing mid-stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed frames on the delta channel.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A filesystem node could not be mapped to a content source.
    #[error("no such content reference: {0}")]
    Resolution(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal storage error: {0}")]
    StorageError(String),
}

impl Error {
    pub fn metadata(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Metadata {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::StorageError(format!("serialization: {}", value))
    }
}

impl From<redb::Error> for Error {
    fn from(value: redb::Error) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(value: redb::DatabaseError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(value: redb::TableError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(value: redb::TransactionError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(value: redb::StorageError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(value: redb::CommitError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::InvalidInput => Error::InvalidRequest(value.to_string()),
            std::io::ErrorKind::InvalidData => Error::Protocol(value.to_string()),
            std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::UnexpectedEof => Error::Transport(value.to_string()),
            _ => Error::StorageError(value.to_string()),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Metadata { .. } | Error::Protocol(_) => {
                Self::new(std::io::ErrorKind::InvalidData, value.to_string())
            }
            Error::Transport(msg) => Self::new(std::io::ErrorKind::ConnectionAborted, msg),
            Error::Resolution(msg) => Self::new(std::io::ErrorKind::NotFound, msg),
            Error::InvalidRequest(msg) => Self::new(std::io::ErrorKind::InvalidInput, msg),
            Error::StorageError(msg) => Self::new(std::io::ErrorKind::Other, msg),
        }
    }
}

