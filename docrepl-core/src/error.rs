//! Error types for docrepl core

use std::io::ErrorKind;
use thiserror::Error;

/// Result type alias using the docrepl Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the replication and commit pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from sockets, spool files or storage
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// LMDB/heed database errors
    #[error("Database error: {0}")]
    Database(#[from] heed::Error),

    /// Malformed or incomplete wire record
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Change vector text that cannot be parsed
    #[error("Invalid change vector: {0}")]
    InvalidChangeVector(String),

    /// An attachment references content that is neither in the batch nor stored
    #[error("Missing attachment {hash} referenced by '{document_id}'")]
    MissingAttachment {
        /// Content hash of the missing payload
        hash: String,
        /// Document owning the attachment
        document_id: String,
    },

    /// Socket-level failure detected above the I/O layer
    #[error("Network error: {0}")]
    Network(String),

    /// The shutdown token fired
    #[error("Shutdown requested")]
    Shutdown,

    /// Another connection from the same source is still active
    #[error("Connection rejected: {0}")]
    ConnectionRejected(String),

    /// Operation that has no defined behavior in the current mode
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Transaction merger / commit errors
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Storage substrate errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Record encoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classification of errors as seen by the connection handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed wire data, fatal to the connection
    ProtocolViolation,
    /// Recoverable, answered with a typed negative ack
    MissingAttachment,
    /// Socket fault, connection torn down and re-established by the peer
    TransientNetworkFault,
    /// Cancellation observed, clean exit without a reply
    ShutdownRequested,
    /// Operation without defined semantics, fatal to the batch
    UnsupportedOperation,
    /// Everything else
    Internal,
}

impl Error {
    /// Create a protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invalid change vector error
    pub fn invalid_change_vector(msg: impl Into<String>) -> Self {
        Self::InvalidChangeVector(msg.into())
    }

    /// Create a missing attachment error
    pub fn missing_attachment(hash: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self::MissingAttachment {
            hash: hash.into(),
            document_id: document_id.into(),
        }
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a connection rejected error
    pub fn connection_rejected(msg: impl Into<String>) -> Self {
        Self::ConnectionRejected(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a transaction error
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Map this error onto the handler's error taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Protocol(_) | Self::InvalidChangeVector(_) => ErrorClass::ProtocolViolation,
            Self::MissingAttachment { .. } => ErrorClass::MissingAttachment,
            Self::Network(_) => ErrorClass::TransientNetworkFault,
            Self::Io(e) if is_socket_fault(e.kind()) => ErrorClass::TransientNetworkFault,
            Self::Shutdown => ErrorClass::ShutdownRequested,
            Self::Unsupported(_) => ErrorClass::UnsupportedOperation,
            _ => ErrorClass::Internal,
        }
    }

    /// Whether this error must tear down the connection it was raised on
    pub fn is_connection_fatal(&self) -> bool {
        self.class() != ErrorClass::MissingAttachment
    }

    /// Whether this error is a socket-level fault
    pub fn is_network_fault(&self) -> bool {
        self.class() == ErrorClass::TransientNetworkFault
    }

    /// Turn an end of stream inside `what` into a protocol violation
    ///
    /// The peer closing between records is a network fault; closing in the
    /// middle of one leaves a truncated record.
    pub fn truncated(self, what: &str) -> Self {
        match self {
            Self::Io(e) if e.kind() == ErrorKind::UnexpectedEof => {
                Self::Protocol(format!("Truncated {}: stream ended mid-record", what))
            }
            other => other,
        }
    }
}

fn is_socket_fault(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
            | ErrorKind::TimedOut
    )
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            Error::protocol("bad tag").class(),
            ErrorClass::ProtocolViolation
        );
        assert_eq!(
            Error::missing_attachment("abc=", "users/1").class(),
            ErrorClass::MissingAttachment
        );
        assert_eq!(Error::Shutdown.class(), ErrorClass::ShutdownRequested);
        assert_eq!(
            Error::unsupported("revision tombstone").class(),
            ErrorClass::UnsupportedOperation
        );
        assert_eq!(Error::storage("full").class(), ErrorClass::Internal);
    }

    #[test]
    fn test_socket_faults_are_network_errors() {
        let reset = Error::Io(std::io::Error::from(ErrorKind::ConnectionReset));
        assert!(reset.is_network_fault());

        let eof = Error::Io(std::io::Error::from(ErrorKind::UnexpectedEof));
        assert!(eof.is_network_fault());

        let denied = Error::Io(std::io::Error::from(ErrorKind::PermissionDenied));
        assert!(!denied.is_network_fault());
    }

    #[test]
    fn test_truncated_record_is_protocol_violation() {
        let eof = Error::Io(std::io::Error::from(ErrorKind::UnexpectedEof)).truncated("frame");
        assert_eq!(eof.class(), ErrorClass::ProtocolViolation);
        assert!(eof.to_string().contains("Truncated frame"));

        let reset = Error::Io(std::io::Error::from(ErrorKind::ConnectionReset)).truncated("frame");
        assert!(reset.is_network_fault());
    }

    #[test]
    fn test_only_missing_attachment_keeps_connection() {
        assert!(!Error::missing_attachment("h", "d").is_connection_fatal());
        assert!(Error::protocol("x").is_connection_fatal());
        assert!(Error::network("x").is_connection_fatal());
        assert!(Error::internal("x").is_connection_fatal());
    }
}
