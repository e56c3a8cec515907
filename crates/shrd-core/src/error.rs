//! Error types for shrd.
//!
//! This module provides a unified error type for all shrd operations,
//! with specific error variants for different failure modes. Every variant
//! maps onto an [`ErrorClass`], which decides how the failure is handled:
//! network errors are retried on the owner's schedule, everything on the
//! wire side (protocol, integrity, authentication) is fatal to the connection.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// A specialized `Result` type for shrd operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Connection refused/reset/timeout, peer not reachable
    Network,
    /// Malformed or out-of-sequence message
    ProtocolViolation,
    /// Checksum or digest mismatch
    Integrity,
    /// Handshake, signature or pinning failure
    Authentication,
    /// Disk full, permission denied, missing file
    Resource,
    /// Cancelled by the local user or the peer
    Cancelled,
    /// Declined by the receiving side
    Rejected,
    /// Configuration, trust store and internal errors
    Local,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::ProtocolViolation => "protocol",
            Self::Integrity => "integrity",
            Self::Authentication => "authentication",
            Self::Resource => "resource",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::Local => "local",
        };
        f.write_str(name)
    }
}

impl serde::Serialize for ErrorClass {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

/// The main error type for shrd.
#[derive(Error, Debug)]
pub enum Error {
    /// Unable to broadcast on network (E001)
    #[error("unable to broadcast on network: {0}")]
    BroadcastFailed(String),

    /// Could not connect to a peer (E002)
    #[error("failed to connect to {addr}: {reason}")]
    ConnectFailed {
        /// Target address
        addr: SocketAddr,
        /// Underlying failure
        reason: String,
    },

    /// Peer closed the connection (E003)
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Target device is unknown or not online (E004)
    #[error("device '{0}' is not online")]
    PeerUnavailable(String),

    /// Per-peer session limit reached (E005)
    #[error("too many active transfers with device '{0}'")]
    PeerBusy(String),

    /// Chunk checksum mismatch after retransmission (E006)
    #[error("checksum mismatch for chunk {chunk}")]
    ChecksumMismatch {
        /// The chunk index that failed
        chunk: u32,
    },

    /// Full-file digest mismatch (E007)
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest declared by the sender
        expected: String,
        /// Digest computed by the receiver
        actual: String,
    },

    /// Handshake failed (E008)
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Signature verification failed (E009)
    #[error("signature verification failed")]
    SignatureInvalid,

    /// Peer presented a key different from the pinned one (E010)
    #[error("identity key for device '{0}' does not match the pinned key")]
    KeyMismatch(String),

    /// Sealed message carried an unexpected sequence number (E011)
    #[error("unexpected sequence number: expected {expected}, got {actual}")]
    ReplayDetected {
        /// Next expected sequence number
        expected: u64,
        /// Sequence number found in the frame
        actual: u64,
    },

    /// AEAD open failed (E012)
    #[error("decryption failed")]
    DecryptionFailed,

    /// Insufficient disk space (E013)
    #[error("insufficient disk space: need {needed} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Bytes needed
        needed: u64,
        /// Bytes available
        available: u64,
    },

    /// Permission denied (E014)
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Invalid path
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Invalid user input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Transfer was cancelled
    #[error("transfer cancelled")]
    TransferCancelled,

    /// Transfer rejected by receiver
    #[error("transfer rejected by receiver: {0}")]
    TransferRejected(String),

    /// Peer aborted the transfer with an error message
    #[error("peer aborted the transfer: {0}")]
    RemoteAbort(String),

    /// Invalid protocol message
    #[error("invalid protocol message: {0}")]
    ProtocolError(String),

    /// Unsupported protocol version
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Unexpected message type
    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected message type
        expected: String,
        /// Actual message type received
        actual: String,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Trust database error
    #[error("trust database error: {0}")]
    TrustDbError(String),

    /// No session with this id
    #[error("no transfer session with id {0}")]
    SessionNotFound(uuid::Uuid),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operation timeout
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the class this error belongs to.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::BroadcastFailed(_)
            | Self::ConnectFailed { .. }
            | Self::ConnectionClosed
            | Self::PeerUnavailable(_)
            | Self::Timeout(_) => ErrorClass::Network,
            Self::ProtocolError(_)
            | Self::UnsupportedVersion(_)
            | Self::UnexpectedMessage { .. }
            | Self::Serialization(_) => ErrorClass::ProtocolViolation,
            Self::ChecksumMismatch { .. } | Self::DigestMismatch { .. } => ErrorClass::Integrity,
            Self::HandshakeFailed(_)
            | Self::SignatureInvalid
            | Self::KeyMismatch(_)
            | Self::ReplayDetected { .. }
            | Self::DecryptionFailed => ErrorClass::Authentication,
            Self::PeerBusy(_)
            | Self::InsufficientSpace { .. }
            | Self::PermissionDenied(_)
            | Self::FileNotFound(_)
            | Self::InvalidPath(_) => ErrorClass::Resource,
            Self::TransferCancelled => ErrorClass::Cancelled,
            Self::TransferRejected(_) => ErrorClass::Rejected,
            Self::RemoteAbort(reason) => crate::protocol::reason::classify(reason),
            Self::Io(e) => io_class(e),
            Self::ConfigError(_)
            | Self::InvalidConfig { .. }
            | Self::TrustDbError(_)
            | Self::SessionNotFound(_)
            | Self::InvalidInput(_)
            | Self::Internal(_) => ErrorClass::Local,
        }
    }

    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::BroadcastFailed(_) => Some("E001"),
            Self::ConnectFailed { .. } => Some("E002"),
            Self::ConnectionClosed => Some("E003"),
            Self::PeerUnavailable(_) => Some("E004"),
            Self::PeerBusy(_) => Some("E005"),
            Self::ChecksumMismatch { .. } => Some("E006"),
            Self::DigestMismatch { .. } => Some("E007"),
            Self::HandshakeFailed(_) => Some("E008"),
            Self::SignatureInvalid => Some("E009"),
            Self::KeyMismatch(_) => Some("E010"),
            Self::ReplayDetected { .. } => Some("E011"),
            Self::DecryptionFailed => Some("E012"),
            Self::InsufficientSpace { .. } => Some("E013"),
            Self::PermissionDenied(_) => Some("E014"),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable (can be retried).
    ///
    /// Only network failures qualify; a retry always means a new attempt,
    /// never resuming a connection that failed authentication or integrity.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::Network
    }

    /// Returns whether the user should be warned about a possible impersonation.
    #[must_use]
    pub fn is_security_warning(&self) -> bool {
        self.class() == ErrorClass::Authentication
    }

    /// Returns a helpful suggestion for resolving the error, if applicable.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::KeyMismatch(_) => Some(
                "The device presented a different identity than the one paired earlier.\n\
                 If it was reinstalled, remove it with `shrd trust remove <ID>` and pair again.",
            ),
            Self::PeerUnavailable(_) => Some(
                "Check that the device is running `shrd serve` on the same network.\n\
                 Run `shrd devices` to see which devices are online.",
            ),
            Self::InsufficientSpace { .. } => Some("Free some disk space and try again."),
            _ => None,
        }
    }
}

fn io_class(e: &io::Error) -> ErrorClass {
    use io::ErrorKind;

    match e.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::TimedOut
        | ErrorKind::AddrNotAvailable => ErrorClass::Network,
        _ => ErrorClass::Resource,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            Error::PeerUnavailable("a".into()).class(),
            ErrorClass::Network
        );
        assert_eq!(
            Error::ReplayDetected {
                expected: 3,
                actual: 2
            }
            .class(),
            ErrorClass::Authentication
        );
        assert_eq!(
            Error::ChecksumMismatch { chunk: 4 }.class(),
            ErrorClass::Integrity
        );
        assert_eq!(
            Error::ProtocolError("x".into()).class(),
            ErrorClass::ProtocolViolation
        );
        assert_eq!(
            Error::InsufficientSpace {
                needed: 10,
                available: 1
            }
            .class(),
            ErrorClass::Resource
        );
    }

    #[test]
    fn test_io_error_classes() {
        let reset = Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(reset.class(), ErrorClass::Network);
        assert!(reset.is_recoverable());

        let denied = Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert_eq!(denied.class(), ErrorClass::Resource);
        assert!(!denied.is_recoverable());
    }

    #[test]
    fn test_security_warning() {
        assert!(Error::KeyMismatch("peer".into()).is_security_warning());
        assert!(Error::DecryptionFailed.is_security_warning());
        assert!(!Error::ConnectionClosed.is_security_warning());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::PeerUnavailable("a".into()).code(), Some("E004"));
        assert_eq!(Error::TransferCancelled.code(), None);
    }
}
