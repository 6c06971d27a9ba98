//! Error types and result definitions for the miroom crate.
//! Every failure of the protocol stack and the cleaning workflow is one of these.

use thiserror::Error;

/// Represents all possible errors that can occur when talking to a miIO vacuum.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MiioError {
    /// Standard IO error on the socket. Transient, the transport keeps running.
    #[error("IO error: {0}")]
    Io(String),

    /// The UDP socket could not be created or bound to the peer
    #[error("Socket connection failed: {0}")]
    ConnectionFailed(String),

    /// No response from the device within the wait window
    #[error("Timeout waiting for device")]
    Timeout,

    /// A datagram too short or not framed as a miIO packet
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// The MD5 checksum of a packet does not match the device token
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Failed to decrypt a payload (wrong token or corrupted data)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Failed to encrypt a payload
    #[error("Encryption failed")]
    EncryptionFailed,

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Discovery probe was answered with something unusable
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// The device answered a command with an error object
    #[error("Device error {code}: {message}")]
    DeviceError { code: i64, message: String },

    /// The vacuum is not in a state that allows the operation
    #[error("{0}")]
    Precondition(String),

    /// The map collaborator failed
    #[error("Map error: {0}")]
    Map(String),

    /// A command was not acknowledged after all retries
    #[error("Command '{0}' failed")]
    CommandFailed(String),

    /// The transport has been closed
    #[error("Transport closed")]
    Closed,

    /// The device token is not 16 bytes of hex
    #[error("Invalid device token")]
    InvalidToken,
}

/// A specialized Result type for miIO operations.
pub type Result<T> = std::result::Result<T, MiioError>;

impl From<std::io::Error> for MiioError {
    fn from(err: std::io::Error) -> Self {
        MiioError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MiioError {
    fn from(err: serde_json::Error) -> Self {
        MiioError::Json(err.to_string())
    }
}

impl MiioError {
    /// Whether the error was caused by a bad inbound datagram that should be
    /// skipped while waiting for the real response.
    pub fn is_discardable(&self) -> bool {
        matches!(
            self,
            MiioError::DecodeError(_)
                | MiioError::ChecksumMismatch
                | MiioError::DecryptionFailed
                | MiioError::Json(_)
        )
    }
}
