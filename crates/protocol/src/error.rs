//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Frame errors
    /// A frame could not be parsed as a well-formed protocol unit.
    #[error("framing error: {0}")]
    Framing(String),

    /// A frame payload exceeds the negotiated maximum chunk size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual payload size.
        size: usize,
        /// Maximum allowed payload size.
        max: usize,
    },

    // Version errors
    /// The peer advertised no version overlapping our supported pair.
    #[error(
        "version mismatch: peer offers messaging {messaging}, security {security}, \
         which we do not support"
    )]
    VersionMismatch {
        /// Messaging version the peer asked for.
        messaging: u32,
        /// Security version the peer asked for.
        security: u32,
    },

    // Streaming errors
    /// A frame went unacknowledged past the bounded retry limit.
    #[error("send abandoned after {retries} unacknowledged retries")]
    RetryExhausted {
        /// Number of retries attempted before giving up.
        retries: u32,
    },

    // Handshake errors
    /// The resume handshake engine rejected a message or reached an invalid state.
    #[error("handshake failed: {0}")]
    Handshake(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption or authentication of an encrypted payload failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    // Session errors
    /// A presented peer identifier failed the format check.
    #[error("invalid peer identifier: {0}")]
    InvalidPeerId(String),

    /// The peer identifier has no record in the key store.
    #[error("unknown peer: {peer_id}")]
    UnknownPeer {
        /// Fingerprint of the unknown peer.
        peer_id: String,
    },

    /// A message arrived that the current session state does not accept.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<chacha20poly1305::Error> for ProtocolError {
    fn from(_: chacha20poly1305::Error) -> Self {
        // The AEAD intentionally reports nothing beyond pass/fail.
        ProtocolError::Decryption("authentication tag mismatch".to_string())
    }
}
