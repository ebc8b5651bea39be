//! Peer identifiers, session keys, and the credential AEAD.
//!
//! The symmetric primitives here are the narrow surface the unlock session
//! drives: a 32-byte session key established by the resume handshake, and a
//! ChaCha20-Poly1305 seal/open pair used for the credentials payload and the
//! encrypted acknowledgment. Key agreement itself lives in
//! [`crate::handshake`].

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Length of a peer identifier in bytes.
///
/// Companion devices receive this identifier at enrollment time and present
/// it verbatim at the start of every reconnection.
pub const PEER_ID_LENGTH: usize = 16;

/// Length of a symmetric session key in bytes.
pub const SESSION_KEY_LENGTH: usize = 32;

/// ChaCha20-Poly1305 nonce length in bytes.
const NONCE_LENGTH: usize = 12;

/// A stable, enrollment-issued identifier for a companion device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "serde_bytes")] pub [u8; PEER_ID_LENGTH]);

impl PeerId {
    /// Creates a `PeerId` from raw bytes.
    pub fn from_bytes(bytes: [u8; PEER_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parses a `PeerId` from a wire payload, enforcing the format check.
    ///
    /// The identifier must be exactly [`PEER_ID_LENGTH`] bytes and not all
    /// zero (the reserved "unenrolled" value).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let bytes: [u8; PEER_ID_LENGTH] = payload.try_into().map_err(|_| {
            ProtocolError::InvalidPeerId(format!(
                "expected {} bytes, got {}",
                PEER_ID_LENGTH,
                payload.len()
            ))
        })?;
        if bytes == [0u8; PEER_ID_LENGTH] {
            return Err(ProtocolError::InvalidPeerId(
                "all-zero identifier is reserved".to_string(),
            ));
        }
        Ok(Self(bytes))
    }

    /// Returns the raw bytes of this peer ID.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LENGTH] {
        &self.0
    }

    /// Generates a human-readable fingerprint of this peer ID.
    ///
    /// Formatted as groups of 4 hex characters separated by colons, for
    /// example: `a1b2:c3d4:e5f6:7890:1234:5678:9abc:def0`
    pub fn fingerprint(&self) -> String {
        self.0
            .chunks(2)
            .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fingerprint())
    }
}

/// A 32-byte symmetric session key.
///
/// Owned exclusively by one unlock session for one connection lifetime, or
/// persisted in the peer key store between connections for resumption.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_LENGTH]);

impl SessionKey {
    /// Creates a session key from raw bytes.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Creates a session key from a byte slice of the exact key length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; SESSION_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::Encryption(format!(
                "invalid key length: expected {}, got {}",
                SESSION_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Returns the raw key bytes.
    ///
    /// **Security Warning**: only use this for secure storage or to key a
    /// handshake engine.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionKey").field(&"[REDACTED]").finish()
    }
}

/// Encrypts a plaintext under the session key.
///
/// Returns `nonce || ciphertext` with a freshly random 12-byte nonce; the
/// Poly1305 tag is included in the ciphertext.
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| ProtocolError::Encryption("AEAD encryption failed".to_string()))?;

    let mut output = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypts a `nonce || ciphertext` payload produced by [`seal`].
///
/// Any truncation or tampering yields [`ProtocolError::Decryption`].
pub fn open(key: &SessionKey, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < NONCE_LENGTH {
        return Err(ProtocolError::Decryption(format!(
            "payload shorter than the {NONCE_LENGTH}-byte nonce"
        )));
    }
    let (nonce, ciphertext) = payload.split_at(NONCE_LENGTH);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(ProtocolError::from)
}
