//! Application message bodies carried inside client-message streams.
//!
//! Everything here is MessagePack on the wire. The credentials body only
//! ever travels inside an encrypted payload sealed with the session key.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Unlock credentials handed over once a session is mutually authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Identifies which stored authentication token this payload unlocks.
    pub token_handle: i64,
    /// The opaque unlock token itself.
    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
}

impl Credentials {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Minimal acknowledgment body.
///
/// Sent in plaintext to confirm receipt of a known peer ID, and sealed under
/// the session key as the final encrypted ack after credentials arrive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockAck {}

impl UnlockAck {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
