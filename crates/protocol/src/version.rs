//! Protocol and security version negotiation.
//!
//! The version exchange is the very first payload on a new connection, sent
//! unchunked in both directions before any frame traffic is assumed valid.
//! Only a single concrete (messaging, security) version pair is implemented
//! today, so resolution degenerates to an equality check, but the exchange
//! carries full min/max ranges so future versions can pick the highest
//! mutually supported pair without a wire format change.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Messaging (chunking/streaming) protocol version implemented by this crate.
pub const MESSAGING_VERSION: u32 = 1;

/// Security (handshake/encryption) protocol version implemented by this crate.
pub const SECURITY_VERSION: u32 = 1;

/// The version ranges one side advertises at connection start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionExchange {
    /// Lowest messaging version the sender can speak.
    pub min_messaging_version: u32,
    /// Highest messaging version the sender can speak.
    pub max_messaging_version: u32,
    /// Lowest security version the sender can speak.
    pub min_security_version: u32,
    /// Highest security version the sender can speak.
    pub max_security_version: u32,
}

impl VersionExchange {
    /// Serializes the exchange to MessagePack wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(ProtocolError::from)
    }

    /// Deserializes an exchange from MessagePack wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(ProtocolError::from)
    }
}

/// The concrete version pair both sides agreed to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedVersion {
    /// Agreed messaging version.
    pub messaging_version: u32,
    /// Agreed security version.
    pub security_version: u32,
}

/// Resolves the peer's advertised version ranges against our own.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionNegotiator;

impl VersionNegotiator {
    /// Creates a negotiator for the versions this crate implements.
    pub fn new() -> Self {
        Self
    }

    /// Returns the exchange this side advertises.
    ///
    /// Min and max are currently equal because only one version exists.
    pub fn own_exchange(&self) -> VersionExchange {
        VersionExchange {
            min_messaging_version: MESSAGING_VERSION,
            max_messaging_version: MESSAGING_VERSION,
            min_security_version: SECURITY_VERSION,
            max_security_version: SECURITY_VERSION,
        }
    }

    /// Resolves the peer's exchange into a concrete version selection.
    ///
    /// Returns `None` when the peer's minimums do not match the single
    /// implemented pair; the caller decides to disconnect. No error is
    /// raised — an unsupported peer is an expected condition, not a
    /// programming fault.
    ///
    /// Once a second version exists this becomes a highest-mutually-
    /// supported selection over the advertised ranges; the max fields are
    /// already on the wire for that.
    pub fn resolve(&self, peer: &VersionExchange) -> Option<ResolvedVersion> {
        if peer.min_messaging_version != MESSAGING_VERSION
            || peer.min_security_version != SECURITY_VERSION
        {
            return None;
        }
        Some(ResolvedVersion {
            messaging_version: MESSAGING_VERSION,
            security_version: SECURITY_VERSION,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(range: std::ops::RangeInclusive<u32>) -> VersionExchange {
        VersionExchange {
            min_messaging_version: *range.start(),
            max_messaging_version: *range.end(),
            min_security_version: *range.start(),
            max_security_version: *range.end(),
        }
    }

    #[test]
    fn test_own_exchange_min_equals_max() {
        let own = VersionNegotiator::new().own_exchange();
        assert_eq!(own.min_messaging_version, own.max_messaging_version);
        assert_eq!(own.min_security_version, own.max_security_version);
        assert_eq!(own.min_messaging_version, MESSAGING_VERSION);
        assert_eq!(own.min_security_version, SECURITY_VERSION);
    }

    #[test]
    fn test_resolve_exact_match() {
        let negotiator = VersionNegotiator::new();
        let resolved = negotiator.resolve(&exchange(1..=1)).unwrap();
        assert_eq!(resolved.messaging_version, MESSAGING_VERSION);
        assert_eq!(resolved.security_version, SECURITY_VERSION);
    }

    #[test]
    fn test_resolve_own_exchange() {
        let negotiator = VersionNegotiator::new();
        assert!(negotiator.resolve(&negotiator.own_exchange()).is_some());
    }

    #[test]
    fn test_resolve_peer_range_spanning_ours() {
        // A future peer supporting 1..=3 still negotiates down to 1.
        let negotiator = VersionNegotiator::new();
        let resolved = negotiator.resolve(&exchange(1..=3)).unwrap();
        assert_eq!(resolved.messaging_version, 1);
    }

    #[test]
    fn test_resolve_too_new_peer() {
        let negotiator = VersionNegotiator::new();
        assert!(negotiator.resolve(&exchange(2..=4)).is_none());
    }

    #[test]
    fn test_resolve_too_old_peer() {
        let negotiator = VersionNegotiator::new();
        assert!(negotiator.resolve(&exchange(0..=0)).is_none());
        // A minimum below ours is a mismatch even when the range spans ours.
        assert!(negotiator.resolve(&exchange(0..=1)).is_none());
    }

    #[test]
    fn test_resolve_mixed_mismatch() {
        // Messaging matches but security does not.
        let negotiator = VersionNegotiator::new();
        let peer = VersionExchange {
            min_messaging_version: 1,
            max_messaging_version: 1,
            min_security_version: 2,
            max_security_version: 2,
        };
        assert!(negotiator.resolve(&peer).is_none());
    }

    #[test]
    fn test_exchange_wire_roundtrip() {
        let original = VersionNegotiator::new().own_exchange();
        let decoded = VersionExchange::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_exchange_decode_garbage() {
        assert!(VersionExchange::decode(&[0xFF, 0x00, 0x13]).is_err());
    }
}
