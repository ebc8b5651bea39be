//! # ProxLock Protocol Library
//!
//! This crate provides the wire protocol and cryptographic primitives for
//! the ProxLock proximity-unlock system.
//!
//! ## Overview
//!
//! The protocol crate is the transport-agnostic foundation of ProxLock's
//! communication layer, providing:
//!
//! - **Frame Codec**: Chunked framing sized to small unreliable-link MTUs,
//!   with per-chunk acknowledgment frames
//! - **Version Exchange**: Messaging/security version negotiation performed
//!   before any application traffic
//! - **Resume Handshake**: HMAC challenge/response proving possession of the
//!   previously stored session key, with HKDF key ratcheting
//! - **Credential Sealing**: ChaCha20-Poly1305 encryption of the unlock
//!   credentials payload
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Credentials / UnlockAck          │  MessagePack-encoded
//! ├─────────────────────────────────────────┤
//! │         Session Encryption              │  ChaCha20-Poly1305
//! ├─────────────────────────────────────────┤
//! │        Chunked Framing + ACKs           │  3-byte header, ≤ MTU
//! ├─────────────────────────────────────────┤
//! │      Transport (BLE or similar)         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{split_into_frames, OperationType, Reassembled, Reassembly};
//!
//! // Chunk a message for a 20-byte link.
//! let frames = split_into_frames(b"hello companion", OperationType::ClientMessage, false, 17)
//!     .unwrap();
//!
//! // Reassemble on the receiving side.
//! let mut reassembly = Reassembly::new();
//! let mut completed = None;
//! for frame in frames {
//!     if let Reassembled::Complete(message) = reassembly.accept(frame).unwrap() {
//!         completed = Some(message);
//!     }
//! }
//! assert_eq!(completed.unwrap().payload, b"hello companion");
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: Frame codec, chunking, and reassembly
//! - [`version`]: Messaging/security version exchange
//! - [`handshake`]: Session-resumption handshake
//! - [`crypto`]: Peer identifiers, session keys, and the credential AEAD
//! - [`messages`]: Application message bodies
//! - [`error`]: Error types

pub mod crypto;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod messages;
pub mod version;

pub use crypto::{open, seal, PeerId, SessionKey, PEER_ID_LENGTH, SESSION_KEY_LENGTH};
pub use error::{ProtocolError, Result};
pub use framing::{
    split_into_frames, CompletedMessage, Frame, FrameFlags, OperationType, Reassembled,
    Reassembly, DEFAULT_MAX_WRITE_SIZE, FRAME_HEADER_SIZE, MAX_CHUNK_SIZE,
};
pub use handshake::{
    HandshakeOutcome, HmacResumeHandshake, ResumeHandshake, ResumeInitiator, SessionKeys,
};
pub use messages::{Credentials, UnlockAck};
pub use version::{
    ResolvedVersion, VersionExchange, VersionNegotiator, MESSAGING_VERSION, SECURITY_VERSION,
};
