//! Transport boundary.
//!
//! The unlock core never initiates scans or connections. A platform
//! transport (a BLE stack in practice) owns the radio, delivers
//! [`TransportEvent`]s into the connection driver, and exposes a narrow
//! outbound surface: send one frame, or drop the link.

use protocol::Result;

/// Opaque handle identifying one connected peer link.
///
/// Issued by the transport; the core treats it as a token and never
/// interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle(pub u64);

impl std::fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Everything the transport can tell the core, as one closed enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A companion device link came up.
    Connected { peer: PeerHandle },
    /// The link dropped; all session state for it must be discarded.
    Disconnected { peer: PeerHandle },
    /// One raw frame arrived from the peer.
    FrameReceived(Vec<u8>),
    /// The link renegotiated its MTU. The value is the transport's reported
    /// write size; the frame header is carved out of it before use.
    MaxFrameSizeChanged(usize),
}

/// Outbound frame delivery.
pub trait FrameSink: Send + Sync {
    /// Hands one encoded frame to the transport for transmission.
    ///
    /// The transport may drop it; reliability comes from the stream's
    /// ACK-and-retry layer, not from this call.
    fn send_frame(&self, bytes: Vec<u8>) -> Result<()>;
}

/// Full control surface over one link.
pub trait LinkControl: FrameSink {
    /// Tears the link down. Idempotent.
    fn disconnect(&self);
}
