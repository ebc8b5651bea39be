//! Frame codec for chunked message transfer over a small-payload link.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 1 byte: high nibble operation type, low nibble flags
//! - 2 bytes: payload length (big-endian)
//! - N bytes: chunk payload
//!
//! The header is exactly [`FRAME_HEADER_SIZE`] bytes; this is the overhead
//! reserved off any transport-reported MTU before the remainder becomes the
//! chunk budget.
//!
//! # Chunking
//!
//! A logical message of arbitrary length is split into an ordered sequence
//! of frames whose payloads are each bounded by the negotiated maximum chunk
//! size. The first frame carries the FIRST flag, the last carries LAST; a
//! message that fits in one frame carries both. The receiving side feeds
//! frames into a [`Reassembly`] accumulator which yields the original
//! payload once the LAST frame arrives.

use crate::error::{ProtocolError, Result};

/// Frame header size: 1 (operation + flags) + 2 (length) = 3 bytes.
pub const FRAME_HEADER_SIZE: usize = 3;

/// Default maximum chunk payload size in bytes.
///
/// Conservative low-MTU assumption for the initial connection state; raised
/// at runtime once the transport reports a larger negotiated MTU.
pub const DEFAULT_MAX_WRITE_SIZE: usize = 20;

/// Largest chunk payload encodable in the two-byte length field.
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize;

/// The kind of logical traffic a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// Application payload (peer identifier, credentials, acknowledgments).
    ClientMessage,
    /// Resume handshake traffic.
    EncryptionHandshake,
    /// Zero-payload acknowledgment of the previously received frame.
    Ack,
}

impl OperationType {
    /// Returns the wire tag for this operation type.
    pub fn as_tag(self) -> u8 {
        match self {
            OperationType::ClientMessage => 1,
            OperationType::EncryptionHandshake => 2,
            OperationType::Ack => 3,
        }
    }

    /// Parses a wire tag into an operation type.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(OperationType::ClientMessage),
            2 => Ok(OperationType::EncryptionHandshake),
            3 => Ok(OperationType::Ack),
            other => Err(ProtocolError::Framing(format!(
                "unknown operation tag {other}"
            ))),
        }
    }
}

/// Flags describing a frame's position and payload within a logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Flag indicating the payload is encrypted by the caller.
    pub const ENCRYPTED: u8 = 0b0001;
    /// Flag indicating the first chunk of a logical message.
    pub const FIRST: u8 = 0b0010;
    /// Flag indicating the last chunk of a logical message.
    pub const LAST: u8 = 0b0100;

    const ALL: u8 = Self::ENCRYPTED | Self::FIRST | Self::LAST;

    /// Create a new empty flags set.
    #[inline]
    pub fn new() -> Self {
        Self(0)
    }

    /// Create flags from a raw nibble, rejecting unknown bits.
    pub fn from_bits(bits: u8) -> Result<Self> {
        if bits & !Self::ALL != 0 {
            return Err(ProtocolError::Framing(format!(
                "unknown frame flag bits {bits:#06b}"
            )));
        }
        Ok(Self(bits))
    }

    /// Get the raw bits of the flags.
    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Check if the encrypted flag is set.
    #[inline]
    pub fn is_encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    /// Check if this is the first chunk of a logical message.
    #[inline]
    pub fn is_first(self) -> bool {
        self.0 & Self::FIRST != 0
    }

    /// Check if this is the last chunk of a logical message.
    #[inline]
    pub fn is_last(self) -> bool {
        self.0 & Self::LAST != 0
    }

    /// Return a new flags value with the encrypted flag set.
    #[inline]
    pub fn with_encrypted(self, encrypted: bool) -> Self {
        if encrypted {
            Self(self.0 | Self::ENCRYPTED)
        } else {
            Self(self.0 & !Self::ENCRYPTED)
        }
    }

    /// Return a new flags value with the first flag set.
    #[inline]
    pub fn with_first(self, first: bool) -> Self {
        if first {
            Self(self.0 | Self::FIRST)
        } else {
            Self(self.0 & !Self::FIRST)
        }
    }

    /// Return a new flags value with the last flag set.
    #[inline]
    pub fn with_last(self, last: bool) -> Self {
        if last {
            Self(self.0 | Self::LAST)
        } else {
            Self(self.0 & !Self::LAST)
        }
    }
}

/// A single wire-sized unit of a chunked message transfer.
///
/// Frames are the only unit ever placed on the wire. Both peers must
/// serialize and deserialize frames identically or reassembly silently
/// corrupts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The kind of logical traffic this frame belongs to.
    pub operation: OperationType,
    /// Position and payload flags.
    pub flags: FrameFlags,
    /// The chunk payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a zero-payload acknowledgment frame.
    pub fn ack() -> Self {
        Self {
            operation: OperationType::Ack,
            flags: FrameFlags::new(),
            payload: Vec::new(),
        }
    }

    /// Encodes this frame into wire bytes.
    ///
    /// Fails if the payload does not fit the two-byte length field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_CHUNK_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: self.payload.len(),
                max: MAX_CHUNK_SIZE,
            });
        }

        let mut output = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        output.push((self.operation.as_tag() << 4) | self.flags.bits());
        output.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        output.extend_from_slice(&self.payload);
        Ok(output)
    }

    /// Decodes a frame from wire bytes.
    ///
    /// The buffer must contain exactly one frame; a truncated header or
    /// payload, trailing bytes, an unknown operation tag, or unknown flag
    /// bits are all framing errors. An acknowledgment frame must carry no
    /// payload and no flags.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Framing(format!(
                "truncated frame header: need {} bytes, have {}",
                FRAME_HEADER_SIZE,
                data.len()
            )));
        }

        let operation = OperationType::from_tag(data[0] >> 4)?;
        let flags = FrameFlags::from_bits(data[0] & 0x0F)?;
        let length = u16::from_be_bytes([data[1], data[2]]) as usize;

        if data.len() != FRAME_HEADER_SIZE + length {
            return Err(ProtocolError::Framing(format!(
                "frame length mismatch: header says {} payload bytes, buffer has {}",
                length,
                data.len() - FRAME_HEADER_SIZE
            )));
        }

        if operation == OperationType::Ack && (length != 0 || flags.bits() != 0) {
            return Err(ProtocolError::Framing(
                "acknowledgment frame must carry no payload or flags".to_string(),
            ));
        }

        Ok(Self {
            operation,
            flags,
            payload: data[FRAME_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Splits a logical message into an ordered sequence of frames.
///
/// Deterministic: every frame except possibly the last carries exactly
/// `max_chunk` payload bytes, and the reconstructed payload length equals
/// the input length exactly. An empty payload yields a single empty frame.
///
/// Fails only if `max_chunk` is zero. A `max_chunk` beyond what the length
/// field can encode is clamped to [`MAX_CHUNK_SIZE`].
pub fn split_into_frames(
    payload: &[u8],
    operation: OperationType,
    encrypted: bool,
    max_chunk: usize,
) -> Result<Vec<Frame>> {
    if max_chunk == 0 {
        return Err(ProtocolError::Framing(
            "maximum chunk size must be positive".to_string(),
        ));
    }
    let max_chunk = max_chunk.min(MAX_CHUNK_SIZE);

    let flags = FrameFlags::new().with_encrypted(encrypted);
    if payload.is_empty() {
        return Ok(vec![Frame {
            operation,
            flags: flags.with_first(true).with_last(true),
            payload: Vec::new(),
        }]);
    }

    let chunk_count = payload.len().div_ceil(max_chunk);
    let mut frames = Vec::with_capacity(chunk_count);
    for (index, chunk) in payload.chunks(max_chunk).enumerate() {
        frames.push(Frame {
            operation,
            flags: flags
                .with_first(index == 0)
                .with_last(index == chunk_count - 1),
            payload: chunk.to_vec(),
        });
    }
    Ok(frames)
}

/// A fully reassembled logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    /// The kind of logical traffic the message belongs to.
    pub operation: OperationType,
    /// Whether the payload is encrypted by the sender.
    pub encrypted: bool,
    /// The reconstructed payload.
    pub payload: Vec<u8>,
}

/// Outcome of feeding one frame into a [`Reassembly`] accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembled {
    /// More frames are needed before the message is complete.
    Incomplete,
    /// The final frame arrived and the message is complete.
    Complete(CompletedMessage),
}

/// Single-slot accumulator for the inbound logical message in progress.
///
/// At most one incomplete inbound message exists at a time; the buffer is
/// reset as soon as a completed message is handed back, and is left
/// untouched whenever a frame is rejected.
#[derive(Debug, Default)]
pub struct Reassembly {
    in_progress: Option<(OperationType, bool)>,
    buffer: Vec<u8>,
}

impl Reassembly {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether a message is currently being accumulated.
    pub fn in_progress(&self) -> bool {
        self.in_progress.is_some()
    }

    /// Feeds one frame into the accumulator.
    ///
    /// Errors leave the accumulator exactly as it was: a FIRST frame while
    /// a message is already in progress, a continuation frame with no
    /// message in progress, an operation or encryption flag that differs
    /// from the message being accumulated, or an acknowledgment frame.
    pub fn accept(&mut self, frame: Frame) -> Result<Reassembled> {
        if frame.operation == OperationType::Ack {
            return Err(ProtocolError::Framing(
                "acknowledgment frame fed to reassembly".to_string(),
            ));
        }

        match self.in_progress {
            None => {
                if !frame.flags.is_first() {
                    return Err(ProtocolError::Framing(
                        "continuation frame with no message in progress".to_string(),
                    ));
                }
                self.in_progress = Some((frame.operation, frame.flags.is_encrypted()));
            }
            Some((operation, encrypted)) => {
                if frame.flags.is_first() {
                    return Err(ProtocolError::Framing(
                        "first frame while a message is still in progress".to_string(),
                    ));
                }
                if frame.operation != operation || frame.flags.is_encrypted() != encrypted {
                    return Err(ProtocolError::Framing(
                        "frame does not match the message in progress".to_string(),
                    ));
                }
            }
        }

        self.buffer.extend_from_slice(&frame.payload);

        if frame.flags.is_last() {
            // in_progress was set above on the FIRST arm, so unwrap cannot fire.
            let (operation, encrypted) = self.in_progress.take().unwrap_or_else(|| unreachable!());
            return Ok(Reassembled::Complete(CompletedMessage {
                operation,
                encrypted,
                payload: std::mem::take(&mut self.buffer),
            }));
        }
        Ok(Reassembled::Incomplete)
    }

    /// Discards any partially accumulated message.
    pub fn reset(&mut self) {
        self.in_progress = None;
        self.buffer.clear();
    }
}
