//! Reliable message streaming over an unreliable framed link.
//!
//! `MessageStream` turns whole application messages into chunked frames
//! sized to the link MTU, pacing them one at a time: each non-final chunk
//! must be acknowledged before the next is written, and an unacknowledged
//! chunk is rewritten on a timer until a bounded retry budget runs out.
//!
//! The stream is a synchronous state machine. It never spawns tasks or
//! sleeps; the connection driver owns the clock, polls
//! [`retry_deadline`](MessageStream::retry_deadline), and calls
//! [`handle_retry_timeout`](MessageStream::handle_retry_timeout) when it
//! fires. Callbacks are dispatched after internal state has settled and
//! outside the state lock, so a callback may safely write to the stream it
//! was called from.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use protocol::{
    split_into_frames, CompletedMessage, Frame, OperationType, ProtocolError, Reassembled,
    Reassembly, Result,
};
use tokio::time::Instant;

use crate::config::StreamConfig;
use crate::transport::FrameSink;

/// Observer for stream-level events.
pub trait StreamCallback: Send + Sync {
    /// A whole inbound message finished reassembling.
    fn on_message_received(&self, message: &CompletedMessage);

    /// An inbound frame could not be parsed or did not fit the reassembly
    /// in progress.
    fn on_message_received_error(&self, error: &ProtocolError);

    /// An outbound message was abandoned after exhausting its retries.
    fn on_write_message_error(&self, error: &ProtocolError);
}

/// An outbound message in flight.
struct Outbound {
    /// The chunk currently awaiting acknowledgment.
    current: Frame,
    /// Chunks not yet written.
    remaining: VecDeque<Frame>,
    /// Rewrites of `current` so far.
    retries: u32,
    /// When `current` is next due for a rewrite.
    deadline: Instant,
}

struct StreamInner {
    config: StreamConfig,
    outbound: Option<Outbound>,
    reassembly: Reassembly,
}

/// Events to deliver to callbacks once the state lock is released.
enum Dispatch {
    Received(CompletedMessage),
    ReceiveError(ProtocolError),
    WriteError(ProtocolError),
}

/// Chunked, acknowledged message transfer over a [`FrameSink`].
pub struct MessageStream {
    sink: Arc<dyn FrameSink>,
    inner: Mutex<StreamInner>,
    callbacks: Mutex<Vec<(u64, Arc<dyn StreamCallback>)>>,
    next_callback_id: AtomicU64,
}

impl MessageStream {
    pub fn new(sink: Arc<dyn FrameSink>, config: StreamConfig) -> Self {
        Self {
            sink,
            inner: Mutex::new(StreamInner {
                config,
                outbound: None,
                reassembly: Reassembly::new(),
            }),
            callbacks: Mutex::new(Vec::new()),
            next_callback_id: AtomicU64::new(1),
        }
    }

    /// Registers a callback; returns an id for [`unregister`](Self::unregister).
    ///
    /// Callbacks fire in registration order.
    pub fn register(&self, callback: Arc<dyn StreamCallback>) -> u64 {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .expect("callback registry poisoned")
            .push((id, callback));
        id
    }

    /// Removes a previously registered callback. Unknown ids are ignored.
    pub fn unregister(&self, id: u64) {
        self.callbacks
            .lock()
            .expect("callback registry poisoned")
            .retain(|(existing, _)| *existing != id);
    }

    /// Writes a whole message, chunked to the current maximum write size.
    ///
    /// Any message still in flight is dropped first: the last writer wins.
    /// Single-chunk messages complete immediately and arm no retry state;
    /// for longer messages the head chunk is written and the rest are paced
    /// by inbound ACKs.
    pub fn write_message(
        &self,
        payload: &[u8],
        operation: OperationType,
        encrypted: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("stream state poisoned");

        if inner.outbound.is_some() {
            tracing::debug!("Overwriting in-flight outbound message");
            inner.outbound = None;
        }

        let mut frames: VecDeque<Frame> =
            split_into_frames(payload, operation, encrypted, inner.config.max_write_size)?
                .into();
        let head = frames.pop_front().expect("split yields at least one frame");
        let head_bytes = head.encode()?;

        if frames.is_empty() {
            // Nothing to pace; the message is done once the frame is out.
            drop(inner);
            return self.sink.send_frame(head_bytes);
        }

        let deadline = Instant::now() + inner.config.retry_delay;
        inner.outbound = Some(Outbound {
            current: head,
            remaining: frames,
            retries: 0,
            deadline,
        });
        drop(inner);
        self.sink.send_frame(head_bytes)
    }

    /// Feeds one raw inbound frame to the stream.
    ///
    /// ACK frames advance the outbound queue; anything else goes through
    /// reassembly. Errors surface through the registered callbacks rather
    /// than the return path, so a malformed frame never tears down the
    /// stream.
    pub fn handle_frame(&self, bytes: &[u8]) {
        let mut dispatches = Vec::new();
        {
            let mut inner = self.inner.lock().expect("stream state poisoned");
            match Frame::decode(bytes) {
                Ok(frame) if frame.operation == OperationType::Ack => {
                    self.handle_ack(&mut inner);
                }
                Ok(frame) => match inner.reassembly.accept(frame) {
                    Ok(Reassembled::Complete(message)) => {
                        dispatches.push(Dispatch::Received(message));
                    }
                    Ok(Reassembled::Incomplete) => {
                        // Ack each non-final chunk so the sender releases
                        // the next one.
                        if let Err(error) = self.send_ack() {
                            tracing::warn!("Failed to send ACK: {error}");
                        }
                    }
                    Err(error) => {
                        dispatches.push(Dispatch::ReceiveError(error));
                    }
                },
                Err(error) => {
                    dispatches.push(Dispatch::ReceiveError(error));
                }
            }
        }
        self.dispatch(dispatches);
    }

    /// When the current outbound chunk is due for a rewrite, if any.
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.inner
            .lock()
            .expect("stream state poisoned")
            .outbound
            .as_ref()
            .map(|outbound| outbound.deadline)
    }

    /// Rewrites the current chunk if its deadline has passed.
    ///
    /// Once the chunk has been rewritten `retry_limit` times, the message
    /// is abandoned and the failure is reported through
    /// [`StreamCallback::on_write_message_error`].
    pub fn handle_retry_timeout(&self, now: Instant) {
        let mut dispatches = Vec::new();
        {
            let mut inner = self.inner.lock().expect("stream state poisoned");
            let inner = &mut *inner;
            let Some(outbound) = inner.outbound.as_mut() else {
                return;
            };
            if outbound.deadline > now {
                return;
            }

            if outbound.retries >= inner.config.retry_limit {
                let retries = inner.config.retry_limit;
                tracing::warn!("Abandoning outbound message after {retries} retries");
                inner.outbound = None;
                dispatches.push(Dispatch::WriteError(ProtocolError::RetryExhausted {
                    retries,
                }));
            } else {
                outbound.retries += 1;
                outbound.deadline = now + inner.config.retry_delay;
                tracing::debug!(retries = outbound.retries, "Rewriting unacknowledged chunk");
                match outbound.current.encode() {
                    Ok(bytes) => {
                        if let Err(error) = self.sink.send_frame(bytes) {
                            tracing::warn!("Failed to rewrite chunk: {error}");
                        }
                    }
                    Err(error) => tracing::warn!("Failed to encode chunk for rewrite: {error}"),
                }
            }
        }
        self.dispatch(dispatches);
    }

    /// Raises or lowers the chunk size ceiling for subsequent writes.
    ///
    /// Chunks already queued keep the size they were split with.
    pub fn set_max_write_size(&self, max_write_size: usize) {
        let mut inner = self.inner.lock().expect("stream state poisoned");
        tracing::debug!(
            from = inner.config.max_write_size,
            to = max_write_size,
            "Updating maximum write size"
        );
        inner.config.max_write_size = max_write_size;
    }

    pub fn max_write_size(&self) -> usize {
        self.inner
            .lock()
            .expect("stream state poisoned")
            .config
            .max_write_size
    }

    /// Drops all in-flight state: the outbound queue, its retry deadline,
    /// and any partial reassembly. Called on disconnect. Idempotent.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("stream state poisoned");
        inner.outbound = None;
        inner.reassembly.reset();
    }

    fn handle_ack(&self, inner: &mut StreamInner) {
        let Some(outbound) = inner.outbound.as_mut() else {
            tracing::debug!("Ignoring ACK with no outbound message in flight");
            return;
        };

        let Some(next) = outbound.remaining.pop_front() else {
            // The current chunk was final; nothing left to pace.
            inner.outbound = None;
            return;
        };

        let last = outbound.remaining.is_empty() && next.flags.is_last();
        match next.encode() {
            Ok(bytes) => {
                if let Err(error) = self.sink.send_frame(bytes) {
                    tracing::warn!("Failed to send next chunk: {error}");
                }
            }
            Err(error) => tracing::warn!("Failed to encode next chunk: {error}"),
        }

        if last {
            // Final chunks are answered at the message level, not with a
            // transport ACK, so no deadline is armed for them.
            inner.outbound = None;
        } else {
            outbound.current = next;
            outbound.retries = 0;
            outbound.deadline = Instant::now() + inner.config.retry_delay;
        }
    }

    fn send_ack(&self) -> Result<()> {
        self.sink.send_frame(Frame::ack().encode()?)
    }

    fn dispatch(&self, dispatches: Vec<Dispatch>) {
        if dispatches.is_empty() {
            return;
        }
        let callbacks: Vec<Arc<dyn StreamCallback>> = self
            .callbacks
            .lock()
            .expect("callback registry poisoned")
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for dispatch in &dispatches {
            for callback in &callbacks {
                match dispatch {
                    Dispatch::Received(message) => callback.on_message_received(message),
                    Dispatch::ReceiveError(error) => callback.on_message_received_error(error),
                    Dispatch::WriteError(error) => callback.on_write_message_error(error),
                }
            }
        }
    }
}
