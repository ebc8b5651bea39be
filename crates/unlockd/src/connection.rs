//! Per-connection event loop.
//!
//! `ConnectionDriver` owns one [`MessageStream`] and one [`UnlockSession`]
//! and runs them from a single tokio task, so every state mutation is
//! serialized by construction. The transport feeds it
//! [`TransportEvent`]s over an mpsc channel; the driver owns the clock and
//! fires the stream's retry deadline when it comes due.
//!
//! A connection starts in the version-exchange phase: the first inbound
//! payload must be the peer's raw [`VersionExchange`] (it is small enough
//! that it is never chunked). On a match the driver answers with its own
//! exchange and switches to streaming; on a mismatch it disconnects without
//! sending anything.

use std::sync::Arc;

use protocol::{VersionExchange, VersionNegotiator, FRAME_HEADER_SIZE};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authorizer::Authorizer;
use crate::config::StreamConfig;
use crate::keystore::PeerKeyStore;
use crate::session::UnlockSession;
use crate::stream::MessageStream;
use crate::transport::{LinkControl, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    VersionExchange,
    Streaming,
}

/// Wires a stream and a session to one transport link and drives them.
pub struct ConnectionDriver {
    stream: Arc<MessageStream>,
    session: Arc<UnlockSession>,
    link: Arc<dyn LinkControl>,
    negotiator: VersionNegotiator,
    phase: Phase,
}

impl ConnectionDriver {
    pub fn new(
        link: Arc<dyn LinkControl>,
        key_store: Arc<dyn PeerKeyStore>,
        authorizer: Arc<dyn Authorizer>,
        config: StreamConfig,
    ) -> Self {
        let stream = Arc::new(MessageStream::new(link.clone(), config));
        let session = Arc::new(UnlockSession::new(
            stream.clone(),
            key_store,
            authorizer,
            link.clone(),
        ));
        stream.register(session.clone());

        Self {
            stream,
            session,
            link,
            negotiator: VersionNegotiator::new(),
            phase: Phase::VersionExchange,
        }
    }

    /// The stream this driver paces. Exposed for MTU probing and tests.
    pub fn stream(&self) -> &Arc<MessageStream> {
        &self.stream
    }

    /// Spawns the event loop on the current runtime.
    pub fn spawn(
        self,
        events: mpsc::Receiver<TransportEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(events, shutdown))
    }

    /// Runs until the event channel closes or shutdown is signalled.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<TransportEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            let deadline = self.stream.retry_deadline();
            let retry_due = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Connection driver received shutdown signal");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            debug!("Transport event channel closed");
                            break;
                        }
                    }
                }
                _ = retry_due => {
                    self.stream.handle_retry_timeout(Instant::now());
                }
            }
        }

        self.stream.reset();
        self.session.reset();
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer } => {
                info!(%peer, "Link connected, awaiting version exchange");
                self.phase = Phase::VersionExchange;
                self.stream.reset();
                self.session.reset();
            }
            TransportEvent::Disconnected { peer } => {
                info!(%peer, "Link disconnected");
                self.phase = Phase::VersionExchange;
                self.stream.reset();
                self.session.reset();
            }
            TransportEvent::MaxFrameSizeChanged(mtu) => {
                // The frame header is carved out of whatever the link
                // reports; a degenerate MTU still leaves one payload byte.
                let usable = mtu.saturating_sub(FRAME_HEADER_SIZE).max(1);
                debug!(mtu, usable, "Link MTU changed");
                self.stream.set_max_write_size(usable);
            }
            TransportEvent::FrameReceived(bytes) => match self.phase {
                Phase::VersionExchange => self.handle_version_exchange(&bytes),
                Phase::Streaming => self.stream.handle_frame(&bytes),
            },
        }
    }

    fn handle_version_exchange(&mut self, bytes: &[u8]) {
        let peer_exchange = match VersionExchange::decode(bytes) {
            Ok(exchange) => exchange,
            Err(error) => {
                warn!("Malformed version exchange: {error}");
                self.link.disconnect();
                return;
            }
        };

        let Some(resolved) = self.negotiator.resolve(&peer_exchange) else {
            warn!(
                messaging = peer_exchange.min_messaging_version,
                security = peer_exchange.min_security_version,
                "Version mismatch, dropping link without reply"
            );
            self.link.disconnect();
            return;
        };

        let reply = match self.negotiator.own_exchange().encode() {
            Ok(reply) => reply,
            Err(error) => {
                warn!("Failed to encode version exchange: {error}");
                self.link.disconnect();
                return;
            }
        };
        if let Err(error) = self.link.send_frame(reply) {
            warn!("Failed to send version exchange: {error}");
            self.link.disconnect();
            return;
        }

        info!(
            messaging = resolved.messaging_version,
            security = resolved.security_version,
            "Version exchange complete, streaming"
        );
        self.phase = Phase::Streaming;
    }
}
