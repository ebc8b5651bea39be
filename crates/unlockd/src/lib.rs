//! # ProxLock Unlock Daemon Library
//!
//! This crate provides the host-side core of ProxLock, letting an enrolled
//! companion device unlock the machine when it comes into range.
//!
//! ## Overview
//!
//! The daemon reacts to a platform transport (typically a BLE stack) and
//! provides:
//!
//! - **Message Streaming**: Whole messages chunked to the link MTU with
//!   per-chunk acknowledgment and bounded retries
//! - **Unlock Sessions**: Peer identification, key-possession handshake,
//!   and encrypted credential handoff
//! - **Key Storage**: Durable per-peer resumption keys with single-use
//!   rotation on every successful unlock
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                Connection Driver                 │
//! ├──────────────────────────────────────────────────┤
//! │                                                  │
//! │  ┌────────────────┐      ┌────────────────────┐  │
//! │  │ UnlockSession  │─────▶│   PeerKeyStore /   │  │
//! │  │ (state machine)│      │     Authorizer     │  │
//! │  └───────┬────────┘      └────────────────────┘  │
//! │          │ callbacks                             │
//! │  ┌───────┴────────┐                              │
//! │  │ MessageStream  │  chunking, ACKs, retries     │
//! │  └───────┬────────┘                              │
//! └──────────┼───────────────────────────────────────┘
//!            │ TransportEvent / FrameSink
//!     ┌──────┴──────┐
//!     │  Transport  │
//!     └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//! use unlockd::{Authorizer, ConnectionDriver, FileKeyStore, LinkControl, StreamConfig};
//!
//! async fn run(
//!     link: Arc<dyn LinkControl>,
//!     authorizer: Arc<dyn Authorizer>,
//! ) -> anyhow::Result<()> {
//!     let key_store = Arc::new(FileKeyStore::with_default_path());
//!     key_store.load()?;
//!
//!     let driver = ConnectionDriver::new(link, key_store, authorizer, StreamConfig::default());
//!     let (events_tx, events_rx) = mpsc::channel(64);
//!     let shutdown = CancellationToken::new();
//!     let handle = driver.spawn(events_rx, shutdown.clone());
//!
//!     // Feed `events_tx` from the platform transport...
//!     drop(events_tx);
//!     handle.await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: Per-connection event loop and version exchange
//! - [`session`]: The four-state unlock session
//! - [`stream`]: Chunked, acknowledged message transfer
//! - [`keystore`]: Durable per-peer resumption keys
//! - [`transport`]: The boundary the platform transport implements
//! - [`authorizer`]: The credential handoff boundary
//! - [`config`]: Stream tuning knobs

pub mod authorizer;
pub mod config;
pub mod connection;
pub mod keystore;
pub mod session;
pub mod stream;
pub mod transport;

pub use authorizer::Authorizer;
pub use config::StreamConfig;
pub use connection::ConnectionDriver;
pub use keystore::{FileKeyStore, PeerKeyRecord, PeerKeyStore};
pub use session::{EngineFactory, UnlockSession};
pub use stream::{MessageStream, StreamCallback};
pub use transport::{FrameSink, LinkControl, PeerHandle, TransportEvent};
