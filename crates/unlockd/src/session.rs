//! The unlock session state machine.
//!
//! One `UnlockSession` drives one connection through the four-step unlock
//! exchange:
//!
//! 1. **AwaitingPeerId** — the peer announces its enrollment identifier in
//!    plaintext. A known peer gets a plaintext ack; an unknown or malformed
//!    identifier ends the connection.
//! 2. **HandshakeInProgress** — the peer proves possession of the stored
//!    resumption key. Every engine output goes back unencrypted.
//! 3. **MutuallyAuthenticated** — the peer's encrypted credentials arrive.
//!    The ratcheted next key is persisted before anything is decrypted, the
//!    authorizer is invoked once, and an encrypted ack goes back.
//! 4. **CredentialsReceived** — the handoff is done. Anything further from
//!    the peer is a protocol violation and drops the link.
//!
//! Any failure at any step resets the session and disconnects. The session
//! never deletes a stored key on failure; only successful handshakes rotate
//! keys.

use std::sync::{Arc, Mutex};

use protocol::handshake::{HandshakeOutcome, HmacResumeHandshake, ResumeHandshake, SessionKeys};
use protocol::{
    open, seal, CompletedMessage, Credentials, OperationType, PeerId, ProtocolError, SessionKey,
    UnlockAck,
};

use crate::authorizer::Authorizer;
use crate::keystore::PeerKeyStore;
use crate::stream::{MessageStream, StreamCallback};
use crate::transport::LinkControl;

/// Builds a fresh handshake engine keyed with a peer's stored key.
pub type EngineFactory = Box<dyn Fn(SessionKey) -> Box<dyn ResumeHandshake> + Send + Sync>;

enum SessionState {
    AwaitingPeerId,
    HandshakeInProgress {
        peer: PeerId,
        user_handle: i32,
        engine: Box<dyn ResumeHandshake>,
    },
    MutuallyAuthenticated {
        peer: PeerId,
        user_handle: i32,
        keys: SessionKeys,
    },
    CredentialsReceived,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::AwaitingPeerId => "AwaitingPeerId",
            SessionState::HandshakeInProgress { .. } => "HandshakeInProgress",
            SessionState::MutuallyAuthenticated { .. } => "MutuallyAuthenticated",
            SessionState::CredentialsReceived => "CredentialsReceived",
        }
    }
}

/// Per-connection unlock state machine.
///
/// Implements [`StreamCallback`] so it can be registered directly on the
/// connection's [`MessageStream`].
pub struct UnlockSession {
    stream: Arc<MessageStream>,
    key_store: Arc<dyn PeerKeyStore>,
    authorizer: Arc<dyn Authorizer>,
    link: Arc<dyn LinkControl>,
    engine_factory: EngineFactory,
    state: Mutex<SessionState>,
}

impl UnlockSession {
    /// Creates a session using the default HMAC handshake engine.
    pub fn new(
        stream: Arc<MessageStream>,
        key_store: Arc<dyn PeerKeyStore>,
        authorizer: Arc<dyn Authorizer>,
        link: Arc<dyn LinkControl>,
    ) -> Self {
        Self::with_engine_factory(
            stream,
            key_store,
            authorizer,
            link,
            Box::new(|key| Box::new(HmacResumeHandshake::new(key))),
        )
    }

    /// Creates a session with a custom handshake engine factory.
    pub fn with_engine_factory(
        stream: Arc<MessageStream>,
        key_store: Arc<dyn PeerKeyStore>,
        authorizer: Arc<dyn Authorizer>,
        link: Arc<dyn LinkControl>,
        engine_factory: EngineFactory,
    ) -> Self {
        Self {
            stream,
            key_store,
            authorizer,
            link,
            engine_factory,
            state: Mutex::new(SessionState::AwaitingPeerId),
        }
    }

    /// Drops all per-connection state. Called on disconnect. Idempotent.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("session state poisoned");
        if !matches!(*state, SessionState::AwaitingPeerId) {
            tracing::debug!(from = state.name(), "Resetting unlock session");
        }
        *state = SessionState::AwaitingPeerId;
    }

    /// Logs the failure, resets, and ends the connection.
    fn fail(&self, error: &ProtocolError) {
        tracing::warn!("Unlock session failed: {error}");
        self.reset();
        self.link.disconnect();
    }

    fn handle_message(&self, message: &CompletedMessage) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().expect("session state poisoned");
        // Step the machine with the state taken out, so failures inside a
        // step leave it reset rather than half-advanced.
        let next = match std::mem::replace(&mut *state, SessionState::AwaitingPeerId) {
            SessionState::AwaitingPeerId => self.handle_peer_id(message)?,
            SessionState::HandshakeInProgress {
                peer,
                user_handle,
                engine,
            } => self.handle_handshake(message, peer, user_handle, engine)?,
            SessionState::MutuallyAuthenticated {
                peer,
                user_handle,
                keys,
            } => self.handle_credentials(message, peer, user_handle, keys)?,
            SessionState::CredentialsReceived => {
                return Err(ProtocolError::UnexpectedMessage(
                    "credentials already delivered".to_string(),
                ));
            }
        };
        *state = next;
        Ok(())
    }

    fn handle_peer_id(&self, message: &CompletedMessage) -> Result<SessionState, ProtocolError> {
        if message.operation != OperationType::ClientMessage || message.encrypted {
            return Err(ProtocolError::InvalidPeerId(
                "peer id must arrive as a plaintext client message".to_string(),
            ));
        }
        let peer = PeerId::parse(&message.payload)?;

        let Some(record) = self.key_store.record(&peer) else {
            return Err(ProtocolError::UnknownPeer {
                peer_id: peer.fingerprint(),
            });
        };
        let key = match SessionKey::from_slice(&record.key) {
            Ok(key) => key,
            Err(error) => {
                // A record that cannot key a handshake is useless; drop it
                // so the peer is forced through re-enrollment.
                tracing::error!(peer = %peer, "Stored key is unusable, clearing record");
                if let Err(clear_error) = self.key_store.clear(&peer) {
                    tracing::error!("Failed to clear unusable key: {clear_error}");
                }
                return Err(error);
            }
        };

        tracing::info!(peer = %peer, user = record.user_handle, "Known peer announced");
        self.stream.write_message(
            &UnlockAck::default().encode()?,
            OperationType::ClientMessage,
            false,
        )?;

        Ok(SessionState::HandshakeInProgress {
            peer,
            user_handle: record.user_handle,
            engine: (self.engine_factory)(key),
        })
    }

    fn handle_handshake(
        &self,
        message: &CompletedMessage,
        peer: PeerId,
        user_handle: i32,
        mut engine: Box<dyn ResumeHandshake>,
    ) -> Result<SessionState, ProtocolError> {
        if message.operation != OperationType::EncryptionHandshake {
            return Err(ProtocolError::Handshake(format!(
                "expected handshake message, got {:?}",
                message.operation
            )));
        }

        match engine.advance(&message.payload)? {
            HandshakeOutcome::Reply(reply) => {
                self.stream
                    .write_message(&reply, OperationType::EncryptionHandshake, false)?;
                Ok(SessionState::HandshakeInProgress {
                    peer,
                    user_handle,
                    engine,
                })
            }
            HandshakeOutcome::Complete { reply, keys } => {
                self.stream
                    .write_message(&reply, OperationType::EncryptionHandshake, false)?;
                tracing::info!(peer = %peer, "Peer mutually authenticated");
                Ok(SessionState::MutuallyAuthenticated {
                    peer,
                    user_handle,
                    keys,
                })
            }
        }
    }

    fn handle_credentials(
        &self,
        message: &CompletedMessage,
        peer: PeerId,
        user_handle: i32,
        keys: SessionKeys,
    ) -> Result<SessionState, ProtocolError> {
        if message.operation != OperationType::ClientMessage || !message.encrypted {
            return Err(ProtocolError::UnexpectedMessage(
                "expected encrypted credentials".to_string(),
            ));
        }

        // Rotate the stored key before touching the ciphertext, so a crash
        // or decryption failure past this point cannot strand the peer on a
        // key we no longer accept.
        self.key_store
            .save_key(&peer, keys.next.as_bytes())
            .map_err(|error| {
                ProtocolError::Handshake(format!("failed to persist rotated key: {error}"))
            })?;

        let plaintext = open(&keys.session, &message.payload)?;
        let credentials = Credentials::decode(&plaintext)?;

        tracing::info!(
            peer = %peer,
            user = user_handle,
            token_handle = credentials.token_handle,
            "Credentials received, handing over to authorizer"
        );
        self.authorizer.on_credentials_received(
            user_handle,
            &credentials.token,
            credentials.token_handle,
        );

        let ack = seal(&keys.session, &UnlockAck::default().encode()?)?;
        self.stream
            .write_message(&ack, OperationType::ClientMessage, true)?;

        Ok(SessionState::CredentialsReceived)
    }
}

impl StreamCallback for UnlockSession {
    fn on_message_received(&self, message: &CompletedMessage) {
        if let Err(error) = self.handle_message(message) {
            self.fail(&error);
        }
    }

    fn on_message_received_error(&self, error: &ProtocolError) {
        // Transport-level noise; the reassembly buffer survives, so the
        // session state does too.
        tracing::warn!("Inbound message error: {error}");
    }

    fn on_write_message_error(&self, error: &ProtocolError) {
        // An undeliverable ack or handshake reply means the peer is out of
        // reach; the cycle cannot finish.
        self.fail(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::keystore::FileKeyStore;
    use crate::transport::FrameSink;
    use protocol::handshake::ResumeInitiator;
    use protocol::{Frame, Reassembled, Reassembly, SESSION_KEY_LENGTH};
    use tempfile::tempdir;

    /// Link fake that records frames and disconnect calls.
    #[derive(Default)]
    struct FakeLink {
        frames: Mutex<Vec<Vec<u8>>>,
        disconnects: Mutex<u32>,
    }

    impl FakeLink {
        /// Reassembles everything sent since the last call into messages.
        fn drain_messages(&self) -> Vec<CompletedMessage> {
            let mut reassembly = Reassembly::new();
            let mut messages = Vec::new();
            for bytes in self.frames.lock().unwrap().drain(..) {
                let frame = Frame::decode(&bytes).unwrap();
                if frame.operation == OperationType::Ack {
                    continue;
                }
                if let Reassembled::Complete(message) = reassembly.accept(frame).unwrap() {
                    messages.push(message);
                }
            }
            messages
        }

        fn disconnect_count(&self) -> u32 {
            *self.disconnects.lock().unwrap()
        }
    }

    impl FrameSink for FakeLink {
        fn send_frame(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
            self.frames.lock().unwrap().push(bytes);
            Ok(())
        }
    }

    impl LinkControl for FakeLink {
        fn disconnect(&self) {
            *self.disconnects.lock().unwrap() += 1;
        }
    }

    #[derive(Default)]
    struct FakeAuthorizer {
        calls: Mutex<Vec<(i32, Vec<u8>, i64)>>,
    }

    impl Authorizer for FakeAuthorizer {
        fn on_credentials_received(&self, user_handle: i32, token: &[u8], token_handle: i64) {
            self.calls
                .lock()
                .unwrap()
                .push((user_handle, token.to_vec(), token_handle));
        }
    }

    struct Fixture {
        session: UnlockSession,
        link: Arc<FakeLink>,
        store: Arc<FileKeyStore>,
        authorizer: Arc<FakeAuthorizer>,
        _dir: tempfile::TempDir,
    }

    const STORED_KEY: [u8; SESSION_KEY_LENGTH] = [0x11; SESSION_KEY_LENGTH];

    fn peer() -> PeerId {
        PeerId::from_bytes([0x07; protocol::PEER_ID_LENGTH])
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileKeyStore::new(dir.path().join("keys.json")));
        store.enroll(peer(), &STORED_KEY, 11).unwrap();

        let link = Arc::new(FakeLink::default());
        let stream = Arc::new(MessageStream::new(
            link.clone(),
            StreamConfig::default().with_max_write_size(64),
        ));
        let authorizer = Arc::new(FakeAuthorizer::default());
        let session = UnlockSession::new(
            stream,
            store.clone(),
            authorizer.clone(),
            link.clone(),
        );
        Fixture {
            session,
            link,
            store,
            authorizer,
            _dir: dir,
        }
    }

    fn plaintext(operation: OperationType, payload: &[u8]) -> CompletedMessage {
        CompletedMessage {
            operation,
            encrypted: false,
            payload: payload.to_vec(),
        }
    }

    fn encrypted(payload: Vec<u8>) -> CompletedMessage {
        CompletedMessage {
            operation: OperationType::ClientMessage,
            encrypted: true,
            payload,
        }
    }

    /// Runs the peer-id step and the full handshake, returning the
    /// initiator-side derived keys.
    fn authenticate(fixture: &Fixture) -> SessionKeys {
        fixture.session.on_message_received(&plaintext(
            OperationType::ClientMessage,
            peer().as_bytes(),
        ));
        let acks = fixture.link.drain_messages();
        assert_eq!(acks.len(), 1);
        UnlockAck::decode(&acks[0].payload).unwrap();

        let mut initiator = ResumeInitiator::new(SessionKey::from_bytes(STORED_KEY));
        fixture.session.on_message_received(&plaintext(
            OperationType::EncryptionHandshake,
            &initiator.initial_message(),
        ));
        let challenge = fixture.link.drain_messages().remove(0);
        assert_eq!(challenge.operation, OperationType::EncryptionHandshake);
        assert!(!challenge.encrypted);

        let confirmation = initiator.confirm(&challenge.payload).unwrap();
        fixture
            .session
            .on_message_received(&plaintext(OperationType::EncryptionHandshake, &confirmation));
        let reply = fixture.link.drain_messages().remove(0);
        initiator.finish(&reply.payload).unwrap()
    }

    #[test]
    fn test_happy_path_delivers_credentials() {
        let fixture = fixture();
        let keys = authenticate(&fixture);

        let body = Credentials {
            token_handle: 42,
            token: vec![1, 2, 3],
        }
        .encode()
        .unwrap();
        let sealed = seal(&keys.session, &body).unwrap();
        fixture.session.on_message_received(&encrypted(sealed));

        let calls = fixture.authorizer.calls.lock().unwrap();
        // The user handle comes from the enrollment record, the token
        // handle from the credentials payload.
        assert_eq!(*calls, vec![(11, vec![1, 2, 3], 42)]);

        // The final ack is encrypted under the same session key.
        let ack = fixture.link.drain_messages().remove(0);
        assert!(ack.encrypted);
        let plaintext = open(&keys.session, &ack.payload).unwrap();
        UnlockAck::decode(&plaintext).unwrap();

        // The stored key rotated to the handshake's next key.
        let record = fixture.store.record(&peer()).unwrap();
        assert_eq!(record.key, keys.next.as_bytes().to_vec());
        assert_eq!(record.user_handle, 11);
        assert_eq!(fixture.link.disconnect_count(), 0);
    }

    #[test]
    fn test_unknown_peer_disconnects_without_authorizer() {
        let fixture = fixture();
        let stranger = PeerId::from_bytes([0x99; protocol::PEER_ID_LENGTH]);
        fixture
            .session
            .on_message_received(&plaintext(OperationType::ClientMessage, stranger.as_bytes()));

        assert_eq!(fixture.link.disconnect_count(), 1);
        assert!(fixture.link.drain_messages().is_empty());
        assert!(fixture.authorizer.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_peer_id_disconnects() {
        let fixture = fixture();
        fixture
            .session
            .on_message_received(&plaintext(OperationType::ClientMessage, &[1, 2, 3]));
        assert_eq!(fixture.link.disconnect_count(), 1);
    }

    #[test]
    fn test_encrypted_peer_id_rejected() {
        let fixture = fixture();
        fixture
            .session
            .on_message_received(&encrypted(peer().as_bytes().to_vec()));
        assert_eq!(fixture.link.disconnect_count(), 1);
    }

    #[test]
    fn test_wrong_operation_during_handshake_disconnects() {
        let fixture = fixture();
        fixture.session.on_message_received(&plaintext(
            OperationType::ClientMessage,
            peer().as_bytes(),
        ));
        fixture.link.drain_messages();

        fixture
            .session
            .on_message_received(&plaintext(OperationType::ClientMessage, b"not a handshake"));
        assert_eq!(fixture.link.disconnect_count(), 1);
    }

    #[test]
    fn test_handshake_failure_keeps_stored_key() {
        let fixture = fixture();
        fixture.session.on_message_received(&plaintext(
            OperationType::ClientMessage,
            peer().as_bytes(),
        ));
        fixture.link.drain_messages();

        // A confirmation-sized garbage blob in place of the challenge is
        // accepted as a challenge only if 16 bytes; send a bad length.
        fixture
            .session
            .on_message_received(&plaintext(OperationType::EncryptionHandshake, &[0u8; 5]));

        assert_eq!(fixture.link.disconnect_count(), 1);
        assert_eq!(
            fixture.store.record(&peer()).unwrap().key,
            STORED_KEY.to_vec()
        );
    }

    #[test]
    fn test_decryption_failure_keeps_rotated_key() {
        let fixture = fixture();
        let keys = authenticate(&fixture);

        fixture
            .session
            .on_message_received(&encrypted(vec![0xAA; 40]));

        assert_eq!(fixture.link.disconnect_count(), 1);
        assert!(fixture.authorizer.calls.lock().unwrap().is_empty());
        // Rotation happened before decryption, and the failure did not
        // delete the record.
        let record = fixture.store.record(&peer()).unwrap();
        assert_eq!(record.key, keys.next.as_bytes().to_vec());
    }

    #[test]
    fn test_unusable_stored_key_is_cleared() {
        let fixture = fixture();
        // Replace the enrollment with a key of the wrong length.
        fixture.store.enroll(peer(), &[1, 2, 3], 11).unwrap();

        fixture.session.on_message_received(&plaintext(
            OperationType::ClientMessage,
            peer().as_bytes(),
        ));

        assert_eq!(fixture.link.disconnect_count(), 1);
        assert!(fixture.store.record(&peer()).is_none());
    }

    #[test]
    fn test_write_failure_is_fatal_to_the_cycle() {
        let fixture = fixture();
        authenticate(&fixture);

        fixture
            .session
            .on_write_message_error(&ProtocolError::RetryExhausted { retries: 5 });
        assert_eq!(fixture.link.disconnect_count(), 1);

        // The next message is treated as a fresh peer-id announcement.
        fixture
            .session
            .on_message_received(&plaintext(OperationType::ClientMessage, b"short"));
        assert_eq!(fixture.link.disconnect_count(), 2);
    }

    #[test]
    fn test_message_after_credentials_disconnects() {
        let fixture = fixture();
        let keys = authenticate(&fixture);

        let body = Credentials {
            token_handle: 1,
            token: vec![9],
        }
        .encode()
        .unwrap();
        let sealed = seal(&keys.session, &body).unwrap();
        fixture.session.on_message_received(&encrypted(sealed));
        fixture.link.drain_messages();
        assert_eq!(fixture.link.disconnect_count(), 0);

        fixture
            .session
            .on_message_received(&plaintext(OperationType::ClientMessage, b"anything"));
        assert_eq!(fixture.link.disconnect_count(), 1);
        assert_eq!(fixture.authorizer.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_reset_allows_fresh_cycle() {
        let fixture = fixture();
        authenticate(&fixture);

        fixture.session.reset();
        fixture.session.reset();

        // After reset the session expects a peer id again; the stored key
        // is unchanged (rotation only happens at credential delivery), so a
        // fresh handshake against it succeeds.
        let keys = authenticate(&fixture);
        let body = Credentials {
            token_handle: 7,
            token: vec![4, 5],
        }
        .encode()
        .unwrap();
        fixture
            .session
            .on_message_received(&encrypted(seal(&keys.session, &body).unwrap()));
        assert_eq!(fixture.authorizer.calls.lock().unwrap().len(), 1);
        assert_eq!(fixture.link.disconnect_count(), 0);
    }
}
