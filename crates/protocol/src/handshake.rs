//! Session-resumption handshake.
//!
//! Reconnecting peers prove possession of the symmetric key saved at the end
//! of their previous session. The exchange is two inbound messages on the
//! responder side:
//!
//! 1. The initiator sends a 16-byte random challenge; the responder answers
//!    with its own 16-byte challenge.
//! 2. The initiator sends an HMAC over both challenges under the stored key;
//!    the responder verifies it, answers with its own HMAC, and both sides
//!    derive fresh key material via HKDF.
//!
//! Each successful handshake yields a [`SessionKeys`] pair: the session key
//! used for this connection's traffic, and the key to store for the *next*
//! resumption. Stored keys are therefore single-use: replaying a captured
//! handshake against a store that has moved on fails verification.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::crypto::{SessionKey, SESSION_KEY_LENGTH};
use crate::error::{ProtocolError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Length of each side's random challenge in bytes.
pub const CHALLENGE_LENGTH: usize = 16;

/// Length of the HMAC-SHA256 confirmation message in bytes.
pub const CONFIRMATION_LENGTH: usize = 32;

const INITIATOR_LABEL: &[u8] = b"prox-resume client";
const RESPONDER_LABEL: &[u8] = b"prox-resume server";
const KDF_INFO: &[u8] = b"prox-resume keys";

/// Key material produced by a completed handshake.
#[derive(Clone)]
pub struct SessionKeys {
    /// Encrypts traffic for the lifetime of this connection.
    pub session: SessionKey,
    /// Must be persisted for the peer before any encrypted traffic is
    /// processed; it keys the next resumption handshake.
    pub next: SessionKey,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("session", &self.session)
            .field("next", &self.next)
            .finish()
    }
}

/// Result of feeding one inbound message to a handshake engine.
pub enum HandshakeOutcome {
    /// The handshake needs more messages; send `reply` to the peer.
    Reply(Vec<u8>),
    /// The handshake is done; send `reply`, then switch to `keys`.
    Complete { reply: Vec<u8>, keys: SessionKeys },
}

/// Responder side of the resumption handshake.
///
/// Implementations are single-use: one engine per connection, consumed
/// message by message via [`advance`](ResumeHandshake::advance).
pub trait ResumeHandshake: Send {
    /// Processes one inbound handshake message.
    ///
    /// Returns an error if the message is malformed, arrives out of order,
    /// or fails authentication; the caller should tear the connection down.
    fn advance(&mut self, message: &[u8]) -> Result<HandshakeOutcome>;
}

enum ResponderState {
    AwaitingChallenge,
    AwaitingConfirmation {
        initiator_challenge: [u8; CHALLENGE_LENGTH],
        responder_challenge: [u8; CHALLENGE_LENGTH],
    },
    Done,
}

/// HMAC-SHA256 challenge/response engine keyed with a stored session key.
pub struct HmacResumeHandshake {
    key: SessionKey,
    state: ResponderState,
}

impl HmacResumeHandshake {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            state: ResponderState::AwaitingChallenge,
        }
    }
}

impl ResumeHandshake for HmacResumeHandshake {
    fn advance(&mut self, message: &[u8]) -> Result<HandshakeOutcome> {
        match std::mem::replace(&mut self.state, ResponderState::Done) {
            ResponderState::AwaitingChallenge => {
                let initiator_challenge = parse_challenge(message)?;
                let mut responder_challenge = [0u8; CHALLENGE_LENGTH];
                rand::thread_rng().fill_bytes(&mut responder_challenge);

                self.state = ResponderState::AwaitingConfirmation {
                    initiator_challenge,
                    responder_challenge,
                };
                Ok(HandshakeOutcome::Reply(responder_challenge.to_vec()))
            }
            ResponderState::AwaitingConfirmation {
                initiator_challenge,
                responder_challenge,
            } => {
                let expected = confirmation(
                    &self.key,
                    INITIATOR_LABEL,
                    &initiator_challenge,
                    &responder_challenge,
                )?;
                // Constant-time comparison via the Mac verifier.
                expected
                    .verify_slice(message)
                    .map_err(|_| ProtocolError::Handshake("confirmation mismatch".to_string()))?;

                let reply = confirmation(
                    &self.key,
                    RESPONDER_LABEL,
                    &initiator_challenge,
                    &responder_challenge,
                )?
                .finalize()
                .into_bytes()
                .to_vec();

                let keys = derive_keys(&self.key, &initiator_challenge, &responder_challenge)?;
                Ok(HandshakeOutcome::Complete { reply, keys })
            }
            ResponderState::Done => Err(ProtocolError::Handshake(
                "handshake already completed".to_string(),
            )),
        }
    }
}

/// Initiator side of the resumption handshake.
///
/// Drives the same exchange from the companion device's perspective: emit a
/// challenge, process the responder's challenge into a confirmation, and
/// verify the responder's confirmation to obtain the derived keys.
pub struct ResumeInitiator {
    key: SessionKey,
    challenge: [u8; CHALLENGE_LENGTH],
    responder_challenge: Option<[u8; CHALLENGE_LENGTH]>,
}

impl ResumeInitiator {
    pub fn new(key: SessionKey) -> Self {
        let mut challenge = [0u8; CHALLENGE_LENGTH];
        rand::thread_rng().fill_bytes(&mut challenge);
        Self {
            key,
            challenge,
            responder_challenge: None,
        }
    }

    /// The first handshake message: this side's random challenge.
    pub fn initial_message(&self) -> Vec<u8> {
        self.challenge.to_vec()
    }

    /// Processes the responder's challenge, producing the confirmation to
    /// send back.
    pub fn confirm(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let responder_challenge = parse_challenge(message)?;
        self.responder_challenge = Some(responder_challenge);
        let mac = confirmation(
            &self.key,
            INITIATOR_LABEL,
            &self.challenge,
            &responder_challenge,
        )?;
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Verifies the responder's confirmation and derives the session keys.
    pub fn finish(self, message: &[u8]) -> Result<SessionKeys> {
        let responder_challenge = self.responder_challenge.ok_or_else(|| {
            ProtocolError::Handshake("confirmation received before challenge".to_string())
        })?;
        let expected = confirmation(
            &self.key,
            RESPONDER_LABEL,
            &self.challenge,
            &responder_challenge,
        )?;
        expected
            .verify_slice(message)
            .map_err(|_| ProtocolError::Handshake("responder confirmation mismatch".to_string()))?;
        derive_keys(&self.key, &self.challenge, &responder_challenge)
    }
}

fn parse_challenge(message: &[u8]) -> Result<[u8; CHALLENGE_LENGTH]> {
    message.try_into().map_err(|_| {
        ProtocolError::Handshake(format!(
            "challenge must be {} bytes, got {}",
            CHALLENGE_LENGTH,
            message.len()
        ))
    })
}

fn confirmation(
    key: &SessionKey,
    label: &[u8],
    initiator_challenge: &[u8; CHALLENGE_LENGTH],
    responder_challenge: &[u8; CHALLENGE_LENGTH],
) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|_| ProtocolError::Handshake("invalid HMAC key length".to_string()))?;
    mac.update(label);
    mac.update(initiator_challenge);
    mac.update(responder_challenge);
    Ok(mac)
}

fn derive_keys(
    key: &SessionKey,
    initiator_challenge: &[u8; CHALLENGE_LENGTH],
    responder_challenge: &[u8; CHALLENGE_LENGTH],
) -> Result<SessionKeys> {
    let mut salt = [0u8; CHALLENGE_LENGTH * 2];
    salt[..CHALLENGE_LENGTH].copy_from_slice(initiator_challenge);
    salt[CHALLENGE_LENGTH..].copy_from_slice(responder_challenge);

    let hk = Hkdf::<Sha256>::new(Some(&salt), key.as_bytes());
    let mut okm = [0u8; SESSION_KEY_LENGTH * 2];
    hk.expand(KDF_INFO, &mut okm)
        .map_err(|_| ProtocolError::Handshake("key derivation failed".to_string()))?;

    Ok(SessionKeys {
        session: SessionKey::from_bytes(okm[..SESSION_KEY_LENGTH].try_into().unwrap()),
        next: SessionKey::from_bytes(okm[SESSION_KEY_LENGTH..].try_into().unwrap()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored_key() -> SessionKey {
        SessionKey::from_bytes([0x11; SESSION_KEY_LENGTH])
    }

    fn run_handshake(
        initiator_key: SessionKey,
        responder_key: SessionKey,
    ) -> Result<(SessionKeys, SessionKeys)> {
        let mut initiator = ResumeInitiator::new(initiator_key);
        let mut responder = HmacResumeHandshake::new(responder_key);

        let responder_challenge = match responder.advance(&initiator.initial_message())? {
            HandshakeOutcome::Reply(reply) => reply,
            HandshakeOutcome::Complete { .. } => panic!("completed after one message"),
        };
        let confirmation = initiator.confirm(&responder_challenge)?;
        let (reply, responder_keys) = match responder.advance(&confirmation)? {
            HandshakeOutcome::Complete { reply, keys } => (reply, keys),
            HandshakeOutcome::Reply(_) => panic!("expected completion"),
        };
        let initiator_keys = initiator.finish(&reply)?;
        Ok((initiator_keys, responder_keys))
    }

    #[test]
    fn test_handshake_derives_matching_keys() {
        let (initiator_keys, responder_keys) =
            run_handshake(stored_key(), stored_key()).unwrap();
        assert_eq!(initiator_keys.session, responder_keys.session);
        assert_eq!(initiator_keys.next, responder_keys.next);
        assert_ne!(initiator_keys.session, initiator_keys.next);
        assert_ne!(initiator_keys.session, stored_key());
    }

    #[test]
    fn test_handshake_keys_vary_per_run() {
        let (first, _) = run_handshake(stored_key(), stored_key()).unwrap();
        let (second, _) = run_handshake(stored_key(), stored_key()).unwrap();
        assert_ne!(first.session, second.session);
    }

    #[test]
    fn test_mismatched_stored_keys_fail() {
        let other = SessionKey::from_bytes([0x22; SESSION_KEY_LENGTH]);
        let result = run_handshake(stored_key(), other);
        assert!(matches!(result, Err(ProtocolError::Handshake(_))));
    }

    #[test]
    fn test_responder_rejects_bad_challenge_length() {
        let mut responder = HmacResumeHandshake::new(stored_key());
        assert!(matches!(
            responder.advance(&[0u8; 5]),
            Err(ProtocolError::Handshake(_))
        ));
    }

    #[test]
    fn test_responder_rejects_tampered_confirmation() {
        let mut initiator = ResumeInitiator::new(stored_key());
        let mut responder = HmacResumeHandshake::new(stored_key());

        let HandshakeOutcome::Reply(challenge) =
            responder.advance(&initiator.initial_message()).unwrap()
        else {
            panic!("expected reply");
        };
        let mut confirmation = initiator.confirm(&challenge).unwrap();
        confirmation[0] ^= 0xFF;
        assert!(matches!(
            responder.advance(&confirmation),
            Err(ProtocolError::Handshake(_))
        ));
    }

    #[test]
    fn test_responder_rejects_third_message() {
        let mut responder = HmacResumeHandshake::new(stored_key());
        let _ = responder.advance(&[0u8; CHALLENGE_LENGTH]).unwrap();
        // Feed a garbage confirmation; error or not, the engine is spent.
        let _ = responder.advance(&[0u8; CONFIRMATION_LENGTH]);
        assert!(matches!(
            responder.advance(&[0u8; CONFIRMATION_LENGTH]),
            Err(ProtocolError::Handshake(_))
        ));
    }

    #[test]
    fn test_initiator_finish_before_confirm_fails() {
        let initiator = ResumeInitiator::new(stored_key());
        assert!(matches!(
            initiator.finish(&[0u8; CONFIRMATION_LENGTH]),
            Err(ProtocolError::Handshake(_))
        ));
    }
}
