//! Six-step handshake engine (v1.1).
//!
//! Grounded on the original `E2EHandshakeHandler`'s step sequence (the
//! spec-matching six-step variant, not the inconsistent `V11` one found
//! alongside it), expressed here as an explicit state-transition table per
//! the redesign note calling for this instead of interleaved callbacks.
//!
//! Steps: `HANDSHAKE_INIT -> HANDSHAKE_INIT_ACK -> CHALLENGE_RESPONSE ->
//! SESSION_ESTABLISHED -> SESSION_CONFIRM -> READY`.

use crate::crypto::{self, derive_session_keys, EphemeralKeyPair, IdentityKeyPair};
use crate::error::{Error, Result};
use crate::protocol::{msg_type, PeerId, SecureMessage};
use crate::session::{Session, SessionState};
use rand::RngCore;
use serde_json::json;
use sha2::{Digest, Sha256};

/// Initiator step 1: build `HANDSHAKE_INIT` and move the session forward.
pub fn initiate(
    session: &mut Session,
    identity: &IdentityKeyPair,
    recipient_id: PeerId,
) -> Result<SecureMessage> {
    if session.state != SessionState::Initial {
        let err = invalid_state(session.state, SessionState::Initial);
        session.state = SessionState::Error;
        return Err(err);
    }
    let ephemeral = EphemeralKeyPair::generate();
    let payload = json!({
        "identity_public_key": hex::encode(identity.public_key()),
        "ephemeral_public_key": hex::encode(ephemeral.public_bytes()),
        "supported_versions": [crate::protocol::PROTOCOL_VERSION],
        "capabilities": Vec::<String>::new(),
    });
    session.ephemeral_keys = Some(ephemeral);
    session.state = SessionState::HandshakeInitSent;
    session.touch();

    let mut msg = SecureMessage::builder(msg_type::HANDSHAKE_INIT, identity.public_key(), recipient_id)
        .session_id(session.session_id.clone())
        .payload(payload)
        .build();
    msg.sign(identity);
    Ok(msg)
}

/// Responder step 2: receives `HANDSHAKE_INIT`, replies with
/// `HANDSHAKE_INIT_ACK`, and derives session keys.
pub fn respond_to_init(
    session: &mut Session,
    identity: &IdentityKeyPair,
    init: &SecureMessage,
) -> Result<SecureMessage> {
    if session.state != SessionState::Initial {
        let err = invalid_state(session.state, SessionState::Initial);
        session.state = SessionState::Error;
        return Err(err);
    }
    let remote_identity = hex_field(init, "identity_public_key")?;
    let remote_ephemeral = hex_field(init, "ephemeral_public_key")?;

    let ephemeral = EphemeralKeyPair::generate();
    let shared_secret = ephemeral.diffie_hellman(&remote_ephemeral);
    let session_keys = derive_session_keys(&shared_secret);

    let mut challenge = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut challenge);

    session.ephemeral_keys = Some(ephemeral);
    session.remote_identity_public = Some(remote_identity);
    session.remote_ephemeral_public = Some(remote_ephemeral);
    session.session_keys = Some(session_keys);
    session.challenge = Some(challenge);
    session.state = SessionState::HandshakeAckReceived;
    session.touch();

    let ephemeral_public = session
        .ephemeral_keys
        .as_ref()
        .expect("just set")
        .public_bytes();
    let payload = json!({
        "identity_public_key": hex::encode(identity.public_key()),
        "ephemeral_public_key": hex::encode(ephemeral_public),
        "challenge": hex::encode(challenge),
        "version": crate::protocol::PROTOCOL_VERSION,
    });

    let mut msg = SecureMessage::builder(
        msg_type::HANDSHAKE_INIT_ACK,
        identity.public_key(),
        init.sender_id,
    )
    .session_id(session.session_id.clone())
    .payload(payload)
    .build();
    msg.sign(identity);
    Ok(msg)
}

/// Initiator step 3: receives `HANDSHAKE_INIT_ACK`, derives session keys,
/// signs the challenge.
pub fn respond_to_ack(
    session: &mut Session,
    identity: &IdentityKeyPair,
    ack: &SecureMessage,
) -> Result<SecureMessage> {
    if session.state != SessionState::HandshakeInitSent {
        let err = invalid_state(session.state, SessionState::HandshakeInitSent);
        session.state = SessionState::Error;
        return Err(err);
    }
    let remote_identity = hex_field(ack, "identity_public_key")?;
    let remote_ephemeral = hex_field(ack, "ephemeral_public_key")?;
    let challenge = hex_field32(ack, "challenge")?;

    let ephemeral = session
        .ephemeral_keys
        .as_ref()
        .ok_or_else(|| Error::Internal("missing ephemeral keys".into()))?;
    let shared_secret = ephemeral.diffie_hellman(&remote_ephemeral);
    let session_keys = derive_session_keys(&shared_secret);

    session.remote_identity_public = Some(remote_identity);
    session.remote_ephemeral_public = Some(remote_ephemeral);
    session.session_keys = Some(session_keys);
    session.state = SessionState::ChallengeResponseSent;
    session.touch();

    let challenge_digest = Sha256::digest(challenge);
    let signature = identity.sign(&challenge_digest);
    let payload = json!({
        "signature": hex::encode(signature),
    });

    let mut msg = SecureMessage::builder(
        msg_type::CHALLENGE_RESPONSE,
        identity.public_key(),
        ack.sender_id,
    )
    .session_id(session.session_id.clone())
    .payload(payload)
    .build();
    msg.sign(identity);
    Ok(msg)
}

/// Responder step 4: verifies the challenge signature, replies
/// `SESSION_ESTABLISHED`.
pub fn respond_to_challenge(
    session: &mut Session,
    identity: &IdentityKeyPair,
    response: &SecureMessage,
) -> Result<SecureMessage> {
    if session.state != SessionState::HandshakeAckReceived {
        let err = invalid_state(session.state, SessionState::HandshakeAckReceived);
        session.state = SessionState::Error;
        return Err(err);
    }
    let signature = bytes64_field(response, "signature")?;
    let challenge = session
        .challenge
        .ok_or_else(|| Error::Internal("missing challenge".into()))?;
    let remote_identity = session
        .remote_identity_public
        .ok_or_else(|| Error::Internal("missing remote identity".into()))?;

    let digest = Sha256::digest(challenge);
    if !crypto::verify(&remote_identity, &digest, &signature) {
        session.state = SessionState::Error;
        return Err(Error::InvalidSignature);
    }

    session.state = SessionState::SessionEstablishedReceived;
    session.touch();

    let mut msg = SecureMessage::builder(
        msg_type::SESSION_ESTABLISHED,
        identity.public_key(),
        response.sender_id,
    )
    .session_id(session.session_id.clone())
    .payload(json!({ "confirmed": true }))
    .build();
    msg.sign(identity);
    Ok(msg)
}

/// Initiator step 5: receives `SESSION_ESTABLISHED`, replies
/// `SESSION_CONFIRM`.
pub fn respond_to_established(
    session: &mut Session,
    identity: &IdentityKeyPair,
    established: &SecureMessage,
) -> Result<SecureMessage> {
    if session.state != SessionState::ChallengeResponseSent {
        let err = invalid_state(session.state, SessionState::ChallengeResponseSent);
        session.state = SessionState::Error;
        return Err(err);
    }
    session.state = SessionState::SessionConfirmedSent;
    session.touch();

    let mut msg = SecureMessage::builder(
        msg_type::SESSION_CONFIRM,
        identity.public_key(),
        established.sender_id,
    )
    .session_id(session.session_id.clone())
    .payload(json!({ "ack": true }))
    .build();
    msg.sign(identity);
    Ok(msg)
}

/// Responder step 6: receives `SESSION_CONFIRM`, replies `READY`, both
/// sides are now `Ready`.
pub fn respond_to_confirm(
    session: &mut Session,
    identity: &IdentityKeyPair,
    confirm: &SecureMessage,
) -> Result<SecureMessage> {
    if session.state != SessionState::SessionEstablishedReceived {
        let err = invalid_state(session.state, SessionState::SessionEstablishedReceived);
        session.state = SessionState::Error;
        return Err(err);
    }
    session.state = SessionState::Ready;
    session.touch();

    let mut msg = SecureMessage::builder(msg_type::READY, identity.public_key(), confirm.sender_id)
        .session_id(session.session_id.clone())
        .payload(json!({}))
        .build();
    msg.sign(identity);
    Ok(msg)
}

/// Initiator final step: receives `READY`, transitions to `Ready`.
pub fn finalize_ready(session: &mut Session) -> Result<()> {
    if session.state != SessionState::SessionConfirmedSent {
        let err = invalid_state(session.state, SessionState::SessionConfirmedSent);
        session.state = SessionState::Error;
        return Err(err);
    }
    session.state = SessionState::Ready;
    session.touch();
    Ok(())
}

fn invalid_state(found: SessionState, expected: SessionState) -> Error {
    Error::InvalidSessionState {
        expected: format!("{expected:?}"),
        found: format!("{found:?}"),
    }
}

fn hex_field(msg: &SecureMessage, field: &str) -> Result<[u8; 32]> {
    let s = msg
        .payload
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidInput(format!("missing field {field}")))?;
    let bytes = hex::decode(s).map_err(|e| Error::InvalidInput(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(Error::InvalidInput(format!("field {field} must be 32 bytes")));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn hex_field32(msg: &SecureMessage, field: &str) -> Result<[u8; 32]> {
    hex_field(msg, field)
}

fn bytes64_field(msg: &SecureMessage, field: &str) -> Result<[u8; 64]> {
    let s = msg
        .payload
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidInput(format!("missing field {field}")))?;
    let bytes = hex::decode(s).map_err(|e| Error::InvalidInput(e.to_string()))?;
    if bytes.len() != 64 {
        return Err(Error::InvalidInput(format!("field {field} must be 64 bytes")));
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;

    #[test]
    fn full_six_step_handshake_derives_equal_keys_both_sides() {
        let config = SessionConfig::default();
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();

        let mut alice_session = Session::new(alice_identity.public_key(), bob_identity.public_key(), config.timeout_secs);
        let mut bob_session = Session::new(bob_identity.public_key(), alice_identity.public_key(), config.timeout_secs);
        bob_session.session_id = alice_session.session_id.clone();

        let init = initiate(&mut alice_session, &alice_identity, bob_identity.public_key()).unwrap();
        let ack = respond_to_init(&mut bob_session, &bob_identity, &init).unwrap();
        let challenge_response = respond_to_ack(&mut alice_session, &alice_identity, &ack).unwrap();
        let established = respond_to_challenge(&mut bob_session, &bob_identity, &challenge_response).unwrap();
        let confirm = respond_to_established(&mut alice_session, &alice_identity, &established).unwrap();
        let ready = respond_to_confirm(&mut bob_session, &bob_identity, &confirm).unwrap();
        finalize_ready(&mut alice_session).unwrap();
        let _ = ready;

        assert_eq!(alice_session.state, SessionState::Ready);
        assert_eq!(bob_session.state, SessionState::Ready);
        assert_eq!(
            alice_session.session_keys.as_ref().unwrap().encryption_key,
            bob_session.session_keys.as_ref().unwrap().encryption_key
        );
    }

    #[test]
    fn out_of_order_message_is_rejected() {
        let config = SessionConfig::default();
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let mut bob_session = Session::new(bob_identity.public_key(), alice_identity.public_key(), config.timeout_secs);

        let fake_confirm = SecureMessage::builder(
            msg_type::SESSION_CONFIRM,
            alice_identity.public_key(),
            bob_identity.public_key(),
        )
        .build();
        assert!(respond_to_confirm(&mut bob_session, &bob_identity, &fake_confirm).is_err());
        assert_eq!(bob_session.state, SessionState::Error);
    }
}
