//! Identity signing, ephemeral key agreement, session-key derivation, and
//! payload AEAD for the mesh core.
//!
//! Two keypair kinds are distinct by design: [`IdentityKeyPair`] is the
//! long-lived signing key that names an entity; [`EphemeralKeyPair`] is
//! generated fresh per session for forward-secret key agreement.

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};
use zeroize::Zeroize;

/// Long-lived identity keypair: names an entity and signs handshake material.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Self { signing_key }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let sig = Signature::from_bytes(signature);
    vk.verify(message, &sig).is_ok()
}

/// Ephemeral X25519 keypair, generated fresh per handshake.
pub struct EphemeralKeyPair {
    secret: X25519Secret,
    public: X25519Public,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = X25519Secret::random_from_rng(rand::thread_rng());
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Computes the ECDH shared secret with a peer's ephemeral public key.
    pub fn diffie_hellman(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let peer = X25519Public::from(*peer_public);
        self.secret.diffie_hellman(&peer).to_bytes()
    }
}

/// Derived per-session keys: one for payload confidentiality, one reserved
/// for any out-of-band authentication need beyond the AEAD's own tag.
#[derive(Clone)]
pub struct SessionKeys {
    pub encryption_key: [u8; 32],
    pub auth_key: [u8; 32],
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.encryption_key.zeroize();
        self.auth_key.zeroize();
    }
}

/// Deterministic, saltless KDF: `PRK = SHA256(shared_secret)`, then one
/// SHA-256 per labeled sub-key. Both handshake sides derive this
/// independently from the same ECDH output and MUST arrive at equal keys.
pub fn derive_session_keys(shared_secret: &[u8; 32]) -> SessionKeys {
    let prk = Sha256::digest(shared_secret);
    let encryption_key: [u8; 32] = Sha256::new()
        .chain_update(prk)
        .chain_update(b"encryption")
        .finalize()
        .into();
    let auth_key: [u8; 32] = Sha256::new()
        .chain_update(prk)
        .chain_update(b"authentication")
        .finalize()
        .into();
    SessionKeys {
        encryption_key,
        auth_key,
    }
}

/// AES-256-GCM ciphertext with its random nonce, ready for the envelope's
/// `{data, nonce}` base64 wire layout.
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; 12],
}

pub fn encrypt(key: &[u8; 32], plaintext: &[u8], associated_data: &[u8]) -> Result<Sealed> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(
            nonce,
            aes_gcm::aead::Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::Crypto("AEAD encryption failed".into()))?;
    Ok(Sealed {
        ciphertext,
        nonce: nonce_bytes,
    })
}

pub fn decrypt(
    key: &[u8; 32],
    ciphertext: &[u8],
    nonce: &[u8; 12],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce);
    cipher
        .decrypt(
            nonce,
            aes_gcm::aead::Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trips() {
        let kp = IdentityKeyPair::generate();
        let sig = kp.sign(b"hello");
        assert!(verify(&kp.public_key(), b"hello", &sig));
        assert!(!verify(&kp.public_key(), b"tampered", &sig));
    }

    #[test]
    fn ecdh_agrees_on_both_sides() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        let shared_a = a.diffie_hellman(&b.public_bytes());
        let shared_b = b.diffie_hellman(&a.public_bytes());
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn both_sides_derive_equal_session_keys() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        let shared_a = a.diffie_hellman(&b.public_bytes());
        let shared_b = b.diffie_hellman(&a.public_bytes());
        let keys_a = derive_session_keys(&shared_a);
        let keys_b = derive_session_keys(&shared_b);
        assert_eq!(keys_a.encryption_key, keys_b.encryption_key);
        assert_eq!(keys_a.auth_key, keys_b.auth_key);
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = [7u8; 32];
        let sealed = encrypt(&key, b"secret payload", b"ad").unwrap();
        let plain = decrypt(&key, &sealed.ciphertext, &sealed.nonce, b"ad").unwrap();
        assert_eq!(plain, b"secret payload");
    }

    #[test]
    fn decrypt_fails_with_wrong_associated_data() {
        let key = [7u8; 32];
        let sealed = encrypt(&key, b"secret payload", b"ad").unwrap();
        assert!(decrypt(&key, &sealed.ciphertext, &sealed.nonce, b"different").is_err());
    }
}
