//! End-to-end sealing primitives for porthole sessions.
//!
//! A producer holds one long-term X25519 key pair per session incarnation;
//! each viewer brings an ephemeral key pair per connection. Both sides run
//! Diffie-Hellman and expand the raw shared secret through HKDF-SHA256 into
//! the frame key. Frames are sealed with XChaCha20-Poly1305 under a fresh
//! 24-byte random nonce per message.
//!
//! The relay never holds any of this material; it routes envelopes opaquely.

use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE_NO_PAD as BASE64_URL_SAFE};
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

pub use porthole_proto::SealedEnvelope;

/// XChaCha20-Poly1305 nonce width.
pub const NONCE_LEN: usize = 24;

const FRAME_KEY_LABEL: &[u8] = b"porthole/frame-key";

#[derive(Debug, Error)]
pub enum SealError {
    #[error("invalid base64 encoding")]
    Base64(#[from] base64::DecodeError),
    #[error("public key must be 32 bytes")]
    InvalidPublicKey,
    #[error("nonce must be {NONCE_LEN} bytes")]
    InvalidNonce,
    #[error("message failed authentication")]
    Aead,
    #[error("hkdf expand failure")]
    HkdfExpand,
    #[error("pairing code is missing required fields")]
    MalformedPairingCode,
}

/// An X25519 key pair. Producers keep one per session incarnation; viewers
/// one per connection.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_base64(&self) -> String {
        BASE64_STANDARD.encode(self.public.as_bytes())
    }

    /// Derive the frame key shared with a counterparty, given their public
    /// key as transmitted on the wire.
    pub fn derive_shared(&self, their_public_b64: &str) -> Result<SharedKey, SealError> {
        let their_public = decode_public_key(their_public_b64)?;
        let raw = self.secret.diffie_hellman(&their_public);
        let hk = Hkdf::<Sha256>::new(None, raw.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(FRAME_KEY_LABEL, &mut key)
            .map_err(|_| SealError::HkdfExpand)?;
        Ok(SharedKey(key))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_base64())
            .finish_non_exhaustive()
    }
}

fn decode_public_key(encoded: &str) -> Result<PublicKey, SealError> {
    let bytes = BASE64_STANDARD.decode(encoded)?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| SealError::InvalidPublicKey)?;
    Ok(PublicKey::from(bytes))
}

/// A derived frame key for one producer-viewer pairing.
#[derive(Clone)]
pub struct SharedKey([u8; 32]);

impl SharedKey {
    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedEnvelope, SealError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.0));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| SealError::Aead)?;
        Ok(SealedEnvelope {
            nonce: BASE64_STANDARD.encode(nonce),
            ciphertext: BASE64_STANDARD.encode(ciphertext),
        })
    }

    /// Open an envelope. Authentication failure is an error; the caller must
    /// drop the message and must not reflect the failure to the counterparty.
    pub fn open(&self, envelope: &SealedEnvelope) -> Result<Vec<u8>, SealError> {
        let nonce = BASE64_STANDARD.decode(&envelope.nonce)?;
        if nonce.len() != NONCE_LEN {
            return Err(SealError::InvalidNonce);
        }
        let ciphertext = BASE64_STANDARD.decode(&envelope.ciphertext)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher
            .decrypt(XNonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| SealError::Aead)
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// The out-of-band pairing triple a viewer uses to verify the producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingCode {
    pub session_id: String,
    pub public_key: String,
    pub timestamp: u64,
}

impl PairingCode {
    pub fn new(session_id: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            public_key: public_key.into(),
            timestamp: epoch_millis(),
        }
    }

    /// URL-safe payload for out-of-band transmission.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("pairing code serializes");
        BASE64_URL_SAFE.encode(json)
    }

    /// Valid iff all three fields are present.
    pub fn decode(encoded: &str) -> Result<Self, SealError> {
        let json = BASE64_URL_SAFE.decode(encoded)?;
        serde_json::from_slice(&json).map_err(|_| SealError::MalformedPairingCode)
    }
}

/// One-way user id derivation from the user secret. Deterministic and
/// non-failing; the relay is a trust-on-first-use directory.
pub fn derive_user_id(user_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn epoch_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
