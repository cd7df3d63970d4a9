//! Envelope encryption for signaling payloads.
//!
//! Payloads are sealed for the remote's X25519 public key: an ephemeral
//! keypair is generated per envelope, ECDH against the recipient key feeds
//! HKDF-SHA3-256, and the derived key encrypts the serialized payload with
//! AES-256-GCM. Wire form: `{"encrypted": base64(eph_pub || nonce || ct)}`.
//!
//! **Confidentiality is opportunistic, not guaranteed.** When no remote key
//! is known, or sealing fails, the payload is sent as plaintext JSON:
//! availability over confidentiality, preserved from the system this
//! protocol interoperates with. Decoding mirrors the same policy: a failed
//! decrypt falls back to a plaintext parse before giving up.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::sync::RwLock;
use tracing::{debug, warn};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use super::{SignalBody, SignalEnvelope, SignalKind, SignalPayload};
use crate::core::error::SessionError;
use crate::core::identity::PeerIdentity;

/// Sealed-blob layout: 32-byte ephemeral public key, 12-byte nonce, ciphertext.
const EPH_PUB_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Encrypted wrapper inside `signal_data`.
#[derive(Serialize, Deserialize)]
struct EncryptedWrapper {
    encrypted: String,
}

/// Serializes, seals and unseals signaling payloads for one peer pair.
pub struct SignalCodec {
    identity: PeerIdentity,
    secret: StaticSecret,
    public: [u8; 32],
    /// Remote key imported from the identity on first successful use.
    cached_remote: RwLock<Option<[u8; 32]>>,
}

impl SignalCodec {
    /// Create a codec with a fresh local keypair.
    pub fn new(identity: PeerIdentity) -> Self {
        let bytes: [u8; 32] = rand::random();
        Self::with_secret(identity, bytes)
    }

    /// Create a codec from existing local key material.
    pub fn with_secret(identity: PeerIdentity, secret_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret_bytes);
        let public = *X25519PublicKey::from(&secret).as_bytes();
        Self {
            identity,
            secret,
            public,
            cached_remote: RwLock::new(None),
        }
    }

    /// The local public key, base64-encoded, for out-of-band publication.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public)
    }

    // ── Encode ───────────────────────────────────────────────────────────

    /// Wrap a payload into an envelope addressed to the remote peer.
    ///
    /// Seals when the remote key is available; falls back to plaintext when
    /// it is not or when sealing fails (see module docs).
    pub fn encode(&self, kind: SignalKind, payload: &SignalPayload) -> SignalEnvelope {
        let body = serde_json::to_string(&payload.to_body())
            .unwrap_or_else(|_| "{}".to_string());

        let signal_data = match self.remote_key() {
            Some(pk) => match seal(&pk, body.as_bytes()) {
                Ok(blob) => serde_json::to_string(&EncryptedWrapper { encrypted: blob })
                    .unwrap_or(body),
                Err(e) => {
                    warn!(event = "signal_seal_failed", error = %e, "Sending signal as plaintext");
                    body
                }
            },
            None => body,
        };

        SignalEnvelope {
            sender_id: self.identity.local_id.clone(),
            receiver_id: self.identity.remote_id.clone(),
            kind,
            signal_data,
        }
    }

    // ── Decode ───────────────────────────────────────────────────────────

    /// Unwrap an inbound envelope into its payload.
    ///
    /// Tries the encrypted path first, then plaintext. Failure of both is
    /// fatal for this envelope only: the caller drops it and the
    /// negotiation continues.
    pub fn decode(&self, envelope: &SignalEnvelope) -> Result<SignalPayload, SessionError> {
        let body = self.decode_body(&envelope.signal_data)?;
        SignalPayload::from_body(envelope.kind, body).ok_or_else(|| {
            SessionError::MalformedSignal(format!(
                "{:?} envelope missing its payload field",
                envelope.kind
            ))
        })
    }

    fn decode_body(&self, signal_data: &str) -> Result<SignalBody, SessionError> {
        if let Ok(wrapper) = serde_json::from_str::<EncryptedWrapper>(signal_data) {
            match open(&self.secret, &wrapper.encrypted) {
                Ok(plain) => {
                    if let Ok(body) = serde_json::from_slice::<SignalBody>(&plain) {
                        return Ok(body);
                    }
                    debug!(event = "signal_decrypted_unparseable", "Falling back to plaintext parse");
                }
                Err(e) => {
                    debug!(event = "signal_open_failed", error = %e, "Falling back to plaintext parse");
                }
            }
        }

        serde_json::from_str::<SignalBody>(signal_data)
            .map_err(|e| SessionError::MalformedSignal(e.to_string()))
    }

    /// The remote public key, importing and caching it on first success.
    fn remote_key(&self) -> Option<[u8; 32]> {
        if let Some(pk) = *self.cached_remote.read().expect("codec key cache poisoned") {
            return Some(pk);
        }
        let encoded = self.identity.remote_public_key.as_deref()?;
        match import_public_key(encoded) {
            Ok(pk) => {
                *self.cached_remote.write().expect("codec key cache poisoned") = Some(pk);
                Some(pk)
            }
            Err(e) => {
                warn!(event = "remote_key_import_failed", error = %e, "Signaling stays plaintext");
                None
            }
        }
    }
}

/// Parse a base64-encoded 32-byte X25519 public key.
fn import_public_key(encoded: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = BASE64.decode(encoded)?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key must be 32 bytes, got {}", bytes.len()))?;
    Ok(arr)
}

// ── Sealed box primitives ────────────────────────────────────────────────────

/// Encrypt `plaintext` for `recipient_pk`: `base64(eph_pub || nonce || ct)`.
fn seal(recipient_pk: &[u8; 32], plaintext: &[u8]) -> anyhow::Result<String> {
    let eph_bytes: [u8; 32] = rand::random();
    let eph_secret = StaticSecret::from(eph_bytes);
    let eph_public = *X25519PublicKey::from(&eph_secret).as_bytes();

    let shared = *eph_secret
        .diffie_hellman(&X25519PublicKey::from(*recipient_pk))
        .as_bytes();
    let key = derive_signal_key(&shared, &eph_public, recipient_pk);

    let cipher = Aes256Gcm::new_from_slice(&key)?;
    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| anyhow::anyhow!("seal failed: {e}"))?;

    let mut blob = Vec::with_capacity(EPH_PUB_LEN + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&eph_public);
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(blob))
}

/// Decrypt a sealed blob with the local secret.
fn open(secret: &StaticSecret, blob_b64: &str) -> anyhow::Result<Vec<u8>> {
    let blob = BASE64.decode(blob_b64)?;
    if blob.len() < EPH_PUB_LEN + NONCE_LEN {
        anyhow::bail!("sealed blob too short: {} bytes", blob.len());
    }
    let eph_public: [u8; 32] = blob[..EPH_PUB_LEN]
        .try_into()
        .map_err(|_| anyhow::anyhow!("bad ephemeral key length"))?;
    let nonce = &blob[EPH_PUB_LEN..EPH_PUB_LEN + NONCE_LEN];
    let ciphertext = &blob[EPH_PUB_LEN + NONCE_LEN..];

    let local_public = *X25519PublicKey::from(secret).as_bytes();
    let shared = *secret
        .diffie_hellman(&X25519PublicKey::from(eph_public))
        .as_bytes();
    let key = derive_signal_key(&shared, &eph_public, &local_public);

    let cipher = Aes256Gcm::new_from_slice(&key)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| anyhow::anyhow!("open failed: {e}"))
}

/// HKDF-SHA3-256: extract with `eph_pub || recipient_pub` as salt, expand
/// with a protocol label. Both sides see the same (eph, recipient) pair, so
/// the derivation is symmetric.
fn derive_signal_key(shared: &[u8; 32], eph_pub: &[u8; 32], recipient_pub: &[u8; 32]) -> [u8; 32] {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(eph_pub);
    salt.extend_from_slice(recipient_pub);
    let prk = hmac_sha3_256(&salt, shared);

    let mut expand_msg = Vec::with_capacity(20);
    expand_msg.extend_from_slice(b"tunelink-signal-v1");
    expand_msg.push(0x01);
    hmac_sha3_256(&prk, &expand_msg)
}

/// HMAC-SHA3-256 (RFC 2104 with SHA3-256).
fn hmac_sha3_256(key: &[u8], data: &[u8]) -> [u8; 32] {
    const BLOCK_SIZE: usize = 136; // SHA3-256 rate (1088 bits)

    let actual_key = if key.len() > BLOCK_SIZE {
        let mut h = Sha3_256::new();
        h.update(key);
        let digest = h.finalize();
        let mut k = [0u8; BLOCK_SIZE];
        k[..32].copy_from_slice(&digest);
        k
    } else {
        let mut k = [0u8; BLOCK_SIZE];
        k[..key.len()].copy_from_slice(key);
        k
    };

    let mut ipad = [0x36u8; BLOCK_SIZE];
    let mut opad = [0x5cu8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        ipad[i] ^= actual_key[i];
        opad[i] ^= actual_key[i];
    }

    let mut inner = Sha3_256::new();
    inner.update(ipad);
    inner.update(data);
    let inner_hash = inner.finalize();

    let mut outer = Sha3_256::new();
    outer.update(opad);
    outer.update(inner_hash);
    let result = outer.finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SignalCodec, SignalCodec) {
        let a_secret: [u8; 32] = rand::random();
        let b_secret: [u8; 32] = rand::random();
        let a_public = BASE64.encode(X25519PublicKey::from(&StaticSecret::from(a_secret)).as_bytes());
        let b_public = BASE64.encode(X25519PublicKey::from(&StaticSecret::from(b_secret)).as_bytes());

        let a = SignalCodec::with_secret(
            PeerIdentity::new("alice", "bob", Some(b_public)),
            a_secret,
        );
        let b = SignalCodec::with_secret(
            PeerIdentity::new("bob", "alice", Some(a_public)),
            b_secret,
        );
        (a, b)
    }

    #[test]
    fn test_sealed_roundtrip() {
        let (a, b) = pair();
        let payload = SignalPayload::Sdp("v=0\r\no=- 0 0 IN IP4 127.0.0.1".into());
        let env = a.encode(SignalKind::Offer, &payload);

        // Sealed form must not leak the SDP.
        assert!(env.signal_data.contains("encrypted"));
        assert!(!env.signal_data.contains("IP4"));

        assert_eq!(b.decode(&env).unwrap(), payload);
    }

    #[test]
    fn test_plaintext_fallback_without_remote_key() {
        let a = SignalCodec::new(PeerIdentity::new("alice", "bob", None));
        let env = a.encode(SignalKind::Candidate, &SignalPayload::Candidate("c=1".into()));
        assert!(!env.signal_data.contains("encrypted"));

        let b = SignalCodec::new(PeerIdentity::new("bob", "alice", None));
        assert_eq!(
            b.decode(&env).unwrap(),
            SignalPayload::Candidate("c=1".into())
        );
    }

    #[test]
    fn test_decode_plaintext_even_when_key_known() {
        // An unencrypted peer must stay decodable by a peer holding keys.
        let (_, b) = pair();
        let env = SignalEnvelope {
            sender_id: "alice".into(),
            receiver_id: "bob".into(),
            kind: SignalKind::Answer,
            signal_data: r#"{"sdp":"v=0"}"#.into(),
        };
        assert_eq!(b.decode(&env).unwrap(), SignalPayload::Sdp("v=0".into()));
    }

    #[test]
    fn test_malformed_is_an_error_not_a_panic() {
        let (_, b) = pair();
        let env = SignalEnvelope {
            sender_id: "alice".into(),
            receiver_id: "bob".into(),
            kind: SignalKind::Offer,
            signal_data: "not json at all".into(),
        };
        assert!(matches!(
            b.decode(&env),
            Err(SessionError::MalformedSignal(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (a, b) = pair();
        let mut env = a.encode(SignalKind::Offer, &SignalPayload::Sdp("v=0".into()));
        // Corrupt the base64 body; decrypt fails, plaintext parse fails too.
        env.signal_data = env.signal_data.replace("encrypted\":\"", "encrypted\":\"AAAA");
        assert!(b.decode(&env).is_err());
    }

    #[test]
    fn test_end_envelope_has_empty_body() {
        let a = SignalCodec::new(PeerIdentity::new("alice", "bob", None));
        let env = a.encode(SignalKind::End, &SignalPayload::End);
        assert_eq!(env.signal_data, "{}");
    }

    #[test]
    fn test_bad_remote_key_degrades_to_plaintext() {
        let a = SignalCodec::new(PeerIdentity::new(
            "alice",
            "bob",
            Some("definitely-not-base64!!".into()),
        ));
        let env = a.encode(SignalKind::Offer, &SignalPayload::Sdp("v=0".into()));
        assert!(!env.signal_data.contains("encrypted"));
    }
}
