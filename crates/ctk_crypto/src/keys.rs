//! Long-lived key material.
//!
//! Each device carries one Ed25519 signing pair (envelope and config
//! signatures) and one X25519 agreement pair (ratchet handshakes). Secret
//! halves zeroize on drop; public halves serialize as raw 32-byte strings on
//! the wire.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroizing, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::hash;

pub const KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

fn exact_32(bytes: &[u8], what: &str) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("{what} must be 32 bytes, got {}", bytes.len())))
}

// ── Signing ──────────────────────────────────────────────────────────────────

/// Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicSigningKey([u8; 32]);

impl PublicSigningKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr = exact_32(bytes, "signing public key")?;
        // Reject points that do not decode as a curve point up front.
        VerifyingKey::from_bytes(&arr).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig_bytes: [u8; SIGNATURE_LEN] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;
        key.verify(message, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| CryptoError::InvalidSignature)
    }

    pub fn fingerprint(&self) -> String {
        hash::fingerprint(&self.0)
    }
}

impl std::fmt::Debug for PublicSigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicSigningKey({})", hex::encode(&self.0[..6]))
    }
}

/// Ed25519 signing pair. The secret half zeroizes on drop.
#[derive(ZeroizeOnDrop)]
pub struct SigningKeyPair {
    #[zeroize(skip)]
    public: PublicSigningKey,
    secret: [u8; 32],
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self {
            public: PublicSigningKey(signing.verifying_key().to_bytes()),
            secret: signing.to_bytes(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = exact_32(bytes, "signing secret key")?;
        let signing = SigningKey::from_bytes(&secret);
        Ok(Self {
            public: PublicSigningKey(signing.verifying_key().to_bytes()),
            secret,
        })
    }

    pub fn public(&self) -> PublicSigningKey {
        self.public
    }

    /// Raw 64-byte Ed25519 signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        SigningKey::from_bytes(&self.secret)
            .sign(message)
            .to_bytes()
            .to_vec()
    }
}

impl Clone for SigningKeyPair {
    fn clone(&self) -> Self {
        Self { public: self.public, secret: self.secret }
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKeyPair(public: {:?})", self.public)
    }
}

// ── Agreement ────────────────────────────────────────────────────────────────

/// X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicAgreementKey([u8; 32]);

impl PublicAgreementKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self(exact_32(bytes, "agreement public key")?))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn as_x25519(&self) -> X25519Public {
        X25519Public::from(self.0)
    }
}

impl std::fmt::Debug for PublicAgreementKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicAgreementKey({})", hex::encode(&self.0[..6]))
    }
}

/// X25519 agreement pair. The secret half zeroizes on drop.
#[derive(ZeroizeOnDrop)]
pub struct AgreementKeyPair {
    #[zeroize(skip)]
    public: PublicAgreementKey,
    secret: [u8; 32],
}

impl AgreementKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self {
            public: PublicAgreementKey(X25519Public::from(&secret).to_bytes()),
            secret: secret.to_bytes(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr = exact_32(bytes, "agreement secret key")?;
        let secret = StaticSecret::from(arr);
        Ok(Self {
            public: PublicAgreementKey(X25519Public::from(&secret).to_bytes()),
            secret: arr,
        })
    }

    pub fn public(&self) -> PublicAgreementKey {
        self.public
    }

    pub(crate) fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    /// X25519 shared secret with the peer's public key.
    pub fn agree(&self, peer: &PublicAgreementKey) -> Zeroizing<[u8; 32]> {
        let shared = StaticSecret::from(self.secret).diffie_hellman(&peer.as_x25519());
        Zeroizing::new(shared.to_bytes())
    }
}

impl Clone for AgreementKeyPair {
    fn clone(&self) -> Self {
        Self { public: self.public, secret: self.secret }
    }
}

impl std::fmt::Debug for AgreementKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AgreementKeyPair(public: {:?})", self.public)
    }
}

// ── Serde ────────────────────────────────────────────────────────────────────
//
// All four types travel as raw byte strings. The visitor accepts both bin
// payloads (MessagePack) and integer sequences (JSON debug dumps).

struct BytesVisitor;

impl<'de> serde::de::Visitor<'de> for BytesVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a byte string")
    }

    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
        Ok(v.to_vec())
    }

    fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
        Ok(v)
    }

    fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
        let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(KEY_LEN));
        while let Some(byte) = seq.next_element::<u8>()? {
            out.push(byte);
        }
        Ok(out)
    }
}

fn deserialize_key_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    deserializer.deserialize_bytes(BytesVisitor)
}

macro_rules! bytes_serde {
    ($type:ty, $parse:expr) => {
        impl Serialize for $type {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_bytes(self.as_ref())
            }
        }

        impl<'de> Deserialize<'de> for $type {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let bytes = deserialize_key_bytes(deserializer)?;
                $parse(&bytes).map_err(serde::de::Error::custom)
            }
        }
    };
}

impl AsRef<[u8]> for PublicSigningKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for PublicAgreementKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for SigningKeyPair {
    fn as_ref(&self) -> &[u8] {
        &self.secret
    }
}

impl AsRef<[u8]> for AgreementKeyPair {
    fn as_ref(&self) -> &[u8] {
        &self.secret
    }
}

bytes_serde!(PublicSigningKey, PublicSigningKey::from_bytes);
bytes_serde!(PublicAgreementKey, PublicAgreementKey::from_bytes);
bytes_serde!(SigningKeyPair, SigningKeyPair::from_bytes);
bytes_serde!(AgreementKeyPair, AgreementKeyPair::from_bytes);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let pair = SigningKeyPair::generate();
        let sig = pair.sign(b"message");
        assert!(pair.public().verify(b"message", &sig).is_ok());
        assert!(pair.public().verify(b"other", &sig).is_err());

        let mut broken = sig.clone();
        broken[3] ^= 0x40;
        assert!(pair.public().verify(b"message", &broken).is_err());
    }

    #[test]
    fn agreement_is_symmetric() {
        let a = AgreementKeyPair::generate();
        let b = AgreementKeyPair::generate();
        assert_eq!(*a.agree(&b.public()), *b.agree(&a.public()));
    }

    #[test]
    fn keys_survive_wire_roundtrip() {
        let pair = AgreementKeyPair::generate();
        let bytes = rmp_serde::to_vec(&pair.public()).unwrap();
        let back: PublicAgreementKey = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, pair.public());
    }
}
