//! ctk_crypto — CypherTextKit cryptographic primitives
//!
//! # Design principles
//! - No custom crypto; every primitive comes from an audited RustCrypto or
//!   dalek crate.
//! - Secret material zeroizes on drop.
//! - Public APIs take and return opaque newtypes so key kinds cannot be
//!   confused.
//!
//! # Module layout
//! - `keys`    — Ed25519 signing and X25519 agreement pairs
//! - `ratchet` — Double Ratchet engine with DH steps and skipped-key parking
//! - `aead`    — selectable AEAD (ratchet path) + XChaCha blob path (at rest)
//! - `kdf`     — HKDF root/chain steps, device-config password key
//! - `hash`    — SHA-256/512 selection, BLAKE3 ids and fingerprints
//! - `error`   — unified error type

pub mod aead;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod keys;
pub mod ratchet;

pub use error::CryptoError;
pub use keys::{AgreementKeyPair, PublicAgreementKey, PublicSigningKey, SigningKeyPair};
pub use ratchet::{RatchetConfig, RatchetHeader, RatchetMessage, RatchetState};
