use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Handshake material invalid: {0}")]
    InvalidHandshake(String),

    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("Too many skipped messages ({requested} > {max})")]
    TooManySkipped { requested: u64, max: u64 },

    #[error("Nonce must be {expected} bytes, got {got}")]
    InvalidNonceLength { expected: usize, got: usize },

    #[error("Root key must be 32 bytes, got {got}")]
    InvalidRootKeySize { got: usize },

    #[error("Ratchet not initialised for sending")]
    NotInitialised,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch)")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Wire encoding failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Wire decoding failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}
