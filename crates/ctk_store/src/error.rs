use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    Duplicate(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] ctk_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Codec(#[from] ctk_proto::CodecError),

    #[error("Storage backend error: {0}")]
    Backend(String),
}
