use thiserror::Error;

use ctk_proto::{DeviceId, Username};

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum MessengerError {
    /// Decryption or session initialization failed; the stored ratchet was
    /// cleared and the caller owes the peer a rekey announcement.
    #[error("Session desynchronised with {user}:{device}: {source}")]
    SessionDesync {
        user: Username,
        device: DeviceId,
        #[source]
        source: Box<MessengerError>,
    },

    #[error("Crypto error: {0}")]
    Crypto(#[from] ctk_crypto::CryptoError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] ctk_proto::EnvelopeError),

    #[error("Serialisation error: {0}")]
    Codec(#[from] ctk_proto::CodecError),

    #[error("User config error: {0}")]
    Config(#[from] ctk_proto::ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] ctk_store::StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Local device config is corrupt or the password is wrong")]
    CorruptConfig,

    #[error("Operation requires the master device")]
    NotMasterDevice,

    #[error("Transport is offline")]
    Offline,

    #[error("Operation not supported by this transport")]
    Unsupported,

    #[error("Invalid input: {0}")]
    BadInput(String),

    #[error("Not found: {0}")]
    NotFound(String),
}
