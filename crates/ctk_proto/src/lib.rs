//! ctk_proto — CypherTextKit wire types, envelopes and serialisation
//!
//! Everything that crosses a trust boundary is encoded with the single
//! canonical codec in `codec` so signatures over serialized bytes stay
//! stable.
//!
//! # Modules
//! - `ids`      — case-insensitive user and device identifiers
//! - `codec`    — the canonical wire codec + bucket padding
//! - `config`   — published, identity-signed device lists
//! - `envelope` — signed single- and multi-recipient envelopes
//! - `message`  — plaintext payload model, magic subtypes, delivery states

pub mod codec;
pub mod config;
pub mod envelope;
pub mod ids;
pub mod message;

pub use codec::CodecError;
pub use config::{ConfigError, DeviceConfig, SignedDeviceConfig, UserConfig};
pub use envelope::{
    Envelope, EnvelopeError, EnvelopeTag, MultiRecipientEnvelope, PerDeviceKey, PAYLOAD_KEY_LEN,
};
pub use ids::{DeviceId, Username};
pub use message::{
    ConversationTarget, DeliveryState, GroupId, MessagePayload, MessageType, MAGIC_DEVICE_ANNOUNCE,
    MAGIC_P2P_PREFIX, MAGIC_REKEY,
};
