//! Signed message envelopes.
//!
//! A single-recipient `Envelope` wraps one serialized ratchet message and a
//! signature over those bytes by the sender's long-term identity key. The
//! `rekey` flag is set on the first envelope of a (re)initialized session and
//! instructs the recipient to discard any prior ratchet for that device
//! before decrypting.
//!
//! A `MultiRecipientEnvelope` seals the payload once under a one-shot
//! symmetric key, signs the sealed bytes, and carries one small
//! single-recipient envelope per device that ratchet-encrypts the payload
//! key rather than the plaintext. A relay may strip the per-device entries
//! not addressed to the recipient.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use ctk_crypto::{
    aead, CryptoError, PublicSigningKey, RatchetMessage, SigningKeyPair,
};

use crate::codec::{self, CodecError};
use crate::ids::{DeviceId, Username};

/// AAD binding sealed multi-recipient payloads to their purpose.
const PAYLOAD_AAD: &[u8] = b"ctk-multi-payload";

pub const PAYLOAD_KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Envelope not addressed to this device")]
    NotAddressed,
}

/// Distinguishes envelope kinds sharing one transport slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeTag {
    #[serde(rename = "m")]
    Message,
    #[serde(rename = "r")]
    MultiRecipientMessage,
}

/// One ratcheted message for one device, signed by the sender's identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "t")]
    pub tag: EnvelopeTag,
    /// Chosen at enqueue time and reused across retries; receivers drop
    /// duplicate `(sender, message_id)` pairs.
    #[serde(rename = "id")]
    pub message_id: String,
    #[serde(rename = "u")]
    pub sender: Username,
    #[serde(rename = "d")]
    pub sender_device: DeviceId,
    #[serde(rename = "b", with = "serde_bytes")]
    pub inner: Vec<u8>,
    #[serde(rename = "g", with = "serde_bytes")]
    pub signature: Vec<u8>,
    #[serde(rename = "x")]
    pub rekey: bool,
}

impl Envelope {
    pub fn seal(
        message_id: String,
        sender: Username,
        sender_device: DeviceId,
        message: &RatchetMessage,
        identity: &SigningKeyPair,
        rekey: bool,
    ) -> Result<Self, EnvelopeError> {
        let inner = codec::to_wire(message)?;
        let signature = identity.sign(&inner);
        Ok(Self {
            tag: EnvelopeTag::Message,
            message_id,
            sender,
            sender_device,
            inner,
            signature,
            rekey,
        })
    }

    /// Verify the identity signature and decode the inner ratchet message.
    pub fn verify(&self, identity: &PublicSigningKey) -> Result<RatchetMessage, EnvelopeError> {
        identity.verify(&self.inner, &self.signature)?;
        Ok(codec::from_wire(&self.inner)?)
    }
}

/// Per-device wrapping of the payload key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerDeviceKey {
    #[serde(rename = "u")]
    pub user: Username,
    #[serde(rename = "d")]
    pub device: DeviceId,
    #[serde(rename = "e")]
    pub envelope: Envelope,
}

/// One sealed payload fanned out to many devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiRecipientEnvelope {
    #[serde(rename = "t")]
    pub tag: EnvelopeTag,
    #[serde(rename = "id")]
    pub message_id: String,
    #[serde(rename = "u")]
    pub sender: Username,
    #[serde(rename = "d")]
    pub sender_device: DeviceId,
    #[serde(rename = "p", with = "serde_bytes")]
    pub sealed_payload: Vec<u8>,
    #[serde(rename = "g", with = "serde_bytes")]
    pub signature: Vec<u8>,
    #[serde(rename = "k")]
    pub keys: Vec<PerDeviceKey>,
}

impl MultiRecipientEnvelope {
    /// Seal the shared payload and sign the sealed bytes. Per-device key
    /// wrappings are produced by the caller (they need one ratchet each) and
    /// passed in ready-made.
    pub fn seal(
        message_id: String,
        sender: Username,
        sender_device: DeviceId,
        payload_key: &[u8; PAYLOAD_KEY_LEN],
        payload: &[u8],
        identity: &SigningKeyPair,
        keys: Vec<PerDeviceKey>,
    ) -> Result<Self, EnvelopeError> {
        let sealed_payload = aead::seal_blob(payload_key, payload, PAYLOAD_AAD)?;
        let signature = identity.sign(&sealed_payload);
        Ok(Self {
            tag: EnvelopeTag::MultiRecipientMessage,
            message_id,
            sender,
            sender_device,
            sealed_payload,
            signature,
            keys,
        })
    }

    /// Verify the outer signature over the sealed payload.
    pub fn verify(&self, identity: &PublicSigningKey) -> Result<(), EnvelopeError> {
        identity.verify(&self.sealed_payload, &self.signature)?;
        Ok(())
    }

    /// Open the shared payload with a recovered payload key.
    pub fn open_payload(
        &self,
        payload_key: &[u8; PAYLOAD_KEY_LEN],
    ) -> Result<Zeroizing<Vec<u8>>, EnvelopeError> {
        Ok(aead::open_blob(payload_key, &self.sealed_payload, PAYLOAD_AAD)?)
    }

    /// The key wrapping addressed to one device.
    pub fn key_for(&self, user: &Username, device: &DeviceId) -> Result<&PerDeviceKey, EnvelopeError> {
        self.keys
            .iter()
            .find(|k| &k.user == user && &k.device == device)
            .ok_or(EnvelopeError::NotAddressed)
    }

    /// Server-side view with every wrapping except the recipient's removed.
    pub fn stripped_for(&self, user: &Username, device: &DeviceId) -> Self {
        let mut stripped = self.clone();
        stripped
            .keys
            .retain(|k| &k.user == user && &k.device == device);
        stripped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctk_crypto::{AgreementKeyPair, RatchetConfig, RatchetState};

    fn ratcheted_message() -> RatchetMessage {
        let peer = AgreementKeyPair::generate();
        let mut state =
            RatchetState::initialize_sender(RatchetConfig::default(), &[1u8; 32], peer.public())
                .unwrap();
        state.encrypt(b"inner").unwrap()
    }

    #[test]
    fn sign_verify_roundtrip() {
        let identity = SigningKeyPair::generate();
        let envelope = Envelope::seal(
            "msg-1".into(),
            Username::new("alice"),
            DeviceId::new("d0"),
            &ratcheted_message(),
            &identity,
            false,
        )
        .unwrap();

        assert!(envelope.verify(&identity.public()).is_ok());
    }

    #[test]
    fn any_mutated_byte_breaks_the_signature() {
        let identity = SigningKeyPair::generate();
        let envelope = Envelope::seal(
            "msg-2".into(),
            Username::new("alice"),
            DeviceId::new("d0"),
            &ratcheted_message(),
            &identity,
            true,
        )
        .unwrap();

        for i in 0..envelope.inner.len() {
            let mut tampered = envelope.clone();
            tampered.inner[i] ^= 0x01;
            assert!(tampered.verify(&identity.public()).is_err(), "byte {i}");
        }
    }

    #[test]
    fn wrong_identity_fails() {
        let identity = SigningKeyPair::generate();
        let envelope = Envelope::seal(
            "msg-3".into(),
            Username::new("alice"),
            DeviceId::new("d0"),
            &ratcheted_message(),
            &identity,
            false,
        )
        .unwrap();
        assert!(envelope.verify(&SigningKeyPair::generate().public()).is_err());
    }

    #[test]
    fn multi_recipient_payload_roundtrip() {
        let identity = SigningKeyPair::generate();
        let payload_key = [0x55u8; PAYLOAD_KEY_LEN];
        let envelope = MultiRecipientEnvelope::seal(
            "msg-4".into(),
            Username::new("alice"),
            DeviceId::new("d0"),
            &payload_key,
            b"shared payload",
            &identity,
            Vec::new(),
        )
        .unwrap();

        envelope.verify(&identity.public()).unwrap();
        assert_eq!(&*envelope.open_payload(&payload_key).unwrap(), b"shared payload");
        assert!(envelope.open_payload(&[0u8; 32]).is_err());

        let mut tampered = envelope;
        tampered.sealed_payload[0] ^= 0x80;
        assert!(tampered.verify(&identity.public()).is_err());
    }
}
