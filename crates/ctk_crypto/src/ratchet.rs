//! Double Ratchet with DH ratchet steps.
//!
//! One ratchet exists per (local device, peer device) pair. State
//! separation:
//!   RK  — root key (updated twice on every DH ratchet step)
//!   CKs — sending chain key (updated per message sent)
//!   CKr — receiving chain key (updated per message received)
//!   MK  — message key (derived from a chain key, used once, then deleted)
//!
//! The suite is configurable: hash (SHA-256/512), AEAD (AES-256-GCM or
//! ChaCha20-Poly1305) and the HKDF label. The header travels unencrypted but
//! is bound into the AEAD associated data, and the nonce is derived from a
//! hash of that associated data; a message key is never reused, so the
//! derived nonce is unique per key.
//!
//! Out-of-order tolerance: message keys for skipped numbers are parked in a
//! FIFO queue bounded by `max_skipped_keys`; a jump larger than `max_skip`
//! in one message is rejected.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::aead::{nonce_from_hash, AeadAlg};
use crate::error::CryptoError;
use crate::hash::HashAlg;
use crate::kdf;
use crate::keys::{AgreementKeyPair, PublicAgreementKey};

pub const ROOT_KEY_LEN: usize = 32;

/// Suite and bounds for one ratchet. Persisted with the state so a session
/// keeps its parameters across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetConfig {
    pub hash: HashAlg,
    pub aead: AeadAlg,
    /// Protocol label mixed into the associated data of every message.
    pub associated_data: Vec<u8>,
    /// Bound on parked skipped keys; the oldest entry is evicted first.
    pub max_skipped_keys: usize,
    /// Largest forward jump a single message may require.
    pub max_skip: u64,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            hash: HashAlg::Sha256,
            aead: AeadAlg::ChaCha20Poly1305,
            associated_data: b"cyphertextkit-v1".to_vec(),
            max_skipped_keys: 100,
            max_skip: 500,
        }
    }
}

// ── Wire types ───────────────────────────────────────────────────────────────

/// Sent unencrypted alongside every ciphertext so the recipient can advance
/// its ratchet. Field tags are single letters and part of the compatibility
/// surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key.
    #[serde(rename = "p")]
    pub sender_public: PublicAgreementKey,
    /// Length of the sender's previous sending chain.
    #[serde(rename = "c")]
    pub previous_chain_length: u64,
    /// Message number within the current sending chain.
    #[serde(rename = "n")]
    pub message_number: u64,
}

impl RatchetHeader {
    /// Deterministic header encoding; included in the AEAD associated data.
    pub fn to_wire(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

/// One ratcheted message: header plus AEAD ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetMessage {
    #[serde(rename = "h")]
    pub header: RatchetHeader,
    #[serde(rename = "b", with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

// ── State ────────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct SkippedKey {
    remote: PublicAgreementKey,
    message_number: u64,
    key: [u8; 32],
}

/// Complete Double Ratchet state. Persisted encrypted at rest inside its
/// owning device identity.
#[derive(Serialize, Deserialize)]
pub struct RatchetState {
    config: RatchetConfig,
    root_key: [u8; 32],
    /// Our current DH ratchet secret; regenerated on each DH step.
    local_private: [u8; 32],
    /// Peer's last observed DH ratchet public key.
    remote_public: Option<PublicAgreementKey>,
    sending_chain: Option<[u8; 32]>,
    receiving_chain: Option<[u8; 32]>,
    previous_sending_count: u64,
    sent_count: u64,
    received_count: u64,
    /// FIFO queue of message keys parked for out-of-order delivery.
    skipped: VecDeque<SkippedKey>,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.local_private.zeroize();
        if let Some(ref mut ck) = self.sending_chain {
            ck.zeroize();
        }
        if let Some(ref mut ck) = self.receiving_chain {
            ck.zeroize();
        }
        for entry in self.skipped.iter_mut() {
            entry.key.zeroize();
        }
    }
}

impl RatchetState {
    /// Initialise as the sending side of a fresh session.
    ///
    /// Performs the first DH step immediately: a fresh local ratchet key
    /// against the peer's advertised agreement key, mixed into the root key
    /// to produce the initial sending chain.
    pub fn initialize_sender(
        config: RatchetConfig,
        shared_secret: &[u8],
        peer_public: PublicAgreementKey,
    ) -> Result<Self, CryptoError> {
        let root = root_key_from(shared_secret)?;
        let local = AgreementKeyPair::generate();
        let dh = local.agree(&peer_public);
        let (root_key, sending_chain) = kdf::kdf_root(config.hash, &root, dh.as_ref())?;

        Ok(Self {
            config,
            root_key,
            local_private: *local.secret_bytes(),
            remote_public: Some(peer_public),
            sending_chain: Some(sending_chain),
            receiving_chain: None,
            previous_sending_count: 0,
            sent_count: 0,
            received_count: 0,
            skipped: VecDeque::new(),
        })
    }

    /// Initialise as the receiving side and consume the session's first
    /// message. The DH step happens inside `decrypt`, because the first
    /// header carries a ratchet key we have never seen.
    pub fn initialize_recipient(
        config: RatchetConfig,
        shared_secret: &[u8],
        local: &AgreementKeyPair,
        first_message: &RatchetMessage,
    ) -> Result<(Self, Zeroizing<Vec<u8>>), CryptoError> {
        let root_key = root_key_from(shared_secret)?;
        let mut state = Self {
            config,
            root_key,
            local_private: *local.secret_bytes(),
            remote_public: None,
            sending_chain: None,
            receiving_chain: None,
            previous_sending_count: 0,
            sent_count: 0,
            received_count: 0,
            skipped: VecDeque::new(),
        };
        let plaintext = state.decrypt(first_message)?;
        Ok((state, plaintext))
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, CryptoError> {
        let chain = self.sending_chain.ok_or(CryptoError::NotInitialised)?;
        let (next_chain, message_key) = kdf::chain_step(self.config.hash, &chain)?;

        let header = RatchetHeader {
            sender_public: AgreementKeyPair::from_bytes(&self.local_private)?.public(),
            previous_chain_length: self.previous_sending_count,
            message_number: self.sent_count,
        };
        let aad = self.associated_data(&header)?;
        let nonce = nonce_from_hash(self.config.hash, &aad, self.config.aead.nonce_len());
        let ciphertext = self.config.aead.seal(&message_key, &nonce, &aad, plaintext)?;

        self.sending_chain = Some(next_chain);
        self.sent_count += 1;

        Ok(RatchetMessage { header, ciphertext })
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Three phases: parked skipped key, DH ratchet on a new remote key,
    /// then advancing the receiving chain to the message number.
    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let header = &message.header;

        // Phase 1: an out-of-order message whose key was parked earlier.
        if let Some(pos) = self.skipped.iter().position(|s| {
            s.remote == header.sender_public && s.message_number == header.message_number
        }) {
            let mut entry = self.skipped.remove(pos).expect("position came from iter");
            let result = self.open(&entry.key, message);
            entry.key.zeroize();
            return result;
        }

        // Phase 2: unseen ratchet key means the peer has turned; finish the
        // current receiving chain, then step the DH ratchet twice through
        // the root key.
        let ratchet_needed = match &self.remote_public {
            Some(current) => *current != header.sender_public,
            None => true,
        };
        if ratchet_needed {
            if self.receiving_chain.is_some() {
                self.skip_until(header.previous_chain_length)?;
            }
            self.dh_ratchet(header.sender_public)?;
        }

        // Phase 3: advance to the message number, parking keys on the way.
        self.skip_until(header.message_number)?;
        let chain = self
            .receiving_chain
            .ok_or_else(|| CryptoError::InvalidHandshake("no receiving chain".into()))?;
        let (next_chain, message_key) = kdf::chain_step(self.config.hash, &chain)?;
        let plaintext = self.open(&message_key, message)?;

        self.receiving_chain = Some(next_chain);
        self.received_count = header.message_number + 1;

        Ok(plaintext)
    }

    // ── Internal ─────────────────────────────────────────────────────────

    /// DH ratchet step: new receiving chain with the current local key, then
    /// a fresh local key and a new sending chain. Two root-key updates.
    fn dh_ratchet(&mut self, remote: PublicAgreementKey) -> Result<(), CryptoError> {
        self.remote_public = Some(remote);

        let local = AgreementKeyPair::from_bytes(&self.local_private)?;
        let dh_recv = local.agree(&remote);
        let (root, receiving) = kdf::kdf_root(self.config.hash, &self.root_key, dh_recv.as_ref())?;
        self.root_key = root;
        self.receiving_chain = Some(receiving);
        self.received_count = 0;

        self.previous_sending_count = self.sent_count;
        self.sent_count = 0;

        let fresh = AgreementKeyPair::generate();
        let dh_send = fresh.agree(&remote);
        let (root, sending) = kdf::kdf_root(self.config.hash, &self.root_key, dh_send.as_ref())?;
        self.root_key = root;
        self.sending_chain = Some(sending);
        self.local_private = *fresh.secret_bytes();

        Ok(())
    }

    /// Advance the receiving chain up to (not including) `until`, parking a
    /// message key for every number passed over.
    fn skip_until(&mut self, until: u64) -> Result<(), CryptoError> {
        if until <= self.received_count {
            return Ok(());
        }
        let Some(mut chain) = self.receiving_chain else {
            return Ok(());
        };
        let requested = until - self.received_count;
        if requested > self.config.max_skip {
            return Err(CryptoError::TooManySkipped {
                requested,
                max: self.config.max_skip,
            });
        }
        let remote = self
            .remote_public
            .ok_or_else(|| CryptoError::InvalidHandshake("receiving chain without remote key".into()))?;

        while self.received_count < until {
            let (next_chain, message_key) = kdf::chain_step(self.config.hash, &chain)?;
            self.skipped.push_back(SkippedKey {
                remote,
                message_number: self.received_count,
                key: message_key,
            });
            chain = next_chain;
            self.received_count += 1;
        }
        self.receiving_chain = Some(chain);

        while self.skipped.len() > self.config.max_skipped_keys {
            if let Some(mut oldest) = self.skipped.pop_front() {
                oldest.key.zeroize();
            }
        }
        Ok(())
    }

    fn associated_data(&self, header: &RatchetHeader) -> Result<Vec<u8>, CryptoError> {
        let header_bytes = header.to_wire()?;
        let mut aad =
            Vec::with_capacity(self.config.associated_data.len() + header_bytes.len());
        aad.extend_from_slice(&self.config.associated_data);
        aad.extend_from_slice(&header_bytes);
        Ok(aad)
    }

    fn open(
        &self,
        message_key: &[u8; 32],
        message: &RatchetMessage,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let aad = self.associated_data(&message.header)?;
        let nonce = nonce_from_hash(self.config.hash, &aad, self.config.aead.nonce_len());
        self.config
            .aead
            .open(message_key, &nonce, &aad, &message.ciphertext)
    }

    // ── Introspection ────────────────────────────────────────────────────

    pub fn config(&self) -> &RatchetConfig {
        &self.config
    }

    pub fn sent_count(&self) -> u64 {
        self.sent_count
    }

    pub fn received_count(&self) -> u64 {
        self.received_count
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }
}

fn root_key_from(shared_secret: &[u8]) -> Result<[u8; 32], CryptoError> {
    shared_secret
        .try_into()
        .map_err(|_| CryptoError::InvalidRootKeySize { got: shared_secret.len() })
}
