//! At-rest encryption of store rows.
//!
//! Backends never see plaintext: every blob column is XChaCha20-Poly1305
//! ciphertext produced here. The store key is derived from the application
//! password when the local config is unlocked and held in memory for the
//! lifetime of the messenger; it zeroizes when the last handle drops.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use zeroize::Zeroizing;

use ctk_crypto::aead;
use ctk_proto::codec;

use crate::error::StoreError;

const STORE_AAD: &[u8] = b"ctk-store-v1";

/// Cheap-to-clone handle on the 32-byte at-rest key.
#[derive(Clone)]
pub struct StoreKey {
    key: Arc<Zeroizing<[u8; 32]>>,
}

impl StoreKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key: Arc::new(Zeroizing::new(key)) }
    }

    /// Encrypt a plaintext blob for persistence.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        Ok(aead::seal_blob(&self.key, plaintext, STORE_AAD)?)
    }

    /// Decrypt a persisted blob.
    pub fn open(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        Ok(aead::open_blob(&self.key, blob, STORE_AAD)?)
    }

    /// Serialize with the canonical codec, then encrypt.
    pub fn seal_value<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StoreError> {
        self.seal(&codec::to_wire(value)?)
    }

    /// Decrypt, then deserialize with the canonical codec.
    pub fn open_value<T: DeserializeOwned>(&self, blob: &[u8]) -> Result<T, StoreError> {
        let plaintext = self.open(blob)?;
        Ok(codec::from_wire(&plaintext)?)
    }
}

impl std::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StoreKey(..)")
    }
}
