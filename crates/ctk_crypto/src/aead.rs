//! Authenticated encryption.
//!
//! Two paths with different nonce disciplines:
//!
//! - **Ratchet path** (`AeadAlg::seal`/`open`): AES-256-GCM or
//!   ChaCha20-Poly1305 with a caller-supplied 12-byte nonce. Ratchet message
//!   keys are used exactly once, so the nonce is derived deterministically
//!   from the associated data (`nonce_from_hash`).
//! - **Blob path** (`seal_blob`/`open_blob`): XChaCha20-Poly1305 with a
//!   random 24-byte nonce prepended to the ciphertext. Used for everything
//!   encrypted at rest and for multi-recipient sealed payloads.
//!
//! Blob wire format: `[ nonce (24 bytes) | ciphertext + tag ]`

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng, Payload},
    ChaCha20Poly1305, XChaCha20Poly1305,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::hash::HashAlg;

const XNONCE_LEN: usize = 24;

/// AEAD selected by the ratchet suite. Both take 32-byte keys and 12-byte
/// nonces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AeadAlg {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl AeadAlg {
    pub const fn nonce_len(&self) -> usize {
        12
    }

    pub fn seal(
        &self,
        key: &[u8; 32],
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.check_nonce(nonce)?;
        let payload = Payload { msg: plaintext, aad };
        match self {
            AeadAlg::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map_err(|_| CryptoError::AeadEncrypt)?
                .encrypt(aes_gcm::Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::AeadEncrypt),
            AeadAlg::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| CryptoError::AeadEncrypt)?
                .encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::AeadEncrypt),
        }
    }

    pub fn open(
        &self,
        key: &[u8; 32],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        self.check_nonce(nonce)?;
        let payload = Payload { msg: ciphertext, aad };
        let plaintext = match self {
            AeadAlg::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map_err(|_| CryptoError::AeadDecrypt)?
                .decrypt(aes_gcm::Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::AeadDecrypt)?,
            AeadAlg::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| CryptoError::AeadDecrypt)?
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::AeadDecrypt)?,
        };
        Ok(Zeroizing::new(plaintext))
    }

    fn check_nonce(&self, nonce: &[u8]) -> Result<(), CryptoError> {
        if nonce.len() != self.nonce_len() {
            return Err(CryptoError::InvalidNonceLength {
                expected: self.nonce_len(),
                got: nonce.len(),
            });
        }
        Ok(())
    }
}

/// Derive a nonce from a hash of the associated data, truncated (or
/// zero-padded) to the AEAD's nonce size.
pub fn nonce_from_hash(hash: HashAlg, data: &[u8], nonce_len: usize) -> Vec<u8> {
    let digest = hash.digest(data);
    let mut nonce = vec![0u8; nonce_len];
    let n = nonce_len.min(digest.len());
    nonce[..n].copy_from_slice(&digest[..n]);
    nonce
}

/// Encrypt a blob with a random prepended nonce (at-rest path).
pub fn seal_blob(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(XNONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt blob-format bytes (nonce || ciphertext+tag).
pub fn open_blob(
    key: &[u8; 32],
    data: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < XNONCE_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce, ciphertext) = data.split_at(XNONCE_LEN);
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(
            chacha20poly1305::XNonce::from_slice(nonce),
            Payload { msg: ciphertext, aad },
        )
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip_both_algorithms() {
        for alg in [AeadAlg::Aes256Gcm, AeadAlg::ChaCha20Poly1305] {
            let key = [9u8; 32];
            let nonce = nonce_from_hash(HashAlg::Sha256, b"aad", alg.nonce_len());
            let ct = alg.seal(&key, &nonce, b"aad", b"payload").unwrap();
            let pt = alg.open(&key, &nonce, b"aad", &ct).unwrap();
            assert_eq!(&*pt, b"payload");
        }
    }

    #[test]
    fn wrong_aad_fails() {
        let alg = AeadAlg::ChaCha20Poly1305;
        let key = [1u8; 32];
        let nonce = nonce_from_hash(HashAlg::Sha256, b"aad", alg.nonce_len());
        let ct = alg.seal(&key, &nonce, b"aad", b"payload").unwrap();
        assert!(alg.open(&key, &nonce, b"other", &ct).is_err());
    }

    #[test]
    fn bad_nonce_length_is_rejected() {
        let alg = AeadAlg::Aes256Gcm;
        let err = alg.seal(&[0u8; 32], &[0u8; 11], b"", b"x").unwrap_err();
        assert!(matches!(
            err,
            CryptoError::InvalidNonceLength { expected: 12, got: 11 }
        ));
    }

    #[test]
    fn blob_roundtrip() {
        let key = [5u8; 32];
        let blob = seal_blob(&key, b"secret row", b"ctk-store").unwrap();
        let pt = open_blob(&key, &blob, b"ctk-store").unwrap();
        assert_eq!(&*pt, b"secret row");
        assert!(open_blob(&[6u8; 32], &blob, b"ctk-store").is_err());
    }
}
