//! Hash utilities.
//!
//! The ratchet suite selects between SHA-256 and SHA-512; BLAKE3 is used for
//! content ids and key fingerprints, which never travel through the ratchet.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

/// Hash function driving HKDF, HMAC chain steps and nonce derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlg {
    Sha256,
    Sha512,
}

impl HashAlg {
    pub fn output_len(&self) -> usize {
        match self {
            HashAlg::Sha256 => 32,
            HashAlg::Sha512 => 64,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlg::Sha256 => Sha256::digest(data).to_vec(),
            HashAlg::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// Stable content id: BLAKE3 of the input, hex-encoded.
pub fn content_id(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Human-readable fingerprint: BLAKE3 truncated to 20 bytes, hex in groups
/// of 4 for display.
pub fn fingerprint(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    let hex = hex::encode(&hash.as_bytes()[..20]);
    hex.chars()
        .collect::<Vec<_>>()
        .chunks(4)
        .map(|c| c.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_lengths() {
        assert_eq!(HashAlg::Sha256.digest(b"x").len(), 32);
        assert_eq!(HashAlg::Sha512.digest(b"x").len(), 64);
    }

    #[test]
    fn fingerprint_is_grouped() {
        let fp = fingerprint(b"some key");
        assert_eq!(fp.split(' ').count(), 10);
        assert!(fp.split(' ').all(|g| g.len() == 4));
    }
}
