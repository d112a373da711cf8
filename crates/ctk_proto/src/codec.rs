//! The wire codec.
//!
//! Everything that crosses a trust boundary is serialized with exactly one
//! codec: MessagePack maps in struct-declaration order (`rmp-serde`,
//! `to_vec_named`). The encoding is deterministic for a fixed type, which is
//! what keeps signatures over serialized bytes stable across versions. Wire
//! structs rename their fields to single letters; that numbering is part of
//! the compatibility surface and never changes meaning.
//!
//! # Padding
//! Plaintext destined for a sealed payload can be padded to fixed-size
//! buckets so ciphertext lengths do not leak message sizes. The padding is
//! added inside the plaintext before encryption.
//!
//! Format: `[original_len: u32 LE] [plaintext] [random fill]`

use serde::{de::DeserializeOwned, Serialize};

const BUCKET_SIZES: &[usize] = &[256, 512, 1024, 4096, 16384, 65536];

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Wire encoding failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Wire decoding failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Invalid padding: {0}")]
    InvalidPadding(String),
}

/// Serialize a wire type with the canonical codec.
pub fn to_wire<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Deserialize a wire type with the canonical codec.
pub fn from_wire<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Pad plaintext to the next bucket boundary. Messages larger than the
/// biggest bucket are length-prefixed but not padded.
pub fn pad_to_bucket(plaintext: &[u8]) -> Vec<u8> {
    let needed = 4 + plaintext.len();
    let bucket = BUCKET_SIZES
        .iter()
        .copied()
        .find(|&b| b >= needed)
        .unwrap_or(needed);

    let mut out = Vec::with_capacity(bucket);
    out.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
    out.extend_from_slice(plaintext);
    let remaining = bucket.saturating_sub(out.len());
    if remaining > 0 {
        // Random fill, not zeros, so compressed transports cannot collapse it.
        use rand::RngCore;
        let mut fill = vec![0u8; remaining];
        rand::rngs::OsRng.fill_bytes(&mut fill);
        out.extend_from_slice(&fill);
    }
    out
}

/// Remove padding after decryption.
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, CodecError> {
    if padded.len() < 4 {
        return Err(CodecError::InvalidPadding("too short for length prefix".into()));
    }
    let len = u32::from_le_bytes([padded[0], padded[1], padded[2], padded[3]]) as usize;
    if 4 + len > padded.len() {
        return Err(CodecError::InvalidPadding(format!(
            "length prefix {len} exceeds padded size {}",
            padded.len()
        )));
    }
    Ok(padded[4..4 + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Probe {
        #[serde(rename = "a")]
        first: u32,
        #[serde(rename = "b")]
        second: String,
    }

    #[test]
    fn wire_roundtrip() {
        let probe = Probe { first: 7, second: "x".into() };
        let bytes = to_wire(&probe).unwrap();
        assert_eq!(from_wire::<Probe>(&bytes).unwrap(), probe);
    }

    #[test]
    fn encoding_is_deterministic() {
        let probe = Probe { first: 1, second: "same".into() };
        assert_eq!(to_wire(&probe).unwrap(), to_wire(&probe).unwrap());
    }

    #[test]
    fn pad_unpad_roundtrip() {
        let msg = b"Hello, World!";
        let padded = pad_to_bucket(msg);
        assert_eq!(padded.len(), 256);
        assert_eq!(unpad(&padded).unwrap(), msg);
    }

    #[test]
    fn large_message_is_prefixed_not_padded() {
        let msg = vec![0x42u8; 70_000];
        let padded = pad_to_bucket(&msg);
        assert_eq!(padded.len(), 4 + msg.len());
        assert_eq!(unpad(&padded).unwrap(), msg);
    }

    #[test]
    fn corrupt_prefix_is_rejected() {
        let mut padded = pad_to_bucket(b"short");
        padded[0] = 0xff;
        padded[1] = 0xff;
        assert!(unpad(&padded).is_err());
        assert!(unpad(&[1, 0]).is_err());
    }
}
