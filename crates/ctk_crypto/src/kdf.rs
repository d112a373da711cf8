//! Key derivation functions.
//!
//! `kdf_root` — HKDF root-key step of the DH ratchet: mixes a DH output into
//!   the root key and yields a fresh chain key.
//! `chain_step` — HMAC symmetric ratchet step: chain key → (next chain key,
//!   message key).
//! `device_config_key` — derives the key protecting the local device-config
//!   blob from the application password. The password itself is never stored;
//!   SHA-512(password) is the HKDF input keying material, the per-install
//!   salt is public.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::hash::HashAlg;

const ROOT_INFO: &[u8] = b"ctk-root-key";
const CHAIN_INFO: &[u8] = b"ctk-chain-key";
const CONFIG_INFO: &[u8] = b"ctk-device-config";
const STORE_INFO: &[u8] = b"ctk-store-rows";

/// Expand `ikm` into `output.len()` bytes of key material.
pub fn hkdf_expand(
    hash: HashAlg,
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let expand = |e: hkdf::InvalidLength| CryptoError::KeyDerivation(e.to_string());
    match hash {
        HashAlg::Sha256 => Hkdf::<Sha256>::new(salt, ikm)
            .expand(info, output)
            .map_err(expand),
        HashAlg::Sha512 => Hkdf::<Sha512>::new(salt, ikm)
            .expand(info, output)
            .map_err(expand),
    }
}

/// KDF_RK: mix a DH output into the root key.
/// Returns (new_root_key, new_chain_key).
pub fn kdf_root(
    hash: HashAlg,
    root_key: &[u8; 32],
    dh_output: &[u8],
) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut new_root = [0u8; 32];
    let mut chain = [0u8; 32];
    hkdf_expand(hash, dh_output, Some(root_key), ROOT_INFO, &mut new_root)?;
    hkdf_expand(hash, dh_output, Some(root_key), CHAIN_INFO, &mut chain)?;
    Ok((new_root, chain))
}

/// KDF_CK: chain key → (next_chain_key, message_key).
/// HMAC with distinct single-byte inputs, per the Signal spec.
pub fn chain_step(hash: HashAlg, ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    Ok((hmac_byte(hash, ck, 0x01)?, hmac_byte(hash, ck, 0x02)?))
}

fn hmac_byte(hash: HashAlg, key: &[u8; 32], input: u8) -> Result<[u8; 32], CryptoError> {
    let invalid = |e: hmac::digest::InvalidLength| CryptoError::KeyDerivation(e.to_string());
    let out: Vec<u8> = match hash {
        HashAlg::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(invalid)?;
            mac.update(&[input]);
            mac.finalize().into_bytes().to_vec()
        }
        HashAlg::Sha512 => {
            let mut mac = Hmac::<Sha512>::new_from_slice(key).map_err(invalid)?;
            mac.update(&[input]);
            mac.finalize().into_bytes().to_vec()
        }
    };
    let mut key = [0u8; 32];
    key.copy_from_slice(&out[..32]);
    Ok(key)
}

/// Derive the shared session key for a ratchet handshake from an X25519
/// agreement output. The salt binds the session to the initiating user.
pub fn session_key(
    shared_secret: &[u8; 32],
    salt: &[u8],
    info: &[u8],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf_expand(HashAlg::Sha256, shared_secret.as_ref(), Some(salt), info, key.as_mut())?;
    Ok(key)
}

/// Derive the 32-byte key protecting the local device-config blob.
pub fn device_config_key(password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut ikm = Zeroizing::new([0u8; 64]);
    ikm.copy_from_slice(&Sha512::digest(password.as_bytes()));
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf_expand(HashAlg::Sha512, ikm.as_ref(), Some(salt), CONFIG_INFO, key.as_mut())?;
    Ok(key)
}

/// Derive the 32-byte key sealing store rows at rest. Same inputs as the
/// device-config key, distinct expansion label.
pub fn store_row_key(password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut ikm = Zeroizing::new([0u8; 64]);
    ikm.copy_from_slice(&Sha512::digest(password.as_bytes()));
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf_expand(HashAlg::Sha512, ikm.as_ref(), Some(salt), STORE_INFO, key.as_mut())?;
    Ok(key)
}

/// Fresh random 16-byte salt (generated once per installation, stored in
/// cleartext).
pub fn generate_salt() -> [u8; 16] {
    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_step_is_deterministic() {
        let root = [7u8; 32];
        let (r1, c1) = kdf_root(HashAlg::Sha256, &root, b"dh-output").unwrap();
        let (r2, c2) = kdf_root(HashAlg::Sha256, &root, b"dh-output").unwrap();
        assert_eq!(r1, r2);
        assert_eq!(c1, c2);
        assert_ne!(r1, c1);
    }

    #[test]
    fn chain_step_separates_keys() {
        let ck = [3u8; 32];
        let (next, mk) = chain_step(HashAlg::Sha512, &ck).unwrap();
        assert_ne!(next, mk);
        assert_ne!(next, ck);
    }

    #[test]
    fn config_key_depends_on_password_and_salt() {
        let a = device_config_key("hunter2", &[0u8; 16]).unwrap();
        let b = device_config_key("hunter2", &[1u8; 16]).unwrap();
        let c = device_config_key("hunter3", &[0u8; 16]).unwrap();
        assert_ne!(*a, *b);
        assert_ne!(*a, *c);
    }
}
