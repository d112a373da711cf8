//! Published user configuration.
//!
//! A `UserConfig` is the authoritative, identity-signed device list for one
//! user: the long-term identity public key plus one signed entry per device.
//! Only the master device publishes it; every entry's signature covers the
//! canonical wire encoding of its `DeviceConfig`, so a relay cannot swap
//! device keys without breaking the identity trust anchor.
//!
//! Invariants enforced by `verify()`:
//!   - exactly one entry has `is_master`
//!   - every entry's signature verifies against the identity key
//!   - device ids are unique within the list

use serde::{Deserialize, Serialize};

use ctk_crypto::{CryptoError, PublicAgreementKey, PublicSigningKey, SigningKeyPair};

use crate::codec::{self, CodecError};
use crate::ids::DeviceId;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config signature invalid: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Duplicate device id {0} in device list")]
    DuplicateDevice(DeviceId),

    #[error("Device list has no master device")]
    NoMasterDevice,

    #[error("Device list has more than one master device")]
    MultipleMasterDevices,

    #[error("Unknown device id {0}")]
    UnknownDevice(DeviceId),

    #[error("Signing key does not match the published identity")]
    IdentityMismatch,
}

/// Public keys and role of one device, as published in the user config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "d")]
    pub device_id: DeviceId,
    #[serde(rename = "s")]
    pub signing: PublicSigningKey,
    #[serde(rename = "a")]
    pub agreement: PublicAgreementKey,
    #[serde(rename = "m")]
    pub is_master: bool,
}

/// A `DeviceConfig` bound to the identity key by a signature over its wire
/// encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedDeviceConfig {
    #[serde(rename = "c")]
    config: DeviceConfig,
    #[serde(rename = "g", with = "serde_bytes")]
    signature: Vec<u8>,
}

impl SignedDeviceConfig {
    pub fn issue(identity: &SigningKeyPair, config: DeviceConfig) -> Result<Self, ConfigError> {
        let signature = identity.sign(&codec::to_wire(&config)?);
        Ok(Self { config, signature })
    }

    pub fn verify(&self, identity: &PublicSigningKey) -> Result<(), ConfigError> {
        identity.verify(&codec::to_wire(&self.config)?, &self.signature)?;
        Ok(())
    }

    /// The entry itself. Callers must have verified the list first.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }
}

/// The published, identity-signed device list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(rename = "i")]
    identity: PublicSigningKey,
    #[serde(rename = "d")]
    devices: Vec<SignedDeviceConfig>,
}

impl UserConfig {
    /// Build and sign a fresh config. Validates the device-list invariants.
    pub fn new(
        identity: &SigningKeyPair,
        devices: Vec<DeviceConfig>,
    ) -> Result<Self, ConfigError> {
        let signed = devices
            .into_iter()
            .map(|d| SignedDeviceConfig::issue(identity, d))
            .collect::<Result<Vec<_>, _>>()?;
        let config = Self { identity: identity.public(), devices: signed };
        config.verify()?;
        Ok(config)
    }

    pub fn identity(&self) -> PublicSigningKey {
        self.identity
    }

    /// Check every signature and the device-list invariants.
    pub fn verify(&self) -> Result<(), ConfigError> {
        let mut master_count = 0usize;
        let mut seen: Vec<&DeviceId> = Vec::with_capacity(self.devices.len());
        for entry in &self.devices {
            entry.verify(&self.identity)?;
            if entry.config.is_master {
                master_count += 1;
            }
            if seen.contains(&&entry.config.device_id) {
                return Err(ConfigError::DuplicateDevice(entry.config.device_id.clone()));
            }
            seen.push(&entry.config.device_id);
        }
        match master_count {
            0 => Err(ConfigError::NoMasterDevice),
            1 => Ok(()),
            _ => Err(ConfigError::MultipleMasterDevices),
        }
    }

    /// All device entries, verified.
    pub fn devices(&self) -> Result<Vec<DeviceConfig>, ConfigError> {
        self.verify()?;
        Ok(self.devices.iter().map(|e| e.config.clone()).collect())
    }

    pub fn device(&self, id: &DeviceId) -> Result<DeviceConfig, ConfigError> {
        self.verify()?;
        self.devices
            .iter()
            .map(|e| &e.config)
            .find(|c| &c.device_id == id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownDevice(id.clone()))
    }

    pub fn master_device(&self) -> Result<DeviceConfig, ConfigError> {
        self.verify()?;
        self.devices
            .iter()
            .map(|e| &e.config)
            .find(|c| c.is_master)
            .cloned()
            .ok_or(ConfigError::NoMasterDevice)
    }

    /// Append a device and re-sign its entry with the identity key. The
    /// caller must hold the identity pair, which only the master device does.
    pub fn add_device(
        &mut self,
        identity: &SigningKeyPair,
        config: DeviceConfig,
    ) -> Result<(), ConfigError> {
        if identity.public() != self.identity {
            return Err(ConfigError::IdentityMismatch);
        }
        if self.devices.iter().any(|e| e.config.device_id == config.device_id) {
            return Err(ConfigError::DuplicateDevice(config.device_id));
        }
        if config.is_master {
            return Err(ConfigError::MultipleMasterDevices);
        }
        self.devices.push(SignedDeviceConfig::issue(identity, config)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctk_crypto::AgreementKeyPair;

    fn device(id: &str, is_master: bool) -> (DeviceConfig, SigningKeyPair) {
        let signing = SigningKeyPair::generate();
        let agreement = AgreementKeyPair::generate();
        let config = DeviceConfig {
            device_id: DeviceId::new(id),
            signing: signing.public(),
            agreement: agreement.public(),
            is_master,
        };
        (config, signing)
    }

    #[test]
    fn build_verify_roundtrip() {
        let identity = SigningKeyPair::generate();
        let (master, _) = device("d0", true);
        let (second, _) = device("d1", false);
        let config = UserConfig::new(&identity, vec![master.clone(), second]).unwrap();

        assert!(config.verify().is_ok());
        assert_eq!(config.master_device().unwrap().device_id, master.device_id);
        assert_eq!(config.devices().unwrap().len(), 2);

        let bytes = crate::codec::to_wire(&config).unwrap();
        let back: UserConfig = crate::codec::from_wire(&bytes).unwrap();
        assert!(back.verify().is_ok());
    }

    #[test]
    fn two_masters_are_rejected() {
        let identity = SigningKeyPair::generate();
        let (a, _) = device("d0", true);
        let (b, _) = device("d1", true);
        assert!(matches!(
            UserConfig::new(&identity, vec![a, b]),
            Err(ConfigError::MultipleMasterDevices)
        ));
    }

    #[test]
    fn duplicate_device_ids_are_rejected() {
        let identity = SigningKeyPair::generate();
        let (a, _) = device("d0", true);
        // Normalization makes "D0" collide with "d0".
        let (b, _) = device("D0", false);
        assert!(matches!(
            UserConfig::new(&identity, vec![a, b]),
            Err(ConfigError::DuplicateDevice(_))
        ));
    }

    #[test]
    fn foreign_signature_fails_verification() {
        let identity = SigningKeyPair::generate();
        let (master, _) = device("d0", true);
        let mut config = UserConfig::new(&identity, vec![master]).unwrap();

        // Re-issue an entry with a different identity key and splice it in.
        let impostor = SigningKeyPair::generate();
        let (extra, _) = device("d1", false);
        config.devices.push(SignedDeviceConfig::issue(&impostor, extra).unwrap());
        assert!(config.verify().is_err());
    }

    #[test]
    fn add_device_requires_identity_key() {
        let identity = SigningKeyPair::generate();
        let (master, _) = device("d0", true);
        let mut config = UserConfig::new(&identity, vec![master]).unwrap();

        let (extra, _) = device("d1", false);
        let impostor = SigningKeyPair::generate();
        assert!(matches!(
            config.add_device(&impostor, extra.clone()),
            Err(ConfigError::IdentityMismatch)
        ));
        config.add_device(&identity, extra).unwrap();
        assert_eq!(config.devices().unwrap().len(), 2);
    }
}
