//! Local device identity, persisted as one encrypted blob.
//!
//! The blob is sealed with a key derived from the application password and
//! the per-installation salt; the salt is stored in cleartext next to it,
//! the password is never stored. A successful decrypt IS the password check.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use ctk_crypto::{aead, kdf, AgreementKeyPair, PublicSigningKey, SigningKeyPair};
use ctk_proto::{codec, DeviceConfig, DeviceId, UserConfig, Username};
use ctk_store::MessengerStore;

use crate::error::MessengerError;

const CONFIG_AAD: &[u8] = b"ctk-device-config-v1";

/// Private key material of this device. Never leaves the encrypted blob.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceKeys {
    #[serde(rename = "d")]
    pub device_id: DeviceId,
    #[serde(rename = "s")]
    pub signing: SigningKeyPair,
    #[serde(rename = "a")]
    pub agreement: AgreementKeyPair,
}

impl DeviceKeys {
    pub fn generate(device_id: DeviceId) -> Self {
        Self {
            device_id,
            signing: SigningKeyPair::generate(),
            agreement: AgreementKeyPair::generate(),
        }
    }

    /// The public half published in the user config.
    pub fn to_device_config(&self, is_master: bool) -> DeviceConfig {
        DeviceConfig {
            device_id: self.device_id.clone(),
            signing: self.signing.public(),
            agreement: self.agreement.public(),
            is_master,
        }
    }
}

/// Everything this installation needs to come back up: who we are, our key
/// material, and the last published user config we know of.
#[derive(Clone, Serialize, Deserialize)]
pub struct LocalDeviceConfig {
    #[serde(rename = "u")]
    pub username: Username,
    #[serde(rename = "k")]
    pub device_keys: DeviceKeys,
    #[serde(rename = "m")]
    pub is_master: bool,
    /// The identity signing pair; only the master device holds it.
    #[serde(rename = "i")]
    pub identity: Option<SigningKeyPair>,
    #[serde(rename = "p")]
    pub identity_public: PublicSigningKey,
    /// Last known published config for our own user.
    #[serde(rename = "c")]
    pub user_config: UserConfig,
}

impl LocalDeviceConfig {
    /// The identity pair, or the master-device error.
    pub fn require_identity(&self) -> Result<&SigningKeyPair, MessengerError> {
        self.identity.as_ref().ok_or(MessengerError::NotMasterDevice)
    }
}

/// Seal the config with the password-derived key.
pub fn seal_local_config(
    password: &str,
    salt: &[u8],
    config: &LocalDeviceConfig,
) -> Result<Vec<u8>, MessengerError> {
    let key = kdf::device_config_key(password, salt)?;
    seal_with_key(&key, config)
}

/// Seal with an already-derived config key (used when the config is updated
/// mid-session and the password is no longer around).
pub fn seal_with_key(
    key: &[u8; 32],
    config: &LocalDeviceConfig,
) -> Result<Vec<u8>, MessengerError> {
    let plaintext = Zeroizing::new(codec::to_wire(config)?);
    Ok(aead::seal_blob(key, &plaintext, CONFIG_AAD)?)
}

/// Open the config blob; any failure (wrong password included) surfaces as
/// `CorruptConfig`.
pub fn open_local_config(
    password: &str,
    salt: &[u8],
    blob: &[u8],
) -> Result<LocalDeviceConfig, MessengerError> {
    let key = kdf::device_config_key(password, salt).map_err(|_| MessengerError::CorruptConfig)?;
    let plaintext =
        aead::open_blob(&key, blob, CONFIG_AAD).map_err(|_| MessengerError::CorruptConfig)?;
    codec::from_wire(&plaintext).map_err(|_| MessengerError::CorruptConfig)
}

/// True iff `password` decrypts the stored config.
pub fn verify_password(password: &str, salt: &[u8], blob: &[u8]) -> bool {
    open_local_config(password, salt, blob).is_ok()
}

/// Read the installation salt, generating and persisting one on first run.
pub async fn load_or_create_salt(
    store: &dyn MessengerStore,
) -> Result<Vec<u8>, MessengerError> {
    if let Some(salt) = store.read_local_device_salt().await? {
        return Ok(salt);
    }
    let salt = kdf::generate_salt().to_vec();
    store.write_local_device_salt(salt.clone()).await?;
    Ok(salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> LocalDeviceConfig {
        let identity = SigningKeyPair::generate();
        let keys = DeviceKeys::generate(DeviceId::new("d0"));
        let user_config =
            UserConfig::new(&identity, vec![keys.to_device_config(true)]).unwrap();
        LocalDeviceConfig {
            username: Username::new("m0"),
            identity_public: identity.public(),
            identity: Some(identity),
            device_keys: keys,
            is_master: true,
            user_config,
        }
    }

    #[test]
    fn seal_open_roundtrip() {
        let config = sample_config();
        let salt = kdf::generate_salt();
        let blob = seal_local_config("hunter2", &salt, &config).unwrap();

        let restored = open_local_config("hunter2", &salt, &blob).unwrap();
        assert_eq!(restored.username, config.username);
        assert_eq!(
            restored.device_keys.signing.public(),
            config.device_keys.signing.public()
        );
        assert!(restored.is_master);
    }

    #[test]
    fn wrong_password_is_corrupt_config() {
        let config = sample_config();
        let salt = kdf::generate_salt();
        let blob = seal_local_config("hunter2", &salt, &config).unwrap();

        assert!(matches!(
            open_local_config("hunter3", &salt, &blob),
            Err(MessengerError::CorruptConfig)
        ));
        assert!(verify_password("hunter2", &salt, &blob));
        assert!(!verify_password("hunter3", &salt, &blob));
    }

    #[tokio::test]
    async fn salt_is_created_once() {
        let store = ctk_store::MemoryStore::new();
        let first = load_or_create_salt(&store).await.unwrap();
        let second = load_or_create_salt(&store).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
    }
}
