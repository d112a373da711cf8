//! Per-device session store.
//!
//! One `DeviceIdentity` exists per peer `(user, device)` and owns that
//! device's optional ratchet state. The in-memory map is also the live-object
//! cache: every task touching the same device observes the same
//! `Arc<Mutex<DeviceIdentity>>`, and the per-device mutex serializes ratchet
//! mutations so chain counters can never interleave.
//!
//! Session bootstrap derives the shared key as
//! `HKDF(ikm = X25519(local, peer), salt = H(initiator username))` with the
//! configured protocol label; the initiator is whichever side runs
//! `initialize_sender`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use ctk_crypto::{
    kdf, AgreementKeyPair, PublicAgreementKey, PublicSigningKey, RatchetConfig, RatchetState,
};
use ctk_proto::{DeviceConfig, DeviceId, Envelope, UserConfig, Username};
use ctk_store::{DeviceIdentityRow, MessengerStore, StoreKey};

use crate::error::MessengerError;

/// Everything known about one peer device (persisted encrypted at rest).
#[derive(Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub user: Username,
    pub device: DeviceId,
    pub signing: PublicSigningKey,
    pub agreement: PublicAgreementKey,
    pub is_master: bool,
    pub local_id: u64,
    pub ratchet: Option<RatchetState>,
}

/// Shared live handle: the cache and every task see the same instance.
pub type DeviceHandle = Arc<Mutex<DeviceIdentity>>;

/// Outcome of refreshing a user's published config against stored state.
pub(crate) struct RefreshOutcome {
    pub devices: Vec<DeviceHandle>,
    /// Devices whose signing key no longer matches what we stored.
    pub identity_changed: bool,
}

pub(crate) struct DeviceSessions {
    store: Arc<dyn MessengerStore>,
    store_key: StoreKey,
    local_user: Username,
    local_device: DeviceId,
    local_agreement: AgreementKeyPair,
    ratchet_config: RatchetConfig,
    map: parking_lot::Mutex<HashMap<(Username, DeviceId), DeviceHandle>>,
    next_local_id: AtomicU64,
}

impl DeviceSessions {
    pub fn new(
        store: Arc<dyn MessengerStore>,
        store_key: StoreKey,
        local_user: Username,
        local_device: DeviceId,
        local_agreement: AgreementKeyPair,
        ratchet_config: RatchetConfig,
    ) -> Self {
        Self {
            store,
            store_key,
            local_user,
            local_device,
            local_agreement,
            ratchet_config,
            map: parking_lot::Mutex::new(HashMap::new()),
            next_local_id: AtomicU64::new(0),
        }
    }

    // ── Lookup / creation ────────────────────────────────────────────────

    /// The live handle for a device, loading it from the store on first use.
    pub async fn get(
        &self,
        user: &Username,
        device: &DeviceId,
    ) -> Result<Option<DeviceHandle>, MessengerError> {
        if let Some(handle) = self.cached(user, device) {
            return Ok(Some(handle));
        }
        let rows = self.store.list_device_identities(user).await?;
        for row in rows {
            if &row.device == device {
                let identity: DeviceIdentity = self.store_key.open_value(&row.blob)?;
                return Ok(Some(self.intern(identity)));
            }
        }
        Ok(None)
    }

    /// Create (or return) the identity for a device advertised in a user
    /// config entry.
    pub async fn insert_from_config(
        &self,
        user: &Username,
        config: &DeviceConfig,
    ) -> Result<DeviceHandle, MessengerError> {
        if let Some(existing) = self.get(user, &config.device_id).await? {
            return Ok(existing);
        }
        let identity = DeviceIdentity {
            user: user.clone(),
            device: config.device_id.clone(),
            signing: config.signing,
            agreement: config.agreement,
            is_master: config.is_master,
            local_id: self.next_local_id.fetch_add(1, Ordering::Relaxed),
            ratchet: None,
        };
        debug!(user = %user, device = %config.device_id, "new device identity");
        self.persist(&identity).await?;
        Ok(self.intern(identity))
    }

    /// All known devices of a user, excluding our own device.
    pub async fn all_for_user(
        &self,
        user: &Username,
    ) -> Result<Vec<DeviceHandle>, MessengerError> {
        let rows = self.store.list_device_identities(user).await?;
        let mut handles = Vec::with_capacity(rows.len());
        for row in rows {
            if row.user == self.local_user && row.device == self.local_device {
                continue;
            }
            let handle = match self.cached(&row.user, &row.device) {
                Some(handle) => handle,
                None => {
                    let identity: DeviceIdentity = self.store_key.open_value(&row.blob)?;
                    self.intern(identity)
                }
            };
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Reconcile a freshly fetched user config with stored identities.
    /// A changed signing key replaces the stored identity and drops its
    /// ratchet.
    pub async fn refresh_user(
        &self,
        user: &Username,
        config: &UserConfig,
    ) -> Result<RefreshOutcome, MessengerError> {
        let mut outcome = RefreshOutcome { devices: Vec::new(), identity_changed: false };
        for device_config in config.devices()? {
            if user == &self.local_user && device_config.device_id == self.local_device {
                continue;
            }
            match self.get(user, &device_config.device_id).await? {
                Some(handle) => {
                    let mut identity = handle.lock().await;
                    if identity.signing != device_config.signing {
                        warn!(
                            user = %user,
                            device = %device_config.device_id,
                            "peer signing key changed; dropping session"
                        );
                        identity.signing = device_config.signing;
                        identity.agreement = device_config.agreement;
                        identity.is_master = device_config.is_master;
                        identity.ratchet = None;
                        self.persist(&identity).await?;
                        outcome.identity_changed = true;
                    }
                    drop(identity);
                    outcome.devices.push(handle);
                }
                None => {
                    outcome
                        .devices
                        .push(self.insert_from_config(user, &device_config).await?);
                }
            }
        }
        Ok(outcome)
    }

    pub async fn remove(&self, user: &Username, device: &DeviceId) -> Result<(), MessengerError> {
        self.map.lock().remove(&(user.clone(), device.clone()));
        self.store.remove_device_identity(user, device).await?;
        Ok(())
    }

    // ── Ratchet access ───────────────────────────────────────────────────

    /// Run `f` against the device's ratchet under its exclusive lock,
    /// creating the session as sender when none exists. Returns `f`'s result
    /// and whether this call (re)initialized the session, which the caller
    /// must surface as the envelope's rekey flag.
    pub async fn write_with_ratchet<T>(
        &self,
        user: &Username,
        device: &DeviceId,
        f: impl FnOnce(&mut RatchetState) -> Result<T, MessengerError>,
    ) -> Result<(T, bool), MessengerError> {
        let handle = self.require(user, device).await?;
        let mut identity = handle.lock().await;

        let rekey = identity.ratchet.is_none();
        if rekey {
            debug!(user = %user, device = %device, "initialising session as sender");
            let session_key = self.session_key(&self.local_user, &identity.agreement)?;
            identity.ratchet = Some(RatchetState::initialize_sender(
                self.ratchet_config.clone(),
                session_key.as_ref(),
                identity.agreement,
            )?);
        }
        let ratchet = identity.ratchet.as_mut().expect("initialised above");
        let value = f(ratchet)?;
        self.persist(&identity).await?;
        Ok((value, rekey))
    }

    /// Verify and decrypt an inbound envelope under the device lock.
    ///
    /// A rekey flag (or missing state) initializes as recipient; any
    /// decryption or initialization failure clears the stored state and
    /// surfaces as `SessionDesync`, which obliges the caller to queue a
    /// rekey announcement before re-raising.
    pub async fn read_with_ratchet(
        &self,
        envelope: &Envelope,
    ) -> Result<Zeroizing<Vec<u8>>, MessengerError> {
        let handle = self.require(&envelope.sender, &envelope.sender_device).await?;
        let mut identity = handle.lock().await;

        let message = envelope.verify(&identity.signing)?;

        let attempt = if envelope.rekey || identity.ratchet.is_none() {
            debug!(
                user = %envelope.sender,
                device = %envelope.sender_device,
                rekey = envelope.rekey,
                "initialising session as recipient"
            );
            let session_key = self.session_key(&envelope.sender, &identity.agreement)?;
            RatchetState::initialize_recipient(
                self.ratchet_config.clone(),
                session_key.as_ref(),
                &self.local_agreement,
                &message,
            )
            .map(|(state, plaintext)| {
                identity.ratchet = Some(state);
                plaintext
            })
            .map_err(MessengerError::from)
        } else {
            identity
                .ratchet
                .as_mut()
                .expect("checked above")
                .decrypt(&message)
                .map_err(MessengerError::from)
        };

        match attempt {
            Ok(plaintext) => {
                self.persist(&identity).await?;
                Ok(plaintext)
            }
            Err(source) => {
                warn!(
                    user = %envelope.sender,
                    device = %envelope.sender_device,
                    error = %source,
                    "session read failed; clearing ratchet state"
                );
                identity.ratchet = None;
                self.persist(&identity).await?;
                Err(MessengerError::SessionDesync {
                    user: envelope.sender.clone(),
                    device: envelope.sender_device.clone(),
                    source: Box::new(source),
                })
            }
        }
    }

    /// Drop the ratchet so the next outbound write re-initializes as sender.
    pub async fn clear_ratchet(
        &self,
        user: &Username,
        device: &DeviceId,
    ) -> Result<(), MessengerError> {
        if let Some(handle) = self.get(user, device).await? {
            let mut identity = handle.lock().await;
            identity.ratchet = None;
            self.persist(&identity).await?;
        }
        Ok(())
    }

    // ── Internal ─────────────────────────────────────────────────────────

    fn cached(&self, user: &Username, device: &DeviceId) -> Option<DeviceHandle> {
        self.map.lock().get(&(user.clone(), device.clone())).cloned()
    }

    /// Insert into the live cache, keeping the first instance on a race.
    fn intern(&self, identity: DeviceIdentity) -> DeviceHandle {
        let key = (identity.user.clone(), identity.device.clone());
        let mut map = self.map.lock();
        if let Some(existing) = map.get(&key) {
            return existing.clone();
        }
        let next = identity.local_id + 1;
        self.next_local_id.fetch_max(next, Ordering::Relaxed);
        let handle = Arc::new(Mutex::new(identity));
        map.insert(key, handle.clone());
        handle
    }

    async fn require(
        &self,
        user: &Username,
        device: &DeviceId,
    ) -> Result<DeviceHandle, MessengerError> {
        self.get(user, device)
            .await?
            .ok_or_else(|| MessengerError::NotFound(format!("device {user}:{device}")))
    }

    async fn persist(&self, identity: &DeviceIdentity) -> Result<(), MessengerError> {
        let row = DeviceIdentityRow {
            user: identity.user.clone(),
            device: identity.device.clone(),
            blob: self.store_key.seal_value(identity)?,
        };
        self.store.upsert_device_identity(row).await?;
        Ok(())
    }

    fn session_key(
        &self,
        initiator: &Username,
        peer_agreement: &PublicAgreementKey,
    ) -> Result<Zeroizing<[u8; 32]>, MessengerError> {
        let shared = self.local_agreement.agree(peer_agreement);
        let salt = self
            .ratchet_config
            .hash
            .digest(initiator.as_str().as_bytes());
        Ok(kdf::session_key(
            &shared,
            &salt,
            &self.ratchet_config.associated_data,
        )?)
    }
}
