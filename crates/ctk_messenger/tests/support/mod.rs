//! In-memory spoof server shared by the integration tests.
//!
//! The server is an explicitly instantiated fixture: every test builds its
//! own `SpoofServer` and wires one `SpoofTransport` per messenger into it.
//! Delivery is immediate unless the test enables holding, in which case
//! message events are captured and can be released in any order (for
//! reordering scenarios) or replayed (for idempotency scenarios).
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use ctk_messenger::{
    AuthenticationState, CypherMessenger, EventHandler, EventSink, HandlerChain, MessengerConfig,
    RetryMode, ServerEvent, ServerTransport, TransportError,
};
use ctk_proto::{
    DeviceConfig, DeviceId, Envelope, MultiRecipientEnvelope, UserConfig, Username,
};
use ctk_store::MemoryStore;

type Address = (Username, DeviceId);

#[derive(Default)]
struct ServerState {
    bundles: HashMap<Username, UserConfig>,
    sinks: HashMap<Address, EventSink>,
    pending: HashMap<Address, Vec<ServerEvent>>,
    blobs: HashMap<String, Vec<u8>>,
    holding: bool,
    held: Vec<(Address, ServerEvent)>,
    delivered_messages: Vec<(Address, ServerEvent)>,
}

#[derive(Default)]
pub struct SpoofServer {
    state: Mutex<ServerState>,
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl SpoofServer {
    pub fn new() -> Arc<Self> {
        init_tracing();
        Arc::new(Self::default())
    }

    pub fn transport(self: &Arc<Self>, user: &str, device: &str) -> Arc<SpoofTransport> {
        Arc::new(SpoofTransport {
            server: self.clone(),
            user: Username::new(user),
            device: DeviceId::new(device),
            online: AtomicBool::new(true),
            multi: AtomicBool::new(false),
        })
    }

    /// Capture message events instead of delivering them.
    pub fn hold(&self, enable: bool) {
        self.state.lock().holding = enable;
    }

    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Release held message events in the given order (indices into the
    /// held list at call time).
    pub fn release_held(&self, order: &[usize]) {
        let held = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.held)
        };
        for &index in order {
            let (address, event) = held[index].clone();
            self.deliver(address, event);
        }
    }

    /// Re-deliver every message event a device has already received.
    pub fn replay(&self, user: &str, device: &str) {
        let address = (Username::new(user), DeviceId::new(device));
        let events: Vec<ServerEvent> = {
            let state = self.state.lock();
            state
                .delivered_messages
                .iter()
                .filter(|(a, _)| *a == address)
                .map(|(_, e)| e.clone())
                .collect()
        };
        for event in events {
            self.deliver(address.clone(), event);
        }
    }

    /// Drop a user's published bundle so a fresh identity can register.
    pub fn forget_user(&self, user: &str) {
        self.state.lock().bundles.remove(&Username::new(user));
    }

    fn deliver(&self, address: Address, event: ServerEvent) {
        let mut state = self.state.lock();
        let is_message = matches!(
            event,
            ServerEvent::Message(_) | ServerEvent::MultiRecipientMessage(_)
        );
        if state.holding && is_message {
            state.held.push((address, event));
            return;
        }
        if is_message {
            state.delivered_messages.push((address.clone(), event.clone()));
        }
        let sink = state.sinks.get(&address).cloned();
        match sink {
            Some(sink) => {
                if sink.try_send(event.clone()).is_err() {
                    state.pending.entry(address).or_default().push(event);
                }
            }
            None => state.pending.entry(address).or_default().push(event),
        }
    }

    fn devices_of(&self, user: &Username) -> Vec<DeviceId> {
        let state = self.state.lock();
        state
            .bundles
            .get(user)
            .and_then(|bundle| bundle.devices().ok())
            .map(|devices| devices.into_iter().map(|d| d.device_id).collect())
            .unwrap_or_default()
    }
}

pub struct SpoofTransport {
    server: Arc<SpoofServer>,
    user: Username,
    device: DeviceId,
    online: AtomicBool,
    multi: AtomicBool,
}

impl SpoofTransport {
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_multi_recipient(&self, enabled: bool) {
        self.multi.store(enabled, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Offline)
        }
    }
}

#[async_trait]
impl ServerTransport for SpoofTransport {
    fn authentication_state(&self) -> AuthenticationState {
        if self.online.load(Ordering::SeqCst) {
            AuthenticationState::Authenticated
        } else {
            AuthenticationState::Unauthenticated
        }
    }

    fn supports_multi_recipient(&self) -> bool {
        self.multi.load(Ordering::SeqCst)
    }

    async fn connect(&self, sink: EventSink) -> Result<(), TransportError> {
        let address = (self.user.clone(), self.device.clone());
        let backlog = {
            let mut state = self.server.state.lock();
            state.sinks.insert(address.clone(), sink.clone());
            state.pending.remove(&address).unwrap_or_default()
        };
        for event in backlog {
            let _ = sink.try_send(event);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let address = (self.user.clone(), self.device.clone());
        self.server.state.lock().sinks.remove(&address);
        Ok(())
    }

    async fn send_single(
        &self,
        envelope: Envelope,
        user: &Username,
        device: &DeviceId,
        _message_id: &str,
    ) -> Result<(), TransportError> {
        self.check_online()?;
        self.server
            .deliver((user.clone(), device.clone()), ServerEvent::Message(envelope));
        Ok(())
    }

    async fn send_multi(
        &self,
        envelope: MultiRecipientEnvelope,
        _message_id: &str,
    ) -> Result<(), TransportError> {
        self.check_online()?;
        for key in &envelope.keys {
            let stripped = envelope.stripped_for(&key.user, &key.device);
            self.server.deliver(
                (key.user.clone(), key.device.clone()),
                ServerEvent::MultiRecipientMessage(stripped),
            );
        }
        Ok(())
    }

    async fn read_key_bundle(&self, user: &Username) -> Result<UserConfig, TransportError> {
        self.check_online()?;
        self.server
            .state
            .lock()
            .bundles
            .get(user)
            .cloned()
            .ok_or_else(|| TransportError::Rejected(format!("unknown user {user}")))
    }

    async fn publish_key_bundle(&self, config: UserConfig) -> Result<(), TransportError> {
        self.check_online()?;
        let mut state = self.server.state.lock();
        if let Some(existing) = state.bundles.get(&self.user) {
            if existing.identity() != config.identity() {
                return Err(TransportError::Rejected("identity key mismatch".into()));
            }
        }
        state.bundles.insert(self.user.clone(), config);
        Ok(())
    }

    async fn request_device_registration(
        &self,
        user: &Username,
        config: DeviceConfig,
    ) -> Result<(), TransportError> {
        self.check_online()?;
        let master = {
            let state = self.server.state.lock();
            state
                .bundles
                .get(user)
                .and_then(|bundle| bundle.master_device().ok())
                .ok_or_else(|| TransportError::Rejected(format!("unknown user {user}")))?
        };
        self.server.deliver(
            (user.clone(), master.device_id),
            ServerEvent::DeviceRegistrationRequest { user: user.clone(), config },
        );
        Ok(())
    }

    async fn publish_blob(&self, id: &str, blob: Vec<u8>) -> Result<(), TransportError> {
        self.check_online()?;
        self.server.state.lock().blobs.insert(id.to_string(), blob);
        Ok(())
    }

    async fn read_blob(&self, id: &str) -> Result<Option<Vec<u8>>, TransportError> {
        self.check_online()?;
        Ok(self.server.state.lock().blobs.get(id).cloned())
    }

    async fn send_received_receipt(
        &self,
        remote_id: &str,
        to: &Username,
    ) -> Result<(), TransportError> {
        self.check_online()?;
        for device in self.server.devices_of(to) {
            self.server.deliver(
                (to.clone(), device),
                ServerEvent::ReceivedReceipt {
                    remote_id: remote_id.to_string(),
                    by: self.user.clone(),
                },
            );
        }
        Ok(())
    }

    async fn send_read_receipt(
        &self,
        remote_id: &str,
        to: &Username,
    ) -> Result<(), TransportError> {
        self.check_online()?;
        for device in self.server.devices_of(to) {
            self.server.deliver(
                (to.clone(), device),
                ServerEvent::DisplayedReceipt {
                    remote_id: remote_id.to_string(),
                    by: self.user.clone(),
                },
            );
        }
        Ok(())
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// Accepts every device registration; used by master devices in tests.
pub struct AcceptRegistrations;

#[async_trait]
impl EventHandler for AcceptRegistrations {
    async fn on_device_registration_request(
        &self,
        _user: &Username,
        _config: &DeviceConfig,
    ) -> Option<bool> {
        Some(true)
    }
}

/// Records notification hooks for assertions.
#[derive(Default)]
pub struct RecordingHandler {
    pub events: Mutex<Vec<String>>,
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_identity_change(&self, user: &Username) {
        self.events.lock().push(format!("identity_change:{user}"));
    }

    async fn on_rekey(&self, user: &Username, device: &DeviceId) {
        self.events.lock().push(format!("rekey:{user}:{device}"));
    }
}

// ── Assembly helpers ─────────────────────────────────────────────────────────

pub fn fast_config() -> MessengerConfig {
    MessengerConfig {
        send_retry: RetryMode::RetryAfter { delay_secs: 1, max_attempts: Some(3) },
        receipt_retry: RetryMode::RetryAfter { delay_secs: 1, max_attempts: Some(3) },
        ..MessengerConfig::default()
    }
}

pub async fn master(
    server: &Arc<SpoofServer>,
    user: &str,
    device: &str,
    password: &str,
    handlers: HandlerChain,
) -> (CypherMessenger, Arc<SpoofTransport>, MemoryStore) {
    let store = MemoryStore::new();
    let transport = server.transport(user, device);
    let messenger = CypherMessenger::register_master(
        user,
        device,
        password,
        Arc::new(store.clone()),
        transport.clone(),
        fast_config(),
        handlers,
    )
    .await
    .expect("register master");
    (messenger, transport, store)
}

/// Let queued work and cross-messenger deliveries drain.
pub async fn settle(messengers: &[&CypherMessenger]) {
    for _ in 0..200 {
        for messenger in messengers {
            messenger.await_done_processing().await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let quiet = messengers.iter().all(|m| m.pending_jobs() == 0);
        if quiet {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if messengers.iter().all(|m| m.pending_jobs() == 0) {
                return;
            }
        }
    }
}
