//! The messenger: pipeline glue over sessions, queue, transports and store.
//!
//! Ownership is a one-way arrow. The messenger owns the transport, the
//! queue, and the session store; the queue worker, the event loop and P2P
//! handles hold only `Weak` references back, so dropping the last
//! `CypherMessenger` shuts everything down.
//!
//! Outbound flow: allocate order → consult handlers → seal one envelope per
//! recipient device through the device's ratchet → persist a job → the
//! scheduler ships it (P2P first when established, server otherwise).
//! Inbound is the mirror image and ends at the event handlers.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use rand::RngCore;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use ctk_crypto::{kdf, RatchetConfig, SigningKeyPair};
use ctk_proto::{
    codec, ConversationTarget, DeliveryState, DeviceConfig, DeviceId, Envelope, GroupId,
    MessagePayload, MessageType, MultiRecipientEnvelope, PerDeviceKey, UserConfig, Username,
    MAGIC_DEVICE_ANNOUNCE, MAGIC_REKEY, PAYLOAD_KEY_LEN,
};
use ctk_store::{
    ChatMessageQuery, ChatMessageRow, ContactRow, ConversationRow, MessengerStore, StoreKey,
};

use crate::config::{
    self, open_local_config, seal_local_config, seal_with_key, DeviceKeys, LocalDeviceConfig,
};
use crate::conversation::{
    conversation_id, ChatMessage, Contact, Conversation, ConversationKind, GroupConfig,
};
use crate::devices::DeviceSessions;
use crate::error::MessengerError;
use crate::handler::{HandlerChain, SaveAction, SendAction};
use crate::p2p::{self, P2PHandle, P2PRegistry, P2PTransportFactory};
use crate::queue::{
    JobQueue, ReceiptKind, RetryMode, SendMessageTask, SendMultiRecipientTask, SendReceiptTask,
    StoredTask,
};
use crate::transport::{AuthenticationState, ServerEvent, ServerTransport};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTRATION_POLL: Duration = Duration::from_millis(50);

/// Tunables. The defaults match production behaviour; tests shrink the
/// retry delay.
pub struct MessengerConfig {
    pub ratchet: RatchetConfig,
    /// Retry policy stamped onto send tasks at enqueue time.
    pub send_retry: RetryMode,
    pub receipt_retry: RetryMode,
    /// Give up on P2P establishment after this long and use the server.
    pub p2p_deadline: Duration,
    pub p2p_factories: Vec<Arc<dyn P2PTransportFactory>>,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            ratchet: RatchetConfig::default(),
            send_retry: RetryMode::RetryAfter { delay_secs: 30, max_attempts: Some(3) },
            receipt_retry: RetryMode::RetryAfter { delay_secs: 30, max_attempts: Some(3) },
            p2p_deadline: Duration::from_secs(30),
            p2p_factories: Vec::new(),
        }
    }
}

pub(crate) struct MessengerInner {
    config: MessengerConfig,
    local: parking_lot::RwLock<LocalDeviceConfig>,
    config_key: Zeroizing<[u8; 32]>,
    store: Arc<dyn MessengerStore>,
    store_key: StoreKey,
    sessions: DeviceSessions,
    queue: Arc<JobQueue>,
    transport: Arc<dyn ServerTransport>,
    pub(crate) p2p: P2PRegistry,
    pub(crate) handlers: HandlerChain,
}

/// One messenger per local device. Cheap to clone.
#[derive(Clone)]
pub struct CypherMessenger {
    inner: Arc<MessengerInner>,
}

impl CypherMessenger {
    pub(crate) fn from_inner(inner: Arc<MessengerInner>) -> Self {
        Self { inner }
    }

    // ── Construction ─────────────────────────────────────────────────────

    /// First-run registration of a user's master device. Generates the
    /// identity key, publishes the initial device list and persists the
    /// encrypted local config.
    pub async fn register_master(
        username: &str,
        device_id: &str,
        password: &str,
        store: Arc<dyn MessengerStore>,
        transport: Arc<dyn ServerTransport>,
        config: MessengerConfig,
        handlers: HandlerChain,
    ) -> Result<Self, MessengerError> {
        let username = Username::new(username);
        let device_id = DeviceId::new(device_id);
        if store.read_local_device_config().await?.is_some() {
            return Err(MessengerError::BadInput(
                "device already registered; unlock instead".into(),
            ));
        }

        let salt = config::load_or_create_salt(store.as_ref()).await?;
        let identity = SigningKeyPair::generate();
        let device_keys = DeviceKeys::generate(device_id);
        let user_config =
            UserConfig::new(&identity, vec![device_keys.to_device_config(true)])?;

        let local = LocalDeviceConfig {
            username: username.clone(),
            identity_public: identity.public(),
            identity: Some(identity),
            device_keys,
            is_master: true,
            user_config: user_config.clone(),
        };
        store
            .write_local_device_config(seal_local_config(password, &salt, &local)?)
            .await?;

        let messenger =
            Self::assemble(local, password, &salt, store, transport, config, handlers).await?;
        messenger.inner.transport.publish_key_bundle(user_config).await?;
        info!(user = %username, "master device registered");
        Ok(messenger)
    }

    /// Registration of an additional (non-master) device: generate keys,
    /// send the registration request and wait until the master publishes a
    /// device list containing us.
    pub async fn register_device(
        username: &str,
        device_id: &str,
        password: &str,
        store: Arc<dyn MessengerStore>,
        transport: Arc<dyn ServerTransport>,
        config: MessengerConfig,
        handlers: HandlerChain,
    ) -> Result<Self, MessengerError> {
        let username = Username::new(username);
        let device_id = DeviceId::new(device_id);
        if store.read_local_device_config().await?.is_some() {
            return Err(MessengerError::BadInput(
                "device already registered; unlock instead".into(),
            ));
        }

        let salt = config::load_or_create_salt(store.as_ref()).await?;
        let published = transport.read_key_bundle(&username).await?;
        published.verify()?;

        let device_keys = DeviceKeys::generate(device_id.clone());
        let local = LocalDeviceConfig {
            username: username.clone(),
            identity_public: published.identity(),
            identity: None,
            device_keys: device_keys.clone(),
            is_master: false,
            user_config: published,
        };
        store
            .write_local_device_config(seal_local_config(password, &salt, &local)?)
            .await?;

        let messenger =
            Self::assemble(local, password, &salt, store, transport, config, handlers).await?;
        messenger
            .inner
            .transport
            .request_device_registration(&username, device_keys.to_device_config(false))
            .await?;
        messenger.await_device_acceptance(&username, &device_id).await?;
        messenger.announce_new_device().await?;
        info!(user = %username, device = %device_id, "device registered");
        Ok(messenger)
    }

    /// Bring an existing installation back up with its password.
    pub async fn unlock(
        password: &str,
        store: Arc<dyn MessengerStore>,
        transport: Arc<dyn ServerTransport>,
        config: MessengerConfig,
        handlers: HandlerChain,
    ) -> Result<Self, MessengerError> {
        let salt = store
            .read_local_device_salt()
            .await?
            .ok_or(MessengerError::CorruptConfig)?;
        let blob = store
            .read_local_device_config()
            .await?
            .ok_or_else(|| MessengerError::NotFound("no local device config".into()))?;
        let local = open_local_config(password, &salt, &blob)?;
        let messenger =
            Self::assemble(local, password, &salt, store, transport, config, handlers).await?;
        info!(user = %messenger.username(), "messenger unlocked");
        Ok(messenger)
    }

    async fn assemble(
        local: LocalDeviceConfig,
        password: &str,
        salt: &[u8],
        store: Arc<dyn MessengerStore>,
        transport: Arc<dyn ServerTransport>,
        config: MessengerConfig,
        handlers: HandlerChain,
    ) -> Result<Self, MessengerError> {
        let config_key = kdf::device_config_key(password, salt)?;
        let store_key = StoreKey::new(*kdf::store_row_key(password, salt)?);

        let sessions = DeviceSessions::new(
            store.clone(),
            store_key.clone(),
            local.username.clone(),
            local.device_keys.device_id.clone(),
            local.device_keys.agreement.clone(),
            config.ratchet.clone(),
        );
        let queue = Arc::new(JobQueue::new(store.clone(), store_key.clone()));
        let p2p = P2PRegistry::new(config.p2p_factories.clone());

        let inner = Arc::new(MessengerInner {
            config,
            local: parking_lot::RwLock::new(local),
            config_key,
            store,
            store_key,
            sessions,
            queue,
            transport,
            p2p,
            handlers,
        });

        // Hand the transport its event sender; it never gets more than that.
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        inner.transport.connect(event_tx).await?;
        Self::spawn_event_loop(Arc::downgrade(&inner), event_rx);

        inner.queue.load_persisted().await?;
        inner.queue.resume(Arc::downgrade(&inner));

        Ok(Self { inner })
    }

    fn spawn_event_loop(
        weak: Weak<MessengerInner>,
        mut events: mpsc::Receiver<ServerEvent>,
    ) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                let messenger = CypherMessenger::from_inner(inner);
                if let Err(error) = messenger.handle_server_event(event).await {
                    warn!(%error, "server event handling failed");
                }
            }
        });
    }

    // ── Identity accessors ───────────────────────────────────────────────

    pub fn username(&self) -> Username {
        self.inner.local.read().username.clone()
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.local.read().device_keys.device_id.clone()
    }

    pub fn is_master(&self) -> bool {
        self.inner.local.read().is_master
    }

    fn signing_keys(&self) -> SigningKeyPair {
        self.inner.local.read().device_keys.signing.clone()
    }

    // ── Queue control ────────────────────────────────────────────────────

    pub fn pause_queue(&self) {
        self.inner.queue.pause();
    }

    pub fn resume_queue(&self) {
        self.inner.queue.resume(Arc::downgrade(&self.inner));
    }

    /// Resolves when no runnable job remains.
    pub async fn await_done_processing(&self) {
        self.inner.queue.await_done_processing().await;
    }

    pub fn pending_jobs(&self) -> usize {
        self.inner.queue.pending_jobs()
    }

    // ── Conversations & messages ─────────────────────────────────────────

    /// Create (or return) the private conversation with `peer`.
    pub async fn create_private_chat(&self, peer: &str) -> Result<String, MessengerError> {
        let peer = Username::new(peer);
        if peer == self.username() {
            return Err(MessengerError::BadInput(
                "use the internal conversation for your own devices".into(),
            ));
        }
        let conversation = self
            .get_or_create_conversation(&ConversationTarget::OtherUser(peer))
            .await?;
        Ok(conversation.id)
    }

    /// Create a group, publish its membership blob, and open the local
    /// conversation.
    pub async fn create_group_chat(
        &self,
        members: Vec<&str>,
    ) -> Result<GroupId, MessengerError> {
        let group = GroupId(Uuid::new_v4());
        let mut all: Vec<Username> = members.into_iter().map(Username::new).collect();
        let local = self.username();
        if !all.contains(&local) {
            all.push(local.clone());
        }
        let group_config = GroupConfig { group, admin: local, members: all };
        self.inner
            .transport
            .publish_blob(&group_blob_id(group), codec::to_wire(&group_config)?)
            .await?;
        self.get_or_create_conversation(&ConversationTarget::Group(group))
            .await?;
        Ok(group)
    }

    /// The conversation id a private chat with `peer` uses.
    pub fn private_conversation_id(&self, peer: &str) -> String {
        conversation_id(
            &self.username(),
            &ConversationTarget::OtherUser(Username::new(peer)),
        )
    }

    pub async fn list_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ChatMessage>, MessengerError> {
        let rows = self
            .inner
            .store
            .list_chat_messages(ChatMessageQuery::conversation(conversation_id))
            .await?;
        rows.iter()
            .map(|row| Ok(self.inner.store_key.open_value(&row.blob)?))
            .collect()
    }

    pub async fn get_message(&self, id: Uuid) -> Result<ChatMessage, MessengerError> {
        let row = self.inner.store.read_chat_message(id).await?;
        Ok(self.inner.store_key.open_value(&row.blob)?)
    }

    /// Mark an inbound message read and notify its sender.
    pub async fn mark_read(&self, id: Uuid) -> Result<(), MessengerError> {
        let message = self.get_message(id).await?;
        if message.sender == self.username() {
            return Ok(());
        }
        self.inner
            .queue
            .queue_task(StoredTask::SendReceipt(SendReceiptTask {
                kind: ReceiptKind::Read,
                remote_id: message.remote_id,
                to: message.sender,
                retry: self.inner.config.receipt_retry,
            }))
            .await?;
        Ok(())
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Send a text message into a conversation. Returns the sender-chosen
    /// remote id shared by every copy of the message.
    pub async fn send_message(
        &self,
        target: ConversationTarget,
        text: &str,
    ) -> Result<String, MessengerError> {
        let mut conversation = self.get_or_create_conversation(&target).await?;
        let order = conversation.next_order;
        conversation.next_order += 1;
        self.save_conversation(&conversation).await?;

        let remote_id = Uuid::new_v4().to_string();
        let payload = MessagePayload::text(remote_id.clone(), text.to_string(), target.clone(), order);

        let action = self
            .inner
            .handlers
            .should_send_message(&payload, &target)
            .await;
        let local_message_id = if action == SendAction::SaveAndSend {
            let message = self
                .save_outbound_message(&conversation, &payload)
                .await?;
            Some(message.id)
        } else {
            None
        };

        self.enqueue_outbound(&conversation, &payload, local_message_id)
            .await?;
        Ok(remote_id)
    }

    /// Fan the payload out: one multi-recipient envelope when the server
    /// supports it and we are online, one envelope per device otherwise.
    async fn enqueue_outbound(
        &self,
        conversation: &Conversation,
        payload: &MessagePayload,
        local_message_id: Option<Uuid>,
    ) -> Result<(), MessengerError> {
        let local_user = self.username();
        let mut targets: Vec<(Username, DeviceId)> = Vec::new();
        for member in conversation.members(&local_user) {
            targets.extend(self.send_targets(&member).await?);
        }
        if targets.is_empty() {
            debug!(conversation = %conversation.id, "no recipient devices; nothing to send");
            return Ok(());
        }

        let padded = codec::pad_to_bucket(&codec::to_wire(payload)?);
        let online = self.inner.transport.authentication_state()
            == AuthenticationState::Authenticated;

        if self.inner.transport.supports_multi_recipient() && online {
            self.enqueue_multi_recipient(payload, &padded, targets, local_message_id)
                .await
        } else {
            for (user, device) in targets {
                self.enqueue_single(&user, &device, payload, &padded, local_message_id)
                    .await?;
            }
            Ok(())
        }
    }

    async fn enqueue_single(
        &self,
        user: &Username,
        device: &DeviceId,
        payload: &MessagePayload,
        padded: &[u8],
        local_message_id: Option<Uuid>,
    ) -> Result<(), MessengerError> {
        let (message, rekey) = self
            .inner
            .sessions
            .write_with_ratchet(user, device, |ratchet| Ok(ratchet.encrypt(padded)?))
            .await?;
        let envelope = Envelope::seal(
            payload.remote_id.clone(),
            self.username(),
            self.device_id(),
            &message,
            &self.signing_keys(),
            rekey,
        )?;
        self.inner
            .queue
            .queue_task(StoredTask::SendMessage(SendMessageTask {
                envelope,
                recipient: user.clone(),
                recipient_device: device.clone(),
                local_message_id,
                retry: self.inner.config.send_retry,
            }))
            .await?;
        Ok(())
    }

    async fn enqueue_multi_recipient(
        &self,
        payload: &MessagePayload,
        padded: &[u8],
        targets: Vec<(Username, DeviceId)>,
        local_message_id: Option<Uuid>,
    ) -> Result<(), MessengerError> {
        let mut payload_key = Zeroizing::new([0u8; PAYLOAD_KEY_LEN]);
        rand::rngs::OsRng.fill_bytes(payload_key.as_mut());

        let mut keys = Vec::with_capacity(targets.len());
        for (user, device) in targets {
            let (message, rekey) = self
                .inner
                .sessions
                .write_with_ratchet(&user, &device, |ratchet| {
                    Ok(ratchet.encrypt(payload_key.as_ref())?)
                })
                .await?;
            let envelope = Envelope::seal(
                payload.remote_id.clone(),
                self.username(),
                self.device_id(),
                &message,
                &self.signing_keys(),
                rekey,
            )?;
            keys.push(PerDeviceKey { user, device, envelope });
        }

        let envelope = MultiRecipientEnvelope::seal(
            payload.remote_id.clone(),
            self.username(),
            self.device_id(),
            &payload_key,
            padded,
            &self.signing_keys(),
            keys,
        )?;
        self.inner
            .queue
            .queue_task(StoredTask::SendMultiRecipient(SendMultiRecipientTask {
                envelope,
                local_message_id,
                retry: self.inner.config.send_retry,
            }))
            .await?;
        Ok(())
    }

    /// Seal and queue a magic message to one device.
    pub(crate) async fn queue_magic_to_device(
        &self,
        user: &Username,
        device: &DeviceId,
        subtype: &str,
        metadata: Vec<u8>,
    ) -> Result<(), MessengerError> {
        let target = if user == &self.username() {
            ConversationTarget::CurrentUser
        } else {
            ConversationTarget::OtherUser(user.clone())
        };
        let payload =
            MessagePayload::magic(Uuid::new_v4().to_string(), subtype, metadata, target);
        let padded = codec::pad_to_bucket(&codec::to_wire(&payload)?);
        self.enqueue_single(user, device, &payload, &padded, None).await
    }

    /// Devices a message to `user` must reach, excluding this device.
    async fn send_targets(
        &self,
        user: &Username,
    ) -> Result<Vec<(Username, DeviceId)>, MessengerError> {
        if user == &self.username() {
            let entries = self.inner.local.read().user_config.clone();
            let mut targets = Vec::new();
            for device_config in entries.devices()? {
                if device_config.device_id == self.device_id() {
                    continue;
                }
                self.inner
                    .sessions
                    .insert_from_config(user, &device_config)
                    .await?;
                targets.push((user.clone(), device_config.device_id));
            }
            return Ok(targets);
        }

        let mut handles = self.inner.sessions.all_for_user(user).await?;
        if handles.is_empty() {
            handles = self.refresh_user_devices(user).await?;
        }
        let mut targets = Vec::with_capacity(handles.len());
        for handle in handles {
            let identity = handle.lock().await;
            targets.push((identity.user.clone(), identity.device.clone()));
        }
        Ok(targets)
    }

    // ── Device list refresh & identity change ────────────────────────────

    /// Fetch a user's published config, reconcile it with stored identities
    /// and surface identity changes.
    pub async fn refresh_user_devices(
        &self,
        user: &Username,
    ) -> Result<Vec<crate::devices::DeviceHandle>, MessengerError> {
        let published = self.inner.transport.read_key_bundle(user).await?;
        published.verify()?;

        let stored = self.read_contact(user).await?;
        let identity_changed = stored
            .as_ref()
            .is_some_and(|contact| contact.identity != published.identity());

        let outcome = self.inner.sessions.refresh_user(user, &published).await?;
        if identity_changed {
            // A new identity key invalidates every session with the user,
            // including devices no longer present in the published list.
            for handle in self.inner.sessions.all_for_user(user).await? {
                let (device_user, device_id) = {
                    let identity = handle.lock().await;
                    (identity.user.clone(), identity.device.clone())
                };
                self.inner.sessions.clear_ratchet(&device_user, &device_id).await?;
            }
        }

        if identity_changed || outcome.identity_changed {
            warn!(user = %user, "peer identity changed");
            self.inner.handlers.on_identity_change(user).await;
        }

        self.write_contact(&Contact { username: user.clone(), identity: published.identity() })
            .await?;
        if stored.is_none() {
            self.inner.handlers.on_contact_changed(user).await;
        }
        Ok(outcome.devices)
    }

    async fn read_contact(&self, user: &Username) -> Result<Option<Contact>, MessengerError> {
        let rows = self.inner.store.list_contacts().await?;
        for row in rows {
            if &row.username == user {
                return Ok(Some(self.inner.store_key.open_value(&row.blob)?));
            }
        }
        Ok(None)
    }

    async fn write_contact(&self, contact: &Contact) -> Result<(), MessengerError> {
        let row = ContactRow {
            username: contact.username.clone(),
            blob: self.inner.store_key.seal_value(contact)?,
        };
        self.inner.store.upsert_contact(row).await?;
        Ok(())
    }

    // ── P2P ──────────────────────────────────────────────────────────────

    /// Try to establish a P2P connection to one peer device. Returns whether
    /// a client is connected right now; `false` with `Ok` means establishment
    /// continues in the background.
    pub async fn establish_p2p(
        &self,
        user: &Username,
        device: &DeviceId,
        transport_id: &str,
    ) -> Result<bool, MessengerError> {
        let factory = self
            .inner
            .p2p
            .factory(transport_id)
            .ok_or_else(|| MessengerError::NotFound(format!("p2p transport {transport_id}")))?;
        let handle = P2PHandle {
            peer_user: user.clone(),
            peer_device: device.clone(),
            transport_id: transport_id.to_string(),
            inner: Arc::downgrade(&self.inner),
        };
        let created = tokio::time::timeout(
            self.inner.config.p2p_deadline,
            factory.create_connection(handle),
        )
        .await
        .map_err(|_| MessengerError::Transport(crate::transport::TransportError::Timeout(
            "p2p establishment".into(),
        )))??;

        match created {
            Some(client) => {
                self.inner.p2p.insert(user.clone(), device.clone(), client);
                self.inner.handlers.on_p2p_connection_open(user, device).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Abandon the session with one peer device. The next outbound write
    /// re-initializes as sender with the rekey flag set.
    pub async fn reset_session(
        &self,
        user: &Username,
        device: &DeviceId,
    ) -> Result<(), MessengerError> {
        info!(user = %user, device = %device, "session reset requested");
        self.inner.sessions.clear_ratchet(user, device).await
    }

    /// Feed envelope bytes received over a P2P link into the pipeline.
    pub async fn handle_p2p_payload(&self, bytes: &[u8]) -> Result<(), MessengerError> {
        let envelope: Envelope = codec::from_wire(bytes)?;
        self.inner
            .queue
            .queue_task(StoredTask::ReceiveMessage(crate::queue::ReceiveMessageTask {
                envelope,
            }))
            .await?;
        Ok(())
    }

    pub async fn disconnect_p2p(
        &self,
        user: &Username,
        device: &DeviceId,
    ) -> Result<(), MessengerError> {
        if let Some(client) = self.inner.p2p.connected_client(user, device) {
            client.disconnect().await?;
        }
        self.inner.p2p.remove(user, device);
        self.inner.handlers.on_p2p_connection_close(user, device).await;
        Ok(())
    }

    // ── Task execution (called from the queue worker) ────────────────────

    pub(crate) fn connectivity_for(&self, task: &StoredTask) -> bool {
        let authenticated =
            self.inner.transport.authentication_state() == AuthenticationState::Authenticated;
        match task {
            StoredTask::SendMessage(send) => {
                authenticated
                    || self
                        .inner
                        .p2p
                        .connected_client(&send.recipient, &send.recipient_device)
                        .is_some()
            }
            _ => authenticated,
        }
    }

    async fn execute_send(&self, task: &SendMessageTask) -> Result<(), MessengerError> {
        // Prefer an established P2P link; fall back to the server.
        if let Some(client) = self
            .inner
            .p2p
            .connected_client(&task.recipient, &task.recipient_device)
        {
            match client.send(codec::to_wire(&task.envelope)?).await {
                Ok(()) => {
                    self.mark_delivery(task.local_message_id, DeliveryState::Delivered)
                        .await?;
                    return Ok(());
                }
                Err(error) => {
                    debug!(%error, "p2p send failed; falling back to server");
                }
            }
        }

        self.inner
            .transport
            .send_single(
                task.envelope.clone(),
                &task.recipient,
                &task.recipient_device,
                &task.envelope.message_id,
            )
            .await?;
        self.mark_delivery(task.local_message_id, DeliveryState::Delivered)
            .await?;
        Ok(())
    }

    async fn execute_send_multi(
        &self,
        task: &SendMultiRecipientTask,
    ) -> Result<(), MessengerError> {
        if !self.inner.transport.supports_multi_recipient() {
            return Err(MessengerError::Unsupported);
        }
        self.inner
            .transport
            .send_multi(task.envelope.clone(), &task.envelope.message_id)
            .await?;
        self.mark_delivery(task.local_message_id, DeliveryState::Delivered)
            .await?;
        Ok(())
    }

    async fn execute_send_receipt(&self, task: &SendReceiptTask) -> Result<(), MessengerError> {
        match task.kind {
            ReceiptKind::Received => {
                self.inner
                    .transport
                    .send_received_receipt(&task.remote_id, &task.to)
                    .await?
            }
            ReceiptKind::Read => {
                self.inner
                    .transport
                    .send_read_receipt(&task.remote_id, &task.to)
                    .await?
            }
        }
        Ok(())
    }

    async fn execute_receive(&self, envelope: &Envelope) -> Result<(), MessengerError> {
        if self.is_duplicate(&envelope.sender, &envelope.message_id).await? {
            debug!(sender = %envelope.sender, id = %envelope.message_id, "duplicate envelope dropped");
            return Ok(());
        }
        self.ensure_known_device(&envelope.sender, &envelope.sender_device)
            .await?;

        let plaintext = match self.inner.sessions.read_with_ratchet(envelope).await {
            Ok(plaintext) => plaintext,
            Err(error @ MessengerError::SessionDesync { .. }) => {
                if let MessengerError::SessionDesync { ref user, ref device, .. } = error {
                    self.announce_rekey(user, device).await?;
                }
                return Err(error);
            }
            Err(error) => return Err(error),
        };

        if envelope.rekey {
            self.inner
                .handlers
                .on_rekey(&envelope.sender, &envelope.sender_device)
                .await;
        }

        let payload: MessagePayload = codec::from_wire(&codec::unpad(&plaintext)?)?;
        self.route_inbound(envelope, payload).await
    }

    async fn execute_receive_multi(
        &self,
        envelope: &MultiRecipientEnvelope,
    ) -> Result<(), MessengerError> {
        if self.is_duplicate(&envelope.sender, &envelope.message_id).await? {
            debug!(sender = %envelope.sender, id = %envelope.message_id, "duplicate envelope dropped");
            return Ok(());
        }
        self.ensure_known_device(&envelope.sender, &envelope.sender_device)
            .await?;

        // Outer signature over the sealed payload.
        let handle = self
            .inner
            .sessions
            .get(&envelope.sender, &envelope.sender_device)
            .await?
            .ok_or_else(|| {
                MessengerError::NotFound(format!(
                    "device {}:{}",
                    envelope.sender, envelope.sender_device
                ))
            })?;
        {
            let identity = handle.lock().await;
            envelope.verify(&identity.signing)?;
        }

        let wrapping = envelope.key_for(&self.username(), &self.device_id())?;
        let key_bytes = match self.inner.sessions.read_with_ratchet(&wrapping.envelope).await {
            Ok(bytes) => bytes,
            Err(error @ MessengerError::SessionDesync { .. }) => {
                if let MessengerError::SessionDesync { ref user, ref device, .. } = error {
                    self.announce_rekey(user, device).await?;
                }
                return Err(error);
            }
            Err(error) => return Err(error),
        };
        if wrapping.envelope.rekey {
            self.inner
                .handlers
                .on_rekey(&envelope.sender, &envelope.sender_device)
                .await;
        }
        let payload_key: [u8; PAYLOAD_KEY_LEN] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| MessengerError::BadInput("wrapped payload key length".into()))?;

        let padded = envelope.open_payload(&payload_key)?;
        let payload: MessagePayload = codec::from_wire(&codec::unpad(&padded)?)?;

        let single_view = wrapping.envelope.clone();
        self.route_inbound(&single_view, payload).await
    }

    /// Shared inbound tail: magic routing, save decision, persistence and
    /// the received receipt.
    async fn route_inbound(
        &self,
        envelope: &Envelope,
        payload: MessagePayload,
    ) -> Result<(), MessengerError> {
        if payload.message_type == MessageType::Magic {
            return self.handle_magic(envelope, &payload).await;
        }

        let action = self
            .inner
            .handlers
            .should_save_message(&payload, &envelope.sender)
            .await;
        if action == SaveAction::Ignore {
            debug!(sender = %envelope.sender, "inbound message ignored by handler");
            return Ok(());
        }

        let mut conversation = self
            .conversation_for_inbound(&payload.target, &envelope.sender)
            .await?;
        if payload.order >= conversation.next_order {
            conversation.next_order = payload.order + 1;
            self.save_conversation(&conversation).await?;
        }

        let message = ChatMessage {
            id: Uuid::new_v4(),
            remote_id: payload.remote_id.clone(),
            conversation_id: conversation.id.clone(),
            sender: envelope.sender.clone(),
            sender_device: envelope.sender_device.clone(),
            order: payload.order,
            message_type: payload.message_type,
            subtype: payload.subtype.clone(),
            text: payload.text.clone(),
            metadata: payload.metadata.clone(),
            delivery: DeliveryState::None,
            sent_at: payload.sent_at,
            received_at: Some(Utc::now()),
        };
        self.save_chat_message(&message).await?;
        self.inner.handlers.on_message_saved(&message).await;

        if envelope.sender != self.username() {
            self.inner
                .queue
                .queue_task(StoredTask::SendReceipt(SendReceiptTask {
                    kind: ReceiptKind::Received,
                    remote_id: payload.remote_id,
                    to: envelope.sender.clone(),
                    retry: self.inner.config.receipt_retry,
                }))
                .await?;
        }
        Ok(())
    }

    async fn handle_magic(
        &self,
        envelope: &Envelope,
        payload: &MessagePayload,
    ) -> Result<(), MessengerError> {
        let subtype = payload.subtype.as_deref().unwrap_or_default();
        if payload.is_magic(MAGIC_REKEY) {
            info!(user = %envelope.sender, device = %envelope.sender_device, "rekey announcement");
            self.inner
                .sessions
                .clear_ratchet(&envelope.sender, &envelope.sender_device)
                .await?;
            self.inner
                .handlers
                .on_rekey(&envelope.sender, &envelope.sender_device)
                .await;
        } else if payload.is_magic(MAGIC_DEVICE_ANNOUNCE) {
            debug!(user = %envelope.sender, "device announcement; refreshing device list");
            self.refresh_own_config().await?;
            self.refresh_user_devices(&envelope.sender).await.ok();
        } else if let Some((transport_id, _suffix)) = p2p::parse_negotiation_subtype(subtype) {
            if let Some(factory) = self.inner.p2p.factory(transport_id) {
                let handle = P2PHandle {
                    peer_user: envelope.sender.clone(),
                    peer_device: envelope.sender_device.clone(),
                    transport_id: transport_id.to_string(),
                    inner: Arc::downgrade(&self.inner),
                };
                factory
                    .receive_message(&payload.text, &payload.metadata, handle)
                    .await?;
            } else {
                debug!(transport = transport_id, "negotiation for unknown p2p transport");
            }
        } else {
            debug!(subtype, "unknown magic subtype ignored");
        }
        Ok(())
    }

    // ── Server events ────────────────────────────────────────────────────

    async fn handle_server_event(&self, event: ServerEvent) -> Result<(), MessengerError> {
        match event {
            ServerEvent::Message(envelope) => {
                self.inner
                    .queue
                    .queue_task(StoredTask::ReceiveMessage(crate::queue::ReceiveMessageTask {
                        envelope,
                    }))
                    .await?;
            }
            ServerEvent::MultiRecipientMessage(envelope) => {
                self.inner
                    .queue
                    .queue_task(StoredTask::ReceiveMultiRecipient(
                        crate::queue::ReceiveMultiRecipientTask { envelope },
                    ))
                    .await?;
            }
            ServerEvent::ReceivedReceipt { remote_id, by } => {
                self.apply_receipt(&remote_id, &by, DeliveryState::Received).await?;
            }
            ServerEvent::DisplayedReceipt { remote_id, by } => {
                self.apply_receipt(&remote_id, &by, DeliveryState::Read).await?;
            }
            ServerEvent::DeviceRegistrationRequest { user, config } => {
                self.handle_registration_request(user, config).await?;
            }
        }
        Ok(())
    }

    async fn apply_receipt(
        &self,
        remote_id: &str,
        by: &Username,
        state: DeliveryState,
    ) -> Result<(), MessengerError> {
        let Some(row) = self
            .inner
            .store
            .find_chat_message(&self.username(), remote_id)
            .await?
        else {
            debug!(remote_id, by = %by, "receipt for unknown message");
            return Ok(());
        };
        let mut message: ChatMessage = self.inner.store_key.open_value(&row.blob)?;
        let next = message.delivery.progress_to(state);
        if next != message.delivery {
            message.delivery = next;
            self.update_chat_message(&message).await?;
            self.inner.handlers.on_message_updated(&message).await;
        }
        Ok(())
    }

    /// Master-side half of the device-registration protocol.
    async fn handle_registration_request(
        &self,
        user: Username,
        device_config: DeviceConfig,
    ) -> Result<(), MessengerError> {
        if !self.is_master() || user != self.username() {
            debug!(user = %user, "ignoring registration request not addressed to this master");
            return Ok(());
        }
        let accepted = self
            .inner
            .handlers
            .on_device_registration_request(&user, &device_config)
            .await;
        if !accepted {
            info!(device = %device_config.device_id, "device registration rejected");
            return Ok(());
        }

        let updated = {
            let mut local = self.inner.local.write();
            let identity = local
                .identity
                .as_ref()
                .ok_or(MessengerError::NotMasterDevice)?
                .clone();
            local.user_config.add_device(&identity, device_config.clone())?;
            local.user_config.clone()
        };
        self.persist_local_config().await?;
        self.inner.transport.publish_key_bundle(updated).await?;
        self.inner
            .sessions
            .insert_from_config(&user, &device_config)
            .await?;
        info!(device = %device_config.device_id, "device registration accepted");
        Ok(())
    }

    // ── Registration helpers ─────────────────────────────────────────────

    async fn await_device_acceptance(
        &self,
        username: &Username,
        device_id: &DeviceId,
    ) -> Result<(), MessengerError> {
        let deadline = tokio::time::Instant::now() + REGISTRATION_TIMEOUT;
        loop {
            if let Ok(published) = self.inner.transport.read_key_bundle(username).await {
                if published.verify().is_ok() && published.device(device_id).is_ok() {
                    {
                        let mut local = self.inner.local.write();
                        local.user_config = published;
                    }
                    self.persist_local_config().await?;
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MessengerError::Transport(
                    crate::transport::TransportError::Timeout("device registration".into()),
                ));
            }
            tokio::time::sleep(REGISTRATION_POLL).await;
        }
    }

    /// Tell our other devices (through the internal conversation) that this
    /// device exists.
    async fn announce_new_device(&self) -> Result<(), MessengerError> {
        let user = self.username();
        for (target_user, device) in self.send_targets(&user).await? {
            self.queue_magic_to_device(&target_user, &device, MAGIC_DEVICE_ANNOUNCE, Vec::new())
                .await?;
        }
        Ok(())
    }

    /// Pull our own published config (new sibling devices appear this way).
    async fn refresh_own_config(&self) -> Result<(), MessengerError> {
        let user = self.username();
        let published = self.inner.transport.read_key_bundle(&user).await?;
        published.verify()?;
        if published.identity() != self.inner.local.read().identity_public {
            warn!("own published identity key differs from local config");
            return Err(MessengerError::CorruptConfig);
        }
        {
            let mut local = self.inner.local.write();
            local.user_config = published;
        }
        self.persist_local_config().await
    }

    async fn persist_local_config(&self) -> Result<(), MessengerError> {
        let blob = {
            let local = self.inner.local.read();
            seal_with_key(&self.inner.config_key, &local)?
        };
        self.inner.store.write_local_device_config(blob).await?;
        Ok(())
    }

    // ── Inbound helpers ──────────────────────────────────────────────────

    async fn is_duplicate(
        &self,
        sender: &Username,
        message_id: &str,
    ) -> Result<bool, MessengerError> {
        Ok(self
            .inner
            .store
            .find_chat_message(sender, message_id)
            .await?
            .is_some())
    }

    async fn ensure_known_device(
        &self,
        user: &Username,
        device: &DeviceId,
    ) -> Result<(), MessengerError> {
        if self.inner.sessions.get(user, device).await?.is_some() {
            return Ok(());
        }
        if user == &self.username() {
            self.refresh_own_config().await?;
            let entries = self.inner.local.read().user_config.clone();
            for device_config in entries.devices()? {
                if &device_config.device_id == device {
                    self.inner.sessions.insert_from_config(user, &device_config).await?;
                    return Ok(());
                }
            }
        } else {
            self.refresh_user_devices(user).await?;
            if self.inner.sessions.get(user, device).await?.is_some() {
                return Ok(());
            }
        }
        Err(MessengerError::NotFound(format!("device {user}:{device}")))
    }

    async fn conversation_for_inbound(
        &self,
        target: &ConversationTarget,
        sender: &Username,
    ) -> Result<Conversation, MessengerError> {
        let local = self.username();
        let resolved = match target {
            ConversationTarget::CurrentUser => {
                if sender == &local {
                    ConversationTarget::CurrentUser
                } else {
                    ConversationTarget::OtherUser(sender.clone())
                }
            }
            ConversationTarget::OtherUser(user) => {
                if user == &local {
                    ConversationTarget::OtherUser(sender.clone())
                } else {
                    // A sync copy from one of our own devices.
                    ConversationTarget::OtherUser(user.clone())
                }
            }
            ConversationTarget::Group(group) => ConversationTarget::Group(*group),
        };
        self.get_or_create_conversation(&resolved).await
    }

    async fn announce_rekey(
        &self,
        user: &Username,
        device: &DeviceId,
    ) -> Result<(), MessengerError> {
        info!(user = %user, device = %device, "queueing rekey announcement");
        self.queue_magic_to_device(user, device, MAGIC_REKEY, Vec::new())
            .await
    }

    // ── Conversation & message persistence ───────────────────────────────

    async fn get_or_create_conversation(
        &self,
        target: &ConversationTarget,
    ) -> Result<Conversation, MessengerError> {
        let local = self.username();
        let id = conversation_id(&local, target);
        if let Some(row) = self.inner.store.read_conversation(&id).await? {
            return Ok(self.inner.store_key.open_value(&row.blob)?);
        }

        let kind = match target {
            ConversationTarget::CurrentUser => ConversationKind::Internal,
            ConversationTarget::OtherUser(peer) => {
                ConversationKind::Private { peer: peer.clone() }
            }
            ConversationTarget::Group(group) => {
                let members = self.read_group_members(*group).await?;
                ConversationKind::Group { group: *group, members }
            }
        };
        let conversation = Conversation::new(&local, target, kind);
        self.save_conversation(&conversation).await?;
        self.inner.handlers.on_conversation_changed(&conversation.id).await;
        Ok(conversation)
    }

    async fn read_group_members(&self, group: GroupId) -> Result<Vec<Username>, MessengerError> {
        match self.inner.transport.read_blob(&group_blob_id(group)).await? {
            Some(blob) => {
                let config: GroupConfig = codec::from_wire(&blob)?;
                Ok(config.members)
            }
            None => Err(MessengerError::NotFound(format!("group {group}"))),
        }
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), MessengerError> {
        let row = ConversationRow {
            id: conversation.id.clone(),
            blob: self.inner.store_key.seal_value(conversation)?,
        };
        self.inner.store.upsert_conversation(row).await?;
        Ok(())
    }

    async fn save_outbound_message(
        &self,
        conversation: &Conversation,
        payload: &MessagePayload,
    ) -> Result<ChatMessage, MessengerError> {
        let message = ChatMessage {
            id: Uuid::new_v4(),
            remote_id: payload.remote_id.clone(),
            conversation_id: conversation.id.clone(),
            sender: self.username(),
            sender_device: self.device_id(),
            order: payload.order,
            message_type: payload.message_type,
            subtype: payload.subtype.clone(),
            text: payload.text.clone(),
            metadata: payload.metadata.clone(),
            delivery: DeliveryState::None,
            sent_at: payload.sent_at,
            received_at: None,
        };
        self.save_chat_message(&message).await?;
        self.inner.handlers.on_message_saved(&message).await;
        Ok(message)
    }

    async fn save_chat_message(&self, message: &ChatMessage) -> Result<(), MessengerError> {
        let row = ChatMessageRow {
            id: message.id,
            conversation_id: message.conversation_id.clone(),
            sender: message.sender.clone(),
            remote_id: message.remote_id.clone(),
            order: message.order,
            blob: self.inner.store_key.seal_value(message)?,
        };
        self.inner.store.create_chat_message(row).await?;
        Ok(())
    }

    async fn update_chat_message(&self, message: &ChatMessage) -> Result<(), MessengerError> {
        let row = ChatMessageRow {
            id: message.id,
            conversation_id: message.conversation_id.clone(),
            sender: message.sender.clone(),
            remote_id: message.remote_id.clone(),
            order: message.order,
            blob: self.inner.store_key.seal_value(message)?,
        };
        self.inner.store.update_chat_message(row).await?;
        Ok(())
    }

    async fn mark_delivery(
        &self,
        local_message_id: Option<Uuid>,
        state: DeliveryState,
    ) -> Result<(), MessengerError> {
        let Some(id) = local_message_id else { return Ok(()) };
        let mut message = match self.get_message(id).await {
            Ok(message) => message,
            Err(MessengerError::Store(ctk_store::StoreError::NotFound(_))) => return Ok(()),
            Err(error) => return Err(error),
        };
        let next = message.delivery.progress_to(state);
        if next != message.delivery {
            message.delivery = next;
            self.update_chat_message(&message).await?;
            self.inner.handlers.on_message_updated(&message).await;
        }
        Ok(())
    }

    pub(crate) async fn mark_undelivered(&self, local_message_id: Uuid) {
        if let Err(error) = self
            .mark_delivery(Some(local_message_id), DeliveryState::Undelivered)
            .await
        {
            warn!(%error, "failed to mark message undelivered");
        }
    }
}

// ── Task dispatch ────────────────────────────────────────────────────────────

impl StoredTask {
    pub(crate) async fn execute(
        &self,
        messenger: &CypherMessenger,
    ) -> Result<(), MessengerError> {
        match self {
            StoredTask::SendMessage(task) => messenger.execute_send(task).await,
            StoredTask::SendMultiRecipient(task) => messenger.execute_send_multi(task).await,
            StoredTask::ReceiveMessage(task) => messenger.execute_receive(&task.envelope).await,
            StoredTask::ReceiveMultiRecipient(task) => {
                messenger.execute_receive_multi(&task.envelope).await
            }
            StoredTask::SendReceipt(task) => messenger.execute_send_receipt(task).await,
        }
    }

    /// Called on every failure before the retry decision; send tasks mark
    /// their local message undelivered (a later success upgrades it).
    pub(crate) async fn on_delayed(&self, messenger: &CypherMessenger) {
        let local_message_id = match self {
            StoredTask::SendMessage(task) => task.local_message_id,
            StoredTask::SendMultiRecipient(task) => task.local_message_id,
            _ => None,
        };
        if let Some(id) = local_message_id {
            messenger.mark_undelivered(id).await;
        }
    }
}

fn group_blob_id(group: GroupId) -> String {
    format!("group/{group}")
}
