//! Peer-to-peer transport abstraction.
//!
//! A P2P connection can substitute for the server on a per-device basis:
//! once a client is connected to a peer device, sends to that device try the
//! client first and fall back to the server path. Connection negotiation
//! rides in-band as reserved magic messages `_/p2p/0/<transport_id>/…`.
//!
//! Factories and clients never see the messenger's internals. They receive a
//! `P2PHandle`, which can enqueue negotiation packets and attach a finished
//! client, nothing more.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::debug;

use ctk_proto::{DeviceId, Username, MAGIC_P2P_PREFIX};

use crate::error::MessengerError;
use crate::messenger::{CypherMessenger, MessengerInner};
use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P2PConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

#[async_trait]
pub trait P2PTransportClient: Send + Sync {
    fn state(&self) -> P2PConnectionState;

    /// Ship envelope bytes to the peer device.
    async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait P2PTransportFactory: Send + Sync {
    /// Identifier appearing in negotiation subtypes.
    fn transport_id(&self) -> &str;

    /// Start a connection to the handle's peer. `Ok(None)` means the
    /// connection completes later through `P2PHandle::attach`.
    async fn create_connection(
        &self,
        handle: P2PHandle,
    ) -> Result<Option<Arc<dyn P2PTransportClient>>, TransportError>;

    /// An in-band negotiation packet for this transport arrived.
    async fn receive_message(
        &self,
        text: &str,
        metadata: &[u8],
        handle: P2PHandle,
    ) -> Result<(), TransportError>;
}

/// Capability handed to factories: enqueue negotiation traffic and attach a
/// connected client for one peer device.
#[derive(Clone)]
pub struct P2PHandle {
    pub(crate) peer_user: Username,
    pub(crate) peer_device: DeviceId,
    pub(crate) transport_id: String,
    pub(crate) inner: Weak<MessengerInner>,
}

impl P2PHandle {
    pub fn peer_user(&self) -> &Username {
        &self.peer_user
    }

    pub fn peer_device(&self) -> &DeviceId {
        &self.peer_device
    }

    /// Enqueue a negotiation magic message
    /// (`_/p2p/0/<transport_id>/<suffix>`) to the peer device.
    pub async fn send_negotiation(
        &self,
        suffix: &str,
        metadata: Vec<u8>,
    ) -> Result<(), MessengerError> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| MessengerError::NotFound("messenger shut down".into()))?;
        let subtype = format!("{}{}/{}", MAGIC_P2P_PREFIX, self.transport_id, suffix);
        CypherMessenger::from_inner(inner)
            .queue_magic_to_device(&self.peer_user, &self.peer_device, &subtype, metadata)
            .await
    }

    /// Register a connected client for the peer device.
    pub async fn attach(&self, client: Arc<dyn P2PTransportClient>) -> Result<(), MessengerError> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| MessengerError::NotFound("messenger shut down".into()))?;
        inner
            .p2p
            .insert(self.peer_user.clone(), self.peer_device.clone(), client);
        inner
            .handlers
            .on_p2p_connection_open(&self.peer_user, &self.peer_device)
            .await;
        Ok(())
    }
}

/// Registered factories plus established clients keyed by peer device.
#[derive(Default)]
pub(crate) struct P2PRegistry {
    factories: Vec<Arc<dyn P2PTransportFactory>>,
    clients: parking_lot::Mutex<HashMap<(Username, DeviceId), Arc<dyn P2PTransportClient>>>,
}

impl P2PRegistry {
    pub fn new(factories: Vec<Arc<dyn P2PTransportFactory>>) -> Self {
        Self { factories, clients: parking_lot::Mutex::new(HashMap::new()) }
    }

    pub fn factory(&self, transport_id: &str) -> Option<Arc<dyn P2PTransportFactory>> {
        self.factories
            .iter()
            .find(|f| f.transport_id() == transport_id)
            .cloned()
    }

    /// The connected client for a device, if any. Clients in any other state
    /// are dropped from the map.
    pub fn connected_client(
        &self,
        user: &Username,
        device: &DeviceId,
    ) -> Option<Arc<dyn P2PTransportClient>> {
        let key = (user.clone(), device.clone());
        let mut clients = self.clients.lock();
        match clients.get(&key) {
            Some(client) if client.state() == P2PConnectionState::Connected => {
                Some(client.clone())
            }
            Some(_) => {
                debug!(user = %user, device = %device, "dropping stale p2p client");
                clients.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn insert(
        &self,
        user: Username,
        device: DeviceId,
        client: Arc<dyn P2PTransportClient>,
    ) {
        self.clients.lock().insert((user, device), client);
    }

    pub fn remove(&self, user: &Username, device: &DeviceId) {
        self.clients.lock().remove(&(user.clone(), device.clone()));
    }
}

/// Split a p2p magic subtype into `(transport_id, rest)`.
pub(crate) fn parse_negotiation_subtype(subtype: &str) -> Option<(&str, &str)> {
    let rest = subtype.strip_prefix(MAGIC_P2P_PREFIX)?;
    let (transport_id, suffix) = rest.split_once('/')?;
    Some((transport_id, suffix))
}
