//! The server-transport interface the SDK consumes.
//!
//! The core owns the transport; the transport only ever holds the event
//! sender it is given at connect time, never a reference back into the
//! messenger. Inbound traffic arrives as `ServerEvent`s over that channel
//! and is turned into queue work by the pipeline.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use ctk_proto::{
    DeviceConfig, DeviceId, Envelope, MultiRecipientEnvelope, UserConfig, Username,
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport is offline")]
    Offline,

    #[error("Operation not supported by this transport")]
    Unsupported,

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Authentication progress of the server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationState {
    Unauthenticated,
    Authenticated,
    Failure,
}

/// Traffic pushed by the server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Message(Envelope),
    MultiRecipientMessage(MultiRecipientEnvelope),
    /// A recipient's device confirmed delivery of `remote_id`.
    ReceivedReceipt { remote_id: String, by: Username },
    /// A recipient displayed `remote_id` to the user.
    DisplayedReceipt { remote_id: String, by: Username },
    /// A device asks to join `user`'s device list; only the master acts.
    DeviceRegistrationRequest { user: Username, config: DeviceConfig },
}

pub type EventSink = mpsc::Sender<ServerEvent>;

#[async_trait]
pub trait ServerTransport: Send + Sync {
    fn authentication_state(&self) -> AuthenticationState;

    /// Whether the server accepts multi-recipient envelopes.
    fn supports_multi_recipient(&self) -> bool {
        false
    }

    /// Attach and start delivering events into `sink`.
    async fn connect(&self, sink: EventSink) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn send_single(
        &self,
        envelope: Envelope,
        user: &Username,
        device: &DeviceId,
        message_id: &str,
    ) -> Result<(), TransportError>;

    async fn send_multi(
        &self,
        envelope: MultiRecipientEnvelope,
        message_id: &str,
    ) -> Result<(), TransportError>;

    async fn read_key_bundle(&self, user: &Username) -> Result<UserConfig, TransportError>;

    async fn publish_key_bundle(&self, config: UserConfig) -> Result<(), TransportError>;

    async fn request_device_registration(
        &self,
        user: &Username,
        config: DeviceConfig,
    ) -> Result<(), TransportError>;

    async fn publish_blob(&self, id: &str, blob: Vec<u8>) -> Result<(), TransportError>;

    async fn read_blob(&self, id: &str) -> Result<Option<Vec<u8>>, TransportError>;

    async fn send_received_receipt(
        &self,
        remote_id: &str,
        to: &Username,
    ) -> Result<(), TransportError>;

    async fn send_read_receipt(&self, remote_id: &str, to: &Username)
        -> Result<(), TransportError>;
}
