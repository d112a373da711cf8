//! Plaintext message model (inside the encrypted envelope).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::Username;

/// Reserved subtype announcing a torn-down session; carries no user payload
/// and forces the peer's next outbound write to re-initialize as sender.
pub const MAGIC_REKEY: &str = "_/ratchet/rekey";
/// Reserved subtype a fresh device sends through the user's own conversation.
pub const MAGIC_DEVICE_ANNOUNCE: &str = "_/devices/announce";
/// Prefix of in-band P2P negotiation packets: `_/p2p/0/<transport_id>/…`
pub const MAGIC_P2P_PREFIX: &str = "_/p2p/0/";

/// Group identifier, allocated by the group's creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub Uuid);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a message is addressed. `CurrentUser` targets the sender's own
/// devices and carries cross-device sync and protocol-internal traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationTarget {
    #[serde(rename = "s")]
    CurrentUser,
    #[serde(rename = "u")]
    OtherUser(Username),
    #[serde(rename = "g")]
    Group(GroupId),
}

/// Magic messages signal protocol internals and are not normally saved or
/// shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Magic,
}

/// The decrypted content of one chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "v")]
    pub version: u8,
    /// Sender-chosen id; the dedup key at the recipient is
    /// `(sender, remote_id)`.
    #[serde(rename = "id")]
    pub remote_id: String,
    #[serde(rename = "k")]
    pub message_type: MessageType,
    /// Set for magic messages (`MAGIC_*` constants above).
    #[serde(rename = "s")]
    pub subtype: Option<String>,
    #[serde(rename = "x")]
    pub text: String,
    /// Application-opaque bytes riding along with the message.
    #[serde(rename = "m", with = "serde_bytes")]
    pub metadata: Vec<u8>,
    #[serde(rename = "t")]
    pub target: ConversationTarget,
    /// Sender-side monotone order within the conversation; re-establishes
    /// ordering at the recipient independent of delivery interleaving.
    #[serde(rename = "o")]
    pub order: u64,
    #[serde(rename = "a")]
    pub sent_at: DateTime<Utc>,
}

impl MessagePayload {
    pub const VERSION: u8 = 1;

    pub fn text(remote_id: String, text: String, target: ConversationTarget, order: u64) -> Self {
        Self {
            version: Self::VERSION,
            remote_id,
            message_type: MessageType::Text,
            subtype: None,
            text,
            metadata: Vec::new(),
            target,
            order,
            sent_at: Utc::now(),
        }
    }

    pub fn magic(remote_id: String, subtype: &str, metadata: Vec<u8>, target: ConversationTarget) -> Self {
        Self {
            version: Self::VERSION,
            remote_id,
            message_type: MessageType::Magic,
            subtype: Some(subtype.to_string()),
            text: String::new(),
            metadata,
            target,
            order: 0,
            sent_at: Utc::now(),
        }
    }

    pub fn is_magic(&self, subtype: &str) -> bool {
        self.message_type == MessageType::Magic && self.subtype.as_deref() == Some(subtype)
    }
}

/// Delivery progress of a locally saved message.
///
/// Transitions are monotone along `None → Delivered → Received → Read`;
/// `Undelivered` is a sink reachable only from `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    #[default]
    None,
    Undelivered,
    Delivered,
    Received,
    Read,
}

impl DeliveryState {
    fn rank(self) -> u8 {
        match self {
            DeliveryState::None => 0,
            DeliveryState::Undelivered => 0,
            DeliveryState::Delivered => 1,
            DeliveryState::Received => 2,
            DeliveryState::Read => 3,
        }
    }

    /// Whether a transition to `next` is allowed.
    pub fn can_progress_to(self, next: DeliveryState) -> bool {
        match next {
            DeliveryState::None => false,
            DeliveryState::Undelivered => self == DeliveryState::None,
            _ => next.rank() > self.rank(),
        }
    }

    /// Apply a transition, keeping the current state when the transition
    /// would regress.
    pub fn progress_to(self, next: DeliveryState) -> DeliveryState {
        if self.can_progress_to(next) {
            next
        } else {
            self
        }
    }
}
