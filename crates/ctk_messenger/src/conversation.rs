//! Conversations and locally stored chat messages.
//!
//! Conversation kinds collapse into one tagged variant. `Internal` is the
//! user's own cross-device channel and carries sync plus protocol-internal
//! traffic; ids are derived so that every device of every participant
//! computes the same id without coordination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ctk_proto::{
    ConversationTarget, DeliveryState, DeviceId, GroupId, MessageType, Username,
};

/// Stable conversation id: BLAKE3 over a kind-tagged participant string.
pub fn conversation_id(local: &Username, target: &ConversationTarget) -> String {
    let key = match target {
        ConversationTarget::CurrentUser => format!("internal:{local}"),
        ConversationTarget::OtherUser(peer) => {
            let (a, b) = if local <= peer { (local, peer) } else { (peer, local) };
            format!("private:{a}:{b}")
        }
        ConversationTarget::Group(group) => format!("group:{group}"),
    };
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationKind {
    Internal,
    Private { peer: Username },
    Group { group: GroupId, members: Vec<Username> },
}

/// Persisted conversation state (encrypted at rest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    /// Next outbound `order`; monotone within this conversation.
    pub next_order: u64,
}

impl Conversation {
    pub fn new(local: &Username, target: &ConversationTarget, kind: ConversationKind) -> Self {
        Self {
            id: conversation_id(local, target),
            kind,
            next_order: 0,
        }
    }

    /// Every user with devices participating in this conversation, the local
    /// user included (their other devices receive sync copies).
    pub fn members(&self, local: &Username) -> Vec<Username> {
        match &self.kind {
            ConversationKind::Internal => vec![local.clone()],
            ConversationKind::Private { peer } => vec![local.clone(), peer.clone()],
            ConversationKind::Group { members, .. } => {
                let mut all = members.clone();
                if !all.contains(local) {
                    all.push(local.clone());
                }
                all
            }
        }
    }

    pub fn target(&self, local: &Username) -> ConversationTarget {
        match &self.kind {
            ConversationKind::Internal => ConversationTarget::CurrentUser,
            ConversationKind::Private { peer } => {
                if peer == local {
                    ConversationTarget::CurrentUser
                } else {
                    ConversationTarget::OtherUser(peer.clone())
                }
            }
            ConversationKind::Group { group, .. } => ConversationTarget::Group(*group),
        }
    }
}

/// Group membership shared out of band as a blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(rename = "g")]
    pub group: GroupId,
    #[serde(rename = "a")]
    pub admin: Username,
    #[serde(rename = "m")]
    pub members: Vec<Username>,
}

/// A known peer and the identity key last observed for them. A mismatch on
/// refresh is the identity-change signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub username: Username,
    pub identity: ctk_crypto::PublicSigningKey,
}

/// A locally stored chat message (encrypted at rest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    /// Sender-chosen id; `(sender, remote_id)` dedups deliveries.
    pub remote_id: String,
    pub conversation_id: String,
    pub sender: Username,
    pub sender_device: DeviceId,
    pub order: u64,
    pub message_type: MessageType,
    pub subtype: Option<String>,
    pub text: String,
    pub metadata: Vec<u8>,
    pub delivery: DeliveryState,
    pub sent_at: DateTime<Utc>,
    pub received_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_conversation_id_is_symmetric() {
        let alice = Username::new("Alice");
        let bob = Username::new("bob");
        let from_alice =
            conversation_id(&alice, &ConversationTarget::OtherUser(bob.clone()));
        let from_bob = conversation_id(&bob, &ConversationTarget::OtherUser(alice));
        assert_eq!(from_alice, from_bob);
    }

    #[test]
    fn internal_ids_differ_per_user() {
        let a = conversation_id(&Username::new("m0"), &ConversationTarget::CurrentUser);
        let b = conversation_id(&Username::new("m1"), &ConversationTarget::CurrentUser);
        assert_ne!(a, b);
    }

    #[test]
    fn members_include_local_user() {
        let alice = Username::new("alice");
        let conversation = Conversation::new(
            &alice,
            &ConversationTarget::OtherUser(Username::new("bob")),
            ConversationKind::Private { peer: Username::new("bob") },
        );
        let members = conversation.members(&alice);
        assert!(members.contains(&alice));
        assert!(members.contains(&Username::new("bob")));
    }
}
