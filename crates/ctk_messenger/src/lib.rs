//! ctk_messenger — per-device sessions, durable job queue and the pipeline
//!
//! One `CypherMessenger` per local device. The messenger owns its
//! collaborators; external services (persistent store, server transport,
//! P2P drivers, event handlers) are consumed through traits and never hold
//! references back into the core.
//!
//! # Module layout
//! - `messenger`    — assembly and the send/receive pipeline
//! - `devices`      — one ratchet per peer device, rekey protocol
//! - `queue`        — durable at-least-once job scheduling
//! - `config`       — encrypted local device identity
//! - `conversation` — conversation kinds, chat messages, contacts
//! - `transport`    — consumed server-transport interface
//! - `p2p`          — per-device peer-to-peer substitution
//! - `handler`      — application hook surface
//! - `error`        — unified error type

pub mod config;
pub mod conversation;
pub mod devices;
pub mod error;
pub mod handler;
pub mod messenger;
pub mod p2p;
pub mod queue;
pub mod transport;

pub use config::{DeviceKeys, LocalDeviceConfig};
pub use conversation::{
    conversation_id, ChatMessage, Contact, Conversation, ConversationKind, GroupConfig,
};
pub use devices::{DeviceHandle, DeviceIdentity};
pub use error::MessengerError;
pub use handler::{EventHandler, HandlerChain, SaveAction, SendAction};
pub use messenger::{CypherMessenger, MessengerConfig};
pub use p2p::{P2PConnectionState, P2PHandle, P2PTransportClient, P2PTransportFactory};
pub use queue::{ReceiptKind, RetryMode, StoredTask, TaskPriority};
pub use transport::{AuthenticationState, EventSink, ServerEvent, ServerTransport, TransportError};
