//! ctk_store — persistent-store interface and at-rest encryption
//!
//! # Encryption strategy
//! Storage backends are untrusted with content. Every row carries a small set
//! of queryable keys (ids, ordering, the dedup pair) plus one opaque `blob`
//! column holding XChaCha20-Poly1305 ciphertext sealed by `StoreKey`. The
//! key is derived from the application password when the local device config
//! is unlocked; the password itself is never persisted.
//!
//! The `MessengerStore` trait is the boundary a deployment implements over
//! its database of choice; `MemoryStore` is the reference implementation the
//! test fixtures use.

pub mod error;
pub mod memory;
pub mod models;
pub mod traits;
pub mod vault;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use models::{
    ChatMessageQuery, ChatMessageRow, ContactRow, ConversationRow, DeviceIdentityRow, JobRow,
    SortOrder,
};
pub use traits::MessengerStore;
pub use vault::StoreKey;
