//! The persistent-store interface the SDK consumes.
//!
//! Backends persist rows; they never see plaintext. The SDK encrypts each
//! blob with the store key before it crosses this boundary and decrypts on
//! the way back.

use async_trait::async_trait;
use uuid::Uuid;

use ctk_proto::{DeviceId, Username};

use crate::error::StoreError;
use crate::models::{
    ChatMessageQuery, ChatMessageRow, ContactRow, ConversationRow, DeviceIdentityRow, JobRow,
};

#[async_trait]
pub trait MessengerStore: Send + Sync {
    // ── Local device config ──────────────────────────────────────────────

    async fn read_local_device_config(&self) -> Result<Option<Vec<u8>>, StoreError>;
    async fn write_local_device_config(&self, blob: Vec<u8>) -> Result<(), StoreError>;

    /// The per-installation salt, stored in cleartext.
    async fn read_local_device_salt(&self) -> Result<Option<Vec<u8>>, StoreError>;
    async fn write_local_device_salt(&self, salt: Vec<u8>) -> Result<(), StoreError>;

    // ── Contacts ─────────────────────────────────────────────────────────

    async fn list_contacts(&self) -> Result<Vec<ContactRow>, StoreError>;
    async fn upsert_contact(&self, row: ContactRow) -> Result<(), StoreError>;
    async fn remove_contact(&self, username: &Username) -> Result<(), StoreError>;

    // ── Conversations ────────────────────────────────────────────────────

    async fn list_conversations(&self) -> Result<Vec<ConversationRow>, StoreError>;
    async fn read_conversation(&self, id: &str) -> Result<Option<ConversationRow>, StoreError>;
    async fn upsert_conversation(&self, row: ConversationRow) -> Result<(), StoreError>;
    async fn remove_conversation(&self, id: &str) -> Result<(), StoreError>;

    // ── Device identities ────────────────────────────────────────────────

    async fn list_device_identities(
        &self,
        user: &Username,
    ) -> Result<Vec<DeviceIdentityRow>, StoreError>;
    async fn upsert_device_identity(&self, row: DeviceIdentityRow) -> Result<(), StoreError>;
    async fn remove_device_identity(
        &self,
        user: &Username,
        device: &DeviceId,
    ) -> Result<(), StoreError>;

    // ── Chat messages ────────────────────────────────────────────────────

    async fn create_chat_message(&self, row: ChatMessageRow) -> Result<(), StoreError>;
    async fn read_chat_message(&self, id: Uuid) -> Result<ChatMessageRow, StoreError>;
    async fn update_chat_message(&self, row: ChatMessageRow) -> Result<(), StoreError>;
    async fn remove_chat_message(&self, id: Uuid) -> Result<(), StoreError>;
    /// Dedup lookup by `(sender, remote_id)`.
    async fn find_chat_message(
        &self,
        sender: &Username,
        remote_id: &str,
    ) -> Result<Option<ChatMessageRow>, StoreError>;
    async fn list_chat_messages(
        &self,
        query: ChatMessageQuery,
    ) -> Result<Vec<ChatMessageRow>, StoreError>;

    // ── Jobs ─────────────────────────────────────────────────────────────

    async fn create_job(&self, row: JobRow) -> Result<(), StoreError>;
    async fn update_job(&self, row: JobRow) -> Result<(), StoreError>;
    async fn remove_job(&self, id: Uuid) -> Result<(), StoreError>;
    async fn list_jobs(&self) -> Result<Vec<JobRow>, StoreError>;
}
