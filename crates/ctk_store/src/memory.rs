//! Reference in-memory store.
//!
//! Backs the integration-test fixtures and small deployments. Behaviour
//! matches what a SQL backend is expected to do, including duplicate and
//! not-found errors, so pipeline code exercised against it transfers.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use ctk_proto::{DeviceId, Username};

use crate::error::StoreError;
use crate::models::{
    ChatMessageQuery, ChatMessageRow, ContactRow, ConversationRow, DeviceIdentityRow, JobRow,
    SortOrder,
};
use crate::traits::MessengerStore;

#[derive(Default)]
struct Inner {
    device_config: Option<Vec<u8>>,
    device_salt: Option<Vec<u8>>,
    contacts: HashMap<Username, ContactRow>,
    conversations: HashMap<String, ConversationRow>,
    identities: HashMap<(Username, DeviceId), DeviceIdentityRow>,
    messages: HashMap<Uuid, ChatMessageRow>,
    jobs: Vec<JobRow>,
}

/// In-memory `MessengerStore`. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: std::sync::Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessengerStore for MemoryStore {
    async fn read_local_device_config(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.read().device_config.clone())
    }

    async fn write_local_device_config(&self, blob: Vec<u8>) -> Result<(), StoreError> {
        self.inner.write().device_config = Some(blob);
        Ok(())
    }

    async fn read_local_device_salt(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.read().device_salt.clone())
    }

    async fn write_local_device_salt(&self, salt: Vec<u8>) -> Result<(), StoreError> {
        self.inner.write().device_salt = Some(salt);
        Ok(())
    }

    async fn list_contacts(&self) -> Result<Vec<ContactRow>, StoreError> {
        Ok(self.inner.read().contacts.values().cloned().collect())
    }

    async fn upsert_contact(&self, row: ContactRow) -> Result<(), StoreError> {
        self.inner.write().contacts.insert(row.username.clone(), row);
        Ok(())
    }

    async fn remove_contact(&self, username: &Username) -> Result<(), StoreError> {
        self.inner.write().contacts.remove(username);
        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationRow>, StoreError> {
        Ok(self.inner.read().conversations.values().cloned().collect())
    }

    async fn read_conversation(&self, id: &str) -> Result<Option<ConversationRow>, StoreError> {
        Ok(self.inner.read().conversations.get(id).cloned())
    }

    async fn upsert_conversation(&self, row: ConversationRow) -> Result<(), StoreError> {
        self.inner.write().conversations.insert(row.id.clone(), row);
        Ok(())
    }

    async fn remove_conversation(&self, id: &str) -> Result<(), StoreError> {
        self.inner.write().conversations.remove(id);
        Ok(())
    }

    async fn list_device_identities(
        &self,
        user: &Username,
    ) -> Result<Vec<DeviceIdentityRow>, StoreError> {
        Ok(self
            .inner
            .read()
            .identities
            .values()
            .filter(|row| &row.user == user)
            .cloned()
            .collect())
    }

    async fn upsert_device_identity(&self, row: DeviceIdentityRow) -> Result<(), StoreError> {
        self.inner
            .write()
            .identities
            .insert((row.user.clone(), row.device.clone()), row);
        Ok(())
    }

    async fn remove_device_identity(
        &self,
        user: &Username,
        device: &DeviceId,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .identities
            .remove(&(user.clone(), device.clone()));
        Ok(())
    }

    async fn create_chat_message(&self, row: ChatMessageRow) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.messages.contains_key(&row.id) {
            return Err(StoreError::Duplicate(format!("chat message {}", row.id)));
        }
        inner.messages.insert(row.id, row);
        Ok(())
    }

    async fn read_chat_message(&self, id: Uuid) -> Result<ChatMessageRow, StoreError> {
        self.inner
            .read()
            .messages
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("chat message {id}")))
    }

    async fn update_chat_message(&self, row: ChatMessageRow) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.messages.contains_key(&row.id) {
            return Err(StoreError::NotFound(format!("chat message {}", row.id)));
        }
        inner.messages.insert(row.id, row);
        Ok(())
    }

    async fn remove_chat_message(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.write().messages.remove(&id);
        Ok(())
    }

    async fn find_chat_message(
        &self,
        sender: &Username,
        remote_id: &str,
    ) -> Result<Option<ChatMessageRow>, StoreError> {
        Ok(self
            .inner
            .read()
            .messages
            .values()
            .find(|row| &row.sender == sender && row.remote_id == remote_id)
            .cloned())
    }

    async fn list_chat_messages(
        &self,
        query: ChatMessageQuery,
    ) -> Result<Vec<ChatMessageRow>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<ChatMessageRow> = inner
            .messages
            .values()
            .filter(|row| row.conversation_id == query.conversation_id)
            .filter(|row| query.sender.as_ref().map_or(true, |s| &row.sender == s))
            .filter(|row| query.min_order.map_or(true, |min| row.order >= min))
            .filter(|row| query.max_order.map_or(true, |max| row.order <= max))
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.order);
        if query.sort == SortOrder::Descending {
            rows.reverse();
        }
        Ok(rows
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn create_job(&self, row: JobRow) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.jobs.iter().any(|j| j.id == row.id) {
            return Err(StoreError::Duplicate(format!("job {}", row.id)));
        }
        inner.jobs.push(row);
        Ok(())
    }

    async fn update_job(&self, row: JobRow) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        match inner.jobs.iter_mut().find(|j| j.id == row.id) {
            Some(slot) => {
                *slot = row;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("job {}", row.id))),
        }
    }

    async fn remove_job(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.write().jobs.retain(|j| j.id != id);
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<JobRow>, StoreError> {
        Ok(self.inner.read().jobs.clone())
    }
}
