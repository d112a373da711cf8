//! Application event hooks.
//!
//! Handlers are queried in registration order; the first one returning a
//! non-`None` answer wins and the remainder are not consulted. Pure
//! notification hooks fan out to every handler.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use ctk_proto::{ConversationTarget, DeviceConfig, DeviceId, MessagePayload, Username};

use crate::conversation::ChatMessage;

/// Decision for an inbound message about to be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveAction {
    Save,
    Ignore,
}

/// Decision for an outbound message about to be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAction {
    /// Ship it without keeping a local copy.
    Send,
    /// Keep a local copy, then ship it.
    SaveAndSend,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// `None` defers to the next handler; the chain default is `Save`.
    async fn should_save_message(
        &self,
        _payload: &MessagePayload,
        _sender: &Username,
    ) -> Option<SaveAction> {
        None
    }

    /// `None` defers to the next handler; the chain default is `SaveAndSend`.
    async fn should_send_message(
        &self,
        _payload: &MessagePayload,
        _target: &ConversationTarget,
    ) -> Option<SendAction> {
        None
    }

    /// `None` defers; the chain default rejects the registration.
    async fn on_device_registration_request(
        &self,
        _user: &Username,
        _config: &DeviceConfig,
    ) -> Option<bool> {
        None
    }

    async fn on_rekey(&self, _user: &Username, _device: &DeviceId) {}

    async fn on_identity_change(&self, _user: &Username) {}

    async fn on_message_saved(&self, _message: &ChatMessage) {}

    async fn on_message_updated(&self, _message: &ChatMessage) {}

    async fn on_message_removed(&self, _id: Uuid) {}

    async fn on_contact_changed(&self, _user: &Username) {}

    async fn on_conversation_changed(&self, _id: &str) {}

    async fn on_p2p_connection_open(&self, _user: &Username, _device: &DeviceId) {}

    async fn on_p2p_connection_close(&self, _user: &Username, _device: &DeviceId) {}
}

/// Ordered handler composition.
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn push(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub async fn should_save_message(
        &self,
        payload: &MessagePayload,
        sender: &Username,
    ) -> SaveAction {
        for handler in &self.handlers {
            if let Some(action) = handler.should_save_message(payload, sender).await {
                return action;
            }
        }
        SaveAction::Save
    }

    pub async fn should_send_message(
        &self,
        payload: &MessagePayload,
        target: &ConversationTarget,
    ) -> SendAction {
        for handler in &self.handlers {
            if let Some(action) = handler.should_send_message(payload, target).await {
                return action;
            }
        }
        SendAction::SaveAndSend
    }

    pub async fn on_device_registration_request(
        &self,
        user: &Username,
        config: &DeviceConfig,
    ) -> bool {
        for handler in &self.handlers {
            if let Some(decision) = handler.on_device_registration_request(user, config).await {
                return decision;
            }
        }
        false
    }

    pub async fn on_rekey(&self, user: &Username, device: &DeviceId) {
        for handler in &self.handlers {
            handler.on_rekey(user, device).await;
        }
    }

    pub async fn on_identity_change(&self, user: &Username) {
        for handler in &self.handlers {
            handler.on_identity_change(user).await;
        }
    }

    pub async fn on_message_saved(&self, message: &ChatMessage) {
        for handler in &self.handlers {
            handler.on_message_saved(message).await;
        }
    }

    pub async fn on_message_updated(&self, message: &ChatMessage) {
        for handler in &self.handlers {
            handler.on_message_updated(message).await;
        }
    }

    pub async fn on_contact_changed(&self, user: &Username) {
        for handler in &self.handlers {
            handler.on_contact_changed(user).await;
        }
    }

    pub async fn on_conversation_changed(&self, id: &str) {
        for handler in &self.handlers {
            handler.on_conversation_changed(id).await;
        }
    }

    pub async fn on_p2p_connection_open(&self, user: &Username, device: &DeviceId) {
        for handler in &self.handlers {
            handler.on_p2p_connection_open(user, device).await;
        }
    }

    pub async fn on_p2p_connection_close(&self, user: &Username, device: &DeviceId) {
        for handler in &self.handlers {
            handler.on_p2p_connection_close(user, device).await;
        }
    }
}
