//! # Domain Traits
//!
//! Abstract interfaces for the runtime's external collaborators (transport, session storage,
//! localized resources). Implementations live in the Infrastructure layer.

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::errors::{ResourceError, StorageError, TransportError};
use crate::domain::model::ModelDefinition;
use crate::domain::session::Session;
use crate::domain::types::{ChatId, Markup, MessageId, Update};

/// Abstract interface for a chat transport (e.g., Telegram, Console)
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch pending updates with `update_id >= offset`, waiting up to `timeout`
    async fn poll_updates(
        &self,
        offset: u64,
        limit: usize,
        timeout: Duration,
    ) -> Result<Vec<Update>, TransportError>;

    /// Send a message, optionally as a reply. Returns the new message's id
    async fn send(
        &self,
        chat: ChatId,
        text: &str,
        markup: Option<&Markup>,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, TransportError>;

    /// Edit the text and/or markup of a previously sent message
    async fn edit(
        &self,
        chat: ChatId,
        message_id: MessageId,
        text: Option<&str>,
        markup: Option<&Markup>,
    ) -> Result<(), TransportError>;

    /// Acknowledge a button press
    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError>;
}

/// Durable per-conversation session storage. `commit` replaces the whole record atomically.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: ChatId) -> Result<Option<Session>, StorageError>;

    async fn commit(&self, id: ChatId, session: &Session) -> Result<(), StorageError>;
}

/// Localized strings and form models, keyed by locale tag.
/// Lookups signal `NotFound` instead of returning an empty default.
pub trait ResourceProvider: Send + Sync {
    fn get_string(&self, locale: &str, id: &str) -> Result<String, ResourceError>;

    fn get_string_array(&self, locale: &str, id: &str) -> Result<Vec<String>, ResourceError>;

    fn get_model(&self, locale: &str, id: &str) -> Result<ModelDefinition, ResourceError>;
}
