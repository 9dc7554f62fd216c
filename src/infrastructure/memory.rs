//! # In-Memory Adapters
//!
//! `MemorySessionStore` keeps serialized session blobs in a map, so it behaves like the
//! persistent stores (every load deserializes a fresh copy). `MemoryTransport` is a scripted,
//! recording transport used to drive the pipeline without a network.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use crate::domain::errors::{StorageError, TransportError};
use crate::domain::session::Session;
use crate::domain::traits::{SessionStore, Transport};
use crate::domain::types::{ChatId, Markup, MessageId, Update};

#[derive(Default)]
pub struct MemorySessionStore {
    blobs: Mutex<HashMap<ChatId, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: ChatId) -> Result<Option<Session>, StorageError> {
        let blob = self
            .blobs
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .get(&id)
            .cloned();
        blob.map(|b| serde_json::from_str(&b).map_err(StorageError::from))
            .transpose()
    }

    async fn commit(&self, id: ChatId, session: &Session) -> Result<(), StorageError> {
        let blob = serde_json::to_string(session)?;
        self.blobs
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .insert(id, blob);
        Ok(())
    }
}

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Send {
        chat: ChatId,
        text: String,
        markup: Option<Markup>,
        reply_to: Option<MessageId>,
    },
    Edit {
        chat: ChatId,
        message_id: MessageId,
        text: Option<String>,
        markup: Option<Markup>,
    },
    Answer {
        callback_id: String,
    },
}

#[derive(Default)]
pub struct MemoryTransport {
    inbox: Mutex<VecDeque<Update>>,
    outgoing: Mutex<Vec<Outgoing>>,
    next_message_id: AtomicI64,
    fail_sends: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            next_message_id: AtomicI64::new(1000),
            ..Self::default()
        }
    }

    pub fn push_update(&self, update: Update) {
        if let Ok(mut inbox) = self.inbox.lock() {
            inbox.push_back(update);
        }
    }

    /// Makes every `send` fail until reset.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn outgoing(&self) -> Vec<Outgoing> {
        self.outgoing.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// Texts of sends and edits, in call order.
    pub fn texts(&self) -> Vec<String> {
        self.outgoing()
            .into_iter()
            .filter_map(|o| match o {
                Outgoing::Send { text, .. } => Some(text),
                Outgoing::Edit { text, .. } => text,
                Outgoing::Answer { .. } => None,
            })
            .collect()
    }

    /// Markup of the most recent send that carried one.
    pub fn last_markup(&self) -> Option<Markup> {
        self.outgoing().into_iter().rev().find_map(|o| match o {
            Outgoing::Send { markup, .. } => markup,
            _ => None,
        })
    }

    pub fn clear(&self) {
        if let Ok(mut outgoing) = self.outgoing.lock() {
            outgoing.clear();
        }
    }

    fn record(&self, call: Outgoing) {
        if let Ok(mut outgoing) = self.outgoing.lock() {
            outgoing.push(call);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn poll_updates(
        &self,
        offset: u64,
        limit: usize,
        _timeout: Duration,
    ) -> Result<Vec<Update>, TransportError> {
        let mut inbox = self
            .inbox
            .lock()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        inbox.retain(|u| u.update_id >= offset);
        Ok(inbox.iter().take(limit.max(1)).cloned().collect())
    }

    async fn send(
        &self,
        chat: ChatId,
        text: &str,
        markup: Option<&Markup>,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Request("send rejected".to_string()));
        }
        self.record(Outgoing::Send {
            chat,
            text: text.to_string(),
            markup: markup.cloned(),
            reply_to,
        });
        Ok(MessageId(self.next_message_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn edit(
        &self,
        chat: ChatId,
        message_id: MessageId,
        text: Option<&str>,
        markup: Option<&Markup>,
    ) -> Result<(), TransportError> {
        self.record(Outgoing::Edit {
            chat,
            message_id,
            text: text.map(str::to_string),
            markup: markup.cloned(),
        });
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError> {
        self.record(Outgoing::Answer {
            callback_id: callback_id.to_string(),
        });
        Ok(())
    }
}
