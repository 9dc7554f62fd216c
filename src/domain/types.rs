//! # Domain Types
//!
//! Identifiers, inbound updates and reply markup shared by every layer.
//! Transport adapters translate their wire formats into these types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Conversation identifier. Doubles as the DI scope id and the session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChatId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What actually arrived: a typed message or a button press.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message {
        text: String,
        message_id: MessageId,
        timestamp: DateTime<Utc>,
    },
    Callback {
        callback_id: String,
        data: String,
        origin_message_id: MessageId,
    },
}

/// A single inbound update, tagged with a stable (user, chat) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub update_id: u64,
    pub user: UserId,
    pub chat: ChatId,
    pub event: InboundEvent,
}

impl Update {
    pub fn message(update_id: u64, user: UserId, chat: ChatId, text: impl Into<String>) -> Self {
        Self {
            update_id,
            user,
            chat,
            event: InboundEvent::Message {
                text: text.into(),
                message_id: MessageId(update_id as i64),
                timestamp: Utc::now(),
            },
        }
    }

    pub fn callback(
        update_id: u64,
        user: UserId,
        chat: ChatId,
        data: impl Into<String>,
        origin_message_id: MessageId,
    ) -> Self {
        Self {
            update_id,
            user,
            chat,
            event: InboundEvent::Callback {
                callback_id: format!("cb-{update_id}"),
                data: data.into(),
                origin_message_id,
            },
        }
    }

    /// Message text or callback payload.
    pub fn text(&self) -> &str {
        match &self.event {
            InboundEvent::Message { text, .. } => text,
            InboundEvent::Callback { data, .. } => data,
        }
    }

    pub fn is_callback(&self) -> bool {
        matches!(self.event, InboundEvent::Callback { .. })
    }

    pub fn callback_id(&self) -> Option<&str> {
        match &self.event {
            InboundEvent::Callback { callback_id, .. } => Some(callback_id),
            InboundEvent::Message { .. } => None,
        }
    }

    /// Message the update refers to: the message itself, or the one carrying the pressed button.
    pub fn message_id(&self) -> MessageId {
        match &self.event {
            InboundEvent::Message { message_id, .. } => *message_id,
            InboundEvent::Callback {
                origin_message_id, ..
            } => *origin_message_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.event {
            InboundEvent::Message { .. } => "message",
            InboundEvent::Callback { .. } => "callback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub text: String,
    pub data: String,
}

impl Button {
    pub fn new(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: data.into(),
        }
    }
}

/// Inline keyboard attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Markup {
    pub rows: Vec<Vec<Button>>,
}

impl Markup {
    /// Lays buttons out with at most `row_width` buttons per row.
    pub fn from_buttons(buttons: Vec<Button>, row_width: usize) -> Self {
        let width = row_width.max(1);
        let mut rows = Vec::new();
        let mut current = Vec::with_capacity(width);
        for button in buttons {
            current.push(button);
            if current.len() == width {
                rows.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            rows.push(current);
        }
        Self { rows }
    }

    /// Buttons whose label doubles as the callback payload.
    pub fn from_labels<I, S>(labels: I, row_width: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let buttons = labels
            .into_iter()
            .map(|label| {
                let label = label.into();
                Button::new(label.clone(), label)
            })
            .collect();
        Self::from_buttons(buttons, row_width)
    }

    pub fn push_row(mut self, row: Vec<Button>) -> Self {
        if !row.is_empty() {
            self.rows.push(row);
        }
        self
    }

    pub fn buttons(&self) -> impl Iterator<Item = &Button> {
        self.rows.iter().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|row| row.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markup_row_width() {
        let markup = Markup::from_labels(["a", "b", "c"], 2);
        assert_eq!(markup.rows.len(), 2);
        assert_eq!(markup.rows[0].len(), 2);
        assert_eq!(markup.rows[1][0].data, "c");

        // Zero width degrades to one button per row
        let markup = Markup::from_labels(["a", "b"], 0);
        assert_eq!(markup.rows.len(), 2);
    }

    #[test]
    fn test_update_accessors() {
        let update = Update::callback(7, UserId(1), ChatId(2), "/form_yes", MessageId(40));
        assert!(update.is_callback());
        assert_eq!(update.text(), "/form_yes");
        assert_eq!(update.message_id(), MessageId(40));
        assert_eq!(update.callback_id(), Some("cb-7"));

        let update = Update::message(8, UserId(1), ChatId(2), "hello");
        assert_eq!(update.kind(), "message");
        assert_eq!(update.callback_id(), None);
    }
}
