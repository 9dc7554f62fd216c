//! # Console Transport
//!
//! A local stand-in for a chat network: reads lines from stdin and prints replies to stdout.
//! Everything happens in a single conversation. A line starting with `!` is delivered as a
//! button press whose payload is the rest of the line, e.g. `!/form_yes`.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::errors::TransportError;
use crate::domain::traits::Transport;
use crate::domain::types::{ChatId, InboundEvent, Markup, MessageId, Update, UserId};

pub const CONSOLE_CHAT: ChatId = ChatId(1);
const CONSOLE_USER: UserId = UserId(1);
const CALLBACK_MARKER: char = '!';

pub struct ConsoleTransport {
    lines: Mutex<Lines<BufReader<Stdin>>>,
    next_update: AtomicU64,
    next_message: AtomicI64,
}

impl Default for ConsoleTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleTransport {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
            next_update: AtomicU64::new(1),
            next_message: AtomicI64::new(1),
        }
    }

    fn message_id(&self) -> MessageId {
        MessageId(self.next_message.fetch_add(1, Ordering::SeqCst))
    }

    /// Turns one input line into an update. Blank lines yield `None`.
    fn parse_line(&self, line: &str) -> Option<Update> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let update_id = self.next_update.fetch_add(1, Ordering::SeqCst);
        let event = match line.strip_prefix(CALLBACK_MARKER) {
            Some(data) => InboundEvent::Callback {
                callback_id: format!("console-{update_id}"),
                data: data.trim().to_string(),
                origin_message_id: MessageId(self.next_message.load(Ordering::SeqCst) - 1),
            },
            None => InboundEvent::Message {
                text: line.to_string(),
                message_id: self.message_id(),
                timestamp: Utc::now(),
            },
        };
        Some(Update {
            update_id,
            user: CONSOLE_USER,
            chat: CONSOLE_CHAT,
            event,
        })
    }
}

fn render(text: &str, markup: Option<&Markup>) -> String {
    let mut out = text.to_string();
    if let Some(markup) = markup {
        for row in &markup.rows {
            let buttons: Vec<String> = row
                .iter()
                .map(|b| format!("[{} -> {}]", b.text, b.data))
                .collect();
            out.push('\n');
            out.push_str(&buttons.join(" "));
        }
    }
    out
}

#[async_trait]
impl Transport for ConsoleTransport {
    async fn poll_updates(
        &self,
        _offset: u64,
        _limit: usize,
        timeout: Duration,
    ) -> Result<Vec<Update>, TransportError> {
        let mut lines = self.lines.lock().await;
        match tokio::time::timeout(timeout, lines.next_line()).await {
            Err(_) => Ok(Vec::new()),
            Ok(Ok(Some(line))) => Ok(self.parse_line(&line).into_iter().collect()),
            Ok(Ok(None)) => Err(TransportError::Closed),
            Ok(Err(e)) => Err(TransportError::Request(e.to_string())),
        }
    }

    async fn send(
        &self,
        chat: ChatId,
        text: &str,
        markup: Option<&Markup>,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, TransportError> {
        let id = self.message_id();
        match reply_to {
            Some(original) => println!("[{chat}] #{id} (re #{original}) {}", render(text, markup)),
            None => println!("[{chat}] #{id} {}", render(text, markup)),
        }
        Ok(id)
    }

    async fn edit(
        &self,
        chat: ChatId,
        message_id: MessageId,
        text: Option<&str>,
        markup: Option<&Markup>,
    ) -> Result<(), TransportError> {
        println!("[{chat}] #{message_id} edited: {}", render(text.unwrap_or(""), markup));
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError> {
        debug!("Callback {} acknowledged", callback_id);
        Ok(())
    }
}
