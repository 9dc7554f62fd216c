//! # Command Results
//!
//! Deferred bot actions produced by handlers and middleware. Results are queued during the
//! chain and executed against the transport afterwards, in FIFO order.

use crate::domain::errors::TransportError;
use crate::domain::traits::Transport;
use crate::domain::types::{ChatId, Markup, MessageId};

#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Send {
        chat: ChatId,
        text: String,
        markup: Option<Markup>,
    },
    Edit {
        chat: ChatId,
        message_id: MessageId,
        text: Option<String>,
        markup: Option<Markup>,
    },
    ReplyTo {
        chat: ChatId,
        message_id: MessageId,
        text: String,
        markup: Option<Markup>,
    },
    SendList {
        chat: ChatId,
        messages: Vec<String>,
    },
    Compound(Vec<CommandResult>),
    Empty,
    /// Control signal: run `target` instead. Never reaches the transport.
    Redirect(String),
}

impl CommandResult {
    pub fn send(chat: ChatId, text: impl Into<String>, markup: Option<Markup>) -> Self {
        CommandResult::Send {
            chat,
            text: text.into(),
            markup,
        }
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, CommandResult::Redirect(_))
    }

    /// Leaf actions in execution order. Nested compounds are expanded; `Empty` disappears.
    pub fn flatten(self) -> Vec<CommandResult> {
        let mut leaves = Vec::new();
        self.flatten_into(&mut leaves);
        leaves
    }

    fn flatten_into(self, leaves: &mut Vec<CommandResult>) {
        match self {
            CommandResult::Compound(results) => {
                for result in results {
                    result.flatten_into(leaves);
                }
            }
            CommandResult::Empty => {}
            leaf => leaves.push(leaf),
        }
    }

    fn leaves(&self) -> Vec<&CommandResult> {
        match self {
            CommandResult::Compound(results) => results.iter().flat_map(|r| r.leaves()).collect(),
            CommandResult::Empty => Vec::new(),
            leaf => vec![leaf],
        }
    }

    /// Executes the action against the transport. Compounds run their leaves in order and
    /// stop at the first error.
    pub async fn execute(&self, transport: &dyn Transport) -> Result<(), TransportError> {
        for leaf in self.leaves() {
            match leaf {
                CommandResult::Send { chat, text, markup } => {
                    transport.send(*chat, text, markup.as_ref(), None).await?;
                }
                CommandResult::Edit {
                    chat,
                    message_id,
                    text,
                    markup,
                } => {
                    transport
                        .edit(*chat, *message_id, text.as_deref(), markup.as_ref())
                        .await?;
                }
                CommandResult::ReplyTo {
                    chat,
                    message_id,
                    text,
                    markup,
                } => {
                    transport
                        .send(*chat, text, markup.as_ref(), Some(*message_id))
                        .await?;
                }
                CommandResult::SendList { chat, messages } => {
                    for message in messages {
                        transport.send(*chat, message, None, None).await?;
                    }
                }
                CommandResult::Compound(_) | CommandResult::Empty | CommandResult::Redirect(_) => {}
            }
        }
        Ok(())
    }
}
