//! # Telegram Transport
//!
//! Implements the `Transport` trait over the Telegram Bot HTTP API with `reqwest`.
//! Long polling uses `getUpdates`; the HTTP timeout is the poll timeout plus a margin so a
//! quiet poll never trips the client timeout.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::config::TransportConfig;
use crate::domain::errors::{ConfigurationError, TransportError};
use crate::domain::traits::Transport;
use crate::domain::types::{ChatId, InboundEvent, Markup, MessageId, Update, UserId};

const TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// Telegram API envelope
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    #[serde(default)]
    from: Option<TgUser>,
    chat: TgChat,
    date: i64,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgCallbackQuery {
    id: String,
    from: TgUser,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: u64,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Serialize)]
struct GetUpdates<'a> {
    offset: u64,
    limit: usize,
    timeout: u64,
    allowed_updates: &'a [&'a str],
}

#[derive(Debug, Serialize)]
struct InlineButton<'a> {
    text: &'a str,
    callback_data: &'a str,
}

#[derive(Debug, Serialize)]
struct InlineKeyboard<'a> {
    inline_keyboard: Vec<Vec<InlineButton<'a>>>,
}

impl<'a> From<&'a Markup> for InlineKeyboard<'a> {
    fn from(markup: &'a Markup) -> Self {
        Self {
            inline_keyboard: markup
                .rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|b| InlineButton {
                            text: &b.text,
                            callback_data: &b.data,
                        })
                        .collect()
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboard<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<i64>,
}

#[derive(Debug, Serialize)]
struct EditMessage<'a> {
    chat_id: i64,
    message_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboard<'a>>,
}

#[derive(Debug, Serialize)]
struct AnswerCallback<'a> {
    callback_query_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

fn timestamp(date: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(date, 0).single().unwrap_or_else(Utc::now)
}

/// Maps a wire update onto the domain type. Updates without text or callback data yield `None`.
fn convert(update: TgUpdate) -> Option<Update> {
    if let Some(query) = update.callback_query {
        let origin = query.message?;
        return Some(Update {
            update_id: update.update_id,
            user: UserId(query.from.id),
            chat: ChatId(origin.chat.id),
            event: InboundEvent::Callback {
                callback_id: query.id,
                data: query.data?,
                origin_message_id: MessageId(origin.message_id),
            },
        });
    }
    let message = update.message?;
    let user = message.from.as_ref().map_or(message.chat.id, |u| u.id);
    Some(Update {
        update_id: update.update_id,
        user: UserId(user),
        chat: ChatId(message.chat.id),
        event: InboundEvent::Message {
            text: message.text?,
            message_id: MessageId(message.message_id),
            timestamp: timestamp(message.date),
        },
    })
}

pub struct TelegramTransport {
    client: Client,
    base_url: String,
    /// Lowest offset worth asking for; moves past updates that were skipped on conversion.
    floor: AtomicU64,
}

impl TelegramTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, ConfigurationError> {
        let token = config.credential()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.poll_timeout_secs) + TIMEOUT_MARGIN)
            .build()
            .map_err(|e| ConfigurationError::Invalid(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: format!("{}/bot{}", config.api_url.trim_end_matches('/'), token),
            floor: AtomicU64::new(0),
        })
    }

    async fn call<P, R>(&self, method: &str, payload: &P) -> Result<R, TransportError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .json(payload)
            .send()
            .await
            .map_err(|e| TransportError::Request(format!("{method}: {e}")))?;

        let envelope: ApiResponse<R> = response
            .json()
            .await
            .map_err(|e| TransportError::Request(format!("{method}: failed to parse response: {e}")))?;

        match envelope {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse {
                error_code,
                description,
                ..
            } => Err(TransportError::Api {
                code: error_code.unwrap_or_default(),
                description: description.unwrap_or_else(|| format!("{method} returned no result")),
            }),
        }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn poll_updates(
        &self,
        offset: u64,
        limit: usize,
        timeout: Duration,
    ) -> Result<Vec<Update>, TransportError> {
        let offset = offset.max(self.floor.load(Ordering::SeqCst));
        let raw: Vec<TgUpdate> = self
            .call(
                "getUpdates",
                &GetUpdates {
                    offset,
                    limit: limit.clamp(1, 100),
                    timeout: timeout.as_secs(),
                    allowed_updates: &["message", "callback_query"],
                },
            )
            .await?;

        if let Some(last) = raw.iter().map(|u| u.update_id).max() {
            self.floor.fetch_max(last + 1, Ordering::SeqCst);
        }
        let updates: Vec<Update> = raw
            .into_iter()
            .filter_map(|u| {
                let id = u.update_id;
                let converted = convert(u);
                if converted.is_none() {
                    debug!("Skipping update #{} without text or callback data", id);
                }
                converted
            })
            .collect();
        Ok(updates)
    }

    async fn send(
        &self,
        chat: ChatId,
        text: &str,
        markup: Option<&Markup>,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, TransportError> {
        let sent: SentMessage = self
            .call(
                "sendMessage",
                &SendMessage {
                    chat_id: chat.0,
                    text,
                    reply_markup: markup.map(InlineKeyboard::from),
                    reply_to_message_id: reply_to.map(|m| m.0),
                },
            )
            .await?;
        Ok(MessageId(sent.message_id))
    }

    async fn edit(
        &self,
        chat: ChatId,
        message_id: MessageId,
        text: Option<&str>,
        markup: Option<&Markup>,
    ) -> Result<(), TransportError> {
        let method = if text.is_some() {
            "editMessageText"
        } else {
            "editMessageReplyMarkup"
        };
        // Both methods answer with the edited message, or `true` for inline messages.
        let _: serde_json::Value = self
            .call(
                method,
                &EditMessage {
                    chat_id: chat.0,
                    message_id: message_id.0,
                    text,
                    reply_markup: markup.map(InlineKeyboard::from),
                },
            )
            .await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError> {
        let answered: bool = self
            .call(
                "answerCallbackQuery",
                &AnswerCallback {
                    callback_query_id: callback_id,
                },
            )
            .await?;
        if !answered {
            warn!("Callback {} was not acknowledged", callback_id);
        }
        Ok(())
    }
}
