//! # Messages
//!
//! Fixed user-facing messages that must work even when resources are unavailable.

use crate::domain::types::ChatId;

pub fn generic_failure(chat: ChatId) -> String {
    format!("Something went wrong, please contact support. Here is your id: {chat}")
}
