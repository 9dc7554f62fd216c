//! # Update & Command Contexts
//!
//! `UpdateContext` is what travels down the middleware chain for one pass over an update: the
//! update itself, the conversation's session and the queue of pending results.
//! `CommandContext` is the narrower view handed to business handlers and form hooks.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::application::container::ServiceContainer;
use crate::application::result::CommandResult;
use crate::domain::errors::ResourceError;
use crate::domain::session::{Holding, Session};
use crate::domain::traits::ResourceProvider;
use crate::domain::types::{ChatId, Markup, MessageId, Update, UserId};

pub struct UpdateContext {
    pub update: Update,
    pub session: Session,
    queue: VecDeque<CommandResult>,
    services: Arc<ServiceContainer>,
    resources: Arc<dyn ResourceProvider>,
    default_locale: String,
}

impl UpdateContext {
    pub fn new(
        update: Update,
        session: Session,
        services: Arc<ServiceContainer>,
        resources: Arc<dyn ResourceProvider>,
        default_locale: impl Into<String>,
    ) -> Self {
        Self {
            update,
            session,
            queue: VecDeque::new(),
            services,
            resources,
            default_locale: default_locale.into(),
        }
    }

    pub fn chat(&self) -> ChatId {
        self.update.chat
    }

    pub fn services(&self) -> &ServiceContainer {
        &self.services
    }

    pub fn resources(&self) -> &dyn ResourceProvider {
        self.resources.as_ref()
    }

    /// The conversation's locale tag, or the configured default.
    pub fn locale(&self) -> String {
        self.session.locale_or(&self.default_locale).to_string()
    }

    pub fn enqueue(&mut self, result: CommandResult) {
        self.queue.push_back(result);
    }

    pub fn queued(&self) -> &VecDeque<CommandResult> {
        &self.queue
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Drops everything queued after the first `len` results.
    pub fn truncate_queue(&mut self, len: usize) {
        self.queue.truncate(len);
    }

    pub fn take_queue(&mut self) -> VecDeque<CommandResult> {
        std::mem::take(&mut self.queue)
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    pub fn command_context<'a>(&'a mut self, locale: &'a str, command: &'a str) -> CommandContext<'a> {
        CommandContext {
            update: &self.update,
            session: &mut self.session,
            resources: self.resources.as_ref(),
            locale,
            command,
        }
    }
}

/// Handler-facing view of the current update.
pub struct CommandContext<'a> {
    update: &'a Update,
    session: &'a mut Session,
    resources: &'a dyn ResourceProvider,
    locale: &'a str,
    command: &'a str,
}

impl<'a> CommandContext<'a> {
    pub fn update(&self) -> &Update {
        self.update
    }

    pub fn chat(&self) -> ChatId {
        self.update.chat
    }

    pub fn user(&self) -> UserId {
        self.update.user
    }

    /// Raw message text or callback payload.
    pub fn text(&self) -> &str {
        self.update.text()
    }

    pub fn is_callback(&self) -> bool {
        self.update.is_callback()
    }

    /// Name the current invocation was bound to.
    pub fn command(&self) -> &str {
        self.command
    }

    pub fn locale(&self) -> &str {
        self.locale
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        self.session
    }

    pub fn resource(&self, id: &str) -> Result<String, ResourceError> {
        self.resources.get_string(self.locale, id)
    }

    pub fn resource_array(&self, id: &str) -> Result<Vec<String>, ResourceError> {
        self.resources.get_string_array(self.locale, id)
    }

    /// Forces the next `count` updates to this command, bypassing command parsing.
    pub fn hold_next(&mut self, count: u32) {
        self.session.control.holding = Holding::from_count(count);
    }

    pub fn hold_forever(&mut self) {
        self.session.control.holding = Holding::Forever;
    }

    pub fn release_hold(&mut self) {
        self.session.control.holding = Holding::Idle;
    }

    /// Updates still held for this command; `None` while holding forever.
    pub fn holding_left(&self) -> Option<u32> {
        self.session.control.holding.remaining()
    }

    pub fn send(&self, text: impl Into<String>, markup: Option<Markup>) -> CommandResult {
        CommandResult::send(self.chat(), text, markup)
    }

    pub fn edit(
        &self,
        message_id: MessageId,
        text: Option<String>,
        markup: Option<Markup>,
    ) -> CommandResult {
        CommandResult::Edit {
            chat: self.chat(),
            message_id,
            text,
            markup,
        }
    }

    /// Replies to the message this update came from.
    pub fn reply(&self, text: impl Into<String>, markup: Option<Markup>) -> CommandResult {
        CommandResult::ReplyTo {
            chat: self.chat(),
            message_id: self.update.message_id(),
            text: text.into(),
            markup,
        }
    }

    pub fn send_list(&self, messages: Vec<String>) -> CommandResult {
        CommandResult::SendList {
            chat: self.chat(),
            messages,
        }
    }

    pub fn compound(&self, results: Vec<CommandResult>) -> CommandResult {
        CommandResult::Compound(results)
    }

    pub fn empty(&self) -> CommandResult {
        CommandResult::Empty
    }

    pub fn redirect(&self, command: impl Into<String>) -> CommandResult {
        CommandResult::Redirect(command.into())
    }
}
