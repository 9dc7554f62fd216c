//! # New Request Form
//!
//! Demo form behind `/new_request`. The wizard collects the fields declared in `models.yaml`;
//! this handler only checks them and acknowledges the finished request.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::application::context::CommandContext;
use crate::application::form::{Completion, FormHandler};
use crate::application::result::CommandResult;
use crate::domain::session::SessionValue;

pub const NEW_REQUEST_MODEL: &str = "new_request";

const MAX_TITLE_CHARS: usize = 80;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewRequest {
    pub title: String,
    pub category: String,
    pub details: Option<String>,
    pub notify: Option<bool>,
}

pub struct NewRequestForm;

#[async_trait]
impl FormHandler for NewRequestForm {
    type Model = NewRequest;

    async fn on_enter(&self, ctx: &mut CommandContext<'_>) -> Result<CommandResult> {
        Ok(ctx.send(ctx.resource("request_hint")?, None))
    }

    async fn on_property_set(
        &self,
        _ctx: &mut CommandContext<'_>,
        _model: &NewRequest,
        property: &str,
        value: &SessionValue,
    ) -> Result<Option<String>> {
        let too_long = property == "title"
            && value
                .as_str()
                .is_some_and(|title| title.chars().count() > MAX_TITLE_CHARS);
        Ok(too_long.then(|| format!("Please keep the title under {MAX_TITLE_CHARS} characters.")))
    }

    async fn on_complete(&self, ctx: &mut CommandContext<'_>, model: NewRequest) -> Result<Completion> {
        info!(
            "[{}] request from user {}: {:?} ({}), notify: {}",
            ctx.chat(),
            ctx.user(),
            model.title,
            model.category,
            model.notify.unwrap_or(false)
        );
        let text = ctx
            .resource("request_received")?
            .replace("{title}", &model.title);
        Ok(Completion::Done(ctx.send(text, None)))
    }

    async fn on_cancel(&self, ctx: &mut CommandContext<'_>, _model: NewRequest) -> Result<CommandResult> {
        Ok(ctx.send(ctx.resource("request_cancelled")?, None))
    }
}
