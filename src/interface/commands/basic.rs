//! # Basic Commands
//!
//! `/start`, `/help`, `/lang <tag>` and the fallback for unknown commands.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::application::context::CommandContext;
use crate::application::dispatcher::CommandModule;
use crate::application::result::CommandResult;

pub struct BasicCommands;

#[async_trait]
impl CommandModule for BasicCommands {
    async fn execute(
        &self,
        command: &str,
        ctx: &mut CommandContext<'_>,
        args: &str,
    ) -> Result<CommandResult> {
        match command {
            "start" => {
                let welcome = ctx.send(ctx.resource("welcome_message")?, None);
                Ok(ctx.compound(vec![welcome, ctx.redirect("help")]))
            }
            "help" => Ok(ctx.send(ctx.resource("help_message")?, None)),
            "lang" => {
                let tag = args.trim().to_lowercase();
                if tag.is_empty() {
                    return Ok(ctx.reply(ctx.locale().to_string(), None));
                }
                info!("[{}] locale set to {}", ctx.chat(), tag);
                ctx.session_mut().control.locale = Some(tag);
                // Queued rather than returned, so the chain re-runs under the new locale
                Ok(ctx.compound(vec![ctx.redirect("help")]))
            }
            _ => Ok(ctx.reply(ctx.resource("unknown_message")?, None)),
        }
    }
}
