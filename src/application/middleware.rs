//! # Middleware Chain
//!
//! An ordered list of interceptors run once per pass over an update. Each middleware receives
//! the context and a [`Next`] continuation; it may run code before and after calling
//! `next.run(ctx)`, or return without calling it to short-circuit the rest of the chain.
//!
//! The chain is rebuilt for every update: each entry is a factory that resolves the concrete
//! middleware from the service container in the conversation's scope.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::application::container::ServiceContainer;
use crate::application::context::UpdateContext;
use crate::application::result::CommandResult;
use crate::domain::errors::ContainerError;
use crate::domain::types::ChatId;
use crate::strings::messages;

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn invoke(&self, ctx: &mut UpdateContext, next: Next<'_>) -> anyhow::Result<()>;
}

/// The remainder of the chain after the current middleware.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>]) -> Self {
        Self { chain }
    }

    /// Runs the rest of the chain. The end of the chain is a no-op.
    pub async fn run(self, ctx: &mut UpdateContext) -> anyhow::Result<()> {
        match self.chain.split_first() {
            Some((head, rest)) => head.invoke(ctx, Next { chain: rest }).await,
            None => Ok(()),
        }
    }
}

pub type MiddlewareFactory = Arc<
    dyn Fn(&ServiceContainer, ChatId) -> Result<Arc<dyn Middleware>, ContainerError> + Send + Sync,
>;

/// Registration-ordered middleware factories.
#[derive(Clone, Default)]
pub struct MiddlewarePipeline {
    entries: Vec<(&'static str, MiddlewareFactory)>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &'static str, factory: MiddlewareFactory) {
        self.entries.push((name, factory));
    }

    /// Factory resolving `M` from the container as `Arc<M>`.
    pub fn resolved<M>() -> MiddlewareFactory
    where
        M: Middleware + 'static,
    {
        Arc::new(|container: &ServiceContainer, scope: ChatId| {
            container
                .resolve::<Arc<M>>(scope)
                .map(|m| m as Arc<dyn Middleware>)
        })
    }

    /// Adds a middleware type resolved from the container.
    pub fn push_resolved<M>(&mut self)
    where
        M: Middleware + 'static,
    {
        self.push(std::any::type_name::<M>(), Self::resolved::<M>());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(name, _)| *name)
    }

    /// Resolves every entry for the given conversation, in registration order.
    pub fn build(
        &self,
        container: &ServiceContainer,
        scope: ChatId,
    ) -> Result<Vec<Arc<dyn Middleware>>, ContainerError> {
        self.entries
            .iter()
            .map(|(_, factory)| factory(container, scope))
            .collect()
    }
}

/// Logs every update passing through the chain.
#[derive(Default)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn invoke(&self, ctx: &mut UpdateContext, next: Next<'_>) -> anyhow::Result<()> {
        info!(
            "[{}] {} #{} from {}{}: {}",
            ctx.chat(),
            ctx.update.kind(),
            ctx.update.update_id,
            ctx.update.user,
            if ctx.session.control.redirected { " (redirected)" } else { "" },
            ctx.update.text()
        );
        let queued = ctx.queue_len();
        next.run(ctx).await?;
        debug!("[{}] queued {} result(s)", ctx.chat(), ctx.queue_len().saturating_sub(queued));
        Ok(())
    }
}

/// Catches failures from the rest of the chain. Session changes and results produced by the
/// failed pass are discarded and the user gets a generic message quoting the conversation id.
#[derive(Default)]
pub struct ErrorHandlerMiddleware;

#[async_trait]
impl Middleware for ErrorHandlerMiddleware {
    async fn invoke(&self, ctx: &mut UpdateContext, next: Next<'_>) -> anyhow::Result<()> {
        let snapshot = ctx.session.clone();
        let queued = ctx.queue_len();

        if let Err(e) = next.run(ctx).await {
            error!("[{}] update #{} failed: {:#}", ctx.chat(), ctx.update.update_id, e);
            ctx.session = snapshot;
            ctx.truncate_queue(queued);
            let chat = ctx.chat();
            ctx.enqueue(CommandResult::send(chat, messages::generic_failure(chat), None));
        }
        Ok(())
    }
}
