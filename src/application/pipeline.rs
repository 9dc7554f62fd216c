//! # Pipeline Driver
//!
//! Per-update orchestration:
//!
//! 1. Lock the conversation and load its session.
//! 2. Build the middleware chain fresh, resolving each entry in the conversation's scope.
//! 3. Run the chain, then drain the queued results into an outbox in FIFO order.
//! 4. A `Redirect` met while draining aborts the drain and re-runs the whole chain on the same
//!    update, with the session holding for the redirect target.
//! 5. Commit the session, release the conversation's scoped services once it is idle, then send
//!    the outbox and acknowledge callbacks.
//!
//! Any failure sends the generic failure message in place of the outbox.
//!
//! `run` long-polls the transport and feeds every update through this sequence.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::application::container::ServiceContainer;
use crate::application::context::UpdateContext;
use crate::application::middleware::{MiddlewarePipeline, Next};
use crate::application::result::CommandResult;
use crate::domain::config::AppConfig;
use crate::domain::errors::{PipelineError, TransportError};
use crate::domain::session::{Holding, Session};
use crate::domain::traits::{ResourceProvider, SessionStore, Transport};
use crate::domain::types::{ChatId, Update};
use crate::strings::messages;

/// Delay before polling again after a transport failure.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub max_redirects: usize,
    pub default_locale: String,
    pub poll_timeout: Duration,
    pub updates_limit: usize,
    pub concurrent_conversations: bool,
}

impl DriverSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_redirects: config.pipeline.max_redirects,
            default_locale: config.resources.default_locale.clone(),
            poll_timeout: Duration::from_secs(config.transport.poll_timeout_secs),
            updates_limit: config.transport.updates_limit,
            concurrent_conversations: config.pipeline.concurrent_conversations,
        }
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// One async mutex per conversation, held for the whole load→commit sequence. Entries are
/// evicted once no update for the conversation holds or waits on them.
#[derive(Default)]
struct ConversationLocks {
    locks: Mutex<HashMap<ChatId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    fn get(&self, chat: ChatId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(chat)
            .or_default()
            .clone()
    }

    /// Gives back a handle from `get`. The map's own copy is the last one when nobody else
    /// is queued on the conversation.
    fn release(&self, chat: ChatId, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&chat).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&chat);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub struct PipelineDriver {
    container: Arc<ServiceContainer>,
    middleware: MiddlewarePipeline,
    transport: Arc<dyn Transport>,
    store: Arc<dyn SessionStore>,
    resources: Arc<dyn ResourceProvider>,
    settings: DriverSettings,
    locks: ConversationLocks,
}

impl PipelineDriver {
    pub fn new(
        container: Arc<ServiceContainer>,
        middleware: MiddlewarePipeline,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SessionStore>,
        resources: Arc<dyn ResourceProvider>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            container,
            middleware,
            transport,
            store,
            resources,
            settings,
            locks: ConversationLocks::default(),
        }
    }

    pub fn container(&self) -> &ServiceContainer {
        &self.container
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Processes one update end to end. On error nothing is committed, nothing the handlers
    /// queued is sent, and the user gets the generic failure message instead.
    pub async fn process_update(&self, update: Update) -> Result<(), PipelineError> {
        let chat = update.chat;
        let lock = self.locks.get(chat);
        let result = {
            let _guard = lock.lock().await;
            let result = self.process_locked(update).await;
            if result.is_err() {
                self.notify_failure(chat).await;
            }
            result
        };
        self.locks.release(chat, lock);
        result
    }

    async fn process_locked(&self, update: Update) -> Result<(), PipelineError> {
        let chat = update.chat;
        let mut session = match self.store.load(chat).await? {
            Some(session) => session,
            None => {
                debug!("[{}] new session", chat);
                Session::new(chat, Some(update.user))
            }
        };
        if session.user.is_none() {
            session.user = Some(update.user);
        }

        let mut ctx = UpdateContext::new(
            update,
            session,
            self.container.clone(),
            self.resources.clone(),
            self.settings.default_locale.clone(),
        );

        let mut outbox = Vec::new();
        let mut redirects = 0;
        loop {
            let chain = self.middleware.build(&self.container, chat)?;
            Next::new(&chain)
                .run(&mut ctx)
                .await
                .map_err(PipelineError::Handler)?;

            let Some(target) = Self::drain(&mut ctx, &mut outbox) else {
                break;
            };
            redirects += 1;
            if redirects > self.settings.max_redirects {
                return Err(PipelineError::RedirectLimitExceeded(self.settings.max_redirects));
            }
            info!("[{}] redirecting to `{}`", chat, target);
            let control = &mut ctx.session.control;
            if !control.holding.is_active() {
                control.holding = Holding::Remaining(1);
            }
            control.remembered_command = Some(target);
            control.redirected = true;
        }

        ctx.session.control.redirected = false;
        let callback = ctx.update.callback_id().map(str::to_string);
        let session = ctx.into_session();
        self.store.commit(chat, &session).await?;

        // Scoped services live as long as the conversation is mid-flow
        if session.is_idle() {
            self.container.release_scope(chat);
        }

        for result in outbox {
            if let Err(e) = result.execute(self.transport.as_ref()).await {
                warn!("[{}] dropping result after transport error: {}", chat, e);
            }
        }

        if let Some(callback_id) = callback {
            if let Err(e) = self.transport.answer_callback(&callback_id).await {
                warn!("[{}] failed to answer callback {}: {}", chat, callback_id, e);
            }
        }
        Ok(())
    }

    /// Moves queued results into `outbox` in order. Stops at the first redirect and returns its
    /// target; the results behind it are dropped.
    fn drain(ctx: &mut UpdateContext, outbox: &mut Vec<CommandResult>) -> Option<String> {
        for result in ctx.take_queue().into_iter().flat_map(CommandResult::flatten) {
            if let CommandResult::Redirect(target) = result {
                return Some(target);
            }
            outbox.push(result);
        }
        None
    }

    async fn notify_failure(&self, chat: ChatId) {
        if let Err(e) = self
            .transport
            .send(chat, &messages::generic_failure(chat), None, None)
            .await
        {
            warn!("[{}] failed to send failure notice: {}", chat, e);
        }
    }

    async fn process_logged(&self, update: Update) {
        let (id, chat) = (update.update_id, update.chat);
        if let Err(e) = self.process_update(update).await {
            error!("[{}] update #{} dropped: {}", chat, id, e);
        }
    }

    /// Processes a batch in receipt order. With concurrent conversations enabled, distinct
    /// chats run side by side while each chat stays serial.
    pub async fn process_batch(&self, updates: Vec<Update>) {
        if !self.settings.concurrent_conversations {
            for update in updates {
                self.process_logged(update).await;
            }
            return;
        }

        let mut groups: Vec<(ChatId, Vec<Update>)> = Vec::new();
        for update in updates {
            match groups.iter_mut().find(|(chat, _)| *chat == update.chat) {
                Some((_, group)) => group.push(update),
                None => groups.push((update.chat, vec![update])),
            }
        }
        join_all(groups.into_iter().map(|(_, group)| async move {
            for update in group {
                self.process_logged(update).await;
            }
        }))
        .await;
    }

    /// Polls once and processes what arrived. Returns the next offset.
    pub async fn poll_once(&self, offset: u64) -> Result<u64, TransportError> {
        let updates = self
            .transport
            .poll_updates(offset, self.settings.updates_limit, self.settings.poll_timeout)
            .await?;
        let next = updates
            .iter()
            .map(|u| u.update_id + 1)
            .max()
            .unwrap_or(offset)
            .max(offset);
        if !updates.is_empty() {
            debug!("Received {} update(s)", updates.len());
        }
        self.process_batch(updates).await;
        Ok(next)
    }

    /// Long-polls until the transport closes.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!("Polling for updates");
        let mut offset = 0;
        loop {
            match self.poll_once(offset).await {
                Ok(next) => offset = next,
                Err(TransportError::Closed) => {
                    info!("Transport closed, stopping");
                    return Ok(());
                }
                Err(e) => {
                    warn!("Polling failed: {}", e);
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::dispatcher::{
        CommandDispatcher, CommandModule, CommandRegistry, CommandsMiddleware, CommandsOptions,
    };
    use crate::application::context::CommandContext;
    use crate::application::middleware::{ErrorHandlerMiddleware, Middleware};
    use crate::domain::errors::{ContainerError, StorageError};
    use crate::domain::types::{MessageId, UserId};
    use crate::infrastructure::memory::{MemorySessionStore, MemoryTransport, Outgoing};
    use crate::infrastructure::resources::ResourceCatalog;
    use async_trait::async_trait;

    /// Redirects every first pass to `target`, queuing a message behind the redirect.
    struct Detour {
        target: &'static str,
    }

    #[async_trait]
    impl Middleware for Detour {
        async fn invoke(&self, ctx: &mut UpdateContext, next: Next<'_>) -> anyhow::Result<()> {
            if !ctx.session.control.redirected && ctx.update.text() == "/detour" {
                let chat = ctx.chat();
                ctx.enqueue(CommandResult::send(chat, "before", None));
                ctx.enqueue(CommandResult::Redirect(self.target.to_string()));
                ctx.enqueue(CommandResult::send(chat, "superseded", None));
                return Ok(());
            }
            next.run(ctx).await
        }
    }

    struct Echo;

    #[async_trait]
    impl CommandModule for Echo {
        async fn execute(
            &self,
            command: &str,
            ctx: &mut CommandContext<'_>,
            args: &str,
        ) -> anyhow::Result<CommandResult> {
            match command {
                "bounce" => Ok(CommandResult::Compound(vec![ctx.redirect("bounce")])),
                "boom" => anyhow::bail!("kaboom"),
                "hold" if ctx.text() == "/hold" => {
                    ctx.hold_next(1);
                    Ok(ctx.send("held", None))
                }
                _ => Ok(ctx.send(format!("{command}:{args}"), None)),
            }
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl SessionStore for BrokenStore {
        async fn load(&self, _id: ChatId) -> Result<Option<Session>, StorageError> {
            Err(StorageError::Backend("offline".to_string()))
        }

        async fn commit(&self, _id: ChatId, _session: &Session) -> Result<(), StorageError> {
            Err(StorageError::Backend("offline".to_string()))
        }
    }

    /// Loads fine, refuses every commit.
    struct ReadOnlyStore;

    #[async_trait]
    impl SessionStore for ReadOnlyStore {
        async fn load(&self, _id: ChatId) -> Result<Option<Session>, StorageError> {
            Ok(None)
        }

        async fn commit(&self, _id: ChatId, _session: &Session) -> Result<(), StorageError> {
            Err(StorageError::Backend("read only".to_string()))
        }
    }

    fn driver_with(
        transport: Arc<MemoryTransport>,
        store: Arc<dyn SessionStore>,
        settings: DriverSettings,
    ) -> PipelineDriver {
        let mut registry = CommandRegistry::new();
        registry.bind::<Echo>(&["help", "bounce", "boom", "hold", "unknown"]);
        let dispatcher = Arc::new(CommandDispatcher::new(Arc::new(registry), "/", 8));

        let mut container = ServiceContainer::new();
        container.add_scoped(|_| Ok(Arc::new(Echo)));
        container.add_singleton(|_| Ok(Arc::new(ErrorHandlerMiddleware)));
        container.add_singleton(|_| Ok(Arc::new(Detour { target: "help" })));

        let mut middleware = MiddlewarePipeline::new();
        middleware.push_resolved::<ErrorHandlerMiddleware>();
        middleware.push_resolved::<Detour>();
        middleware.push(
            "commands",
            Arc::new(move |_: &ServiceContainer, _: ChatId| {
                Ok::<_, ContainerError>(Arc::new(CommandsMiddleware::new(
                    dispatcher.clone(),
                    CommandsOptions::default(),
                )) as Arc<dyn Middleware>)
            }),
        );

        PipelineDriver::new(
            Arc::new(container),
            middleware,
            transport,
            store,
            Arc::new(ResourceCatalog::default()),
            settings,
        )
    }

    fn driver(transport: Arc<MemoryTransport>, store: Arc<MemorySessionStore>) -> PipelineDriver {
        driver_with(transport, store, DriverSettings::default())
    }

    #[tokio::test]
    async fn test_redirect_aborts_drain_and_reruns_chain() {
        let transport = Arc::new(MemoryTransport::new());
        let store = Arc::new(MemorySessionStore::new());
        let driver = driver(transport.clone(), store.clone());

        driver
            .process_update(Update::message(1, UserId(1), ChatId(4), "/detour"))
            .await
            .unwrap();

        assert_eq!(transport.texts(), ["before", "help:/detour"]);
        let session = store.load(ChatId(4)).await.unwrap().unwrap();
        assert!(!session.control.redirected);
        assert_eq!(session.control.holding, Holding::Idle);
        assert!(session.control.remembered_command.is_none());
    }

    #[tokio::test]
    async fn test_redirect_loop_is_bounded() {
        let transport = Arc::new(MemoryTransport::new());
        let store = Arc::new(MemorySessionStore::new());
        let settings = DriverSettings {
            max_redirects: 3,
            ..DriverSettings::default()
        };
        let driver = driver_with(transport.clone(), store.clone(), settings);

        let err = driver
            .process_update(Update::message(1, UserId(1), ChatId(4), "/bounce"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RedirectLimitExceeded(3)));
        assert!(store.load(ChatId(4)).await.unwrap().is_none());
        assert_eq!(transport.texts(), [messages::generic_failure(ChatId(4))]);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_generic_message() {
        let transport = Arc::new(MemoryTransport::new());
        let store = Arc::new(MemorySessionStore::new());
        let driver = driver(transport.clone(), store.clone());

        driver
            .process_update(Update::message(1, UserId(1), ChatId(12), "/boom"))
            .await
            .unwrap();
        assert_eq!(transport.texts(), [messages::generic_failure(ChatId(12))]);
    }

    #[tokio::test]
    async fn test_transport_errors_are_skipped() {
        let transport = Arc::new(MemoryTransport::new());
        let store = Arc::new(MemorySessionStore::new());
        let driver = driver(transport.clone(), store.clone());

        transport.fail_sends(true);
        driver
            .process_update(Update::message(1, UserId(1), ChatId(4), "/help"))
            .await
            .unwrap();
        assert!(transport.texts().is_empty());
        assert!(store.load(ChatId(4)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_storage_error_aborts_update() {
        let transport = Arc::new(MemoryTransport::new());
        let driver = driver_with(transport.clone(), Arc::new(BrokenStore), DriverSettings::default());

        let err = driver
            .process_update(Update::message(1, UserId(1), ChatId(4), "/help"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
        assert_eq!(transport.texts(), [messages::generic_failure(ChatId(4))]);
    }

    #[tokio::test]
    async fn test_failed_commit_sends_nothing_but_the_failure_notice() {
        let transport = Arc::new(MemoryTransport::new());
        let driver = driver_with(transport.clone(), Arc::new(ReadOnlyStore), DriverSettings::default());

        let err = driver
            .process_update(Update::message(1, UserId(1), ChatId(4), "/detour"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
        assert_eq!(transport.texts(), [messages::generic_failure(ChatId(4))]);
    }

    #[tokio::test]
    async fn test_broken_chain_sends_failure_notice() {
        let transport = Arc::new(MemoryTransport::new());
        let mut middleware = MiddlewarePipeline::new();
        middleware.push_resolved::<Detour>();
        let driver = PipelineDriver::new(
            Arc::new(ServiceContainer::new()),
            middleware,
            transport.clone(),
            Arc::new(MemorySessionStore::new()),
            Arc::new(ResourceCatalog::default()),
            DriverSettings::default(),
        );

        let err = driver
            .process_update(Update::message(1, UserId(1), ChatId(8), "/help"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Container(_)));
        assert_eq!(transport.texts(), [messages::generic_failure(ChatId(8))]);
    }

    #[tokio::test]
    async fn test_idle_conversations_release_scope_and_lock() {
        let transport = Arc::new(MemoryTransport::new());
        let store = Arc::new(MemorySessionStore::new());
        let driver = driver(transport.clone(), store);
        let chat = ChatId(4);

        driver
            .process_update(Update::message(1, UserId(1), chat, "/help"))
            .await
            .unwrap();
        assert_eq!(driver.container().scoped_count(chat), 0);
        assert_eq!(driver.locks.len(), 0);

        driver
            .process_update(Update::message(2, UserId(1), chat, "/hold"))
            .await
            .unwrap();
        assert_eq!(driver.container().scoped_count(chat), 1);
        assert_eq!(driver.locks.len(), 0);

        driver
            .process_update(Update::message(3, UserId(1), chat, "later"))
            .await
            .unwrap();
        assert_eq!(driver.container().scoped_count(chat), 0);
        assert_eq!(transport.texts(), ["help:", "held", "hold:later"]);
    }

    #[tokio::test]
    async fn test_callbacks_are_answered() {
        let transport = Arc::new(MemoryTransport::new());
        let store = Arc::new(MemorySessionStore::new());
        let driver = driver(transport.clone(), store);

        driver
            .process_update(Update::callback(3, UserId(1), ChatId(4), "/help", MessageId(1)))
            .await
            .unwrap();
        let outgoing = transport.outgoing();
        assert!(matches!(
            outgoing.last(),
            Some(Outgoing::Answer { callback_id }) if callback_id == "cb-3"
        ));
    }

    #[tokio::test]
    async fn test_poll_once_advances_past_failed_updates() {
        let transport = Arc::new(MemoryTransport::new());
        let store = Arc::new(MemorySessionStore::new());
        let settings = DriverSettings {
            max_redirects: 1,
            concurrent_conversations: true,
            ..DriverSettings::default()
        };
        let driver = driver_with(transport.clone(), store, settings);

        transport.push_update(Update::message(5, UserId(1), ChatId(1), "/bounce"));
        transport.push_update(Update::message(6, UserId(2), ChatId(2), "/help one"));
        transport.push_update(Update::message(7, UserId(1), ChatId(1), "/help two"));

        let offset = driver.poll_once(0).await.unwrap();
        assert_eq!(offset, 8);
        let texts = transport.texts();
        assert!(texts.contains(&"help:one".to_string()));
        assert!(texts.contains(&"help:two".to_string()));

        assert_eq!(driver.poll_once(offset).await.unwrap(), 8);
    }
}
