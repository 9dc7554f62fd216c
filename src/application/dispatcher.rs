//! # Command Dispatcher
//!
//! Routes an update to a command module. Command names are bound to modules in a
//! [`CommandRegistry`]; modules are resolved from the container in the conversation's scope.
//!
//! - The leading token selects the command, with the prefix stripped when present; the rest of
//!   the text is its arguments.
//! - While the session is *holding*, the remembered command receives the raw text instead, and
//!   no parsing happens.
//! - Unknown names fall back to the module bound to `unknown`, if any.
//! - A `Redirect` result re-enters dispatch for the target within the same pass.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::application::container::ServiceContainer;
use crate::application::context::{CommandContext, UpdateContext};
use crate::application::middleware::{Middleware, Next};
use crate::application::result::CommandResult;
use crate::domain::errors::{ContainerError, PipelineError};
use crate::domain::session::{Holding, Session};
use crate::domain::types::ChatId;

/// Name of the fallback binding for unrecognized commands.
pub const UNKNOWN_COMMAND: &str = "unknown";

/// A business handler bound to one or more command names.
#[async_trait]
pub trait CommandModule: Send + Sync {
    async fn execute(
        &self,
        command: &str,
        ctx: &mut CommandContext<'_>,
        args: &str,
    ) -> anyhow::Result<CommandResult>;

    /// Recovers from a failed `execute`. Returning `None` lets the error travel on.
    async fn on_error(
        &self,
        _command: &str,
        _ctx: &mut CommandContext<'_>,
        _error: &anyhow::Error,
    ) -> Option<CommandResult> {
        None
    }
}

type ModuleResolver = Arc<
    dyn Fn(&ServiceContainer, ChatId) -> Result<Arc<dyn CommandModule>, ContainerError>
        + Send
        + Sync,
>;

#[derive(Clone)]
struct Binding {
    module: &'static str,
    resolve: ModuleResolver,
}

/// Command name to module bindings. Later bindings of a name replace earlier ones.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    bindings: HashMap<String, Binding>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `names` to module `H`, resolved from the container as `Arc<H>`.
    pub fn bind<H>(&mut self, names: &[&str])
    where
        H: CommandModule + 'static,
    {
        let binding = Binding {
            module: std::any::type_name::<H>(),
            resolve: Arc::new(|container: &ServiceContainer, scope: ChatId| {
                container
                    .resolve::<Arc<H>>(scope)
                    .map(|h| h as Arc<dyn CommandModule>)
            }),
        };
        for name in names {
            if let Some(previous) = self.bindings.insert(name.to_string(), binding.clone()) {
                warn!("Command `{}` rebound from {} to {}", name, previous.module, binding.module);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    pub fn resolve(
        &self,
        name: &str,
        container: &ServiceContainer,
        scope: ChatId,
    ) -> Option<Result<Arc<dyn CommandModule>, ContainerError>> {
        self.bindings
            .get(name)
            .map(|binding| (binding.resolve)(container, scope))
    }
}

fn command_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\s*(\S+)(?:\s+([\s\S]*))?$").expect("valid command pattern"))
}

/// Splits `<prefix><name> <args>` into `(name, args)`. Text without the prefix is not a command.
pub fn parse_command(text: &str, prefix: &str) -> Option<(String, String)> {
    let captures = command_pattern().captures(text)?;
    let token = captures.get(1)?.as_str();
    let name = token.strip_prefix(prefix)?;
    if name.is_empty() {
        return None;
    }
    let args = captures
        .get(2)
        .map(|m| m.as_str().trim_end().to_string())
        .unwrap_or_default();
    Some((name.to_string(), args))
}

/// Splits the leading token off any text. The prefix is stripped when present; a bare token is
/// used as is, so plain text and button data still reach the `unknown` fallback. `None` for blank
/// text.
pub fn split_command(text: &str, prefix: &str) -> Option<(String, String)> {
    let captures = command_pattern().captures(text)?;
    let token = captures.get(1)?.as_str();
    let name = token.strip_prefix(prefix).unwrap_or(token);
    let args = captures
        .get(2)
        .map(|m| m.as_str().trim_end().to_string())
        .unwrap_or_default();
    Some((name.to_string(), args))
}

/// Pipeline-wide fallback for handler failures the module itself did not recover from.
pub type CommandErrorHandler =
    Arc<dyn Fn(&anyhow::Error, &UpdateContext) -> Option<CommandResult> + Send + Sync>;

#[derive(Clone, Default)]
pub struct CommandsOptions {
    pub error_handler: Option<CommandErrorHandler>,
}

impl CommandsOptions {
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&anyhow::Error, &UpdateContext) -> Option<CommandResult> + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }
}

pub struct CommandDispatcher {
    registry: Arc<CommandRegistry>,
    prefix: String,
    max_redirects: usize,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<CommandRegistry>, prefix: impl Into<String>, max_redirects: usize) -> Self {
        Self {
            registry,
            prefix: prefix.into(),
            max_redirects,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Maps a requested name to a bound one, falling back to `unknown`.
    fn binding_for(&self, name: &str) -> Option<String> {
        if self.registry.contains(name) {
            Some(name.to_string())
        } else if self.registry.contains(UNKNOWN_COMMAND) {
            Some(UNKNOWN_COMMAND.to_string())
        } else {
            None
        }
    }

    /// Consumes one held update and returns the command it belongs to.
    fn take_held(session: &mut Session) -> Option<String> {
        let control = &mut session.control;
        if !control.holding.is_active() {
            return None;
        }
        control.holding.decrement();
        if control.remembered_command.is_none() {
            warn!("[{}] holding without a remembered command, releasing", session.id);
            control.holding = Holding::Idle;
        }
        control.remembered_command.clone()
    }

    /// Dispatches the current update. Returns `false` when no module was invoked.
    pub async fn dispatch(
        &self,
        ctx: &mut UpdateContext,
        options: &CommandsOptions,
    ) -> anyhow::Result<bool> {
        let text = ctx.update.text().to_string();
        let (requested, args) = match Self::take_held(&mut ctx.session) {
            Some(held) => (held, text),
            None => match split_command(&text, &self.prefix) {
                Some(parsed) => parsed,
                None => return Ok(false),
            },
        };

        let Some(mut command) = self.binding_for(&requested) else {
            debug!("[{}] no module for `{}`", ctx.chat(), requested);
            return Ok(false);
        };

        let locale = ctx.locale();
        let mut redirects = 0;
        loop {
            let module = match self.registry.resolve(&command, ctx.services(), ctx.chat()) {
                Some(module) => module?,
                None => return Ok(false),
            };
            debug!("[{}] dispatching `{}`", ctx.chat(), command);

            let outcome = module
                .execute(&command, &mut ctx.command_context(&locale, &command), &args)
                .await;

            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    let recovered = module
                        .on_error(&command, &mut ctx.command_context(&locale, &command), &e)
                        .await;
                    let recovered = match recovered {
                        Some(result) => Some(result),
                        None => match &options.error_handler {
                            Some(handler) => {
                                warn!("[{}] `{}` failed: {:#}", ctx.chat(), command, e);
                                handler(&e, ctx)
                            }
                            None => return Err(e.context(format!("command `{command}` failed"))),
                        },
                    };
                    ctx.session.control.holding = Holding::Idle;
                    ctx.session.control.remembered_command = None;
                    if let Some(result) = recovered {
                        ctx.enqueue(result);
                    }
                    return Ok(true);
                }
            };

            if let CommandResult::Redirect(target) = result {
                redirects += 1;
                if redirects > self.max_redirects {
                    return Err(PipelineError::RedirectLimitExceeded(self.max_redirects).into());
                }
                debug!("[{}] `{}` redirects to `{}`", ctx.chat(), command, target);
                ctx.session.control.remembered_command = Some(target.clone());
                command = match self.binding_for(&target) {
                    Some(next) => next,
                    None => {
                        warn!("[{}] redirect target `{}` is not bound", ctx.chat(), target);
                        return Ok(true);
                    }
                };
                continue;
            }

            ctx.enqueue(result);
            ctx.session.control.remembered_command = if ctx.session.control.holding.is_active() {
                Some(command)
            } else {
                None
            };
            return Ok(true);
        }
    }
}

/// Hands the update to the [`CommandDispatcher`], then continues the chain.
pub struct CommandsMiddleware {
    dispatcher: Arc<CommandDispatcher>,
    options: CommandsOptions,
}

impl CommandsMiddleware {
    pub fn new(dispatcher: Arc<CommandDispatcher>, options: CommandsOptions) -> Self {
        Self { dispatcher, options }
    }
}

#[async_trait]
impl Middleware for CommandsMiddleware {
    async fn invoke(&self, ctx: &mut UpdateContext, next: Next<'_>) -> anyhow::Result<()> {
        self.dispatcher.dispatch(ctx, &self.options).await?;
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Update, UserId};
    use crate::infrastructure::resources::ResourceCatalog;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Journal {
        calls: Mutex<Vec<(String, String)>>,
    }

    impl Journal {
        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    /// `collect` holds for two updates; `start` redirects to `help`; `broken` fails.
    struct Scripted {
        journal: Arc<Journal>,
    }

    #[async_trait]
    impl CommandModule for Scripted {
        async fn execute(
            &self,
            command: &str,
            ctx: &mut CommandContext<'_>,
            args: &str,
        ) -> anyhow::Result<CommandResult> {
            self.journal
                .calls
                .lock()
                .unwrap()
                .push((command.to_string(), args.to_string()));
            match command {
                "collect" if ctx.text().starts_with("/collect") => {
                    ctx.hold_next(2);
                    Ok(ctx.send("first?", None))
                }
                "collect" => Ok(ctx.send(format!("got {args}"), None)),
                "start" => Ok(ctx.redirect("help")),
                "wrapped" => Ok(ctx.compound(vec![ctx.send("before", None), ctx.redirect("help")])),
                "loop" => Ok(ctx.redirect("loop")),
                "broken" => anyhow::bail!("broken handler"),
                "help" => Ok(ctx.send("help text", None)),
                _ => Ok(ctx.send(format!("unknown {}", ctx.text()), None)),
            }
        }
    }

    struct Recovering;

    #[async_trait]
    impl CommandModule for Recovering {
        async fn execute(
            &self,
            _command: &str,
            ctx: &mut CommandContext<'_>,
            _args: &str,
        ) -> anyhow::Result<CommandResult> {
            ctx.hold_forever();
            anyhow::bail!("always fails")
        }

        async fn on_error(
            &self,
            _command: &str,
            ctx: &mut CommandContext<'_>,
            error: &anyhow::Error,
        ) -> Option<CommandResult> {
            Some(ctx.send(format!("recovered: {error}"), None))
        }
    }

    struct Fixture {
        container: Arc<ServiceContainer>,
        dispatcher: CommandDispatcher,
        journal: Arc<Journal>,
    }

    fn fixture(with_unknown: bool) -> Fixture {
        let journal = Arc::new(Journal::default());
        let mut container = ServiceContainer::new();
        let shared = journal.clone();
        container.add_scoped(move |_| Ok(Arc::new(Scripted { journal: shared.clone() })));
        container.add_scoped(|_| Ok(Arc::new(Recovering)));

        let mut registry = CommandRegistry::new();
        registry.bind::<Scripted>(&["collect", "start", "wrapped", "help", "broken", "loop"]);
        registry.bind::<Recovering>(&["fragile"]);
        if with_unknown {
            registry.bind::<Scripted>(&[UNKNOWN_COMMAND]);
        }

        Fixture {
            container: Arc::new(container),
            dispatcher: CommandDispatcher::new(Arc::new(registry), "/", 3),
            journal,
        }
    }

    fn context(f: &Fixture, id: u64, text: &str, session: Session) -> UpdateContext {
        UpdateContext::new(
            Update::message(id, UserId(1), ChatId(5), text),
            session,
            f.container.clone(),
            Arc::new(ResourceCatalog::default()),
            "en",
        )
    }

    fn sent_texts(ctx: &mut UpdateContext) -> Vec<String> {
        ctx.take_queue()
            .into_iter()
            .flat_map(CommandResult::flatten)
            .filter_map(|r| match r {
                CommandResult::Send { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command("/find  some thing ", "/"),
            Some(("find".to_string(), "some thing".to_string()))
        );
        assert_eq!(parse_command("/help", "/"), Some(("help".to_string(), String::new())));
        assert_eq!(parse_command("!help", "!"), Some(("help".to_string(), String::new())));
        assert_eq!(parse_command("hello /help", "/"), None);
        assert_eq!(parse_command("/", "/"), None);
        assert_eq!(parse_command("", "/"), None);
    }

    #[test]
    fn test_split_command_accepts_bare_tokens() {
        assert_eq!(
            split_command("/find it", "/"),
            Some(("find".to_string(), "it".to_string()))
        );
        assert_eq!(
            split_command("just chatting", "/"),
            Some(("just".to_string(), "chatting".to_string()))
        );
        assert_eq!(split_command("Hardware", "/"), Some(("Hardware".to_string(), String::new())));
        assert_eq!(split_command("   ", "/"), None);
    }

    #[tokio::test]
    async fn test_holding_routes_raw_text_to_remembered_command() {
        let f = fixture(false);
        let options = CommandsOptions::default();

        let mut ctx = context(&f, 1, "/collect", Session::new(ChatId(5), None));
        assert!(f.dispatcher.dispatch(&mut ctx, &options).await.unwrap());
        assert_eq!(ctx.session.control.holding, Holding::Remaining(2));
        assert_eq!(ctx.session.control.remembered_command.as_deref(), Some("collect"));

        let mut ctx = context(&f, 2, "/help", ctx.into_session());
        assert!(f.dispatcher.dispatch(&mut ctx, &options).await.unwrap());
        assert_eq!(sent_texts(&mut ctx), ["got /help"]);
        assert_eq!(ctx.session.control.holding, Holding::Remaining(1));

        let mut ctx = context(&f, 3, "blue", ctx.into_session());
        assert!(f.dispatcher.dispatch(&mut ctx, &options).await.unwrap());
        assert_eq!(sent_texts(&mut ctx), ["got blue"]);
        assert_eq!(ctx.session.control.holding, Holding::Idle);
        assert!(ctx.session.control.remembered_command.is_none());

        let calls = f.journal.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1], ("collect".to_string(), "/help".to_string()));
    }

    #[tokio::test]
    async fn test_redirect_runs_target_in_same_pass() {
        let f = fixture(false);
        let mut ctx = context(&f, 1, "/start", Session::new(ChatId(5), None));
        assert!(f.dispatcher.dispatch(&mut ctx, &CommandsOptions::default()).await.unwrap());
        assert_eq!(sent_texts(&mut ctx), ["help text"]);
        let names: Vec<_> = f.journal.calls().into_iter().map(|(c, _)| c).collect();
        assert_eq!(names, ["start", "help"]);
    }

    #[tokio::test]
    async fn test_nested_redirect_is_left_for_the_driver() {
        let f = fixture(false);
        let mut ctx = context(&f, 1, "/wrapped", Session::new(ChatId(5), None));
        f.dispatcher.dispatch(&mut ctx, &CommandsOptions::default()).await.unwrap();
        let leaves: Vec<_> = ctx.take_queue().into_iter().flat_map(CommandResult::flatten).collect();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[1], CommandResult::Redirect("help".to_string()));
        assert_eq!(f.journal.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_redirect_loop_is_bounded() {
        let f = fixture(false);
        let mut ctx = context(&f, 1, "/loop", Session::new(ChatId(5), None));
        let err = f
            .dispatcher
            .dispatch(&mut ctx, &CommandsOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::RedirectLimitExceeded(3))
        ));
        assert_eq!(f.journal.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_fallback_and_plain_text() {
        let f = fixture(true);
        let options = CommandsOptions::default();

        let mut ctx = context(&f, 1, "/nope now", Session::new(ChatId(5), None));
        assert!(f.dispatcher.dispatch(&mut ctx, &options).await.unwrap());
        assert_eq!(sent_texts(&mut ctx), ["unknown /nope now"]);

        let f = fixture(false);
        let mut ctx = context(&f, 1, "/nope", Session::new(ChatId(5), None));
        assert!(!f.dispatcher.dispatch(&mut ctx, &options).await.unwrap());
        let mut ctx = context(&f, 2, "just chatting", Session::new(ChatId(5), None));
        assert!(!f.dispatcher.dispatch(&mut ctx, &options).await.unwrap());

        let f = fixture(true);
        let mut ctx = context(&f, 3, "just chatting", Session::new(ChatId(5), None));
        assert!(f.dispatcher.dispatch(&mut ctx, &options).await.unwrap());
        assert_eq!(sent_texts(&mut ctx), ["unknown just chatting"]);

        let mut ctx = context(&f, 4, "help", Session::new(ChatId(5), None));
        assert!(f.dispatcher.dispatch(&mut ctx, &options).await.unwrap());
        assert_eq!(sent_texts(&mut ctx), ["help text"]);
    }

    #[tokio::test]
    async fn test_module_hook_recovers_and_resets_holding() {
        let f = fixture(false);
        let mut ctx = context(&f, 1, "/fragile", Session::new(ChatId(5), None));
        assert!(f.dispatcher.dispatch(&mut ctx, &CommandsOptions::default()).await.unwrap());
        assert_eq!(sent_texts(&mut ctx), ["recovered: always fails"]);
        assert_eq!(ctx.session.control.holding, Holding::Idle);
    }

    #[tokio::test]
    async fn test_pipeline_error_handler_then_propagation() {
        let f = fixture(false);
        let options = CommandsOptions::default()
            .with_error_handler(|e, ctx| Some(CommandResult::send(ctx.chat(), format!("sorry: {e}"), None)));

        let mut ctx = context(&f, 1, "/broken", Session::new(ChatId(5), None));
        assert!(f.dispatcher.dispatch(&mut ctx, &options).await.unwrap());
        assert_eq!(sent_texts(&mut ctx), ["sorry: broken handler"]);

        let mut ctx = context(&f, 2, "/broken", Session::new(ChatId(5), None));
        let err = f
            .dispatcher
            .dispatch(&mut ctx, &CommandsOptions::default())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("broken handler"));
    }
}
