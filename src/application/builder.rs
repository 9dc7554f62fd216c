//! # Application Builder
//!
//! Startup wiring: service registrations, command modules, forms and the middleware order.
//! `build` validates the result and hands back a ready [`PipelineDriver`].

use std::sync::Arc;
use tracing::{info, warn};

use crate::application::container::{Resolver, ServiceContainer};
use crate::application::dispatcher::{
    CommandDispatcher, CommandModule, CommandRegistry, CommandsMiddleware, CommandsOptions,
};
use crate::application::form::{ConversationFormEngine, FormHandler, FormRegistry, FormsMiddleware};
use crate::application::middleware::{
    ErrorHandlerMiddleware, LoggingMiddleware, Middleware, MiddlewareFactory, MiddlewarePipeline,
};
use crate::application::pipeline::{DriverSettings, PipelineDriver};
use crate::domain::config::AppConfig;
use crate::domain::errors::{ConfigurationError, ContainerError};
use crate::domain::traits::{ResourceProvider, SessionStore, Transport};

type OptionsFactory = Arc<dyn Fn(&mut Resolver<'_>) -> CommandsOptions + Send + Sync>;

enum Stage {
    Middleware(&'static str, MiddlewareFactory),
    Forms,
    Commands(OptionsFactory),
}

pub struct ApplicationBuilder {
    config: AppConfig,
    services: ServiceContainer,
    commands: CommandRegistry,
    forms: FormRegistry,
    stages: Vec<Stage>,
}

impl ApplicationBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            services: ServiceContainer::new(),
            commands: CommandRegistry::new(),
            forms: FormRegistry::new(),
            stages: Vec::new(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn services(&mut self) -> &mut ServiceContainer {
        &mut self.services
    }

    pub fn add_singleton<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&mut Resolver<'_>) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        self.services.add_singleton(factory);
        self
    }

    pub fn add_scoped<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&mut Resolver<'_>) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        self.services.add_scoped(factory);
        self
    }

    pub fn add_transient<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&mut Resolver<'_>) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        self.services.add_transient(factory);
        self
    }

    /// Registers command module `H` (scoped per conversation) and binds `names` to it.
    pub fn add_commands<H, F>(&mut self, names: &[&str], factory: F) -> &mut Self
    where
        H: CommandModule + 'static,
        F: Fn(&mut Resolver<'_>) -> Result<H, ContainerError> + Send + Sync + 'static,
    {
        self.services
            .add_scoped(move |resolver| factory(resolver).map(Arc::new));
        self.commands.bind::<H>(names);
        self
    }

    /// Registers form handler `H` (scoped per conversation) for the model `model_id`.
    pub fn add_form<H, F>(&mut self, model_id: &str, factory: F) -> &mut Self
    where
        H: FormHandler,
        F: Fn(&mut Resolver<'_>) -> Result<H, ContainerError> + Send + Sync + 'static,
    {
        self.services
            .add_scoped(move |resolver| factory(resolver).map(Arc::new));
        self.forms.register::<H>(model_id);
        self
    }

    /// Appends middleware `M`, resolved from the container as `Arc<M>` for every update.
    pub fn use_middleware<M>(&mut self) -> &mut Self
    where
        M: Middleware + 'static,
    {
        self.stages.push(Stage::Middleware(
            std::any::type_name::<M>(),
            MiddlewarePipeline::resolved::<M>(),
        ));
        self
    }

    pub fn use_logging(&mut self) -> &mut Self {
        self.services.add_scoped(|_| Ok(Arc::new(LoggingMiddleware)));
        self.use_middleware::<LoggingMiddleware>()
    }

    pub fn use_error_handler(&mut self) -> &mut Self {
        self.services.add_scoped(|_| Ok(Arc::new(ErrorHandlerMiddleware)));
        self.use_middleware::<ErrorHandlerMiddleware>()
    }

    pub fn use_forms(&mut self) -> &mut Self {
        self.stages.push(Stage::Forms);
        self
    }

    /// Appends the command dispatcher. `options` runs whenever the stage is built for a new
    /// conversation scope.
    pub fn use_commands<F>(&mut self, options: F) -> &mut Self
    where
        F: Fn(&mut Resolver<'_>) -> CommandsOptions + Send + Sync + 'static,
    {
        self.stages.push(Stage::Commands(Arc::new(options)));
        self
    }

    fn validate(&self, resources: &dyn ResourceProvider) -> Result<(), ConfigurationError> {
        if self.commands.is_empty() {
            return Err(ConfigurationError::NoCommandModules);
        }
        let locale = &self.config.resources.default_locale;
        for id in self.forms.ids() {
            let model = resources.get_model(locale, id).map_err(|e| {
                ConfigurationError::Invalid(format!("form `{id}` has no usable model: {e}"))
            })?;
            if self.commands.contains(&model.entry_command) {
                warn!(
                    "Form `{}` entry command `{}` is also bound to a command module",
                    id, model.entry_command
                );
            }
        }
        let has_forms_stage = self.stages.iter().any(|s| matches!(s, Stage::Forms));
        if !self.forms.is_empty() && !has_forms_stage {
            warn!("Forms are registered but `use_forms` was never called");
        }
        if !self.stages.iter().any(|s| matches!(s, Stage::Commands(_))) {
            warn!("No command stage in the middleware pipeline");
        }
        Ok(())
    }

    pub fn build(
        mut self,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SessionStore>,
        resources: Arc<dyn ResourceProvider>,
    ) -> Result<PipelineDriver, ConfigurationError> {
        self.validate(resources.as_ref())?;

        let prefix = self.config.pipeline.command_prefix.clone();
        let max_redirects = self.config.pipeline.max_redirects;
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::new(self.commands),
            prefix.clone(),
            max_redirects,
        ));
        let engine = Arc::new(ConversationFormEngine::new(Arc::new(self.forms), prefix));

        self.services.add_instance(transport.clone());
        self.services.add_instance(resources.clone());
        self.services.add_instance(Arc::new(self.config.clone()));

        let mut middleware = MiddlewarePipeline::new();
        for stage in self.stages {
            match stage {
                Stage::Middleware(name, factory) => middleware.push(name, factory),
                Stage::Forms => {
                    let engine = engine.clone();
                    self.services
                        .add_scoped(move |_| Ok(Arc::new(FormsMiddleware::new(engine.clone()))));
                    middleware.push("forms", MiddlewarePipeline::resolved::<FormsMiddleware>());
                }
                Stage::Commands(options) => {
                    let dispatcher = dispatcher.clone();
                    self.services.add_scoped(move |resolver| {
                        Ok(Arc::new(CommandsMiddleware::new(
                            dispatcher.clone(),
                            options(resolver),
                        )))
                    });
                    middleware.push("commands", MiddlewarePipeline::resolved::<CommandsMiddleware>());
                }
            }
        }

        info!(
            "Pipeline ready: {}",
            middleware.names().collect::<Vec<_>>().join(" -> ")
        );
        Ok(PipelineDriver::new(
            Arc::new(self.services),
            middleware,
            transport,
            store,
            resources,
            DriverSettings::from_config(&self.config),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::context::CommandContext;
    use crate::application::form::Completion;
    use crate::application::result::CommandResult;
    use crate::domain::types::{ChatId, Update, UserId};
    use crate::infrastructure::memory::{MemorySessionStore, MemoryTransport};
    use crate::infrastructure::resources::ResourceCatalog;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    struct Greeter {
        greeting: Arc<String>,
    }

    #[async_trait]
    impl CommandModule for Greeter {
        async fn execute(
            &self,
            _command: &str,
            ctx: &mut CommandContext<'_>,
            args: &str,
        ) -> anyhow::Result<CommandResult> {
            Ok(ctx.send(format!("{} {}", self.greeting, args), None))
        }
    }

    #[derive(Default, Serialize, Deserialize)]
    struct Note {
        body: String,
    }

    struct NoteForm;

    #[async_trait]
    impl FormHandler for NoteForm {
        type Model = Note;

        async fn on_complete(
            &self,
            ctx: &mut CommandContext<'_>,
            model: Note,
        ) -> anyhow::Result<Completion> {
            Ok(Completion::Done(ctx.send(format!("noted {}", model.body), None)))
        }
    }

    fn resources() -> Arc<ResourceCatalog> {
        let mut catalog = ResourceCatalog::default();
        catalog
            .add_strings_yaml(None, include_str!("../../resources/strings.yaml"))
            .unwrap();
        catalog
            .add_models_yaml(
                None,
                "note:\n  entry_command: note\n  confirm_send: false\n  properties:\n    - name: body\n",
            )
            .unwrap();
        Arc::new(catalog)
    }

    #[test]
    fn test_build_without_commands_fails() {
        let builder = ApplicationBuilder::new(AppConfig::default());
        let err = builder
            .build(
                Arc::new(MemoryTransport::new()),
                Arc::new(MemorySessionStore::new()),
                resources(),
            )
            .err()
            .unwrap();
        assert!(matches!(err, ConfigurationError::NoCommandModules));
    }

    #[test]
    fn test_form_without_model_is_rejected() {
        let mut builder = ApplicationBuilder::new(AppConfig::default());
        builder
            .add_commands(&["hi"], |_| Ok(Greeter { greeting: Arc::new("hi".to_string()) }))
            .add_form("missing", |_| Ok(NoteForm));
        let err = builder
            .build(
                Arc::new(MemoryTransport::new()),
                Arc::new(MemorySessionStore::new()),
                resources(),
            )
            .err()
            .unwrap();
        assert!(matches!(err, ConfigurationError::Invalid(_)));
    }

    #[test]
    fn test_pipeline_stages_are_scoped_per_conversation() {
        let mut builder = ApplicationBuilder::new(AppConfig::default());
        builder
            .add_commands(&["hi"], |_| Ok(Greeter { greeting: Arc::new("hi".to_string()) }))
            .add_form("note", |_| Ok(NoteForm))
            .use_error_handler()
            .use_logging()
            .use_forms()
            .use_commands(|_| CommandsOptions::default());
        let driver = builder
            .build(
                Arc::new(MemoryTransport::new()),
                Arc::new(MemorySessionStore::new()),
                resources(),
            )
            .unwrap();
        let container = driver.container();

        let first: Arc<CommandsMiddleware> = container.resolve(ChatId(1)).unwrap();
        let again: Arc<CommandsMiddleware> = container.resolve(ChatId(1)).unwrap();
        let other: Arc<CommandsMiddleware> = container.resolve(ChatId(2)).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));

        container.resolve::<Arc<FormsMiddleware>>(ChatId(1)).unwrap();
        container.resolve::<Arc<LoggingMiddleware>>(ChatId(1)).unwrap();
        container.resolve::<Arc<ErrorHandlerMiddleware>>(ChatId(1)).unwrap();
        assert_eq!(container.scoped_count(ChatId(1)), 4);

        container.release_scope(ChatId(1));
        let rebuilt: Arc<CommandsMiddleware> = container.resolve(ChatId(1)).unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
    }

    #[tokio::test]
    async fn test_built_pipeline_serves_commands_and_forms() {
        let transport = Arc::new(MemoryTransport::new());
        let mut builder = ApplicationBuilder::new(AppConfig::default());
        builder
            .add_singleton(|_| Ok(Arc::new("hello".to_string())))
            .add_commands(&["hi"], |r| {
                Ok(Greeter {
                    greeting: r.resolve::<Arc<String>>()?,
                })
            })
            .add_form("note", |_| Ok(NoteForm))
            .use_error_handler()
            .use_logging()
            .use_forms()
            .use_commands(|_| CommandsOptions::default());
        let driver = builder
            .build(transport.clone(), Arc::new(MemorySessionStore::new()), resources())
            .unwrap();

        for (id, text) in [(1, "/hi there"), (2, "/note"), (3, "buy milk")] {
            driver
                .process_update(Update::message(id, UserId(1), ChatId(3), text))
                .await
                .unwrap();
        }
        let texts = transport.texts();
        assert_eq!(texts[0], "hello there");
        assert_eq!(texts[1], "body");
        assert!(texts[2].contains("body: buy milk"));

        driver
            .process_update(Update::message(4, UserId(1), ChatId(3), "/form_send"))
            .await
            .unwrap();
        assert_eq!(transport.texts().last().unwrap(), "noted buy milk");
        assert!(driver.container().is_registered::<Arc<dyn Transport>>());
    }
}
