//! # Interface Layer
//!
//! Business command modules and forms served by the runtime.
//! `configure` registers all of them on an [`ApplicationBuilder`] and sets the middleware order.

pub mod commands;

use crate::application::builder::ApplicationBuilder;
use crate::application::dispatcher::{CommandsOptions, UNKNOWN_COMMAND};
use commands::basic::BasicCommands;
use commands::request::{NEW_REQUEST_MODEL, NewRequestForm};

pub fn configure(builder: &mut ApplicationBuilder) {
    builder
        .add_commands(
            &["start", "help", "lang", UNKNOWN_COMMAND],
            |_| Ok(BasicCommands),
        )
        .add_form(NEW_REQUEST_MODEL, |_| Ok(NewRequestForm))
        .use_error_handler()
        .use_logging()
        .use_forms()
        .use_commands(|_| CommandsOptions::default());
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use crate::application::builder::ApplicationBuilder;
    use crate::application::pipeline::PipelineDriver;
    use crate::domain::config::AppConfig;
    use crate::infrastructure::memory::{MemorySessionStore, MemoryTransport};
    use crate::infrastructure::resources::ResourceCatalog;

    /// The demo application over the bundled resources and in-memory adapters.
    pub fn demo_driver(transport: Arc<MemoryTransport>) -> PipelineDriver {
        let mut catalog = ResourceCatalog::default();
        catalog
            .add_strings_yaml(None, include_str!("../../resources/strings.yaml"))
            .unwrap();
        catalog
            .add_strings_yaml(Some("ru"), include_str!("../../resources/strings-ru.yaml"))
            .unwrap();
        catalog
            .add_models_yaml(None, include_str!("../../resources/models.yaml"))
            .unwrap();
        catalog
            .add_models_yaml(Some("ru"), include_str!("../../resources/models-ru.yaml"))
            .unwrap();

        let mut builder = ApplicationBuilder::new(AppConfig::default());
        super::configure(&mut builder);
        builder
            .build(transport, Arc::new(MemorySessionStore::new()), Arc::new(catalog))
            .unwrap()
    }
}
