//! # Main Entry Point
//!
//! Initializes the application:
//! - Domain: Configuration
//! - Infrastructure: Transport, Session Store, Resources
//! - Application: Builder, Pipeline Driver
//! - Interface: Demo Commands and Forms
//!

use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use switchboard::application::builder::ApplicationBuilder;
use switchboard::domain::config::{AppConfig, LoggingConfig, SessionBackend, SessionsConfig, TransportKind};
use switchboard::domain::errors::ConfigurationError;
use switchboard::domain::traits::{SessionStore, Transport};
use switchboard::infrastructure::console::ConsoleTransport;
use switchboard::infrastructure::memory::MemorySessionStore;
use switchboard::infrastructure::resources::ResourceCatalog;
use switchboard::infrastructure::store::FileSessionStore;
use switchboard::infrastructure::telegram::TelegramTransport;
use switchboard::interface;
use switchboard::strings::logs;

#[derive(Debug, Parser)]
#[command(version, about = "Conversational dispatch runtime")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "data/config.yaml")]
    config: String,

    /// Talk to the bot on stdin/stdout instead of the configured transport
    #[arg(long)]
    console: bool,
}

/// Sets up file logging (cleared on every start) plus stdout unless stdout is the chat.
fn init_logging(config: &LoggingConfig, stdout: bool) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let dir = Path::new(&config.dir);
    if !dir.exists() {
        fs::create_dir_all(dir).context("Failed to create log directory")?;
    }

    // Clear previous session log
    let log_path = dir.join(&config.file);
    if log_path.exists() {
        let _ = fs::remove_file(&log_path);
    }

    let file_appender = tracing_appender::rolling::never(dir, &config.file);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.filter));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    let console_layer = stdout.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stdout));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();
    Ok(guard)
}

async fn session_store(config: &SessionsConfig) -> Result<Arc<dyn SessionStore>> {
    tracing::info!("{}", logs::session_backend_selected(&format!("{:?}", config.backend)));
    match config.backend {
        SessionBackend::File => Ok(Arc::new(FileSessionStore::open(&config.path).await?)),
        SessionBackend::Memory => Ok(Arc::new(MemorySessionStore::new())),
        SessionBackend::Redis => redis_store(config).await,
    }
}

#[cfg(feature = "redis")]
async fn redis_store(config: &SessionsConfig) -> Result<Arc<dyn SessionStore>> {
    use switchboard::infrastructure::redis_store::RedisSessionStore;

    let url = config.redis_url.as_deref().ok_or_else(|| {
        ConfigurationError::Invalid("sessions.redis_url is required for the redis backend".to_string())
    })?;
    Ok(Arc::new(
        RedisSessionStore::connect(url, config.redis_prefix.clone()).await?,
    ))
}

#[cfg(not(feature = "redis"))]
async fn redis_store(_config: &SessionsConfig) -> Result<Arc<dyn SessionStore>> {
    Err(ConfigurationError::Invalid(
        "the redis session backend needs a build with the `redis` feature".to_string(),
    )
    .into())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load Configuration
    let mut config = AppConfig::load(&cli.config)?;
    if cli.console {
        config.transport.kind = TransportKind::Console;
    }
    let console = config.transport.kind == TransportKind::Console;

    // 2. Logging Setup
    let _guard = init_logging(&config.logging, !console)?;
    tracing::info!("{}", logs::STARTING);
    tracing::info!("{}", logs::config_loaded(&cli.config));

    // 3. Initialize Infrastructure
    let transport: Arc<dyn Transport> = if console {
        Arc::new(ConsoleTransport::new())
    } else {
        Arc::new(TelegramTransport::new(&config.transport)?)
    };
    tracing::info!(
        "{}",
        logs::transport_selected(if console { "console" } else { "telegram" })
    );
    let store = session_store(&config.sessions).await?;
    let resources = Arc::new(
        ResourceCatalog::load_dir(&config.resources.dir).context("Failed to load resources")?,
    );

    // 4. Build the Pipeline
    let mut builder = ApplicationBuilder::new(config);
    interface::configure(&mut builder);
    let driver = builder.build(transport, store, resources)?;

    // 5. Run until the transport closes or Ctrl+C
    tokio::select! {
        result = driver.run() => result?,
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => tracing::info!("{}", logs::SHUTDOWN),
            Err(e) => tracing::error!("{}", logs::shutdown_fail(&e.to_string())),
        },
    }
    Ok(())
}
