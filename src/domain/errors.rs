//! # Error Kinds
//!
//! Typed failures raised by the runtime core. Business handlers return `anyhow::Error`;
//! everything the core itself can fail on is listed here.

use thiserror::Error;

/// Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("transport credential missing: set `transport.token` or the `{0}` environment variable")]
    MissingCredential(String),
    #[error("no command modules registered")]
    NoCommandModules,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Dependency resolution failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContainerError {
    #[error("service `{0}` is not registered")]
    Unregistered(&'static str),
    #[error("cyclic dependency: {}", .0.join(" -> "))]
    Cyclic(Vec<&'static str>),
    #[error("service `{0}` produced an instance of an unexpected type")]
    TypeMismatch(&'static str),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport request failed: {0}")]
    Request(String),
    #[error("transport api error {code}: {description}")]
    Api { code: i64, description: String },
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("session storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session blob could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("session backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("resource `{id}` not found for locale `{locale}`")]
    NotFound { id: String, locale: String },
    #[error("resource file `{file}` is malformed: {reason}")]
    Malformed { file: String, reason: String },
}

/// Wizard input that does not fit the property type. Recoverable: the prompt is re-shown.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("`{input}` is not a valid {expected} for `{property}`")]
pub struct ValidationError {
    pub property: String,
    pub expected: &'static str,
    pub input: String,
}

/// Why a single update could not be processed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("redirect limit of {0} exceeded")]
    RedirectLimitExceeded(usize),
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),
}
