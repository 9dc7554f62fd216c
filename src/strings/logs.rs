//! # Log Strings
//!
//! Startup and shutdown log lines.

pub const STARTING: &str = "Starting switchboard...";

pub fn config_loaded(path: &str) -> String {
    format!("Loaded configuration from {path}")
}

pub fn transport_selected(kind: &str) -> String {
    format!("Using {kind} transport")
}

pub fn session_backend_selected(backend: &str) -> String {
    format!("Storing sessions in {backend}")
}

pub const SHUTDOWN: &str = "Shutting down...";

pub fn shutdown_fail(err: &str) -> String {
    format!("Unable to listen for shutdown signal: {err}")
}
