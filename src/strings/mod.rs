//! # Strings Module
//!
//! Centralizes fixed user-facing messages and log lines.
//! Localizable text lives in the resource files instead.

pub mod logs;
pub mod messages;
