//! # Infrastructure Layer
//!
//! Handles interactions with external systems and services.
//! Implements the traits defined in the Domain layer (Transport, SessionStore, ResourceProvider).

pub mod console;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod resources;
pub mod store;
pub mod telegram;
