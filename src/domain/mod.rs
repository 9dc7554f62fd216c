//! # Domain Layer
//!
//! Core definitions, types, and traits that define the runtime's business domain.
//! Independent of specific transports, serving as the contract for other layers.

pub mod config;
pub mod errors;
pub mod model;
pub mod session;
pub mod traits;
pub mod types;
