//! # Switchboard
//!
//! Conversational dispatch runtime for chat bots. It turns a stream of stateless updates into
//! resumable multi-turn conversations.
//!
//! - Domain: Configuration, Types, Session, Traits
//! - Application: Container, Middleware, Dispatcher, Forms, Pipeline
//! - Infrastructure: Telegram, Console, Resources, Session Stores
//! - Interface: Demo Commands and Forms

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod interface;
pub mod strings;
