//! # Application Layer
//!
//! The runtime core: dependency injection, the middleware chain, command dispatch,
//! the form engine and the per-update pipeline driver.

pub mod builder;
pub mod container;
pub mod context;
pub mod dispatcher;
pub mod form;
pub mod middleware;
pub mod pipeline;
pub mod result;
