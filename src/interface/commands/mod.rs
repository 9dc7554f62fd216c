//! # Command Handlers
//!
//! Contains the command modules and forms for each supported command (e.g., /start, /help,
//! /new_request). These are invoked by the dispatcher and the form engine.

pub mod basic;
pub mod request;
