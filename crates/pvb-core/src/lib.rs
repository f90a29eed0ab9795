//! Core domain + application logic for the pipeline validator bot.
//!
//! This crate is framework-agnostic. Telegram and the external validator
//! process live behind ports (traits) implemented in adapter crates.

pub mod audit;
pub mod channels;
pub mod config;
pub mod diagnostics;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod messaging;
pub mod notify;
pub mod pipeline;
pub mod security;
pub mod utils;
pub mod validator;

pub use errors::{Error, Result};
