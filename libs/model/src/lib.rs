//! Shared wire types, error codes and configuration for the robolink
//! gateway processes.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
mod errors;
mod messages;

pub use config::Config;
pub use errors::ErrorCode;
pub use messages::{CallbackMessage, Command, PushMessage, Reply, Status};
