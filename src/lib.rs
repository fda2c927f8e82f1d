#![forbid(unsafe_code)]

//! `agent-conduit`: drives a coding-agent CLI over its NDJSON stdio protocol.

pub mod args;
pub mod config;
pub mod control;
pub mod discovery;
pub mod env;
pub mod errors;
pub mod launcher;
pub mod permission;
pub mod process;
pub mod protocol;
pub mod query;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
