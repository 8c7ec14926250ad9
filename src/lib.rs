#![forbid(unsafe_code)]

pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod history;
pub mod models;
pub mod orchestrator;
pub mod runtime;
pub mod session;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
