pub mod config;
pub mod error;
pub mod ipc;
pub mod models;

pub use error::{ErrorCode, ErrorReport, ModelError, Result};
