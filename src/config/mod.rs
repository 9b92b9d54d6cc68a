//! Configuration module for modelvault
//!
//! Loads config from `$XDG_CONFIG_HOME/modelvault/config.toml` or `~/.config/modelvault/config.toml`.
//! Falls back to embedded defaults if file doesn't exist.
//! Partial configs are merged with defaults using serde's default attributes.
//!
//! # Example
//!
//! ```no_run
//! use modelvault::config::Config;
//!
//! let config = Config::load().expect("Failed to load config");
//! println!("Read timeout: {}s", config.download.read_timeout_secs);
//! println!("Max concurrent downloads: {}", config.download.max_concurrent);
//! ```

pub mod schema;

pub use schema::{Config, DownloadConfig, PathsConfig};
