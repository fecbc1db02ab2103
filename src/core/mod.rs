//! Core application plumbing for inkplug.
//!
//! Configuration shared by the CLI and embedders of the plugin runtime.

mod config;

pub use config::{Config, LoggingConfig, RuntimeConfig};
