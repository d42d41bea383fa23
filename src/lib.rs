//! toolhost - plugin and tool registry runtime
//!
//! Loads plugin units into a running host, publishes the tools they expose
//! and reloads them when their source changes, without restarting the host.

pub mod config;
pub mod error;
pub mod logging;
pub mod plugins;

pub use config::Config;
pub use error::{PluginError, Result, ToolhostError};
