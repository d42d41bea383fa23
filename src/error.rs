//! Error types for toolhost

use thiserror::Error;

/// Main error type for toolhost
#[derive(Error, Debug)]
pub enum ToolhostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Plugin lifecycle errors.
///
/// Every variant that can come out of a load or unload names the plugin it
/// belongs to, so the manager can attribute failures without extra context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("Failed to read plugin directory: {0}")]
    Discovery(String),

    #[error("Failed to import plugin '{plugin}': {reason}")]
    Import { plugin: String, reason: String },

    #[error("Plugin '{plugin}' violates the plugin contract: {reason}")]
    ContractViolation { plugin: String, reason: String },

    #[error("Plugin '{plugin}' {hook} failed: {reason}")]
    HookFailure {
        plugin: String,
        hook: String,
        reason: String,
    },

    #[error("Tool '{tool}' requested by '{requested_by}' is already owned by '{owner}'")]
    RegistryConflict {
        tool: String,
        owner: String,
        requested_by: String,
    },

    #[error("Host rejected tool '{tool}': {reason}")]
    Host { tool: String, reason: String },

    #[error("Plugin not loaded: {0}")]
    NotLoaded(String),
}

impl PluginError {
    /// The plugin a failure is attributed to, when there is one
    pub fn plugin(&self) -> Option<&str> {
        match self {
            PluginError::Import { plugin, .. }
            | PluginError::ContractViolation { plugin, .. }
            | PluginError::HookFailure { plugin, .. } => Some(plugin),
            PluginError::RegistryConflict { requested_by, .. } => Some(requested_by),
            PluginError::NotLoaded(plugin) => Some(plugin),
            PluginError::Discovery(_) | PluginError::Host { .. } => None,
        }
    }

    pub(crate) fn import(plugin: &str, reason: impl Into<String>) -> Self {
        PluginError::Import {
            plugin: plugin.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn contract(plugin: &str, reason: impl Into<String>) -> Self {
        PluginError::ContractViolation {
            plugin: plugin.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn hook(plugin: &str, hook: &str, reason: impl Into<String>) -> Self {
        PluginError::HookFailure {
            plugin: plugin.to_string(),
            hook: hook.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias using ToolhostError
pub type Result<T> = std::result::Result<T, ToolhostError>;
