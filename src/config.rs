//! Configuration management for toolhost
//!
//! Handles loading and merging configuration from multiple sources:
//! 1. Compiled defaults
//! 2. System config (/etc/toolhost/config.toml)
//! 3. User config (~/.toolhost/config.toml)
//! 4. CLI-specified config file
//! 5. Environment variables

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub plugins: PluginConfig,
    pub audit: AuditConfig,
    pub watch: WatchConfig,
}

/// What happens when a plugin declares a tool another plugin already owns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Fail the load with a registry conflict
    #[default]
    Reject,
    /// Take over the name and log a warning
    Overwrite,
}

impl std::str::FromStr for CollisionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(CollisionPolicy::Reject),
            "overwrite" => Ok(CollisionPolicy::Overwrite),
            other => Err(ConfigError::Invalid(format!(
                "unknown collision policy '{}', expected reject or overwrite",
                other
            ))),
        }
    }
}

/// Plugin configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Enable plugins
    pub enabled: bool,
    /// Plugin directory
    pub directory: PathBuf,
    /// Load every discovered plugin at startup
    pub auto_load: bool,
    /// Specific plugins to load at startup (overrides auto_load)
    pub load: Vec<String>,
    /// Unit names discovery should never report
    pub exclude: Vec<String>,
    /// Upper bound for initialize/on_load/on_unload, in seconds
    pub hook_timeout: u64,
    /// Upper bound for a single worker call, in seconds
    pub call_timeout: u64,
    /// Cross-plugin tool name collision handling
    pub collision: CollisionPolicy,
}

/// Lifecycle audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Write lifecycle events to the audit log
    pub enabled: bool,
    /// Audit log path
    pub path: PathBuf,
    /// Rotate once the log grows past this many bytes
    pub max_log_size: u64,
    /// Number of rotated files to keep
    pub retention: u32,
    /// Redact secrets from error text before writing
    pub redact_secrets: bool,
}

/// Change polling configuration for the `watch` command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Seconds between change checks
    pub interval_secs: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            enabled: true,
            directory: home.join(".toolhost/plugins"),
            auto_load: true,
            load: vec![],
            exclude: vec![],
            hook_timeout: 30,
            call_timeout: 30,
            collision: CollisionPolicy::Reject,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            enabled: true,
            path: home.join(".toolhost/logs/lifecycle.log"),
            max_log_size: 10 * 1024 * 1024, // 10MB
            retention: 5,
            redact_secrets: true,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { interval_secs: 5 }
    }
}

impl PluginConfig {
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout)
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load(cli_config: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // Load system config
        let system_config = Path::new("/etc/toolhost/config.toml");
        if system_config.exists() {
            debug!("Loading system config from {:?}", system_config);
            config.merge_from_file(system_config)?;
        }

        // Load user config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".toolhost/config.toml");
            if user_config.exists() {
                debug!("Loading user config from {:?}", user_config);
                config.merge_from_file(&user_config)?;
            }
        }

        // Load CLI-specified config
        if let Some(path) = cli_config {
            debug!("Loading CLI config from {:?}", path);
            config.merge_from_file(path)?;
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Merge configuration from a file
    fn merge_from_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;

        let file_config: Config = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;

        self.merge(file_config);
        Ok(())
    }

    /// Merge another config into this one (other takes precedence)
    fn merge(&mut self, other: Config) {
        let plugin_defaults = PluginConfig::default();
        let audit_defaults = AuditConfig::default();

        // Plugin config
        self.plugins.enabled = other.plugins.enabled;
        self.plugins.auto_load = other.plugins.auto_load;
        if other.plugins.directory != plugin_defaults.directory {
            self.plugins.directory = other.plugins.directory;
        }
        if !other.plugins.load.is_empty() {
            self.plugins.load = other.plugins.load;
        }
        if !other.plugins.exclude.is_empty() {
            self.plugins.exclude = other.plugins.exclude;
        }
        if other.plugins.hook_timeout != plugin_defaults.hook_timeout {
            self.plugins.hook_timeout = other.plugins.hook_timeout;
        }
        if other.plugins.call_timeout != plugin_defaults.call_timeout {
            self.plugins.call_timeout = other.plugins.call_timeout;
        }
        if other.plugins.collision != plugin_defaults.collision {
            self.plugins.collision = other.plugins.collision;
        }

        // Audit config - flags always take explicit values
        self.audit.enabled = other.audit.enabled;
        self.audit.redact_secrets = other.audit.redact_secrets;
        if other.audit.path != audit_defaults.path {
            self.audit.path = other.audit.path;
        }
        if other.audit.max_log_size != audit_defaults.max_log_size {
            self.audit.max_log_size = other.audit.max_log_size;
        }
        if other.audit.retention != audit_defaults.retention {
            self.audit.retention = other.audit.retention;
        }

        if other.watch.interval_secs != WatchConfig::default().interval_secs {
            self.watch.interval_secs = other.watch.interval_secs;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(dir) = std::env::var("TOOLHOST_PLUGIN_DIR") {
            self.plugins.directory = PathBuf::from(dir);
        }
        if let Ok(policy) = std::env::var("TOOLHOST_COLLISION") {
            self.plugins.collision = policy.parse()?;
        }
        if let Ok(log) = std::env::var("TOOLHOST_AUDIT_LOG") {
            self.audit.path = PathBuf::from(log);
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plugins.directory.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("plugins.directory".to_string()));
        }
        if self.plugins.hook_timeout == 0 {
            return Err(ConfigError::Invalid(
                "plugins.hook_timeout must be at least 1 second".to_string(),
            ));
        }
        if self.plugins.call_timeout == 0 {
            return Err(ConfigError::Invalid(
                "plugins.call_timeout must be at least 1 second".to_string(),
            ));
        }
        if self.watch.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "watch.interval_secs must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.plugins.enabled);
        assert_eq!(config.plugins.collision, CollisionPolicy::Reject);
        assert_eq!(config.plugins.hook_timeout(), Duration::from_secs(30));
        assert!(config.audit.redact_secrets);
    }

    #[test]
    fn test_config_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = Config::default();
        config.plugins.hook_timeout = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.watch.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
            [plugins]
            directory = "/srv/plugins"
            exclude = ["scratch"]
            collision = "overwrite"
            hook_timeout = 5

            [audit]
            enabled = false

            [watch]
            interval_secs = 2
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.plugins.directory, PathBuf::from("/srv/plugins"));
        assert_eq!(config.plugins.exclude, vec!["scratch".to_string()]);
        assert_eq!(config.plugins.collision, CollisionPolicy::Overwrite);
        assert_eq!(config.plugins.hook_timeout, 5);
        assert_eq!(config.plugins.call_timeout, 30);
        assert!(!config.audit.enabled);
        assert_eq!(config.watch.interval_secs, 2);
    }

    #[test]
    fn test_merge_keeps_unset_values() {
        let mut config = Config::default();
        let other: Config = toml::from_str(
            r#"
            [plugins]
            load = ["alpha"]
        "#,
        )
        .unwrap();

        config.merge(other);
        assert_eq!(config.plugins.load, vec!["alpha".to_string()]);
        assert_eq!(config.plugins.directory, PluginConfig::default().directory);
        assert_eq!(config.plugins.collision, CollisionPolicy::Reject);
    }

    #[test]
    fn test_merge_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[plugins]\ncall_timeout = 7\n").unwrap();

        let mut config = Config::default();
        config.merge_from_file(&path).unwrap();
        assert_eq!(config.plugins.call_timeout, 7);

        std::fs::write(&path, "[plugins\n").unwrap();
        assert!(matches!(
            config.merge_from_file(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_collision_policy_from_str() {
        assert_eq!(
            "Overwrite".parse::<CollisionPolicy>().unwrap(),
            CollisionPolicy::Overwrite
        );
        assert!("maybe".parse::<CollisionPolicy>().is_err());
    }
}
