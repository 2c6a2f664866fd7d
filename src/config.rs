//! Configuration management with YAML support

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub adapters: HashMap<String, AdapterConfig>,

    #[serde(default)]
    pub redaction: RedactionConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    /// Per-model pricing used by `recall stats` (USD per million tokens).
    #[serde(default)]
    pub pricing: HashMap<String, ModelPrice>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

/// Individual adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub base_path: Option<String>,

    /// Git only: restrict history to this author; defaults to the
    /// repository's configured user.email.
    #[serde(default)]
    pub author: Option<String>,
}

/// Redaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionConfig {
    #[serde(default = "default_enabled")]
    pub redact_secrets: bool,
}

/// Watch coordinator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,

    #[serde(default = "default_rediscover_secs")]
    pub rediscover_secs: u64,

    #[serde(default = "default_pid_path")]
    pub pid_path: String,
}

/// USD per million tokens for one model.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelPrice {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub cache_read: f64,
    #[serde(default)]
    pub cache_write: f64,
}

// Default value functions
fn default_database_path() -> String {
    "~/.local/share/recall/recall.db".to_string()
}

fn default_pid_path() -> String {
    "~/.local/share/recall/watcher.pid".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_poll_secs() -> u64 {
    5
}

fn default_rediscover_secs() -> u64 {
    30
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            redact_secrets: true,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            poll_secs: default_poll_secs(),
            rediscover_secs: default_rediscover_secs(),
            pid_path: default_pid_path(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            adapters: HashMap::new(),
            redaction: RedactionConfig::default(),
            watch: WatchConfig::default(),
            pricing: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    /// Searches in order:
    /// 1. Provided path
    /// 2. ./recall.yaml (current directory)
    /// 3. ~/.config/recall/recall.yaml
    pub fn load(path: &str) -> Result<Self> {
        let search_paths = vec![
            shellexpand::tilde(path).to_string(),
            "recall.yaml".to_string(),
            shellexpand::tilde("~/.config/recall/recall.yaml").to_string(),
        ];

        for search_path in &search_paths {
            if std::path::Path::new(search_path).exists() {
                let content = std::fs::read_to_string(search_path)?;
                let config: Config = serde_yaml::from_str(&content)?;
                return Ok(config);
            }
        }

        // No config file found, use defaults
        Ok(Config::default())
    }

    /// Get the database path, expanding ~ to home directory
    pub fn database_path(&self) -> PathBuf {
        let expanded = shellexpand::tilde(&self.database.path).to_string();
        PathBuf::from(expanded)
    }

    /// Get the watcher PID file path, expanding ~ to home directory
    pub fn pid_path(&self) -> PathBuf {
        let expanded = shellexpand::tilde(&self.watch.pid_path).to_string();
        PathBuf::from(expanded)
    }

    /// Check if an adapter is enabled (default: enabled)
    pub fn is_adapter_enabled(&self, adapter_id: &str) -> bool {
        self.adapters.get(adapter_id).map_or(true, |a| a.enabled)
    }

    /// Get the base path override for an adapter, if configured
    pub fn adapter_path(&self, adapter_id: &str) -> Option<PathBuf> {
        self.adapters
            .get(adapter_id)
            .and_then(|a| a.base_path.as_ref())
            .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
    }

    /// Git authorship scope, if overridden
    pub fn git_author(&self) -> &Option<String> {
        self.adapters
            .get("git")
            .map(|a| &a.author)
            .unwrap_or(&None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.redaction.redact_secrets);
        assert_eq!(config.watch.debounce_ms, 100);
        assert_eq!(config.watch.poll_secs, 5);
        assert_eq!(config.watch.rediscover_secs, 30);
    }

    #[test]
    fn test_adapter_enabled_defaults_true() {
        let config = Config::default();
        assert!(config.is_adapter_enabled("jsonl"));
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
database:
  path: ~/.local/share/recall/test.db

adapters:
  jsonl:
    enabled: true
    base_path: ~/.claude/projects
  plaintext:
    enabled: false
  git:
    author: me@example.com

watch:
  poll_secs: 10

pricing:
  claude-opus-4-6:
    input: 15.0
    output: 75.0
    cache_read: 1.5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.database.path, "~/.local/share/recall/test.db");
        assert!(config.is_adapter_enabled("jsonl"));
        assert!(!config.is_adapter_enabled("plaintext"));
        assert_eq!(config.git_author().as_deref(), Some("me@example.com"));
        assert_eq!(config.watch.poll_secs, 10);
        assert_eq!(config.pricing["claude-opus-4-6"].output, 75.0);
    }
}
