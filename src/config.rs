//! Configuration loader.
//!
//! Loads configuration from:
//! 1. Default values
//! 2. `~/.claude-plugin-manager/config.yaml` in home directory
//! 3. `.claude-plugin-manager/config.yaml` in project directory
//! 4. Environment variables with `PLUGIN_MANAGER__` prefix

use crate::cache::SqliteCache;
use crate::github::DEFAULT_TIMEOUT_SECS;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Directory holding this tool's own files, relative to home or project
pub const APP_DIR: &str = ".claude-plugin-manager";
const CONFIG_FILE: &str = "config.yaml";
const ENV_PREFIX: &str = "PLUGIN_MANAGER";

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub marketplace: MarketplaceConfig,
    #[serde(default)]
    pub github: GitHubConfig,
}

/// Filesystem locations
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PathsConfig {
    /// Directory containing `.claude/settings.json` (default: home directory)
    #[serde(default)]
    pub claude_home: Option<PathBuf>,
    /// Plugin cache database (default: `~/.claude-plugin-manager/cache.db`)
    #[serde(default)]
    pub database: Option<PathBuf>,
}

impl PathsConfig {
    pub fn claude_home(&self) -> PathBuf {
        self.claude_home
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn database(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(SqliteCache::default_path)
    }
}

/// Marketplace repository to sync from
#[derive(Debug, Deserialize, Clone)]
pub struct MarketplaceConfig {
    #[serde(default = "default_marketplace_id")]
    pub id: String,
    #[serde(default = "default_marketplace_name")]
    pub name: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default = "default_repo")]
    pub repo: String,
    #[serde(default = "default_index_path")]
    pub index_path: String,
}

fn default_marketplace_id() -> String {
    "official".to_string()
}

fn default_marketplace_name() -> String {
    "Official Marketplace".to_string()
}

fn default_owner() -> String {
    "claude-market".to_string()
}

fn default_repo() -> String {
    "marketplace".to_string()
}

fn default_index_path() -> String {
    ".claude-plugin/marketplace.json".to_string()
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            id: default_marketplace_id(),
            name: default_marketplace_name(),
            owner: default_owner(),
            repo: default_repo(),
            index_path: default_index_path(),
        }
    }
}

/// `gh`/`git` subprocess settings
#[derive(Debug, Deserialize, Clone)]
pub struct GitHubConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("marketplace.id", default_marketplace_id())?
        .set_default("marketplace.name", default_marketplace_name())?
        .set_default("marketplace.owner", default_owner())?
        .set_default("marketplace.repo", default_repo())?
        .set_default("marketplace.index_path", default_index_path())?
        .set_default("github.timeout_secs", DEFAULT_TIMEOUT_SECS)
}

fn environment() -> Environment {
    // e.g. PLUGIN_MANAGER__GITHUB__TIMEOUT_SECS=60
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

/// Load configuration from all sources
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let mut builder = with_defaults()?;

    // Home first so the project file can override it
    if let Some(home) = dirs::home_dir() {
        let home_config = home.join(APP_DIR).join(CONFIG_FILE);
        if home_config.exists() {
            builder = builder.add_source(File::from(home_config).required(false));
        }
    }

    let project_config = PathBuf::from(APP_DIR).join(CONFIG_FILE);
    if project_config.exists() {
        builder = builder.add_source(File::from(project_config).required(false));
    }

    builder
        .add_source(environment())
        .build()?
        .try_deserialize()
}

/// Load configuration from one explicit file plus the environment
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    with_defaults()?
        .add_source(File::from(path).required(true))
        .add_source(environment())
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(content: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.marketplace.id, "official");
        assert_eq!(config.marketplace.name, "Official Marketplace");
        assert_eq!(config.marketplace.owner, "claude-market");
        assert_eq!(config.marketplace.repo, "marketplace");
        assert_eq!(config.marketplace.index_path, ".claude-plugin/marketplace.json");
        assert_eq!(config.github.timeout_secs, 30);
        assert!(config.paths.claude_home.is_none());
    }

    #[test]
    fn test_default_paths() {
        let paths = PathsConfig::default();
        assert_eq!(paths.database(), SqliteCache::default_path());
        if let Some(home) = dirs::home_dir() {
            assert_eq!(paths.claude_home(), home);
        }
    }

    #[test]
    fn test_load_config_from_file() {
        let (dir, path) = write_config(
            r#"
paths:
  claude_home: /tmp/claude-home
  database: /tmp/plugins.db
marketplace:
  owner: acme
  repo: plugins
github:
  timeout_secs: 5
"#,
        );

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.paths.claude_home(), PathBuf::from("/tmp/claude-home"));
        assert_eq!(config.paths.database(), PathBuf::from("/tmp/plugins.db"));
        assert_eq!(config.marketplace.owner, "acme");
        assert_eq!(config.marketplace.repo, "plugins");
        // Unset keys keep their defaults
        assert_eq!(config.marketplace.id, "official");
        assert_eq!(config.marketplace.index_path, ".claude-plugin/marketplace.json");
        assert_eq!(config.github.timeout_secs, 5);
        drop(dir);
    }

    #[test]
    fn test_load_config_from_empty_file() {
        let (_dir, path) = write_config("{}\n");
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.marketplace.owner, "claude-market");
        assert_eq!(config.github.timeout_secs, 30);
    }

    #[test]
    fn test_load_config_from_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(load_config_from(&dir.path().join("absent.yaml")).is_err());
    }

    #[test]
    fn test_invalid_value_is_rejected() {
        let (_dir, path) = write_config("github:\n  timeout_secs: soon\n");
        assert!(load_config_from(&path).is_err());
    }
}
