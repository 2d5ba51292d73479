//! Claude settings file access with backup-before-write.
//!
//! Settings live in `.claude/settings.json`, either under the user's home
//! (global scope) or under a project directory. Only `mcpServers` is modeled;
//! every other key round-trips untouched.
//!
//! Every write first copies the existing file to `settings.json.bak`, so a
//! failed install can put the previous file back with
//! [`SettingsStore::restore_from_backup`].

use crate::plugins::McpServerComponent;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

const CLAUDE_DIR: &str = ".claude";
const SETTINGS_FILE: &str = "settings.json";
const BACKUP_SUFFIX: &str = ".bak";
const MCP_SERVERS_KEY: &str = "mcpServers";

/// Parsed contents of a Claude settings file.
///
/// The whole document is kept in file order so a read-modify-write only
/// changes the entries it touches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaudeSettings {
    pub document: Map<String, Value>,
}

impl ClaudeSettings {
    fn servers(&self) -> Option<&Map<String, Value>> {
        self.document.get(MCP_SERVERS_KEY).and_then(Value::as_object)
    }

    /// Names under `mcpServers`, in file order
    pub fn mcp_server_names(&self) -> Vec<&str> {
        self.servers()
            .map(|servers| servers.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Typed view of one server entry
    pub fn mcp_server(&self, name: &str) -> Option<McpServerConfig> {
        let entry = self.servers()?.get(name)?;
        serde_json::from_value(entry.clone()).ok()
    }

    /// Insert a server, replacing a same-named entry in place. Returns true
    /// when an entry was replaced.
    pub fn upsert_mcp_server(
        &mut self,
        name: &str,
        server: &McpServerConfig,
    ) -> Result<bool, SettingsError> {
        let value = serde_json::to_value(server)?;
        let servers = self
            .document
            .entry(MCP_SERVERS_KEY)
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or(SettingsError::InvalidServers)?;
        Ok(servers.insert(name.to_string(), value).is_some())
    }

    /// Remove a server, keeping the remaining entries in order
    pub fn remove_mcp_server(&mut self, name: &str) -> bool {
        self.document
            .get_mut(MCP_SERVERS_KEY)
            .and_then(Value::as_object_mut)
            .is_some_and(|servers| servers.shift_remove(name).is_some())
    }
}

/// An MCP server entry in the settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl From<&McpServerComponent> for McpServerConfig {
    fn from(component: &McpServerComponent) -> Self {
        Self {
            command: component.command.clone(),
            args: component.args.clone(),
            env: component.env.clone(),
            extra: Map::new(),
        }
    }
}

/// Which settings file to operate on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsScope {
    /// `~/.claude/settings.json`
    Global,
    /// `<project>/.claude/settings.json`
    Project(PathBuf),
}

/// Errors writing a settings file
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Overwriting the settings file itself failed
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("\"mcpServers\" in settings is not an object")]
    InvalidServers,
}

impl SettingsError {
    /// True when the settings file may already differ from before the write
    pub fn file_modified(&self) -> bool {
        matches!(self, SettingsError::Write { .. })
    }
}

/// Storage for Claude settings files
pub trait SettingsStore: Send + Sync {
    /// Path of the settings file for a scope
    fn settings_path(&self, scope: &SettingsScope) -> PathBuf;

    /// Read settings. Missing or malformed files yield empty settings.
    fn read(&self, scope: &SettingsScope) -> ClaudeSettings;

    /// Back up the current file, then overwrite it
    fn write(&self, scope: &SettingsScope, settings: &ClaudeSettings)
        -> Result<(), SettingsError>;

    /// Copy the backup over the settings file. Returns false if there is no
    /// backup or the copy failed.
    fn restore_from_backup(&self, scope: &SettingsScope) -> bool;
}

/// Path of the backup sibling for a settings file
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// File-backed settings store. All operations share one lock.
pub struct JsonSettingsStore {
    /// Directory containing the global `.claude` directory
    base_path: PathBuf,
    file_lock: Mutex<()>,
}

impl JsonSettingsStore {
    /// Store rooted at the user's home directory
    pub fn new() -> Self {
        let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::with_base_path(base)
    }

    /// Store rooted at a custom directory (global file is `<base>/.claude/settings.json`)
    pub fn with_base_path(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            file_lock: Mutex::new(()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.file_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_file(path: &Path) -> ClaudeSettings {
        if !path.exists() {
            return ClaudeSettings::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Option<ClaudeSettings>>(&content) {
                Ok(settings) => settings.unwrap_or_default(),
                Err(e) => {
                    warn!(path = ?path, error = %e, "Malformed settings file, using empty settings");
                    ClaudeSettings::default()
                }
            },
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read settings file");
                ClaudeSettings::default()
            }
        }
    }

    fn write_file(path: &Path, settings: &ClaudeSettings) -> Result<(), SettingsError> {
        let io_err = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };

        let json = serde_json::to_string_pretty(settings)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        if path.exists() {
            let backup = backup_path(path);
            fs::copy(path, &backup).map_err(io_err)?;
            debug!(backup = ?backup, "Backed up settings file");
        }

        fs::write(path, json).map_err(|source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = ?path, "Wrote settings file");
        Ok(())
    }
}

impl Default for JsonSettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsStore for JsonSettingsStore {
    fn settings_path(&self, scope: &SettingsScope) -> PathBuf {
        let root = match scope {
            SettingsScope::Global => self.base_path.as_path(),
            SettingsScope::Project(project) => project.as_path(),
        };
        root.join(CLAUDE_DIR).join(SETTINGS_FILE)
    }

    fn read(&self, scope: &SettingsScope) -> ClaudeSettings {
        let path = self.settings_path(scope);
        let _guard = self.lock();
        Self::read_file(&path)
    }

    fn write(
        &self,
        scope: &SettingsScope,
        settings: &ClaudeSettings,
    ) -> Result<(), SettingsError> {
        let path = self.settings_path(scope);
        let _guard = self.lock();
        Self::write_file(&path, settings)
    }

    fn restore_from_backup(&self, scope: &SettingsScope) -> bool {
        let path = self.settings_path(scope);
        let backup = backup_path(&path);
        let _guard = self.lock();

        if !backup.exists() {
            return false;
        }
        match fs::copy(&backup, &path) {
            Ok(_) => {
                info!(path = ?path, "Restored settings from backup");
                true
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to restore settings from backup");
                false
            }
        }
    }
}
