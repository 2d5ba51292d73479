//! Plugin install/uninstall transactions and update detection.
//!
//! Installing a plugin projects its components into the global Claude
//! settings file and records a [`ChangeSnapshot`] of exactly which entries were
//! added. Uninstalling removes precisely those entries, never anything found
//! by diffing or name matching.
//!
//! Only MCP server plugins change the settings file today. Hook plugins record
//! their names in the snapshot; slash commands, agents and skills are accepted
//! but inert.

use crate::cache::PluginCache;
use crate::plugins::{
    CachedPlugin, ChangeSnapshot, ComponentBundle, InstalledPlugin, InstalledPluginWithUpdate,
    PluginType,
};
use crate::settings::{
    ClaudeSettings, McpServerConfig, SettingsError, SettingsScope, SettingsStore,
};
use crate::version;
use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Errors returned by install and uninstall
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Plugin '{0}' is already installed.")]
    AlreadyInstalled(String),

    #[error("Plugin '{0}' is not installed.")]
    NotInstalled(String),

    #[error("Plugin has no components to install.")]
    NoComponents,

    #[error("Failed to parse plugin components: {0}")]
    ComponentParse(String),

    #[error("Installation failed: {0}")]
    InstallFailed(String),

    #[error("Uninstallation failed: {0}")]
    UninstallFailed(String),
}

impl LifecycleError {
    /// True for failures writing settings or tracking rows
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, Self::InstallFailed(_) | Self::UninstallFailed(_))
    }
}

pub type InstallResult = Result<(), LifecycleError>;
pub type UninstallResult = Result<(), LifecycleError>;

/// A failed transition step and whether the settings file had already been
/// changed by it
#[derive(Debug)]
struct StepFailure {
    message: String,
    settings_changed: bool,
}

impl StepFailure {
    fn before_write(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            settings_changed: false,
        }
    }

    fn after_write(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            settings_changed: true,
        }
    }

    fn from_write(error: SettingsError) -> Self {
        Self {
            settings_changed: error.file_modified(),
            message: error.to_string(),
        }
    }
}

/// Orchestrates plugin installs against the settings file and the cache
pub struct PluginLifecycleManager {
    settings: Arc<dyn SettingsStore>,
    cache: Arc<dyn PluginCache>,
    /// Serialises install/uninstall so the installed check and the tracking
    /// insert can't interleave across threads
    transition_lock: Mutex<()>,
}

impl PluginLifecycleManager {
    pub fn new(settings: Arc<dyn SettingsStore>, cache: Arc<dyn PluginCache>) -> Self {
        Self {
            settings,
            cache,
            transition_lock: Mutex::new(()),
        }
    }

    /// Install a cached marketplace plugin into the global settings
    pub fn install_global(&self, plugin: &CachedPlugin) -> InstallResult {
        let _guard = self
            .transition_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match self.cache.get_installed(&plugin.id) {
            Ok(Some(_)) => return Err(LifecycleError::AlreadyInstalled(plugin.name.clone())),
            Ok(None) => {}
            Err(e) => return Err(LifecycleError::InstallFailed(format!("{:#}", e))),
        }

        let components = match plugin.components.as_deref() {
            Some(c) if !c.is_empty() => c,
            _ => return Err(LifecycleError::NoComponents),
        };
        let bundle = ComponentBundle::parse(components)
            .map_err(|e| LifecycleError::ComponentParse(e.to_string()))?
            .ok_or(LifecycleError::NoComponents)?;

        let scope = SettingsScope::Global;
        match self.apply_install(plugin, &bundle, &scope) {
            Ok(()) => {
                info!(plugin = %plugin.id, version = ?plugin.version, "Installed plugin");
                Ok(())
            }
            Err(failure) => {
                warn!(plugin = %plugin.id, error = %failure.message, "Install failed");
                self.roll_back(&scope, &failure);
                Err(LifecycleError::InstallFailed(failure.message))
            }
        }
    }

    fn apply_install(
        &self,
        plugin: &CachedPlugin,
        bundle: &ComponentBundle,
        scope: &SettingsScope,
    ) -> Result<(), StepFailure> {
        let mut settings = self.settings.read(scope);
        let snapshot = apply_components(&mut settings, bundle, plugin.plugin_type)
            .map_err(|e| StepFailure::before_write(e.to_string()))?;
        let snapshot_json = snapshot
            .to_json()
            .map_err(|e| StepFailure::before_write(e.to_string()))?;

        self.settings
            .write(scope, &settings)
            .map_err(StepFailure::from_write)?;

        self.cache
            .insert_installed(&InstalledPlugin {
                id: plugin.id.clone(),
                name: plugin.name.clone(),
                version: plugin.version.clone(),
                plugin_type: plugin.plugin_type,
                marketplace_id: plugin.marketplace_id.clone(),
                config_snapshot: Some(snapshot_json),
                installed_at: Utc::now(),
            })
            .map_err(|e| StepFailure::after_write(format!("{:#}", e)))
    }

    /// Remove an installed plugin's entries from the global settings
    pub fn uninstall_global(&self, plugin_id: &str) -> UninstallResult {
        let _guard = self
            .transition_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let installed = match self.cache.get_installed(plugin_id) {
            Ok(Some(row)) => row,
            Ok(None) => return Err(LifecycleError::NotInstalled(plugin_id.to_string())),
            Err(e) => return Err(LifecycleError::UninstallFailed(format!("{:#}", e))),
        };

        let scope = SettingsScope::Global;
        match self.apply_uninstall(&installed, &scope) {
            Ok(()) => {
                info!(plugin = %plugin_id, "Uninstalled plugin");
                Ok(())
            }
            Err(failure) => {
                warn!(plugin = %plugin_id, error = %failure.message, "Uninstall failed");
                self.roll_back(&scope, &failure);
                Err(LifecycleError::UninstallFailed(failure.message))
            }
        }
    }

    fn apply_uninstall(
        &self,
        installed: &InstalledPlugin,
        scope: &SettingsScope,
    ) -> Result<(), StepFailure> {
        let mut settings = self.settings.read(scope);

        if let Some(raw) = installed.config_snapshot.as_deref().filter(|s| !s.is_empty()) {
            let snapshot = ChangeSnapshot::from_json(raw)
                .map_err(|e| StepFailure::before_write(e.to_string()))?;
            remove_components(&mut settings, &snapshot, installed.plugin_type);
        }

        self.settings
            .write(scope, &settings)
            .map_err(StepFailure::from_write)?;

        self.cache
            .delete_installed(&installed.id)
            .map(|_| ())
            .map_err(|e| StepFailure::after_write(format!("{:#}", e)))
    }

    /// Put the backup back, but only over a file this transition changed. The
    /// backup of an untouched file predates earlier installs.
    fn roll_back(&self, scope: &SettingsScope, failure: &StepFailure) {
        if !failure.settings_changed {
            debug!("Settings untouched, nothing to roll back");
            return;
        }
        if self.settings.restore_from_backup(scope) {
            info!("Restored settings from backup");
        } else {
            warn!("No settings backup restored");
        }
    }

    /// All installed plugins, most recent install first
    pub fn installed_global(&self) -> anyhow::Result<Vec<InstalledPlugin>> {
        self.cache.list_installed()
    }

    /// Installed plugins joined with the marketplace's cached versions
    pub fn installed_with_updates(&self) -> anyhow::Result<Vec<InstalledPluginWithUpdate>> {
        Ok(self
            .cache
            .list_installed_with_available()?
            .into_iter()
            .map(|(installed, available_version)| {
                let has_update =
                    version::is_newer(available_version.as_deref(), installed.version.as_deref());
                InstalledPluginWithUpdate {
                    installed,
                    available_version,
                    has_update,
                }
            })
            .collect())
    }

    pub fn is_installed(&self, plugin_id: &str) -> anyhow::Result<bool> {
        Ok(self.cache.get_installed(plugin_id)?.is_some())
    }
}

/// Project a bundle into settings and record what was added
fn apply_components(
    settings: &mut ClaudeSettings,
    bundle: &ComponentBundle,
    plugin_type: PluginType,
) -> Result<ChangeSnapshot, SettingsError> {
    let mut snapshot = ChangeSnapshot::default();

    match plugin_type {
        PluginType::McpServer => {
            for (name, server) in bundle.mcp_servers.iter() {
                if settings.upsert_mcp_server(name, &McpServerConfig::from(server))? {
                    debug!(server = %name, "Replacing existing MCP server entry");
                }
                snapshot.mcp_server_names.push(name.to_string());
            }
        }
        PluginType::Hook => {
            // Hooks are tracked but not yet written to settings
            snapshot
                .hook_names
                .extend(bundle.hooks.names().map(String::from));
        }
        PluginType::SlashCommand | PluginType::Agent | PluginType::Skill => {}
    }

    Ok(snapshot)
}

/// Remove exactly the snapshot's entries. Missing names are ignored.
fn remove_components(
    settings: &mut ClaudeSettings,
    snapshot: &ChangeSnapshot,
    plugin_type: PluginType,
) {
    match plugin_type {
        PluginType::McpServer => {
            for name in &snapshot.mcp_server_names {
                settings.remove_mcp_server(name);
            }
        }
        PluginType::Hook
        | PluginType::SlashCommand
        | PluginType::Agent
        | PluginType::Skill => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteCache;
    use crate::settings::{backup_path, JsonSettingsStore};
    use serde_json::{json, Value};
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        settings: Arc<JsonSettingsStore>,
        cache: Arc<SqliteCache>,
        manager: PluginLifecycleManager,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let settings = Arc::new(JsonSettingsStore::with_base_path(dir.path()));
        let cache = Arc::new(SqliteCache::open_in_memory().unwrap());
        let manager = PluginLifecycleManager::new(settings.clone(), cache.clone());
        Fixture {
            _dir: dir,
            settings,
            cache,
            manager,
        }
    }

    impl Fixture {
        fn settings_json(&self) -> Value {
            let path = self.settings.settings_path(&SettingsScope::Global);
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
        }

        fn seed_settings(&self, value: Value) {
            let path = self.settings.settings_path(&SettingsScope::Global);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
        }
    }

    fn mcp_plugin(name: &str, servers: &[&str]) -> CachedPlugin {
        let servers: serde_json::Map<String, Value> = servers
            .iter()
            .map(|s| {
                (
                    s.to_string(),
                    json!({"command": "npx", "args": ["-y", format!("@mcp/{}", s)], "env": {}}),
                )
            })
            .collect();
        CachedPlugin {
            id: format!("official/{}", name),
            name: name.to_string(),
            description: None,
            version: Some("1.0.0".to_string()),
            author: None,
            repository: None,
            marketplace_id: "official".to_string(),
            plugin_type: PluginType::McpServer,
            tags: None,
            dependencies: None,
            config_schema: None,
            components: Some(json!({ "mcpServers": servers }).to_string()),
            cached_at: Utc::now(),
        }
    }

    #[test]
    fn test_install_adds_servers_to_settings() {
        let fx = fixture();
        fx.manager
            .install_global(&mcp_plugin("github", &["github"]))
            .unwrap();

        let settings = fx.settings_json();
        assert_eq!(settings["mcpServers"]["github"]["command"], "npx");
        assert_eq!(settings["mcpServers"]["github"]["args"][1], "@mcp/github");
    }

    #[test]
    fn test_install_tracks_plugin_with_snapshot() {
        let fx = fixture();
        fx.manager
            .install_global(&mcp_plugin("multi", &["one", "two"]))
            .unwrap();

        let row = fx.cache.get_installed("official/multi").unwrap().unwrap();
        assert_eq!(row.name, "multi");
        assert_eq!(row.version.as_deref(), Some("1.0.0"));
        assert_eq!(row.plugin_type, PluginType::McpServer);
        let snapshot = ChangeSnapshot::from_json(row.config_snapshot.as_deref().unwrap()).unwrap();
        assert_eq!(snapshot.mcp_server_names, vec!["one", "two"]);
        assert!(fx.manager.is_installed("official/multi").unwrap());
    }

    #[test]
    fn test_install_twice_fails_without_touching_settings() {
        let fx = fixture();
        let plugin = mcp_plugin("dup", &["dup"]);
        fx.manager.install_global(&plugin).unwrap();
        let before = fx.settings_json();

        let err = fx.manager.install_global(&plugin).unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyInstalled(_)));
        assert_eq!(err.to_string(), "Plugin 'dup' is already installed.");
        assert_eq!(fx.settings_json(), before);
    }

    #[test]
    fn test_install_without_components_fails() {
        let fx = fixture();
        let mut plugin = mcp_plugin("empty", &[]);

        plugin.components = None;
        assert!(matches!(
            fx.manager.install_global(&plugin),
            Err(LifecycleError::NoComponents)
        ));

        plugin.components = Some(String::new());
        assert!(matches!(
            fx.manager.install_global(&plugin),
            Err(LifecycleError::NoComponents)
        ));

        plugin.components = Some("null".to_string());
        assert!(matches!(
            fx.manager.install_global(&plugin),
            Err(LifecycleError::NoComponents)
        ));

        assert!(!fx.manager.is_installed("official/empty").unwrap());
        assert!(!fx.settings.settings_path(&SettingsScope::Global).exists());
    }

    #[test]
    fn test_install_with_malformed_components_fails() {
        let fx = fixture();
        let mut plugin = mcp_plugin("broken", &[]);
        plugin.components = Some("{\"mcpServers\": [".to_string());

        let err = fx.manager.install_global(&plugin).unwrap_err();
        assert!(matches!(err, LifecycleError::ComponentParse(_)));
        assert!(err.to_string().starts_with("Failed to parse plugin components"));
        assert!(!fx.settings.settings_path(&SettingsScope::Global).exists());
    }

    #[test]
    fn test_install_then_uninstall_restores_prior_settings() {
        let fx = fixture();
        let original = json!({
            "theme": "dark",
            "permissions": {"allow": ["Read"]},
            "mcpServers": {
                "existing": {"command": "existing-cmd", "timeout": 10}
            }
        });
        fx.seed_settings(original.clone());

        fx.manager
            .install_global(&mcp_plugin("pair", &["alpha", "beta"]))
            .unwrap();
        let installed = fx.settings_json();
        assert_eq!(installed["mcpServers"].as_object().unwrap().len(), 3);
        assert_eq!(installed["theme"], "dark");

        fx.manager.uninstall_global("official/pair").unwrap();
        assert_eq!(fx.settings_json(), original);
        assert!(!fx.manager.is_installed("official/pair").unwrap());
    }

    #[test]
    fn test_install_overwrites_same_named_server() {
        let fx = fixture();
        fx.seed_settings(json!({"mcpServers": {"shared": {"command": "old"}}}));

        fx.manager
            .install_global(&mcp_plugin("shared", &["shared"]))
            .unwrap();
        assert_eq!(fx.settings_json()["mcpServers"]["shared"]["command"], "npx");
    }

    #[test]
    fn test_uninstall_tolerates_missing_entries() {
        let fx = fixture();
        fx.manager
            .install_global(&mcp_plugin("gone", &["a", "b"]))
            .unwrap();
        fx.seed_settings(json!({"mcpServers": {"a": {"command": "npx"}, "other": {}}}));

        fx.manager.uninstall_global("official/gone").unwrap();
        assert_eq!(fx.settings_json(), json!({"mcpServers": {"other": {}}}));
    }

    #[test]
    fn test_uninstall_not_installed() {
        let fx = fixture();
        let err = fx.manager.uninstall_global("official/nope").unwrap_err();
        assert!(matches!(err, LifecycleError::NotInstalled(_)));
        assert_eq!(err.to_string(), "Plugin 'official/nope' is not installed.");
    }

    #[test]
    fn test_hook_plugin_records_names_only() {
        let fx = fixture();
        fx.seed_settings(json!({"hooks": {"PreToolUse": []}}));
        let mut plugin = mcp_plugin("hooky", &[]);
        plugin.plugin_type = PluginType::Hook;
        plugin.components =
            Some(json!({"hooks": {"lint": {"matcher": "Write", "script": "lint.sh"}}}).to_string());

        fx.manager.install_global(&plugin).unwrap();
        assert_eq!(fx.settings_json(), json!({"hooks": {"PreToolUse": []}}));

        let row = fx.cache.get_installed("official/hooky").unwrap().unwrap();
        let snapshot = ChangeSnapshot::from_json(row.config_snapshot.as_deref().unwrap()).unwrap();
        assert_eq!(snapshot.hook_names, vec!["lint"]);

        fx.manager.uninstall_global("official/hooky").unwrap();
        assert_eq!(fx.settings_json(), json!({"hooks": {"PreToolUse": []}}));
    }

    #[test]
    fn test_inert_types_install_with_empty_snapshot() {
        let fx = fixture();
        let mut plugin = mcp_plugin("skill", &["ignored"]);
        plugin.plugin_type = PluginType::Skill;

        fx.manager.install_global(&plugin).unwrap();
        assert!(fx.settings_json().get("mcpServers").is_none());
        let row = fx.cache.get_installed("official/skill").unwrap().unwrap();
        assert!(ChangeSnapshot::from_json(row.config_snapshot.as_deref().unwrap())
            .unwrap()
            .is_empty());
    }

    /// Settings store whose writes can be made to fail, either before the
    /// file is touched or after it has been half written
    struct FlakySettings {
        inner: JsonSettingsStore,
        fail_writes: AtomicBool,
        tear_writes: AtomicBool,
    }

    impl FlakySettings {
        fn new(base: &std::path::Path) -> Self {
            Self {
                inner: JsonSettingsStore::with_base_path(base),
                fail_writes: AtomicBool::new(false),
                tear_writes: AtomicBool::new(false),
            }
        }
    }

    impl SettingsStore for FlakySettings {
        fn settings_path(&self, scope: &SettingsScope) -> std::path::PathBuf {
            self.inner.settings_path(scope)
        }

        fn read(&self, scope: &SettingsScope) -> ClaudeSettings {
            self.inner.read(scope)
        }

        fn write(
            &self,
            scope: &SettingsScope,
            settings: &ClaudeSettings,
        ) -> Result<(), SettingsError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(SettingsError::Io {
                    path: self.settings_path(scope),
                    source: std::io::Error::other("disk full"),
                });
            }
            if self.tear_writes.load(Ordering::SeqCst) {
                // Back up like a real write, then leave a truncated file
                let path = self.settings_path(scope);
                if path.exists() {
                    fs::copy(&path, backup_path(&path)).unwrap();
                }
                fs::write(&path, "{\"mcpSer").unwrap();
                return Err(SettingsError::Write {
                    path,
                    source: std::io::Error::other("disk full"),
                });
            }
            self.inner.write(scope, settings)
        }

        fn restore_from_backup(&self, scope: &SettingsScope) -> bool {
            self.inner.restore_from_backup(scope)
        }
    }

    #[test]
    fn test_write_failure_leaves_no_tracking_row() {
        let dir = TempDir::new().unwrap();
        let settings = Arc::new(FlakySettings::new(dir.path()));
        settings.fail_writes.store(true, Ordering::SeqCst);
        let cache = Arc::new(SqliteCache::open_in_memory().unwrap());
        let manager = PluginLifecycleManager::new(settings.clone(), cache.clone());

        let err = manager
            .install_global(&mcp_plugin("flaky", &["flaky"]))
            .unwrap_err();
        assert!(err.is_persistence_failure());
        assert!(err.to_string().contains("disk full"));
        assert!(!manager.is_installed("official/flaky").unwrap());
    }

    #[test]
    fn test_uninstall_write_failure_keeps_tracking_row() {
        let dir = TempDir::new().unwrap();
        let settings = Arc::new(FlakySettings::new(dir.path()));
        let cache = Arc::new(SqliteCache::open_in_memory().unwrap());
        let manager = PluginLifecycleManager::new(settings.clone(), cache.clone());
        manager
            .install_global(&mcp_plugin("sticky", &["sticky"]))
            .unwrap();

        settings.fail_writes.store(true, Ordering::SeqCst);
        let err = manager.uninstall_global("official/sticky").unwrap_err();
        assert!(matches!(err, LifecycleError::UninstallFailed(_)));
        assert!(manager.is_installed("official/sticky").unwrap());
    }

    fn read_servers(path: &std::path::Path) -> Vec<String> {
        let value: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        value["mcpServers"]
            .as_object()
            .map(|servers| servers.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_failed_uninstall_before_write_keeps_other_plugins() {
        let fx = fixture();
        fx.seed_settings(json!({"mcpServers": {"keep": {"command": "k"}}}));
        fx.manager.install_global(&mcp_plugin("b", &["b"])).unwrap();

        // A row whose snapshot can't be decoded fails before any write
        fx.cache
            .insert_installed(&InstalledPlugin {
                id: "official/bad".to_string(),
                name: "bad".to_string(),
                version: None,
                plugin_type: PluginType::McpServer,
                marketplace_id: "official".to_string(),
                config_snapshot: Some("{corrupt".to_string()),
                installed_at: Utc::now(),
            })
            .unwrap();

        let err = fx.manager.uninstall_global("official/bad").unwrap_err();
        assert!(matches!(err, LifecycleError::UninstallFailed(_)));

        let path = fx.settings.settings_path(&SettingsScope::Global);
        assert_eq!(read_servers(&path), vec!["keep", "b"]);
        assert!(fx.manager.is_installed("official/b").unwrap());
        assert!(fx.manager.is_installed("official/bad").unwrap());
    }

    #[test]
    fn test_failed_install_before_write_keeps_other_plugins() {
        let dir = TempDir::new().unwrap();
        let settings = Arc::new(FlakySettings::new(dir.path()));
        let cache = Arc::new(SqliteCache::open_in_memory().unwrap());
        let manager = PluginLifecycleManager::new(settings.clone(), cache.clone());
        let path = settings.settings_path(&SettingsScope::Global);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"mcpServers": {"keep": {"command": "k"}}}"#).unwrap();

        manager.install_global(&mcp_plugin("b", &["b"])).unwrap();
        settings.fail_writes.store(true, Ordering::SeqCst);
        assert!(manager.install_global(&mcp_plugin("c", &["c"])).is_err());

        // The backup still holds the pre-b file, and must not be restored
        assert_eq!(read_servers(&path), vec!["keep", "b"]);
        assert_eq!(read_servers(&backup_path(&path)), vec!["keep"]);
    }

    #[test]
    fn test_torn_write_is_restored_from_backup() {
        let dir = TempDir::new().unwrap();
        let settings = Arc::new(FlakySettings::new(dir.path()));
        let cache = Arc::new(SqliteCache::open_in_memory().unwrap());
        let manager = PluginLifecycleManager::new(settings.clone(), cache.clone());
        manager.install_global(&mcp_plugin("b", &["b"])).unwrap();
        let path = settings.settings_path(&SettingsScope::Global);
        let before = fs::read_to_string(&path).unwrap();

        settings.tear_writes.store(true, Ordering::SeqCst);
        let err = manager
            .install_global(&mcp_plugin("c", &["c"]))
            .unwrap_err();
        assert!(err.is_persistence_failure());
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
        assert!(!manager.is_installed("official/c").unwrap());

        let err = manager.uninstall_global("official/b").unwrap_err();
        assert!(err.is_persistence_failure());
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
        assert!(manager.is_installed("official/b").unwrap());
    }

    #[test]
    fn test_round_trip_keeps_file_bytes_and_server_order() {
        let fx = fixture();
        let original = r#"{
  "theme": "dark",
  "mcpServers": {
    "zeta": {
      "command": "z",
      "timeout": 10
    },
    "alpha": {
      "command": "a"
    }
  },
  "permissions": {
    "allow": [
      "Read"
    ]
  }
}"#;
        let path = fx.settings.settings_path(&SettingsScope::Global);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, original).unwrap();

        fx.manager
            .install_global(&mcp_plugin("mid", &["mid", "another"]))
            .unwrap();
        assert_eq!(read_servers(&path), vec!["zeta", "alpha", "mid", "another"]);
        let row = fx.cache.get_installed("official/mid").unwrap().unwrap();
        let snapshot = ChangeSnapshot::from_json(row.config_snapshot.as_deref().unwrap()).unwrap();
        assert_eq!(snapshot.mcp_server_names, vec!["mid", "another"]);

        fx.manager.uninstall_global("official/mid").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
    }

    /// Cache whose tracking inserts can be made to fail
    struct FlakyCache {
        inner: SqliteCache,
        fail_inserts: AtomicBool,
    }

    impl PluginCache for FlakyCache {
        fn upsert_plugin(&self, plugin: &CachedPlugin) -> anyhow::Result<()> {
            self.inner.upsert_plugin(plugin)
        }
        fn get_plugin(&self, id: &str) -> anyhow::Result<Option<CachedPlugin>> {
            self.inner.get_plugin(id)
        }
        fn plugins_by_marketplace(&self, marketplace_id: &str) -> anyhow::Result<Vec<CachedPlugin>> {
            self.inner.plugins_by_marketplace(marketplace_id)
        }
        fn insert_installed(&self, plugin: &InstalledPlugin) -> anyhow::Result<()> {
            if self.fail_inserts.load(Ordering::SeqCst) {
                anyhow::bail!("database is locked");
            }
            self.inner.insert_installed(plugin)
        }
        fn delete_installed(&self, id: &str) -> anyhow::Result<bool> {
            self.inner.delete_installed(id)
        }
        fn get_installed(&self, id: &str) -> anyhow::Result<Option<InstalledPlugin>> {
            self.inner.get_installed(id)
        }
        fn list_installed(&self) -> anyhow::Result<Vec<InstalledPlugin>> {
            self.inner.list_installed()
        }
        fn list_installed_with_available(
            &self,
        ) -> anyhow::Result<Vec<(InstalledPlugin, Option<String>)>> {
            self.inner.list_installed_with_available()
        }
        fn ensure_marketplace(&self, marketplace: &crate::plugins::Marketplace) -> anyhow::Result<()> {
            self.inner.ensure_marketplace(marketplace)
        }
        fn last_sync(&self, marketplace_id: &str) -> anyhow::Result<Option<chrono::DateTime<Utc>>> {
            self.inner.last_sync(marketplace_id)
        }
        fn set_last_sync(&self, marketplace_id: &str, at: chrono::DateTime<Utc>) -> anyhow::Result<()> {
            self.inner.set_last_sync(marketplace_id, at)
        }
    }

    #[test]
    fn test_tracking_failure_restores_settings_backup() {
        let dir = TempDir::new().unwrap();
        let settings = Arc::new(JsonSettingsStore::with_base_path(dir.path()));
        let cache = Arc::new(FlakyCache {
            inner: SqliteCache::open_in_memory().unwrap(),
            fail_inserts: AtomicBool::new(true),
        });
        let manager = PluginLifecycleManager::new(settings.clone(), cache.clone());

        let path = settings.settings_path(&SettingsScope::Global);
        let original = json!({"mcpServers": {"keep": {"command": "k"}}, "theme": "light"});
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, serde_json::to_string_pretty(&original).unwrap()).unwrap();

        let err = manager
            .install_global(&mcp_plugin("clash", &["clash"]))
            .unwrap_err();
        assert!(err.is_persistence_failure());
        assert!(err.to_string().contains("database is locked"));

        let restored: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(restored, original);
        assert!(backup_path(&path).exists());
        assert!(!manager.is_installed("official/clash").unwrap());
    }

    #[test]
    fn test_installed_with_updates() {
        let fx = fixture();
        let cases = [
            ("newer", Some("2.0.0"), true),
            ("same", Some("1.0.0"), false),
            ("older", Some("0.9.0"), false),
            ("unversioned", None, false),
        ];
        for (name, cached_version, _) in cases {
            let mut plugin = mcp_plugin(name, &[name]);
            fx.manager.install_global(&plugin).unwrap();
            plugin.version = cached_version.map(String::from);
            fx.cache.upsert_plugin(&plugin).unwrap();
        }
        fx.manager
            .install_global(&mcp_plugin("uncached", &["uncached"]))
            .unwrap();

        let results = fx.manager.installed_with_updates().unwrap();
        assert_eq!(results.len(), 5);
        for (name, cached_version, expected) in cases {
            let entry = results
                .iter()
                .find(|r| r.installed.name == name)
                .unwrap();
            assert_eq!(entry.available_version.as_deref(), cached_version, "{name}");
            assert_eq!(entry.has_update, expected, "{name}");
        }
        let uncached = results
            .iter()
            .find(|r| r.installed.name == "uncached")
            .unwrap();
        assert!(uncached.available_version.is_none());
        assert!(!uncached.has_update);
    }

    #[test]
    fn test_installed_with_updates_ignores_unversioned_install() {
        let fx = fixture();
        let mut plugin = mcp_plugin("nover", &["nover"]);
        plugin.version = None;
        fx.manager.install_global(&plugin).unwrap();
        plugin.version = Some("5.0.0".to_string());
        fx.cache.upsert_plugin(&plugin).unwrap();

        let results = fx.manager.installed_with_updates().unwrap();
        assert_eq!(results[0].available_version.as_deref(), Some("5.0.0"));
        assert!(!results[0].has_update);
    }

    #[test]
    fn test_installed_global_orders_most_recent_first() {
        let fx = fixture();
        assert!(fx.manager.installed_global().unwrap().is_empty());
        fx.manager.install_global(&mcp_plugin("first", &["f"])).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        fx.manager.install_global(&mcp_plugin("second", &["s"])).unwrap();

        let names: Vec<_> = fx
            .manager
            .installed_global()
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["second", "first"]);
    }

    #[test]
    fn test_concurrent_installs_of_same_plugin() {
        let fx = fixture();
        let manager = Arc::new(fx.manager);
        let plugin = mcp_plugin("race", &["race"]);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                let plugin = plugin.clone();
                std::thread::spawn(move || manager.install_global(&plugin).is_ok())
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(successes, 1);
        assert_eq!(fx.cache.list_installed().unwrap().len(), 1);
    }
}
