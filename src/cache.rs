//! Local plugin cache backed by SQLite.
//!
//! Holds marketplace plugin metadata, installed-plugin tracking rows and
//! per-marketplace sync bookkeeping. The store is plain CRUD; install
//! decisions live in [`crate::lifecycle`].

use crate::plugins::{CachedPlugin, InstalledPlugin, Marketplace, PluginType};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Cache database file name
pub const CACHE_DB_NAME: &str = "cache.db";

/// Current schema version - increment when adding migrations
const SCHEMA_VERSION: i64 = 2;

/// Persistent record store used by the marketplace and lifecycle services
pub trait PluginCache: Send + Sync {
    /// Insert or replace a marketplace plugin by id
    fn upsert_plugin(&self, plugin: &CachedPlugin) -> Result<()>;
    fn get_plugin(&self, id: &str) -> Result<Option<CachedPlugin>>;
    fn plugins_by_marketplace(&self, marketplace_id: &str) -> Result<Vec<CachedPlugin>>;

    /// Insert an installed-plugin row. Fails if the id is already present.
    fn insert_installed(&self, plugin: &InstalledPlugin) -> Result<()>;
    fn delete_installed(&self, id: &str) -> Result<bool>;
    fn get_installed(&self, id: &str) -> Result<Option<InstalledPlugin>>;
    /// All installed plugins, most recent install first
    fn list_installed(&self) -> Result<Vec<InstalledPlugin>>;
    /// Installed plugins left-joined with the cached marketplace version of
    /// the same id, most recent install first
    fn list_installed_with_available(&self) -> Result<Vec<(InstalledPlugin, Option<String>)>>;

    /// Register a marketplace if it isn't known yet
    fn ensure_marketplace(&self, marketplace: &Marketplace) -> Result<()>;
    fn last_sync(&self, marketplace_id: &str) -> Result<Option<DateTime<Utc>>>;
    fn set_last_sync(&self, marketplace_id: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Format a timestamp for storage. Fixed precision keeps lexical order equal
/// to chronological order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp {:?}", value))?
        .with_timezone(&Utc))
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn type_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<PluginType> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

const PLUGIN_COLUMNS: &str = "id, name, description, version, author, repository, marketplace_id, \
     type, tags, dependencies, config_schema, components, cached_at";

fn plugin_from_row(row: &Row<'_>) -> rusqlite::Result<CachedPlugin> {
    Ok(CachedPlugin {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        version: row.get(3)?,
        author: row.get(4)?,
        repository: row.get(5)?,
        marketplace_id: row.get(6)?,
        plugin_type: type_column(row, 7)?,
        tags: row.get(8)?,
        dependencies: row.get(9)?,
        config_schema: row.get(10)?,
        components: row.get(11)?,
        cached_at: timestamp_column(row, 12)?,
    })
}

const INSTALLED_COLUMNS: &str =
    "id, name, version, type, marketplace_id, config_snapshot, installed_at";

fn installed_from_row(row: &Row<'_>) -> rusqlite::Result<InstalledPlugin> {
    Ok(InstalledPlugin {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        plugin_type: type_column(row, 3)?,
        marketplace_id: row.get(4)?,
        config_snapshot: row.get(5)?,
        installed_at: timestamp_column(row, 6)?,
    })
}

/// SQLite implementation of [`PluginCache`]
pub struct SqliteCache {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteCache {
    /// Open or create the cache database, creating parent directories
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open cache database at {:?}", path))?;
        Self::from_connection(conn, path.to_path_buf())
    }

    /// Open a throwaway in-memory cache
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory cache")?;
        Self::from_connection(conn, PathBuf::from(":memory:"))
    }

    /// Default cache location: `~/.claude-plugin-manager/cache.db`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude-plugin-manager")
            .join(CACHE_DB_NAME)
    }

    fn from_connection(conn: Connection, path: PathBuf) -> Result<Self> {
        let cache = Self {
            conn: Mutex::new(conn),
            path,
        };
        cache.ensure_schema()?;
        Ok(cache)
    }

    /// Get the database path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Highest applied schema version
    pub fn schema_version(&self) -> Result<i64> {
        let version = self.conn().query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    /// Ensure database schema exists and run migrations
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

        if current_version < SCHEMA_VERSION {
            tracing::info!(
                "Migrating plugin cache from version {} to {}",
                current_version,
                SCHEMA_VERSION
            );
            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }

        Ok(())
    }

    /// Migration v1: marketplace cache
    fn migrate_v1(conn: &Connection) -> Result<()> {
        tracing::debug!("Running migration v1: marketplace cache");
        conn.execute_batch(
            r#"
            -- Plugin ids use the format marketplace/plugin-name
            CREATE TABLE IF NOT EXISTS plugins (
                id TEXT NOT NULL PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                version TEXT,
                author TEXT,
                repository TEXT,
                marketplace_id TEXT NOT NULL,
                type TEXT NOT NULL,
                tags TEXT,
                dependencies TEXT,
                config_schema TEXT,
                components TEXT,
                cached_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS marketplaces (
                id TEXT NOT NULL PRIMARY KEY,
                name TEXT NOT NULL,
                github_owner TEXT NOT NULL,
                github_repo TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                priority INTEGER NOT NULL DEFAULT 0,
                requires_auth INTEGER NOT NULL DEFAULT 0,
                last_synced_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                marketplace_id TEXT NOT NULL REFERENCES marketplaces(id),
                sync_type TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                plugin_count INTEGER,
                error_message TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_plugins_marketplace ON plugins(marketplace_id);
            CREATE INDEX IF NOT EXISTS idx_plugins_type ON plugins(type);
            CREATE INDEX IF NOT EXISTS idx_sync_history_marketplace ON sync_history(marketplace_id);
            "#,
        )
        .context("Failed to create v1 schema")?;
        Ok(())
    }

    /// Migration v2: installed plugin tracking
    fn migrate_v2(conn: &Connection) -> Result<()> {
        tracing::debug!("Running migration v2: installed plugins");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS installed_plugins (
                id TEXT NOT NULL PRIMARY KEY,
                name TEXT NOT NULL,
                version TEXT,
                type TEXT NOT NULL,
                marketplace_id TEXT NOT NULL,
                config_snapshot TEXT,
                installed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_installed_plugins_type ON installed_plugins(type);
            "#,
        )
        .context("Failed to create v2 schema (installed plugins)")?;
        Ok(())
    }

    /// Look up a marketplace row
    pub fn get_marketplace(&self, id: &str) -> Result<Option<Marketplace>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, github_owner, github_repo, enabled, priority, requires_auth, \
             last_synced_at, created_at FROM marketplaces WHERE id = ?1",
        )?;
        let marketplace = stmt
            .query_row(params![id], |row| {
                let last_synced: Option<String> = row.get(7)?;
                Ok(Marketplace {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    github_owner: row.get(2)?,
                    github_repo: row.get(3)?,
                    enabled: row.get(4)?,
                    priority: row.get(5)?,
                    requires_auth: row.get(6)?,
                    last_synced_at: last_synced
                        .map(|raw| {
                            DateTime::parse_from_rfc3339(&raw)
                                .map(|t| t.with_timezone(&Utc))
                                .map_err(|e| conversion_error(7, e))
                        })
                        .transpose()?,
                    created_at: timestamp_column(row, 8)?,
                })
            })
            .optional()?;
        Ok(marketplace)
    }
}

impl PluginCache for SqliteCache {
    fn upsert_plugin(&self, plugin: &CachedPlugin) -> Result<()> {
        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO plugins ({PLUGIN_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    plugin.id,
                    plugin.name,
                    plugin.description,
                    plugin.version,
                    plugin.author,
                    plugin.repository,
                    plugin.marketplace_id,
                    plugin.plugin_type.as_db_str(),
                    plugin.tags,
                    plugin.dependencies,
                    plugin.config_schema,
                    plugin.components,
                    format_timestamp(plugin.cached_at),
                ],
            )
            .with_context(|| format!("Failed to cache plugin {}", plugin.id))?;
        Ok(())
    }

    fn get_plugin(&self, id: &str) -> Result<Option<CachedPlugin>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PLUGIN_COLUMNS} FROM plugins WHERE id = ?1"
        ))?;
        let plugin = stmt.query_row(params![id], plugin_from_row).optional()?;
        Ok(plugin)
    }

    fn plugins_by_marketplace(&self, marketplace_id: &str) -> Result<Vec<CachedPlugin>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PLUGIN_COLUMNS} FROM plugins WHERE marketplace_id = ?1 ORDER BY name"
        ))?;
        let plugins = stmt
            .query_map(params![marketplace_id], plugin_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(plugins)
    }

    fn insert_installed(&self, plugin: &InstalledPlugin) -> Result<()> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO installed_plugins ({INSTALLED_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    plugin.id,
                    plugin.name,
                    plugin.version,
                    plugin.plugin_type.as_db_str(),
                    plugin.marketplace_id,
                    plugin.config_snapshot,
                    format_timestamp(plugin.installed_at),
                ],
            )
            .with_context(|| format!("Failed to record installation of {}", plugin.id))?;
        Ok(())
    }

    fn delete_installed(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM installed_plugins WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn get_installed(&self, id: &str) -> Result<Option<InstalledPlugin>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTALLED_COLUMNS} FROM installed_plugins WHERE id = ?1"
        ))?;
        let plugin = stmt.query_row(params![id], installed_from_row).optional()?;
        Ok(plugin)
    }

    fn list_installed(&self) -> Result<Vec<InstalledPlugin>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTALLED_COLUMNS} FROM installed_plugins ORDER BY installed_at DESC, id"
        ))?;
        let plugins = stmt
            .query_map([], installed_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(plugins)
    }

    fn list_installed_with_available(&self) -> Result<Vec<(InstalledPlugin, Option<String>)>> {
        let conn = self.conn();
        // Only the cached version is read, so a cached row this build can't
        // decode doesn't hide the installed one
        let mut stmt = conn.prepare(
            "SELECT i.id, i.name, i.version, i.type, i.marketplace_id, i.config_snapshot, \
             i.installed_at, p.version \
             FROM installed_plugins i LEFT JOIN plugins p ON p.id = i.id \
             ORDER BY i.installed_at DESC, i.id",
        )?;
        let rows: Vec<(InstalledPlugin, Option<String>)> = stmt
            .query_map([], |row| Ok((installed_from_row(row)?, row.get(7)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn ensure_marketplace(&self, marketplace: &Marketplace) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO marketplaces \
             (id, name, github_owner, github_repo, enabled, priority, requires_auth, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                marketplace.id,
                marketplace.name,
                marketplace.github_owner,
                marketplace.github_repo,
                marketplace.enabled,
                marketplace.priority,
                marketplace.requires_auth,
                format_timestamp(marketplace.created_at),
            ],
        )?;
        Ok(())
    }

    fn last_sync(&self, marketplace_id: &str) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT last_synced_at FROM marketplaces WHERE id = ?1",
                params![marketplace_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.flatten().map(|s| parse_timestamp(&s)).transpose()
    }

    fn set_last_sync(&self, marketplace_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE marketplaces SET last_synced_at = ?1 WHERE id = ?2",
            params![format_timestamp(at), marketplace_id],
        )?;
        Ok(())
    }
}
