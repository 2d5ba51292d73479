//! Marketplace index sync and cached plugin queries.
//!
//! A marketplace is a GitHub repository holding an index file
//! (`.claude-plugin/marketplace.json` by default) that lists its plugins.
//! [`MarketplaceService::refresh`] pulls the index and upserts every entry into
//! the [`PluginCache`]; all queries afterwards are served from the cache.

use crate::cache::PluginCache;
use crate::config::MarketplaceConfig;
use crate::github::{GitHubError, RepoFileFetcher};
use crate::plugins::{plugin_id, CachedPlugin, ComponentBundle, Marketplace, PluginType};
use chrono::{DateTime, Local, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ----------------------------------------------------------------------------
// Index format
// ----------------------------------------------------------------------------

/// Parsed marketplace index file
#[derive(Debug, Clone, Deserialize)]
pub struct MarketplaceIndex {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub plugins: Option<Vec<PluginEntry>>,
}

/// Author as either a bare name or a detailed object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PluginAuthor {
    Name(String),
    Detailed {
        #[serde(default)]
        name: String,
        #[serde(default)]
        email: Option<String>,
        #[serde(default)]
        url: Option<String>,
    },
}

impl PluginAuthor {
    pub fn name(&self) -> &str {
        match self {
            PluginAuthor::Name(name) => name,
            PluginAuthor::Detailed { name, .. } => name,
        }
    }
}

/// One plugin listed in a marketplace index
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub author: Option<PluginAuthor>,
    #[serde(default)]
    pub repository: Option<String>,
    /// Usually a path or URL string; structured sources are kept as JSON
    #[serde(default)]
    pub source: Option<Value>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub keywords: Option<Vec<String>>,

    // Component name lists, used to derive the plugin type
    #[serde(default)]
    pub mcp_servers: Option<Vec<String>>,
    #[serde(default)]
    pub hooks: Option<Vec<String>>,
    #[serde(default)]
    pub commands: Option<Vec<String>>,
    #[serde(default)]
    pub agents: Option<Vec<String>>,
    #[serde(default)]
    pub skills: Option<Vec<String>>,

    /// Inline component bundle fed to the installer
    #[serde(default)]
    pub components: Option<Value>,
    #[serde(default)]
    pub dependencies: Option<Value>,
    #[serde(default)]
    pub config_schema: Option<Value>,
}

fn non_empty(list: &Option<Vec<String>>) -> bool {
    list.as_ref().is_some_and(|l| !l.is_empty())
}

/// JSON text of a present, non-null value
fn json_text(value: &Option<Value>) -> Option<String> {
    value
        .as_ref()
        .filter(|v| !v.is_null())
        .map(Value::to_string)
}

impl PluginEntry {
    /// First non-empty component list, then the inline bundle, in the order
    /// MCP servers, hooks, commands, agents, skills
    pub fn primary_type(&self) -> Option<PluginType> {
        let lists = [
            (&self.mcp_servers, PluginType::McpServer),
            (&self.hooks, PluginType::Hook),
            (&self.commands, PluginType::SlashCommand),
            (&self.agents, PluginType::Agent),
            (&self.skills, PluginType::Skill),
        ];
        if let Some((_, plugin_type)) = lists.iter().find(|(list, _)| non_empty(list)) {
            return Some(*plugin_type);
        }

        let inline = self.components.as_ref().filter(|v| !v.is_null())?;
        match serde_json::from_value::<ComponentBundle>(inline.clone()) {
            Ok(bundle) => bundle.primary_type(),
            Err(e) => {
                debug!(plugin = %self.name, error = %e, "Inline components don't parse");
                None
            }
        }
    }

    /// `repository`, falling back to a string `source`
    pub fn repository_url(&self) -> Option<String> {
        self.repository.clone().or_else(|| match &self.source {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) if !other.is_null() => Some(other.to_string()),
            _ => None,
        })
    }

    fn to_cached(
        &self,
        marketplace_id: &str,
        plugin_type: PluginType,
        cached_at: DateTime<Utc>,
    ) -> CachedPlugin {
        CachedPlugin {
            id: plugin_id(marketplace_id, &self.name),
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
            author: self.author.as_ref().map(|a| a.name().to_string()),
            repository: self.repository_url(),
            marketplace_id: marketplace_id.to_string(),
            plugin_type,
            tags: self
                .keywords
                .as_ref()
                .and_then(|k| serde_json::to_string(k).ok()),
            dependencies: json_text(&self.dependencies),
            config_schema: json_text(&self.config_schema),
            components: json_text(&self.components),
            cached_at,
        }
    }
}

// ----------------------------------------------------------------------------
// Service
// ----------------------------------------------------------------------------

/// Errors from marketplace sync
#[derive(Debug, thiserror::Error)]
pub enum MarketplaceError {
    #[error("Could not fetch marketplace index from {owner}/{repo}")]
    IndexUnavailable { owner: String, repo: String },

    #[error("Failed to parse marketplace index: invalid JSON format")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Marketplace index is empty or invalid")]
    EmptyIndex,

    #[error(transparent)]
    GitHub(#[from] GitHubError),

    #[error("Plugin cache error: {0:#}")]
    Cache(anyhow::Error),
}

impl From<anyhow::Error> for MarketplaceError {
    fn from(e: anyhow::Error) -> Self {
        MarketplaceError::Cache(e)
    }
}

/// Where a marketplace index lives
#[derive(Debug, Clone)]
pub struct MarketplaceSource {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub repo: String,
    pub index_path: String,
}

impl Default for MarketplaceSource {
    fn default() -> Self {
        Self::from(&MarketplaceConfig::default())
    }
}

impl From<&MarketplaceConfig> for MarketplaceSource {
    fn from(config: &MarketplaceConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            index_path: config.index_path.clone(),
        }
    }
}

impl MarketplaceSource {
    fn to_marketplace(&self, now: DateTime<Utc>) -> Marketplace {
        Marketplace {
            id: self.id.clone(),
            name: self.name.clone(),
            github_owner: self.owner.clone(),
            github_repo: self.repo.clone(),
            enabled: true,
            priority: 0,
            requires_auth: false,
            last_synced_at: None,
            created_at: now,
        }
    }
}

/// Syncs one marketplace into the plugin cache and answers queries from it
pub struct MarketplaceService {
    cache: Arc<dyn PluginCache>,
    fetcher: Arc<dyn RepoFileFetcher>,
    source: MarketplaceSource,
}

impl MarketplaceService {
    pub fn new(
        cache: Arc<dyn PluginCache>,
        fetcher: Arc<dyn RepoFileFetcher>,
        source: MarketplaceSource,
    ) -> Self {
        Self {
            cache,
            fetcher,
            source,
        }
    }

    pub fn source(&self) -> &MarketplaceSource {
        &self.source
    }

    /// Fetch the index and upsert its plugins. Returns how many were cached.
    ///
    /// Fetch and parse failures leave the cache as it was.
    pub async fn refresh(&self) -> Result<usize, MarketplaceError> {
        let source = &self.source;
        let content = self
            .fetcher
            .fetch_repo_file(&source.owner, &source.repo, &source.index_path)
            .await?
            .filter(|c| !c.is_empty())
            .ok_or_else(|| MarketplaceError::IndexUnavailable {
                owner: source.owner.clone(),
                repo: source.repo.clone(),
            })?;

        let index: Option<MarketplaceIndex> =
            serde_json::from_str(&content).map_err(MarketplaceError::InvalidJson)?;
        let entries = index
            .and_then(|i| i.plugins)
            .ok_or(MarketplaceError::EmptyIndex)?;

        let now = Utc::now();
        self.cache.ensure_marketplace(&source.to_marketplace(now))?;

        let mut cached = 0;
        for entry in &entries {
            if entry.name.trim().is_empty() {
                warn!(marketplace = %source.id, "Skipping index entry without a name");
                continue;
            }
            let Some(plugin_type) = entry.primary_type() else {
                warn!(
                    marketplace = %source.id,
                    plugin = %entry.name,
                    "Skipping plugin with no components"
                );
                continue;
            };
            self.cache
                .upsert_plugin(&entry.to_cached(&source.id, plugin_type, now))?;
            cached += 1;
        }

        self.cache.set_last_sync(&source.id, Utc::now())?;
        info!(
            marketplace = %source.id,
            cached,
            skipped = entries.len() - cached,
            "Marketplace refreshed"
        );
        Ok(cached)
    }

    /// Cached plugins, refreshing first when the cache is empty
    pub async fn plugins(&self) -> Result<Vec<CachedPlugin>, MarketplaceError> {
        let plugins = self.cache.plugins_by_marketplace(&self.source.id)?;
        if !plugins.is_empty() {
            return Ok(plugins);
        }

        debug!(marketplace = %self.source.id, "Cache empty, refreshing");
        self.refresh().await?;
        Ok(self.cache.plugins_by_marketplace(&self.source.id)?)
    }

    /// Case-insensitive substring search over cached names and descriptions
    pub fn search(&self, query: &str) -> Result<Vec<CachedPlugin>, MarketplaceError> {
        let plugins = self.cache.plugins_by_marketplace(&self.source.id)?;
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Ok(plugins);
        }

        Ok(plugins
            .into_iter()
            .filter(|p| {
                p.name.to_lowercase().contains(&query)
                    || p.description
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&query))
            })
            .collect())
    }

    pub fn plugin(&self, id: &str) -> Result<Option<CachedPlugin>, MarketplaceError> {
        Ok(self.cache.get_plugin(id)?)
    }

    pub fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>, MarketplaceError> {
        Ok(self.cache.last_sync(&self.source.id)?)
    }
}

/// Human-friendly age of a sync time relative to `now`
pub fn format_relative(time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(time) = time else {
        return "Never synced".to_string();
    };

    let elapsed = now.signed_duration_since(time);
    if elapsed.num_seconds() < 60 {
        return "Just now".to_string();
    }
    if elapsed.num_minutes() < 60 {
        return format_unit(elapsed.num_minutes(), "minute");
    }
    if elapsed.num_hours() < 24 {
        return format_unit(elapsed.num_hours(), "hour");
    }
    if elapsed.num_days() < 7 {
        return format_unit(elapsed.num_days(), "day");
    }

    time.with_timezone(&Local)
        .format("%b %-d, %Y %-I:%M %p")
        .to_string()
}

fn format_unit(value: i64, unit: &str) -> String {
    if value == 1 {
        format!("{} {} ago", value, unit)
    } else {
        format!("{} {}s ago", value, unit)
    }
}
