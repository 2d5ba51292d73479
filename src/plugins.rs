//! Plugin data model shared by the cache, marketplace sync and lifecycle manager.
//!
//! Plugin ID format: `marketplace-id/plugin-name`
//!
//! A cached plugin carries its installable payload as JSON text in
//! `components`. That text decodes into a [`ComponentBundle`]:
//!
//! ```json
//! {
//!   "mcpServers": { "name": { "command": "npx", "args": [], "env": {} } },
//!   "hooks": { "name": { "matcher": "Write", "script": "check.sh" } },
//!   "commands": {}, "agents": {}, "skills": {}
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Index;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Plugin type
// ---------------------------------------------------------------------------

/// The single category a plugin belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginType {
    McpServer,
    Hook,
    SlashCommand,
    Agent,
    Skill,
}

impl PluginType {
    /// All variants, in component-priority order
    pub const ALL: [PluginType; 5] = [
        PluginType::McpServer,
        PluginType::Hook,
        PluginType::SlashCommand,
        PluginType::Agent,
        PluginType::Skill,
    ];

    /// String stored in the cache database
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::McpServer => "MCP_SERVER",
            Self::Hook => "HOOK",
            Self::SlashCommand => "SLASH_COMMAND",
            Self::Agent => "AGENT",
            Self::Skill => "SKILL",
        }
    }

    /// Human-readable label
    pub fn label(self) -> &'static str {
        match self {
            Self::McpServer => "MCP Server",
            Self::Hook => "Hook",
            Self::SlashCommand => "Slash Command",
            Self::Agent => "Agent",
            Self::Skill => "Skill",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for PluginType {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_db_str() == upper)
            .ok_or_else(|| PluginError::UnknownType(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Cached marketplace entry
// ---------------------------------------------------------------------------

/// Build the globally unique plugin ID for a marketplace entry
pub fn plugin_id(marketplace_id: &str, name: &str) -> String {
    format!("{}/{}", marketplace_id, name)
}

/// Plugin metadata cached from a marketplace index
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPlugin {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub version: Option<String>,
    pub author: Option<String>,
    pub repository: Option<String>,
    pub marketplace_id: String,
    pub plugin_type: PluginType,
    /// JSON-encoded list of tags
    pub tags: Option<String>,
    pub dependencies: Option<String>,
    pub config_schema: Option<String>,
    /// JSON-encoded [`ComponentBundle`]
    pub components: Option<String>,
    pub cached_at: DateTime<Utc>,
}

impl CachedPlugin {
    /// Decoded tag list; malformed tag JSON yields no tags
    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .as_deref()
            .and_then(|t| serde_json::from_str(t).ok())
            .unwrap_or_default()
    }
}

/// A Marketplace source registered in the cache
#[derive(Debug, Clone, PartialEq)]
pub struct Marketplace {
    pub id: String,
    pub name: String,
    pub github_owner: String,
    pub github_repo: String,
    pub enabled: bool,
    pub priority: i64,
    pub requires_auth: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Component bundle
// ---------------------------------------------------------------------------

/// Decoded `components` payload of a plugin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentBundle {
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: NamedComponents<McpServerComponent>,
    #[serde(default)]
    pub hooks: NamedComponents<HookComponent>,
    #[serde(default)]
    pub commands: NamedComponents<NamedComponent>,
    #[serde(default)]
    pub agents: NamedComponents<NamedComponent>,
    #[serde(default)]
    pub skills: NamedComponents<NamedComponent>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ComponentBundle {
    /// Decode a bundle from its JSON text. A literal `null` decodes to `None`.
    pub fn parse(json: &str) -> Result<Option<Self>, PluginError> {
        serde_json::from_str::<Option<Self>>(json)
            .map_err(|e| PluginError::InvalidComponents(e.to_string()))
    }

    /// Names declared for the given category
    pub fn names(&self, plugin_type: PluginType) -> Vec<&str> {
        match plugin_type {
            PluginType::McpServer => self.mcp_servers.names().collect(),
            PluginType::Hook => self.hooks.names().collect(),
            PluginType::SlashCommand => self.commands.names().collect(),
            PluginType::Agent => self.agents.names().collect(),
            PluginType::Skill => self.skills.names().collect(),
        }
    }

    /// First category with at least one entry
    pub fn primary_type(&self) -> Option<PluginType> {
        PluginType::ALL
            .into_iter()
            .find(|ty| !self.names(*ty).is_empty())
    }
}

/// Name-keyed components in declaration order.
///
/// Decodes from a JSON object. A repeated name keeps its first position and
/// takes the last value, matching how the object would read as a map.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedComponents<T> {
    entries: Vec<(String, T)>,
}

impl<T> Default for NamedComponents<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> NamedComponents<T> {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, name: String, value: T) {
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }
}

impl<T> Index<&str> for NamedComponents<T> {
    type Output = T;

    fn index(&self, name: &str) -> &T {
        match self.get(name) {
            Some(value) => value,
            None => panic!("no component named {:?}", name),
        }
    }
}

impl<T: Serialize> Serialize for NamedComponents<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for NamedComponents<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for EntriesVisitor<T> {
            type Value = NamedComponents<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object of named components")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut components = NamedComponents::default();
                while let Some((name, value)) = access.next_entry::<String, T>()? {
                    components.insert(name, value);
                }
                Ok(components)
            }
        }

        deserializer.deserialize_map(EntriesVisitor(PhantomData))
    }
}

/// MCP server launch declaration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpServerComponent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Hook declaration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookComponent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Slash command, agent or skill declaration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedComponent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Installation tracking
// ---------------------------------------------------------------------------

/// Exactly which named entries an install injected into the settings file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSnapshot {
    #[serde(default)]
    pub mcp_server_names: Vec<String>,
    #[serde(default)]
    pub hook_names: Vec<String>,
    #[serde(default)]
    pub command_names: Vec<String>,
    #[serde(default)]
    pub agent_names: Vec<String>,
    #[serde(default)]
    pub skill_names: Vec<String>,
}

impl ChangeSnapshot {
    pub fn to_json(&self) -> Result<String, PluginError> {
        serde_json::to_string(self).map_err(|e| PluginError::InvalidSnapshot(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, PluginError> {
        serde_json::from_str(json).map_err(|e| PluginError::InvalidSnapshot(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.mcp_server_names.is_empty()
            && self.hook_names.is_empty()
            && self.command_names.is_empty()
            && self.agent_names.is_empty()
            && self.skill_names.is_empty()
    }
}

/// A plugin installed into the global settings file
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledPlugin {
    pub id: String,
    pub name: String,
    pub version: Option<String>,
    pub plugin_type: PluginType,
    pub marketplace_id: String,
    /// JSON-encoded [`ChangeSnapshot`]
    pub config_snapshot: Option<String>,
    pub installed_at: DateTime<Utc>,
}

/// An installed plugin joined with the marketplace's current version
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledPluginWithUpdate {
    pub installed: InstalledPlugin,
    pub available_version: Option<String>,
    pub has_update: bool,
}

/// Errors in the plugin data model
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Unknown plugin type: {0}")]
    UnknownType(String),

    #[error("Invalid components: {0}")]
    InvalidComponents(String),

    #[error("Invalid config snapshot: {0}")]
    InvalidSnapshot(String),
}
