//! Claude Plugin Manager - marketplace browser and installer for Claude Code plugins

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use plugin_manager::cache::SqliteCache;
use plugin_manager::config::{self, AppConfig};
use plugin_manager::github::GhCliClient;
use plugin_manager::lifecycle::PluginLifecycleManager;
use plugin_manager::marketplace::{format_relative, MarketplaceService, MarketplaceSource};
use plugin_manager::plugins::CachedPlugin;
use plugin_manager::settings::{JsonSettingsStore, SettingsScope, SettingsStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "claude-plugin-manager")]
#[command(author, version, about = "Browse and install Claude Code plugins")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Load configuration from this file instead of the default locations
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync the marketplace index into the local cache
    Refresh,

    /// List marketplace plugins
    List {
        /// Only show plugins whose name or description contains this text
        #[arg(short, long)]
        query: Option<String>,
    },

    /// Show details for one plugin
    Show {
        /// Plugin id (`<marketplace>/<name>`) or bare name
        id: String,
    },

    /// Install a plugin into the global Claude settings
    Install {
        /// Plugin id (`<marketplace>/<name>`) or bare name
        id: String,
    },

    /// Remove an installed plugin from the global Claude settings
    Uninstall {
        /// Plugin id (`<marketplace>/<name>`) or bare name
        id: String,
    },

    /// List installed plugins and available updates
    Installed,

    /// Put the previous global settings file back from its backup
    RestoreSettings,

    /// Show current configuration
    Config,
}

/// Everything a command needs, built from configuration
struct App {
    config: AppConfig,
    settings: Arc<JsonSettingsStore>,
    marketplace: MarketplaceService,
    lifecycle: PluginLifecycleManager,
}

impl App {
    fn open(config: AppConfig) -> anyhow::Result<Self> {
        let database = config.paths.database();
        let cache = Arc::new(
            SqliteCache::open(&database)
                .with_context(|| format!("Failed to open plugin cache at {:?}", database))?,
        );
        let settings = Arc::new(JsonSettingsStore::with_base_path(config.paths.claude_home()));
        let fetcher = Arc::new(GhCliClient::new(config.github.timeout_secs));

        let marketplace = MarketplaceService::new(
            cache.clone(),
            fetcher,
            MarketplaceSource::from(&config.marketplace),
        );
        let lifecycle = PluginLifecycleManager::new(settings.clone(), cache);

        Ok(Self {
            config,
            settings,
            marketplace,
            lifecycle,
        })
    }

    /// Accept either a full id or a bare name in the configured marketplace
    fn qualify(&self, id: &str) -> String {
        if id.contains('/') {
            id.to_string()
        } else {
            format!("{}/{}", self.config.marketplace.id, id)
        }
    }

    fn find_plugin(&self, id: &str) -> anyhow::Result<CachedPlugin> {
        let id = self.qualify(id);
        self.marketplace
            .plugin(&id)?
            .with_context(|| format!("Plugin '{}' not found. Try 'refresh' first.", id))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "plugin_manager=debug,claude_plugin_manager=debug"
    } else {
        "plugin_manager=info,claude_plugin_manager=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &cli.config {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    }
    .context("Failed to load configuration")?;
    debug!(config = ?config, "Loaded configuration");

    if let Commands::Config = cli.command {
        cmd_config(&config);
        return Ok(());
    }

    let app = App::open(config)?;
    match cli.command {
        Commands::Refresh => cmd_refresh(&app).await,
        Commands::List { query } => cmd_list(&app, query.as_deref()).await,
        Commands::Show { id } => cmd_show(&app, &id),
        Commands::Install { id } => cmd_install(&app, &id),
        Commands::Uninstall { id } => cmd_uninstall(&app, &id),
        Commands::Installed => cmd_installed(&app),
        Commands::RestoreSettings => cmd_restore_settings(&app),
        Commands::Config => Ok(()),
    }
}

async fn cmd_refresh(app: &App) -> anyhow::Result<()> {
    let source = app.marketplace.source();
    info!("Syncing {}/{}", source.owner, source.repo);

    let count = app.marketplace.refresh().await?;
    println!("Synced {} plugins from {}", count, source.name);
    Ok(())
}

async fn cmd_list(app: &App, query: Option<&str>) -> anyhow::Result<()> {
    let mut plugins = match query {
        Some(q) => {
            // Make sure there is something to search
            app.marketplace.plugins().await?;
            app.marketplace.search(q)?
        }
        None => app.marketplace.plugins().await?,
    };
    plugins.sort_by(|a, b| a.name.cmp(&b.name));

    if plugins.is_empty() {
        println!("No plugins found.");
        return Ok(());
    }

    for plugin in &plugins {
        println!(
            "{:<32} {:<12} {:<14} {}",
            plugin.id,
            plugin.version.as_deref().unwrap_or("-"),
            plugin.plugin_type.label(),
            plugin.description.as_deref().unwrap_or("")
        );
    }
    println!();
    println!(
        "{} plugins. Last synced: {}",
        plugins.len(),
        format_relative(app.marketplace.last_sync_time()?, Utc::now())
    );
    Ok(())
}

fn cmd_show(app: &App, id: &str) -> anyhow::Result<()> {
    let plugin = app.find_plugin(id)?;
    let installed = app.lifecycle.is_installed(&plugin.id)?;

    println!("{}\n", plugin.name);
    println!("  Id:          {}", plugin.id);
    println!("  Type:        {}", plugin.plugin_type.label());
    println!("  Version:     {}", plugin.version.as_deref().unwrap_or("-"));
    println!("  Author:      {}", plugin.author.as_deref().unwrap_or("-"));
    println!("  Repository:  {}", plugin.repository.as_deref().unwrap_or("-"));
    let tags = plugin.tag_list();
    if !tags.is_empty() {
        println!("  Tags:        {}", tags.join(", "));
    }
    println!("  Installed:   {}", if installed { "yes" } else { "no" });
    if let Some(description) = &plugin.description {
        println!("\n{}", description);
    }
    Ok(())
}

fn cmd_install(app: &App, id: &str) -> anyhow::Result<()> {
    let plugin = app.find_plugin(id)?;
    app.lifecycle.install_global(&plugin)?;
    println!(
        "Installed {} into {:?}",
        plugin.id,
        app.settings.settings_path(&SettingsScope::Global)
    );
    Ok(())
}

fn cmd_uninstall(app: &App, id: &str) -> anyhow::Result<()> {
    let id = app.qualify(id);
    app.lifecycle.uninstall_global(&id)?;
    println!("Uninstalled {}", id);
    Ok(())
}

fn cmd_installed(app: &App) -> anyhow::Result<()> {
    let plugins = app.lifecycle.installed_with_updates()?;
    if plugins.is_empty() {
        println!("No plugins installed.");
        return Ok(());
    }

    for entry in &plugins {
        let plugin = &entry.installed;
        let update = if entry.has_update {
            format!("update: {}", entry.available_version.as_deref().unwrap_or("?"))
        } else {
            String::new()
        };
        println!(
            "{:<32} {:<12} {:<14} {:<20} {}",
            plugin.id,
            plugin.version.as_deref().unwrap_or("-"),
            plugin.plugin_type.label(),
            format_relative(Some(plugin.installed_at), Utc::now()),
            update
        );
    }

    let updates = plugins.iter().filter(|p| p.has_update).count();
    if updates > 0 {
        println!("\n{} update(s) available", updates);
    }
    Ok(())
}

fn cmd_restore_settings(app: &App) -> anyhow::Result<()> {
    let scope = SettingsScope::Global;
    let path = app.settings.settings_path(&scope);
    if !app.settings.restore_from_backup(&scope) {
        anyhow::bail!("No settings backup could be restored to {:?}", path);
    }
    println!("Restored {:?} from backup", path);
    Ok(())
}

fn cmd_config(config: &AppConfig) {
    println!("Claude Plugin Manager Configuration\n");
    println!("Paths:");
    println!("  Claude home: {:?}", config.paths.claude_home());
    println!("  Database: {:?}", config.paths.database());
    println!();
    println!("Marketplace:");
    println!("  Id: {}", config.marketplace.id);
    println!("  Name: {}", config.marketplace.name);
    println!(
        "  Repository: {}/{}",
        config.marketplace.owner, config.marketplace.repo
    );
    println!("  Index: {}", config.marketplace.index_path);
    println!();
    println!("GitHub:");
    println!("  Timeout: {} seconds", config.github.timeout_secs);
}
