//! Claude Plugin Manager - marketplace browser and installer for Claude Code plugins
//!
//! Syncs plugin marketplaces from GitHub into a local SQLite cache, installs
//! plugins into `~/.claude/settings.json` with exact, reversible change
//! tracking, and flags installed plugins with newer marketplace versions.
//!
//! This library exposes the core functionality for both the CLI binary and
//! integration testing.

pub mod cache;
pub mod config;
pub mod github;
pub mod lifecycle;
pub mod marketplace;
pub mod plugins;
pub mod settings;
pub mod version;
