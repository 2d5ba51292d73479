//! GitHub access through the `gh` CLI.
//!
//! Marketplace indexes are read with `gh api repos/<owner>/<repo>/contents/<path>`,
//! which returns the file base64-encoded inside a JSON envelope. Going through
//! `gh` means private marketplaces work with whatever account the user already
//! authenticated, without this tool handling tokens.

use async_trait::async_trait;
use base64::Engine;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

/// Default per-command timeout
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Errors from GitHub operations
#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("GitHub CLI (gh) is not installed. Please install it from https://cli.github.com/")]
    NotInstalled,

    #[error("GitHub CLI is not authenticated. Please run 'gh auth login' in your terminal.")]
    NotAuthenticated,

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Command timed out after {0} seconds")]
    Timeout(u64),
}

/// Source of raw files stored in GitHub repositories
#[async_trait]
pub trait RepoFileFetcher: Send + Sync {
    /// Fetch a file's text. `Ok(None)` when the file or repository can't be
    /// read for reasons other than missing tooling or authentication.
    async fn fetch_repo_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
    ) -> Result<Option<String>, GitHubError>;
}

/// Captured result of a finished subprocess
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    fn needs_login(&self) -> bool {
        self.stderr.contains("gh auth login")
    }
}

/// Runs external programs
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, GitHubError>;
}

/// [`ProcessRunner`] backed by `tokio::process`, bounded by a timeout
pub struct TokioProcessRunner {
    timeout_secs: u64,
}

impl TokioProcessRunner {
    pub fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }
}

impl Default for TokioProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT_SECS)
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, GitHubError> {
        debug!(program = %program, args = ?args, "Running command");

        let child = match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                // Missing binaries surface as a failed run, not an error
                debug!(program = %program, error = %e, "Failed to spawn command");
                return Ok(CommandOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: e.to_string(),
                });
            }
        };

        let result = timeout(
            Duration::from_secs(self.timeout_secs),
            child.wait_with_output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                if !stderr.is_empty() {
                    debug!(program = %program, stderr = %stderr, "Command stderr");
                }
                Ok(CommandOutput {
                    success: output.status.success(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr,
                })
            }
            Ok(Err(e)) => Err(GitHubError::CommandFailed(e.to_string())),
            Err(_) => Err(GitHubError::Timeout(self.timeout_secs)),
        }
    }
}

/// GitHub client that shells out to `gh`, falling back to `git` where it can
pub struct GhCliClient {
    runner: Box<dyn ProcessRunner>,
    gh_available: OnceCell<bool>,
}

impl GhCliClient {
    pub fn new(timeout_secs: u64) -> Self {
        Self::with_runner(TokioProcessRunner::new(timeout_secs))
    }

    pub fn with_runner(runner: impl ProcessRunner + 'static) -> Self {
        Self {
            runner: Box::new(runner),
            gh_available: OnceCell::new(),
        }
    }

    /// Whether `gh` runs at all. Probed once per client.
    pub async fn is_gh_available(&self) -> bool {
        *self
            .gh_available
            .get_or_init(|| async {
                match self.runner.run("gh", &["--version"]).await {
                    Ok(output) => output.success,
                    Err(e) => {
                        warn!(error = %e, "Probing for gh failed");
                        false
                    }
                }
            })
            .await
    }

    /// Check a repository exists, via `gh repo view` or `git ls-remote`
    pub async fn repository_exists(&self, owner: &str, repo: &str) -> Result<bool, GitHubError> {
        let slug = format!("{}/{}", owner, repo);
        let output = if self.is_gh_available().await {
            self.runner
                .run("gh", &["repo", "view", &slug, "--json", "name"])
                .await?
        } else {
            let remote = format!("https://github.com/{}.git", slug);
            self.runner.run("git", &["ls-remote", &remote]).await?
        };
        Ok(output.success)
    }

    /// Decoded README of a repository
    pub async fn readme(&self, owner: &str, repo: &str) -> Result<Option<String>, GitHubError> {
        self.api_content(&format!("repos/{}/{}/readme", owner, repo))
            .await
    }

    async fn api_content(&self, endpoint: &str) -> Result<Option<String>, GitHubError> {
        if !self.is_gh_available().await {
            return Err(GitHubError::NotInstalled);
        }

        let output = self.runner.run("gh", &["api", endpoint]).await?;
        if !output.success {
            if output.needs_login() {
                return Err(GitHubError::NotAuthenticated);
            }
            debug!(endpoint = %endpoint, stderr = %output.stderr.trim(), "gh api failed");
            return Ok(None);
        }

        Ok(decode_content(&output.stdout))
    }
}

impl Default for GhCliClient {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT_SECS)
    }
}

#[async_trait]
impl RepoFileFetcher for GhCliClient {
    async fn fetch_repo_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
    ) -> Result<Option<String>, GitHubError> {
        let path = path.trim_start_matches('/');
        self.api_content(&format!("repos/{}/{}/contents/{}", owner, repo, path))
            .await
    }
}

/// Decode the base64 `content` field of a GitHub contents response
fn decode_content(response: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(response).ok()?;
    let encoded = value.get("content")?.as_str()?;
    if encoded.is_empty() {
        return None;
    }

    // The API wraps base64 at 60 columns
    let cleaned: String = encoded.chars().filter(|c| *c != '\n' && *c != '\r').collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(cleaned)
        .ok()?;
    String::from_utf8(bytes).ok()
}

/// Extract `(owner, repo)` from a github.com URL.
///
/// Accepts `https://github.com/<owner>/<repo>` with an optional `.git` suffix
/// and any trailing path. Other hosts and relative URLs give `None`.
pub fn parse_github_url(url: &str) -> Option<(String, String)> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }

    let parsed = Url::parse(url).ok()?;
    if !parsed
        .host_str()
        .is_some_and(|host| host.eq_ignore_ascii_case("github.com"))
    {
        return None;
    }

    let mut segments = parsed.path_segments()?.filter(|s| !s.is_empty());
    let owner = segments.next()?;
    let repo = segments.next()?;
    let repo = match repo.len().checked_sub(4) {
        Some(cut)
            if repo
                .get(cut..)
                .is_some_and(|suffix| suffix.eq_ignore_ascii_case(".git")) =>
        {
            &repo[..cut]
        }
        _ => repo,
    };

    if repo.is_empty() {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}
