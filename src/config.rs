//! Service configuration
//!
//! Read from a TOML file, by default `<config dir>/mergeq/config.toml`.

use crate::error::{Error, Result};
use crate::rules::AutoMergeRule;
use crate::types::RepositoryId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the HTTP service binds to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Where queue and check state is persisted
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Where repository working trees are cloned
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Git remote name inside each working tree
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Clone URL template (`{owner}` and `{name}` are substituted)
    #[serde(default = "default_remote_url")]
    pub remote_url: String,
    /// Deadline for an entry in `merging`
    #[serde(default = "default_merging_timeout")]
    pub merging_timeout_minutes: u64,
    /// How long to wait for a repository's workspace lock
    #[serde(default = "default_acquire_timeout")]
    pub workspace_acquire_timeout_secs: u64,
    /// Identity used for merge commits
    #[serde(default)]
    pub committer: CommitterConfig,
    /// GitHub connection settings
    #[serde(default)]
    pub github: GitHubConfig,
    /// Queued repositories
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

/// Identity used for merge commits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitterConfig {
    /// Author/committer name
    pub name: String,
    /// Author/committer email
    pub email: String,
}

impl Default for CommitterConfig {
    fn default() -> Self {
        Self {
            name: "mergeq".to_string(),
            email: "mergeq@localhost".to_string(),
        }
    }
}

/// GitHub connection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitHubConfig {
    /// GitHub Enterprise host
    #[serde(default)]
    pub host: Option<String>,
    /// Explicit API base URL (overrides `host`)
    #[serde(default)]
    pub api_base: Option<String>,
}

/// A repository served by the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Owner (user or organization)
    pub owner: String,
    /// Repository name
    pub name: String,
    /// Branch changes are merged into
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    /// Checks that must pass before an entry may merge
    #[serde(default)]
    pub required_checks: Vec<String>,
    /// Reviewers whose approval counts as code-owner approval
    #[serde(default)]
    pub code_owners: Vec<String>,
    /// Auto-merge rules in evaluation order
    #[serde(default)]
    pub auto_merge_rules: Vec<AutoMergeRule>,
}

impl RepositoryConfig {
    /// Repository ID
    pub fn id(&self) -> RepositoryId {
        RepositoryId::new(&self.owner, &self.name)
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mergeq")
}

fn default_workspace_root() -> PathBuf {
    default_state_dir().join("workspaces")
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_remote_url() -> String {
    "https://github.com/{owner}/{name}.git".to_string()
}

const fn default_merging_timeout() -> u64 {
    30
}

const fn default_acquire_timeout() -> u64 {
    300
}

fn default_base_branch() -> String {
    "main".to_string()
}

/// Default config file location
pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("mergeq").join("config.toml"))
        .ok_or_else(|| Error::Config("could not determine config directory".to_string()))
}

impl Config {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for repo in &self.repositories {
            if repo.owner.is_empty() || repo.name.is_empty() {
                return Err(Error::Config(
                    "repository owner and name must not be empty".to_string(),
                ));
            }
            if repo.base_branch.is_empty() {
                return Err(Error::Config(format!("{} has an empty base_branch", repo.id())));
            }
            if !seen.insert(repo.id()) {
                return Err(Error::Config(format!("{} is configured twice", repo.id())));
            }
            if repo.auto_merge_rules.iter().any(|r| r.name.trim().is_empty()) {
                return Err(Error::Config(format!(
                    "{} has an auto-merge rule without a name",
                    repo.id()
                )));
            }
        }
        if self.merging_timeout_minutes == 0 {
            return Err(Error::Config("merging_timeout_minutes must be positive".to_string()));
        }
        if !self.remote_url.contains("{owner}") || !self.remote_url.contains("{name}") {
            return Err(Error::Config(
                "remote_url must contain {owner} and {name}".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings of one repository
    pub fn repository(&self, id: &RepositoryId) -> Option<&RepositoryConfig> {
        self.repositories.iter().find(|r| r.id() == *id)
    }

    /// Deadline for an entry in `merging`
    pub const fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merging_timeout_minutes.saturating_mul(60))
    }

    /// Workspace lock acquisition timeout
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.workspace_acquire_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            state_dir: default_state_dir(),
            workspace_root: default_workspace_root(),
            remote: default_remote(),
            remote_url: default_remote_url(),
            merging_timeout_minutes: default_merging_timeout(),
            workspace_acquire_timeout_secs: default_acquire_timeout(),
            committer: CommitterConfig::default(),
            github: GitHubConfig::default(),
            repositories: Vec::new(),
        }
    }
}
