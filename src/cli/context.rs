//! Shared command context for CLI commands
//!
//! Loads the configuration and points an API client at the running service.

use crate::cli::client::ApiClient;
use mergeq::config::{Config, default_config_path};
use mergeq::error::Result;
use std::path::Path;
use tracing::debug;

/// Shared context for client commands
pub struct CommandContext {
    /// Client for the queue service
    pub client: ApiClient,
}

impl CommandContext {
    /// Create a command context.
    ///
    /// `server` overrides the service address derived from `listen`.
    pub fn new(config_path: Option<&Path>, server: Option<&str>) -> Result<Self> {
        let config = load_config(config_path)?;
        let base = server.map_or_else(|| format!("http://{}", config.listen), str::to_string);
        debug!(server = %base, "using queue service");
        let client = ApiClient::new(base)?;
        Ok(Self { client })
    }
}

/// Load the config file, falling back to defaults when the default location
/// does not exist. An explicitly named file must exist.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        return Config::load(path);
    }
    let path = default_config_path()?;
    if path.exists() {
        Config::load(&path)
    } else {
        debug!(path = %path.display(), "no config file, using defaults");
        Ok(Config::default())
    }
}
