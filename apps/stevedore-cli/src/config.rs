//! CLI configuration.
//!
//! Stored as TOML at `~/.config/stevedore/stevedore.toml`:
//!
//! ```toml
//! state_path = "/home/me/.config/stevedore/transfers.json"
//!
//! [engine]
//! upload_chunk_size = 10485760
//!
//! [engine.retry]
//! max_attempts = 3
//! base_delay = 1000
//!
//! [b2]
//! api_url = "https://api005.backblazeb2.com"
//! auth_token = "..."
//! bucket_id = "..."
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use stevedore_backend::B2Config;
use stevedore_engine::EngineConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Transfer state file. Defaults to `transfers.json` next to this file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,

    pub engine: EngineConfig,

    /// Needed for uploads only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b2: Option<B2Config>,
}

impl CliConfig {
    /// Loads `path`, writing a default file first when it does not exist.
    pub fn load_or_init(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            tracing::info!(path = %path.display(), "wrote default configuration");
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        set_permissions_0600(path);
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// State file to use: the configured one, else the platform default.
    pub fn resolve_state_path(&self) -> anyhow::Result<PathBuf> {
        match &self.state_path {
            Some(path) => Ok(path.clone()),
            None => stevedore_store::default_state_path()
                .context("cannot determine a config directory; set state_path"),
        }
    }

    pub fn b2(&self) -> anyhow::Result<&B2Config> {
        self.b2
            .as_ref()
            .context("no [b2] section in the configuration")
    }
}

/// `stevedore/stevedore.toml` under the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    stevedore_store::config_dir().map(|d| d.join("stevedore").join("stevedore.toml"))
}

// The file may hold an account token.
fn set_permissions_0600(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}
