use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::schema::ManifoldConfig;
use manifold_core::{RelayError, Result};

/// Loads the Manifold configuration from disk with env overrides.
pub struct ConfigLoader {
    config: ManifoldConfig,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > MANIFOLD_CONFIG env >
    /// ./manifold.toml > ~/.manifold/manifold.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("MANIFOLD_CONFIG") {
            return PathBuf::from(p);
        }
        let cwd = PathBuf::from("manifold.toml");
        if cwd.exists() {
            return cwd;
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".manifold")
            .join("manifold.toml")
    }

    /// Load from disk, falling back to defaults when the file is absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<ManifoldConfig>(&raw).map_err(|e| {
                RelayError::internal(format!("failed to parse {}: {e}", config_path.display()))
            })?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            ManifoldConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{w}");
                }
            }
            Err(e) => return Err(RelayError::internal(format!("invalid config: {e}"))),
        }

        Ok(Self {
            config,
            config_path,
        })
    }

    pub fn get(&self) -> ManifoldConfig {
        self.config.clone()
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Env overrides beat the file for deployment-shaped settings.
    fn apply_env_overrides(mut config: ManifoldConfig) -> ManifoldConfig {
        if let Ok(v) = std::env::var("MANIFOLD_LISTEN") {
            config.server.listen = v;
        }
        if let Ok(v) = std::env::var("MANIFOLD_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("MANIFOLD_KEY_PREFIX") {
            config.auth.key_prefix = v;
        }
        if let Ok(v) = std::env::var("MANIFOLD_PROXY") {
            config.net.proxy = Some(v);
        }
        if let Ok(v) = std::env::var("MANIFOLD_BLOCK_INTERNAL")
            && let Ok(flag) = v.parse::<bool>()
        {
            config.net.block_internal = flag;
        }
        config
    }
}
