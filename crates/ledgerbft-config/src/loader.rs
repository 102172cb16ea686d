//! Layered loading of a replica's configuration.
//!
//! Layers, lowest precedence first: built-in defaults, the user file
//! (`~/.config/ledgerbft/config.toml`), the deployment file
//! (`ledgerbft.toml`), its uncommitted override (`ledgerbft.local.toml`) and
//! `LBFT_*` environment variables such as `LBFT_GENERAL__BATCH_SIZE=100`.

use crate::{LedgerBftConfig, Paths, TimeoutWarning};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A source that contributed to a loaded configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLayer {
    Defaults,
    User(PathBuf),
    Deployment(PathBuf),
    Local(PathBuf),
    /// Environment variables under this prefix.
    Environment(String),
}

impl ConfigLayer {
    /// File behind this layer, if it is file-backed.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::User(path) | Self::Deployment(path) | Self::Local(path) => Some(path),
            Self::Defaults | Self::Environment(_) => None,
        }
    }
}

/// A validated configuration and how it was assembled.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: LedgerBftConfig,
    /// Contributing layers, lowest precedence first.
    pub layers: Vec<ConfigLayer>,
    /// Misordered timeouts the coordinator will correct at startup.
    pub timeout_warnings: Vec<TimeoutWarning>,
}

/// Builder for one configuration load.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    user_config: bool,
}

impl ConfigLoader {
    /// Loader rooted at the current directory.
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "LBFT".to_string(),
            user_config: true,
        }
    }

    /// Directory holding `ledgerbft.toml` and `ledgerbft.local.toml`.
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Ignores the user file, for hermetic loads.
    pub fn without_user_config(mut self) -> Self {
        self.user_config = false;
        self
    }

    /// File layers that exist on disk, lowest precedence first.
    fn file_layers(&self) -> Vec<ConfigLayer> {
        let mut layers = Vec::with_capacity(3);
        if self.user_config {
            if let Ok(path) = Paths::new().user_config_file() {
                layers.push(ConfigLayer::User(path));
            }
        }
        layers.push(ConfigLayer::Deployment(Paths::project_config_file(&self.project_dir)));
        layers.push(ConfigLayer::Local(Paths::local_config_file(&self.project_dir)));
        layers.retain(|layer| layer.path().is_some_and(Path::exists));
        layers
    }

    /// Loads and validates the configuration.
    pub fn load(self) -> Result<LedgerBftConfig> {
        Ok(self.load_detailed()?.config)
    }

    /// Loads and validates the configuration, reporting the layers used and
    /// any timeouts the coordinator will have to reorder.
    pub fn load_detailed(self) -> Result<LoadedConfig> {
        let defaults = config::Config::try_from(&LedgerBftConfig::default())
            .context("built-in defaults do not serialize")?;
        let mut builder = config::Config::builder().add_source(defaults);
        let mut layers = vec![ConfigLayer::Defaults];

        for layer in self.file_layers() {
            if let Some(path) = layer.path() {
                builder = builder.add_source(
                    config::File::from(path.to_path_buf()).format(config::FileFormat::Toml),
                );
            }
            layers.push(layer);
        }

        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        layers.push(ConfigLayer::Environment(self.env_prefix));

        let config: LedgerBftConfig = builder
            .build()
            .context("cannot merge configuration layers")?
            .try_deserialize()
            .context("merged configuration has the wrong shape")?;

        config
            .validate()
            .with_context(|| format!("invalid configuration for replica {}", config.replica.id))?;

        let timeout_warnings = config.general.timeout.ordering_warnings();
        for warning in &timeout_warnings {
            warn!(
                replica = config.replica.id,
                %warning,
                "misordered timeouts; the later one will be raised at startup"
            );
        }
        debug!(
            replica = config.replica.id,
            layers = layers.len(),
            batch_size = config.general.batch_size,
            "configuration loaded"
        );

        Ok(LoadedConfig {
            config,
            layers,
            timeout_warnings,
        })
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
