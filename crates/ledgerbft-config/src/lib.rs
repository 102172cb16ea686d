//! Configuration management for ledgerbft
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (LBFT_* prefix, highest precedence)
//! 2. ledgerbft.local.toml (gitignored, local overrides)
//! 3. ledgerbft.toml (git-tracked, deployment config)
//! 4. ~/.config/ledgerbft/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::{ConfigLayer, ConfigLoader, LoadedConfig};
pub use paths::Paths;

/// Main ledgerbft configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerBftConfig {
    pub replica: ReplicaConfig,
    pub general: GeneralConfig,
    pub broadcast: BroadcastConfig,
    pub runtime: RuntimeConfig,
}

/// Identity of this replica and the shape of the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    pub id: u64,
    /// Total number of replicas.
    pub n: usize,
    /// Number of Byzantine faults tolerated.
    pub f: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self { id: 0, n: 4, f: 1 }
    }
}

/// Batching parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Number of requests that triggers an immediate batch cut.
    pub batch_size: usize,
    pub timeout: TimeoutConfig,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            timeout: TimeoutConfig::default(),
        }
    }
}

/// Timeouts, in milliseconds.
///
/// The batching layer requires `batch < request < null_request`; violations
/// are corrected when the coordinator starts, not rejected here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub batch_ms: u64,
    pub request_ms: u64,
    /// Zero disables null requests.
    pub null_request_ms: u64,
    pub broadcast_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            batch_ms: 1_000,
            request_ms: 2_000,
            null_request_ms: 0,
            broadcast_ms: 1_000,
        }
    }
}

impl TimeoutConfig {
    pub fn batch(&self) -> Duration {
        Duration::from_millis(self.batch_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn null_request(&self) -> Duration {
        Duration::from_millis(self.null_request_ms)
    }

    pub fn broadcast(&self) -> Duration {
        Duration::from_millis(self.broadcast_ms)
    }

    /// Pairs that break `batch < request < null_request`, as configured.
    pub fn ordering_warnings(&self) -> Vec<TimeoutWarning> {
        let mut warnings = Vec::new();
        if self.batch_ms >= self.request_ms {
            warnings.push(TimeoutWarning::BatchNotBelowRequest {
                batch_ms: self.batch_ms,
                request_ms: self.request_ms,
            });
        }
        if self.null_request_ms != 0 && self.request_ms >= self.null_request_ms {
            warnings.push(TimeoutWarning::RequestNotBelowNullRequest {
                request_ms: self.request_ms,
                null_request_ms: self.null_request_ms,
            });
        }
        warnings
    }
}

/// A misordered timeout pair. The coordinator raises the later timeout
/// when it starts; loading reports it so operators can fix the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutWarning {
    BatchNotBelowRequest { batch_ms: u64, request_ms: u64 },
    RequestNotBelowNullRequest { request_ms: u64, null_request_ms: u64 },
}

impl fmt::Display for TimeoutWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BatchNotBelowRequest {
                batch_ms,
                request_ms,
            } => write!(f, "batch_ms ({batch_ms}) is not below request_ms ({request_ms})"),
            Self::RequestNotBelowNullRequest {
                request_ms,
                null_request_ms,
            } => write!(
                f,
                "request_ms ({request_ms}) is not below null_request_ms ({null_request_ms})"
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Attempts per unicast before the send is given up and logged.
    pub max_attempts: u32,
    /// Messages each peer's outbound queue holds before new ones are dropped.
    pub outbound_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            outbound_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of the coordinator's bounded event inbox.
    pub queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
        }
    }
}

impl LedgerBftConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific deployment directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a single TOML file, without layering.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Create a development configuration: four replicas, small batches and
    /// short timeouts.
    pub fn development() -> Self {
        Self {
            general: GeneralConfig {
                batch_size: 2,
                timeout: TimeoutConfig {
                    batch_ms: 100,
                    request_ms: 500,
                    null_request_ms: 1_000,
                    broadcast_ms: 200,
                },
            },
            ..Default::default()
        }
    }

    /// Create a production configuration
    pub fn production() -> Self {
        Self::default()
    }

    /// Checks the structural invariants the batching layer cannot repair.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ReplicaConfig { id, n, f } = self.replica;
        if self.general.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.general.timeout.batch_ms == 0 {
            return Err(ConfigError::ZeroBatchTimeout);
        }
        if n < 3 * f + 1 {
            return Err(ConfigError::TooFewReplicas { n, f });
        }
        if id >= n as u64 {
            return Err(ConfigError::ReplicaOutOfRange { id, n });
        }
        Ok(())
    }
}
