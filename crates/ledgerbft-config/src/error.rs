//! Errors raised while reading or checking a replica's configuration.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("general.batch_size must be positive")]
    ZeroBatchSize,

    #[error("general.timeout.batch_ms must be positive")]
    ZeroBatchTimeout,

    #[error("{n} replicas cannot tolerate {f} Byzantine faults (need n >= 3f + 1)")]
    TooFewReplicas { n: usize, f: usize },

    #[error("replica {id} is outside the cluster of {n} replicas")]
    ReplicaOutOfRange { id: u64, n: usize },

    #[error("no home directory to hold the user configuration")]
    NoUserConfigDir,
}
