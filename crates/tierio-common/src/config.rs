//! Configuration types for Tierio
//!
//! This module defines configuration structures used across components.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Root configuration for the Tierio master
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Master behavior configuration
    #[serde(default)]
    pub master: MasterConfig,
    /// Journal configuration
    #[serde(default)]
    pub journal: JournalConfig,
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            master: MasterConfig::default(),
            journal: JournalConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

/// Master behavior configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MasterConfig {
    /// A worker whose last heartbeat is older than this is considered lost
    pub worker_timeout_ms: u64,
    /// Period of the lost-worker detection sweep
    pub heartbeat_interval_ms: u64,
    /// Storage tier aliases in global order, fastest first. The position of
    /// an alias in this list is its ordinal; it must be consistent across
    /// masters.
    pub tiers: Vec<String>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            worker_timeout_ms: 300_000,
            heartbeat_interval_ms: 10_000,
            tiers: vec!["MEM".to_string(), "SSD".to_string(), "HDD".to_string()],
        }
    }
}

/// Journal configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Directory holding the journal log. When unset the master runs with an
    /// in-memory journal and recovers nothing across restarts.
    pub dir: Option<PathBuf>,
}

/// Network configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address for the master gRPC server
    pub grpc_listen: SocketAddr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            grpc_listen: "0.0.0.0:19998".parse().unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.master.worker_timeout_ms, 300_000);
        assert_eq!(config.master.tiers[0], "MEM");
        assert_eq!(config.network.grpc_listen.port(), 19998);
        assert!(config.journal.dir.is_none());
    }
}
