//! Control-plane (catalog service) configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Connection settings for the catalog distribution service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Base URL of the config service
    pub url: String,
    /// Where the durable snapshot is kept between restarts
    pub snapshot_path: PathBuf,
    pub request_timeout_seconds: u64,
    /// Long-poll timeout for the watch stream
    pub watch_timeout_seconds: u64,
    /// Snapshot age past which readiness degrades
    pub max_staleness_seconds: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:7000".to_string(),
            snapshot_path: PathBuf::from("/var/lib/gantry/catalog.json"),
            request_timeout_seconds: 10,
            watch_timeout_seconds: 60,
            max_staleness_seconds: 600,
        }
    }
}
