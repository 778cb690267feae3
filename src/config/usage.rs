//! Usage pipeline configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Durable buffer and publisher settings for usage accounting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// Directory holding the on-disk spool
    pub spool_dir: PathBuf,
    /// Ceiling on spooled records before drop-oldest engages
    pub max_spool_records: usize,
    /// Ceiling on spool bytes before drop-oldest engages
    pub max_spool_bytes: u64,
    /// In-memory channel depth between handlers and the worker
    pub channel_capacity: usize,
    /// Records per publish batch
    pub batch_size: usize,
    /// Longest a partial batch may linger before publishing
    pub batch_linger_ms: u64,
    /// Channel depth past which readiness degrades
    pub high_water_records: usize,
    /// Kafka bootstrap servers; empty selects the log-only publisher
    pub bus_brokers: String,
    /// Topic the records are published on
    pub bus_topic: String,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from("/var/lib/gantry/usage"),
            max_spool_records: 100_000,
            max_spool_bytes: 256 * 1024 * 1024,
            channel_capacity: 4096,
            batch_size: 100,
            batch_linger_ms: 1000,
            high_water_records: 50_000,
            bus_brokers: String::new(),
            bus_topic: "gantry.usage.v1".to_string(),
        }
    }
}
