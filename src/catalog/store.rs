//! On-disk catalog snapshot persistence.
//!
//! The durable snapshot lets a restart serve traffic through a config
//! service outage. Writes go through a temp file and an atomic rename so a
//! crash never leaves a torn document.

use std::path::{Path, PathBuf};

use super::error::CatalogError;
use super::snapshot::CatalogDocument;

/// Reads and writes the durable catalog document.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted document, if any.
    pub fn load(&self) -> Result<Option<CatalogDocument>, CatalogError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let doc = serde_json::from_str(&content).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Ok(Some(doc))
    }

    /// Persist a document atomically (write temp, rename over target).
    pub fn save(&self, doc: &CatalogDocument) -> Result<(), CatalogError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let content =
            serde_json::to_vec_pretty(doc).map_err(|e| CatalogError::Parse(e.to_string()))?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
