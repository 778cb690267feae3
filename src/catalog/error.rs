//! Catalog error types

use thiserror::Error;

/// Errors from catalog lookups and snapshot maintenance
#[derive(Error, Debug)]
pub enum CatalogError {
    /// No policy exists for the (org, model) pair, including the wildcard org
    #[error("No routing policy for org '{org}' and model '{model}'")]
    PolicyMissing { org: String, model: String },

    /// A backend id was requested that the snapshot does not carry
    #[error("Unknown backend '{0}'")]
    BackendUnknown(String),

    /// The config service request failed
    #[error("Catalog fetch failed: {0}")]
    Fetch(String),

    /// The catalog document could not be decoded
    #[error("Failed to parse catalog document: {0}")]
    Parse(String),

    /// A document with no backends is never installed
    #[error("Catalog document contains no backends")]
    EmptyCatalog,

    /// On-disk snapshot could not be read or written
    #[error("Snapshot persistence failed: {0}")]
    Persist(#[from] std::io::Error),
}
