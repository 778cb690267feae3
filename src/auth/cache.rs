//! Validation result cache keyed by credential fingerprint.
//!
//! Cache keys are SHA-256 fingerprints so the secret itself is never held
//! beyond the validation call. Positive and negative results carry separate
//! TTLs; authority outages are never cached.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::error::AuthError;
use super::principal::Principal;

/// Hex SHA-256 fingerprint of a bearer value.
pub fn fingerprint(bearer: &str) -> String {
    let digest = Sha256::digest(bearer.as_bytes());
    hex::encode(digest)
}

#[derive(Clone)]
struct CachedEntry {
    result: Result<Principal, AuthError>,
    inserted_at: Instant,
}

/// Bounded LRU over validation results.
pub struct CredentialCache {
    entries: Mutex<LruCache<String, CachedEntry>>,
    positive_ttl: Duration,
    negative_ttl: Duration,
}

impl CredentialCache {
    pub fn new(capacity: usize, positive_ttl: Duration, negative_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            positive_ttl,
            negative_ttl,
        }
    }

    fn ttl_for(&self, result: &Result<Principal, AuthError>) -> Duration {
        if result.is_ok() {
            self.positive_ttl
        } else {
            self.negative_ttl
        }
    }

    /// Look up an unexpired entry; expired entries are evicted on read.
    pub fn get(&self, fp: &str) -> Option<Result<Principal, AuthError>> {
        let mut entries = self.entries.lock();
        let entry = entries.get(fp)?.clone();
        if entry.inserted_at.elapsed() > self.ttl_for(&entry.result) {
            entries.pop(fp);
            return None;
        }
        Some(entry.result)
    }

    /// Cache a validation outcome. Transient authority failures are skipped.
    pub fn put(&self, fp: String, result: Result<Principal, AuthError>) {
        if let Err(e) = &result {
            if !e.is_definitive() {
                return;
            }
        }
        self.entries.lock().put(
            fp,
            CachedEntry {
                result,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop every cached entry for the given key id (revocation signal).
    pub fn invalidate_key(&self, key_id: &str) {
        let mut entries = self.entries.lock();
        let stale: Vec<String> = entries
            .iter()
            .filter_map(|(fp, entry)| match &entry.result {
                Ok(p) if p.key_id == key_id => Some(fp.clone()),
                _ => None,
            })
            .collect();
        for fp in stale {
            entries.pop(&fp);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
