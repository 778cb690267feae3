//! Admin backend pins.
//!
//! A pin forces every request for an (org, model) pair onto one backend
//! until its TTL expires. Pins are process-local operator state, not part
//! of the catalog.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// One active pin
#[derive(Debug, Clone, Serialize)]
pub struct Pin {
    pub org_id: String,
    pub model: String,
    pub backend_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Pin {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Concurrent pin table keyed by (org, model).
#[derive(Default)]
pub struct PinStore {
    pins: DashMap<(String, String), Pin>,
}

impl PinStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace a pin.
    pub fn set(&self, pin: Pin) {
        self.pins
            .insert((pin.org_id.clone(), pin.model.clone()), pin);
    }

    /// Unexpired pin for (org, model); expired entries are reaped on read.
    pub fn get(&self, org_id: &str, model: &str) -> Option<Pin> {
        let key = (org_id.to_string(), model.to_string());
        let pin = self.pins.get(&key)?.clone();
        if pin.is_expired(Utc::now()) {
            drop(self.pins.remove(&key));
            return None;
        }
        Some(pin)
    }

    /// Remove a pin; returns it if one existed.
    pub fn clear(&self, org_id: &str, model: &str) -> Option<Pin> {
        self.pins
            .remove(&(org_id.to_string(), model.to_string()))
            .map(|(_, pin)| pin)
    }

    /// All unexpired pins.
    pub fn list(&self) -> Vec<Pin> {
        let now = Utc::now();
        self.pins
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| entry.value().clone())
            .collect()
    }
}
