//! Idempotent response cache keyed by request digest.
//!
//! The digest covers the virtual-model id and the canonicalized request:
//! object keys sorted recursively, volatile fields (top-level `metadata` and
//! any `id`/`request_id`/`trace_id` keys) stripped, so semantically identical
//! requests collide regardless of field order or per-call noise. Expired
//! entries read as absent and are evicted lazily on read or by the sweeper.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const VOLATILE_KEYS: [&str; 3] = ["id", "request_id", "trace_id"];

struct CacheEntry {
    response: serde_json::Value,
    expires_at: Instant,
}

/// Counters exposed through the gateway status surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
}

/// TTL cache over upsert-semantics concurrent map; later writes win.
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        }
    }

    /// Cache key for a request against a virtual model.
    pub fn digest(virtual_model_id: &str, payload: &serde_json::Value) -> String {
        let canonical = canonicalize(payload, true);
        let serialized = serde_json::to_string(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(virtual_model_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(serialized.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Deep copy of an unexpired entry, counting hit or miss.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.response.clone());
            }
        }
        // lazy eviction of the expired entry
        self.entries
            .remove_if(key, |_, entry| entry.expires_at <= now);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, key: String, response: serde_json::Value) {
        self.stores.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key,
            CacheEntry {
                response,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop every expired entry.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.stores.store(0, Ordering::Relaxed);
    }
}

/// Rebuild a value with object keys sorted and volatile fields removed.
fn canonicalize(value: &serde_json::Value, top_level: bool) -> serde_json::Value {
    match value {
        serde_json::Value::Object(fields) => {
            let mut keys: Vec<&String> = fields
                .keys()
                .filter(|k| !VOLATILE_KEYS.contains(&k.as_str()))
                .filter(|k| !(top_level && k.as_str() == "metadata"))
                .collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&fields[key], false));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items.iter().map(|item| canonicalize(item, false)).collect(),
        ),
        other => other.clone(),
    }
}
