//! Server-rendered snapshot cache keyed by canonical cache keys.
//!
//! During server-side rendering each one-shot fetch result is recorded
//! here under its canonical key, then the whole cache is serialized into
//! the page payload. During hydration the client rebuilds the cache from
//! the payload and each entry is consumed exactly once before being
//! superseded by a live subscription.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

/// Keyed shared state for hydration snapshots.
///
/// Entries are written once on the server, read (and removed) once on the
/// client. A sync `Mutex` suffices: no lock is held across an await.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    entries: Mutex<HashMap<String, Value>>,
}

impl SnapshotCache {
    /// An empty cache (server side, before any fetch).
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a cache from the serialized page payload.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the payload is not a JSON object
    /// of snapshot entries.
    pub fn hydrate(payload: &str) -> Result<Self, serde_json::Error> {
        let entries: HashMap<String, Value> = serde_json::from_str(payload)?;
        tracing::debug!(entries = entries.len(), "snapshot cache hydrated");
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }

    /// Serialize the current entries into the page payload.
    pub fn to_payload(&self) -> String {
        let entries = self.entries.lock().expect("snapshot cache lock poisoned");
        // A HashMap<String, Value> always serializes.
        serde_json::to_string(&*entries).unwrap_or_else(|_| "{}".to_string())
    }

    /// Record a server-side fetch result under its canonical key.
    pub fn insert(&self, key: String, value: Value) {
        self.entries
            .lock()
            .expect("snapshot cache lock poisoned")
            .insert(key, value);
    }

    /// Non-consuming read, used on the server to avoid refetching a key
    /// another call site already resolved during the same render.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .lock()
            .expect("snapshot cache lock poisoned")
            .get(key)
            .cloned()
    }

    /// Consume an entry exactly once during hydration.
    ///
    /// Returns `None` on the second and subsequent calls for the same key,
    /// which forces later consumers onto the fetch path instead of reusing
    /// a snapshot that a live subscription has already superseded.
    pub fn take(&self, key: &str) -> Option<Value> {
        self.entries
            .lock()
            .expect("snapshot cache lock poisoned")
            .remove(key)
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("snapshot cache lock poisoned").len()
    }

    /// `true` if no entries are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
