use std::path::PathBuf;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cache::{JsonCache, key_for};
use crate::paths::PathResolver;

/// Cache for generated intros and transitions, keyed by the prompt payload.
/// Entries never expire; bump the payload `version` to invalidate them.
#[derive(Debug, Clone)]
pub struct NarrationCache {
    inner: JsonCache,
}

impl Default for NarrationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NarrationCache {
    pub fn new() -> Self {
        Self::at(PathResolver::outputs_base().join(".cache").join("narration_core"))
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { inner: JsonCache::new(dir, None) }
    }

    pub fn load<T: DeserializeOwned>(&self, payload: &serde_json::Value) -> Option<T> {
        self.inner.load(&key_for(payload))
    }

    /// Returns the key even when the write fails.
    pub fn save<T: Serialize>(&self, payload: &serde_json::Value, data: &T) -> String {
        let key = key_for(payload);
        self.inner.store(&key, data);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn save_then_load_by_payload() {
        let tmp = TempDir::new().unwrap();
        let cache = NarrationCache::at(tmp.path());
        let payload = json!({"type": "intro", "version": "v2"});
        assert_eq!(cache.load::<serde_json::Value>(&payload), None);
        let key = cache.save(&payload, &json!({"text": "Úvod."}));
        assert_eq!(key, key_for(&payload));
        let got: serde_json::Value = cache.load(&payload).unwrap();
        assert_eq!(got["text"], "Úvod.");
    }

    #[test]
    fn unwritable_dir_still_returns_key() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("blocker");
        std::fs::write(&file, "x").unwrap();
        let cache = NarrationCache::at(file.join("sub"));
        let key = cache.save(&json!({"a": 1}), &json!({"text": "t"}));
        assert_eq!(key.len(), 64);
    }
}
