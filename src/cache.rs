use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn canonical(v: &serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<&String, serde_json::Value> = map.iter().map(|(k, v)| (k, canonical(v))).collect();
            serde_json::Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Key over the sorted-key JSON form, so logically equal payloads hash equally.
pub fn key_for(payload: &serde_json::Value) -> String {
    let body = serde_json::to_string(&canonical(payload)).unwrap_or_default();
    sha256_hex(body.as_bytes())
}

pub fn key_for_text(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Serialize, Deserialize)]
struct Entry<T> {
    created_at: DateTime<Utc>,
    value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
}

/// File-per-key JSON cache. Reads never fail: a miss, an unreadable file and
/// an expired entry all come back as `None`.
#[derive(Debug, Clone)]
pub struct JsonCache {
    dir: PathBuf,
    ttl: Option<Duration>,
}

impl JsonCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Option<Duration>) -> Self {
        Self { dir: dir.into(), ttl }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.path_for(key);
        let raw = fs::read_to_string(&path).ok()?;
        let entry: Entry<T> = match serde_json::from_str(&raw) {
            Ok(e) => e,
            Err(e) => {
                debug!("unreadable cache entry {}: {}", path.display(), e);
                return None;
            }
        };
        if let Some(ttl) = self.ttl {
            let age = Utc::now().signed_duration_since(entry.created_at);
            if age.to_std().map(|a| a > ttl).unwrap_or(false) {
                debug!("cache entry {} expired", key);
                let _ = fs::remove_file(&path);
                return None;
            }
        }
        Some(entry.value)
    }

    /// Best effort; failures are logged and swallowed.
    pub fn store<T: Serialize>(&self, key: &str, value: &T) {
        if let Err(e) = self.try_store(key, value) {
            warn!("cache write failed for {}: {}", key, e);
        }
    }

    fn try_store<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let entry = Entry { created_at: Utc::now(), value };
        let body = serde_json::to_string_pretty(&entry)?;
        let path = self.path_for(key);
        let tmp = self.dir.join(format!("{key}.json.tmp"));
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn clear_older_than(&self, max_age: Duration) -> usize {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let created = fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<Entry<serde_json::Value>>(&raw).ok())
                .map(|e| e.created_at);
            let stale = match created {
                Some(ts) => Utc::now().signed_duration_since(ts).to_std().map(|a| a > max_age).unwrap_or(false),
                None => true,
            };
            if stale && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                    stats.entries += 1;
                    stats.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn key_ignores_field_order() {
        let a = json!({"type": "intro", "language": "CS"});
        let b = json!({"language": "CS", "type": "intro"});
        assert_eq!(key_for(&a), key_for(&b));
        assert_ne!(key_for(&a), key_for(&json!({"type": "transition", "language": "CS"})));
        assert_eq!(key_for(&a).len(), 64);
    }

    #[test]
    fn store_then_load() {
        let tmp = TempDir::new().unwrap();
        let cache = JsonCache::new(tmp.path().join("c"), None);
        assert_eq!(cache.load::<String>("k"), None);
        cache.store("k", &"hello".to_string());
        assert_eq!(cache.load::<String>("k").as_deref(), Some("hello"));
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn expired_entries_are_dropped() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().to_path_buf();
        let old = json!({"created_at": "2000-01-01T00:00:00Z", "value": "stale"});
        fs::write(dir.join("old.json"), old.to_string()).unwrap();

        let cache = JsonCache::new(&dir, Some(Duration::from_secs(3600)));
        assert_eq!(cache.load::<String>("old"), None);
        assert!(!dir.join("old.json").exists());
    }

    #[test]
    fn corrupt_entries_are_misses_and_get_pruned() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("bad.json"), "{not json").unwrap();
        let cache = JsonCache::new(tmp.path(), None);
        assert_eq!(cache.load::<String>("bad"), None);
        cache.store("good", &1u32);
        assert_eq!(cache.clear_older_than(Duration::from_secs(60)), 1);
        assert_eq!(cache.load::<u32>("good"), Some(1));
    }
}
