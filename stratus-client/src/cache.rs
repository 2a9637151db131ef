//! Client-side caching: a rolling in-memory window of live readings per
//! device, and a TTL cache with optional on-disk persistence for query
//! results.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dashmap::DashMap;
use jiff::{SignedDuration, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use stratus_core::{DeviceId, Reading};

const FILE_PREFIX: &str = "stratus_cache_";

/// Per-device rolling window of readings, ordered by timestamp.
///
/// Merging is idempotent: a reading whose timestamp is already present
/// replaces the stored one instead of duplicating it. Each merge prunes
/// everything older than the horizon. The per-device map entry lock
/// serializes writers for the same device.
pub struct RollingWindowCache {
    windows: DashMap<DeviceId, Vec<Reading>>,
    horizon: Duration,
}

impl RollingWindowCache {
    pub fn new(horizon: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            horizon,
        }
    }

    fn cutoff(&self) -> Timestamp {
        let horizon = SignedDuration::try_from(self.horizon).unwrap_or(SignedDuration::MAX);
        Timestamp::now().checked_sub(horizon).unwrap_or(Timestamp::MIN)
    }

    /// Replace the device's window with a historical batch.
    pub fn seed(&self, device: &DeviceId, mut readings: Vec<Reading>) {
        readings.sort_by_key(|r| r.timestamp);
        readings.dedup_by_key(|r| r.timestamp);
        let cutoff = self.cutoff();
        readings.retain(|r| r.timestamp > cutoff);
        self.windows.insert(device.clone(), readings);
    }

    /// Merge one live reading into its device's window and return the
    /// pruned window.
    pub fn merge(&self, reading: Reading) -> Vec<Reading> {
        let mut window = self.windows.entry(reading.device_id.clone()).or_default();
        match window.binary_search_by_key(&reading.timestamp, |r| r.timestamp) {
            Ok(i) => window[i] = reading,
            Err(i) => window.insert(i, reading),
        }
        let cutoff = self.cutoff();
        window.retain(|r| r.timestamp > cutoff);
        window.clone()
    }

    pub fn snapshot(&self, device: &DeviceId) -> Vec<Reading> {
        self.windows
            .get(device)
            .map(|w| w.clone())
            .unwrap_or_default()
    }

    pub fn evict(&self, device: &DeviceId) {
        self.windows.remove(device);
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct Entry<T> {
    value: T,
    expires_at: Timestamp,
}

impl<T> Entry<T> {
    fn is_expired(&self) -> bool {
        self.expires_at <= Timestamp::now()
    }
}

/// Bounded TTL cache for query results, with optional persistence to a
/// directory of per-key JSON files.
///
/// Expiry is lazy: entries are dropped when read or when an insert needs
/// room. When the cache is full, expired entries are purged and the
/// insert retried once; if it is still full the insert is skipped, since
/// a cache refusal must never fail the surrounding query.
pub struct TtlCache<T> {
    entries: DashMap<Box<str>, Entry<T>>,
    ttl: Duration,
    max_entries: usize,
    dir: Option<PathBuf>,
}

impl<T> TtlCache<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries,
            dir: None,
        }
    }

    /// Persist entries under `dir` and load whatever unexpired entries a
    /// previous run left there.
    pub fn persistent(ttl: Duration, max_entries: usize, dir: impl Into<PathBuf>) -> Self {
        let mut cache = Self::new(ttl, max_entries);
        let dir = dir.into();
        cache.restore(&dir);
        cache.dir = Some(dir);
        cache
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn insert(&self, key: &str, value: T) {
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_entries {
            self.purge_expired();
            if self.entries.len() >= self.max_entries {
                debug!(key, "cache full, skipping insert");
                return;
            }
        }

        let entry = Entry {
            value,
            expires_at: Timestamp::now()
                + SignedDuration::try_from(self.ttl).unwrap_or(SignedDuration::MAX),
        };
        if let Some(dir) = &self.dir {
            persist_entry(dir, key, &entry);
        }
        self.entries.insert(key.into(), entry);
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
        if let Some(dir) = &self.dir {
            let _ = std::fs::remove_file(entry_path(dir, key));
        }
    }

    pub fn purge_expired(&self) {
        let expired: Vec<Box<str>> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }

    fn restore(&mut self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "no persisted cache to restore");
                return;
            }
        };

        for dirent in entries.flatten() {
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(key) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };

            let parsed = std::fs::read_to_string(dirent.path())
                .ok()
                .and_then(|text| serde_json::from_str::<Entry<T>>(&text).ok());
            match parsed {
                Some(entry) if !entry.is_expired() => {
                    self.entries.insert(key.into(), entry);
                }
                _ => {
                    // Stale or unreadable, clean it up.
                    let _ = std::fs::remove_file(dirent.path());
                }
            }
        }
        debug!(restored = self.entries.len(), "cache restored from disk");
    }
}

fn entry_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{FILE_PREFIX}{key}.json"))
}

fn persist_entry<T: Serialize>(dir: &Path, key: &str, entry: &Entry<T>) {
    let write = |payload: &str| std::fs::write(entry_path(dir, key), payload);
    match serde_json::to_string(entry) {
        Ok(payload) => {
            if write(&payload).is_err() {
                // Out of space, most likely. Drop stale files and retry once.
                purge_persisted(dir);
                if let Err(e) = write(&payload) {
                    warn!(key, error = %e, "failed to persist cache entry");
                }
            }
        }
        Err(e) => warn!(key, error = %e, "failed to serialize cache entry"),
    }
}

fn purge_persisted(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for dirent in entries.flatten() {
        let is_ours = dirent
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(FILE_PREFIX));
        if !is_ours {
            continue;
        }
        let expired = std::fs::read_to_string(dirent.path())
            .ok()
            .and_then(|text| serde_json::from_str::<Entry<serde_json::Value>>(&text).ok())
            .is_none_or(|entry| entry.is_expired());
        if expired {
            let _ = std::fs::remove_file(dirent.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use jiff::ToSpan;

    use super::*;

    fn reading(device: &str, at: Timestamp, temperature: f64) -> Reading {
        let mut r = Reading::empty(device.parse().unwrap(), at);
        r.temperature = Some(ordered_float::NotNan::new(temperature).unwrap());
        r
    }

    #[test]
    fn merge_keeps_timestamp_order() {
        let cache = RollingWindowCache::new(Duration::from_secs(3600));
        let device: DeviceId = "A-B-123".parse().unwrap();
        let now = Timestamp::now();

        cache.merge(reading("A-B-123", now, 1.0));
        cache.merge(reading("A-B-123", now - 10.seconds(), 2.0));
        let window = cache.merge(reading("A-B-123", now - 5.seconds(), 3.0));

        assert_eq!(window.len(), 3);
        assert!(window.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(cache.snapshot(&device).len(), 3);
    }

    #[test]
    fn merge_is_idempotent_per_timestamp() {
        let cache = RollingWindowCache::new(Duration::from_secs(3600));
        let now = Timestamp::now();

        cache.merge(reading("A-B-123", now, 1.0));
        let window = cache.merge(reading("A-B-123", now, 9.0));

        assert_eq!(window.len(), 1);
        assert_eq!(window[0].temperature.map(|t| t.into_inner()), Some(9.0));
    }

    #[test]
    fn merge_prunes_beyond_horizon() {
        let cache = RollingWindowCache::new(Duration::from_secs(60));
        let now = Timestamp::now();

        cache.merge(reading("A-B-123", now - 300.seconds(), 1.0));
        let window = cache.merge(reading("A-B-123", now, 2.0));

        assert_eq!(window.len(), 1);
        assert_eq!(window[0].timestamp, now);
    }

    #[test]
    fn seed_replaces_and_sorts() {
        let cache = RollingWindowCache::new(Duration::from_secs(3600));
        let device: DeviceId = "M-02".parse().unwrap();
        let now = Timestamp::now();

        cache.merge(reading("M-02", now - 1.seconds(), 0.0));
        cache.seed(
            &device,
            vec![
                reading("M-02", now, 2.0),
                reading("M-02", now - 20.seconds(), 1.0),
            ],
        );

        let window = cache.snapshot(&device);
        assert_eq!(window.len(), 2);
        assert!(window[0].timestamp < window[1].timestamp);
    }

    #[test]
    fn ttl_cache_expires_lazily() {
        let cache: TtlCache<String> = TtlCache::new(Duration::ZERO, 10);
        cache.insert("k", "v".to_string());
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn ttl_cache_serves_fresh_entries() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(300), 10);
        cache.insert("current_M-X-001", "payload".to_string());
        assert_eq!(cache.get("current_M-X-001"), Some("payload".to_string()));
    }

    #[test]
    fn full_cache_skips_insert_when_nothing_is_expired() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(300), 2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);
        assert_eq!(cache.get("c"), None);
        assert_eq!(cache.get("a"), Some(1));
    }

    #[test]
    fn persisted_entries_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache: TtlCache<String> =
                TtlCache::persistent(Duration::from_secs(300), 10, dir.path());
            cache.insert("history_A-B-123", "rows".to_string());
        }

        let restored: TtlCache<String> =
            TtlCache::persistent(Duration::from_secs(300), 10, dir.path());
        assert_eq!(restored.get("history_A-B-123"), Some("rows".to_string()));
    }

    #[test]
    fn expired_persisted_entries_are_cleaned_on_restore() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache: TtlCache<String> = TtlCache::persistent(Duration::ZERO, 10, dir.path());
            cache.insert("stale", "old".to_string());
        }

        let restored: TtlCache<String> =
            TtlCache::persistent(Duration::from_secs(300), 10, dir.path());
        assert_eq!(restored.get("stale"), None);
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
