//! On-disk content cache keyed by normalized URL.
//!
//! Layout under the cache directory:
//!
//! ```text
//! files/<sha256 of normalized url>
//! index.json
//! ```
//!
//! Entries older than the max age are dropped on read and during eviction.
//! When the total size exceeds the budget, the oldest entries are removed
//! until the total is back under 80% of the budget.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::normalize_url;
use crate::config::CacheSettings;
use crate::Result;

const INDEX_FILE: &str = "index.json";
const FILES_DIR: &str = "files";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    url: String,
    file: String,
    stored_at: DateTime<Utc>,
    size: u64,
}

/// Aggregate cache figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Disk-backed URL cache.
pub struct UrlCache {
    root: PathBuf,
    max_age: Duration,
    max_bytes: u64,
    state: Mutex<CacheState>,
}

impl UrlCache {
    /// Opens (or creates) a cache rooted at `settings.dir`.
    pub async fn open(settings: &CacheSettings) -> Result<Self> {
        Self::open_at(
            &settings.dir,
            Duration::from_secs(settings.max_age_secs),
            settings.max_bytes,
        )
        .await
    }

    pub async fn open_at(root: impl AsRef<Path>, max_age: Duration, max_bytes: u64) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(root.join(FILES_DIR)).await?;

        let index_path = root.join(INDEX_FILE);
        let entries = match tokio::fs::read(&index_path).await {
            Ok(raw) => match serde_json::from_slice::<Vec<CacheEntry>>(&raw) {
                Ok(list) => list.into_iter().map(|e| (e.url.clone(), e)).collect(),
                Err(e) => {
                    warn!("Discarding unreadable cache index {}: {}", index_path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        debug!("Opened URL cache at {} ({} entries)", root.display(), entries.len());

        Ok(Self {
            root,
            max_age,
            max_bytes,
            state: Mutex::new(CacheState {
                entries,
                ..Default::default()
            }),
        })
    }

    /// Returns the cached bytes for `url` if present and fresh.
    pub async fn get(&self, url: &str) -> Option<Vec<u8>> {
        let key = normalize_url(url);
        let mut state = self.state.lock().await;

        let entry = match state.entries.get(&key) {
            Some(entry) => entry.clone(),
            None => {
                state.misses += 1;
                return None;
            }
        };

        if self.is_expired(&entry, Utc::now()) {
            state.entries.remove(&key);
            state.misses += 1;
            self.remove_file(&entry.file).await;
            self.persist(&state).await;
            return None;
        }

        match tokio::fs::read(self.file_path(&entry.file)).await {
            Ok(bytes) => {
                state.hits += 1;
                debug!(url = %url, "Cache hit");
                Some(bytes)
            }
            Err(_) => {
                state.entries.remove(&key);
                state.misses += 1;
                self.persist(&state).await;
                None
            }
        }
    }

    /// Stores `bytes` for `url`, then evicts as needed.
    pub async fn put(&self, url: &str, bytes: &[u8]) -> Result<()> {
        self.insert(url, bytes, Utc::now()).await
    }

    async fn insert(&self, url: &str, bytes: &[u8], stored_at: DateTime<Utc>) -> Result<()> {
        let key = normalize_url(url);
        let file = hex::encode(Sha256::digest(key.as_bytes()));
        tokio::fs::write(self.file_path(&file), bytes).await?;

        let mut state = self.state.lock().await;
        state.entries.insert(
            key.clone(),
            CacheEntry {
                url: key,
                file,
                stored_at,
                size: bytes.len() as u64,
            },
        );
        self.evict_locked(&mut state).await;
        self.persist(&state).await;
        Ok(())
    }

    /// Drops expired entries, then the oldest ones while over budget.
    pub async fn evict(&self) {
        let mut state = self.state.lock().await;
        self.evict_locked(&mut state).await;
        self.persist(&state).await;
    }

    /// Removes every entry.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let files: Vec<String> = state.entries.values().map(|e| e.file.clone()).collect();
        state.entries.clear();
        for file in files {
            self.remove_file(&file).await;
        }
        self.persist(&state).await;
        Ok(())
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            entries: state.entries.len(),
            total_bytes: state.entries.values().map(|e| e.size).sum(),
            hits: state.hits,
            misses: state.misses,
        }
    }

    async fn evict_locked(&self, state: &mut CacheState) {
        let now = Utc::now();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| self.is_expired(e, now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = state.entries.remove(&key) {
                self.remove_file(&entry.file).await;
            }
        }

        let mut total: u64 = state.entries.values().map(|e| e.size).sum();
        if total <= self.max_bytes {
            return;
        }

        let target = self.max_bytes / 10 * 8;
        let mut by_age: Vec<(DateTime<Utc>, String)> = state
            .entries
            .iter()
            .map(|(k, e)| (e.stored_at, k.clone()))
            .collect();
        by_age.sort();

        for (_, key) in by_age {
            if total <= target {
                break;
            }
            if let Some(entry) = state.entries.remove(&key) {
                total = total.saturating_sub(entry.size);
                self.remove_file(&entry.file).await;
            }
        }
        debug!("Cache trimmed to {} bytes", total);
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(entry.stored_at);
        age.to_std().map(|age| age > self.max_age).unwrap_or(false)
    }

    fn file_path(&self, file: &str) -> PathBuf {
        self.root.join(FILES_DIR).join(file)
    }

    async fn remove_file(&self, file: &str) {
        if let Err(e) = tokio::fs::remove_file(self.file_path(file)).await {
            debug!("Cache file {} already gone: {}", file, e);
        }
    }

    async fn persist(&self, state: &CacheState) {
        let list: Vec<&CacheEntry> = state.entries.values().collect();
        let result = match serde_json::to_vec_pretty(&list) {
            Ok(raw) => tokio::fs::write(self.root.join(INDEX_FILE), raw)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = result {
            warn!("Failed to write cache index: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache(max_age: Duration, max_bytes: u64) -> (tempfile::TempDir, UrlCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = UrlCache::open_at(dir.path(), max_age, max_bytes).await.unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (_dir, cache) = cache(Duration::from_secs(60), 1_000).await;
        cache.put("https://example.com/a.pdf", b"pdf bytes").await.unwrap();
        assert_eq!(
            cache.get("https://example.com/a.pdf").await,
            Some(b"pdf bytes".to_vec())
        );
        let stats = cache.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_key_is_normalized() {
        let (_dir, cache) = cache(Duration::from_secs(60), 1_000).await;
        cache.put("https://Example.com/doc/", b"x").await.unwrap();
        assert!(cache.get("http://example.com/doc").await.is_some());
    }

    #[tokio::test]
    async fn test_case_distinct_paths_are_separate_entries() {
        let (_dir, cache) = cache(Duration::from_secs(60), 1_000).await;
        cache.put("https://e.org/doc?id=AbC", b"upper").await.unwrap();
        cache.put("https://e.org/doc?id=abc", b"lower").await.unwrap();
        assert_eq!(cache.get("https://e.org/doc?id=AbC").await.as_deref(), Some(&b"upper"[..]));
        assert_eq!(cache.get("https://e.org/doc?id=abc").await.as_deref(), Some(&b"lower"[..]));
    }

    #[tokio::test]
    async fn test_miss() {
        let (_dir, cache) = cache(Duration::from_secs(60), 1_000).await;
        assert!(cache.get("https://example.com/none").await.is_none());
        assert_eq!(cache.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_dropped() {
        let (_dir, cache) = cache(Duration::from_secs(60), 1_000).await;
        let old = Utc::now() - chrono::Duration::seconds(120);
        cache.insert("https://example.com/old", b"stale", old).await.unwrap();
        // insert() evicts immediately
        assert_eq!(cache.stats().await.entries, 0);
        assert!(cache.get("https://example.com/old").await.is_none());
    }

    #[tokio::test]
    async fn test_over_budget_evicts_oldest_to_80_percent() {
        let (_dir, cache) = cache(Duration::from_secs(3_600), 100).await;
        let now = Utc::now();
        for i in 0..4 {
            let stored = now - chrono::Duration::seconds(40 - i * 10);
            cache
                .insert(&format!("https://example.com/{}", i), &[0u8; 30], stored)
                .await
                .unwrap();
        }
        let stats = cache.stats().await;
        assert!(stats.total_bytes <= 80);
        // the newest entry survives
        assert!(cache.get("https://example.com/3").await.is_some());
        assert!(cache.get("https://example.com/0").await.is_none());
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = UrlCache::open_at(dir.path(), Duration::from_secs(60), 1_000)
                .await
                .unwrap();
            cache.put("https://example.com/keep", b"kept").await.unwrap();
        }
        let cache = UrlCache::open_at(dir.path(), Duration::from_secs(60), 1_000)
            .await
            .unwrap();
        assert_eq!(cache.get("https://example.com/keep").await, Some(b"kept".to_vec()));
    }

    #[tokio::test]
    async fn test_clear() {
        let (_dir, cache) = cache(Duration::from_secs(60), 1_000).await;
        cache.put("https://example.com/a", b"a").await.unwrap();
        cache.clear().await.unwrap();
        assert_eq!(cache.stats().await.entries, 0);
    }
}
