use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Persistent disk caches — flat-file JSON, same storage discipline as the
// vector tables. Two caches live under `.engram/cache/`:
//
//   embeddings.json      key = sha256-16(text)            cap 200, LRU by ts
//   search-results.json  key = sha256-16(query+topK+filter) cap 50, TTL 5 min
//
// Both load tolerant (corrupt file → empty cache) and save best-effort.
// ---------------------------------------------------------------------------

/// Maximum number of cached embeddings before LRU eviction.
const EMBEDDING_CACHE_CAP: usize = 200;

/// Maximum number of cached search results.
const SEARCH_CACHE_CAP: usize = 50;

/// Search results expire after this many seconds.
const SEARCH_TTL_SECS: u64 = 300;

/// sha256 digest truncated to 16 hex chars — the crate-wide content key.
///
/// Collision probability at this store's scale is negligible, and the
/// short form keeps the JSON files compact.
pub fn sha256_16(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let prefix: [u8; 8] = digest[0..8].try_into().expect("digest is 32 bytes");
    format!("{:016x}", u64::from_be_bytes(prefix))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmbeddingEntry {
    vector: Vec<f32>,
    ts: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EmbeddingFile {
    entries: HashMap<String, EmbeddingEntry>,
}

/// Disk-backed LRU cache for embedding vectors, keyed by text content.
pub struct EmbeddingCache {
    path: PathBuf,
    file: EmbeddingFile,
}

/// Outcome of a batch lookup: hits carry their position in the input so the
/// caller can stitch provider results back in order.
#[derive(Debug, Default)]
pub struct BatchLookup {
    /// (input index, cached vector)
    pub hits: Vec<(usize, Vec<f32>)>,
    /// input indices that must go to the provider
    pub misses: Vec<usize>,
}

impl EmbeddingCache {
    pub fn open(cache_dir: &Path) -> Self {
        let path = cache_dir.join("embeddings.json");
        let file = std::fs::read_to_string(&path)
            .ok()
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_default();
        Self { path, file }
    }

    pub fn len(&self) -> usize {
        self.file.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file.entries.is_empty()
    }

    /// Cached vector for `text`, refreshing its LRU timestamp on hit.
    pub fn get(&mut self, text: &str) -> Option<Vec<f32>> {
        let key = sha256_16(text);
        let entry = self.file.entries.get_mut(&key)?;
        entry.ts = now_secs();
        Some(entry.vector.clone())
    }

    pub fn put(&mut self, text: &str, vector: &[f32]) {
        let key = sha256_16(text);
        self.file.entries.insert(
            key,
            EmbeddingEntry {
                vector: vector.to_vec(),
                ts: now_secs(),
            },
        );
        self.evict();
    }

    /// Split a batch into cache hits and provider-bound misses.
    pub fn lookup_batch(&mut self, texts: &[String]) -> BatchLookup {
        let mut out = BatchLookup::default();
        for (i, text) in texts.iter().enumerate() {
            match self.get(text) {
                Some(v) => out.hits.push((i, v)),
                None => out.misses.push(i),
            }
        }
        out
    }

    /// Drop oldest entries past the cap.
    fn evict(&mut self) {
        while self.file.entries.len() > EMBEDDING_CACHE_CAP {
            let oldest = self
                .file
                .entries
                .iter()
                .min_by_key(|(_, e)| e.ts)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.file.entries.remove(&k);
                }
                None => break,
            }
        }
    }

    /// Best-effort persist; a failed write only costs future cache hits.
    pub fn save(&self) {
        if let Ok(text) = serde_json::to_string(&self.file) {
            let _ = std::fs::write(&self.path, text);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SearchEntry {
    results: Value,
    ts: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SearchFile {
    entries: HashMap<String, SearchEntry>,
}

/// Disk-backed TTL cache for search results. Values are stored as raw JSON
/// so the cache stays agnostic of the result shape.
pub struct SearchCache {
    path: PathBuf,
    file: SearchFile,
}

impl SearchCache {
    pub fn open(cache_dir: &Path) -> Self {
        let path = cache_dir.join("search-results.json");
        let file = std::fs::read_to_string(&path)
            .ok()
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_default();
        Self { path, file }
    }

    /// Cache key over everything that affects a result set.
    pub fn key(query_text: &str, top_k: usize, filter_repr: &str) -> String {
        sha256_16(&format!("{query_text}\u{1}{top_k}\u{1}{filter_repr}"))
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let entry = self.file.entries.get(key)?;
        if now_secs().saturating_sub(entry.ts) > SEARCH_TTL_SECS {
            return None;
        }
        Some(entry.results.clone())
    }

    pub fn put(&mut self, key: &str, results: Value) {
        self.file.entries.insert(
            key.to_string(),
            SearchEntry {
                results,
                ts: now_secs(),
            },
        );
        // Evict expired first, then oldest beyond cap.
        let now = now_secs();
        self.file
            .entries
            .retain(|_, e| now.saturating_sub(e.ts) <= SEARCH_TTL_SECS);
        while self.file.entries.len() > SEARCH_CACHE_CAP {
            let oldest = self
                .file
                .entries
                .iter()
                .min_by_key(|(_, e)| e.ts)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.file.entries.remove(&k);
                }
                None => break,
            }
        }
    }

    /// Invalidate everything — called after any index write.
    pub fn clear(&mut self) {
        self.file.entries.clear();
        self.save();
    }

    pub fn save(&self) {
        if let Ok(text) = serde_json::to_string(&self.file) {
            let _ = std::fs::write(&self.path, text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_16_is_stable_and_short() {
        let a = sha256_16("hello");
        assert_eq!(a.len(), 16);
        assert_eq!(a, sha256_16("hello"));
        assert_ne!(a, sha256_16("hello "));
    }

    #[test]
    fn embedding_cache_hits_after_put() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = EmbeddingCache::open(dir.path());
        assert!(cache.get("some text").is_none());
        cache.put("some text", &[0.1, 0.2]);
        assert_eq!(cache.get("some text").unwrap(), vec![0.1, 0.2]);

        cache.save();
        let mut reopened = EmbeddingCache::open(dir.path());
        assert_eq!(reopened.get("some text").unwrap(), vec![0.1, 0.2]);
    }

    #[test]
    fn embedding_cache_evicts_past_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = EmbeddingCache::open(dir.path());
        for i in 0..(EMBEDDING_CACHE_CAP + 25) {
            cache.put(&format!("text-{i}"), &[i as f32]);
        }
        assert!(cache.len() <= EMBEDDING_CACHE_CAP);
    }

    #[test]
    fn batch_lookup_separates_hits_and_misses() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = EmbeddingCache::open(dir.path());
        cache.put("cached", &[1.0]);

        let texts = vec!["cached".to_string(), "fresh".to_string()];
        let lookup = cache.lookup_batch(&texts);
        assert_eq!(lookup.hits.len(), 1);
        assert_eq!(lookup.hits[0].0, 0);
        assert_eq!(lookup.misses, vec![1]);
    }

    #[test]
    fn search_cache_respects_clear() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = SearchCache::open(dir.path());
        let key = SearchCache::key("how does auth work", 5, "agent=claude");
        cache.put(&key, serde_json::json!([{"id": "x"}]));
        assert!(cache.get(&key).is_some());
        cache.clear();
        assert!(cache.get(&key).is_none());
    }
}
