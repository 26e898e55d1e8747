use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::merger::MergerOptions;
use crate::query::SearchQuery;
use crate::ServiceError;

const KEY_PREFIX: &str = "threads_search_";

/// Byte cache with per-entry expiry, injected into the service.
pub trait SearchCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration);
}

/// In-process cache; expired entries are dropped on read.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Instant, Vec<u8>)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SearchCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((expires, value)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.entries.lock().insert(key.to_string(), (Instant::now() + ttl, value));
    }
}

#[derive(Serialize)]
struct KeyInput<'a> {
    query: &'a SearchQuery,
    options: &'a MergerOptions,
}

/// Deterministic key: SHA-256 hex over canonical JSON (sorted object keys) of query and options.
pub fn cache_key(query: &SearchQuery, options: &MergerOptions) -> Result<String, ServiceError> {
    // to_value sorts map keys
    let canonical = serde_json::to_value(KeyInput { query, options })
        .and_then(|v| serde_json::to_string(&v))
        .map_err(|e| ServiceError::Cache(e.to_string()))?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(format!("{KEY_PREFIX}{}", hex::encode(digest)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SearchParams;

    fn query(text: &str, page: usize) -> SearchQuery {
        let p = SearchParams { text: Some(text.into()), page: Some(page), ..Default::default() };
        SearchQuery::from_params(&p, 20).expect("query")
    }

    fn options() -> MergerOptions {
        MergerOptions { max_deep_search_comment_count: 10, highlight_tag: Some("highlight".into()) }
    }

    #[test]
    fn key_is_stable_and_input_sensitive() {
        let a = cache_key(&query("rust", 1), &options()).expect("key");
        assert_eq!(a, cache_key(&query("rust", 1), &options()).expect("key"));
        assert_ne!(a, cache_key(&query("rust", 2), &options()).expect("key"));
        assert!(a.starts_with(KEY_PREFIX));
        assert_eq!(a.len(), KEY_PREFIX.len() + 64);
    }

    #[test]
    fn entries_expire() {
        let cache = MemoryCache::new();
        cache.set("k", b"v".to_vec(), Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some(b"v".to_vec()));
        cache.set("gone", b"v".to_vec(), Duration::ZERO);
        assert_eq!(cache.get("gone"), None);
        assert_eq!(cache.len(), 1);
    }
}
