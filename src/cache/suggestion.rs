use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::warn;

use crate::cache::shared::SharedCache;
use crate::core::error::Result;
use crate::core::types::Suggestion;

/// Keys scanned per prefix during pattern invalidation. The scan is a
/// bounded approximation; anything missed ages out with the TTL.
const INVALIDATION_SCAN: usize = 512;

/// Prefix -> ranked-list cache on top of the shared cache. The key folds in
/// everything that changes the result: prefix, limit, fuzzy flag, and a
/// small user bucket so personalization stays cacheable without giving every
/// user a private slot.
pub struct SuggestionCache {
    cache: Arc<dyn SharedCache>,
    ttl: Duration,
    user_buckets: u64,
    hit_count: AtomicUsize,
    miss_count: AtomicUsize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SuggestionCacheStats {
    pub hit_count: usize,
    pub miss_count: usize,
}

impl SuggestionCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

impl SuggestionCache {
    pub fn new(cache: Arc<dyn SharedCache>, ttl_s: u64, user_buckets: u64) -> Self {
        SuggestionCache {
            cache,
            ttl: Duration::from_secs(ttl_s),
            user_buckets,
            hit_count: AtomicUsize::new(0),
            miss_count: AtomicUsize::new(0),
        }
    }

    pub fn key(&self, prefix: &str, limit: usize, fuzzy: bool, user_id: Option<&str>) -> String {
        format!(
            "sugg:{}:{}:{}:{}",
            prefix,
            limit,
            fuzzy,
            self.user_bucket(user_id)
        )
    }

    fn user_bucket(&self, user_id: Option<&str>) -> u64 {
        match user_id {
            Some(id) => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                id.hash(&mut hasher);
                hasher.finish() % self.user_buckets
            }
            None => 0,
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<Suggestion>>> {
        match self.cache.get(key)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(list) => {
                    self.hit_count.fetch_add(1, Ordering::Relaxed);
                    Ok(Some(list))
                }
                Err(e) => {
                    // A stale or foreign payload reads as a miss.
                    warn!(key, error = %e, "dropping undecodable suggestion cache entry");
                    self.cache.delete(key)?;
                    self.miss_count.fetch_add(1, Ordering::Relaxed);
                    Ok(None)
                }
            },
            None => {
                self.miss_count.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    pub fn put(&self, key: &str, suggestions: &[Suggestion]) -> Result<()> {
        let raw = serde_json::to_string(suggestions)?;
        self.cache.set(key, &raw, Some(self.ttl))
    }

    /// Deletes every cached result whose prefix is a prefix of (or equal to)
    /// the touched phrase: the set of entries whose top-K could contain it.
    pub fn invalidate_phrase(&self, phrase: &str) {
        let prefixes: Vec<String> = phrase
            .char_indices()
            .map(|(i, c)| phrase[..i + c.len_utf8()].to_string())
            .collect();
        self.invalidate_prefixes(&prefixes);
    }

    /// Deletes cached results keyed by exactly these prefixes (as reported
    /// by a top-K recomputation). Best-effort: a cache outage only costs
    /// freshness within one TTL.
    pub fn invalidate_prefixes(&self, prefixes: &[String]) {
        for prefix in prefixes {
            if prefix.is_empty() {
                continue;
            }
            let pattern = format!("sugg:{}:", prefix);
            let keys = match self.cache.keys_with_prefix(&pattern, INVALIDATION_SCAN) {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(prefix, error = %e, "suggestion cache scan failed");
                    continue;
                }
            };
            for key in keys {
                if let Err(e) = self.cache.delete(&key) {
                    warn!(key, error = %e, "suggestion cache delete failed");
                }
            }
        }
    }

    /// Drops the entire suggestion keyspace (admin clear-cache, rebuild).
    pub fn clear(&self) {
        loop {
            let keys = match self.cache.keys_with_prefix("sugg:", INVALIDATION_SCAN) {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(error = %e, "suggestion cache clear failed");
                    return;
                }
            };
            if keys.is_empty() {
                return;
            }
            for key in keys {
                if self.cache.delete(&key).is_err() {
                    return;
                }
            }
        }
    }

    pub fn stats(&self) -> SuggestionCacheStats {
        SuggestionCacheStats {
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
        }
    }
}
