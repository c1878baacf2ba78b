use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::core::error::{Error, Result};

/// The shared key-value cache the service collaborates with: string values
/// with TTL and compare-and-swap, sorted sets, and hashes, plus a bounded
/// key scan. Key names (`sugg:*`, `trending`, `history:*`) are the contract
/// shared across processes; a Redis-backed implementation lives outside
/// this crate. All callers treat failures as degradation, never corruption.
pub trait SharedCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Writes `value` only when the current value equals `expected`
    /// (None = key absent). Returns whether the write happened.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Up to `max` keys starting with `prefix`. A bounded scan; callers that
    /// invalidate by pattern accept the approximation.
    fn keys_with_prefix(&self, prefix: &str, max: usize) -> Result<Vec<String>>;

    fn zentries(&self, key: &str) -> Result<Vec<(String, f64)>>;
    fn zset(&self, key: &str, member: &str, score: f64) -> Result<()>;
    fn zrem(&self, key: &str, member: &str) -> Result<()>;

    fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>>;
    fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    fn hdel(&self, key: &str, field: &str) -> Result<()>;
}

enum Value {
    Str(String),
    Zset(BTreeMap<String, f64>),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if Instant::now() >= at)
    }
}

/// In-process `SharedCache` with lazy TTL expiry. The implementation used
/// by tests and single-process deployments.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(key: &str) -> Error {
    Error::cache(format!("key {:?} holds a different value type", key))
}

impl MemoryCache {
    fn with_zset<T>(&self, key: &str, f: impl FnOnce(&mut BTreeMap<String, f64>) -> T) -> Result<T> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Zset(BTreeMap::new()),
            expires_at: None,
        });
        if entry.expired() {
            *entry = Entry {
                value: Value::Zset(BTreeMap::new()),
                expires_at: None,
            };
        }
        match &mut entry.value {
            Value::Zset(set) => Ok(f(set)),
            _ => Err(wrong_type(key)),
        }
    }

    fn with_hash<T>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, String>) -> T) -> Result<T> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        if entry.expired() {
            *entry = Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            };
        }
        match &mut entry.value {
            Value::Hash(map) => Ok(f(map)),
            _ => Err(wrong_type(key)),
        }
    }
}

impl SharedCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| e.expired()) {
            entries.remove(key);
            return Ok(None);
        }
        match entries.get(key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut entries = self.entries.lock();
        let current = match entries.get(key) {
            Some(entry) if entry.expired() => None,
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Some(s.as_str()),
            Some(_) => return Err(wrong_type(key)),
            None => None,
        };
        if current != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str, max: usize) -> Result<Vec<String>> {
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.expired())
            .take(max)
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn zentries(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| e.expired()) {
            entries.remove(key);
            return Ok(Vec::new());
        }
        match entries.get(key) {
            Some(Entry {
                value: Value::Zset(set),
                ..
            }) => Ok(set.iter().map(|(m, s)| (m.clone(), *s)).collect()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    fn zset(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.with_zset(key, |set| {
            set.insert(member.to_string(), score);
        })
    }

    fn zrem(&self, key: &str, member: &str) -> Result<()> {
        self.with_zset(key, |set| {
            set.remove(member);
        })
    }

    fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| e.expired()) {
            entries.remove(key);
            return Ok(Vec::new());
        }
        match entries.get(key) {
            Some(Entry {
                value: Value::Hash(map),
                ..
            }) => Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.with_hash(key, |map| {
            map.insert(field.to_string(), value.to_string());
        })
    }

    fn hdel(&self, key: &str, field: &str) -> Result<()> {
        self.with_hash(key, |map| {
            map.remove(field);
        })
    }
}
