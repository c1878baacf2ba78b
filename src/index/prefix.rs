use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::analysis::normalizer;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::types::Candidate;
use crate::index::fuzzy::FuzzyExplorer;
use crate::index::trie::{IndexStats, Trie};

/// The live prefix index: one trie generation behind a readers-writer lock.
/// Lookups take the shared lock; increments and the rebuild swap take the
/// exclusive one, and never across I/O. The generation pointer changes only
/// through `swap`, so a reader sees entirely one generation.
pub struct PrefixIndex {
    trie: RwLock<Trie>,
    fuzzy: FuzzyExplorer,
    generation: AtomicU64,
    top_k: usize,
    recency_tau_secs: i64,
    max_phrase_len: usize,
}

impl PrefixIndex {
    pub fn new(config: &Config) -> Self {
        let recency_tau_secs = config.recency_tau_days * 24 * 3600;
        PrefixIndex {
            trie: RwLock::new(Trie::new(config.top_k, recency_tau_secs)),
            fuzzy: FuzzyExplorer::new(config.fuzzy_max_edits, config.fuzzy_budget),
            generation: AtomicU64::new(0),
            top_k: config.top_k,
            recency_tau_secs,
            max_phrase_len: config.max_phrase_len,
        }
    }

    /// A detached trie for the rebuilder to populate off the lock.
    pub fn blank_generation(&self) -> Trie {
        Trie::new(self.top_k, self.recency_tau_secs)
    }

    fn require_normalized(&self, input: &str) -> Result<()> {
        let canon = normalizer::normalize_with_limit(input, self.max_phrase_len)?;
        if canon != input {
            return Err(Error::invalid_input(format!(
                "input {:?} is not in normalized form",
                input
            )));
        }
        Ok(())
    }

    pub fn lookup(
        &self,
        prefix: &str,
        limit: usize,
        exclude: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<Candidate>> {
        self.require_normalized(prefix)?;
        self.trie.read().lookup(prefix, limit, exclude)
    }

    /// Bounded single-edit exploration around the prefix; exact hits are
    /// excluded by the caller through `exclude`.
    pub fn fuzzy_lookup(
        &self,
        prefix: &str,
        limit: usize,
        exclude: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<Candidate>> {
        self.require_normalized(prefix)?;
        let trie = self.trie.read();
        Ok(self.fuzzy.explore(&trie, prefix, limit, exclude))
    }

    pub fn insert(
        &self,
        phrase: &str,
        count: u64,
        last_updated: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        self.require_normalized(phrase)?;
        self.trie.write().insert(phrase, count, last_updated, now)
    }

    pub fn increment(&self, phrase: &str, delta: u64, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.require_normalized(phrase)?;
        self.trie.write().increment(phrase, delta, now)
    }

    /// Applies a whole flush batch under one exclusive lock acquisition.
    /// Returns the union of changed prefixes across the batch.
    pub fn increment_batch(
        &self,
        deltas: &[(String, u64)],
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        for (phrase, _) in deltas {
            self.require_normalized(phrase)?;
        }
        let mut trie = self.trie.write();
        let mut touched = Vec::new();
        for (phrase, delta) in deltas {
            for prefix in trie.increment(phrase, *delta, now)? {
                if !touched.contains(&prefix) {
                    touched.push(prefix);
                }
            }
        }
        Ok(touched)
    }

    pub fn remove(&self, phrase: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.require_normalized(phrase)?;
        self.trie.write().remove(phrase, now)
    }

    /// Atomically replaces the live generation. Returns the new generation
    /// number.
    pub fn swap(&self, fresh: Trie) -> u64 {
        let mut trie = self.trie.write();
        *trie = fresh;
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub fn max_count(&self) -> u64 {
        self.trie.read().max_count()
    }

    pub fn stats(&self) -> IndexStats {
        let trie = self.trie.read();
        let (phrase_count, node_count, max_depth) = trie.stats();
        IndexStats {
            phrase_count,
            node_count,
            max_depth,
            generation: self.generation(),
            max_count: trie.max_count(),
        }
    }

    /// Test / forced-rebuild hook: full consistency walk of the live trie.
    pub fn check_invariants(&self, now: DateTime<Utc>) -> Result<()> {
        self.trie.read().check_invariants(now)
    }
}
