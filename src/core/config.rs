use serde::{Deserialize, Serialize};

/// Scoring weights for the five ranking components. Must sum to ~1.0 for
/// scores to stay in [0, 1], but nothing enforces it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Weights {
    pub popularity: f64,
    pub recency: f64,
    pub personal: f64,
    pub trending: f64,
    pub match_quality: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Weights {
            popularity: 0.35,
            recency: 0.15,
            personal: 0.20,
            trending: 0.20,
            match_quality: 0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Per-node top-K cache size. Memory vs. hit quality.
    pub top_k: usize,
    /// Maximum phrase length in code points; longer input is rejected.
    pub max_phrase_len: usize,

    /// Suggestion cache TTL in seconds. Freshness vs. load.
    pub suggestion_ttl_s: u64,
    /// Number of personalization buckets in the suggestion cache key.
    pub user_buckets: u64,

    /// Flush when this many events are buffered.
    pub flush_threshold: usize,
    /// Flush at least this often, in milliseconds.
    pub flush_interval_ms: u64,
    /// Maximum events drained per flush.
    pub batch_size: usize,
    /// Ingestion buffer capacity; overflow drops the oldest event.
    pub buffer_capacity: usize,
    /// Retries for a failing flush batch before dead-lettering it.
    pub flush_max_retries: u32,

    /// Trending window in minutes; older entries are evicted.
    pub trending_window_min: i64,
    /// Trending decay time constant in minutes.
    pub trending_tau_min: i64,

    /// Recency decay time constant in days (static score and ranker).
    pub recency_tau_days: i64,

    /// Personal history entries kept per user.
    pub history_cap: usize,
    /// Personal history TTL in days.
    pub history_ttl_days: i64,

    /// Node budget for fuzzy exploration.
    pub fuzzy_budget: usize,
    /// Maximum edit distance in fuzzy mode.
    pub fuzzy_max_edits: u8,

    /// Page size used when bootstrapping / rebuilding from persistence.
    pub load_batch: usize,

    /// Suggested size for an embedder's query handler pool.
    pub query_parallelism: usize,

    pub weights: Weights,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            top_k: 10,
            max_phrase_len: 80,
            suggestion_ttl_s: 60,
            user_buckets: 64,
            flush_threshold: 100,
            flush_interval_ms: 5000,
            batch_size: 500,
            buffer_capacity: 10_000,
            flush_max_retries: 3,
            trending_window_min: 60,
            trending_tau_min: 10,
            recency_tau_days: 7,
            history_cap: 50,
            history_ttl_days: 30,
            fuzzy_budget: 50,
            fuzzy_max_edits: 1,
            load_batch: 1000,
            query_parallelism: num_cpus::get(),
            weights: Weights::default(),
        }
    }
}

impl Config {
    /// High-water mark above which the flusher halves its interval.
    pub fn high_water(&self) -> usize {
        self.buffer_capacity / 2
    }
}
