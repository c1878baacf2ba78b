use serde::{Deserialize, Serialize};

use crate::cache::suggestion::SuggestionCacheStats;
use crate::index::rebuild::RebuildState;
use crate::index::trie::IndexStats;
use crate::metrics::emitter::MetricsSnapshot;

/// Point-in-time view of the whole service, for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    pub index: IndexStats,
    pub rebuild_state: RebuildState,
    pub flusher_state: String,
    pub buffer_len: usize,
    pub buffer_capacity: usize,
    pub buffer_overflow: u64,
    pub retry_backlog: usize,
    pub filtered_phrases: usize,
    pub suggestion_cache: SuggestionCacheStats,
    pub metrics: MetricsSnapshot,
}
