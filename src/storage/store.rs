use chrono::{DateTime, Utc};

use crate::core::error::Result;
use crate::core::types::PhraseRecord;

/// One page of the phrase corpus, keyset-paginated by phrase.
#[derive(Debug, Clone)]
pub struct PhrasePage {
    pub records: Vec<PhraseRecord>,
    /// Cursor to pass back for the next page; None when exhausted.
    pub next_cursor: Option<String>,
}

/// The persistent key -> count store behind the service. Backed by a
/// relational table in production; this crate ships an in-memory and an
/// embedded file implementation.
///
/// Contract: `upsert_batch` is atomic (all rows or none) and counts are
/// monotonically non-decreasing except through admin removal. Every call is
/// expected to bound its own latency; transient failures surface as
/// `PersistenceUnavailable` and are retried by the ingestion flusher.
pub trait PhraseStore: Send + Sync {
    /// Pages through all non-filtered phrases in phrase order. Malformed
    /// rows are logged and skipped, never surfaced.
    fn load_page(&self, cursor: Option<&str>, batch: usize) -> Result<PhrasePage>;

    /// Adds each delta to its phrase's count (inserting at the delta when
    /// absent) and stamps last-updated, in one transaction.
    fn upsert_batch(&self, deltas: &[(String, u64)], now: DateTime<Utc>) -> Result<()>;

    fn get(&self, phrase: &str) -> Result<Option<PhraseRecord>>;

    /// Marks a phrase filtered, creating a zero-count row when absent.
    fn add_filtered(&self, phrase: &str, reason: &str) -> Result<()>;

    /// Clears the filtered flag. `NotFound` when the phrase is not filtered.
    fn remove_filtered(&self, phrase: &str) -> Result<()>;

    fn list_filtered(&self) -> Result<Vec<String>>;

    /// Total stored phrases, filtered ones included.
    fn phrase_count(&self) -> Result<usize>;
}
