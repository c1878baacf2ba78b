use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{info, warn};

use crate::core::error::{Error, ErrorKind, Result};
use crate::index::prefix::PrefixIndex;
use crate::storage::store::PhraseStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebuildState {
    Idle,
    Building,
    Swapping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildReport {
    pub generation: u64,
    pub phrase_count: usize,
    pub duration_ms: u64,
}

/// Offline trie reconstruction with an atomic generation swap. At most one
/// rebuild is in flight. While one is building, live index writes are also
/// recorded on a shadow list and replayed into the new generation right
/// before the swap, so no counts are lost.
pub struct Rebuilder {
    state: Mutex<RebuildState>,
    shadow: Mutex<Vec<(String, u64)>>,
    /// Serializes live applies against the drain-and-swap step. Either an
    /// apply lands before the drain (its deltas are in the shadow) or after
    /// the swap (its deltas hit the new generation directly).
    apply_lock: Mutex<()>,
}

impl Rebuilder {
    pub fn new() -> Self {
        Rebuilder {
            state: Mutex::new(RebuildState::Idle),
            shadow: Mutex::new(Vec::new()),
            apply_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> RebuildState {
        *self.state.lock()
    }

    /// The flusher's single entry point to the live index. Applies a flush
    /// batch and, when a rebuild is building, taps the same deltas into its
    /// shadow list. Returns the changed prefixes for cache invalidation.
    pub fn apply_live(
        &self,
        index: &PrefixIndex,
        deltas: &[(String, u64)],
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let _guard = self.apply_lock.lock();
        let touched = index.increment_batch(deltas, now)?;
        if *self.state.lock() == RebuildState::Building {
            self.shadow.lock().extend_from_slice(deltas);
        }
        Ok(touched)
    }

    /// Pages the whole corpus out of persistence into a fresh generation,
    /// replays shadow deltas, and swaps. Readers keep hitting the old
    /// generation until the swap. The caller is responsible for dropping
    /// the suggestion cache afterwards.
    pub fn rebuild(
        &self,
        index: &PrefixIndex,
        store: &dyn PhraseStore,
        load_batch: usize,
    ) -> Result<RebuildReport> {
        {
            let mut state = self.state.lock();
            if *state != RebuildState::Idle {
                return Err(Error::new(
                    ErrorKind::RebuildInProgress,
                    "a rebuild is already running".to_string(),
                ));
            }
            *state = RebuildState::Building;
        }
        // Entries left over from the tail of a previous swap were already
        // applied to the live generation; a fresh rebuild starts clean.
        self.shadow.lock().clear();

        let started = Instant::now();
        let result = self.build_and_swap(index, store, load_batch);
        *self.state.lock() = RebuildState::Idle;

        let (generation, phrase_count) = result?;
        let report = RebuildReport {
            generation,
            phrase_count,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            generation = report.generation,
            phrases = report.phrase_count,
            duration_ms = report.duration_ms,
            "index rebuild complete"
        );
        Ok(report)
    }

    fn build_and_swap(
        &self,
        index: &PrefixIndex,
        store: &dyn PhraseStore,
        load_batch: usize,
    ) -> Result<(u64, usize)> {
        let mut fresh = index.blank_generation();
        let now = Utc::now();

        let mut cursor: Option<String> = None;
        loop {
            let page = store.load_page(cursor.as_deref(), load_batch)?;
            for record in page.records {
                if let Err(e) = fresh.insert(&record.phrase, record.count, record.last_updated, now) {
                    warn!(phrase = %record.phrase, error = %e, "skipping unloadable phrase");
                }
            }
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        let _guard = self.apply_lock.lock();
        *self.state.lock() = RebuildState::Swapping;
        let pending: Vec<(String, u64)> = self.shadow.lock().drain(..).collect();
        for (phrase, delta) in pending {
            if let Err(e) = fresh.increment(&phrase, delta, now) {
                warn!(phrase = %phrase, error = %e, "shadow replay failed for phrase");
            }
        }
        let phrase_count = fresh.phrase_count();
        let generation = index.swap(fresh);
        Ok((generation, phrase_count))
    }
}

impl Default for Rebuilder {
    fn default() -> Self {
        Self::new()
    }
}
