use chrono::Utc;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::cache::suggestion::SuggestionCache;
use crate::core::config::Config;
use crate::index::prefix::PrefixIndex;
use crate::index::rebuild::Rebuilder;
use crate::ingest::buffer::IngestBuffer;
use crate::metrics::emitter::Metrics;
use crate::storage::store::PhraseStore;
use crate::trending::window::TrendingWindow;

/// Messages from the service to the flusher worker.
pub enum Control {
    /// The buffer crossed the flush threshold.
    Hint,
    /// Flush immediately and acknowledge; admin and test hook.
    FlushNow(Sender<()>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlusherState {
    Idle,
    Draining,
    Persisting,
    Indexing,
    Retrying,
}

impl FlusherState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlusherState::Idle => "idle",
            FlusherState::Draining => "draining",
            FlusherState::Persisting => "persisting",
            FlusherState::Indexing => "indexing",
            FlusherState::Retrying => "retrying",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => FlusherState::Draining,
            2 => FlusherState::Persisting,
            3 => FlusherState::Indexing,
            4 => FlusherState::Retrying,
            _ => FlusherState::Idle,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PendingGroup {
    delta: u64,
    attempts: u32,
}

/// The write-behind aggregator: drains the buffer, groups events by phrase,
/// persists the deltas in one transaction, and only then applies them to
/// the index, the trending window, and cache invalidation, so the
/// in-memory count never runs ahead of the persisted count. Failed batches
/// are retried a few times, then dead-lettered.
pub struct Flusher {
    buffer: Arc<IngestBuffer>,
    store: Arc<dyn PhraseStore>,
    index: Arc<PrefixIndex>,
    rebuilder: Arc<Rebuilder>,
    trending: Arc<TrendingWindow>,
    suggestions: Arc<SuggestionCache>,
    metrics: Arc<Metrics>,

    state: AtomicU8,
    retry: Mutex<BTreeMap<String, PendingGroup>>,

    batch_size: usize,
    flush_threshold: usize,
    interval: Duration,
    high_water: usize,
    max_retries: u32,
}

impl Flusher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buffer: Arc<IngestBuffer>,
        store: Arc<dyn PhraseStore>,
        index: Arc<PrefixIndex>,
        rebuilder: Arc<Rebuilder>,
        trending: Arc<TrendingWindow>,
        suggestions: Arc<SuggestionCache>,
        metrics: Arc<Metrics>,
        config: &Config,
    ) -> Self {
        Flusher {
            buffer,
            store,
            index,
            rebuilder,
            trending,
            suggestions,
            metrics,
            state: AtomicU8::new(0),
            retry: Mutex::new(BTreeMap::new()),
            batch_size: config.batch_size,
            flush_threshold: config.flush_threshold,
            interval: Duration::from_millis(config.flush_interval_ms),
            high_water: config.high_water(),
            max_retries: config.flush_max_retries,
        }
    }

    pub fn state(&self) -> FlusherState {
        FlusherState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: FlusherState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Worker loop. Flushes when the interval elapses or when a hint says
    /// the threshold was crossed; a backlog past the high-water mark halves
    /// the interval until it drains.
    pub fn run(&self, rx: Receiver<Control>) {
        loop {
            let wait = if self.buffer.len() > self.high_water {
                self.interval / 2
            } else {
                self.interval
            };
            match rx.recv_timeout(wait) {
                Ok(Control::Hint) => {
                    if self.buffer.len() >= self.flush_threshold {
                        self.flush_cycle();
                    }
                }
                Ok(Control::FlushNow(ack)) => {
                    self.flush_cycle();
                    let _ = ack.send(());
                }
                Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    self.flush_cycle();
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.flush_cycle();
                }
            }
        }
    }

    /// One drain-group-persist-apply pass. Also the synchronous entry point
    /// for `flush_now` and tests.
    pub fn flush_cycle(&self) {
        self.set_state(FlusherState::Draining);
        let drained = self.buffer.drain(self.batch_size);

        let mut groups: BTreeMap<String, PendingGroup> =
            std::mem::take(&mut *self.retry.lock());
        for event in &drained {
            groups.entry(event.phrase.clone()).or_default().delta += 1;
        }
        if groups.is_empty() {
            self.set_state(FlusherState::Idle);
            return;
        }

        // BTreeMap iteration gives the phrase-sorted order the persistence
        // side relies on to avoid deadlocks.
        let deltas: Vec<(String, u64)> = groups
            .iter()
            .map(|(phrase, g)| (phrase.clone(), g.delta))
            .collect();
        let now = Utc::now();

        self.set_state(FlusherState::Persisting);
        match self.store.upsert_batch(&deltas, now) {
            Ok(()) => {
                self.set_state(FlusherState::Indexing);
                self.apply_committed(&deltas);
                self.metrics
                    .flush_batch_size
                    .record(deltas.iter().map(|(_, d)| d).sum());
                debug!(
                    phrases = deltas.len(),
                    events = drained.len(),
                    "flush committed"
                );
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "flush persistence failed");
                self.metrics.flush_failures.fetch_add(1, Ordering::Relaxed);
                self.set_state(FlusherState::Retrying);
                self.requeue(groups);
            }
            Err(e) => {
                self.metrics.flush_failures.fetch_add(1, Ordering::Relaxed);
                let dropped: u64 = groups.values().map(|g| g.delta).sum();
                self.metrics.dead_letters.fetch_add(dropped, Ordering::Relaxed);
                error!(error = %e, dropped, "flush failed permanently, dead-lettering batch");
            }
        }
        self.set_state(FlusherState::Idle);
    }

    /// Index, trending, and cache effects, strictly after the persistence
    /// commit. Index failures here are logged and skipped: the persisted
    /// count stays ahead and the next rebuild reconciles.
    fn apply_committed(&self, deltas: &[(String, u64)]) {
        let now = Utc::now();
        match self.rebuilder.apply_live(&self.index, deltas, now) {
            Ok(touched) => {
                for (phrase, _) in deltas {
                    self.metrics
                        .topk_recompute_depth
                        .record(phrase.chars().count() as u64);
                }
                self.suggestions.invalidate_prefixes(&touched);
            }
            Err(e) => {
                self.metrics.flush_failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "index apply failed after commit");
            }
        }
        for (phrase, delta) in deltas {
            self.trending.bump_by(phrase, *delta as f64, now);
        }
    }

    fn requeue(&self, groups: BTreeMap<String, PendingGroup>) {
        let mut retry = self.retry.lock();
        let mut dead = 0u64;
        for (phrase, mut group) in groups {
            group.attempts += 1;
            if group.attempts >= self.max_retries {
                dead += group.delta;
                warn!(phrase = %phrase, delta = group.delta, "dead-lettering after retries");
            } else {
                retry.insert(phrase, group);
            }
        }
        if dead > 0 {
            self.metrics.dead_letters.fetch_add(dead, Ordering::Relaxed);
        }
        warn!(pending = retry.len(), "flush batch re-queued after transient failure");
    }

    /// Pending retry groups, for stats.
    pub fn retry_backlog(&self) -> usize {
        self.retry.lock().len()
    }
}
