use chrono::Utc;
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::analysis::normalizer;
use crate::cache::shared::SharedCache;
use crate::cache::suggestion::SuggestionCache;
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::ServiceStats;
use crate::core::types::{
    Deadline, ResponseMeta, SearchEvent, SuggestRequest, SuggestResponse, TrendingPhrase,
};
use crate::history::store::PersonalHistory;
use crate::index::prefix::PrefixIndex;
use crate::index::rebuild::{RebuildReport, Rebuilder};
use crate::ingest::buffer::IngestBuffer;
use crate::ingest::flusher::{Control, Flusher};
use crate::metrics::emitter::Metrics;
use crate::moderation::filter::ModerationFilter;
use crate::scoring::ranker::{RankContext, Ranker};
use crate::storage::store::PhraseStore;
use crate::trending::window::TrendingWindow;

const FLUSH_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const TRENDING_LIMIT_MAX: usize = 50;
const SUGGEST_LIMIT_MAX: usize = 20;

/// The suggestion engine facade: owns the prefix index, the ingestion
/// pipeline, and the cache/freshness protocol, and collaborates with a
/// persistent phrase store and a shared cache. Queries never mutate the
/// index; the flusher worker and the rebuilder's swap are the only writers.
pub struct SuggestService {
    config: Config,
    store: Arc<dyn PhraseStore>,
    index: Arc<PrefixIndex>,
    rebuilder: Arc<Rebuilder>,
    trending: Arc<TrendingWindow>,
    history: Arc<PersonalHistory>,
    suggestions: Arc<SuggestionCache>,
    filter: Arc<ModerationFilter>,
    buffer: Arc<IngestBuffer>,
    flusher: Arc<Flusher>,
    metrics: Arc<Metrics>,
    ranker: Ranker,
    control: Sender<Control>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SuggestService {
    /// Bootstraps the index from persistence, loads the moderation mirror,
    /// and starts the flusher worker.
    pub fn open(
        store: Arc<dyn PhraseStore>,
        shared: Arc<dyn SharedCache>,
        config: Config,
    ) -> Result<Self> {
        let index = Arc::new(PrefixIndex::new(&config));
        let rebuilder = Arc::new(Rebuilder::new());

        // Bootstrap is a rebuild into an empty service: page the corpus in,
        // then swap the populated generation live.
        let report = rebuilder.rebuild(&index, store.as_ref(), config.load_batch)?;
        info!(
            phrases = report.phrase_count,
            duration_ms = report.duration_ms,
            "corpus loaded"
        );

        let filter = Arc::new(ModerationFilter::load(store.clone())?);
        let trending = Arc::new(TrendingWindow::new(
            shared.clone(),
            config.trending_window_min,
            config.trending_tau_min,
        ));
        let history = Arc::new(PersonalHistory::new(
            shared.clone(),
            config.history_cap,
            config.history_ttl_days,
        ));
        let suggestions = Arc::new(SuggestionCache::new(
            shared,
            config.suggestion_ttl_s,
            config.user_buckets,
        ));
        let buffer = Arc::new(IngestBuffer::new(config.buffer_capacity));
        let metrics = Arc::new(Metrics::new());
        let ranker = Ranker::new(config.weights, config.recency_tau_days * 24 * 3600);

        let flusher = Arc::new(Flusher::new(
            buffer.clone(),
            store.clone(),
            index.clone(),
            rebuilder.clone(),
            trending.clone(),
            suggestions.clone(),
            metrics.clone(),
            &config,
        ));

        let (control, control_rx) = channel::bounded(16);
        let worker = {
            let flusher = flusher.clone();
            std::thread::Builder::new()
                .name("typeahead-flusher".to_string())
                .spawn(move || flusher.run(control_rx))?
        };

        Ok(SuggestService {
            config,
            store,
            index,
            rebuilder,
            trending,
            history,
            suggestions,
            filter,
            buffer,
            flusher,
            metrics,
            ranker,
            control,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Ranked completions for a typed prefix. Fail-soft everywhere except
    /// invalid input, a missed deadline, or an index invariant breach.
    pub fn suggest(&self, request: &SuggestRequest, deadline: &Deadline) -> Result<SuggestResponse> {
        let started = Instant::now();
        self.metrics.queries.fetch_add(1, Ordering::Relaxed);

        let prefix = normalizer::normalize_with_limit(&request.prefix, self.config.max_phrase_len)?;
        if request.limit == 0 {
            return Err(Error::invalid_input("limit must be at least 1"));
        }
        let limit = request
            .limit
            .min(SUGGEST_LIMIT_MAX)
            .min(self.config.top_k);
        let user_id = request.user_id.as_deref();

        deadline.check("cache fetch")?;
        let key = self.suggestions.key(&prefix, limit, request.fuzzy, user_id);
        match self.suggestions.get(&key) {
            Ok(Some(cached)) => {
                return Ok(SuggestResponse {
                    suggestions: cached,
                    meta: ResponseMeta {
                        response_time_ms: started.elapsed().as_millis() as u64,
                        cached: true,
                    },
                });
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "suggestion cache unavailable, serving fresh"),
        }

        deadline.check("index lookup")?;
        let filter = &self.filter;
        let exclude = |phrase: &str| filter.is_filtered(phrase);
        let mut candidates = match self.index.lookup(&prefix, limit, &exclude) {
            Ok(candidates) => candidates,
            Err(e) if e.kind == ErrorKind::FatalInvariant => {
                error!(error = %e, "index invariant breach, forcing rebuild");
                self.force_rebuild();
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if request.fuzzy && candidates.len() < limit {
            let exact: HashSet<String> = candidates.iter().map(|c| c.phrase.clone()).collect();
            let exclude_fuzzy =
                |phrase: &str| filter.is_filtered(phrase) || exact.contains(phrase);
            let room = limit - candidates.len();
            candidates.extend(self.index.fuzzy_lookup(&prefix, room, &exclude_fuzzy)?);
        }

        deadline.check("signal fetch")?;
        let now = Utc::now();
        let trending = self.trending.scores(now).unwrap_or_else(|e| {
            warn!(error = %e, "trending unavailable, scoring without it");
            Default::default()
        });
        let history = match user_id {
            Some(uid) => self.history.snapshot(uid).unwrap_or_else(|e| {
                warn!(error = %e, "history unavailable, scoring without it");
                Default::default()
            }),
            None => Default::default(),
        };

        let ctx = RankContext {
            prefix: &prefix,
            now,
            max_count: self.index.max_count(),
            trending: &trending,
            history: &history,
        };
        let ranked = self.ranker.rank(candidates, &ctx);

        if let Err(e) = self.suggestions.put(&key, &ranked) {
            warn!(error = %e, "suggestion cache write failed");
        }

        let elapsed = started.elapsed();
        self.metrics
            .query_latency_us
            .record(elapsed.as_micros() as u64);
        Ok(SuggestResponse {
            suggestions: ranked,
            meta: ResponseMeta {
                response_time_ms: elapsed.as_millis() as u64,
                cached: false,
            },
        })
    }

    /// Records a raw search. Never fails toward the caller: unnormalizable
    /// queries and buffer overflow are counted, not surfaced.
    pub fn log_search(&self, query: &str, user_id: Option<&str>, session_id: Option<&str>) {
        let phrase = match normalizer::normalize_with_limit(query, self.config.max_phrase_len) {
            Ok(phrase) => phrase,
            Err(_) => return,
        };
        let now = Utc::now();
        self.buffer.submit(SearchEvent {
            phrase: phrase.clone(),
            user_id: user_id.map(str::to_string),
            session_id: session_id.map(str::to_string),
            timestamp: now,
        });
        if self.buffer.len() >= self.config.flush_threshold {
            let _ = self.control.try_send(Control::Hint);
        }

        if let Some(uid) = user_id {
            if !self.filter.is_filtered(&phrase) {
                self.history.record(uid, &phrase, now);
            }
        }
    }

    /// Highest trending phrases in the window, moderation applied.
    pub fn trending(&self, limit: usize) -> Result<Vec<TrendingPhrase>> {
        if limit == 0 {
            return Err(Error::invalid_input("limit must be at least 1"));
        }
        let filter = &self.filter;
        self.trending.top(limit.min(TRENDING_LIMIT_MAX), Utc::now(), &|phrase| {
            filter.is_filtered(phrase)
        })
    }

    /// Synchronous offline rebuild; returns after the generation swap.
    /// Rejected with `RebuildInProgress` while another rebuild runs.
    pub fn rebuild(&self) -> Result<RebuildReport> {
        let report = self
            .rebuilder
            .rebuild(&self.index, self.store.as_ref(), self.config.load_batch)?;
        self.metrics.rebuilds.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .last_rebuild_ms
            .store(report.duration_ms, Ordering::Relaxed);
        self.suggestions.clear();
        Ok(report)
    }

    /// Drops every cached suggestion list.
    pub fn clear_cache(&self) {
        self.suggestions.clear();
    }

    /// Admin insert: adds `count` occurrences of a phrase through the same
    /// persist-then-index path a flush uses, and invalidates its prefixes.
    pub fn add_phrase(&self, phrase: &str, count: u64) -> Result<()> {
        let phrase = normalizer::normalize_with_limit(phrase, self.config.max_phrase_len)?;
        let now = Utc::now();
        let deltas = vec![(phrase, count)];
        self.store.upsert_batch(&deltas, now)?;
        let touched = self.rebuilder.apply_live(&self.index, &deltas, now)?;
        self.suggestions.invalidate_prefixes(&touched);
        Ok(())
    }

    /// Blocks a phrase everywhere queries can see it, immediately.
    pub fn filter_phrase(&self, phrase: &str, reason: &str) -> Result<()> {
        let phrase = normalizer::normalize_with_limit(phrase, self.config.max_phrase_len)?;
        self.filter.add(&phrase, reason)?;
        self.suggestions.invalidate_phrase(&phrase);
        info!(phrase = %phrase, reason, "phrase filtered");
        Ok(())
    }

    /// Lifts a moderation block. `NotFound` when the phrase is not filtered.
    pub fn unfilter_phrase(&self, phrase: &str) -> Result<()> {
        let phrase = normalizer::normalize_with_limit(phrase, self.config.max_phrase_len)?;
        self.filter.remove(&phrase)?;
        self.suggestions.invalidate_phrase(&phrase);
        Ok(())
    }

    /// Forces a flush and waits for it to complete. Deterministic hook for
    /// embedders and tests.
    pub fn flush_now(&self) -> Result<()> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.control
            .send(Control::FlushNow(ack_tx))
            .map_err(|_| Error::new(ErrorKind::Internal, "flusher worker is gone".to_string()))?;
        ack_rx
            .recv_timeout(FLUSH_ACK_TIMEOUT)
            .map_err(|_| Error::new(ErrorKind::Internal, "flush acknowledgement timed out".to_string()))
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            index: self.index.stats(),
            rebuild_state: self.rebuilder.state(),
            flusher_state: self.flusher.state().as_str().to_string(),
            buffer_len: self.buffer.len(),
            buffer_capacity: self.buffer.capacity(),
            buffer_overflow: self.buffer.overflow(),
            retry_backlog: self.flusher.retry_backlog(),
            filtered_phrases: self.filter.len(),
            suggestion_cache: self.suggestions.stats(),
            metrics: self.metrics.snapshot(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Final flush, then stops the worker. Called by `Drop` as well.
    pub fn shutdown(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = self.control.send(Control::Shutdown);
            if handle.join().is_err() {
                error!("flusher worker panicked during shutdown");
            }
        }
    }

    /// Detached recovery path for a `FatalInvariant`: rebuild from
    /// persistence and drop the cache, off the query thread.
    fn force_rebuild(&self) {
        let rebuilder = self.rebuilder.clone();
        let index = self.index.clone();
        let store = self.store.clone();
        let suggestions = self.suggestions.clone();
        let metrics = self.metrics.clone();
        let load_batch = self.config.load_batch;
        std::thread::spawn(move || {
            match rebuilder.rebuild(&index, store.as_ref(), load_batch) {
                Ok(report) => {
                    metrics.rebuilds.fetch_add(1, Ordering::Relaxed);
                    metrics
                        .last_rebuild_ms
                        .store(report.duration_ms, Ordering::Relaxed);
                    suggestions.clear();
                }
                Err(e) => error!(error = %e, "forced rebuild failed"),
            }
        });
    }
}

impl Drop for SuggestService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::shared::MemoryCache;
    use crate::core::types::PhraseRecord;
    use crate::storage::memory::MemoryStore;

    fn service() -> SuggestService {
        service_with(Config::default(), MemoryStore::new())
    }

    fn service_with(config: Config, store: MemoryStore) -> SuggestService {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        SuggestService::open(Arc::new(store), Arc::new(MemoryCache::new()), config).unwrap()
    }

    #[test]
    fn ingest_flush_query_then_cache_hit() {
        let svc = service();
        for _ in 0..5 {
            svc.log_search("JavaScript ", None, Some("session-1"));
        }
        svc.flush_now().unwrap();

        let request = SuggestRequest::new("jav", 3);
        let first = svc.suggest(&request, &Deadline::none()).unwrap();
        assert!(!first.meta.cached);
        assert_eq!(first.suggestions.len(), 1);
        assert_eq!(first.suggestions[0].phrase, "javascript");
        assert_eq!(first.suggestions[0].count, 5);

        let second = svc.suggest(&request, &Deadline::none()).unwrap();
        assert!(second.meta.cached);
        assert_eq!(second.suggestions[0].count, 5);
    }

    #[test]
    fn normalization_composes_through_ingest_and_query() {
        let svc = service();
        svc.log_search("  Hello   World ", None, None);
        svc.flush_now().unwrap();

        let response = svc
            .suggest(&SuggestRequest::new("hello world", 5), &Deadline::none())
            .unwrap();
        assert_eq!(response.suggestions[0].phrase, "hello world");
    }

    #[test]
    fn flush_refreshes_previously_cached_prefix() {
        let svc = service();
        svc.log_search("rust", None, None);
        svc.flush_now().unwrap();

        let request = SuggestRequest::new("ru", 5);
        let stale = svc.suggest(&request, &Deadline::none()).unwrap();
        assert_eq!(stale.suggestions[0].count, 1);

        for _ in 0..4 {
            svc.log_search("rust", None, None);
        }
        svc.flush_now().unwrap();

        // the flush invalidated sugg:ru:*, so this is a fresh read
        let fresh = svc.suggest(&request, &Deadline::none()).unwrap();
        assert!(!fresh.meta.cached);
        assert_eq!(fresh.suggestions[0].count, 5);
    }

    #[test]
    fn bootstrap_loads_existing_corpus() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.seed((0..1000).map(|i| PhraseRecord::new(format!("phrase {:04}", i), i + 1, now)));

        let svc = service_with(Config::default(), store);
        assert_eq!(svc.stats().index.phrase_count, 1000);

        let report = svc.rebuild().unwrap();
        assert_eq!(report.phrase_count, 1000);
        assert_eq!(svc.stats().index.generation, 2);
    }

    #[test]
    fn tie_break_prefers_the_shorter_phrase() {
        let svc = service();
        for phrase in ["weather", "weather forecast", "weather radar"] {
            svc.add_phrase(phrase, 10).unwrap();
        }

        let response = svc
            .suggest(&SuggestRequest::new("weather", 2), &Deadline::none())
            .unwrap();
        assert_eq!(response.suggestions.len(), 2);
        assert_eq!(response.suggestions[0].phrase, "weather");
    }

    #[test]
    fn trending_burst_outranks_equally_popular_phrase() {
        let svc = service();
        svc.add_phrase("recipe", 100).unwrap();
        svc.add_phrase("react", 50).unwrap();
        for _ in 0..50 {
            svc.log_search("react", None, None);
        }
        svc.flush_now().unwrap();

        let trending = svc.trending(5).unwrap();
        assert_eq!(trending[0].phrase, "react");
        assert!(trending[0].score > 0.0);

        // both count 100 now; only react is trending
        let response = svc
            .suggest(&SuggestRequest::new("re", 5), &Deadline::none())
            .unwrap();
        assert_eq!(response.suggestions[0].phrase, "react");
    }

    #[test]
    fn filtered_phrase_vanishes_from_queries_and_trending() {
        let svc = service();
        svc.add_phrase("badword", 1000).unwrap();
        svc.add_phrase("badger", 10).unwrap();

        // cache a result that currently contains the phrase
        let before = svc
            .suggest(&SuggestRequest::new("bad", 5), &Deadline::none())
            .unwrap();
        assert_eq!(before.suggestions[0].phrase, "badword");

        svc.filter_phrase("badword", "abuse").unwrap();

        let after = svc
            .suggest(&SuggestRequest::new("bad", 5), &Deadline::none())
            .unwrap();
        assert!(after.suggestions.iter().all(|s| s.phrase != "badword"));
        assert_eq!(after.suggestions[0].phrase, "badger");

        // it keeps receiving ingest events without resurfacing
        for _ in 0..10 {
            svc.log_search("badword", Some("u1"), None);
        }
        svc.flush_now().unwrap();
        assert!(svc.trending(10).unwrap().iter().all(|t| t.phrase != "badword"));
        assert_eq!(svc.store.get("badword").unwrap().unwrap().count, 1010);
        // and the user's history skipped it
        assert!(svc.history.recent("u1", 10).unwrap().is_empty());

        svc.unfilter_phrase("badword").unwrap();
        let restored = svc
            .suggest(&SuggestRequest::new("bad", 5), &Deadline::none())
            .unwrap();
        assert_eq!(restored.suggestions[0].phrase, "badword");
    }

    #[test]
    fn personalization_prefers_the_users_history() {
        let svc = service();
        svc.add_phrase("rust tutorial", 80).unwrap();
        svc.add_phrase("rust borrow checker", 40).unwrap();
        svc.log_search("rust borrow checker", Some("alice"), None);
        svc.flush_now().unwrap();

        let anonymous = svc
            .suggest(&SuggestRequest::new("rust", 5), &Deadline::none())
            .unwrap();
        assert_eq!(anonymous.suggestions[0].phrase, "rust tutorial");

        // the user may share bucket 0 with anonymous traffic
        svc.clear_cache();
        let personalized = svc
            .suggest(
                &SuggestRequest::new("rust", 5).with_user("alice"),
                &Deadline::none(),
            )
            .unwrap();
        assert_eq!(personalized.suggestions[0].phrase, "rust borrow checker");
        assert_eq!(personalized.suggestions[0].components.personal, 1.0);
    }

    #[test]
    fn fuzzy_request_recovers_a_transposed_prefix() {
        let svc = service();
        svc.add_phrase("javascript", 50).unwrap();

        let strict = svc
            .suggest(&SuggestRequest::new("jva", 5), &Deadline::none())
            .unwrap();
        assert!(strict.suggestions.is_empty());

        let fuzzy = svc
            .suggest(&SuggestRequest::new("jva", 5).with_fuzzy(), &Deadline::none())
            .unwrap();
        assert_eq!(fuzzy.suggestions[0].phrase, "javascript");
        assert!(fuzzy.suggestions[0].is_fuzzy);
        assert_eq!(fuzzy.suggestions[0].distance, Some(1));
    }

    #[test]
    fn invalid_inputs_are_rejected_up_front() {
        let svc = service();
        let oversized = "x".repeat(81);
        for prefix in ["", "   ", oversized.as_str()] {
            let err = svc
                .suggest(&SuggestRequest::new(prefix.to_string(), 5), &Deadline::none())
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidInput, "prefix {:?}", prefix);
        }
        let err = svc
            .suggest(&SuggestRequest::new("ok", 0), &Deadline::none())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        let err = svc.trending(0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn max_length_prefix_is_accepted() {
        let svc = service();
        let phrase = "a".repeat(80);
        svc.add_phrase(&phrase, 3).unwrap();
        let response = svc
            .suggest(&SuggestRequest::new(phrase.clone(), 5), &Deadline::none())
            .unwrap();
        assert_eq!(response.suggestions[0].phrase, phrase);
    }

    #[test]
    fn oversized_limit_clamps_to_k() {
        let svc = service();
        for i in 0..15 {
            svc.add_phrase(&format!("query {:02}", i), 15 - i).unwrap();
        }
        let response = svc
            .suggest(&SuggestRequest::new("query", 100), &Deadline::none())
            .unwrap();
        assert_eq!(response.suggestions.len(), Config::default().top_k);
    }

    #[test]
    fn expired_deadline_cancels_with_no_partial_results() {
        let svc = service();
        svc.add_phrase("rust", 5).unwrap();
        let deadline = Deadline::after(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(2));

        let err = svc
            .suggest(&SuggestRequest::new("ru", 5), &deadline)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[test]
    fn overflow_counts_dropped_events_and_keeps_the_rest() {
        let mut config = Config::default();
        config.buffer_capacity = 100;
        config.flush_threshold = 10_000; // keep the hint path quiet
        let svc = service_with(config, MemoryStore::new());

        for i in 0..10_000 {
            svc.log_search(&format!("q{}", i), None, None);
        }
        let overflow = svc.stats().buffer_overflow;
        assert_eq!(overflow, 9_900);

        svc.flush_now().unwrap();
        // every surviving event was persisted exactly once
        let mut total = 0;
        let mut cursor = None;
        loop {
            let page = svc.store.load_page(cursor.as_deref(), 500).unwrap();
            total += page.records.iter().map(|r| r.count).sum::<u64>();
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        assert_eq!(total, 100);
    }

    #[test]
    fn clear_cache_forces_fresh_reads() {
        let svc = service();
        svc.add_phrase("rust", 5).unwrap();
        let request = SuggestRequest::new("ru", 5);
        svc.suggest(&request, &Deadline::none()).unwrap();
        assert!(svc.suggest(&request, &Deadline::none()).unwrap().meta.cached);

        svc.clear_cache();
        assert!(!svc.suggest(&request, &Deadline::none()).unwrap().meta.cached);
    }

    #[test]
    fn stats_reflect_activity() {
        let svc = service();
        svc.add_phrase("rust", 5).unwrap();
        svc.suggest(&SuggestRequest::new("ru", 5), &Deadline::none())
            .unwrap();

        let stats = svc.stats();
        assert_eq!(stats.index.phrase_count, 1);
        assert_eq!(stats.metrics.queries, 1);
        assert_eq!(stats.flusher_state, "idle");
        assert_eq!(stats.buffer_len, 0);
    }
}
