pub mod core;
pub mod analysis;
pub mod index;
pub mod scoring;
pub mod trending;
pub mod history;
pub mod cache;
pub mod ingest;
pub mod storage;
pub mod moderation;
pub mod metrics;

/*
┌──────────────────────────────────── TYPEAHEAD ARCHITECTURE ────────────────────────────────────┐
│                                                                                                 │
│  ┌──────────────────────────────────────────────────────────────────────────────────────────┐  │
│  │                              struct SuggestService                                        │  │
│  │  ┌────────────────────────────────────────────────────────────────────────────────────┐ │  │
│  │  │ index: Arc<PrefixIndex>          // arena trie + per-node top-K, RwLock'd          │ │  │
│  │  │ rebuilder: Arc<Rebuilder>        // generation swap + shadow apply                 │ │  │
│  │  │ buffer: Arc<IngestBuffer>        // bounded lock-free event queue                  │ │  │
│  │  │ flusher: Arc<Flusher>            // write-behind worker thread                     │ │  │
│  │  │ suggestions: Arc<SuggestionCache>// prefix -> ranked list, TTL + invalidation      │ │  │
│  │  │ trending: Arc<TrendingWindow>    // decayed sliding-window sorted set              │ │  │
│  │  │ history: Arc<PersonalHistory>    // per-user recent searches                       │ │  │
│  │  │ filter: Arc<ModerationFilter>    // blocklist mirror                               │ │  │
│  │  │ ranker: Ranker                   // pure weighted scoring                          │ │  │
│  │  │ store: Arc<dyn PhraseStore>      // persistent phrase -> count collaborator        │ │  │
│  │  │ metrics: Arc<Metrics>            // counters + histograms                          │ │  │
│  │  └────────────────────────────────────────────────────────────────────────────────────┘ │  │
│  └──────────────────────────────────────────────────────────────────────────────────────────┘  │
│                                                                                                 │
│  query:  suggest() ── cache? ── lookup (shared lock) ── rank(trending, history) ── cache put    │
│  ingest: log_search() ── buffer ── flusher: persist ▸ index ▸ trending ▸ invalidate             │
│  admin:  rebuild / clear-cache / add-phrase / filter-phrase                                     │
│                                                                                                 │
└─────────────────────────────────────────────────────────────────────────────────────────────────┘
*/

pub use crate::core::config::{Config, Weights};
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::service::SuggestService;
pub use crate::core::types::{Deadline, SuggestRequest, SuggestResponse, Suggestion, TrendingPhrase};
pub use crate::cache::shared::{MemoryCache, SharedCache};
pub use crate::storage::file::FileStore;
pub use crate::storage::memory::MemoryStore;
pub use crate::storage::store::PhraseStore;
