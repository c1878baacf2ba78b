use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::core::error::{Error, Result};

/// One stored phrase. The normalized phrase is the primary key; there is no
/// separate id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhraseRecord {
    pub phrase: String,
    pub count: u64,
    pub last_updated: DateTime<Utc>,
    pub filtered: bool,
}

impl PhraseRecord {
    pub fn new(phrase: String, count: u64, last_updated: DateTime<Utc>) -> Self {
        PhraseRecord {
            phrase,
            count,
            last_updated,
            filtered: false,
        }
    }
}

/// A raw search event waiting in the ingestion buffer. The phrase is already
/// normalized when the event is enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchEvent {
    pub phrase: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Candidate pulled from the prefix index before dynamic ranking.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub phrase: String,
    pub count: u64,
    pub last_updated: DateTime<Utc>,
    pub is_fuzzy: bool,
    /// Edit distance for fuzzy candidates, 0 for exact prefix hits.
    pub distance: u8,
}

/// Per-component breakdown of a suggestion's score, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub popularity: f64,
    pub recency: f64,
    pub personal: f64,
    pub trending: f64,
    #[serde(rename = "match")]
    pub match_quality: f64,
}

/// One ranked completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub phrase: String,
    pub count: u64,
    pub score: f64,
    pub components: ScoreComponents,
    pub is_fuzzy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct SuggestRequest {
    pub prefix: String,
    pub limit: usize,
    pub user_id: Option<String>,
    pub fuzzy: bool,
}

impl SuggestRequest {
    pub fn new(prefix: impl Into<String>, limit: usize) -> Self {
        SuggestRequest {
            prefix: prefix.into(),
            limit,
            user_id: None,
            fuzzy: false,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_fuzzy(mut self) -> Self {
        self.fuzzy = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestResponse {
    pub suggestions: Vec<Suggestion>,
    pub meta: ResponseMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub response_time_ms: u64,
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendingPhrase {
    pub phrase: String,
    pub score: f64,
}

/// One entry in a user's recent-search history, most recent first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub phrase: String,
    pub count: u32,
    pub last_seen: DateTime<Utc>,
}

/// Deadline carried by external calls. Checked at every suspension point;
/// an expired deadline unwinds with `Cancelled` and no partial results.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Option<Instant>,
}

impl Deadline {
    pub fn none() -> Self {
        Deadline { expires_at: None }
    }

    pub fn after(timeout: Duration) -> Self {
        Deadline {
            expires_at: Some(Instant::now() + timeout),
        }
    }

    pub fn expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    pub fn check(&self, op: &str) -> Result<()> {
        if self.expired() {
            Err(Error::cancelled(format!("deadline expired during {}", op)))
        } else {
            Ok(())
        }
    }
}
