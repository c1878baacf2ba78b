use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::cache::shared::SharedCache;
use crate::core::error::Result;
use crate::core::types::HistoryEntry;

const CAS_ATTEMPTS: usize = 3;

/// Per-user recent-search store in the shared cache: a JSON list at
/// `history:{userID}`, most recent first, capped, with a rolling TTL.
/// Anonymous sessions never reach this type.
pub struct PersonalHistory {
    cache: Arc<dyn SharedCache>,
    cap: usize,
    ttl: Duration,
}

impl PersonalHistory {
    pub fn new(cache: Arc<dyn SharedCache>, cap: usize, ttl_days: i64) -> Self {
        PersonalHistory {
            cache,
            cap,
            ttl: Duration::from_secs(ttl_days as u64 * 24 * 3600),
        }
    }

    fn key(user_id: &str) -> String {
        format!("history:{}", user_id)
    }

    /// Moves the phrase to the front of the user's list, incrementing its
    /// count; evicts the least-recently-seen entry past the cap. Applied
    /// with compare-and-swap so concurrent searches by the same user do not
    /// clobber each other; best-effort after a few attempts.
    pub fn record(&self, user_id: &str, phrase: &str, now: DateTime<Utc>) {
        if let Err(e) = self.try_record(user_id, phrase, now) {
            warn!(user_id, phrase, error = %e, "history record dropped");
        }
    }

    fn try_record(&self, user_id: &str, phrase: &str, now: DateTime<Utc>) -> Result<()> {
        let key = Self::key(user_id);
        for _ in 0..CAS_ATTEMPTS {
            let raw = self.cache.get(&key)?;
            let mut entries: Vec<HistoryEntry> = match &raw {
                Some(json) => serde_json::from_str(json).unwrap_or_default(),
                None => Vec::new(),
            };

            let count = match entries.iter().position(|e| e.phrase == phrase) {
                Some(pos) => entries.remove(pos).count + 1,
                None => 1,
            };
            entries.insert(
                0,
                HistoryEntry {
                    phrase: phrase.to_string(),
                    count,
                    last_seen: now,
                },
            );
            entries.truncate(self.cap);

            let updated = serde_json::to_string(&entries)?;
            if self
                .cache
                .compare_and_swap(&key, raw.as_deref(), &updated, Some(self.ttl))?
            {
                return Ok(());
            }
        }
        warn!(user_id, "history compare-and-swap contention, giving up");
        Ok(())
    }

    /// Most recent entries first.
    pub fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        let raw = self.cache.get(&Self::key(user_id))?;
        let mut entries: Vec<HistoryEntry> = match raw {
            Some(json) => serde_json::from_str(&json).unwrap_or_default(),
            None => Vec::new(),
        };
        entries.truncate(limit);
        Ok(entries)
    }

    /// Phrase -> recorded count, the ranker's personalization snapshot.
    pub fn snapshot(&self, user_id: &str) -> Result<HashMap<String, u32>> {
        Ok(self
            .recent(user_id, self.cap)?
            .into_iter()
            .map(|e| (e.phrase, e.count))
            .collect())
    }
}
