use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::cache::shared::SharedCache;
use crate::core::error::Result;
use crate::core::types::TrendingPhrase;

const TRENDING_KEY: &str = "trending";
const TRENDING_TS_KEY: &str = "trending:ts";

/// Sliding-window sorted set of recent search bursts, held in the shared
/// cache so every process sees the same view. A stored score is the decayed
/// value as of that entry's last bump; decay to "now" happens lazily at
/// read time, so untouched entries never need rewriting. Writes are
/// best-effort and idempotent; a lost bump degrades trending slightly,
/// never corrupts it.
pub struct TrendingWindow {
    cache: Arc<dyn SharedCache>,
    window: Duration,
    tau_secs: f64,
}

impl TrendingWindow {
    pub fn new(cache: Arc<dyn SharedCache>, window_min: i64, tau_min: i64) -> Self {
        TrendingWindow {
            cache,
            window: Duration::minutes(window_min),
            tau_secs: (tau_min * 60) as f64,
        }
    }

    fn decayed(&self, score: f64, last_bump: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age = (now - last_bump).num_seconds().max(0) as f64;
        score * (-age / self.tau_secs).exp()
    }

    fn last_bumps(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        let mut out = HashMap::new();
        for (phrase, raw) in self.cache.hgetall(TRENDING_TS_KEY)? {
            if let Ok(secs) = raw.parse::<i64>() {
                if let Some(ts) = DateTime::from_timestamp(secs, 0) {
                    out.insert(phrase, ts);
                }
            }
        }
        Ok(out)
    }

    /// Records one occurrence: the phrase's stored score is decayed to now,
    /// incremented by one, and re-stamped. Entries that aged out of the
    /// window are evicted on the way.
    pub fn bump(&self, phrase: &str, now: DateTime<Utc>) {
        self.bump_by(phrase, 1.0, now);
    }

    /// Coalesced bump for a flush batch carrying `weight` occurrences.
    pub fn bump_by(&self, phrase: &str, weight: f64, now: DateTime<Utc>) {
        if let Err(e) = self.try_bump(phrase, weight, now) {
            warn!(phrase, error = %e, "trending bump dropped");
        }
    }

    fn try_bump(&self, phrase: &str, weight: f64, now: DateTime<Utc>) -> Result<()> {
        let stamps = self.last_bumps()?;
        self.evict_expired(&stamps, now);

        let prior = self
            .cache
            .zentries(TRENDING_KEY)?
            .into_iter()
            .find(|(m, _)| m == phrase)
            .map(|(_, s)| s)
            .unwrap_or(0.0);
        let decayed = match stamps.get(phrase) {
            Some(&last) => self.decayed(prior, last, now),
            None => 0.0,
        };

        self.cache.zset(TRENDING_KEY, phrase, decayed + weight)?;
        self.cache
            .hset(TRENDING_TS_KEY, phrase, &now.timestamp().to_string())?;
        Ok(())
    }

    fn evict_expired(&self, stamps: &HashMap<String, DateTime<Utc>>, now: DateTime<Utc>) {
        for (phrase, &last) in stamps {
            if now - last > self.window {
                let _ = self.cache.zrem(TRENDING_KEY, phrase);
                let _ = self.cache.hdel(TRENDING_TS_KEY, phrase);
            }
        }
    }

    /// The highest decayed scores inside the window, moderation applied.
    pub fn top(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        exclude: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<TrendingPhrase>> {
        let mut scored: Vec<TrendingPhrase> = self
            .scores(now)?
            .into_iter()
            .filter(|(phrase, _)| !exclude(phrase))
            .map(|(phrase, score)| TrendingPhrase { phrase, score })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.phrase.cmp(&b.phrase))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// Current decayed score per live entry. The ranker's trending snapshot.
    pub fn scores(&self, now: DateTime<Utc>) -> Result<HashMap<String, f64>> {
        let stamps = self.last_bumps()?;
        self.evict_expired(&stamps, now);

        let mut out = HashMap::new();
        for (phrase, stored) in self.cache.zentries(TRENDING_KEY)? {
            let Some(&last) = stamps.get(&phrase) else {
                continue;
            };
            if now - last > self.window {
                continue;
            }
            let score = self.decayed(stored, last, now);
            if score > 0.0 {
                out.insert(phrase, score);
            }
        }
        Ok(out)
    }
}
