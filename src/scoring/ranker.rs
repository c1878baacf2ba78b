use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::core::config::Weights;
use crate::core::types::{Candidate, ScoreComponents, Suggestion};

/// Snapshot of the dynamic signals a ranking pass consults. Built once per
/// query; the ranker itself never touches shared state, so tests can drive
/// it directly.
pub struct RankContext<'a> {
    pub prefix: &'a str,
    pub now: DateTime<Utc>,
    /// Index-wide maximum count, for log-normalizing popularity.
    pub max_count: u64,
    /// Raw trending-window scores by phrase.
    pub trending: &'a HashMap<String, f64>,
    /// The requesting user's recent phrases with their recorded counts.
    pub history: &'a HashMap<String, u32>,
}

/// Pure scoring over a candidate set: five components in [0, 1], weighted
/// sum, deterministic ordering.
pub struct Ranker {
    weights: Weights,
    recency_tau_secs: i64,
}

impl Ranker {
    pub fn new(weights: Weights, recency_tau_secs: i64) -> Self {
        Ranker {
            weights,
            recency_tau_secs,
        }
    }

    pub fn rank(&self, candidates: Vec<Candidate>, ctx: &RankContext) -> Vec<Suggestion> {
        let prefix_len = ctx.prefix.chars().count().max(1);
        let trending_max = ctx
            .trending
            .values()
            .fold(0.0_f64, |acc, &s| acc.max(s));

        let mut ranked: Vec<Suggestion> = candidates
            .into_iter()
            .map(|c| {
                let components = self.components(&c, ctx, prefix_len, trending_max);
                let w = &self.weights;
                let score = w.popularity * components.popularity
                    + w.recency * components.recency
                    + w.personal * components.personal
                    + w.trending * components.trending
                    + w.match_quality * components.match_quality;
                Suggestion {
                    score,
                    components,
                    distance: c.is_fuzzy.then_some(c.distance),
                    phrase: c.phrase,
                    count: c.count,
                    is_fuzzy: c.is_fuzzy,
                }
            })
            .collect();

        ranked.sort_by(cmp_suggestions);
        ranked
    }

    fn components(
        &self,
        candidate: &Candidate,
        ctx: &RankContext,
        prefix_len: usize,
        trending_max: f64,
    ) -> ScoreComponents {
        let popularity = if ctx.max_count == 0 {
            0.0
        } else {
            ((candidate.count + 1) as f64).ln() / ((ctx.max_count + 1) as f64).ln()
        };

        let age = (ctx.now - candidate.last_updated).num_seconds().max(0) as f64;
        let recency = (-age / self.recency_tau_secs as f64).exp();

        let personal = if ctx.history.contains_key(&candidate.phrase) {
            1.0
        } else {
            0.0
        };

        let trending = if trending_max > 0.0 {
            ctx.trending
                .get(&candidate.phrase)
                .map(|s| (s / trending_max).clamp(0.0, 1.0))
                .unwrap_or(0.0)
        } else {
            0.0
        };

        let match_quality = 1.0 - candidate.distance as f64 / prefix_len as f64;

        ScoreComponents {
            popularity: popularity.clamp(0.0, 1.0),
            recency,
            personal,
            trending,
            match_quality: match_quality.clamp(0.0, 1.0),
        }
    }
}

/// Score descending, then count descending, then shorter phrase, then
/// code-point order. Total, so identical inputs rank identically.
fn cmp_suggestions(a: &Suggestion, b: &Suggestion) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.count.cmp(&a.count))
        .then_with(|| a.phrase.chars().count().cmp(&b.phrase.chars().count()))
        .then_with(|| a.phrase.cmp(&b.phrase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TAU: i64 = 7 * 24 * 3600;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn candidate(phrase: &str, count: u64) -> Candidate {
        Candidate {
            phrase: phrase.to_string(),
            count,
            last_updated: now(),
            is_fuzzy: false,
            distance: 0,
        }
    }

    fn empty() -> (HashMap<String, f64>, HashMap<String, u32>) {
        (HashMap::new(), HashMap::new())
    }

    #[test]
    fn components_stay_in_unit_range() {
        let ranker = Ranker::new(Weights::default(), TAU);
        let (trending, history) = empty();
        let ctx = RankContext {
            prefix: "re",
            now: now(),
            max_count: 100,
            trending: &trending,
            history: &history,
        };
        let ranked = ranker.rank(vec![candidate("react", 100), candidate("recipe", 1)], &ctx);
        for s in &ranked {
            for c in [
                s.components.popularity,
                s.components.recency,
                s.components.personal,
                s.components.trending,
                s.components.match_quality,
            ] {
                assert!((0.0..=1.0).contains(&c), "component {} out of range", c);
            }
            assert!((0.0..=1.0).contains(&s.score));
        }
    }

    #[test]
    fn trending_breaks_popularity_ties() {
        let ranker = Ranker::new(Weights::default(), TAU);
        let mut trending = HashMap::new();
        trending.insert("react".to_string(), 12.0);
        let history = HashMap::new();
        let ctx = RankContext {
            prefix: "re",
            now: now(),
            max_count: 50,
            trending: &trending,
            history: &history,
        };

        let ranked = ranker.rank(vec![candidate("recipe", 50), candidate("react", 50)], &ctx);
        assert_eq!(ranked[0].phrase, "react");
        assert!(ranked[0].components.trending > ranked[1].components.trending);
    }

    #[test]
    fn personal_history_lifts_a_users_phrase() {
        let ranker = Ranker::new(Weights::default(), TAU);
        let trending = HashMap::new();
        let mut history = HashMap::new();
        history.insert("rust borrow checker".to_string(), 3);
        let ctx = RankContext {
            prefix: "rust",
            now: now(),
            max_count: 100,
            trending: &trending,
            history: &history,
        };

        let ranked = ranker.rank(
            vec![
                candidate("rust tutorial", 80),
                candidate("rust borrow checker", 40),
            ],
            &ctx,
        );
        assert_eq!(ranked[0].phrase, "rust borrow checker");
        assert_eq!(ranked[0].components.personal, 1.0);
    }

    #[test]
    fn fuzzy_candidates_pay_a_distance_penalty() {
        let ranker = Ranker::new(Weights::default(), TAU);
        let (trending, history) = empty();
        let ctx = RankContext {
            prefix: "java",
            now: now(),
            max_count: 10,
            trending: &trending,
            history: &history,
        };
        let mut fuzzy = candidate("javelin", 10);
        fuzzy.is_fuzzy = true;
        fuzzy.distance = 1;

        let ranked = ranker.rank(vec![fuzzy, candidate("javascript", 10)], &ctx);
        assert_eq!(ranked[0].phrase, "javascript");
        assert_eq!(ranked[0].components.match_quality, 1.0);
        assert_eq!(ranked[1].components.match_quality, 0.75);
        assert_eq!(ranked[1].distance, Some(1));
    }

    #[test]
    fn ordering_is_deterministic_across_full_tie() {
        let ranker = Ranker::new(Weights::default(), TAU);
        let (trending, history) = empty();
        let ctx = RankContext {
            prefix: "wea",
            now: now(),
            max_count: 10,
            trending: &trending,
            history: &history,
        };
        let run = || {
            ranker.rank(
                vec![
                    candidate("weather radar", 10),
                    candidate("weather", 10),
                    candidate("weather forecast", 10),
                ],
                &ctx,
            )
        };
        let a: Vec<String> = run().into_iter().map(|s| s.phrase).collect();
        let b: Vec<String> = run().into_iter().map(|s| s.phrase).collect();
        assert_eq!(a, b);
        assert_eq!(a[0], "weather"); // shortest wins the tie
    }

    #[test]
    fn zero_corpus_scores_zero_popularity() {
        let ranker = Ranker::new(Weights::default(), TAU);
        let (trending, history) = empty();
        let ctx = RankContext {
            prefix: "x",
            now: now(),
            max_count: 0,
            trending: &trending,
            history: &history,
        };
        let ranked = ranker.rank(vec![candidate("x", 0)], &ctx);
        assert_eq!(ranked[0].components.popularity, 0.0);
    }
}
