use levenshtein_automata::{DFA, Distance, LevenshteinAutomatonBuilder};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::core::types::Candidate;
use crate::index::trie::{ROOT, Trie};

/// Compiled DFAs kept per prefix; hot typo-prone prefixes skip the build.
const DFA_CACHE_CAP: usize = 256;

/// Bounded-distance prefix exploration. A Levenshtein DFA built over the
/// requested prefix is driven along trie edges; any node whose accumulated
/// path sits within the edit budget is a fuzzy prefix hit and contributes
/// its cached top-K. Exploration stops after `budget` visited nodes.
pub struct FuzzyExplorer {
    builder: LevenshteinAutomatonBuilder,
    dfa_cache: Mutex<LruCache<String, Arc<DFA>>>,
    max_edits: u8,
    budget: usize,
}

impl FuzzyExplorer {
    pub fn new(max_edits: u8, budget: usize) -> Self {
        FuzzyExplorer {
            // Transpositions count as a single edit (teh -> the).
            builder: LevenshteinAutomatonBuilder::new(max_edits, true),
            dfa_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(DFA_CACHE_CAP).expect("non-zero cache capacity"),
            )),
            max_edits,
            budget,
        }
    }

    fn dfa_for(&self, prefix: &str) -> Arc<DFA> {
        let mut cache = self.dfa_cache.lock();
        if let Some(dfa) = cache.get(prefix) {
            return dfa.clone();
        }
        let dfa = Arc::new(self.builder.build_dfa(prefix));
        cache.put(prefix.to_string(), dfa.clone());
        dfa
    }

    /// Collects fuzzy candidates for `prefix`, excluding exact hits (those
    /// come from the normal lookup) and anything matching `exclude`.
    pub fn explore(
        &self,
        trie: &Trie,
        prefix: &str,
        limit: usize,
        exclude: &dyn Fn(&str) -> bool,
    ) -> Vec<Candidate> {
        if prefix.is_empty() {
            return Vec::new();
        }
        let dfa = self.dfa_for(prefix);
        let max_depth = prefix.chars().count() + self.max_edits as usize;

        let mut out: Vec<Candidate> = Vec::new();
        let mut visited = 0usize;
        // (node, dfa state, depth); depth 0 is the root, never a hit.
        let mut stack = vec![(ROOT, dfa.initial_state(), 0usize)];

        while let Some((node, state, depth)) = stack.pop() {
            visited += 1;
            if visited > self.budget || out.len() >= limit {
                break;
            }

            if depth > 0 {
                if let Distance::Exact(d) = dfa.distance(state) {
                    if d > 0 && d <= self.max_edits {
                        // The whole subtree shares this prefix distance;
                        // no need to descend past an accepted node.
                        for e in trie.top_entries(node) {
                            if out.len() >= limit {
                                break;
                            }
                            if exclude(&e.phrase) || out.iter().any(|c| c.phrase == e.phrase) {
                                continue;
                            }
                            out.push(Candidate {
                                phrase: e.phrase.clone(),
                                count: e.count,
                                last_updated: e.last_updated,
                                is_fuzzy: true,
                                distance: d,
                            });
                        }
                        continue;
                    }
                }
            }

            if depth >= max_depth {
                continue;
            }
            for &(ch, child) in trie.children(node) {
                let mut next = state;
                let mut buf = [0u8; 4];
                for &b in ch.encode_utf8(&mut buf).as_bytes() {
                    next = dfa.transition(next, b);
                }
                stack.push((child, next, depth + 1));
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn trie_with(phrases: &[(&str, u64)]) -> Trie {
        let mut trie = Trie::new(10, 7 * 24 * 3600);
        for &(p, c) in phrases {
            trie.insert(p, c, now(), now()).unwrap();
        }
        trie
    }

    fn no_filter(_: &str) -> bool {
        false
    }

    #[test]
    fn single_transposition_is_recovered() {
        let trie = trie_with(&[("javascript", 50), ("java", 40)]);
        let explorer = FuzzyExplorer::new(1, 50);
        let hits = explorer.explore(&trie, "jva", 10, &no_filter);
        assert!(hits.iter().any(|c| c.phrase == "javascript"));
        assert!(hits.iter().all(|c| c.is_fuzzy && c.distance == 1));
    }

    #[test]
    fn substitution_is_recovered() {
        let trie = trie_with(&[("weather", 30)]);
        let explorer = FuzzyExplorer::new(1, 50);
        let hits = explorer.explore(&trie, "wezth", 10, &no_filter);
        assert!(hits.iter().any(|c| c.phrase == "weather"));
    }

    #[test]
    fn exact_hits_are_left_to_the_caller_exclusion() {
        let trie = trie_with(&[("weather", 30), ("weapon", 20)]);
        let explorer = FuzzyExplorer::new(1, 50);
        // The caller excludes phrases its exact lookup already returned;
        // only genuinely fuzzy completions remain.
        let hits = explorer.explore(&trie, "weat", 10, &|p| p == "weather");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].phrase, "weapon");
        assert_eq!(hits[0].distance, 1);
    }

    #[test]
    fn distance_two_typos_stay_out_at_one_edit() {
        let trie = trie_with(&[("weather", 30)]);
        let explorer = FuzzyExplorer::new(1, 50);
        let hits = explorer.explore(&trie, "wzzth", 10, &no_filter);
        assert!(hits.is_empty());
    }

    #[test]
    fn budget_caps_exploration() {
        let mut phrases = Vec::new();
        for a in 'a'..='z' {
            for b in 'a'..='z' {
                phrases.push((format!("{}{}x", a, b), 1u64));
            }
        }
        let mut trie = Trie::new(10, 7 * 24 * 3600);
        for (p, c) in &phrases {
            trie.insert(p, *c, now(), now()).unwrap();
        }
        let explorer = FuzzyExplorer::new(1, 10);
        let hits = explorer.explore(&trie, "aa", 1000, &no_filter);
        // With a 10-node budget only a handful of branches get walked.
        assert!(hits.len() < phrases.len());
    }

    #[test]
    fn excluded_phrases_never_surface() {
        let trie = trie_with(&[("javascript", 50)]);
        let explorer = FuzzyExplorer::new(1, 50);
        let hits = explorer.explore(&trie, "jva", 10, &|p| p == "javascript");
        assert!(hits.is_empty());
    }
}
