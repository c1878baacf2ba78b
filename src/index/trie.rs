use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::Candidate;

/// Node id into the trie arena. Slots for pruned nodes stay allocated until
/// the next rebuild compacts the arena.
pub type NodeId = u32;

pub const ROOT: NodeId = 0;

/// One entry of a node's precomputed top-K: a terminal phrase reachable
/// through the node, with its count and static surrogate score.
#[derive(Debug, Clone, PartialEq)]
pub struct TopEntry {
    pub phrase: String,
    pub count: u64,
    pub last_updated: DateTime<Utc>,
    pub score: f64,
}

/// Terminal payload of a node that ends a stored phrase.
#[derive(Debug, Clone)]
struct Terminal {
    phrase: String,
    count: u64,
    last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct Node {
    /// Child edges keyed by single code point, sorted for binary search.
    children: Vec<(char, NodeId)>,
    terminal: Option<Terminal>,
    /// Up to K best phrases in this node's subtree, score descending.
    top: Vec<TopEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub phrase_count: usize,
    pub node_count: usize,
    pub max_depth: usize,
    pub generation: u64,
    pub max_count: u64,
}

/// Static surrogate score used inside node caches: popularity and recency
/// only, so cached rankings do not depend on per-user or per-request state.
pub fn static_score(count: u64, last_updated: DateTime<Utc>, now: DateTime<Utc>, tau_secs: i64) -> f64 {
    let age = (now - last_updated).num_seconds().max(0) as f64;
    let recency = (-age / tau_secs as f64).exp();
    ((count + 1) as f64).ln() * recency
}

/// Ordering inside a top-K list: score descending, then shorter phrase,
/// then code-point order.
fn cmp_entries(a: &TopEntry, b: &TopEntry) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.phrase.chars().count().cmp(&b.phrase.chars().count()))
        .then_with(|| a.phrase.cmp(&b.phrase))
}

/// One generation of the in-memory prefix index: an arena of nodes addressed
/// by integer ids, keyed by code points of normalized phrases. Mutation is
/// single-writer; the generation owner serializes access.
#[derive(Debug)]
pub struct Trie {
    nodes: Vec<Node>,
    phrase_count: usize,
    max_count: u64,
    top_k: usize,
    recency_tau_secs: i64,
}

impl Trie {
    pub fn new(top_k: usize, recency_tau_secs: i64) -> Self {
        Trie {
            nodes: vec![Node::default()],
            phrase_count: 0,
            max_count: 0,
            top_k,
            recency_tau_secs,
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn max_count(&self) -> u64 {
        self.max_count
    }

    pub fn phrase_count(&self) -> usize {
        self.phrase_count
    }

    pub(crate) fn child(&self, node: NodeId, ch: char) -> Option<NodeId> {
        let children = &self.nodes[node as usize].children;
        children
            .binary_search_by_key(&ch, |e| e.0)
            .ok()
            .map(|i| children[i].1)
    }

    pub(crate) fn children(&self, node: NodeId) -> &[(char, NodeId)] {
        &self.nodes[node as usize].children
    }

    pub(crate) fn top_entries(&self, node: NodeId) -> &[TopEntry] {
        &self.nodes[node as usize].top
    }

    /// Walks the prefix down from the root. None when the path is absent.
    pub(crate) fn descend(&self, prefix: &str) -> Option<NodeId> {
        let mut node = ROOT;
        for ch in prefix.chars() {
            node = self.child(node, ch)?;
        }
        Some(node)
    }

    /// Candidates for a prefix, drawn from the node's top-K cache and
    /// filtered through `exclude`, truncated to `limit` (clamped to K).
    /// Missing prefix yields an empty list. O(|prefix| + K).
    pub fn lookup(
        &self,
        prefix: &str,
        limit: usize,
        exclude: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<Candidate>> {
        let limit = limit.min(self.top_k);
        let node = match self.descend(prefix) {
            Some(node) => node,
            None => return Ok(Vec::new()),
        };

        let n = &self.nodes[node as usize];
        if n.top.len() > self.top_k || (n.top.is_empty() && (n.terminal.is_some() || !n.children.is_empty())) {
            return Err(Error::fatal(format!(
                "top-K cache inconsistent at prefix {:?}",
                prefix
            )));
        }

        Ok(n.top
            .iter()
            .filter(|e| !exclude(&e.phrase))
            .take(limit)
            .map(|e| Candidate {
                phrase: e.phrase.clone(),
                count: e.count,
                last_updated: e.last_updated,
                is_fuzzy: false,
                distance: 0,
            })
            .collect())
    }

    /// Inserts a phrase with an absolute count, creating any missing path
    /// nodes, then recomputes top-K along the path. Returns the prefixes
    /// whose top-K changed, for cache invalidation.
    pub fn insert(
        &mut self,
        phrase: &str,
        count: u64,
        last_updated: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        self.upsert(phrase, UpsertMode::Seed { count, last_updated }, now)
    }

    /// Adds a delta to a phrase's count (creating the terminal when absent)
    /// and bumps its last-updated time. Returns changed prefixes.
    pub fn increment(&mut self, phrase: &str, delta: u64, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.upsert(phrase, UpsertMode::Delta(delta), now)
    }

    fn upsert(&mut self, phrase: &str, mode: UpsertMode, now: DateTime<Utc>) -> Result<Vec<String>> {
        if phrase.is_empty() {
            return Err(Error::invalid_input("cannot index an empty phrase"));
        }

        // Walk down, creating missing nodes.
        let mut path = Vec::with_capacity(phrase.chars().count() + 1);
        path.push(ROOT);
        let mut node = ROOT;
        for ch in phrase.chars() {
            node = match self.child(node, ch) {
                Some(next) => next,
                None => {
                    let next = self.alloc();
                    let children = &mut self.nodes[node as usize].children;
                    let pos = children
                        .binary_search_by_key(&ch, |e| e.0)
                        .unwrap_err();
                    children.insert(pos, (ch, next));
                    next
                }
            };
            path.push(node);
        }

        let terminal = &mut self.nodes[node as usize].terminal;
        let (count, last_updated) = match (&terminal, mode) {
            (Some(t), UpsertMode::Delta(delta)) => (t.count + delta, now),
            (None, UpsertMode::Delta(delta)) => (delta, now),
            (_, UpsertMode::Seed { count, last_updated }) => (count, last_updated),
        };
        if terminal.is_none() {
            self.phrase_count += 1;
        }
        self.nodes[node as usize].terminal = Some(Terminal {
            phrase: phrase.to_string(),
            count,
            last_updated,
        });
        self.max_count = self.max_count.max(count);

        Ok(self.recompute_path(phrase, &path, now))
    }

    /// Clears a phrase's terminal, prunes path nodes that become empty, and
    /// recomputes top-K upward. Returns changed prefixes.
    pub fn remove(&mut self, phrase: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut path = Vec::with_capacity(phrase.chars().count() + 1);
        path.push(ROOT);
        let mut node = ROOT;
        for ch in phrase.chars() {
            node = self
                .child(node, ch)
                .ok_or_else(|| Error::not_found(format!("phrase {:?} is not indexed", phrase)))?;
            path.push(node);
        }
        if self.nodes[node as usize].terminal.take().is_none() {
            return Err(Error::not_found(format!("phrase {:?} is not indexed", phrase)));
        }
        self.phrase_count -= 1;

        // Unlink nodes that hold neither a terminal nor children. Their
        // arena slots are reclaimed at the next rebuild.
        let chars: Vec<char> = phrase.chars().collect();
        for depth in (1..path.len()).rev() {
            let id = path[depth];
            let n = &self.nodes[id as usize];
            if n.terminal.is_none() && n.children.is_empty() {
                let parent = path[depth - 1];
                let children = &mut self.nodes[parent as usize].children;
                if let Ok(pos) = children.binary_search_by_key(&chars[depth - 1], |e| e.0) {
                    children.remove(pos);
                }
            }
        }

        Ok(self.recompute_path(phrase, &path, now))
    }

    /// Recomputes top-K bottom-up along a path, collecting the prefixes of
    /// nodes whose top-K actually changed.
    fn recompute_path(&mut self, phrase: &str, path: &[NodeId], now: DateTime<Utc>) -> Vec<String> {
        let chars: Vec<char> = phrase.chars().collect();
        let mut changed = Vec::new();
        for depth in (0..path.len()).rev() {
            let id = path[depth];
            let fresh = self.merged_top(id, now);
            let node = &mut self.nodes[id as usize];
            let dirty = node.top.len() != fresh.len()
                || node
                    .top
                    .iter()
                    .zip(fresh.iter())
                    .any(|(a, b)| a.phrase != b.phrase || a.count != b.count);
            node.top = fresh;
            if dirty {
                changed.push(chars[..depth].iter().collect());
            }
        }
        changed.reverse(); // shortest prefix first
        changed
    }

    /// The merge invariant: a node's top-K is its own terminal entry plus
    /// the union of its children's top-K lists, rescored, sorted, truncated.
    fn merged_top(&self, id: NodeId, now: DateTime<Utc>) -> Vec<TopEntry> {
        let node = &self.nodes[id as usize];
        let mut merged: Vec<TopEntry> = Vec::with_capacity(self.top_k * (node.children.len() + 1));
        if let Some(t) = &node.terminal {
            merged.push(TopEntry {
                phrase: t.phrase.clone(),
                count: t.count,
                last_updated: t.last_updated,
                score: static_score(t.count, t.last_updated, now, self.recency_tau_secs),
            });
        }
        for &(_, child) in &node.children {
            for e in &self.nodes[child as usize].top {
                merged.push(TopEntry {
                    score: static_score(e.count, e.last_updated, now, self.recency_tau_secs),
                    ..e.clone()
                });
            }
        }
        merged.sort_by(cmp_entries);
        merged.truncate(self.top_k);
        merged
    }

    fn alloc(&mut self) -> NodeId {
        self.nodes.push(Node::default());
        (self.nodes.len() - 1) as NodeId
    }

    /// Reachable-node statistics; walks the live structure rather than the
    /// arena so pruned slots are not counted.
    pub fn stats(&self) -> (usize, usize, usize) {
        let mut stack = vec![(ROOT, 0usize)];
        let mut nodes = 0;
        let mut max_depth = 0;
        while let Some((id, depth)) = stack.pop() {
            nodes += 1;
            max_depth = max_depth.max(depth);
            for &(_, child) in &self.nodes[id as usize].children {
                stack.push((child, depth + 1));
            }
        }
        (self.phrase_count, nodes, max_depth)
    }

    /// Full consistency walk used by tests and the forced-rebuild path:
    /// every node's top-K must equal the merge of its terminal and its
    /// children's top-K, and every cached phrase must be a reachable
    /// terminal.
    pub fn check_invariants(&self, now: DateTime<Utc>) -> Result<()> {
        let mut stack = vec![(ROOT, String::new())];
        while let Some((id, prefix)) = stack.pop() {
            let expected = self.merged_top(id, now);
            let node = &self.nodes[id as usize];
            let matches = node.top.len() == expected.len()
                && node
                    .top
                    .iter()
                    .zip(expected.iter())
                    .all(|(a, b)| a.phrase == b.phrase && a.count == b.count);
            if !matches {
                return Err(Error::new(
                    ErrorKind::FatalInvariant,
                    format!("top-K at prefix {:?} diverges from child merge", prefix),
                ));
            }
            for e in &node.top {
                match self.descend(&e.phrase) {
                    Some(t) if self.nodes[t as usize].terminal.is_some() => {}
                    _ => {
                        return Err(Error::new(
                            ErrorKind::FatalInvariant,
                            format!("top-K at {:?} lists non-terminal {:?}", prefix, e.phrase),
                        ));
                    }
                }
                if !e.phrase.starts_with(&prefix) {
                    return Err(Error::new(
                        ErrorKind::FatalInvariant,
                        format!("top-K at {:?} lists out-of-subtree {:?}", prefix, e.phrase),
                    ));
                }
            }
            for &(ch, child) in &node.children {
                let mut p = prefix.clone();
                p.push(ch);
                stack.push((child, p));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum UpsertMode {
    Delta(u64),
    Seed { count: u64, last_updated: DateTime<Utc> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TAU: i64 = 7 * 24 * 3600;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn trie_with(phrases: &[(&str, u64)]) -> Trie {
        let mut trie = Trie::new(10, TAU);
        for &(p, c) in phrases {
            trie.insert(p, c, now(), now()).unwrap();
        }
        trie
    }

    fn no_filter(_: &str) -> bool {
        false
    }

    #[test]
    fn lookup_returns_ordered_candidates() {
        let trie = trie_with(&[("rust", 100), ("ruby", 50), ("rails", 10)]);
        let hits = trie.lookup("ru", 10, &no_filter).unwrap();
        let phrases: Vec<&str> = hits.iter().map(|c| c.phrase.as_str()).collect();
        assert_eq!(phrases, vec!["rust", "ruby"]);
        assert_eq!(hits[0].count, 100);
    }

    #[test]
    fn missing_prefix_is_empty() {
        let trie = trie_with(&[("rust", 100)]);
        assert!(trie.lookup("python", 10, &no_filter).unwrap().is_empty());
    }

    #[test]
    fn limit_is_clamped_to_k() {
        let mut trie = Trie::new(3, TAU);
        for (i, p) in ["aa", "ab", "ac", "ad", "ae"].iter().enumerate() {
            trie.insert(p, (10 - i) as u64, now(), now()).unwrap();
        }
        let hits = trie.lookup("a", 100, &no_filter).unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn excluded_phrases_are_dropped() {
        let trie = trie_with(&[("rust", 100), ("ruby", 50)]);
        let hits = trie
            .lookup("ru", 10, &|p| p == "rust")
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].phrase, "ruby");
    }

    #[test]
    fn equal_scores_break_ties_by_length_then_codepoint() {
        let trie = trie_with(&[("weather radar", 10), ("weather", 10), ("weather forecast", 10)]);
        let hits = trie.lookup("weather", 10, &no_filter).unwrap();
        let phrases: Vec<&str> = hits.iter().map(|c| c.phrase.as_str()).collect();
        assert_eq!(phrases, vec!["weather", "weather forecast", "weather radar"]);
    }

    #[test]
    fn increment_creates_and_accumulates() {
        let mut trie = Trie::new(10, TAU);
        trie.increment("go", 2, now()).unwrap();
        trie.increment("go", 3, now()).unwrap();
        let hits = trie.lookup("g", 10, &no_filter).unwrap();
        assert_eq!(hits[0].count, 5);
        assert_eq!(trie.max_count(), 5);
        assert_eq!(trie.phrase_count(), 1);
    }

    #[test]
    fn increment_reports_changed_prefix_chain() {
        let mut trie = trie_with(&[("java", 10)]);
        let touched = trie.increment("java", 1, now()).unwrap();
        // Every prefix of "java" re-merges to a different count.
        assert_eq!(touched, vec!["", "j", "ja", "jav", "java"]);
    }

    #[test]
    fn increment_of_outranked_phrase_leaves_upper_topk_untouched() {
        let mut trie = Trie::new(1, TAU);
        trie.insert("ab", 100, now(), now()).unwrap();
        trie.insert("ac", 1, now(), now()).unwrap();
        // "ac" stays below "ab" everywhere above its own terminal.
        let touched = trie.increment("ac", 1, now()).unwrap();
        assert_eq!(touched, vec!["ac"]);
    }

    #[test]
    fn remove_restores_prior_state() {
        let mut trie = trie_with(&[("car", 5)]);
        let before = trie.stats();

        trie.insert("cart", 7, now(), now()).unwrap();
        assert_eq!(trie.phrase_count(), 2);
        trie.remove("cart", now()).unwrap();

        assert_eq!(trie.stats(), before);
        let hits = trie.lookup("car", 10, &no_filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].phrase, "car");
        trie.check_invariants(now()).unwrap();
    }

    #[test]
    fn remove_unknown_phrase_is_not_found() {
        let mut trie = trie_with(&[("car", 5)]);
        let err = trie.remove("cart", now()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        let err = trie.remove("ca", now()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn removing_mid_phrase_keeps_longer_phrases_reachable() {
        let mut trie = trie_with(&[("car", 5), ("cart", 7)]);
        trie.remove("car", now()).unwrap();
        let hits = trie.lookup("car", 10, &no_filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].phrase, "cart");
        trie.check_invariants(now()).unwrap();
    }

    #[test]
    fn invariants_hold_after_mixed_mutations() {
        let mut trie = Trie::new(3, TAU);
        let phrases = [
            "weather", "weather radar", "weather forecast", "web", "webassembly",
            "rust", "rust async", "rustup", "ruby", "ruby on rails",
        ];
        for (i, p) in phrases.iter().enumerate() {
            trie.insert(p, (i as u64 + 1) * 3, now(), now()).unwrap();
        }
        trie.increment("web", 50, now()).unwrap();
        trie.increment("weather radar", 2, now()).unwrap();
        trie.remove("rust async", now()).unwrap();
        trie.remove("ruby", now()).unwrap();
        trie.check_invariants(now()).unwrap();

        let (phrase_count, _, _) = trie.stats();
        assert_eq!(phrase_count, 8);
    }

    #[test]
    fn recency_decay_demotes_stale_phrases() {
        let mut trie = Trie::new(10, TAU);
        let old = now() - chrono::Duration::days(60);
        trie.insert("stale", 1000, old, now()).unwrap();
        trie.insert("fresh", 200, now(), now()).unwrap();
        let hits = trie.lookup("", 10, &no_filter).unwrap();
        assert_eq!(hits[0].phrase, "fresh");
    }

    #[test]
    fn stats_reports_reachable_structure() {
        let trie = trie_with(&[("ab", 1), ("ac", 1)]);
        let (phrases, nodes, depth) = trie.stats();
        assert_eq!(phrases, 2);
        // root, "a", "ab", "ac"
        assert_eq!(nodes, 4);
        assert_eq!(depth, 2);
    }
}
