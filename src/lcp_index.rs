//! LCP index — finds the existing cache entry (if any) that shares the
//! longest common block-prefix with an incoming fingerprint, scoped to
//! one model.
//!
//! Represented as a trie keyed by block signature, one root per model
//! id. Each node carries the set of save ids whose fingerprint passes
//! through it; the deepest node reached while walking an incoming
//! fingerprint yields the candidate set. This keeps admission and
//! eviction (insert/remove a path) and lookup (walk a path) both
//! proportional to fingerprint length rather than catalog size.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::fingerprint::{BlockSignature, Fingerprint};
use crate::metadata::CacheEntry;

#[derive(Default)]
struct TrieNode {
    children: HashMap<BlockSignature, TrieNode>,
    /// save_ids of entries whose fingerprint passes through this node
    /// (i.e. shares at least this many leading blocks).
    save_ids: Vec<String>,
}

impl TrieNode {
    fn insert(&mut self, signatures: &[BlockSignature], save_id: &str) {
        self.save_ids.push(save_id.to_string());
        if let Some((head, rest)) = signatures.split_first() {
            self.children
                .entry(*head)
                .or_default()
                .insert(rest, save_id);
        }
    }

    fn remove(&mut self, signatures: &[BlockSignature], save_id: &str) {
        self.save_ids.retain(|id| id != save_id);
        if let Some((head, rest)) = signatures.split_first() {
            if let Some(child) = self.children.get_mut(head) {
                child.remove(rest, save_id);
                if child.children.is_empty() && child.save_ids.is_empty() {
                    self.children.remove(head);
                }
            }
        }
    }
}

/// A candidate returned from a lookup: the matching entry and how many
/// leading blocks it shares with the query.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub entry: CacheEntry,
    pub match_len: usize,
}

/// Lock-guarded trie-of-tries (one subtree per model id), plus the
/// `save_id -> CacheEntry` map needed to hydrate lookup results with
/// full entries and to support `touch`/`remove` by id.
pub struct LcpIndex {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    roots: HashMap<String, TrieNode>,
    entries: HashMap<String, CacheEntry>,
}

impl LcpIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Rebuild the index from a full set of metadata entries, as done
    /// at startup after `MetadataStore::load`.
    pub fn rebuild(&self, entries: Vec<CacheEntry>) {
        let mut inner = self.inner.write();
        *inner = Inner::default();
        for entry in entries {
            Self::insert_locked(&mut inner, entry);
        }
    }

    pub fn insert(&self, entry: CacheEntry) {
        let mut inner = self.inner.write();
        Self::insert_locked(&mut inner, entry);
    }

    fn insert_locked(inner: &mut Inner, entry: CacheEntry) {
        let root = inner.roots.entry(entry.model.clone()).or_default();
        root.insert(&entry.signatures, &entry.save_id);
        inner.entries.insert(entry.save_id.clone(), entry);
    }

    pub fn remove(&self, save_id: &str) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.remove(save_id) {
            if let Some(root) = inner.roots.get_mut(&entry.model) {
                root.remove(&entry.signatures, save_id);
                if root.children.is_empty() && root.save_ids.is_empty() {
                    inner.roots.remove(&entry.model);
                }
            }
        }
    }

    /// Record a hit's recency without touching trie structure.
    pub fn mark_used(&self, save_id: &str, when: std::time::SystemTime) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.get_mut(save_id) {
            entry.last_used_at = when;
        }
    }

    /// Best candidate under `model` whose match length divided by the
    /// query's block count meets or exceeds `lcp_th`. Ties on match
    /// length broken by most-recent `last_used_at`.
    pub fn best_candidate(
        &self,
        model: &str,
        query: &Fingerprint,
        lcp_th: f64,
    ) -> Option<Candidate> {
        if query.signatures.is_empty() {
            return None;
        }

        let inner = self.inner.read();
        let root = inner.roots.get(model)?;

        let mut node = root;
        let mut match_len = 0usize;
        let mut deepest_save_ids: &[String] = &root.save_ids;

        for sig in &query.signatures {
            match node.children.get(sig) {
                Some(child) => {
                    node = child;
                    match_len += 1;
                    deepest_save_ids = &node.save_ids;
                }
                None => break,
            }
        }

        if match_len == 0 || deepest_save_ids.is_empty() {
            return None;
        }

        let ratio = match_len as f64 / query.signatures.len() as f64;
        if ratio < lcp_th {
            return None;
        }

        deepest_save_ids
            .iter()
            .filter_map(|id| inner.entries.get(id).cloned())
            .max_by_key(|e| e.last_used_at)
            .map(|entry| Candidate { entry, match_len })
    }
}

impl Default for LcpIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint as fp;
    use std::time::{Duration, SystemTime};

    fn entry(save_id: &str, model: &str, text: &str, when: SystemTime) -> CacheEntry {
        let mut e = CacheEntry::new(save_id.to_string(), model.to_string(), fp(text, 4));
        e.last_used_at = when;
        e
    }

    #[test]
    fn exact_match_returns_full_length() {
        let idx = LcpIndex::new();
        let now = SystemTime::now();
        idx.insert(entry("s1", "m", "a b c d e f g h", now));

        let query = fp("a b c d e f g h", 4);
        let cand = idx.best_candidate("m", &query, 0.5).unwrap();
        assert_eq!(cand.match_len, 2);
        assert_eq!(cand.entry.save_id, "s1");
    }

    #[test]
    fn partial_match_above_threshold() {
        let idx = LcpIndex::new();
        let now = SystemTime::now();
        idx.insert(entry("s1", "m", "a b c d e f g h i j k l", now));

        // Query shares first 2 of its 3 blocks => 0.67 ratio.
        let query = fp("a b c d e f g h X Y Z W", 4);
        let cand = idx.best_candidate("m", &query, 0.5).unwrap();
        assert_eq!(cand.match_len, 2);
    }

    #[test]
    fn below_threshold_returns_none() {
        let idx = LcpIndex::new();
        let now = SystemTime::now();
        idx.insert(entry("s1", "m", "a b c d X X X X X X X X", now));

        // Only 1 of 3 blocks match => 0.33 ratio, below 0.5.
        let query = fp("a b c d e f g h i j k l", 4);
        assert!(idx.best_candidate("m", &query, 0.5).is_none());
    }

    #[test]
    fn cross_model_isolation() {
        let idx = LcpIndex::new();
        let now = SystemTime::now();
        idx.insert(entry("s1", "model-a", "a b c d e f g h", now));

        let query = fp("a b c d e f g h", 4);
        assert!(idx.best_candidate("model-b", &query, 0.5).is_none());
    }

    #[test]
    fn tie_break_prefers_most_recent() {
        let idx = LcpIndex::new();
        let older = SystemTime::now() - Duration::from_secs(100);
        let newer = SystemTime::now();
        idx.insert(entry("old", "m", "a b c d e f g h", older));
        idx.insert(entry("new", "m", "a b c d e f g h", newer));

        let query = fp("a b c d e f g h", 4);
        let cand = idx.best_candidate("m", &query, 0.5).unwrap();
        assert_eq!(cand.entry.save_id, "new");
    }

    #[test]
    fn empty_query_fingerprint_never_matches() {
        let idx = LcpIndex::new();
        idx.insert(entry("s1", "m", "a b c d e f g h", SystemTime::now()));
        let query = fp("", 4);
        assert!(idx.best_candidate("m", &query, 0.0).is_none());
    }

    #[test]
    fn remove_drops_entry_from_future_lookups() {
        let idx = LcpIndex::new();
        idx.insert(entry("s1", "m", "a b c d e f g h", SystemTime::now()));
        idx.remove("s1");

        let query = fp("a b c d e f g h", 4);
        assert!(idx.best_candidate("m", &query, 0.5).is_none());
    }
}
