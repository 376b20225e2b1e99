//! In-memory BM25 keyword index over chunks.
//!
//! Scoring uses the Okapi BM25 formula with `k1 = 1.2` and `b = 0.75`:
//!
//! ```text
//! idf(t)      = ln(1 + (N − n_t + 0.5) / (n_t + 0.5))
//! score(c, q) = Σ_t idf(t) · tf · (k1 + 1) / (tf + k1 · (1 − b + b · |c| / avgdl))
//! ```
//!
//! Postings are kept per term; each chunk also remembers its own term
//! frequencies so that removal touches only the postings it contributed.

use std::collections::{BTreeMap, HashMap};

use crate::models::ChunkId;

pub const K1: f64 = 1.2;
pub const B: f64 = 0.75;

/// Split text into lowercase alphanumeric runs.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct KeywordIndex {
    postings: HashMap<String, HashMap<ChunkId, u32>>,
    /// Per-chunk term frequencies and length.
    chunks: HashMap<ChunkId, ChunkTerms>,
    total_len: u64,
}

#[derive(Debug, Clone, Default)]
struct ChunkTerms {
    freqs: HashMap<String, u32>,
    len: u32,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.chunks.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ChunkId> {
        self.chunks.keys()
    }

    /// Index (or re-index) a chunk's text.
    pub fn upsert(&mut self, id: ChunkId, text: &str) {
        self.remove(&id);

        let tokens = tokenize(text);
        let mut freqs: HashMap<String, u32> = HashMap::new();
        for t in &tokens {
            *freqs.entry(t.clone()).or_insert(0) += 1;
        }
        for (term, tf) in &freqs {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(id.clone(), *tf);
        }
        let len = tokens.len() as u32;
        self.total_len += u64::from(len);
        self.chunks.insert(id, ChunkTerms { freqs, len });
    }

    /// Drop a chunk's postings. Returns whether it was present.
    pub fn remove(&mut self, id: &ChunkId) -> bool {
        let Some(entry) = self.chunks.remove(id) else {
            return false;
        };
        self.total_len -= u64::from(entry.len);
        for term in entry.freqs.keys() {
            if let Some(list) = self.postings.get_mut(term) {
                list.remove(id);
                if list.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        true
    }

    /// Top `k` chunks by BM25 score for the given terms, descending, ties by id.
    ///
    /// Only chunks containing at least one term are returned. Duplicate terms
    /// count once.
    pub fn query(&self, terms: &[String], k: usize) -> Vec<(ChunkId, f64)> {
        if k == 0 || self.chunks.is_empty() {
            return Vec::new();
        }
        let n = self.chunks.len() as f64;
        let avgdl = (self.total_len as f64 / n).max(1.0);

        let mut unique: Vec<&String> = terms.iter().collect();
        unique.sort();
        unique.dedup();

        let mut scores: BTreeMap<&ChunkId, f64> = BTreeMap::new();
        for term in unique {
            let Some(list) = self.postings.get(term) else {
                continue;
            };
            let df = list.len() as f64;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
            for (id, tf) in list {
                let tf = f64::from(*tf);
                let dl = self
                    .chunks
                    .get(id)
                    .map(|c| f64::from(c.len))
                    .unwrap_or(avgdl);
                let norm = tf + K1 * (1.0 - B + B * dl / avgdl);
                *scores.entry(id).or_insert(0.0) += idf * tf * (K1 + 1.0) / norm;
            }
        }

        let mut ranked: Vec<(ChunkId, f64)> = scores
            .into_iter()
            .map(|(id, score)| (id.clone(), score))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(k);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentId;

    fn id(doc: &str, seq: u32) -> ChunkId {
        ChunkId::new(DocumentId::new(doc), seq)
    }

    fn terms(q: &str) -> Vec<String> {
        tokenize(q)
    }

    #[test]
    fn test_tokenize_lowercases_alnum_runs() {
        assert_eq!(
            tokenize("Meeting-Notes, v2: TL;DR!"),
            vec!["meeting", "notes", "v2", "tl", "dr"]
        );
        assert!(tokenize("  ... ").is_empty());
    }

    #[test]
    fn test_query_ranks_matching_chunks() {
        let mut idx = KeywordIndex::new();
        idx.upsert(id("/a.md", 0), "rust ownership and borrowing");
        idx.upsert(id("/b.md", 0), "meeting notes about the budget");
        idx.upsert(id("/c.md", 0), "notes on gardening");

        let hits = idx.query(&terms("meeting notes"), 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, id("/b.md", 0));
        assert!(hits[0].1 > hits[1].1);
        assert!(hits.iter().all(|(_, s)| *s > 0.0));
    }

    #[test]
    fn test_term_frequency_saturates() {
        let mut idx = KeywordIndex::new();
        idx.upsert(id("/a.md", 0), "apple");
        idx.upsert(id("/b.md", 0), "apple apple apple apple apple apple apple apple");
        idx.upsert(id("/c.md", 0), "banana");
        let hits = idx.query(&terms("apple"), 10);
        let ratio = hits[0].1 / hits[1].1;
        assert!(ratio < K1 + 1.0, "tf contribution must stay below k1 + 1, got {ratio}");
    }

    #[test]
    fn test_ties_broken_by_chunk_id() {
        let mut idx = KeywordIndex::new();
        idx.upsert(id("/z.md", 0), "same words here");
        idx.upsert(id("/a.md", 1), "same words here");
        idx.upsert(id("/a.md", 0), "same words here");
        let hits = idx.query(&terms("words"), 10);
        let order: Vec<_> = hits.iter().map(|(c, _)| c.clone()).collect();
        assert_eq!(order, vec![id("/a.md", 0), id("/a.md", 1), id("/z.md", 0)]);
    }

    #[test]
    fn test_remove_and_upsert_replace() {
        let mut idx = KeywordIndex::new();
        idx.upsert(id("/a.md", 0), "alpha beta");
        idx.upsert(id("/b.md", 0), "gamma");
        assert!(idx.remove(&id("/a.md", 0)));
        assert!(!idx.remove(&id("/a.md", 0)));
        assert!(idx.query(&terms("alpha"), 5).is_empty());

        idx.upsert(id("/b.md", 0), "delta");
        assert_eq!(idx.len(), 1);
        assert!(idx.query(&terms("gamma"), 5).is_empty());
        assert_eq!(idx.query(&terms("delta"), 5).len(), 1);
    }

    #[test]
    fn test_k_limits_results() {
        let mut idx = KeywordIndex::new();
        for i in 0..10 {
            idx.upsert(id("/a.md", i), "common term");
        }
        assert_eq!(idx.query(&terms("common"), 3).len(), 3);
        assert!(idx.query(&terms("common"), 0).is_empty());
    }
}
