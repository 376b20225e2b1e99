//! Hybrid retrieval: vector + BM25 fusion with adaptive granularity.
//!
//! # Pipeline
//!
//! 1. Analyse the query: tokens, terms, summarize intent, broad or specific.
//! 2. Run the keyword query on the blocking pool while the query is embedded
//!    and the vector query runs, both against the same [`IndexSnapshot`].
//! 3. Min-max normalise each candidate list to `[0, 1]` and merge by chunk id,
//!    keeping the **maximum** of the two normalised scores.
//! 4. Choose granularity:
//!
//! | Condition | Result |
//! |-----------|--------|
//! | no candidates | [`Granularity::NoRelevantKnowledge`] |
//! | broad query | top chunks expanded to whole documents, one per document |
//! | specific query | top chunks |
//!
//! Ordering is always score descending, then chunk id ascending, so equal
//! inputs produce equal outputs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::Result;
use crate::index::keyword::tokenize;
use crate::index::IndexSnapshot;
use crate::models::{ChunkId, DocumentId};

/// Rendered in place of a context when nothing relevant was found.
pub const NO_RELEVANT_KNOWLEDGE: &str = "No relevant knowledge found in the knowledge base.";

/// A query with its derived features.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub text: String,
    pub terms: Vec<String>,
    pub token_count: usize,
    pub summarize: bool,
    pub broad: bool,
}

impl Query {
    pub fn analyze(text: &str, config: &RetrievalConfig) -> Self {
        let terms = tokenize(text);
        let lower = text.to_lowercase();
        let summarize = config.summarize_cues.iter().any(|cue| {
            let cue = cue.to_lowercase();
            if cue.chars().all(char::is_alphanumeric) {
                terms.iter().any(|t| *t == cue)
            } else {
                lower.contains(&cue)
            }
        });
        let token_count = terms.len();
        Self {
            text: text.trim().to_string(),
            broad: summarize || token_count < config.broad_token_threshold,
            terms,
            token_count,
            summarize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    NoRelevantKnowledge,
    WholeDocuments,
    TopChunks,
}

/// One piece of retrieved text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub document: DocumentId,
    /// Set for chunk passages; `None` when the whole document is returned.
    pub chunk: Option<ChunkId>,
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub granularity: Granularity,
    pub passages: Vec<Passage>,
}

impl RetrievalResult {
    pub fn none() -> Self {
        Self {
            granularity: Granularity::NoRelevantKnowledge,
            passages: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Context block for the model prompt.
    pub fn context(&self) -> String {
        if self.granularity == Granularity::NoRelevantKnowledge || self.passages.is_empty() {
            return NO_RELEVANT_KNOWLEDGE.to_string();
        }
        self.passages
            .iter()
            .map(|p| format!("## {}\n{}", p.document.file_name(), p.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

pub struct HybridRetriever {
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(config: RetrievalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub async fn retrieve(
        &self,
        snapshot: Arc<IndexSnapshot>,
        text: &str,
        embedder: &dyn EmbeddingProvider,
    ) -> Result<RetrievalResult> {
        let query = Query::analyze(text, &self.config);
        if query.text.is_empty() || snapshot.is_empty() {
            return Ok(RetrievalResult::none());
        }

        let k = self.config.candidate_k;
        let kw_snapshot = snapshot.clone();
        let terms = query.terms.clone();
        let keyword_task =
            tokio::task::spawn_blocking(move || kw_snapshot.keywords().query(&terms, k));

        let vector_search = async {
            let vector = embed_query(embedder, &query.text).await?;
            let vec_snapshot = snapshot.clone();
            tokio::task::spawn_blocking(move || vec_snapshot.vectors().query(&vector, k))
                .await
                .map_err(|e| anyhow::anyhow!("vector query task failed: {e}"))
        };

        let (keyword_hits, vector_hits) = tokio::join!(keyword_task, vector_search);
        let keyword_hits =
            keyword_hits.map_err(|e| anyhow::anyhow!("keyword query task failed: {e}"))?;
        let vector_hits = match vector_hits {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "vector search unavailable; using keyword results only");
                Vec::new()
            }
        };

        let vector_hits: Vec<(ChunkId, f32)> = vector_hits
            .into_iter()
            .filter(|(_, score)| *score > self.config.min_vector_score)
            .collect();

        let merged = fuse(&vector_hits, &keyword_hits);
        debug!(
            vector = vector_hits.len(),
            keyword = keyword_hits.len(),
            merged = merged.len(),
            broad = query.broad,
            "retrieval candidates"
        );

        Ok(select(&snapshot, &query, merged, self.config.top_n))
    }
}

/// Min-max normalise each list and merge by chunk id, keeping the maximum.
///
/// Each chunk id appears once in the output, ordered by score descending,
/// then chunk id ascending.
pub fn fuse(vector: &[(ChunkId, f32)], keyword: &[(ChunkId, f64)]) -> Vec<(ChunkId, f64)> {
    let vector: Vec<(ChunkId, f64)> = vector
        .iter()
        .map(|(id, s)| (id.clone(), f64::from(*s)))
        .collect();

    let mut merged: HashMap<ChunkId, f64> = HashMap::new();
    for (id, score) in normalize_scores(&vector)
        .into_iter()
        .chain(normalize_scores(keyword))
    {
        merged
            .entry(id)
            .and_modify(|s| *s = s.max(score))
            .or_insert(score);
    }

    let mut ranked: Vec<(ChunkId, f64)> = merged.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

fn normalize_scores(candidates: &[(ChunkId, f64)]) -> Vec<(ChunkId, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates.iter().map(|c| c.1).fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.1)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|(id, score)| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (score - s_min) / (s_max - s_min)
            };
            (id.clone(), norm)
        })
        .collect()
}

fn select(
    snapshot: &IndexSnapshot,
    query: &Query,
    merged: Vec<(ChunkId, f64)>,
    top_n: usize,
) -> RetrievalResult {
    let top: Vec<(ChunkId, f64)> = merged
        .into_iter()
        .filter(|(id, _)| snapshot.chunk(id).is_some())
        .take(top_n)
        .collect();
    if top.is_empty() {
        return RetrievalResult::none();
    }

    if query.broad {
        let mut seen: HashSet<DocumentId> = HashSet::new();
        let mut passages = Vec::new();
        for (id, score) in top {
            let doc = id.document.clone();
            if !seen.insert(doc.clone()) {
                continue;
            }
            if let Some(text) = snapshot.document_text(&doc) {
                passages.push(Passage {
                    document: doc,
                    chunk: None,
                    text: text.to_string(),
                    score,
                });
            }
        }
        return RetrievalResult {
            granularity: Granularity::WholeDocuments,
            passages,
        };
    }

    let passages = top
        .into_iter()
        .filter_map(|(id, score)| {
            snapshot.chunk(&id).map(|chunk| Passage {
                document: id.document.clone(),
                text: chunk.text.clone(),
                chunk: Some(id),
                score,
            })
        })
        .collect();
    RetrievalResult {
        granularity: Granularity::TopChunks,
        passages,
    }
}
