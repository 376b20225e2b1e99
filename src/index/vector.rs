//! Exact-search vector index with slot reuse.
//!
//! Entries live in a slot vector; removed slots go on a free list and are
//! handed out again by later inserts, so a long-running watcher does not grow
//! the slot table without bound. Queries are a brute-force cosine scan, which
//! is fine for a personal note corpus.

use std::collections::HashMap;

use crate::embedding::cosine_similarity;
use crate::error::{Result, WeavrError};
use crate::models::ChunkId;

#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    pub chunk_id: ChunkId,
    pub embedding: Vec<f32>,
    pub slot: usize,
}

#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    dims: Option<usize>,
    slots: Vec<Option<VectorEntry>>,
    free: Vec<usize>,
    by_id: HashMap<ChunkId, usize>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dimension fixed by the first insert, if any.
    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, id: &ChunkId) -> Option<&VectorEntry> {
        self.by_id
            .get(id)
            .and_then(|slot| self.slots.get(*slot))
            .and_then(Option::as_ref)
    }

    pub fn entries(&self) -> impl Iterator<Item = &VectorEntry> {
        self.slots.iter().flatten()
    }

    /// Insert or replace the vector for `id`, returning its slot.
    pub fn upsert(&mut self, id: ChunkId, embedding: Vec<f32>) -> Result<usize> {
        match self.dims {
            Some(d) if d != embedding.len() => {
                return Err(WeavrError::IndexInconsistency(format!(
                    "embedding for {id} has {} dimensions, index uses {d}",
                    embedding.len()
                )));
            }
            None if embedding.is_empty() => {
                return Err(WeavrError::IndexInconsistency(format!(
                    "embedding for {id} is empty"
                )));
            }
            _ => {}
        }
        self.dims = Some(embedding.len());

        if let Some(&slot) = self.by_id.get(&id) {
            if let Some(entry) = self.slots[slot].as_mut() {
                entry.embedding = embedding;
                return Ok(slot);
            }
        }

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[slot] = Some(VectorEntry {
            chunk_id: id.clone(),
            embedding,
            slot,
        });
        self.by_id.insert(id, slot);
        Ok(slot)
    }

    /// Remove the vector for `id`. Returns whether it was present.
    pub fn remove(&mut self, id: &ChunkId) -> bool {
        let Some(slot) = self.by_id.remove(id) else {
            return false;
        };
        self.slots[slot] = None;
        self.free.push(slot);
        if self.by_id.is_empty() {
            // An empty index may switch to a different embedding model.
            self.dims = None;
            self.slots.clear();
            self.free.clear();
        }
        true
    }

    /// Top `k` entries by cosine similarity, descending, ties by chunk id.
    pub fn query(&self, vector: &[f32], k: usize) -> Vec<(ChunkId, f32)> {
        if k == 0 || self.dims != Some(vector.len()) {
            return Vec::new();
        }
        let mut scored: Vec<(ChunkId, f32)> = self
            .entries()
            .map(|e| (e.chunk_id.clone(), cosine_similarity(vector, &e.embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }
}
