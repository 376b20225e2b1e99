//! Index snapshot: both indices plus the knowledge base state, as one value.
//!
//! An [`IndexSnapshot`] is never mutated while readers can see it. Index
//! passes clone the live snapshot, apply their changes to the copy, call
//! [`IndexSnapshot::verify`], and only then publish the copy (see
//! [`crate::ingest::KnowledgeBase`]).
//!
//! | Piece | Contents |
//! |-------|----------|
//! | `state` | root, last index time, file limit, document records |
//! | chunks | every live [`Chunk`], keyed by [`ChunkId`] |
//! | bodies | full text per document, for whole-document expansion |
//! | [`VectorIndex`] | one embedding per live chunk |
//! | [`KeywordIndex`] | one posting set per live chunk |

pub mod keyword;
pub mod vector;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use keyword::KeywordIndex;
pub use vector::VectorIndex;

use crate::error::{Result, WeavrError};
use crate::models::{Chunk, ChunkId, Document, DocumentId, KnowledgeBaseState};

#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    pub state: KnowledgeBaseState,
    /// Embedding model the vectors were produced with.
    pub embedding_model: Option<String>,
    chunks: BTreeMap<ChunkId, Chunk>,
    doc_chunks: BTreeMap<DocumentId, Vec<ChunkId>>,
    bodies: BTreeMap<DocumentId, Arc<str>>,
    vectors: VectorIndex,
    keywords: KeywordIndex,
}

impl IndexSnapshot {
    pub fn new(state: KnowledgeBaseState) -> Self {
        Self {
            state,
            ..Default::default()
        }
    }

    pub fn chunk(&self, id: &ChunkId) -> Option<&Chunk> {
        self.chunks.get(id)
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn document_count(&self) -> usize {
        self.state.documents.len()
    }

    /// Chunks of one document, in sequence order.
    pub fn chunks_of(&self, doc: &DocumentId) -> Vec<&Chunk> {
        self.doc_chunks
            .get(doc)
            .map(|ids| ids.iter().filter_map(|id| self.chunks.get(id)).collect())
            .unwrap_or_default()
    }

    /// Full text of a document as it was indexed.
    pub fn document_text(&self, doc: &DocumentId) -> Option<&str> {
        self.bodies.get(doc).map(|b| b.as_ref())
    }

    pub fn vectors(&self) -> &VectorIndex {
        &self.vectors
    }

    pub fn keywords(&self) -> &KeywordIndex {
        &self.keywords
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Replace everything known about a document.
    ///
    /// `embeddings[i]` belongs to `chunks[i]`. On error the snapshot may be
    /// partially updated; callers work on a private copy and discard it.
    pub fn replace_document(
        &mut self,
        document: Document,
        body: &str,
        chunks: Vec<Chunk>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<()> {
        if chunks.len() != embeddings.len() {
            return Err(WeavrError::IndexInconsistency(format!(
                "{}: {} chunks but {} embeddings",
                document.id,
                chunks.len(),
                embeddings.len()
            )));
        }

        let doc_id = document.id.clone();
        self.remove_document(&doc_id);

        let mut ids = Vec::with_capacity(chunks.len());
        for (chunk, embedding) in chunks.into_iter().zip(embeddings) {
            if chunk.id.document != doc_id {
                return Err(WeavrError::IndexInconsistency(format!(
                    "chunk {} does not belong to {doc_id}",
                    chunk.id
                )));
            }
            self.vectors.upsert(chunk.id.clone(), embedding)?;
            self.keywords.upsert(chunk.id.clone(), &chunk.text);
            ids.push(chunk.id.clone());
            self.chunks.insert(chunk.id.clone(), chunk);
        }

        self.doc_chunks.insert(doc_id.clone(), ids);
        self.bodies.insert(doc_id.clone(), Arc::from(body));
        self.state.documents.insert(doc_id, document);
        Ok(())
    }

    /// Update a document record whose content is unchanged.
    pub fn touch_document(&mut self, document: Document) {
        self.state.documents.insert(document.id.clone(), document);
    }

    /// Tombstone a document: its record, body, chunks and index entries.
    pub fn remove_document(&mut self, doc: &DocumentId) -> bool {
        let had_record = self.state.documents.remove(doc).is_some();
        self.bodies.remove(doc);
        let ids = self.doc_chunks.remove(doc).unwrap_or_default();
        for id in &ids {
            self.chunks.remove(id);
            self.vectors.remove(id);
            self.keywords.remove(id);
        }
        had_record || !ids.is_empty()
    }

    /// Drop every document and index entry, keeping root and file limit.
    pub fn clear(&mut self) {
        self.state.reset();
        self.embedding_model = None;
        self.chunks.clear();
        self.doc_chunks.clear();
        self.bodies.clear();
        self.vectors = VectorIndex::new();
        self.keywords = KeywordIndex::new();
    }

    /// Prove that both indices describe exactly the live chunk set.
    pub fn verify(&self) -> Result<()> {
        let fail = |msg: String| Err(WeavrError::IndexInconsistency(msg));

        if self.vectors.len() != self.chunks.len() {
            return fail(format!(
                "{} chunks but {} vector entries",
                self.chunks.len(),
                self.vectors.len()
            ));
        }
        if self.keywords.len() != self.chunks.len() {
            return fail(format!(
                "{} chunks but {} keyword entries",
                self.chunks.len(),
                self.keywords.len()
            ));
        }

        let mut listed = 0;
        for (doc, ids) in &self.doc_chunks {
            if !self.state.documents.contains_key(doc) {
                return fail(format!("chunks listed for unknown document {doc}"));
            }
            for id in ids {
                if &id.document != doc {
                    return fail(format!("chunk {id} listed under {doc}"));
                }
                if !self.chunks.contains_key(id) {
                    return fail(format!("missing chunk {id}"));
                }
                if !self.vectors.contains(id) {
                    return fail(format!("chunk {id} has no vector entry"));
                }
                if !self.keywords.contains(id) {
                    return fail(format!("chunk {id} has no keyword entry"));
                }
            }
            listed += ids.len();
        }
        if listed != self.chunks.len() {
            return fail(format!(
                "{} chunks stored but {listed} listed under documents",
                self.chunks.len()
            ));
        }

        for doc in self.state.documents.keys() {
            if !self.bodies.contains_key(doc) {
                return fail(format!("document {doc} has no body"));
            }
        }
        if self.bodies.len() != self.state.documents.len() {
            return fail("bodies kept for removed documents".to_string());
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn keywords_mut(&mut self) -> &mut KeywordIndex {
        &mut self.keywords
    }
}
