//! Core data models used throughout Weavr.
//!
//! These types represent the documents, chunks, and knowledge base state that
//! flow through the indexing and retrieval pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Identity of a document: its absolute path inside the knowledge base root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DocumentId(PathBuf);

impl DocumentId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// File name for display, falling back to the full path.
    pub fn file_name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.0.display().to_string())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Identity of a chunk: parent document plus sequence index.
///
/// Ordering is by document path, then sequence. Retrieval uses this ordering
/// to break score ties.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ChunkId {
    pub document: DocumentId,
    pub seq: u32,
}

impl ChunkId {
    pub fn new(document: DocumentId, seq: u32) -> Self {
        Self { document, seq }
    }

    /// Parse the `path#seq` form produced by [`Display`](fmt::Display).
    pub fn parse(s: &str) -> Option<Self> {
        let (path, seq) = s.rsplit_once('#')?;
        let seq = seq.parse().ok()?;
        Some(Self::new(DocumentId::new(path), seq))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.document, self.seq)
    }
}

/// A tracked Markdown document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: DocumentId,
    /// SHA-256 of the file content (hex).
    pub content_hash: String,
    pub modified_at: DateTime<Utc>,
    pub size: u64,
    pub indexed_at: DateTime<Utc>,
}

/// A chunk of a document's text, the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub text: String,
    /// Approximate token count (4 chars ≈ 1 token).
    pub token_estimate: usize,
    /// True when the chunk starts with the tail of the previous chunk.
    pub overlaps_previous: bool,
    /// SHA-256 of `text` (hex).
    pub hash: String,
}

impl Chunk {
    pub fn document(&self) -> &DocumentId {
        &self.id.document
    }
}

/// State of the knowledge base as of the last completed index pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnowledgeBaseState {
    pub root: Option<PathBuf>,
    pub last_index_time: Option<DateTime<Utc>>,
    pub file_limit: usize,
    pub documents: BTreeMap<DocumentId, Document>,
    /// Recognised documents left out because of the file limit.
    pub excluded: Vec<DocumentId>,
}

impl KnowledgeBaseState {
    pub fn new(root: Option<PathBuf>, file_limit: usize) -> Self {
        Self {
            root,
            file_limit,
            ..Default::default()
        }
    }

    /// A fresh state with the same root and limit.
    pub fn clone_settings(&self) -> Self {
        Self::new(self.root.clone(), self.file_limit)
    }

    /// Forget everything learned from the corpus, keeping root and limit.
    pub fn reset(&mut self) {
        self.last_index_time = None;
        self.documents.clear();
        self.excluded.clear();
    }
}
