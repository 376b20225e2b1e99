//! Index pass orchestration with snapshot swap.
//!
//! [`KnowledgeBase`] owns the live [`IndexSnapshot`] and is the only writer.
//! A pass runs scan → prioritise → chunk → embed → index against a private
//! working copy, verifies it, and publishes it by swapping one `Arc`:
//!
//! ```text
//! writer lock ─▶ clone live ─▶ mutate copy ─▶ verify ─▶ swap Arc ─▶ persist
//! ```
//!
//! Readers call [`KnowledgeBase::snapshot`] and keep their `Arc` for the whole
//! query, so they see either the previous pass or the new one, never a mix.
//! A failed verification leaves the previous snapshot live.
//!
//! Documents whose content hash is unchanged are only re-stamped; they are
//! never re-chunked or re-embedded. A document that fails to read, decode or
//! embed is dropped from the pass with a warning and retried on the next one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chunk::chunk_document;
use crate::config::ChunkingConfig;
use crate::embedding::{embed_texts, EmbeddingProvider};
use crate::error::{Result, WeavrError};
use crate::index::IndexSnapshot;
use crate::models::{Document, DocumentId, KnowledgeBaseState};
use crate::path_guard;
use crate::store::Store;
use crate::watcher::{scan, ScanOptions, ScannedFile};

/// What a pass looks at.
#[derive(Debug, Clone, PartialEq)]
pub enum PassMode {
    /// Documents modified since the last pass, plus any not yet indexed.
    Incremental,
    /// Every document is re-hashed; unchanged content is still not re-embedded.
    Full,
    /// Like `Incremental`, and these paths are re-checked regardless of mtime.
    Paths(Vec<PathBuf>),
}

/// Counters for one completed pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexReport {
    /// Recognised documents found under the root.
    pub scanned: usize,
    /// Documents (re-)chunked and embedded.
    pub indexed: usize,
    /// Documents checked whose content hash matched.
    pub unchanged: usize,
    /// Documents tombstoned (deleted, or pushed out by the file limit).
    pub removed: usize,
    pub failed: usize,
    /// Documents left out by the file limit.
    pub excluded: usize,
    /// Live chunks after the pass.
    pub chunks: usize,
    pub duration_ms: u64,
}

/// Tuning for index passes.
#[derive(Debug, Clone)]
pub struct IndexerOptions {
    pub chunking: ChunkingConfig,
    pub scan: ScanOptions,
    pub batch_size: usize,
}

pub struct KnowledgeBase {
    live: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<()>,
    embedder: Arc<dyn EmbeddingProvider>,
    options: IndexerOptions,
    store: Option<Store>,
    /// The store holds exactly the live snapshot, so commits may write deltas.
    store_synced: AtomicBool,
}

impl KnowledgeBase {
    pub fn new(
        snapshot: IndexSnapshot,
        embedder: Arc<dyn EmbeddingProvider>,
        options: IndexerOptions,
    ) -> Self {
        Self {
            live: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
            embedder,
            options,
            store: None,
            store_synced: AtomicBool::new(false),
        }
    }

    /// Persist every published snapshot to `store`.
    ///
    /// `synced` says the store already holds the initial snapshot, as when
    /// it was loaded from there intact. Otherwise the first commit rewrites
    /// the whole cache; later commits write only the documents they change.
    pub fn with_store(mut self, store: Store, synced: bool) -> Self {
        self.store = Some(store);
        self.store_synced = AtomicBool::new(synced);
        self
    }

    pub fn store(&self) -> Option<&Store> {
        self.store.as_ref()
    }

    /// The snapshot readers should use. Cheap; never blocks on a pass.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.live
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn scan_options(&self) -> &ScanOptions {
        &self.options.scan
    }

    /// Run one index pass over the current root.
    pub async fn index_pass(&self, mode: PassMode) -> Result<IndexReport> {
        let _guard = self.writer.lock().await;
        let mut working = (*self.snapshot()).clone();
        let report = self.run_pass(&mut working, mode).await?;
        self.commit(working).await?;
        Ok(report)
    }

    /// Switch to a new root: forget everything and index it from scratch.
    pub async fn set_root(&self, root: &Path) -> Result<IndexReport> {
        path_guard::validate(root, false)?;
        let _guard = self.writer.lock().await;
        let file_limit = self.snapshot().state.file_limit;
        let mut working =
            IndexSnapshot::new(KnowledgeBaseState::new(Some(root.to_path_buf()), file_limit));
        let report = self.run_pass(&mut working, PassMode::Full).await?;
        self.commit(working).await?;
        Ok(report)
    }

    /// Change the file limit and re-apply it. Without a root only the limit
    /// is recorded.
    pub async fn set_file_limit(&self, limit: usize) -> Result<IndexReport> {
        if limit == 0 {
            return Err(WeavrError::InvalidCommand(
                "file limit must be a positive integer".to_string(),
            ));
        }
        let _guard = self.writer.lock().await;
        let mut working = (*self.snapshot()).clone();
        working.state.file_limit = limit;
        let report = if working.state.root.is_some() {
            self.run_pass(&mut working, PassMode::Incremental).await?
        } else {
            IndexReport::default()
        };
        self.commit(working).await?;
        Ok(report)
    }

    /// Drop all documents and index entries; root and file limit stay.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.writer.lock().await;
        let mut working = (*self.snapshot()).clone();
        working.clear();
        self.commit(working).await
    }

    /// Verify and publish a working copy. Caller holds the writer lock.
    async fn commit(&self, working: IndexSnapshot) -> Result<()> {
        if let Err(e) = working.verify() {
            warn!(error = %e, "index pass produced an inconsistent snapshot; keeping previous");
            return Err(e);
        }
        let published = Arc::new(working);
        let previous = {
            let mut live = self
                .live
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *live, published.clone())
        };
        if let Some(store) = &self.store {
            let saved = if self.store_synced.load(Ordering::SeqCst) {
                store.save_changes(&previous, &published).await.map(|_| ())
            } else {
                store.save_snapshot(&published).await
            };
            match saved {
                Ok(()) => self.store_synced.store(true, Ordering::SeqCst),
                Err(e) => {
                    warn!(error = %e, "failed to persist index snapshot");
                    self.store_synced.store(false, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }

    async fn run_pass(&self, working: &mut IndexSnapshot, mode: PassMode) -> Result<IndexReport> {
        let started_at = Utc::now();
        let timer = Instant::now();
        let root = working.state.root.clone().ok_or(WeavrError::NoRoot)?;

        let since = match mode {
            PassMode::Full => None,
            _ => working.state.last_index_time,
        };
        let scan_root = root.clone();
        let scan_options = self.options.scan.clone();
        let outcome = tokio::task::spawn_blocking(move || scan(&scan_root, since, &scan_options))
            .await
            .map_err(|e| anyhow::anyhow!("scan task failed: {e}"))??;

        let mut report = IndexReport {
            scanned: outcome.present.len(),
            ..Default::default()
        };

        let (selected, excluded) = prioritize(&root, outcome.present, working.state.file_limit);
        report.excluded = excluded.len();

        // Tombstone whatever is no longer selected.
        let keep: HashSet<DocumentId> = selected.iter().map(|f| DocumentId::new(&f.path)).collect();
        let stale: Vec<DocumentId> = working
            .state
            .documents
            .keys()
            .filter(|id| !keep.contains(*id))
            .cloned()
            .collect();
        for id in &stale {
            working.remove_document(id);
            debug!(document = %id, "removed");
        }
        report.removed = stale.len();

        let changed: HashSet<PathBuf> = outcome.changed.into_iter().collect();
        let hinted: HashSet<PathBuf> = match &mode {
            PassMode::Paths(paths) => paths.iter().cloned().collect(),
            _ => HashSet::new(),
        };

        for file in selected {
            let id = DocumentId::new(&file.path);
            let known = working.state.documents.contains_key(&id);
            if known && !changed.contains(&file.path) && !hinted.contains(&file.path) {
                continue;
            }
            match self.index_document(working, &root, &file, started_at).await {
                Ok(DocOutcome::Indexed) => report.indexed += 1,
                Ok(DocOutcome::Unchanged) => report.unchanged += 1,
                Err(e) if matches!(e, WeavrError::IndexInconsistency(_)) => return Err(e),
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "skipping document");
                    working.remove_document(&id);
                    report.failed += 1;
                }
            }
        }

        working.state.excluded = excluded;
        working.state.last_index_time = Some(started_at);
        working.embedding_model = Some(self.embedder.model_name().to_string());

        report.chunks = working.chunk_count();
        report.duration_ms = timer.elapsed().as_millis() as u64;
        info!(
            root = %root.display(),
            scanned = report.scanned,
            indexed = report.indexed,
            unchanged = report.unchanged,
            removed = report.removed,
            failed = report.failed,
            excluded = report.excluded,
            chunks = report.chunks,
            "index pass complete"
        );
        Ok(report)
    }

    async fn index_document(
        &self,
        working: &mut IndexSnapshot,
        root: &Path,
        file: &ScannedFile,
        now: DateTime<Utc>,
    ) -> Result<DocOutcome> {
        path_guard::validate_document(root, &file.path)?;
        let bytes = tokio::fs::read(&file.path).await?;
        let content_hash = format!("{:x}", Sha256::digest(&bytes));
        let id = DocumentId::new(&file.path);

        if let Some(existing) = working.state.documents.get(&id) {
            if existing.content_hash == content_hash {
                let mut touched = existing.clone();
                touched.modified_at = file.modified_at;
                touched.size = file.size;
                working.touch_document(touched);
                return Ok(DocOutcome::Unchanged);
            }
        }

        let text = String::from_utf8(bytes)
            .map_err(|_| anyhow::anyhow!("document is not valid UTF-8"))?;
        let chunks = chunk_document(&id, &text, &self.options.chunking);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = embed_texts(self.embedder.as_ref(), &texts, self.options.batch_size).await?;

        let document = Document {
            id,
            content_hash,
            modified_at: file.modified_at,
            size: file.size,
            indexed_at: now,
        };
        debug!(document = %document.id, chunks = chunks.len(), "indexed");
        working.replace_document(document, &text, chunks, embeddings)?;
        Ok(DocOutcome::Indexed)
    }
}

enum DocOutcome {
    Indexed,
    Unchanged,
}

/// Choose which documents fit under `limit`.
///
/// Returns the selected files (path order) and the excluded ids.
pub fn prioritize(
    root: &Path,
    files: Vec<ScannedFile>,
    limit: usize,
) -> (Vec<ScannedFile>, Vec<DocumentId>) {
    if files.len() <= limit {
        return (files, Vec::new());
    }

    let mut ranked: Vec<(f64, ScannedFile)> = files
        .into_iter()
        .map(|f| (priority_score(root, &f), f))
        .collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.path.cmp(&b.1.path)));

    let excluded_files = ranked.split_off(limit);
    let mut selected: Vec<ScannedFile> = ranked.into_iter().map(|(_, f)| f).collect();
    selected.sort_by(|a, b| a.path.cmp(&b.path));
    let mut excluded: Vec<DocumentId> = excluded_files
        .into_iter()
        .map(|(_, f)| DocumentId::new(f.path))
        .collect();
    excluded.sort();
    (selected, excluded)
}

const DEPRIORITIZED: &[&str] = &["legacy", "retired", "ignore", "archive"];
const PRIORITIZED: &[&str] = &["important", "key", "main", "index"];

/// Higher is more important: shallow, recently modified, and named like a
/// primary note rather than an archive.
pub fn priority_score(root: &Path, file: &ScannedFile) -> f64 {
    let relative = file.path.strip_prefix(root).unwrap_or(&file.path);
    let depth = relative.components().count().saturating_sub(1);
    let name = relative.to_string_lossy().to_lowercase();

    let mut score = 1000.0 - 50.0 * depth as f64;
    if DEPRIORITIZED.iter().any(|w| name.contains(w)) {
        score -= 500.0;
    }
    if PRIORITIZED.iter().any(|w| name.contains(w)) {
        score += 200.0;
    }
    let days = file.modified_at.timestamp() as f64 / 86_400.0;
    score + 0.1 * days
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::models::ChunkId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingEmbedder {
        inner: HashEmbedder,
        embedded: AtomicUsize,
        fail_on: Option<String>,
    }

    impl CountingEmbedder {
        fn new() -> Self {
            Self {
                inner: HashEmbedder::new(32),
                embedded: AtomicUsize::new(0),
                fail_on: None,
            }
        }
        fn count(&self) -> usize {
            self.embedded.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            if let Some(marker) = &self.fail_on {
                if texts.iter().any(|t| t.contains(marker.as_str())) {
                    anyhow::bail!("embedding service unavailable");
                }
            }
            self.embedded.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed(texts).await
        }
    }

    fn options() -> IndexerOptions {
        IndexerOptions {
            chunking: ChunkingConfig::default(),
            scan: ScanOptions::new(&["md".into()], &[]).unwrap(),
            batch_size: 8,
        }
    }

    fn kb_with(root: &Path, limit: usize, embedder: Arc<CountingEmbedder>) -> KnowledgeBase {
        let state = KnowledgeBaseState::new(Some(root.to_path_buf()), limit);
        KnowledgeBase::new(IndexSnapshot::new(state), embedder, options())
    }

    fn write(root: &Path, rel: &str, content: &str) -> PathBuf {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_unchanged_corpus_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.md", "# Alpha\n\nfirst note");
        write(tmp.path(), "b.md", "# Beta\n\nsecond note");
        let embedder = Arc::new(CountingEmbedder::new());
        let kb = kb_with(tmp.path(), 100, embedder.clone());

        let first = kb.index_pass(PassMode::Incremental).await.unwrap();
        assert_eq!(first.indexed, 2);
        let embedded = embedder.count();
        let before = kb.snapshot();

        let second = kb.index_pass(PassMode::Incremental).await.unwrap();
        assert_eq!(second.indexed, 0);
        assert_eq!(embedder.count(), embedded);

        let full = kb.index_pass(PassMode::Full).await.unwrap();
        assert_eq!(full.indexed, 0);
        assert_eq!(full.unchanged, 2);
        assert_eq!(embedder.count(), embedded);

        let after = kb.snapshot();
        let chunks_before: Vec<_> = before.chunks().cloned().collect();
        let chunks_after: Vec<_> = after.chunks().cloned().collect();
        assert_eq!(chunks_before, chunks_after);
    }

    #[tokio::test]
    async fn test_only_modified_document_is_reembedded() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.md", "alpha note");
        let b = write(tmp.path(), "b.md", "beta note");
        let embedder = Arc::new(CountingEmbedder::new());
        let kb = kb_with(tmp.path(), 100, embedder.clone());
        kb.index_pass(PassMode::Incremental).await.unwrap();
        let embedded = embedder.count();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        std::fs::write(&b, "beta note, revised").unwrap();

        let report = kb.index_pass(PassMode::Incremental).await.unwrap();
        assert_eq!(report.indexed, 1);
        assert_eq!(embedder.count(), embedded + 1);
        let snap = kb.snapshot();
        let chunk = snap.chunk(&ChunkId::new(DocumentId::new(&b), 0)).unwrap();
        assert_eq!(chunk.text, "beta note, revised");
    }

    #[tokio::test]
    async fn test_hinted_path_rechecked_regardless_of_mtime() {
        let tmp = TempDir::new().unwrap();
        let a = write(tmp.path(), "a.md", "alpha");
        let embedder = Arc::new(CountingEmbedder::new());
        let kb = kb_with(tmp.path(), 100, embedder.clone());
        kb.index_pass(PassMode::Incremental).await.unwrap();

        let report = kb.index_pass(PassMode::Paths(vec![a])).await.unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.indexed, 0);
    }

    #[tokio::test]
    async fn test_deleted_document_is_tombstoned() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.md", "alpha");
        let b = write(tmp.path(), "b.md", "beta");
        let kb = kb_with(tmp.path(), 100, Arc::new(CountingEmbedder::new()));
        kb.index_pass(PassMode::Incremental).await.unwrap();

        std::fs::remove_file(&b).unwrap();
        let report = kb.index_pass(PassMode::Incremental).await.unwrap();
        assert_eq!(report.removed, 1);
        let snap = kb.snapshot();
        assert_eq!(snap.document_count(), 1);
        assert!(snap.keywords().query(&["beta".into()], 5).is_empty());
        snap.verify().unwrap();
    }

    #[tokio::test]
    async fn test_file_limit_prefers_primary_notes() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "index.md", "home");
        write(tmp.path(), "ideas.md", "ideas");
        write(tmp.path(), "archive/old.md", "old");
        let kb = kb_with(tmp.path(), 2, Arc::new(CountingEmbedder::new()));

        let report = kb.index_pass(PassMode::Incremental).await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.excluded, 1);
        let snap = kb.snapshot();
        assert_eq!(
            snap.state.excluded,
            vec![DocumentId::new(tmp.path().join("archive/old.md"))]
        );

        let report = kb.set_file_limit(3).await.unwrap();
        assert_eq!(report.indexed, 1);
        assert!(kb.snapshot().state.excluded.is_empty());

        let report = kb.set_file_limit(1).await.unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(kb.snapshot().document_count(), 1);
        assert!(kb.set_file_limit(0).await.is_err());
    }

    #[tokio::test]
    async fn test_embedding_failure_is_isolated() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "good.md", "fine content");
        write(tmp.path(), "bad.md", "POISON content");
        let embedder = Arc::new(CountingEmbedder {
            fail_on: Some("POISON".into()),
            ..CountingEmbedder::new()
        });
        let kb = kb_with(tmp.path(), 100, embedder);

        let report = kb.index_pass(PassMode::Incremental).await.unwrap();
        assert_eq!(report.indexed, 1);
        assert_eq!(report.failed, 1);
        let snap = kb.snapshot();
        assert_eq!(snap.document_count(), 1);
        snap.verify().unwrap();
    }

    #[tokio::test]
    async fn test_inconsistent_snapshot_is_not_swapped() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.md", "alpha");
        let kb = kb_with(tmp.path(), 100, Arc::new(CountingEmbedder::new()));
        kb.index_pass(PassMode::Incremental).await.unwrap();
        let before = kb.snapshot();

        let mut broken = (*before).clone();
        broken
            .keywords_mut()
            .remove(&ChunkId::new(DocumentId::new(tmp.path().join("a.md")), 0));
        let err = kb.commit(broken).await.unwrap_err();
        assert!(matches!(err, WeavrError::IndexInconsistency(_)));
        assert!(Arc::ptr_eq(&before, &kb.snapshot()));
    }

    #[tokio::test]
    async fn test_reader_keeps_its_snapshot_across_a_pass() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.md", "alpha");
        let kb = kb_with(tmp.path(), 100, Arc::new(CountingEmbedder::new()));
        kb.index_pass(PassMode::Incremental).await.unwrap();

        let held = kb.snapshot();
        write(tmp.path(), "b.md", "beta");
        kb.index_pass(PassMode::Incremental).await.unwrap();

        assert_eq!(held.document_count(), 1);
        assert_eq!(kb.snapshot().document_count(), 2);
    }

    #[tokio::test]
    async fn test_set_root_resets_state() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        write(first.path(), "a.md", "alpha");
        write(second.path(), "b.md", "beta");
        let kb = kb_with(first.path(), 100, Arc::new(CountingEmbedder::new()));
        kb.index_pass(PassMode::Incremental).await.unwrap();

        let report = kb.set_root(second.path()).await.unwrap();
        assert_eq!(report.indexed, 1);
        let snap = kb.snapshot();
        assert_eq!(snap.state.root.as_deref(), Some(second.path()));
        assert_eq!(snap.document_count(), 1);
        assert!(snap.keywords().query(&["alpha".into()], 5).is_empty());

        let err = kb.set_root(&second.path().join("missing")).await.unwrap_err();
        assert!(matches!(err, WeavrError::NotFound { .. }));
        assert_eq!(kb.snapshot().state.root.as_deref(), Some(second.path()));
    }

    #[tokio::test]
    async fn test_pass_without_root() {
        let kb = KnowledgeBase::new(
            IndexSnapshot::default(),
            Arc::new(CountingEmbedder::new()),
            options(),
        );
        let err = kb.index_pass(PassMode::Incremental).await.unwrap_err();
        assert!(matches!(err, WeavrError::NoRoot));
    }

    #[tokio::test]
    async fn test_clear_keeps_root() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.md", "alpha");
        let kb = kb_with(tmp.path(), 100, Arc::new(CountingEmbedder::new()));
        kb.index_pass(PassMode::Incremental).await.unwrap();
        kb.clear().await.unwrap();
        let snap = kb.snapshot();
        assert!(snap.is_empty());
        assert_eq!(snap.state.root.as_deref(), Some(tmp.path()));
        assert!(snap.state.last_index_time.is_none());
    }

    #[tokio::test]
    async fn test_store_mirrors_live_snapshot_across_passes() {
        let tmp = TempDir::new().unwrap();
        let db = TempDir::new().unwrap();
        write(tmp.path(), "a.md", "alpha");
        let b = write(tmp.path(), "b.md", "beta");
        let store = Store::open(&db.path().join("index.sqlite")).await.unwrap();
        let kb = kb_with(tmp.path(), 100, Arc::new(CountingEmbedder::new()))
            .with_store(store.clone(), false);

        kb.index_pass(PassMode::Incremental).await.unwrap();
        assert!(kb.store_synced.load(Ordering::SeqCst));

        std::fs::remove_file(&b).unwrap();
        let a = write(tmp.path(), "a.md", "alpha, revised");
        write(tmp.path(), "c.md", "gamma");
        kb.index_pass(PassMode::Paths(vec![a])).await.unwrap();

        let live = kb.snapshot();
        let loaded = store.load_snapshot("hash-32", 32, 100).await.unwrap().unwrap();
        let hashes = |snap: &IndexSnapshot| -> Vec<(DocumentId, String)> {
            snap.state
                .documents
                .values()
                .map(|d| (d.id.clone(), d.content_hash.clone()))
                .collect()
        };
        assert_eq!(hashes(&loaded), hashes(&live));
        assert_eq!(loaded.document_count(), 2);
        let expected: Vec<_> = live.chunks().cloned().collect();
        let actual: Vec<_> = loaded.chunks().cloned().collect();
        assert_eq!(actual, expected);

        kb.clear().await.unwrap();
        let loaded = store.load_snapshot("hash-32", 32, 100).await.unwrap().unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.document_count(), 0);
    }

    #[test]
    fn test_priority_score_rules() {
        let root = Path::new("/kb");
        let at = |rel: &str| ScannedFile {
            path: root.join(rel),
            modified_at: DateTime::<Utc>::from(std::time::UNIX_EPOCH),
            size: 0,
        };
        assert_eq!(priority_score(root, &at("note.md")), 1000.0);
        assert_eq!(priority_score(root, &at("a/b/note.md")), 900.0);
        assert_eq!(priority_score(root, &at("legacy/note.md")), 450.0);
        assert_eq!(priority_score(root, &at("main.md")), 1200.0);
    }
}
