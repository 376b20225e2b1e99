//! SQLite cache of the published index snapshot, settings and history.
//!
//! The store is a cache, never the source of truth: every snapshot can be
//! rebuilt from the corpus. On load, keyword postings are rebuilt from chunk
//! text, and a snapshot built with a different embedding model or
//! dimensionality, or failing [`IndexSnapshot::verify`], is discarded.
//!
//! After the first full write, passes persist only the documents they
//! changed ([`Store::save_changes`]).
//!
//! | Table | Contents |
//! |-------|----------|
//! | `documents` | one row per indexed document, with body |
//! | `chunks` | chunk text and metadata, keyed by `(document_path, seq)` |
//! | `chunk_vectors` | little-endian f32 embedding blobs |
//! | `settings` | root, last index time, file limit, retrieval toggle, model, dims |
//! | `history` | conversation exchanges |

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, warn};

use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::Result;
use crate::history::Exchange;
use crate::index::IndexSnapshot;
use crate::migrate;
use crate::models::{Chunk, ChunkId, Document, DocumentId, KnowledgeBaseState};

pub const KEY_ROOT: &str = "root";
pub const KEY_LAST_INDEX_TIME: &str = "last_index_time";
pub const KEY_FILE_LIMIT: &str = "file_limit";
pub const KEY_EXCLUDED: &str = "excluded";
pub const KEY_EMBEDDING_MODEL: &str = "embedding_model";
pub const KEY_EMBEDDING_DIMS: &str = "embedding_dims";
pub const KEY_RETRIEVAL_ENABLED: &str = "retrieval_enabled";

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

type ChunkRow = (String, i64, String, i64, bool, String, Option<Vec<u8>>);

impl Store {
    /// Open the database at `path` and apply migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replace the stored snapshot with `snapshot` in one transaction.
    pub async fn save_snapshot(&self, snapshot: &IndexSnapshot) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunk_vectors").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM documents").execute(&mut *tx).await?;

        for (id, doc) in &snapshot.state.documents {
            insert_document(&mut tx, snapshot, id, doc).await?;
        }
        write_settings(&mut tx, snapshot).await?;

        tx.commit().await?;
        debug!(
            documents = snapshot.document_count(),
            chunks = snapshot.chunk_count(),
            "snapshot persisted"
        );
        Ok(())
    }

    /// Persist `current`, given that the store already holds `previous`.
    ///
    /// Only documents whose record differs are written: removed documents are
    /// deleted, re-stamped ones get their metadata updated, and re-indexed
    /// ones have their chunks and vectors replaced. Returns the number of
    /// documents touched.
    pub async fn save_changes(
        &self,
        previous: &IndexSnapshot,
        current: &IndexSnapshot,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut touched = 0;

        for id in previous.state.documents.keys() {
            if !current.state.documents.contains_key(id) {
                delete_document(&mut tx, id).await?;
                touched += 1;
            }
        }

        for (id, doc) in &current.state.documents {
            match previous.state.documents.get(id) {
                Some(old) if old == doc => continue,
                Some(old)
                    if old.content_hash == doc.content_hash && old.indexed_at == doc.indexed_at =>
                {
                    sqlx::query("UPDATE documents SET modified_at = ?, size = ? WHERE path = ?")
                        .bind(doc.modified_at.timestamp_millis())
                        .bind(doc.size as i64)
                        .bind(id.to_string())
                        .execute(&mut *tx)
                        .await?;
                }
                _ => {
                    delete_document(&mut tx, id).await?;
                    insert_document(&mut tx, current, id, doc).await?;
                }
            }
            touched += 1;
        }
        write_settings(&mut tx, current).await?;

        tx.commit().await?;
        debug!(touched, documents = current.document_count(), "snapshot changes persisted");
        Ok(touched)
    }

    /// Load the stored snapshot if it was built with `embedding_model` at
    /// `embedding_dims` dimensions.
    ///
    /// Returns `None` when nothing is stored. A discarded cache comes back as
    /// an empty snapshot that keeps root and file limit, with
    /// `embedding_model` unset.
    pub async fn load_snapshot(
        &self,
        embedding_model: &str,
        embedding_dims: usize,
        default_file_limit: usize,
    ) -> Result<Option<IndexSnapshot>> {
        let Some(root) = self.get_setting(KEY_ROOT).await?.filter(|r| !r.is_empty()) else {
            return Ok(None);
        };

        let stored_model = self.get_setting(KEY_EMBEDDING_MODEL).await?.unwrap_or_default();
        let file_limit = self
            .get_setting(KEY_FILE_LIMIT)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_file_limit);
        let mut state = KnowledgeBaseState::new(Some(PathBuf::from(root)), file_limit);

        if !stored_model.is_empty() && stored_model != embedding_model {
            warn!(
                stored = %stored_model,
                current = %embedding_model,
                "embedding model changed; cached index discarded"
            );
            return Ok(Some(IndexSnapshot::new(state)));
        }
        let stored_dims = self
            .get_setting(KEY_EMBEDDING_DIMS)
            .await?
            .and_then(|v| v.parse::<usize>().ok());
        if let Some(stored) = stored_dims.filter(|d| *d != embedding_dims) {
            warn!(
                stored,
                current = embedding_dims,
                "embedding dimensions changed; cached index discarded"
            );
            return Ok(Some(IndexSnapshot::new(state)));
        }

        state.last_index_time = self
            .get_setting(KEY_LAST_INDEX_TIME)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(from_millis);
        state.excluded = self
            .get_setting(KEY_EXCLUDED)
            .await?
            .and_then(|v| serde_json::from_str::<Vec<String>>(&v).ok())
            .unwrap_or_default()
            .into_iter()
            .map(DocumentId::new)
            .collect();

        let mut snapshot = IndexSnapshot::new(state);
        snapshot.embedding_model = Some(embedding_model.to_string());

        let doc_rows: Vec<(String, String, i64, i64, i64, String)> = sqlx::query_as(
            "SELECT path, content_hash, modified_at, size, indexed_at, body FROM documents ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await?;

        let chunk_rows: Vec<ChunkRow> = sqlx::query_as(
            r#"
            SELECT c.document_path, c.seq, c.text, c.token_estimate, c.overlaps_previous, c.hash, v.embedding
            FROM chunks c
            LEFT JOIN chunk_vectors v ON v.document_path = c.document_path AND v.seq = c.seq
            ORDER BY c.document_path, c.seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_doc: BTreeMap<String, Vec<(Chunk, Vec<f32>)>> = BTreeMap::new();
        for (path, seq, text, token_estimate, overlaps_previous, hash, blob) in chunk_rows {
            let chunk = Chunk {
                id: ChunkId::new(DocumentId::new(&path), seq as u32),
                text,
                token_estimate: token_estimate as usize,
                overlaps_previous,
                hash,
            };
            let embedding = blob.map(|b| blob_to_vec(&b)).unwrap_or_default();
            by_doc.entry(path).or_default().push((chunk, embedding));
        }

        for (path, content_hash, modified_at, size, indexed_at, body) in doc_rows {
            let document = Document {
                id: DocumentId::new(&path),
                content_hash,
                modified_at: from_millis(modified_at).unwrap_or_default(),
                size: size as u64,
                indexed_at: from_millis(indexed_at).unwrap_or_default(),
            };
            let (chunks, embeddings): (Vec<Chunk>, Vec<Vec<f32>>) =
                by_doc.remove(&path).unwrap_or_default().into_iter().unzip();
            if let Err(e) = snapshot.replace_document(document, &body, chunks, embeddings) {
                warn!(error = %e, "cached index is corrupt; discarding");
                return Ok(Some(IndexSnapshot::new(snapshot.state.clone_settings())));
            }
        }

        if !by_doc.is_empty() {
            warn!("cached chunks without documents; discarding cached index");
            return Ok(Some(IndexSnapshot::new(snapshot.state.clone_settings())));
        }
        if let Err(e) = snapshot.verify() {
            warn!(error = %e, "cached index failed verification; discarding");
            return Ok(Some(IndexSnapshot::new(snapshot.state.clone_settings())));
        }
        if let Some(stored) = snapshot.vectors().dims().filter(|d| *d != embedding_dims) {
            warn!(
                stored,
                current = embedding_dims,
                "cached vectors have other dimensions; discarding"
            );
            return Ok(Some(IndexSnapshot::new(snapshot.state.clone_settings())));
        }

        debug!(
            documents = snapshot.document_count(),
            chunks = snapshot.chunk_count(),
            "snapshot loaded from cache"
        );
        Ok(Some(snapshot))
    }

    pub async fn append_exchange(&self, exchange: &Exchange) -> Result<()> {
        sqlx::query("INSERT INTO history (user, assistant, created_at) VALUES (?, ?, ?)")
            .bind(&exchange.user)
            .bind(&exchange.assistant)
            .bind(exchange.at.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The most recent `limit` exchanges, oldest first.
    pub async fn recent_exchanges(&self, limit: usize) -> Result<Vec<Exchange>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT user, assistant, created_at FROM history ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .rev()
            .map(|(user, assistant, at)| Exchange {
                user,
                assistant,
                at: from_millis(at).unwrap_or_default(),
            })
            .collect())
    }

    pub async fn clear_history(&self) -> Result<()> {
        sqlx::query("DELETE FROM history").execute(&self.pool).await?;
        Ok(())
    }
}

async fn delete_document(tx: &mut Transaction<'_, Sqlite>, id: &DocumentId) -> Result<()> {
    let path = id.to_string();
    sqlx::query("DELETE FROM chunk_vectors WHERE document_path = ?")
        .bind(&path)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_path = ?")
        .bind(&path)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM documents WHERE path = ?")
        .bind(&path)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn insert_document(
    tx: &mut Transaction<'_, Sqlite>,
    snapshot: &IndexSnapshot,
    id: &DocumentId,
    doc: &Document,
) -> Result<()> {
    let path = id.to_string();
    let body = snapshot.document_text(id).unwrap_or_default();
    sqlx::query(
        "INSERT INTO documents (path, content_hash, modified_at, size, indexed_at, body) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&path)
    .bind(&doc.content_hash)
    .bind(doc.modified_at.timestamp_millis())
    .bind(doc.size as i64)
    .bind(doc.indexed_at.timestamp_millis())
    .bind(body)
    .execute(&mut **tx)
    .await?;

    for chunk in snapshot.chunks_of(id) {
        sqlx::query(
            "INSERT INTO chunks (document_path, seq, text, token_estimate, overlaps_previous, hash) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&path)
        .bind(i64::from(chunk.id.seq))
        .bind(&chunk.text)
        .bind(chunk.token_estimate as i64)
        .bind(chunk.overlaps_previous)
        .bind(&chunk.hash)
        .execute(&mut **tx)
        .await?;

        if let Some(entry) = snapshot.vectors().get(&chunk.id) {
            sqlx::query(
                "INSERT INTO chunk_vectors (document_path, seq, dims, embedding) VALUES (?, ?, ?, ?)",
            )
            .bind(&path)
            .bind(i64::from(chunk.id.seq))
            .bind(entry.embedding.len() as i64)
            .bind(vec_to_blob(&entry.embedding))
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

async fn write_settings(tx: &mut Transaction<'_, Sqlite>, snapshot: &IndexSnapshot) -> Result<()> {
    let state = &snapshot.state;
    let excluded: Vec<String> = state.excluded.iter().map(|d| d.to_string()).collect();
    let settings = [
        (
            KEY_ROOT,
            state
                .root
                .as_ref()
                .map(|r| r.display().to_string())
                .unwrap_or_default(),
        ),
        (
            KEY_LAST_INDEX_TIME,
            state
                .last_index_time
                .map(|t| t.timestamp_millis().to_string())
                .unwrap_or_default(),
        ),
        (KEY_FILE_LIMIT, state.file_limit.to_string()),
        (
            KEY_EXCLUDED,
            serde_json::to_string(&excluded).map_err(anyhow::Error::from)?,
        ),
        (
            KEY_EMBEDDING_MODEL,
            snapshot.embedding_model.clone().unwrap_or_default(),
        ),
        (
            KEY_EMBEDDING_DIMS,
            snapshot
                .vectors()
                .dims()
                .map(|d| d.to_string())
                .unwrap_or_default(),
        ),
    ];
    let now = Utc::now().timestamp();
    for (key, value) in settings {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_document;
    use crate::config::ChunkingConfig;
    use crate::embedding::HashEmbedder;
    use tempfile::TempDir;

    fn sample_snapshot(root: &Path) -> IndexSnapshot {
        let mut state = KnowledgeBaseState::new(Some(root.to_path_buf()), 50);
        state.last_index_time = Some(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap());
        state.excluded = vec![DocumentId::new(root.join("old.md"))];
        let mut snapshot = IndexSnapshot::new(state);
        snapshot.embedding_model = Some("hash-16".into());

        let e = HashEmbedder::new(16);
        for (name, text) in [("a.md", "alpha notes\n\nmore alpha"), ("b.md", "beta")] {
            let doc = Document {
                id: DocumentId::new(root.join(name)),
                content_hash: format!("hash-{name}"),
                modified_at: Utc.timestamp_millis_opt(1_600_000_000_000).unwrap(),
                size: text.len() as u64,
                indexed_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            };
            let chunks = chunk_document(&doc.id, text, &ChunkingConfig::default());
            let vectors = chunks.iter().map(|c| e.embed_one(&c.text)).collect();
            snapshot.replace_document(doc, text, chunks, vectors).unwrap();
        }
        snapshot
    }

    #[tokio::test]
    async fn test_snapshot_survives_reload() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("cache/index.sqlite")).await.unwrap();
        let original = sample_snapshot(tmp.path());
        store.save_snapshot(&original).await.unwrap();

        let loaded = store.load_snapshot("hash-16", 16, 100).await.unwrap().unwrap();
        loaded.verify().unwrap();
        assert_eq!(loaded.state, original.state);
        let a: Vec<_> = original.chunks().cloned().collect();
        let b: Vec<_> = loaded.chunks().cloned().collect();
        assert_eq!(a, b);
        let id = DocumentId::new(tmp.path().join("a.md"));
        assert_eq!(loaded.document_text(&id), original.document_text(&id));
        assert_eq!(
            loaded.keywords().query(&["alpha".into()], 5).len(),
            original.keywords().query(&["alpha".into()], 5).len()
        );
        store.close().await;
    }

    #[tokio::test]
    async fn test_model_change_discards_index_but_keeps_root() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("index.sqlite")).await.unwrap();
        store.save_snapshot(&sample_snapshot(tmp.path())).await.unwrap();

        let loaded = store.load_snapshot("other-model", 16, 100).await.unwrap().unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.state.root.as_deref(), Some(tmp.path()));
        assert_eq!(loaded.state.file_limit, 50);
        assert!(loaded.state.last_index_time.is_none());
    }

    #[tokio::test]
    async fn test_dimension_change_discards_index() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("index.sqlite")).await.unwrap();
        store.save_snapshot(&sample_snapshot(tmp.path())).await.unwrap();
        assert_eq!(
            store.get_setting(KEY_EMBEDDING_DIMS).await.unwrap().as_deref(),
            Some("16")
        );

        // Same model name, different configured dims.
        let loaded = store.load_snapshot("hash-16", 32, 100).await.unwrap().unwrap();
        assert!(loaded.is_empty());
        assert!(loaded.embedding_model.is_none());
        assert_eq!(loaded.state.root.as_deref(), Some(tmp.path()));

        // Caches written before dims were recorded are checked by vector length.
        store.set_setting(KEY_EMBEDDING_DIMS, "").await.unwrap();
        let loaded = store.load_snapshot("hash-16", 32, 100).await.unwrap().unwrap();
        assert!(loaded.is_empty());
        let loaded = store.load_snapshot("hash-16", 16, 100).await.unwrap().unwrap();
        assert_eq!(loaded.document_count(), 2);
    }

    #[tokio::test]
    async fn test_save_changes_writes_only_changed_documents() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("index.sqlite")).await.unwrap();
        let previous = sample_snapshot(tmp.path());
        store.save_snapshot(&previous).await.unwrap();

        // Rows for documents the pass did not touch must not be rewritten.
        let a = DocumentId::new(tmp.path().join("a.md"));
        let b = DocumentId::new(tmp.path().join("b.md"));
        sqlx::query("UPDATE documents SET body = 'untouched' WHERE path = ?")
            .bind(a.to_string())
            .execute(&store.pool)
            .await
            .unwrap();

        let mut current = previous.clone();
        current.remove_document(&b);
        let e = HashEmbedder::new(16);
        let c = Document {
            id: DocumentId::new(tmp.path().join("c.md")),
            content_hash: "hash-c.md".into(),
            modified_at: Utc.timestamp_millis_opt(1_650_000_000_000).unwrap(),
            size: 5,
            indexed_at: Utc.timestamp_millis_opt(1_750_000_000_000).unwrap(),
        };
        let chunks = chunk_document(&c.id, "gamma", &ChunkingConfig::default());
        let vectors = chunks.iter().map(|ch| e.embed_one(&ch.text)).collect();
        current.replace_document(c.clone(), "gamma", chunks, vectors).unwrap();

        let touched = store.save_changes(&previous, &current).await.unwrap();
        assert_eq!(touched, 2);

        let body: String = sqlx::query_scalar("SELECT body FROM documents WHERE path = ?")
            .bind(a.to_string())
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(body, "untouched");

        let loaded = store.load_snapshot("hash-16", 16, 100).await.unwrap().unwrap();
        loaded.verify().unwrap();
        assert_eq!(loaded.document_count(), 2);
        assert!(loaded.state.documents.contains_key(&c.id));
        assert!(!loaded.state.documents.contains_key(&b));
        assert_eq!(loaded.document_text(&c.id), Some("gamma"));
        let orphans: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE document_path = ?")
                .bind(b.to_string())
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn test_save_changes_updates_restamped_metadata() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("index.sqlite")).await.unwrap();
        let previous = sample_snapshot(tmp.path());
        store.save_snapshot(&previous).await.unwrap();

        let a = DocumentId::new(tmp.path().join("a.md"));
        let mut current = previous.clone();
        let mut touched = current.state.documents[&a].clone();
        touched.modified_at = Utc.timestamp_millis_opt(1_800_000_000_000).unwrap();
        current.touch_document(touched.clone());

        assert_eq!(store.save_changes(&previous, &current).await.unwrap(), 1);
        let loaded = store.load_snapshot("hash-16", 16, 100).await.unwrap().unwrap();
        assert_eq!(loaded.state.documents[&a], touched);
        assert_eq!(loaded.chunk_count(), previous.chunk_count());
    }

    #[tokio::test]
    async fn test_empty_store_loads_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("index.sqlite")).await.unwrap();
        assert!(store.load_snapshot("hash-16", 16, 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_settings_and_history() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("index.sqlite")).await.unwrap();
        store.set_setting(KEY_RETRIEVAL_ENABLED, "false").await.unwrap();
        store.set_setting(KEY_RETRIEVAL_ENABLED, "true").await.unwrap();
        assert_eq!(
            store.get_setting(KEY_RETRIEVAL_ENABLED).await.unwrap().as_deref(),
            Some("true")
        );

        for i in 0..4 {
            store
                .append_exchange(&Exchange::new(format!("q{i}"), format!("a{i}")))
                .await
                .unwrap();
        }
        let recent = store.recent_exchanges(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].user, "q2");
        assert_eq!(recent[1].user, "q3");

        store.clear_history().await.unwrap();
        assert!(store.recent_exchanges(10).await.unwrap().is_empty());
    }
}
