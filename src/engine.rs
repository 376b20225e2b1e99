//! Command surface over the knowledge base, retriever and reasoning pipeline.
//!
//! [`Engine`] is what the CLI drives. It owns the live [`KnowledgeBase`], the
//! conversation history, the retrieval toggle and the optional live watcher.
//! Every operation is safe to call concurrently: index passes serialise on
//! the knowledge base writer lock, queries read an immutable snapshot.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{Result, WeavrError};
use crate::history::{ConversationHistory, Exchange};
use crate::index::IndexSnapshot;
use crate::ingest::{IndexReport, IndexerOptions, KnowledgeBase, PassMode};
use crate::llm::ChatModel;
use crate::models::{DocumentId, KnowledgeBaseState};
use crate::output;
use crate::params::GenerationParams;
use crate::reasoning::{
    Answer, LanguageModel, ReasoningPipeline, ReasoningRequest, StageMask,
};
use crate::retrieve::{Granularity, HybridRetriever, RetrievalResult};
use crate::store::{Store, KEY_RETRIEVAL_ENABLED};
use crate::watcher::{CorpusWatcher, ScanOptions};

/// Snapshot of the engine's state for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeBaseStatus {
    pub root: Option<PathBuf>,
    pub documents: usize,
    pub chunks: usize,
    pub last_index_time: Option<DateTime<Utc>>,
    pub file_limit: usize,
    pub excluded: Vec<DocumentId>,
    pub retrieval_enabled: bool,
    pub watching: bool,
    pub embedding_model: String,
    pub history_len: usize,
}

/// Per-request overrides for [`Engine::ask`].
#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    /// Stages to run; the configured defaults when `None`.
    pub stages: Option<StageMask>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i64>,
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AskOutcome {
    pub answer: Answer,
    /// `None` when retrieval is switched off.
    pub granularity: Option<Granularity>,
    pub sources: Vec<DocumentId>,
}

pub struct Engine {
    config: Config,
    kb: Arc<KnowledgeBase>,
    retriever: HybridRetriever,
    pipeline: ReasoningPipeline,
    default_stages: StageMask,
    history: Mutex<ConversationHistory>,
    retrieval_enabled: AtomicBool,
    watcher: Mutex<Option<CorpusWatcher>>,
}

impl Engine {
    /// Build an engine with the configured embedding provider and chat model.
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        let model: Arc<dyn LanguageModel> = Arc::new(ChatModel::new(&config.model)?);
        Ok(Self::with_parts(config, embedder, model).await?)
    }

    /// Build an engine around explicit providers.
    pub async fn with_parts(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        let configured_root = match &config.knowledge_base.root {
            Some(root) => Some(absolute(root)?),
            None => None,
        };

        let store = match config.store.db_path() {
            Some(path) => Some(Store::open(&path).await?),
            None => None,
        };

        let loaded = match &store {
            Some(store) => {
                store
                    .load_snapshot(
                        embedder.model_name(),
                        embedder.dims(),
                        config.knowledge_base.file_limit,
                    )
                    .await?
            }
            None => None,
        };
        // The store mirrors the snapshot only when its cache was used as is.
        let (snapshot, store_synced) = match loaded {
            Some(snapshot)
                if configured_root.is_none() || snapshot.state.root == configured_root =>
            {
                let intact = snapshot.embedding_model.is_some();
                (snapshot, intact)
            }
            _ => (
                IndexSnapshot::new(KnowledgeBaseState::new(
                    configured_root,
                    config.knowledge_base.file_limit,
                )),
                false,
            ),
        };

        let retrieval_enabled = match &store {
            Some(store) => store
                .get_setting(KEY_RETRIEVAL_ENABLED)
                .await?
                .and_then(|v| v.parse().ok())
                .unwrap_or(config.retrieval.enabled),
            None => config.retrieval.enabled,
        };

        let mut history = ConversationHistory::new(
            config.history.max_exchanges,
            config.history.prompt_exchanges,
        );
        if let Some(store) = &store {
            for exchange in store.recent_exchanges(config.history.max_exchanges).await? {
                history.push(exchange);
            }
        }

        let options = IndexerOptions {
            chunking: config.chunking.clone(),
            scan: ScanOptions::from_config(&config.knowledge_base)?,
            batch_size: config.embedding.batch_size,
        };
        let mut kb = KnowledgeBase::new(snapshot, embedder, options);
        if let Some(store) = store {
            kb = kb.with_store(store, store_synced);
        }

        Ok(Self {
            retriever: HybridRetriever::new(config.retrieval.clone()),
            pipeline: ReasoningPipeline::new(model, &config.reasoning, config.model.timeout()),
            default_stages: StageMask::from_stages(&config.reasoning.default_enabled),
            history: Mutex::new(history),
            retrieval_enabled: AtomicBool::new(retrieval_enabled),
            watcher: Mutex::new(None),
            kb: Arc::new(kb),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn knowledge_base(&self) -> &Arc<KnowledgeBase> {
        &self.kb
    }

    pub async fn status(&self) -> KnowledgeBaseStatus {
        let snapshot = self.kb.snapshot();
        let state = &snapshot.state;
        KnowledgeBaseStatus {
            root: state.root.clone(),
            documents: snapshot.document_count(),
            chunks: snapshot.chunk_count(),
            last_index_time: state.last_index_time,
            file_limit: state.file_limit,
            excluded: state.excluded.clone(),
            retrieval_enabled: self.retrieval_enabled.load(Ordering::SeqCst),
            watching: self.watcher.lock().await.is_some(),
            embedding_model: self.kb.embedder().model_name().to_string(),
            history_len: self.history.lock().await.len(),
        }
    }

    /// Point the knowledge base at a new root and index it from scratch.
    ///
    /// A running watcher follows the new root.
    pub async fn set_root(&self, path: &Path) -> Result<IndexReport> {
        let root = absolute(path)?;
        let report = self.kb.set_root(&root).await?;

        let mut watcher = self.watcher.lock().await;
        if let Some(old) = watcher.take() {
            old.stop().await;
            *watcher = Some(self.spawn_watcher(&root)?);
        }
        Ok(report)
    }

    pub async fn set_file_limit(&self, limit: usize) -> Result<IndexReport> {
        self.kb.set_file_limit(limit).await
    }

    /// Forget the conversation history.
    pub async fn clear_context(&self) -> Result<()> {
        self.history.lock().await.clear();
        if let Some(store) = self.kb.store() {
            store.clear_history().await?;
        }
        info!("conversation history cleared");
        Ok(())
    }

    /// Drop every indexed document; the root and file limit are kept.
    pub async fn clear_knowledge(&self) -> Result<()> {
        self.kb.clear().await?;
        info!("knowledge base cleared");
        Ok(())
    }

    pub async fn set_retrieval(&self, enabled: bool) -> Result<()> {
        self.retrieval_enabled.store(enabled, Ordering::SeqCst);
        if let Some(store) = self.kb.store() {
            store
                .set_setting(KEY_RETRIEVAL_ENABLED, if enabled { "true" } else { "false" })
                .await?;
        }
        Ok(())
    }

    pub fn retrieval_enabled(&self) -> bool {
        self.retrieval_enabled.load(Ordering::SeqCst)
    }

    pub async fn index(&self, full: bool) -> Result<IndexReport> {
        let mode = if full {
            PassMode::Full
        } else {
            PassMode::Incremental
        };
        self.kb.index_pass(mode).await
    }

    pub async fn search(&self, query: &str) -> Result<RetrievalResult> {
        self.retriever
            .retrieve(self.kb.snapshot(), query, self.kb.embedder().as_ref())
            .await
    }

    /// Answer a question from the knowledge base.
    ///
    /// Parameters are validated before anything else happens. A successful
    /// answer is appended to the conversation history.
    pub async fn ask(
        &self,
        question: &str,
        options: AskOptions,
        cancel: &CancellationToken,
    ) -> Result<AskOutcome> {
        let params = self.params_for(&options).validate()?;

        let retrieval = if self.retrieval_enabled() {
            Some(self.search(question).await?)
        } else {
            None
        };
        let context = retrieval
            .as_ref()
            .map(|r| r.context())
            .unwrap_or_default();
        let history = self.history.lock().await.render();

        let answer = self
            .pipeline
            .run(
                ReasoningRequest {
                    question,
                    context: &context,
                    history: history.as_deref(),
                    stages: options.stages.unwrap_or(self.default_stages),
                    params,
                },
                cancel,
            )
            .await?;

        let exchange = Exchange::new(question, answer.text.clone());
        if let Some(store) = self.kb.store() {
            if let Err(e) = store.append_exchange(&exchange).await {
                warn!(error = %e, "failed to persist conversation exchange");
            }
        }
        self.history.lock().await.push(exchange);

        let mut sources: Vec<DocumentId> = Vec::new();
        if let Some(r) = &retrieval {
            for p in &r.passages {
                if !sources.contains(&p.document) {
                    sources.push(p.document.clone());
                }
            }
        }

        Ok(AskOutcome {
            answer,
            granularity: retrieval.map(|r| r.granularity),
            sources,
        })
    }

    /// Write an answer into the configured output directory.
    pub fn save_answer(&self, title: &str, body: &str) -> Result<PathBuf> {
        let dir = self
            .config
            .output
            .dir
            .as_ref()
            .ok_or_else(|| WeavrError::InvalidCommand("output.dir is not configured".to_string()))?;
        output::write_markdown(dir, title, body, self.config.output.max_filename_len)
    }

    /// Start live mode. Returns `false` if already watching.
    pub async fn start_watching(&self) -> Result<bool> {
        let mut watcher = self.watcher.lock().await;
        if watcher.is_some() {
            return Ok(false);
        }
        let root = self.kb.snapshot().state.root.clone().ok_or(WeavrError::NoRoot)?;
        *watcher = Some(self.spawn_watcher(&root)?);
        Ok(true)
    }

    /// Stop live mode. Returns `false` if not watching.
    pub async fn stop_watching(&self) -> Result<bool> {
        match self.watcher.lock().await.take() {
            Some(w) => {
                w.stop().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop the watcher and close the store.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop_watching().await {
            warn!(error = %e, "failed to stop watcher");
        }
        if let Some(store) = self.kb.store() {
            store.close().await;
        }
    }

    fn spawn_watcher(&self, root: &Path) -> Result<CorpusWatcher> {
        CorpusWatcher::start(
            self.kb.clone(),
            root,
            self.kb.scan_options().clone(),
            &self.config.watch,
        )
    }

    fn params_for(&self, options: &AskOptions) -> GenerationParams {
        let base = GenerationParams::from_config(&self.config.generation);
        GenerationParams {
            temperature: options.temperature.unwrap_or(base.temperature),
            max_tokens: options.max_tokens.unwrap_or(base.max_tokens),
            top_p: options.top_p.or(base.top_p),
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
