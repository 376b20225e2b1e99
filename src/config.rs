use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::reasoning::Stage;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub knowledge_base: KnowledgeBaseConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeBaseConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_file_limit")]
    pub file_limit: usize,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            root: None,
            extensions: default_extensions(),
            exclude_globs: Vec::new(),
            file_limit: default_file_limit(),
        }
    }
}

fn default_extensions() -> Vec<String> {
    vec!["md".to_string(), "markdown".to_string()]
}
fn default_file_limit() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    1800
}
fn default_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// Queries with fewer tokens than this are treated as broad.
    #[serde(default = "default_broad_threshold")]
    pub broad_token_threshold: usize,
    #[serde(default = "default_summarize_cues")]
    pub summarize_cues: Vec<String>,
    #[serde(default)]
    pub min_vector_score: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_n: default_top_n(),
            candidate_k: default_candidate_k(),
            broad_token_threshold: default_broad_threshold(),
            summarize_cues: default_summarize_cues(),
            min_vector_score: 0.0,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_top_n() -> usize {
    3
}
fn default_candidate_k() -> usize {
    20
}
fn default_broad_threshold() -> usize {
    5
}
fn default_summarize_cues() -> Vec<String> {
    ["summarize", "summarise", "summary", "overview", "recap", "outline", "gist", "tl;dr"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn default_debounce_ms() -> u64 {
    750
}
fn default_queue_capacity() -> usize {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_model_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_base_model")]
    pub base_model: String,
    #[serde(default = "default_enhanced_model")]
    pub enhanced_model: String,
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_model_url(),
            api_key_env: default_api_key_env(),
            base_model: default_base_model(),
            enhanced_model: default_enhanced_model(),
            timeout_secs: default_model_timeout(),
        }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_model_url() -> String {
    "https://api.together.xyz/v1".to_string()
}
fn default_api_key_env() -> String {
    "TOGETHER_API_KEY".to_string()
}
fn default_base_model() -> String {
    "mistralai/Mixtral-8x7B-Instruct-v0.1".to_string()
}
fn default_enhanced_model() -> String {
    "Qwen/Qwen2-72B-Instruct".to_string()
}
fn default_model_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: i64,
    #[serde(default)]
    pub top_p: Option<f32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            top_p: None,
        }
    }
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_output_tokens() -> i64 {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReasoningConfig {
    /// Stages available to requests, in execution order.
    #[serde(default = "default_stages")]
    pub stages: Vec<Stage>,
    /// Stages enabled when a request does not choose its own.
    #[serde(default)]
    pub default_enabled: Vec<Stage>,
    #[serde(default = "default_tot_branches")]
    pub tot_branches: usize,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            stages: default_stages(),
            default_enabled: Vec::new(),
            tot_branches: default_tot_branches(),
        }
    }
}

fn default_stages() -> Vec<Stage> {
    Stage::ORDER.to_vec()
}
fn default_tot_branches() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    /// Directory for the index cache. No persistence when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl StoreConfig {
    pub fn db_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join("index.sqlite"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_max_filename_len")]
    pub max_filename_len: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_filename_len: default_max_filename_len(),
        }
    }
}

fn default_max_filename_len() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_max_exchanges")]
    pub max_exchanges: usize,
    #[serde(default = "default_prompt_exchanges")]
    pub prompt_exchanges: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_exchanges: default_max_exchanges(),
            prompt_exchanges: default_prompt_exchanges(),
        }
    }
}

fn default_max_exchanges() -> usize {
    10
}
fn default_prompt_exchanges() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// All defaults, no root, no persistence.
    pub fn minimal() -> Self {
        Self {
            knowledge_base: KnowledgeBaseConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            watch: WatchConfig::default(),
            embedding: EmbeddingConfig::default(),
            model: ModelConfig::default(),
            generation: GenerationConfig::default(),
            reasoning: ReasoningConfig::default(),
            store: StoreConfig::default(),
            output: OutputConfig::default(),
            history: HistoryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
    }

    // Validate knowledge base
    if config.knowledge_base.file_limit == 0 {
        anyhow::bail!("knowledge_base.file_limit must be >= 1");
    }
    if config.knowledge_base.extensions.is_empty() {
        anyhow::bail!("knowledge_base.extensions must not be empty");
    }

    // Validate retrieval
    if config.retrieval.top_n == 0 {
        anyhow::bail!("retrieval.top_n must be >= 1");
    }
    if config.retrieval.candidate_k < config.retrieval.top_n {
        anyhow::bail!("retrieval.candidate_k must be >= retrieval.top_n");
    }

    // Validate watch
    if config.watch.queue_capacity == 0 {
        anyhow::bail!("watch.queue_capacity must be >= 1");
    }

    // Validate reasoning: stages must follow the canonical order
    let positions: Vec<usize> = config.reasoning.stages.iter().map(|s| s.position()).collect();
    if positions.windows(2).any(|w| w[0] >= w[1]) {
        anyhow::bail!(
            "reasoning.stages must list each stage at most once, in the order chain_of_thought, tree_of_thought, consistency_validation"
        );
    }
    for stage in &config.reasoning.default_enabled {
        if !config.reasoning.stages.contains(stage) {
            anyhow::bail!(
                "reasoning.default_enabled contains '{}', which is not listed in reasoning.stages",
                stage
            );
        }
    }
    if config.reasoning.tot_branches == 0 {
        anyhow::bail!("reasoning.tot_branches must be >= 1");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "hash" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, or ollama.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }

    crate::logging::validate_level(&config.logging.level)
        .context("logging.level is not a valid filter")?;

    if config.output.max_filename_len == 0 {
        anyhow::bail!("output.max_filename_len must be >= 1");
    }

    Ok(())
}
