//! # Weavr
//!
//! A personal knowledge base over a directory of Markdown notes: incremental
//! indexing, hybrid (vector + BM25) retrieval, and answer generation with
//! optional reasoning stages.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌────────────────┐
//! │ Watcher /   │──▶│ Index pass   │──▶│ IndexSnapshot  │──┐
//! │ scan        │   │ chunk+embed  │   │ vector + BM25  │  │ swap
//! └─────────────┘   └──────────────┘   └────────────────┘  │
//!                                                          ▼
//!      ┌──────────┐   ┌──────────────────┐   ┌───────────────────┐
//!      │   CLI    │──▶│ HybridRetriever  │──▶│ ReasoningPipeline │
//!      │ (weavr)  │   └──────────────────┘   └───────────────────┘
//!      └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! weavr set-root ~/notes
//! weavr search "summarize meeting notes"
//! weavr ask "what was decided about the launch?" --cot
//! weavr watch
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Library error type |
//! | [`logging`] | tracing subscriber setup |
//! | [`models`] | Core data types |
//! | [`path_guard`] | Root, document and output path checks |
//! | [`watcher`] | Corpus scan, debounce queue, live watcher |
//! | [`chunk`] | Markdown chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector and keyword indices in one snapshot |
//! | [`ingest`] | Index passes and snapshot swap |
//! | [`retrieve`] | Hybrid retrieval |
//! | [`params`] | Generation parameter validation |
//! | [`reasoning`] | Draft answer and reasoning stages |
//! | [`llm`] | OpenAI-compatible chat client |
//! | [`history`] | Conversation history |
//! | [`output`] | Saving answers as Markdown |
//! | [`store`] | SQLite index cache |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`engine`] | Command surface used by the CLI |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod history;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod output;
pub mod params;
pub mod path_guard;
pub mod reasoning;
pub mod retrieve;
pub mod store;
pub mod watcher;
