//! # Weavr CLI (`weavr`)
//!
//! Indexes a directory of Markdown notes and answers questions from it.
//!
//! ## Usage
//!
//! ```bash
//! weavr --config ./config/weavr.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `weavr status` | Show root, document counts, last index time, toggles |
//! | `weavr set-root <dir>` | Point at a new notes directory and index it |
//! | `weavr set-file-limit <n>` | Cap the number of indexed documents |
//! | `weavr clear-context` | Forget the conversation history |
//! | `weavr clear-knowledge` | Drop every indexed document |
//! | `weavr retrieval on\|off` | Toggle retrieval for `ask` |
//! | `weavr index [--full]` | Run an index pass |
//! | `weavr search "<query>"` | Show retrieved passages |
//! | `weavr ask "<question>"` | Answer from the knowledge base |
//! | `weavr watch` | Re-index on file changes until Ctrl-C |
//!
//! ## Examples
//!
//! ```bash
//! weavr set-root ~/notes
//! weavr search "summarize meeting notes"
//! weavr ask "what did we decide about the launch?" --cot --validate --save launch
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;

use weavr::config::{self, Config};
use weavr::engine::{AskOptions, Engine};
use weavr::ingest::IndexReport;
use weavr::logging;
use weavr::reasoning::{Stage, StageMask};
use weavr::retrieve::RetrievalResult;

const DEFAULT_CONFIG: &str = "./config/weavr.toml";

/// Weavr: a personal Markdown knowledge base with hybrid retrieval.
#[derive(Parser)]
#[command(
    name = "weavr",
    about = "Weavr: incremental indexing, hybrid retrieval and reasoning over Markdown notes",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/weavr.toml`; built-in defaults are used when
    /// that file does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the knowledge base status.
    Status {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Point the knowledge base at a directory and index it from scratch.
    SetRoot { path: PathBuf },

    /// Set the maximum number of indexed documents.
    SetFileLimit { limit: usize },

    /// Forget the conversation history.
    ClearContext,

    /// Drop every indexed document. The root and file limit are kept.
    ClearKnowledge,

    /// Turn retrieval on or off for `ask`.
    Retrieval { state: Toggle },

    /// Run an index pass over the root.
    Index {
        /// Re-hash every document instead of only those modified since the
        /// last pass.
        #[arg(long)]
        full: bool,
    },

    /// Retrieve passages for a query without calling the model.
    Search {
        query: String,

        #[arg(long)]
        json: bool,
    },

    /// Answer a question from the knowledge base.
    Ask {
        question: String,

        /// Chain-of-thought refinement.
        #[arg(long)]
        cot: bool,

        /// Tree-of-thought refinement.
        #[arg(long)]
        tot: bool,

        /// Check the answer against the retrieved context.
        #[arg(long)]
        validate: bool,

        /// Sampling temperature in [0, 1].
        #[arg(long, allow_negative_numbers = true)]
        temperature: Option<f32>,

        /// Maximum answer length in tokens.
        #[arg(long, allow_negative_numbers = true)]
        max_tokens: Option<i64>,

        /// Nucleus sampling cutoff in (0, 1].
        #[arg(long)]
        top_p: Option<f32>,

        /// Save the answer as Markdown under this title in `output.dir`.
        #[arg(long)]
        save: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Watch the root and re-index on changes until Ctrl-C.
    Watch,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = resolve_config(cli.config.as_deref())?;
    logging::init(&cfg.logging.level)?;

    let persistent = cfg.store.dir.is_some();
    let engine = Engine::open(cfg).await?;
    let result = run(&engine, cli.command, persistent).await;
    engine.shutdown().await;
    result
}

async fn run(engine: &Engine, command: Commands, persistent: bool) -> anyhow::Result<()> {
    match command {
        Commands::Status { json } => {
            let status = engine.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }
            match &status.root {
                Some(root) => println!("Root:            {}", root.display()),
                None => println!("Root:            (not set)"),
            }
            println!("Documents:       {}", status.documents);
            println!("Chunks:          {}", status.chunks);
            match status.last_index_time {
                Some(t) => println!("Last indexed:    {}", t.format("%Y-%m-%d %H:%M:%S UTC")),
                None => println!("Last indexed:    never"),
            }
            println!("File limit:      {}", status.file_limit);
            println!(
                "Retrieval:       {}",
                if status.retrieval_enabled { "on" } else { "off" }
            );
            println!("Embedding model: {}", status.embedding_model);
            println!("History:         {} exchange(s)", status.history_len);
            if !status.excluded.is_empty() {
                println!("Excluded by file limit ({}):", status.excluded.len());
                for doc in &status.excluded {
                    println!("  {}", doc);
                }
            }
        }
        Commands::SetRoot { path } => {
            let report = engine
                .set_root(&path)
                .await
                .with_context(|| format!("cannot use {} as knowledge base root", path.display()))?;
            print_report(&report);
            if !persistent {
                println!("Note: no [store] dir configured; the root is not remembered.");
            }
        }
        Commands::SetFileLimit { limit } => {
            let report = engine.set_file_limit(limit).await?;
            println!("File limit set to {limit}.");
            if engine.status().await.root.is_some() {
                print_report(&report);
            }
        }
        Commands::ClearContext => {
            engine.clear_context().await?;
            println!("Conversation history cleared.");
        }
        Commands::ClearKnowledge => {
            engine.clear_knowledge().await?;
            println!("Knowledge base cleared.");
        }
        Commands::Retrieval { state } => {
            let enabled = matches!(state, Toggle::On);
            engine.set_retrieval(enabled).await?;
            println!("Retrieval {}.", if enabled { "enabled" } else { "disabled" });
        }
        Commands::Index { full } => {
            let report = engine.index(full).await?;
            print_report(&report);
        }
        Commands::Search { query, json } => {
            refresh(engine).await?;
            let result = engine.search(&query).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_retrieval(&result);
            }
        }
        Commands::Ask {
            question,
            cot,
            tot,
            validate,
            temperature,
            max_tokens,
            top_p,
            save,
            json,
        } => {
            refresh(engine).await?;

            let mut stages = StageMask::none();
            stages.set(Stage::ChainOfThought, cot);
            stages.set(Stage::TreeOfThought, tot);
            stages.set(Stage::ConsistencyValidation, validate);
            let options = AskOptions {
                stages: (cot || tot || validate).then_some(stages),
                temperature,
                max_tokens,
                top_p,
            };

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });
            let outcome = engine.ask(&question, options, &cancel).await;
            interrupt.abort();
            let outcome = outcome?;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("{}", outcome.answer.text);
                if !outcome.sources.is_empty() {
                    println!();
                    println!("Sources:");
                    for s in &outcome.sources {
                        println!("  {}", s);
                    }
                }
                if outcome.answer.degraded {
                    eprintln!("note: enhanced model unavailable; answered with the base model");
                }
                for w in &outcome.answer.warnings {
                    eprintln!("note: {w}");
                }
            }

            if let Some(title) = save {
                let path = engine.save_answer(&title, &outcome.answer.text)?;
                println!("Saved to {}", path.display());
            }
        }
        Commands::Watch => {
            let report = engine.index(false).await?;
            print_report(&report);
            engine.start_watching().await?;
            println!("Watching for changes. Press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await?;
            engine.stop_watching().await?;
        }
    }

    Ok(())
}

fn resolve_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG);
            if default.exists() {
                config::load_config(default)
            } else {
                Ok(Config::minimal())
            }
        }
    }
}

/// Pick up changes before answering, when a root is set.
async fn refresh(engine: &Engine) -> anyhow::Result<()> {
    if engine.status().await.root.is_some() {
        engine.index(false).await?;
    }
    Ok(())
}

fn print_report(report: &IndexReport) {
    println!(
        "Indexed {} document(s), {} unchanged, {} removed, {} failed ({} scanned, {} chunks, {} ms).",
        report.indexed,
        report.unchanged,
        report.removed,
        report.failed,
        report.scanned,
        report.chunks,
        report.duration_ms
    );
    if report.excluded > 0 {
        println!(
            "{} document(s) excluded by the file limit.",
            report.excluded
        );
    }
}

fn print_retrieval(result: &RetrievalResult) {
    if result.is_empty() {
        println!("{}", result.context());
        return;
    }
    for (i, p) in result.passages.iter().enumerate() {
        let label = match &p.chunk {
            Some(id) => id.to_string(),
            None => p.document.to_string(),
        };
        println!("{}. [{:.2}] {}", i + 1, p.score, label);
        let preview: String = p.text.chars().take(240).collect();
        println!("   {}", preview.replace('\n', " "));
        println!();
    }
}
