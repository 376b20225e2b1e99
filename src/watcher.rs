//! Corpus discovery and live change watching.
//!
//! Two halves:
//!
//! - [`scan`] walks the knowledge base root once and reports every
//!   recognised Markdown document plus the subset modified since a given
//!   time. Links are never followed; symlinked entries are skipped with a
//!   warning.
//! - [`CorpusWatcher`] listens for filesystem events through `notify`,
//!   coalesces them in a [`DebounceQueue`], validates the released paths and
//!   triggers an incremental index pass on the [`KnowledgeBase`].
//!
//! # Backpressure
//!
//! Raw events travel through a bounded channel. When it is full the event is
//! dropped and the queue is flagged for a full rescan instead, so a burst of
//! thousands of writes costs one pass, not unbounded memory. Events on hidden,
//! excluded or non-document paths are dropped before they reach the queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{KnowledgeBaseConfig, WatchConfig};
use crate::error::{Result, WeavrError};
use crate::ingest::{KnowledgeBase, PassMode};
use crate::path_guard;

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/node_modules/**"];

/// Which files count as documents.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    extensions: Vec<String>,
    exclude: GlobSet,
}

impl ScanOptions {
    pub fn new(extensions: &[String], exclude_globs: &[String]) -> Result<Self> {
        let mut patterns: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        patterns.extend(exclude_globs.iter().cloned());
        Ok(Self {
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            exclude: build_globset(&patterns)?,
        })
    }

    pub fn from_config(config: &KnowledgeBaseConfig) -> Result<Self> {
        Self::new(&config.extensions, &config.exclude_globs)
    }

    fn has_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    /// Whether `path` (under `root`) names a document by extension, ignoring
    /// hidden and excluded locations.
    pub fn is_recognised(&self, root: &Path, path: &Path) -> bool {
        match self.visible_relative(root, path) {
            Some(_) => self.has_extension(path),
            None => false,
        }
    }

    /// Whether a filesystem event on `path` can matter to the index.
    ///
    /// Documents qualify, and so do directories (existing, or gone without
    /// an extension) since creating, moving or deleting one changes the
    /// documents below it. Hidden and excluded paths never do.
    pub fn admits_event(&self, root: &Path, path: &Path) -> bool {
        if self.visible_relative(root, path).is_none() {
            return false;
        }
        if self.has_extension(path) {
            return true;
        }
        match std::fs::symlink_metadata(path) {
            Ok(meta) => meta.is_dir(),
            Err(_) => path.extension().is_none(),
        }
    }

    /// `path` relative to `root`, unless it is outside, hidden or excluded.
    fn visible_relative<'a>(&self, root: &Path, path: &'a Path) -> Option<&'a Path> {
        let relative = path.strip_prefix(root).ok()?;
        if relative
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        {
            return None;
        }
        if self.exclude.is_match(relative) {
            return None;
        }
        Some(relative)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| anyhow::anyhow!("invalid exclude glob '{pattern}': {e}"))?;
        builder.add(glob);
    }
    Ok(builder
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build exclude globs: {e}"))?)
}

/// One recognised document seen by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub modified_at: DateTime<Utc>,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// Documents modified after `since` (all of them when `since` is none).
    pub changed: Vec<PathBuf>,
    /// Every recognised document under the root, sorted by path.
    pub present: Vec<ScannedFile>,
}

/// Walk `root` once and report recognised documents.
pub fn scan(root: &Path, since: Option<DateTime<Utc>>, options: &ScanOptions) -> Result<ScanOutcome> {
    path_guard::validate(root, false)?;

    let mut outcome = ScanOutcome::default();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        let path = entry.path();
        if entry.path_is_symlink() {
            if options.is_recognised(root, path) || entry.file_type().is_dir() {
                warn!(path = %path.display(), "skipping symbolic link");
            }
            continue;
        }
        if !entry.file_type().is_file() || !options.is_recognised(root, path) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping file without metadata");
                continue;
            }
        };
        let modified_at: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH));

        if since.map_or(true, |t| modified_at > t) {
            outcome.changed.push(path.to_path_buf());
        }
        outcome.present.push(ScannedFile {
            path: path.to_path_buf(),
            modified_at,
            size: metadata.len(),
        });
    }

    outcome.present.sort_by(|a, b| a.path.cmp(&b.path));
    outcome.changed.sort();
    Ok(outcome)
}

// ============ Debounce ============

/// Paths released by the debounce queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Released {
    pub paths: Vec<PathBuf>,
    /// Events were lost; the next pass must look at the whole corpus.
    pub full_rescan: bool,
}

impl Released {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && !self.full_rescan
    }
}

/// Bounded, coalescing debounce queue.
///
/// A path is released once `window` has elapsed since its most recent event.
/// Repeated events for a pending path restart its window. Holding more than
/// `capacity` distinct paths collapses the queue into a single full-rescan
/// marker. The marker's window starts at the overflow and is never restarted:
/// the rescan reads the whole corpus, so later events are already covered.
#[derive(Debug)]
pub struct DebounceQueue {
    window: Duration,
    capacity: usize,
    pending: HashMap<PathBuf, Instant>,
    rescan_at: Option<Instant>,
}

impl DebounceQueue {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            pending: HashMap::new(),
            rescan_at: None,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, path: PathBuf, now: Instant) {
        if self.rescan_at.is_some() {
            return;
        }
        if !self.pending.contains_key(&path) && self.pending.len() >= self.capacity {
            self.mark_overflow(now);
            return;
        }
        self.pending.insert(path, now);
    }

    /// Replace pending paths with a full-rescan marker.
    ///
    /// An already pending marker keeps its original deadline.
    pub fn mark_overflow(&mut self, now: Instant) {
        self.pending.clear();
        if self.rescan_at.is_none() {
            self.rescan_at = Some(now);
        }
    }

    /// Earliest instant at which something becomes ready.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.rescan_at
            .into_iter()
            .chain(self.pending.values().copied())
            .min()
            .map(|last| last + self.window)
    }

    /// Remove and return everything whose quiet window has elapsed.
    pub fn drain_ready(&mut self, now: Instant) -> Released {
        let window = self.window;
        let ready = |last: Instant| now.saturating_duration_since(last) >= window;

        let mut released = Released::default();
        if let Some(at) = self.rescan_at {
            if ready(at) {
                self.rescan_at = None;
                released.full_rescan = true;
            }
        }

        let mut paths: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, last)| ready(**last))
            .map(|(p, _)| p.clone())
            .collect();
        for p in &paths {
            self.pending.remove(p);
        }
        paths.sort();
        released.paths = paths;
        released
    }
}

// ============ Live watcher ============

/// How a released path is handled.
#[derive(Debug)]
enum EventPath {
    Document,
    Deleted,
    Directory,
    Ignored,
    Rejected(WeavrError),
}

fn classify(root: &Path, path: &Path, options: &ScanOptions) -> EventPath {
    if !path.starts_with(root) {
        return EventPath::Rejected(WeavrError::security(
            path,
            "path is outside the knowledge base root",
        ));
    }
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return EventPath::Deleted,
        Err(e) => return EventPath::Rejected(e.into()),
    };
    if meta.file_type().is_symlink() {
        return EventPath::Rejected(WeavrError::security(path, "symbolic links are not allowed"));
    }
    if meta.is_dir() {
        return match path_guard::validate(path, false) {
            Ok(()) => EventPath::Directory,
            Err(e) => EventPath::Rejected(e),
        };
    }
    if !options.is_recognised(root, path) {
        return EventPath::Ignored;
    }
    match path_guard::validate_document(root, path) {
        Ok(()) => EventPath::Document,
        Err(WeavrError::NotFound { .. }) => EventPath::Deleted,
        Err(e) => EventPath::Rejected(e),
    }
}

/// Live watcher over the knowledge base root.
///
/// Dropping the handle without calling [`stop`](Self::stop) cancels the
/// background task as well.
pub struct CorpusWatcher {
    root: PathBuf,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    _watcher: RecommendedWatcher,
}

impl CorpusWatcher {
    /// Start watching `root` recursively. Must be called inside a tokio runtime.
    pub fn start(
        kb: Arc<KnowledgeBase>,
        root: &Path,
        options: ScanOptions,
        config: &WatchConfig,
    ) -> Result<Self> {
        path_guard::validate(root, false)?;
        let root = root.to_path_buf();

        let (event_tx, event_rx) = mpsc::channel::<notify::Result<Event>>(config.queue_capacity);
        let overflow = Arc::new(Notify::new());
        let overflow_tx = overflow.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if event_tx.try_send(res).is_err() {
                overflow_tx.notify_one();
            }
        })
        .map_err(|e| anyhow::anyhow!("watcher init failed: {e}"))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| anyhow::anyhow!("failed to watch {}: {e}", root.display()))?;

        let cancel = CancellationToken::new();
        let queue = DebounceQueue::new(config.debounce(), config.queue_capacity);
        let task = tokio::spawn(run_loop(
            kb,
            root.clone(),
            options,
            queue,
            event_rx,
            overflow,
            cancel.clone(),
        ));

        info!(root = %root.display(), "watching knowledge base");
        Ok(Self {
            root,
            cancel,
            task: Some(task),
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stop the watcher and wait for any in-flight pass to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "watcher task ended abnormally");
            }
        }
        info!(root = %self.root.display(), "stopped watching");
    }
}

impl Drop for CorpusWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_loop(
    kb: Arc<KnowledgeBase>,
    root: PathBuf,
    options: ScanOptions,
    mut queue: DebounceQueue,
    mut event_rx: mpsc::Receiver<notify::Result<Event>>,
    overflow: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        let deadline = queue.next_deadline();

        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = event_rx.recv() => match maybe {
                Some(Ok(event)) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        continue;
                    }
                    enqueue(&mut queue, &root, &options, event.paths, Instant::now());
                }
                Some(Err(e)) => warn!(error = %e, "filesystem watch error"),
                None => break,
            },
            _ = overflow.notified() => {
                warn!("event channel full, scheduling full rescan");
                queue.mark_overflow(Instant::now());
            }
            _ = sleep_until(deadline), if deadline.is_some() => {
                let released = queue.drain_ready(Instant::now());
                if !released.is_empty() {
                    handle_release(&kb, &root, &options, released).await;
                }
            }
        }
    }
}

/// Queue the event paths that can affect the index; noise such as editor
/// state under hidden directories never takes up queue capacity.
fn enqueue(
    queue: &mut DebounceQueue,
    root: &Path,
    options: &ScanOptions,
    paths: Vec<PathBuf>,
    now: Instant,
) {
    for path in paths {
        if options.admits_event(root, &path) {
            queue.push(path, now);
        } else {
            debug!(path = %path.display(), "ignoring event");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

async fn handle_release(kb: &KnowledgeBase, root: &Path, options: &ScanOptions, released: Released) {
    let mut hints = Vec::new();
    let mut structural = false;

    for path in released.paths {
        match classify(root, &path, options) {
            EventPath::Document => hints.push(path),
            EventPath::Deleted | EventPath::Directory => structural = true,
            EventPath::Ignored => {}
            EventPath::Rejected(e) => warn!(path = %path.display(), error = %e, "ignoring change"),
        }
    }

    let mode = if released.full_rescan {
        PassMode::Full
    } else if !hints.is_empty() {
        PassMode::Paths(hints)
    } else if structural {
        PassMode::Incremental
    } else {
        return;
    };

    debug!(?mode, "change detected");
    match kb.index_pass(mode).await {
        Ok(report) => info!(
            indexed = report.indexed,
            removed = report.removed,
            failed = report.failed,
            "watch pass complete"
        ),
        Err(e) => warn!(error = %e, "watch pass failed"),
    }
}
