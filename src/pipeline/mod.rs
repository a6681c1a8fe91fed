//! Concurrent per-file processing: parse, match, rewrite, and score, fanned
//! out over a fixed worker pool.
//!
//! Workers own their file end to end and emit a finished result onto a
//! channel; nothing mutable is shared between them. The aggregate is keyed
//! by path, so the batch outcome is deterministic whatever the completion
//! order was.

use crate::confidence::{self, Confidence, ScoreInput};
use crate::diff::{DiffPreview, DiffStats};
use crate::error::{FileError, MorfxError, Result};
use crate::lang::{LanguageProvider, LanguageRegistry, PatternCache};
use crate::matcher::{CodeMatcher, NodeMatch};
use crate::query::QueryExpr;
use crate::rewrite::{Change, Operation, Rewrite, RewriteEngine, apply_rewrites};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cooperative cancellation handle observed between files and between
/// rewrite steps.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation to every observer.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// True once cancellation was signalled.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool over a bounded job channel, created once at
/// dispatcher init and reused across requests.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` threads pulling from a bounded queue.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = bounded(workers * 2);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("morfx-worker-{index}"))
                .spawn(move || {
                    for job in receiver.iter() {
                        job();
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        Self {
            sender: Some(sender),
            handles,
        }
    }

    /// Queues a job, blocking when the queue is full.
    pub fn execute(&self, job: Job) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| MorfxError::Cancelled)?
            .send(job)
            .map_err(|_| MorfxError::Cancelled)
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets workers drain and exit.
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Everything a worker needs to process one file.
#[derive(Clone)]
pub struct ProcessRequest {
    pub expr: Arc<QueryExpr>,
    pub operation: Operation,
    pub replacement: Option<Arc<String>>,
    pub token: CancellationToken,
    /// Per-batch deadline, measured from submission.
    pub deadline: Option<Duration>,
}

/// The planned change set for one file. `modified == original` means the
/// operation had nothing to do.
#[derive(Debug, Clone)]
pub struct FileChangeSet {
    pub path: PathBuf,
    pub language: String,
    pub matches: Vec<NodeMatch>,
    pub rewrites: Vec<Rewrite>,
    pub changes: Vec<Change>,
    pub original: String,
    pub modified: String,
    pub diff: String,
    pub stats: DiffStats,
    pub confidence: Confidence,
    pub validation_failed: bool,
}

impl FileChangeSet {
    /// True when the file content would change.
    pub fn is_modified(&self) -> bool {
        self.original != self.modified
    }
}

/// Batch result: per-file change sets plus isolated per-file failures.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub files: Vec<FileChangeSet>,
    pub errors: Vec<FileError>,
    pub cancelled: bool,
}

/// Fans per-file work out across the worker pool.
pub struct FileProcessor {
    pool: Arc<WorkerPool>,
    registry: Arc<LanguageRegistry>,
    cache: Arc<PatternCache>,
}

impl FileProcessor {
    /// Creates a processor over shared infrastructure.
    pub fn new(
        pool: Arc<WorkerPool>,
        registry: Arc<LanguageRegistry>,
        cache: Arc<PatternCache>,
    ) -> Self {
        Self {
            pool,
            registry,
            cache,
        }
    }

    /// Processes `paths` concurrently and returns the deterministic,
    /// path-ordered outcome. A failure in one file never aborts the others.
    pub fn process_files(&self, paths: &[PathBuf], request: &ProcessRequest) -> BatchOutcome {
        let started = Instant::now();
        let (result_tx, result_rx) = unbounded::<(PathBuf, Result<FileChangeSet>)>();

        let mut submitted = 0usize;
        for path in paths {
            if request.token.is_cancelled() {
                break;
            }
            let job = self.file_job(path.clone(), request.clone(), result_tx.clone());
            if self.pool.execute(job).is_err() {
                break;
            }
            submitted += 1;
        }
        drop(result_tx);

        let mut outcome = BatchOutcome::default();
        let mut received = 0usize;
        while received < submitted {
            let next = match request.deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        // Deadline hit: cancel and keep draining; workers
                        // bail out quickly once the token flips.
                        request.token.cancel();
                        result_rx.recv().ok()
                    } else {
                        match result_rx.recv_timeout(remaining) {
                            Ok(item) => Some(item),
                            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                                request.token.cancel();
                                continue;
                            }
                            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => None,
                        }
                    }
                }
                None => result_rx.recv().ok(),
            };
            let Some((path, result)) = next else {
                break;
            };
            received += 1;
            match result {
                Ok(set) => outcome.files.push(set),
                Err(MorfxError::Cancelled) => outcome.cancelled = true,
                Err(err) => outcome.errors.push(FileError::new(&path, &err)),
            }
        }

        outcome.cancelled |= request.token.is_cancelled();
        outcome.files.sort_by(|a, b| a.path.cmp(&b.path));
        outcome.errors.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(
            files = outcome.files.len(),
            errors = outcome.errors.len(),
            cancelled = outcome.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch processed"
        );
        outcome
    }

    fn file_job(
        &self,
        path: PathBuf,
        request: ProcessRequest,
        results: Sender<(PathBuf, Result<FileChangeSet>)>,
    ) -> Job {
        let registry = Arc::clone(&self.registry);
        let cache = Arc::clone(&self.cache);
        Box::new(move || {
            let result = process_one(&registry, &cache, &path, &request);
            if results.send((path, result)).is_err() {
                warn!("batch collector dropped before worker finished");
            }
        })
    }

    /// Processes in-memory source on the caller's thread (used for the
    /// source-based `query` and preview operations).
    pub fn process_source(
        &self,
        source: &str,
        path: &Path,
        provider: &dyn LanguageProvider,
        request: &ProcessRequest,
    ) -> Result<FileChangeSet> {
        transform_source(&self.cache, source, path, provider, request)
    }
}

fn process_one(
    registry: &LanguageRegistry,
    cache: &PatternCache,
    path: &Path,
    request: &ProcessRequest,
) -> Result<FileChangeSet> {
    if request.token.is_cancelled() {
        return Err(MorfxError::Cancelled);
    }
    let source = std::fs::read_to_string(path)?;
    let provider = registry.detect(path).ok_or_else(|| {
        MorfxError::UnsupportedLanguage(
            path.extension()
                .and_then(|e| e.to_str())
                .unwrap_or("unknown")
                .to_string(),
        )
    })?;
    transform_source(cache, &source, path, provider, request)
}

fn transform_source(
    cache: &PatternCache,
    source: &str,
    path: &Path,
    provider: &dyn LanguageProvider,
    request: &ProcessRequest,
) -> Result<FileChangeSet> {
    let matcher = CodeMatcher::new(cache);
    let matches = matcher.find_matches(source, path, provider, &request.expr)?;

    if request.token.is_cancelled() {
        return Err(MorfxError::Cancelled);
    }

    let engine = RewriteEngine::new(provider);
    let (rewrites, modified, changes) = if request.operation.is_mutating() && !matches.is_empty()
    {
        let rewrites = engine.plan(
            source,
            path,
            &matches,
            request.operation,
            request.replacement.as_deref().map(String::as_str),
        )?;
        let (modified, changes) = apply_rewrites(source, path, &rewrites)?;
        (rewrites, modified, changes)
    } else {
        (Vec::new(), source.to_string(), Vec::new())
    };

    let mut validation_failed = false;
    let syntax_check = if modified != source {
        match engine.validate(&modified, path) {
            Ok(()) => Some(true),
            Err(MorfxError::ValidationFailed { .. }) => {
                validation_failed = true;
                Some(false)
            }
            Err(err) => return Err(err),
        }
    } else {
        None
    };

    let mut original_bytes: usize = changes.iter().map(|c| c.original.len()).sum();
    if original_bytes == 0 && !matches.is_empty() {
        // Pure insertions: size the edit against the anchor nodes.
        original_bytes = matches.iter().map(|m| m.content.len()).sum();
    }
    let replacement_bytes: usize = changes.iter().map(|c| c.replacement.len()).sum();
    let confidence = confidence::score(&ScoreInput {
        path,
        match_count: matches.len(),
        any_exported: matches
            .iter()
            .any(|m| m.attributes.get("exported").map(String::as_str) == Some("true")),
        all_nested: !matches.is_empty() && matches.iter().all(|m| m.nested),
        original_bytes,
        replacement_bytes,
        syntax_check,
    });

    let preview = DiffPreview::new(source, &modified, &rewrites, path, 3);
    let stats = preview.stats();
    let diff = preview.unified();

    Ok(FileChangeSet {
        path: path.to_path_buf(),
        language: provider.canonical_name().to_string(),
        matches,
        rewrites,
        changes,
        original: source.to_string(),
        modified,
        diff,
        stats,
        confidence,
        validation_failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parse;
    use std::fs;
    use tempfile::TempDir;

    fn processor() -> FileProcessor {
        FileProcessor::new(
            Arc::new(WorkerPool::new(4)),
            Arc::new(LanguageRegistry::new()),
            Arc::new(PatternCache::new()),
        )
    }

    fn request(query: &str, operation: Operation, replacement: Option<&str>) -> ProcessRequest {
        ProcessRequest {
            expr: Arc::new(parse(query).unwrap()),
            operation,
            replacement: replacement.map(|r| Arc::new(r.to_string())),
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    fn write_go_files(dir: &Path, count: usize) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for i in 0..count {
            let path = dir.join(format!("f{i}.go"));
            fs::write(
                &path,
                format!("package p\n\nfunc Get{i}() int {{ return {i} }}\n"),
            )
            .unwrap();
            paths.push(path);
        }
        paths
    }

    #[test]
    fn test_batch_is_deterministic_and_path_ordered() {
        let dir = TempDir::new().unwrap();
        let paths = write_go_files(dir.path(), 8);
        let processor = processor();
        let request = request("func:Get*", Operation::Replace, Some("func Got() int { return 0 }"));

        let outcome = processor.process_files(&paths, &request);
        assert!(outcome.errors.is_empty());
        assert!(!outcome.cancelled);
        assert_eq!(outcome.files.len(), 8);
        for pair in outcome.files.windows(2) {
            assert!(pair[0].path < pair[1].path);
        }
        assert!(outcome.files.iter().all(|f| f.is_modified()));
        assert!(outcome.files.iter().all(|f| !f.diff.is_empty()));
    }

    #[test]
    fn test_per_file_isolation() {
        let dir = TempDir::new().unwrap();
        let mut paths = write_go_files(dir.path(), 2);
        // An unreadable path is reported, not fatal.
        paths.push(dir.path().join("missing.go"));

        let processor = processor();
        let request = request("func:Get*", Operation::Delete, None);
        let outcome = processor.process_files(&paths, &request);

        assert_eq!(outcome.files.len(), 2);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].path.ends_with("missing.go"));
    }

    #[test]
    fn test_unsupported_language_is_isolated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.csv");
        fs::write(&path, "a,b\n").unwrap();

        let processor = processor();
        let request = request("func:*", Operation::Get, None);
        let outcome = processor.process_files(std::slice::from_ref(&path), &request);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(
            outcome.errors[0].kind,
            crate::error::ErrorKind::UnsupportedLanguage
        );
    }

    #[test]
    fn test_get_operation_stages_nothing() {
        let dir = TempDir::new().unwrap();
        let paths = write_go_files(dir.path(), 1);
        let processor = processor();
        let request = request("func:Get*", Operation::Get, None);

        let outcome = processor.process_files(&paths, &request);
        let file = &outcome.files[0];
        assert_eq!(file.matches.len(), 1);
        assert!(!file.is_modified());
        assert!(file.diff.is_empty());
        assert!(file.rewrites.is_empty());
    }

    #[test]
    fn test_cancellation_before_submission() {
        let dir = TempDir::new().unwrap();
        let paths = write_go_files(dir.path(), 4);
        let processor = processor();
        let request = request("func:Get*", Operation::Get, None);
        request.token.cancel();

        let outcome = processor.process_files(&paths, &request);
        assert!(outcome.cancelled);
        assert!(outcome.files.is_empty());
    }

    #[test]
    fn test_validation_failure_is_flagged_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.go");
        fs::write(&path, "package p\n\nfunc F() int { return 1 }\n").unwrap();

        let processor = processor();
        // Replacement text that breaks the syntax.
        let request = request("func:F", Operation::Replace, Some("func F( {"));
        let outcome = processor.process_files(std::slice::from_ref(&path), &request);

        assert!(outcome.errors.is_empty());
        let file = &outcome.files[0];
        assert!(file.validation_failed);
        assert!(file.confidence.blocks_auto_apply());
    }

    #[test]
    fn test_pool_is_reusable_across_batches() {
        let dir = TempDir::new().unwrap();
        let paths = write_go_files(dir.path(), 3);
        let processor = processor();

        for _ in 0..3 {
            let request = request("func:Get*", Operation::Get, None);
            let outcome = processor.process_files(&paths, &request);
            assert_eq!(outcome.files.len(), 3);
        }
        assert_eq!(processor.pool.workers(), 4);
    }
}
