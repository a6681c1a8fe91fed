//! The tool dispatcher: validates caller requests, drives the pipeline,
//! stages results, and shapes the response envelopes consumed by the
//! JSON-RPC front-end.

use crate::config::{Config, ConfidenceMode};
use crate::confidence::{self, Confidence, ScoreInput};
use crate::diff::DiffStats;
use crate::error::{FileError, MorfxError, Result};
use crate::lang::{LanguageRegistry, PatternCache};
use crate::matcher::{CodeMatcher, NodeMatch};
use crate::pipeline::{
    CancellationToken, FileChangeSet, FileProcessor, ProcessRequest, WorkerPool,
};
use crate::query::{QueryExpr, parse};
use crate::rewrite::{Change, Operation};
use crate::scanner::Scanner;
use crate::session::{
    ApplyRecord, ChangeOperation, MemoryStore, SessionRecord, SessionStore, StagedChange,
};
use crate::transaction::{CommitReport, ExpirySweeper, TransactionManager};
use crate::fsio;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A query in either surface form: free text or the structured tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum QueryInput {
    Text(String),
    Structured(QueryExpr),
}

impl QueryInput {
    /// Compiles the input into the structured expression.
    pub fn compile(&self) -> Result<QueryExpr> {
        match self {
            QueryInput::Text(text) => parse(text),
            QueryInput::Structured(expr) => Ok(expr.clone()),
        }
    }

    /// Canonical text used as `originating_query` on stages.
    pub fn canonical(&self) -> Result<String> {
        Ok(self.compile()?.canonical())
    }
}

/// Arguments for the `query` operation.
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub language: String,
    pub source: String,
    pub query: QueryInput,
}

/// Result of a `query`: matches plus an informational risk estimate.
#[derive(Debug, Serialize)]
pub struct QueryResult {
    pub matches: Vec<NodeMatch>,
    pub confidence: Confidence,
}

/// Arguments for a `transform` (replace/delete/insert/append) operation.
#[derive(Debug, Deserialize)]
pub struct TransformRequest {
    pub operation: Operation,
    pub query: QueryInput,
    #[serde(default)]
    pub replacement: Option<String>,
    /// Existing session to charge the work to; a fresh one is opened
    /// otherwise.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Inline-source mode: language + source, preview only.
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// File mode: scan this root.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Compute diffs but stage nothing.
    #[serde(default)]
    pub dry_run: bool,
    /// Turn an empty match set into an error.
    #[serde(default)]
    pub fail_if_no_match: bool,
    #[serde(default)]
    pub auto_apply_threshold: Option<f64>,
    /// Per-batch deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Per-file slice of a batch report.
#[derive(Debug, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub language: String,
    pub match_count: usize,
    pub changes: Vec<Change>,
    pub confidence: Confidence,
    pub diff: String,
    pub validation_failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged_id: Option<String>,
}

/// The full result of a `transform`.
#[derive(Debug, Serialize)]
pub struct BatchReport {
    pub session_id: String,
    pub files: Vec<FileReport>,
    pub errors: Vec<FileError>,
    pub staged_ids: Vec<String>,
    /// Line-change totals across every file in the batch.
    pub stats: DiffStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    pub auto_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitReport>,
    pub cancelled: bool,
}

/// Arguments for `apply`: one stage, or a whole session.
#[derive(Debug, Deserialize)]
pub struct ApplyRequest {
    #[serde(default)]
    pub stage_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub root: PathBuf,
}

/// Arguments for `revert`.
#[derive(Debug, Deserialize)]
pub struct RevertRequest {
    pub apply_id: String,
    pub root: PathBuf,
}

/// `{content, isError}` envelope returned to the transport layer.
#[derive(Debug, Serialize)]
pub struct ToolResponse {
    pub content: Vec<serde_json::Value>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl ToolResponse {
    fn ok<T: Serialize>(value: &T) -> Self {
        Self {
            content: vec![serde_json::to_value(value).unwrap_or(serde_json::Value::Null)],
            is_error: false,
        }
    }

    fn err(err: &MorfxError) -> Self {
        Self {
            content: vec![json!({
                "kind": err.kind(),
                "message": err.to_string(),
            })],
            is_error: true,
        }
    }
}

/// Tool names accepted by [`Dispatcher::dispatch`].
pub const TOOL_NAMES: &[&str] = &[
    "query",
    "replace",
    "delete",
    "insert_before",
    "insert_after",
    "append_to_body",
    "apply",
    "revert",
];

/// Maps caller requests to pipeline calls and shapes the result envelope.
pub struct Dispatcher {
    config: Arc<Config>,
    registry: Arc<LanguageRegistry>,
    cache: Arc<PatternCache>,
    store: Arc<dyn SessionStore>,
    processor: FileProcessor,
    transactions: TransactionManager,
    _sweeper: ExpirySweeper,
}

impl Dispatcher {
    /// Builds a dispatcher over an explicit store and configuration. The
    /// worker pool, pattern cache, and expiry sweeper are created here and
    /// live for the dispatcher's lifetime.
    pub fn new(config: Config, store: Arc<dyn SessionStore>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(LanguageRegistry::new());
        let cache = Arc::new(PatternCache::new());
        let pool = Arc::new(WorkerPool::new(config.worker_count()));
        let processor = FileProcessor::new(
            Arc::clone(&pool),
            Arc::clone(&registry),
            Arc::clone(&cache),
        );
        let transactions = TransactionManager::new(Arc::clone(&store), Arc::clone(&config));
        let sweeper = ExpirySweeper::start(Arc::clone(&store), config.staging_ttl());
        info!(workers = pool.workers(), "dispatcher initialized");
        Self {
            config,
            registry,
            cache,
            store,
            processor,
            transactions,
            _sweeper: sweeper,
        }
    }

    /// Dispatcher over the in-memory store, for embedding and tests.
    pub fn in_memory(config: Config) -> Self {
        Self::new(config, Arc::new(MemoryStore::new()))
    }

    /// Opens a session on behalf of a caller.
    pub fn open_session(&self, client_info: &str) -> Result<SessionRecord> {
        self.store.create_session(client_info)
    }

    /// Closes a session.
    pub fn close_session(&self, session_id: &str) -> Result<()> {
        self.store.end_session(session_id)
    }

    /// Locates nodes in inline source. Never stages anything.
    pub fn query(&self, request: &QueryRequest) -> Result<QueryResult> {
        let provider = self
            .registry
            .by_name(&request.language)
            .ok_or_else(|| MorfxError::UnsupportedLanguage(request.language.clone()))?;
        let expr = request.query.compile()?;

        let matcher = CodeMatcher::new(&self.cache);
        let path = PathBuf::from("<inline>");
        let matches = matcher.find_matches(&request.source, &path, provider, &expr)?;

        let confidence = confidence::score(&ScoreInput {
            path: &path,
            match_count: matches.len(),
            any_exported: matches
                .iter()
                .any(|m| m.attributes.get("exported").map(String::as_str) == Some("true")),
            all_nested: !matches.is_empty() && matches.iter().all(|m| m.nested),
            original_bytes: matches.iter().map(|m| m.content.len()).sum(),
            replacement_bytes: matches.iter().map(|m| m.content.len()).sum(),
            syntax_check: None,
        });

        Ok(QueryResult {
            matches,
            confidence,
        })
    }

    /// Runs a transform over inline source or scanned files, stages the
    /// results, and auto-applies when the confidence gate clears.
    pub fn transform(&self, request: &TransformRequest) -> Result<BatchReport> {
        if request.operation.needs_replacement() && request.replacement.is_none() {
            return Err(MorfxError::BadQuery(format!(
                "operation '{}' requires replacement text",
                request.operation.as_str()
            )));
        }

        let session = match &request.session_id {
            Some(id) => self
                .store
                .fetch_session(id)?
                .ok_or_else(|| MorfxError::StoreFailed(format!("unknown session {id}")))?,
            None => self.store.create_session("morfx")?,
        };

        let expr = Arc::new(request.query.compile()?);
        let process = ProcessRequest {
            expr,
            operation: request.operation,
            replacement: request.replacement.as_ref().map(|r| Arc::new(r.clone())),
            token: CancellationToken::new(),
            deadline: request.timeout_ms.map(Duration::from_millis),
        };

        if let Some(source) = &request.source {
            return self.transform_inline(request, &session, source, &process);
        }

        let root = request
            .root
            .as_ref()
            .ok_or_else(|| MorfxError::InvalidConfig("transform needs source or root".into()))?;
        self.transform_files(request, &session, root, &process)
    }

    fn transform_inline(
        &self,
        request: &TransformRequest,
        session: &SessionRecord,
        source: &str,
        process: &ProcessRequest,
    ) -> Result<BatchReport> {
        let language = request
            .language
            .as_ref()
            .ok_or_else(|| MorfxError::InvalidConfig("inline transform needs a language".into()))?;
        let provider = self
            .registry
            .by_name(language)
            .ok_or_else(|| MorfxError::UnsupportedLanguage(language.clone()))?;

        let path = PathBuf::from("<inline>");
        let set = self
            .processor
            .process_source(source, &path, provider, process)?;
        if request.fail_if_no_match && set.matches.is_empty() {
            return Err(MorfxError::NoMatches);
        }

        let confidence = Some(set.confidence.clone());
        let stats = set.stats.clone();
        Ok(BatchReport {
            session_id: session.id.clone(),
            files: vec![file_report(&set, None)],
            errors: Vec::new(),
            staged_ids: Vec::new(),
            stats,
            confidence,
            auto_applied: false,
            commit: None,
            cancelled: false,
        })
    }

    fn transform_files(
        &self,
        request: &TransformRequest,
        session: &SessionRecord,
        root: &Path,
        process: &ProcessRequest,
    ) -> Result<BatchReport> {
        let paths = self.scan_targets(request, root)?;
        self.enforce_batch_caps(&paths)?;

        let outcome = self.processor.process_files(&paths, process);
        let total_matches: usize = outcome.files.iter().map(|f| f.matches.len()).sum();
        if request.fail_if_no_match && total_matches == 0 {
            return Err(MorfxError::NoMatches);
        }

        let mut files = Vec::with_capacity(outcome.files.len());
        let mut staged_ids = Vec::new();
        let mut staged_records = Vec::new();
        let mut errors = outcome.errors;

        let can_stage = request.operation.is_mutating() && !request.dry_run && !outcome.cancelled;
        if can_stage {
            let to_stage = outcome
                .files
                .iter()
                .filter(|f| f.is_modified() && !f.validation_failed)
                .count();
            let existing = self.store.count_stages(&session.id)?;
            if existing + to_stage > self.config.max_stages_per_session {
                return Err(MorfxError::CapExceeded(format!(
                    "session {} would exceed {} stages",
                    session.id, self.config.max_stages_per_session
                )));
            }
        }

        for set in &outcome.files {
            let staged_id = if can_stage && set.is_modified() && !set.validation_failed {
                match self.stage_change_set(root, &session.id, request, set) {
                    Ok(record) => {
                        staged_ids.push(record.id.clone());
                        staged_records.push(record.clone());
                        Some(record.id)
                    }
                    Err(err) => {
                        errors.push(FileError::new(&set.path, &err));
                        None
                    }
                }
            } else {
                None
            };
            files.push(file_report(set, staged_id));
        }

        let confidence = Confidence::aggregate(outcome.files.iter().map(|f| &f.confidence));
        let mut stats = DiffStats::default();
        for set in &outcome.files {
            stats.absorb(&set.stats);
        }

        let mut auto_applied = false;
        let mut commit = None;
        if !staged_records.is_empty()
            && self.should_auto_apply(request, &outcome.files, confidence.as_ref())
        {
            debug!(session = %session.id, stages = staged_records.len(), "auto-applying batch");
            let report = self.transactions.commit_stages(root, &staged_records);
            auto_applied = report.is_clean() && !report.applied.is_empty();
            commit = Some(report);
        }

        Ok(BatchReport {
            session_id: session.id.clone(),
            files,
            errors,
            staged_ids,
            stats,
            confidence,
            auto_applied,
            commit,
            cancelled: outcome.cancelled,
        })
    }

    fn scan_targets(&self, request: &TransformRequest, root: &Path) -> Result<Vec<PathBuf>> {
        let mut scanner = Scanner::new().max_file_size(self.config.safety.max_file_size);
        for pattern in &request.include {
            scanner = scanner.include(pattern.clone());
        }
        for pattern in &request.exclude {
            scanner = scanner.exclude(pattern.clone());
        }

        match &request.language {
            Some(language) => {
                let provider = self
                    .registry
                    .by_name(language)
                    .ok_or_else(|| MorfxError::UnsupportedLanguage(language.clone()))?;
                scanner = scanner.extensions(provider.extensions().iter().copied());
                let (globs, _) = provider.default_ignore_patterns();
                for glob in globs {
                    scanner = scanner.exclude(*glob);
                }
            }
            None => {
                for provider in self.registry.all() {
                    scanner = scanner.extensions(provider.extensions().iter().copied());
                    let (globs, _) = provider.default_ignore_patterns();
                    for glob in globs {
                        scanner = scanner.exclude(*glob);
                    }
                }
            }
        }

        scanner.scan(root)
    }

    fn enforce_batch_caps(&self, paths: &[PathBuf]) -> Result<()> {
        let max_files = self.config.safety.max_files;
        if max_files > 0 && paths.len() > max_files {
            return Err(MorfxError::CapExceeded(format!(
                "batch touches {} files, limit is {max_files}",
                paths.len()
            )));
        }
        let max_total = self.config.safety.max_total_size;
        if max_total > 0 {
            let total: u64 = paths
                .iter()
                .filter_map(|p| std::fs::metadata(p).ok())
                .map(|m| m.len())
                .sum();
            if total > max_total {
                return Err(MorfxError::CapExceeded(format!(
                    "batch reads {total} bytes, limit is {max_total}"
                )));
            }
        }
        Ok(())
    }

    fn stage_change_set(
        &self,
        root: &Path,
        session_id: &str,
        request: &TransformRequest,
        set: &FileChangeSet,
    ) -> Result<crate::session::StageRecord> {
        let change = StagedChange {
            path: set.path.clone(),
            original_content: set.original.clone(),
            modified_content: set.modified.clone(),
            original_digest: fsio::sha256_hex(set.original.as_bytes()),
            modified_digest: fsio::sha256_hex(set.modified.as_bytes()),
            size_delta: set.modified.len() as i64 - set.original.len() as i64,
            timestamp: Utc::now(),
            operation: ChangeOperation::Modify,
            originating_query: request.query.canonical()?,
        };
        self.transactions.stage(
            root,
            session_id,
            change,
            set.confidence.clone(),
            set.rewrites.clone(),
        )
    }

    fn should_auto_apply(
        &self,
        request: &TransformRequest,
        files: &[FileChangeSet],
        aggregate: Option<&Confidence>,
    ) -> bool {
        if !self.config.auto_apply_enabled {
            return false;
        }
        // A broken post-edit syntax check blocks auto-apply outright.
        if files.iter().any(|f| f.confidence.blocks_auto_apply()) {
            return false;
        }
        let global_threshold = Config::clamp_threshold(
            request
                .auto_apply_threshold
                .unwrap_or(self.config.auto_apply_threshold),
        );
        let per_file_ok = files
            .iter()
            .filter(|f| f.is_modified())
            .all(|f| f.confidence.score >= self.config.safety.per_file_threshold);
        let global_ok = aggregate.is_some_and(|c| c.score >= global_threshold);
        match self.config.safety.confidence_mode {
            ConfidenceMode::PerFile => per_file_ok,
            ConfidenceMode::Global => global_ok,
            ConfidenceMode::Both => per_file_ok && global_ok,
        }
    }

    /// Commits staged changes by stage id or whole session.
    pub fn apply(&self, request: &ApplyRequest) -> Result<CommitReport> {
        let session_id = match (&request.stage_id, &request.session_id) {
            (Some(stage_id), _) => {
                let stage = self
                    .store
                    .fetch_stage(stage_id)?
                    .ok_or_else(|| MorfxError::StoreFailed(format!("unknown stage {stage_id}")))?;
                self.enforce_apply_cap(&stage.session_id, 1)?;
                return Ok(self
                    .transactions
                    .commit_stages(&request.root, std::slice::from_ref(&stage)));
            }
            (None, Some(session_id)) => session_id.clone(),
            (None, None) => {
                return Err(MorfxError::InvalidConfig(
                    "apply needs stage_id or session_id".into(),
                ));
            }
        };

        let pending = self
            .store
            .session_stages(&session_id)?
            .into_iter()
            .filter(|s| s.status == crate::session::StageStatus::Pending)
            .count();
        self.enforce_apply_cap(&session_id, pending)?;
        self.transactions.commit_session(&request.root, &session_id)
    }

    fn enforce_apply_cap(&self, session_id: &str, new_applies: usize) -> Result<()> {
        let existing = self.store.count_applies(session_id)?;
        if existing + new_applies > self.config.max_applies_per_session {
            return Err(MorfxError::CapExceeded(format!(
                "session {session_id} would exceed {} applies",
                self.config.max_applies_per_session
            )));
        }
        Ok(())
    }

    /// Restores a committed change and records the revert.
    pub fn revert(&self, request: &RevertRequest) -> Result<ApplyRecord> {
        self.transactions.revert(&request.root, &request.apply_id)
    }

    /// Entry point for the external caller protocol: dispatches a tool call
    /// by name with JSON arguments and returns the result envelope.
    pub fn dispatch(&self, name: &str, arguments: serde_json::Value) -> ToolResponse {
        match self.dispatch_inner(name, arguments) {
            Ok(response) => response,
            Err(err) => {
                if !matches!(err, MorfxError::Cancelled) {
                    warn!(tool = name, error = %err, "tool call failed");
                }
                ToolResponse::err(&err)
            }
        }
    }

    fn dispatch_inner(&self, name: &str, mut arguments: serde_json::Value) -> Result<ToolResponse> {
        match name {
            "query" => {
                let request: QueryRequest = serde_json::from_value(arguments)?;
                Ok(ToolResponse::ok(&self.query(&request)?))
            }
            "replace" | "delete" | "insert_before" | "insert_after" | "append_to_body" => {
                if let Some(map) = arguments.as_object_mut() {
                    map.insert("operation".to_string(), json!(name));
                }
                let request: TransformRequest = serde_json::from_value(arguments)?;
                Ok(ToolResponse::ok(&self.transform(&request)?))
            }
            "apply" => {
                let request: ApplyRequest = serde_json::from_value(arguments)?;
                Ok(ToolResponse::ok(&self.apply(&request)?))
            }
            "revert" => {
                let request: RevertRequest = serde_json::from_value(arguments)?;
                Ok(ToolResponse::ok(&self.revert(&request)?))
            }
            other => Err(MorfxError::BadQuery(format!("unknown tool '{other}'"))),
        }
    }

    /// The session store, for embedders that need direct audit access.
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// The engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

fn file_report(set: &FileChangeSet, staged_id: Option<String>) -> FileReport {
    FileReport {
        path: set.path.clone(),
        language: set.language.clone(),
        match_count: set.matches.len(),
        changes: set.changes.clone(),
        confidence: set.confidence.clone(),
        diff: set.diff.clone(),
        validation_failed: set.validation_failed,
        staged_id,
    }
}
