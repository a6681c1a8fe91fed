//! # Morfx
//!
//! A deterministic, AST-based code transformation engine. A small query
//! language selects syntactic constructs (functions, methods, structs,
//! calls, imports, ...) across multiple languages; structured operations
//! (get, replace, delete, insert-before, insert-after, append-to-body)
//! turn matches into byte-accurate edits; and a staging/commit/rollback
//! substrate makes batch edits atomic across many files with optimistic
//! concurrency control.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use morfx::prelude::*;
//!
//! let dispatcher = Dispatcher::in_memory(Config::default());
//!
//! // Find every Get* function in a Go source snippet.
//! let result = dispatcher.query(&QueryRequest {
//!     language: "go".into(),
//!     source: "package p\nfunc GetUser() {}\n".into(),
//!     query: QueryInput::Text("func:Get*".into()),
//! })?;
//!
//! for m in &result.matches {
//!     println!("{:?} {:?} at bytes {}..{}", m.kind, m.name, m.start_byte, m.end_byte);
//! }
//! # Ok::<(), morfx::error::MorfxError>(())
//! ```
//!
//! ## Batch transforms
//!
//! ```rust,no_run
//! use morfx::prelude::*;
//!
//! let dispatcher = Dispatcher::in_memory(Config::default());
//! let report = dispatcher.transform(&TransformRequest {
//!     operation: Operation::Delete,
//!     query: QueryInput::Text("func:Debug*".into()),
//!     replacement: None,
//!     session_id: None,
//!     language: Some("go".into()),
//!     source: None,
//!     root: Some("./service".into()),
//!     include: vec![],
//!     exclude: vec!["*_test.go".into()],
//!     dry_run: false,
//!     fail_if_no_match: false,
//!     auto_apply_threshold: None,
//!     timeout_ms: None,
//! })?;
//!
//! println!("{} files staged", report.staged_ids.len());
//! // Later: dispatcher.apply(...) commits, dispatcher.revert(...) undoes.
//! # Ok::<(), morfx::error::MorfxError>(())
//! ```
//!
//! ## Supported languages
//!
//! Go, Rust, TypeScript/JavaScript, and Python ship in the box; any other
//! language plugs in through the [`lang::LanguageProvider`] trait.

pub mod bytemap;
pub mod confidence;
pub mod config;
pub mod diff;
pub mod dispatch;
pub mod error;
pub mod fsio;
pub mod lang;
pub mod matcher;
pub mod pipeline;
pub mod query;
pub mod rewrite;
pub mod scanner;
pub mod session;
pub mod transaction;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::bytemap::ByteMap;
    pub use crate::confidence::{Confidence, ConfidenceLevel, Factor};
    pub use crate::config::{Config, ConfidenceMode, SafetyConfig};
    pub use crate::diff::{
        DiffPreview, DiffStats, Hunk, LineEdit, colorized_diff, unified_diff,
    };
    pub use crate::dispatch::{
        ApplyRequest, BatchReport, Dispatcher, FileReport, QueryInput, QueryRequest, QueryResult,
        RevertRequest, TOOL_NAMES, ToolResponse, TransformRequest,
    };
    pub use crate::error::{ErrorKind, FileError, MorfxError, Result};
    pub use crate::lang::{
        Diagnostic, Go, LanguageProvider, LanguageRegistry, PatternCache, Python, Rust, Severity,
        TypeScript,
    };
    pub use crate::matcher::{CodeMatcher, NodeMatch};
    pub use crate::pipeline::{
        BatchOutcome, CancellationToken, FileChangeSet, FileProcessor, ProcessRequest, WorkerPool,
    };
    pub use crate::query::{Combinator, NodeKind, Query, QueryExpr, glob_match, parse};
    pub use crate::rewrite::{Change, Operation, Rewrite, RewriteEngine, apply_rewrites};
    pub use crate::scanner::Scanner;
    pub use crate::session::{
        ApplyRecord, ChangeOperation, MemoryStore, SessionRecord, SessionStore, StageRecord,
        StageStatus, StagedChange,
    };
    pub use crate::transaction::{
        AppliedStage, CommitReport, ExpirySweeper, Transaction, TransactionManager, TxStatus,
    };
}

pub use prelude::*;
