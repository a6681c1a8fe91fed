//! Error types for the transformation engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for transformation operations.
#[derive(Error, Debug)]
pub enum MorfxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Glob pattern error: {0}")]
    Glob(#[from] globset::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid query: {0}")]
    BadQuery(String),

    #[error("Language not supported: {0}")]
    UnsupportedLanguage(String),

    #[error("Parse error for {path}: {message}")]
    ParseFailed { path: PathBuf, message: String },

    #[error("Tree-sitter query error: {0}")]
    Pattern(#[from] tree_sitter::QueryError),

    #[error("No nodes matched the query")]
    NoMatches,

    #[error("Overlapping rewrites at bytes {first}..{second} in {path}")]
    OverlappingMatches {
        path: PathBuf,
        first: usize,
        second: usize,
    },

    #[error("Post-edit validation failed for {path}: {message}")]
    ValidationFailed { path: PathBuf, message: String },

    #[error("Stage {stage_id} is stale: {path} changed on disk")]
    StaleStage { stage_id: String, path: PathBuf },

    #[error("Stage {stage_id} has expired")]
    ExpiredStage { stage_id: String },

    #[error("Could not acquire lock for {path} within {timeout_ms}ms")]
    LockTimeout { path: PathBuf, timeout_ms: u64 },

    #[error("Session store error: {0}")]
    StoreFailed(String),

    #[error("Limit exceeded: {0}")]
    CapExceeded(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
}

/// Stable error identifiers surfaced in batch reports and tool envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadQuery,
    UnsupportedLanguage,
    ParseFailed,
    NoMatches,
    OverlappingMatches,
    ValidationFailed,
    StaleStage,
    ExpiredStage,
    LockTimeout,
    IoFailed,
    StoreFailed,
    CapExceeded,
    Cancelled,
    InvalidConfig,
}

impl MorfxError {
    /// Returns the stable identifier for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MorfxError::Io(_) | MorfxError::FileNotFound(_) => ErrorKind::IoFailed,
            MorfxError::Regex(_) | MorfxError::Glob(_) | MorfxError::Pattern(_) => {
                ErrorKind::BadQuery
            }
            MorfxError::Json(_) => ErrorKind::StoreFailed,
            MorfxError::BadQuery(_) => ErrorKind::BadQuery,
            MorfxError::UnsupportedLanguage(_) => ErrorKind::UnsupportedLanguage,
            MorfxError::ParseFailed { .. } => ErrorKind::ParseFailed,
            MorfxError::NoMatches => ErrorKind::NoMatches,
            MorfxError::OverlappingMatches { .. } => ErrorKind::OverlappingMatches,
            MorfxError::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            MorfxError::StaleStage { .. } => ErrorKind::StaleStage,
            MorfxError::ExpiredStage { .. } => ErrorKind::ExpiredStage,
            MorfxError::LockTimeout { .. } => ErrorKind::LockTimeout,
            MorfxError::StoreFailed(_) => ErrorKind::StoreFailed,
            MorfxError::CapExceeded(_) => ErrorKind::CapExceeded,
            MorfxError::Cancelled => ErrorKind::Cancelled,
            MorfxError::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }
}

/// A per-file failure captured in a batch report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileError {
    pub path: PathBuf,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
}

impl FileError {
    /// Captures an error against the file it occurred on.
    pub fn new(path: impl Into<PathBuf>, err: &MorfxError) -> Self {
        Self {
            path: path.into(),
            kind: err.kind(),
            message: err.to_string(),
            stage_id: None,
        }
    }

    /// Attaches the stage the failure belongs to.
    pub fn with_stage(mut self, stage_id: impl Into<String>) -> Self {
        self.stage_id = Some(stage_id.into());
        self
    }
}

/// A specialized Result type for transformation operations.
pub type Result<T> = std::result::Result<T, MorfxError>;
