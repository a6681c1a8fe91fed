//! Durable session records: sessions, stages, and applies.
//!
//! The engine only depends on the [`SessionStore`] trait; the bundled
//! [`MemoryStore`] provides the required atomicity with a single mutex,
//! while production embeddings can plug in a SQL-backed store.

mod memory;

pub use memory::MemoryStore;

use crate::confidence::Confidence;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What committing a staged change does to the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Create,
    Modify,
    Delete,
}

/// One file's pending mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedChange {
    pub path: PathBuf,
    pub original_content: String,
    pub modified_content: String,
    pub original_digest: String,
    pub modified_digest: String,
    pub size_delta: i64,
    pub timestamp: DateTime<Utc>,
    pub operation: ChangeOperation,
    pub originating_query: String,
}

/// Lifecycle of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Applied,
    Conflict,
    Expired,
    Discarded,
    Reverted,
}

/// A persisted, uncommitted change plus its risk score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: String,
    pub session_id: String,
    pub transaction_id: String,
    pub change: StagedChange,
    pub confidence: Confidence,
    pub status: StageStatus,
    pub created_at: DateTime<Utc>,
}

/// One commit attempt for a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyRecord {
    pub id: String,
    pub stage_id: String,
    pub session_id: String,
    pub committed_at: DateTime<Utc>,
    pub reverted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
}

/// A logical batch issued by one caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub stages_count: usize,
    pub applies_count: usize,
    pub client_info: String,
}

/// Durable audit storage for sessions, stages, and applies.
///
/// Implementations must provide atomic single-record writes and reject a
/// second non-reverted apply for the same stage.
pub trait SessionStore: Send + Sync {
    /// Opens a new session.
    fn create_session(&self, client_info: &str) -> Result<SessionRecord>;

    /// Closes a session, stamping its end time.
    fn end_session(&self, session_id: &str) -> Result<()>;

    /// Persists a new stage record.
    fn record_stage(&self, stage: StageRecord) -> Result<()>;

    /// Moves a stage to a new status.
    fn update_stage_status(&self, stage_id: &str, status: StageStatus) -> Result<()>;

    /// Persists an apply. Fails when the stage already has a non-reverted
    /// apply or does not exist.
    fn record_apply(&self, apply: ApplyRecord) -> Result<()>;

    /// Flags an apply as reverted and its stage accordingly.
    fn mark_reverted(&self, apply_id: &str) -> Result<()>;

    /// Expires every pending stage created before `cutoff`; returns how
    /// many were expired.
    fn expire_stages_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Loads one stage.
    fn fetch_stage(&self, stage_id: &str) -> Result<Option<StageRecord>>;

    /// Loads one session with up-to-date counters.
    fn fetch_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Loads one apply.
    fn fetch_apply(&self, apply_id: &str) -> Result<Option<ApplyRecord>>;

    /// All stages of a session, in staging (insertion) order.
    fn session_stages(&self, session_id: &str) -> Result<Vec<StageRecord>>;

    /// Number of stages recorded against a session.
    fn count_stages(&self, session_id: &str) -> Result<usize>;

    /// Number of applies recorded against a session.
    fn count_applies(&self, session_id: &str) -> Result<usize>;

    /// Removes a session and, cascading, its stages and applies.
    fn delete_session(&self, session_id: &str) -> Result<()>;
}
