//! Two-phase staging and commit with optimistic concurrency control.
//!
//! Phase 1 records a [`StageRecord`] in the session store and a sidecar
//! transaction log under `.morfx/transactions/`. Phase 2 re-reads each file,
//! compares digests, and renames new content into place under an advisory
//! lock; a non-conflict failure rolls the whole batch back.

use crate::config::Config;
use crate::error::{FileError, MorfxError, Result};
use crate::fsio::{self, FileLock};
use crate::rewrite::Rewrite;
use crate::session::{
    ApplyRecord, ChangeOperation, SessionStore, StageRecord, StageStatus, StagedChange,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Transaction lifecycle recorded in the sidecar log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Committed,
    RolledBack,
}

/// One file operation inside a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOperation {
    #[serde(rename = "type")]
    pub op_type: ChangeOperation,
    pub file_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    pub original_digest: String,
    pub modified_digest: String,
    pub timestamp: DateTime<Utc>,
    pub completed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub rewrites: Vec<Rewrite>,
    pub original_content: String,
    pub modified_content: String,
}

/// The sidecar transaction record under `.morfx/transactions/<tx>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub started: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    pub status: TxStatus,
    pub description: String,
    pub operations: Vec<TxOperation>,
}

/// One successful stage commit.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedStage {
    pub stage_id: String,
    pub apply_id: String,
}

/// Outcome of committing a batch of stages.
#[derive(Debug, Default, Serialize)]
pub struct CommitReport {
    /// Stages whose files were durably written, with their apply records.
    pub applied: Vec<AppliedStage>,
    /// Per-stage skips: conflicts, expirations, lock timeouts.
    pub skipped: Vec<FileError>,
    /// The failure that aborted the batch, when one occurred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<FileError>,
    /// Stage ids restored to their pre-commit content during rollback.
    pub rolled_back: Vec<String>,
}

impl CommitReport {
    /// True when every stage either applied or was skipped as a conflict.
    pub fn is_clean(&self) -> bool {
        self.failed.is_none()
    }
}

/// Coordinates staging, commit, rollback, and reverts.
pub struct TransactionManager {
    store: Arc<dyn SessionStore>,
    config: Arc<Config>,
    /// Next transaction sequence number per session.
    tx_counters: Mutex<HashMap<String, u64>>,
}

impl TransactionManager {
    /// Creates a manager over the given store and configuration.
    pub fn new(store: Arc<dyn SessionStore>, config: Arc<Config>) -> Self {
        Self {
            store,
            config,
            tx_counters: Mutex::new(HashMap::new()),
        }
    }

    /// Phase 1: persists one file's pending change and its sidecar record.
    pub fn stage(
        &self,
        root: &Path,
        session_id: &str,
        change: StagedChange,
        confidence: crate::confidence::Confidence,
        rewrites: Vec<Rewrite>,
    ) -> Result<StageRecord> {
        let tx_id = self.next_tx_id(session_id)?;
        let record = StageRecord {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            transaction_id: tx_id.clone(),
            change,
            confidence,
            status: StageStatus::Pending,
            created_at: Utc::now(),
        };
        self.store.record_stage(record.clone())?;

        if self.config.safety.transaction_log {
            let transaction = Transaction {
                id: tx_id.clone(),
                started: record.created_at,
                completed: None,
                status: TxStatus::Pending,
                description: record.change.originating_query.clone(),
                operations: vec![TxOperation {
                    op_type: record.change.operation,
                    file_path: record.change.path.clone(),
                    backup_path: None,
                    original_digest: record.change.original_digest.clone(),
                    modified_digest: record.change.modified_digest.clone(),
                    timestamp: record.change.timestamp,
                    completed: false,
                    rewrites,
                    original_content: record.change.original_content.clone(),
                    modified_content: record.change.modified_content.clone(),
                }],
            };
            self.write_sidecar(root, &transaction)?;
        }

        debug!(stage = %record.id, tx = %tx_id, path = %record.change.path.display(), "staged change");
        Ok(record)
    }

    /// Phase 2: commits every pending stage of a session, in staging order.
    pub fn commit_session(&self, root: &Path, session_id: &str) -> Result<CommitReport> {
        let stages = self.store.session_stages(session_id)?;
        let pending: Vec<StageRecord> = stages
            .into_iter()
            .filter(|s| s.status == StageStatus::Pending)
            .collect();
        Ok(self.commit_stages(root, &pending))
    }

    /// Phase 2 for an explicit list of stages, in the order given.
    pub fn commit_stages(&self, root: &Path, stages: &[StageRecord]) -> CommitReport {
        let mut report = CommitReport::default();
        // Already-written stages with their backup and apply ids, for rollback.
        let mut committed: Vec<CommittedStage> = Vec::new();

        for stage in stages {
            match self.commit_one(root, stage) {
                Ok(CommitOutcome::Applied {
                    backup_path,
                    apply_id,
                }) => {
                    report.applied.push(AppliedStage {
                        stage_id: stage.id.clone(),
                        apply_id: apply_id.clone(),
                    });
                    committed.push(CommittedStage {
                        stage: stage.clone(),
                        backup_path,
                        apply_id,
                    });
                }
                Ok(CommitOutcome::Skipped(err)) => {
                    report
                        .skipped
                        .push(FileError::new(&stage.change.path, &err).with_stage(&stage.id));
                }
                Err(err) => {
                    warn!(stage = %stage.id, error = %err, "commit failed, rolling back batch");
                    report.failed =
                        Some(FileError::new(&stage.change.path, &err).with_stage(&stage.id));
                    self.record_failed_apply(stage, &err);
                    report.rolled_back = self.rollback(root, &committed);
                    return report;
                }
            }
        }

        report
    }

    fn commit_one(&self, root: &Path, stage: &StageRecord) -> Result<CommitOutcome> {
        match stage.status {
            StageStatus::Pending => {}
            StageStatus::Expired => {
                return Ok(CommitOutcome::Skipped(MorfxError::ExpiredStage {
                    stage_id: stage.id.clone(),
                }));
            }
            other => {
                return Ok(CommitOutcome::Skipped(MorfxError::StoreFailed(format!(
                    "stage {} is {:?}, not pending",
                    stage.id, other
                ))));
            }
        }
        let age = Utc::now().signed_duration_since(stage.created_at);
        if age.num_seconds() >= 0 && age.to_std().unwrap_or_default() > self.config.staging_ttl()
        {
            self.store
                .update_stage_status(&stage.id, StageStatus::Expired)?;
            return Ok(CommitOutcome::Skipped(MorfxError::ExpiredStage {
                stage_id: stage.id.clone(),
            }));
        }

        let path = &stage.change.path;
        let _lock = if self.config.safety.file_locking {
            match FileLock::acquire(path, self.config.safety.lock_timeout()) {
                Ok(lock) => Some(lock),
                Err(err @ MorfxError::LockTimeout { .. }) => {
                    return Ok(CommitOutcome::Skipped(err));
                }
                Err(err) => return Err(err),
            }
        } else {
            None
        };

        // Optimistic concurrency: the file must still be what we staged.
        if self.config.safety.validate_file_hashes {
            match stage.change.operation {
                ChangeOperation::Create => {
                    if path.exists() {
                        self.store
                            .update_stage_status(&stage.id, StageStatus::Conflict)?;
                        return Ok(CommitOutcome::Skipped(MorfxError::StaleStage {
                            stage_id: stage.id.clone(),
                            path: path.clone(),
                        }));
                    }
                }
                ChangeOperation::Modify | ChangeOperation::Delete => {
                    let (_, digest_now) = fsio::read_with_digest(path)?;
                    if digest_now != stage.change.original_digest {
                        self.store
                            .update_stage_status(&stage.id, StageStatus::Conflict)?;
                        return Ok(CommitOutcome::Skipped(MorfxError::StaleStage {
                            stage_id: stage.id.clone(),
                            path: path.clone(),
                        }));
                    }
                }
            }
        }

        let backup_path = if self.config.safety.create_backups && path.exists() {
            Some(fsio::write_backup(
                path,
                &stage.transaction_id,
                &self.config.safety.backup_suffix,
            )?)
        } else {
            None
        };

        match stage.change.operation {
            ChangeOperation::Create | ChangeOperation::Modify => {
                if self.config.safety.atomic_writes {
                    fsio::write_atomic(
                        path,
                        stage.change.modified_content.as_bytes(),
                        self.config.safety.use_fsync,
                    )?;
                } else {
                    fsio::write_plain(path, stage.change.modified_content.as_bytes())?;
                }
            }
            ChangeOperation::Delete => {
                std::fs::remove_file(path)?;
            }
        }

        let apply_id = Uuid::new_v4().to_string();
        let apply = ApplyRecord {
            id: apply_id.clone(),
            stage_id: stage.id.clone(),
            session_id: stage.session_id.clone(),
            committed_at: Utc::now(),
            reverted: false,
            error: None,
            backup_path: backup_path.clone(),
        };
        self.store.record_apply(apply)?;
        self.store
            .update_stage_status(&stage.id, StageStatus::Applied)?;
        self.update_sidecar(root, stage, backup_path.as_deref(), TxStatus::Committed);

        debug!(stage = %stage.id, path = %path.display(), "committed stage");
        Ok(CommitOutcome::Applied {
            backup_path,
            apply_id,
        })
    }

    /// Restores every already-committed file of the batch, newest first.
    fn rollback(&self, root: &Path, committed: &[CommittedStage]) -> Vec<String> {
        let mut restored = Vec::new();
        for entry in committed.iter().rev() {
            let stage = &entry.stage;
            let path = &stage.change.path;
            let result = match &entry.backup_path {
                Some(backup) => std::fs::read(backup)
                    .map_err(MorfxError::from)
                    .and_then(|content| fsio::write_atomic(path, &content, false)),
                None => fsio::write_atomic(path, stage.change.original_content.as_bytes(), false),
            };
            match result {
                Ok(()) => {
                    restored.push(stage.id.clone());
                    if let Err(err) = self.store.mark_reverted(&entry.apply_id) {
                        warn!(stage = %stage.id, error = %err, "rollback bookkeeping failed");
                    }
                    self.update_sidecar(
                        root,
                        stage,
                        entry.backup_path.as_deref(),
                        TxStatus::RolledBack,
                    );
                }
                Err(err) => {
                    // Leave the stage applied; the backup still exists for
                    // manual recovery.
                    warn!(stage = %stage.id, error = %err, "rollback restore failed");
                }
            }
        }
        restored
    }

    fn record_failed_apply(&self, stage: &StageRecord, err: &MorfxError) {
        let apply = ApplyRecord {
            id: Uuid::new_v4().to_string(),
            stage_id: stage.id.clone(),
            session_id: stage.session_id.clone(),
            committed_at: Utc::now(),
            // A failed apply never took durable effect.
            reverted: true,
            error: Some(err.to_string()),
            backup_path: None,
        };
        if let Err(store_err) = self.store.record_apply(apply) {
            warn!(stage = %stage.id, error = %store_err, "failed to record aborted apply");
        }
    }

    /// Restores a committed stage's file and records the revert.
    pub fn revert(&self, root: &Path, apply_id: &str) -> Result<ApplyRecord> {
        let apply = self
            .store
            .fetch_apply(apply_id)?
            .ok_or_else(|| MorfxError::StoreFailed(format!("unknown apply {apply_id}")))?;
        if apply.reverted {
            return Err(MorfxError::StoreFailed(format!(
                "apply {apply_id} is already reverted"
            )));
        }
        let stage = self
            .store
            .fetch_stage(&apply.stage_id)?
            .ok_or_else(|| MorfxError::StoreFailed(format!("unknown stage {}", apply.stage_id)))?;

        let path = &stage.change.path;
        let content = match &apply.backup_path {
            Some(backup) if backup.exists() => std::fs::read(backup)?,
            _ => stage.change.original_content.clone().into_bytes(),
        };
        fsio::write_atomic(path, &content, self.config.safety.use_fsync)?;

        self.store.mark_reverted(apply_id)?;
        let revert_record = ApplyRecord {
            id: Uuid::new_v4().to_string(),
            stage_id: stage.id.clone(),
            session_id: stage.session_id.clone(),
            committed_at: Utc::now(),
            reverted: true,
            error: None,
            backup_path: apply.backup_path.clone(),
        };
        self.store.record_apply(revert_record.clone())?;
        self.update_sidecar(root, &stage, apply.backup_path.as_deref(), TxStatus::RolledBack);

        debug!(apply = %apply_id, path = %path.display(), "reverted apply");
        Ok(revert_record)
    }

    /// Discards a pending stage without touching the filesystem.
    pub fn discard(&self, stage_id: &str) -> Result<()> {
        self.store
            .update_stage_status(stage_id, StageStatus::Discarded)
    }

    fn next_tx_id(&self, session_id: &str) -> Result<String> {
        let mut counters = self
            .tx_counters
            .lock()
            .map_err(|_| MorfxError::StoreFailed("transaction counter poisoned".into()))?;
        let counter = counters.entry(session_id.to_string()).or_insert(0);
        *counter += 1;
        // Globally unique, monotonic within the session.
        let short: String = session_id.chars().take(8).collect();
        Ok(format!("tx-{short}-{counter:04}"))
    }

    fn sidecar_path(root: &Path, tx_id: &str) -> PathBuf {
        root.join(fsio::MORFX_DIR)
            .join("transactions")
            .join(format!("{tx_id}.json"))
    }

    fn write_sidecar(&self, root: &Path, transaction: &Transaction) -> Result<()> {
        let path = Self::sidecar_path(root, &transaction.id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(transaction)?;
        fsio::write_atomic(&path, &json, false)
    }

    /// Best-effort sidecar update after commit or rollback; the session
    /// store stays the authoritative audit trail.
    fn update_sidecar(
        &self,
        root: &Path,
        stage: &StageRecord,
        backup_path: Option<&Path>,
        status: TxStatus,
    ) {
        if !self.config.safety.transaction_log {
            return;
        }
        let path = Self::sidecar_path(root, &stage.transaction_id);
        let Ok(bytes) = std::fs::read(&path) else {
            return;
        };
        let Ok(mut transaction) = serde_json::from_slice::<Transaction>(&bytes) else {
            return;
        };
        transaction.status = status;
        transaction.completed = Some(Utc::now());
        for op in &mut transaction.operations {
            op.completed = status == TxStatus::Committed;
            op.backup_path = backup_path.map(Path::to_path_buf);
        }
        if let Err(err) = self.write_sidecar(root, &transaction) {
            warn!(tx = %stage.transaction_id, error = %err, "sidecar update failed");
        }
    }
}

enum CommitOutcome {
    Applied {
        backup_path: Option<PathBuf>,
        apply_id: String,
    },
    Skipped(MorfxError),
}

struct CommittedStage {
    stage: StageRecord,
    backup_path: Option<PathBuf>,
    apply_id: String,
}

/// Background thread that expires stale pending stages.
pub struct ExpirySweeper {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ExpirySweeper {
    /// Starts a sweeper for the given store and TTL. Cadence is half the
    /// TTL, clamped to at least one minute.
    pub fn start(store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        let cadence = (ttl / 2).max(Duration::from_secs(60));
        Self::start_with_cadence(store, ttl, cadence)
    }

    /// Starts a sweeper with an explicit cadence (tests use short ones).
    pub fn start_with_cadence(
        store: Arc<dyn SessionStore>,
        ttl: Duration,
        cadence: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            let tick = Duration::from_millis(50);
            let mut slept = Duration::ZERO;
            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(tick.min(cadence));
                slept += tick;
                if slept < cadence {
                    continue;
                }
                slept = Duration::ZERO;
                let cutoff = Utc::now()
                    - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
                match store.expire_stages_before(cutoff) {
                    Ok(0) => {}
                    Ok(count) => debug!(count, "expired stale stages"),
                    Err(err) => warn!(error = %err, "stage expiry sweep failed"),
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
