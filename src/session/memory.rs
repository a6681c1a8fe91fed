//! In-memory session store.

use super::{ApplyRecord, SessionRecord, SessionStore, StageRecord, StageStatus};
use crate::error::{MorfxError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionRecord>,
    stages: HashMap<String, StageRecord>,
    applies: HashMap<String, ApplyRecord>,
    /// Stage ids per session, in staging order.
    session_stage_order: HashMap<String, Vec<String>>,
}

/// Session store backed by process memory. A single mutex gives the
/// atomic-write and uniqueness guarantees the engine requires.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| MorfxError::StoreFailed("session store poisoned".into()))
    }
}

impl SessionStore for MemoryStore {
    fn create_session(&self, client_info: &str) -> Result<SessionRecord> {
        let session = SessionRecord {
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            ended_at: None,
            stages_count: 0,
            applies_count: 0,
            client_info: client_info.to_string(),
        };
        let mut inner = self.lock()?;
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    fn end_session(&self, session_id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| MorfxError::StoreFailed(format!("unknown session {session_id}")))?;
        session.ended_at = Some(Utc::now());
        Ok(())
    }

    fn record_stage(&self, stage: StageRecord) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.sessions.contains_key(&stage.session_id) {
            return Err(MorfxError::StoreFailed(format!(
                "unknown session {}",
                stage.session_id
            )));
        }
        if inner.stages.contains_key(&stage.id) {
            return Err(MorfxError::StoreFailed(format!(
                "duplicate stage {}",
                stage.id
            )));
        }
        inner
            .session_stage_order
            .entry(stage.session_id.clone())
            .or_default()
            .push(stage.id.clone());
        inner.stages.insert(stage.id.clone(), stage);
        Ok(())
    }

    fn update_stage_status(&self, stage_id: &str, status: StageStatus) -> Result<()> {
        let mut inner = self.lock()?;
        let stage = inner
            .stages
            .get_mut(stage_id)
            .ok_or_else(|| MorfxError::StoreFailed(format!("unknown stage {stage_id}")))?;
        stage.status = status;
        Ok(())
    }

    fn record_apply(&self, apply: ApplyRecord) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.stages.contains_key(&apply.stage_id) {
            return Err(MorfxError::StoreFailed(format!(
                "unknown stage {}",
                apply.stage_id
            )));
        }
        let duplicate = inner
            .applies
            .values()
            .any(|existing| existing.stage_id == apply.stage_id && !existing.reverted);
        if duplicate {
            return Err(MorfxError::StoreFailed(format!(
                "stage {} already has a live apply",
                apply.stage_id
            )));
        }
        inner.applies.insert(apply.id.clone(), apply);
        Ok(())
    }

    fn mark_reverted(&self, apply_id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let apply = inner
            .applies
            .get_mut(apply_id)
            .ok_or_else(|| MorfxError::StoreFailed(format!("unknown apply {apply_id}")))?;
        apply.reverted = true;
        let stage_id = apply.stage_id.clone();
        if let Some(stage) = inner.stages.get_mut(&stage_id) {
            stage.status = StageStatus::Reverted;
        }
        Ok(())
    }

    fn expire_stages_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut expired = 0;
        for stage in inner.stages.values_mut() {
            if stage.status == StageStatus::Pending && stage.created_at < cutoff {
                stage.status = StageStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    fn fetch_stage(&self, stage_id: &str) -> Result<Option<StageRecord>> {
        Ok(self.lock()?.stages.get(stage_id).cloned())
    }

    fn fetch_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let inner = self.lock()?;
        Ok(inner.sessions.get(session_id).map(|session| {
            let mut session = session.clone();
            session.stages_count = inner
                .session_stage_order
                .get(session_id)
                .map(Vec::len)
                .unwrap_or(0);
            session.applies_count = inner
                .applies
                .values()
                .filter(|a| a.session_id == session_id)
                .count();
            session
        }))
    }

    fn fetch_apply(&self, apply_id: &str) -> Result<Option<ApplyRecord>> {
        Ok(self.lock()?.applies.get(apply_id).cloned())
    }

    fn session_stages(&self, session_id: &str) -> Result<Vec<StageRecord>> {
        let inner = self.lock()?;
        let order = inner.session_stage_order.get(session_id);
        Ok(order
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.stages.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn count_stages(&self, session_id: &str) -> Result<usize> {
        Ok(self
            .lock()?
            .session_stage_order
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0))
    }

    fn count_applies(&self, session_id: &str) -> Result<usize> {
        Ok(self
            .lock()?
            .applies
            .values()
            .filter(|a| a.session_id == session_id)
            .count())
    }

    fn delete_session(&self, session_id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner.sessions.remove(session_id);
        let stage_ids = inner
            .session_stage_order
            .remove(session_id)
            .unwrap_or_default();
        for id in &stage_ids {
            inner.stages.remove(id);
        }
        inner.applies.retain(|_, a| a.session_id != session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::Confidence;
    use crate::session::{ChangeOperation, StagedChange};
    use chrono::Duration;
    use std::path::PathBuf;

    fn sample_stage(session_id: &str, id: &str) -> StageRecord {
        StageRecord {
            id: id.to_string(),
            session_id: session_id.to_string(),
            transaction_id: "tx-1".to_string(),
            change: StagedChange {
                path: PathBuf::from("a.go"),
                original_content: "old".into(),
                modified_content: "new".into(),
                original_digest: "d1".into(),
                modified_digest: "d2".into(),
                size_delta: 0,
                timestamp: Utc::now(),
                operation: ChangeOperation::Modify,
                originating_query: "func:F".into(),
            },
            confidence: Confidence::from_factors(Vec::new()),
            status: StageStatus::Pending,
            created_at: Utc::now(),
        }
    }

    fn sample_apply(session_id: &str, stage_id: &str, id: &str) -> ApplyRecord {
        ApplyRecord {
            id: id.to_string(),
            stage_id: stage_id.to_string(),
            session_id: session_id.to_string(),
            committed_at: Utc::now(),
            reverted: false,
            error: None,
            backup_path: None,
        }
    }

    #[test]
    fn test_session_lifecycle_and_counts() {
        let store = MemoryStore::new();
        let session = store.create_session("test-client").unwrap();

        store.record_stage(sample_stage(&session.id, "s1")).unwrap();
        store.record_stage(sample_stage(&session.id, "s2")).unwrap();
        store
            .record_apply(sample_apply(&session.id, "s1", "a1"))
            .unwrap();

        let fetched = store.fetch_session(&session.id).unwrap().unwrap();
        assert_eq!(fetched.stages_count, 2);
        assert_eq!(fetched.applies_count, 1);

        store.end_session(&session.id).unwrap();
        assert!(store.fetch_session(&session.id).unwrap().unwrap().ended_at.is_some());
    }

    #[test]
    fn test_stage_order_is_insertion_order() {
        let store = MemoryStore::new();
        let session = store.create_session("c").unwrap();
        for i in 0..5 {
            store
                .record_stage(sample_stage(&session.id, &format!("s{i}")))
                .unwrap();
        }
        let stages = store.session_stages(&session.id).unwrap();
        let ids: Vec<_> = stages.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s0", "s1", "s2", "s3", "s4"]);
    }

    #[test]
    fn test_duplicate_live_apply_is_rejected() {
        let store = MemoryStore::new();
        let session = store.create_session("c").unwrap();
        store.record_stage(sample_stage(&session.id, "s1")).unwrap();

        store
            .record_apply(sample_apply(&session.id, "s1", "a1"))
            .unwrap();
        let err = store
            .record_apply(sample_apply(&session.id, "s1", "a2"))
            .unwrap_err();
        assert!(matches!(err, MorfxError::StoreFailed(_)));

        // After a revert, a new apply is allowed again.
        store.mark_reverted("a1").unwrap();
        store
            .record_apply(sample_apply(&session.id, "s1", "a3"))
            .unwrap();
    }

    #[test]
    fn test_mark_reverted_updates_stage() {
        let store = MemoryStore::new();
        let session = store.create_session("c").unwrap();
        store.record_stage(sample_stage(&session.id, "s1")).unwrap();
        store
            .record_apply(sample_apply(&session.id, "s1", "a1"))
            .unwrap();

        store.mark_reverted("a1").unwrap();
        assert!(store.fetch_apply("a1").unwrap().unwrap().reverted);
        assert_eq!(
            store.fetch_stage("s1").unwrap().unwrap().status,
            StageStatus::Reverted
        );
    }

    #[test]
    fn test_expiry_only_touches_old_pending_stages() {
        let store = MemoryStore::new();
        let session = store.create_session("c").unwrap();

        let mut old = sample_stage(&session.id, "old");
        old.created_at = Utc::now() - Duration::minutes(30);
        store.record_stage(old).unwrap();

        let mut applied = sample_stage(&session.id, "applied");
        applied.created_at = Utc::now() - Duration::minutes(30);
        applied.status = StageStatus::Applied;
        store.record_stage(applied).unwrap();

        store.record_stage(sample_stage(&session.id, "fresh")).unwrap();

        let expired = store
            .expire_stages_before(Utc::now() - Duration::minutes(15))
            .unwrap();
        assert_eq!(expired, 1);
        assert_eq!(
            store.fetch_stage("old").unwrap().unwrap().status,
            StageStatus::Expired
        );
        assert_eq!(
            store.fetch_stage("applied").unwrap().unwrap().status,
            StageStatus::Applied
        );
        assert_eq!(
            store.fetch_stage("fresh").unwrap().unwrap().status,
            StageStatus::Pending
        );
    }

    #[test]
    fn test_delete_session_cascades() {
        let store = MemoryStore::new();
        let session = store.create_session("c").unwrap();
        store.record_stage(sample_stage(&session.id, "s1")).unwrap();
        store
            .record_apply(sample_apply(&session.id, "s1", "a1"))
            .unwrap();

        store.delete_session(&session.id).unwrap();
        assert!(store.fetch_session(&session.id).unwrap().is_none());
        assert!(store.fetch_stage("s1").unwrap().is_none());
        assert!(store.fetch_apply("a1").unwrap().is_none());
    }

    #[test]
    fn test_unknown_references_fail() {
        let store = MemoryStore::new();
        assert!(store.record_stage(sample_stage("ghost", "s1")).is_err());
        assert!(store
            .record_apply(sample_apply("ghost", "missing-stage", "a1"))
            .is_err());
        assert!(store.mark_reverted("missing").is_err());
    }
}
