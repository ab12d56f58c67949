//! Snapshot manager: per-session ordered ring of snapshot records.
//!
//! The per-session list is newest-first and bounded by
//! `max_per_session`; insertion at the cap evicts the oldest through the
//! same removal path that keeps both indices consistent. Restore delegates
//! to a registered handler (which calls `Provider::restore`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Result, SandboxError};
use crate::events::{EventBus, Subscription};
use crate::metrics::metrics;
use crate::provider::{Provider, SandboxInfo};
use crate::util::now_ts;

#[derive(Clone, Debug)]
pub struct SnapshotConfig {
    pub ttl: Duration,
    pub max_per_session: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(86_400),
            max_per_session: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SnapshotRecord {
    pub id: String,
    /// Sandbox the snapshot was taken from (by id only).
    pub sandbox_id: String,
    pub session_id: String,
    pub created_at: u64,
    pub git_commit: String,
    pub has_uncommitted_changes: bool,
    pub expired: bool,
}

impl SnapshotRecord {
    pub fn is_valid(&self, ttl: Duration) -> bool {
        !self.expired && now_ts().saturating_sub(self.created_at) < ttl.as_secs()
    }
}

#[derive(Clone, Debug)]
pub enum SnapshotEvent {
    Created(SnapshotRecord),
    Expired(SnapshotRecord),
    Cleaned(SnapshotRecord),
    Restored {
        snapshot: SnapshotRecord,
        sandbox_id: String,
    },
}

/// Seam for materializing a sandbox from a snapshot; the registered handler
/// calls `Provider::restore` internally.
#[async_trait]
pub trait RestoreHandler: Send + Sync {
    async fn restore(&self, snapshot: &SnapshotRecord) -> Result<SandboxInfo>;
}

#[derive(Default)]
struct SnapInner {
    by_id: HashMap<String, SnapshotRecord>,
    /// Newest-first snapshot ids per session.
    by_session: HashMap<String, Vec<String>>,
}

pub struct SnapshotManager {
    config: SnapshotConfig,
    inner: Mutex<SnapInner>,
    handler: Mutex<Option<Arc<dyn RestoreHandler>>>,
    events: EventBus<SnapshotEvent>,
}

impl SnapshotManager {
    pub fn new(config: SnapshotConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(SnapInner::default()),
            handler: Mutex::new(None),
            events: EventBus::new(),
        }
    }

    pub fn subscribe(&self) -> Subscription<SnapshotEvent> {
        self.events.subscribe()
    }

    pub fn on_restore(&self, handler: Arc<dyn RestoreHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    /// Record a snapshot for a session. At the cap the oldest record is
    /// removed first, through the same path as explicit removal.
    pub fn create(
        &self,
        snapshot_id: &str,
        sandbox_id: &str,
        session_id: &str,
        git_commit: &str,
        has_uncommitted_changes: bool,
    ) -> SnapshotRecord {
        let record = SnapshotRecord {
            id: snapshot_id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            session_id: session_id.to_string(),
            created_at: now_ts(),
            git_commit: git_commit.to_string(),
            has_uncommitted_changes,
            expired: false,
        };

        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            // Evict from the tail until below the cap.
            loop {
                let oldest = match inner.by_session.get(session_id) {
                    Some(ids) if ids.len() >= self.config.max_per_session => ids.last().cloned(),
                    _ => None,
                };
                let Some(oldest) = oldest else { break };
                match Self::remove_locked(&mut inner, &oldest) {
                    Some(removed) => evicted.push(removed),
                    None => break,
                }
            }
            let ids = inner
                .by_session
                .entry(session_id.to_string())
                .or_default();
            ids.insert(0, record.id.clone());
            inner.by_id.insert(record.id.clone(), record.clone());
        }

        metrics()
            .snapshots_created
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        for removed in evicted {
            self.events.emit(SnapshotEvent::Cleaned(removed));
        }
        info!(
            "snapshots: recorded {} for session {session_id} (sandbox {sandbox_id})",
            record.id
        );
        self.events.emit(SnapshotEvent::Created(record.clone()));
        record
    }

    /// Take a snapshot of a live sandbox via the provider and record it.
    pub async fn capture(
        &self,
        provider: &dyn Provider,
        sandbox_id: &str,
        session_id: &str,
    ) -> Result<SnapshotRecord> {
        let snapshot_id = provider.snapshot(sandbox_id).await?;
        let git = provider.git_status(sandbox_id).await?;
        let status = provider
            .execute(
                sandbox_id,
                &["git".into(), "status".into(), "--porcelain".into()],
                Default::default(),
            )
            .await?;
        let has_uncommitted = status.exit_code == 0 && !status.stdout.trim().is_empty();
        Ok(self.create(&snapshot_id, sandbox_id, session_id, &git.commit, has_uncommitted))
    }

    pub fn get(&self, snapshot_id: &str) -> Option<SnapshotRecord> {
        self.inner.lock().unwrap().by_id.get(snapshot_id).cloned()
    }

    /// Session snapshots, newest-first.
    pub fn by_session(&self, session_id: &str) -> Vec<SnapshotRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .by_session
            .get(session_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First non-expired snapshot for the session, mark-expiring stale
    /// entries encountered along the way.
    pub fn get_latest(&self, session_id: &str) -> Option<SnapshotRecord> {
        let ttl = self.config.ttl.as_secs();
        let now = now_ts();
        let mut newly_expired = Vec::new();
        let found = {
            let mut inner = self.inner.lock().unwrap();
            let ids = inner.by_session.get(session_id).cloned().unwrap_or_default();
            let mut found = None;
            for id in ids {
                let Some(record) = inner.by_id.get_mut(&id) else {
                    continue;
                };
                if record.expired {
                    continue;
                }
                if now.saturating_sub(record.created_at) >= ttl {
                    record.expired = true;
                    newly_expired.push(record.clone());
                    continue;
                }
                found = Some(record.clone());
                break;
            }
            found
        };

        for record in newly_expired {
            metrics()
                .snapshots_expired
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.events.emit(SnapshotEvent::Expired(record));
        }
        found
    }

    pub fn has_valid_snapshot(&self, session_id: &str) -> bool {
        self.get_latest(session_id).is_some()
    }

    pub fn valid_count(&self, session_id: &str) -> usize {
        self.by_session(session_id)
            .iter()
            .filter(|r| r.is_valid(self.config.ttl))
            .count()
    }

    /// Restore the session's latest valid snapshot through the registered
    /// handler and emit `Restored` with the fresh sandbox id.
    pub async fn restore(&self, session_id: &str) -> Result<SandboxInfo> {
        let snapshot = self.get_latest(session_id).ok_or_else(|| {
            SandboxError::NotFound(format!("No valid snapshot for session '{session_id}'"))
        })?;
        let handler = self
            .handler
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SandboxError::Validation("No restore handler registered".into()))?;

        let sandbox = handler.restore(&snapshot).await?;
        metrics()
            .snapshots_restored
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(
            "snapshots: restored {} into sandbox {} for session {session_id}",
            snapshot.id, sandbox.id
        );
        self.events.emit(SnapshotEvent::Restored {
            snapshot,
            sandbox_id: sandbox.id.clone(),
        });
        Ok(sandbox)
    }

    /// Flip the expired flag. Returns false for unknown or already-expired
    /// snapshots.
    pub fn expire(&self, snapshot_id: &str) -> bool {
        let record = {
            let mut inner = self.inner.lock().unwrap();
            match inner.by_id.get_mut(snapshot_id) {
                Some(record) if !record.expired => {
                    record.expired = true;
                    Some(record.clone())
                }
                _ => None,
            }
        };
        match record {
            Some(record) => {
                metrics()
                    .snapshots_expired
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.events.emit(SnapshotEvent::Expired(record));
                true
            }
            None => false,
        }
    }

    /// Delete the record, fixing the per-session list.
    pub fn remove(&self, snapshot_id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            Self::remove_locked(&mut inner, snapshot_id)
        };
        match removed {
            Some(record) => {
                debug!("snapshots: removed {}", record.id);
                self.events.emit(SnapshotEvent::Cleaned(record));
                true
            }
            None => false,
        }
    }

    fn remove_locked(inner: &mut SnapInner, snapshot_id: &str) -> Option<SnapshotRecord> {
        let record = inner.by_id.remove(snapshot_id)?;
        if let Some(ids) = inner.by_session.get_mut(&record.session_id) {
            ids.retain(|id| id != snapshot_id);
            if ids.is_empty() {
                inner.by_session.remove(&record.session_id);
            }
        }
        Some(record)
    }

    /// Remove every snapshot whose TTL has elapsed, setting the expired
    /// flag first when it is still unset. Returns the removed ids.
    pub fn cleanup_expired(&self) -> Vec<String> {
        let ttl = self.config.ttl.as_secs();
        let now = now_ts();
        let mut expired_events = Vec::new();
        let mut cleaned_events = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let doomed: Vec<String> = inner
                .by_id
                .values()
                .filter(|r| now.saturating_sub(r.created_at) >= ttl)
                .map(|r| r.id.clone())
                .collect();
            for id in doomed {
                if let Some(record) = inner.by_id.get_mut(&id) {
                    if !record.expired {
                        record.expired = true;
                        expired_events.push(record.clone());
                    }
                }
                if let Some(record) = Self::remove_locked(&mut inner, &id) {
                    cleaned_events.push(record);
                }
            }
        }

        for record in expired_events {
            metrics()
                .snapshots_expired
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.events.emit(SnapshotEvent::Expired(record));
        }
        let ids = cleaned_events.iter().map(|r| r.id.clone()).collect();
        for record in cleaned_events {
            self.events.emit(SnapshotEvent::Cleaned(record));
        }
        ids
    }
}

impl Default for SnapshotManager {
    fn default() -> Self {
        Self::new(SnapshotConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(ttl_secs: u64, cap: usize) -> SnapshotManager {
        SnapshotManager::new(SnapshotConfig {
            ttl: Duration::from_secs(ttl_secs),
            max_per_session: cap,
        })
    }

    fn assert_indices_consistent(manager: &SnapshotManager) {
        let inner = manager.inner.lock().unwrap();
        for (session, ids) in &inner.by_session {
            for id in ids {
                let record = inner.by_id.get(id).expect("session list id missing from map");
                assert_eq!(&record.session_id, session);
            }
        }
        let listed: usize = inner.by_session.values().map(|ids| ids.len()).sum();
        assert_eq!(listed, inner.by_id.len(), "orphan records in primary map");
    }

    #[test]
    fn cap_evicts_oldest_first() {
        let manager = manager(3600, 3);
        for id in ["c1", "c2", "c3", "c4"] {
            manager.create(id, "sb-1", "s", "commit", false);
        }

        let records = manager.by_session("s");
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c4", "c3", "c2"]);
        assert!(manager.get("c1").is_none());
        assert_indices_consistent(&manager);
    }

    #[test]
    fn session_list_is_newest_first() {
        let manager = manager(3600, 10);
        manager.create("a", "sb", "s", "", false);
        manager.create("b", "sb", "s", "", false);
        let records = manager.by_session("s");
        assert_eq!(records[0].id, "b");
        assert!(records[0].created_at >= records[1].created_at);
    }

    #[test]
    fn get_latest_skips_and_marks_expired() {
        let manager = manager(3600, 10);
        manager.create("old", "sb", "s", "", false);
        manager.create("new", "sb", "s", "", false);
        assert!(manager.expire("new"));

        let latest = manager.get_latest("s").unwrap();
        assert_eq!(latest.id, "old");

        manager.expire("old");
        assert!(manager.get_latest("s").is_none());
        assert!(!manager.has_valid_snapshot("s"));
    }

    #[test]
    fn ttl_elapsed_snapshots_are_mark_expired_by_get_latest() {
        let manager = manager(0, 10); // everything expires instantly
        manager.create("c1", "sb", "s", "", false);
        assert!(manager.get_latest("s").is_none());
        // Side effect: the record is now flagged.
        assert!(manager.get("c1").unwrap().expired);
    }

    #[test]
    fn expire_is_idempotent() {
        let manager = manager(3600, 10);
        manager.create("c1", "sb", "s", "", false);
        assert!(manager.expire("c1"));
        assert!(!manager.expire("c1"));
        assert!(!manager.expire("missing"));
    }

    #[test]
    fn remove_fixes_both_indices() {
        let manager = manager(3600, 10);
        manager.create("c1", "sb", "s", "", false);
        manager.create("c2", "sb", "s", "", false);
        assert!(manager.remove("c1"));
        assert!(!manager.remove("c1"));
        assert_eq!(manager.by_session("s").len(), 1);
        assert_indices_consistent(&manager);
    }

    #[test]
    fn cleanup_expired_sets_flag_then_removes() {
        let manager = manager(0, 10);
        manager.create("c1", "sb", "s1", "", false);
        manager.create("c2", "sb", "s2", "", false);

        let mut events = manager.subscribe();
        let removed = manager.cleanup_expired();
        assert_eq!(removed.len(), 2);
        assert!(manager.by_session("s1").is_empty());
        assert_indices_consistent(&manager);

        let drained = events.drain();
        let expired = drained
            .iter()
            .filter(|e| matches!(e, SnapshotEvent::Expired(_)))
            .count();
        let cleaned = drained
            .iter()
            .filter(|e| matches!(e, SnapshotEvent::Cleaned(_)))
            .count();
        assert_eq!(expired, 2);
        assert_eq!(cleaned, 2);
    }

    #[test]
    fn valid_count_respects_cap() {
        let manager = manager(3600, 5);
        for i in 0..20 {
            manager.create(&format!("c{i}"), "sb", "s", "", false);
        }
        assert!(manager.valid_count("s") <= 5);
    }

    struct FixedRestore;

    #[async_trait]
    impl RestoreHandler for FixedRestore {
        async fn restore(&self, snapshot: &SnapshotRecord) -> Result<SandboxInfo> {
            Ok(SandboxInfo {
                id: format!("restored-from-{}", snapshot.id),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn restore_uses_latest_valid_and_emits_event() {
        let manager = manager(3600, 10);
        manager.on_restore(Arc::new(FixedRestore));
        manager.create("c1", "sb", "s", "commit-1", true);
        manager.create("c2", "sb", "s", "commit-2", false);

        let mut events = manager.subscribe();
        let sandbox = manager.restore("s").await.unwrap();
        assert_eq!(sandbox.id, "restored-from-c2");

        let restored = events
            .drain()
            .into_iter()
            .find_map(|e| match e {
                SnapshotEvent::Restored {
                    snapshot,
                    sandbox_id,
                } => Some((snapshot.id, sandbox_id)),
                _ => None,
            })
            .unwrap();
        assert_eq!(restored.0, "c2");
        assert_eq!(restored.1, "restored-from-c2");
    }

    #[tokio::test]
    async fn restore_without_handler_or_snapshot_fails() {
        let manager = manager(3600, 10);
        let err = manager.restore("s").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));

        manager.create("c1", "sb", "s", "", false);
        let err = manager.restore("s").await.unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
    }
}
