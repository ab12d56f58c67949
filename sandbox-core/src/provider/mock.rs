//! In-memory test double for the [`Provider`] contract.
//!
//! Used by unit and integration tests across the workspace; lifecycle is
//! instantaneous unless `ready_delay` is set.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Result, SandboxError};
use crate::provider::{
    CreateInput, ExecOptions, ExecResult, GitState, ImageRef, LogStream, NetworkInfo, Provider,
    SandboxInfo, SandboxStatus, SyncStatus, TimeInfo,
};
use crate::util::{next_id, now_ts};

#[derive(Default)]
pub struct MockProvider {
    records: Arc<DashMap<String, SandboxInfo>>,
    snapshots: DashMap<String, SandboxInfo>,
    /// Delay before a created sandbox flips from Initializing to Ready.
    pub ready_delay: Option<Duration>,
    /// When set, `create` fails with backend-unavailable.
    pub fail_creates: AtomicBool,
    pub create_count: AtomicU32,
    pub terminate_count: AtomicU32,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ready_delay(delay: Duration) -> Self {
        Self {
            ready_delay: Some(delay),
            ..Default::default()
        }
    }

    /// Force a sandbox's lifecycle status (test hook).
    pub fn set_status(&self, id: &str, status: SandboxStatus) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.status = status;
        }
    }

    /// Force a sandbox's git sync status (test hook).
    pub fn set_sync_status(&self, id: &str, status: SyncStatus) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.git.sync_status = status;
        }
    }
}

#[async_trait::async_trait]
impl Provider for MockProvider {
    async fn create(&self, input: CreateInput) -> Result<SandboxInfo> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(SandboxError::Backend {
                status: 503,
                body: "mock backend unavailable".into(),
            });
        }
        self.create_count.fetch_add(1, Ordering::SeqCst);

        let id = next_id("mock");
        let now = now_ts();
        let delayed = self.ready_delay.is_some();
        let record = SandboxInfo {
            id: id.clone(),
            project_id: input.project_id,
            status: if delayed {
                SandboxStatus::Initializing
            } else {
                SandboxStatus::Ready
            },
            image: ImageRef {
                tag: input.image_tag.unwrap_or_default(),
                ..Default::default()
            },
            git: GitState {
                repo: input.repo,
                branch: input.branch,
                commit: String::new(),
                sync_status: SyncStatus::Pending,
                synced_at: None,
            },
            services: Vec::new(),
            network: NetworkInfo::default(),
            snapshot: None,
            time: TimeInfo {
                created: now,
                ready: if delayed { None } else { Some(now) },
                last_activity: now,
            },
        };
        self.records.insert(id.clone(), record.clone());

        if let Some(delay) = self.ready_delay {
            let records = self.records.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(mut record) = records.get_mut(&id) {
                    if record.status == SandboxStatus::Initializing {
                        record.status = SandboxStatus::Ready;
                        record.time.ready = Some(now_ts());
                    }
                }
            });
        }
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<SandboxInfo>> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    async fn list(&self, project_id: Option<&str>) -> Result<Vec<SandboxInfo>> {
        Ok(self
            .records
            .iter()
            .filter(|r| project_id.is_none_or(|p| r.project_id == p))
            .map(|r| r.clone())
            .collect())
    }

    async fn start(&self, id: &str) -> Result<SandboxInfo> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| SandboxError::NotFound(format!("Sandbox '{id}' not found")))?;
        if record.status == SandboxStatus::Terminated {
            return Err(SandboxError::InvalidState(format!(
                "Cannot start terminated sandbox '{id}'"
            )));
        }
        record.status = SandboxStatus::Running;
        Ok(record.clone())
    }

    async fn stop(&self, id: &str) -> Result<SandboxInfo> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| SandboxError::NotFound(format!("Sandbox '{id}' not found")))?;
        if record.status == SandboxStatus::Running {
            record.status = SandboxStatus::Suspended;
        }
        Ok(record.clone())
    }

    async fn terminate(&self, id: &str) -> Result<()> {
        if let Some(mut record) = self.records.get_mut(id) {
            if record.status != SandboxStatus::Terminated {
                record.status = SandboxStatus::Terminated;
                self.terminate_count.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn snapshot(&self, id: &str) -> Result<String> {
        let record = self
            .records
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| SandboxError::NotFound(format!("Sandbox '{id}' not found")))?;
        let snapshot_id = next_id("snap");
        self.snapshots.insert(snapshot_id.clone(), record);
        Ok(snapshot_id)
    }

    async fn restore(&self, snapshot_id: &str) -> Result<SandboxInfo> {
        let source = self
            .snapshots
            .get(snapshot_id)
            .map(|s| s.clone())
            .ok_or_else(|| {
                SandboxError::NotFound(format!("Snapshot '{snapshot_id}' not found"))
            })?;
        let id = next_id("mock");
        let now = now_ts();
        let mut record = source;
        record.id = id.clone();
        record.status = SandboxStatus::Ready;
        record.git.sync_status = SyncStatus::Pending;
        record.git.synced_at = None;
        record.snapshot = Some(snapshot_id.to_string());
        record.time = TimeInfo {
            created: now,
            ready: Some(now),
            last_activity: now,
        };
        self.records.insert(id, record.clone());
        Ok(record)
    }

    async fn execute(&self, id: &str, argv: &[String], _opts: ExecOptions) -> Result<ExecResult> {
        if let Some(mut record) = self.records.get_mut(id) {
            record.time.last_activity = now_ts();
        }
        Ok(ExecResult {
            exit_code: 0,
            stdout: argv.join(" "),
            stderr: String::new(),
            duration_ms: 0,
        })
    }

    async fn stream_logs(&self, _id: &str, _service: &str) -> Result<LogStream> {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        drop(tx);
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn sync_git(&self, id: &str) -> Result<GitState> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| SandboxError::NotFound(format!("Sandbox '{id}' not found")))?;
        record.git.sync_status = SyncStatus::Synced;
        record.git.commit = "mockcommit".into();
        record.git.synced_at = Some(now_ts());
        Ok(record.git.clone())
    }

    async fn git_status(&self, id: &str) -> Result<GitState> {
        self.records
            .get(id)
            .map(|r| r.git.clone())
            .ok_or_else(|| SandboxError::NotFound(format!("Sandbox '{id}' not found")))
    }
}

