//! Local backend: sandboxes are per-sandbox working directories on the host.
//!
//! - clone lands in `{base}/{id}/workspace` via the `git` CLI
//! - exec spawns host processes with the sandbox cwd and merged environment
//! - snapshot is a recursive copy of the working directory into the
//!   snapshots directory; restore is the inverse copy into a fresh sandbox

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SandboxError};
use crate::provider::{
    CreateInput, ExecOptions, ExecResult, GitState, ImageRef, LogStream, NetworkInfo, Provider,
    SandboxInfo, SandboxStatus, ServiceInfo, ServiceStatus, SyncStatus, TimeInfo,
};
use crate::util::{next_id, now_ms, now_ts};

#[derive(Clone, Debug)]
struct LocalSnapshot {
    id: String,
    sandbox_id: String,
    project_id: String,
    path: PathBuf,
    image: ImageRef,
    git: GitState,
}

pub struct LocalProvider {
    base_dir: PathBuf,
    snapshots_dir: PathBuf,
    records: Arc<DashMap<String, SandboxInfo>>,
    snapshots: DashMap<String, LocalSnapshot>,
}

impl LocalProvider {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        let snapshots_dir = base_dir.join("snapshots");
        std::fs::create_dir_all(&base_dir)?;
        std::fs::create_dir_all(&snapshots_dir)?;
        Ok(Self {
            base_dir,
            snapshots_dir,
            records: Arc::new(DashMap::new()),
            snapshots: DashMap::new(),
        })
    }

    fn sandbox_dir(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }

    fn workspace_dir(&self, id: &str) -> PathBuf {
        self.sandbox_dir(id).join("workspace")
    }

    fn require(&self, id: &str) -> Result<SandboxInfo> {
        self.records
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| SandboxError::NotFound(format!("Sandbox '{id}' not found")))
    }

    /// Apply `f` to the record unless the sandbox has been terminated in the
    /// meantime. This is the post-step check that keeps background tasks
    /// from resurrecting a terminated sandbox.
    fn update_unless_terminated<F>(records: &DashMap<String, SandboxInfo>, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut SandboxInfo),
    {
        match records.get_mut(id) {
            Some(mut record) if record.status != SandboxStatus::Terminated => {
                f(&mut record);
                true
            }
            _ => false,
        }
    }

    /// Background setup: prepare the workspace, mark ready, then clone.
    async fn provision(records: Arc<DashMap<String, SandboxInfo>>, id: String, dir: PathBuf) {
        let workspace = dir.join("workspace");
        let logs = dir.join("logs");
        if let Err(err) = tokio::fs::create_dir_all(&workspace).await {
            error!("local: failed to create workspace for {id}: {err}");
            Self::update_unless_terminated(&records, &id, |r| {
                r.git.sync_status = SyncStatus::Error;
            });
            return;
        }
        let _ = tokio::fs::create_dir_all(&logs).await;

        let now = now_ts();
        if !Self::update_unless_terminated(&records, &id, |r| {
            r.status = SandboxStatus::Ready;
            if r.time.ready.is_none() {
                r.time.ready = Some(now);
            }
        }) {
            debug!("local: sandbox {id} terminated before ready, abandoning provision");
            return;
        }

        let (repo, branch) = match records.get(&id) {
            Some(r) => (r.git.repo.clone(), r.git.branch.clone()),
            None => return,
        };
        if repo.is_empty() {
            return;
        }

        if !Self::update_unless_terminated(&records, &id, |r| {
            r.git.sync_status = SyncStatus::Syncing;
        }) {
            return;
        }

        match clone_repository(&repo, &branch, &workspace).await {
            Ok(commit) => {
                let synced = Self::update_unless_terminated(&records, &id, |r| {
                    r.git.sync_status = SyncStatus::Synced;
                    r.git.commit = commit.clone();
                    r.git.synced_at = Some(now_ts());
                });
                if synced {
                    info!("local: sandbox {id} synced at {commit}");
                } else {
                    debug!("local: sandbox {id} terminated during clone, result dropped");
                }
            }
            Err(err) => {
                warn!("local: clone failed for sandbox {id}: {err}");
                Self::update_unless_terminated(&records, &id, |r| {
                    r.git.sync_status = SyncStatus::Error;
                });
            }
        }
    }
}

async fn run_git(args: &[&str], cwd: Option<&Path>) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args).stdin(Stdio::null());
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    let output = cmd
        .output()
        .await
        .map_err(|err| SandboxError::Git(format!("failed to run git: {err}")))?;
    if !output.status.success() {
        return Err(SandboxError::Git(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn clone_repository(repo: &str, branch: &str, workspace: &Path) -> Result<String> {
    let dest = workspace.to_string_lossy().to_string();
    let mut args = vec!["clone"];
    if !branch.is_empty() {
        args.extend(["--branch", branch]);
    }
    args.push(repo);
    args.push(&dest);
    // `git clone` refuses a non-empty destination; the workspace was just created.
    run_git(&args, None).await?;
    run_git(&["rev-parse", "HEAD"], Some(workspace)).await
}

/// Recursive directory copy on the blocking pool.
fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
        // Symlinks and special files are not part of workspace state.
    }
    Ok(())
}

async fn copy_tree(src: PathBuf, dst: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || copy_dir_recursive(&src, &dst))
        .await
        .map_err(|err| SandboxError::Io(format!("copy task panicked: {err}")))?
        .map_err(SandboxError::from)
}

#[async_trait::async_trait]
impl Provider for LocalProvider {
    async fn create(&self, input: CreateInput) -> Result<SandboxInfo> {
        let id = next_id("sandbox");
        let dir = self.sandbox_dir(&id);
        let now = now_ts();

        let record = SandboxInfo {
            id: id.clone(),
            project_id: input.project_id.clone(),
            status: SandboxStatus::Initializing,
            image: ImageRef {
                tag: input.image_tag.clone().unwrap_or_default(),
                ..Default::default()
            },
            git: GitState {
                repo: input.repo.clone(),
                branch: input.branch.clone(),
                commit: String::new(),
                sync_status: SyncStatus::Pending,
                synced_at: None,
            },
            services: input
                .services
                .iter()
                .map(|name| ServiceInfo {
                    name: name.clone(),
                    status: ServiceStatus::Stopped,
                    port: None,
                    url: None,
                })
                .collect(),
            network: NetworkInfo {
                internal_ip: "127.0.0.1".to_string(),
                ports: HashMap::new(),
                public_url: None,
            },
            snapshot: None,
            time: TimeInfo {
                created: now,
                ready: None,
                last_activity: now,
            },
        };

        self.records.insert(id.clone(), record.clone());
        crate::metrics::metrics().record_sandbox_created();

        let records = self.records.clone();
        tokio::spawn(async move {
            Self::provision(records, id, dir).await;
        });

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
        let record = self.require(id)?;
        match record.status {
            SandboxStatus::Terminated => Err(SandboxError::InvalidState(format!(
                "Cannot start terminated sandbox '{id}'"
            ))),
            SandboxStatus::Initializing => Err(SandboxError::InvalidState(format!(
                "Sandbox '{id}' is still initializing"
            ))),
            _ => {
                Self::update_unless_terminated(&self.records, id, |r| {
                    r.status = SandboxStatus::Running;
                    r.time.last_activity = now_ts();
                });
                self.require(id)
            }
        }
    }

    async fn stop(&self, id: &str) -> Result<SandboxInfo> {
        let record = self.require(id)?;
        match record.status {
            SandboxStatus::Terminated => Err(SandboxError::InvalidState(format!(
                "Cannot stop terminated sandbox '{id}'"
            ))),
            SandboxStatus::Running => {
                Self::update_unless_terminated(&self.records, id, |r| {
                    r.status = SandboxStatus::Suspended;
                });
                self.require(id)
            }
            _ => Ok(record),
        }
    }

    async fn terminate(&self, id: &str) -> Result<()> {
        let Some(mut record) = self.records.get_mut(id) else {
            return Ok(());
        };
        if record.status == SandboxStatus::Terminated {
            return Ok(());
        }
        record.status = SandboxStatus::Terminated;
        drop(record);
        crate::metrics::metrics().record_sandbox_terminated();

        let dir = self.sandbox_dir(id);
        tokio::spawn(async move {
            let _ = tokio::fs::remove_dir_all(dir).await;
        });
        Ok(())
    }

    async fn snapshot(&self, id: &str) -> Result<String> {
        let record = self.require(id)?;
        if record.status == SandboxStatus::Terminated {
            return Err(SandboxError::InvalidState(format!(
                "Cannot snapshot terminated sandbox '{id}'"
            )));
        }
        let snapshot_id = next_id("snap");
        let dest = self.snapshots_dir.join(&snapshot_id);
        copy_tree(self.workspace_dir(id), dest.clone()).await?;

        self.snapshots.insert(
            snapshot_id.clone(),
            LocalSnapshot {
                id: snapshot_id.clone(),
                sandbox_id: id.to_string(),
                project_id: record.project_id.clone(),
                path: dest,
                image: record.image.clone(),
                git: record.git.clone(),
            },
        );
        Self::update_unless_terminated(&self.records, id, |r| {
            r.snapshot = Some(snapshot_id.clone());
        });
        Ok(snapshot_id)
    }

    async fn restore(&self, snapshot_id: &str) -> Result<SandboxInfo> {
        let snapshot = self
            .snapshots
            .get(snapshot_id)
            .map(|s| s.clone())
            .ok_or_else(|| {
                SandboxError::NotFound(format!("Snapshot '{snapshot_id}' not found"))
            })?;

        let id = next_id("sandbox");
        debug!(
            "local: restoring snapshot {} (from sandbox {}) into {id}",
            snapshot.id, snapshot.sandbox_id
        );
        let workspace = self.workspace_dir(&id);
        copy_tree(snapshot.path.clone(), workspace).await?;
        let _ = tokio::fs::create_dir_all(self.sandbox_dir(&id).join("logs")).await;

        let now = now_ts();
        let mut git = snapshot.git.clone();
        // The clone may have drifted since the snapshot; require a fresh
        // sync before the gate admits writes.
        git.sync_status = SyncStatus::Pending;
        git.synced_at = None;

        let record = SandboxInfo {
            id: id.clone(),
            project_id: snapshot.project_id.clone(),
            status: SandboxStatus::Ready,
            image: snapshot.image.clone(),
            git,
            services: Vec::new(),
            network: NetworkInfo {
                internal_ip: "127.0.0.1".to_string(),
                ports: HashMap::new(),
                public_url: None,
            },
            snapshot: Some(snapshot.id.clone()),
            time: TimeInfo {
                created: now,
                ready: Some(now),
                last_activity: now,
            },
        };
        self.records.insert(id, record.clone());
        crate::metrics::metrics().record_sandbox_created();
        Ok(record)
    }

    async fn execute(&self, id: &str, argv: &[String], opts: ExecOptions) -> Result<ExecResult> {
        let record = self.require(id)?;
        if record.status == SandboxStatus::Terminated {
            return Err(SandboxError::InvalidState(format!(
                "Cannot execute in terminated sandbox '{id}'"
            )));
        }
        let Some((program, args)) = argv.split_first() else {
            return Err(SandboxError::Validation("empty argv".into()));
        };

        let cwd = opts
            .cwd
            .map(PathBuf::from)
            .unwrap_or_else(|| self.workspace_dir(id));

        Self::update_unless_terminated(&self.records, id, |r| {
            r.time.last_activity = now_ts();
        });

        let started = now_ms();
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&cwd)
            .envs(&opts.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                return Ok(ExecResult {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: format!("failed to spawn '{program}': {err}"),
                    duration_ms: now_ms().saturating_sub(started),
                });
            }
        };

        let wait = child.wait_with_output();
        let output = match opts.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => {
                    return Ok(ExecResult {
                        exit_code: 1,
                        stdout: String::new(),
                        stderr: format!("command timed out after {}ms", limit.as_millis()),
                        duration_ms: now_ms().saturating_sub(started),
                    });
                }
            },
            None => wait.await,
        };

        match output {
            Ok(output) => Ok(ExecResult {
                exit_code: output.status.code().unwrap_or(1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                duration_ms: now_ms().saturating_sub(started),
            }),
            Err(err) => Ok(ExecResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("failed to collect output: {err}"),
                duration_ms: now_ms().saturating_sub(started),
            }),
        }
    }

    async fn stream_logs(&self, id: &str, service: &str) -> Result<LogStream> {
        self.require(id)?;
        let path = self.sandbox_dir(id).join("logs").join(format!("{service}.log"));
        let mut file = tokio::fs::File::open(&path).await.map_err(|_| {
            SandboxError::NotFound(format!("No logs for service '{service}' in sandbox '{id}'"))
        })?;

        let (tx, rx) = mpsc::channel::<String>(16);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                match file.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                        if tx.send(chunk).await.is_err() {
                            break; // receiver dropped — cancelled
                        }
                    }
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn sync_git(&self, id: &str) -> Result<GitState> {
        let record = self.require(id)?;
        if record.status == SandboxStatus::Terminated {
            return Err(SandboxError::InvalidState(format!(
                "Cannot sync terminated sandbox '{id}'"
            )));
        }
        let workspace = self.workspace_dir(id);

        Self::update_unless_terminated(&self.records, id, |r| {
            r.git.sync_status = SyncStatus::Syncing;
        });

        let result = async {
            run_git(&["pull", "--ff-only"], Some(&workspace)).await?;
            run_git(&["rev-parse", "HEAD"], Some(&workspace)).await
        }
        .await;

        match result {
            Ok(commit) => {
                Self::update_unless_terminated(&self.records, id, |r| {
                    r.git.sync_status = SyncStatus::Synced;
                    r.git.commit = commit.clone();
                    r.git.synced_at = Some(now_ts());
                });
                self.git_status(id).await
            }
            Err(err) => {
                Self::update_unless_terminated(&self.records, id, |r| {
                    r.git.sync_status = SyncStatus::Error;
                });
                Err(err)
            }
        }
    }

    async fn git_status(&self, id: &str) -> Result<GitState> {
        Ok(self.require(id)?.git)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn provider() -> (tempfile::TempDir, LocalProvider) {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path().join("state")).unwrap();
        (dir, provider)
    }

    fn input() -> CreateInput {
        CreateInput {
            project_id: "proj".into(),
            repo: String::new(), // no clone in unit tests
            branch: "main".into(),
            ..Default::default()
        }
    }

    async fn wait_ready(provider: &LocalProvider, id: &str) {
        for _ in 0..100 {
            if let Some(info) = provider.get(id).await.unwrap() {
                if info.status == SandboxStatus::Ready {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sandbox {id} never became ready");
    }

    #[tokio::test]
    async fn create_transitions_to_ready() {
        let (_tmp, provider) = provider();
        let created = provider.create(input()).await.unwrap();
        assert_eq!(created.status, SandboxStatus::Initializing);
        assert!(created.time.ready.is_none());

        wait_ready(&provider, &created.id).await;
        let info = provider.get(&created.id).await.unwrap().unwrap();
        assert!(info.time.ready.is_some());
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_sticky() {
        let (_tmp, provider) = provider();
        let created = provider.create(input()).await.unwrap();
        wait_ready(&provider, &created.id).await;

        provider.terminate(&created.id).await.unwrap();
        provider.terminate(&created.id).await.unwrap();
        let info = provider.get(&created.id).await.unwrap().unwrap();
        assert_eq!(info.status, SandboxStatus::Terminated);

        let err = provider.start(&created.id).await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidState(_)));
    }

    #[tokio::test]
    async fn terminate_during_provision_is_not_overwritten() {
        let (_tmp, provider) = provider();
        let created = provider.create(input()).await.unwrap();
        // Terminate immediately, racing the background provision task.
        provider.terminate(&created.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let info = provider.get(&created.id).await.unwrap().unwrap();
        assert_eq!(info.status, SandboxStatus::Terminated);
    }

    #[tokio::test]
    async fn execute_runs_in_workspace() {
        let (_tmp, provider) = provider();
        let created = provider.create(input()).await.unwrap();
        wait_ready(&provider, &created.id).await;

        let result = provider
            .execute(
                &created.id,
                &["sh".into(), "-c".into(), "echo hello && pwd".into()],
                ExecOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello"));
        assert!(result.stdout.contains("workspace"));
    }

    #[tokio::test]
    async fn execute_surfaces_spawn_failure_as_exit_one() {
        let (_tmp, provider) = provider();
        let created = provider.create(input()).await.unwrap();
        wait_ready(&provider, &created.id).await;

        let result = provider
            .execute(
                &created.id,
                &["definitely-not-a-real-binary-xyz".into()],
                ExecOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(!result.stderr.is_empty());
    }

    #[tokio::test]
    async fn execute_timeout_is_exit_one() {
        let (_tmp, provider) = provider();
        let created = provider.create(input()).await.unwrap();
        wait_ready(&provider, &created.id).await;

        let result = provider
            .execute(
                &created.id,
                &["sleep".into(), "5".into()],
                ExecOptions {
                    timeout: Some(Duration::from_millis(50)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip() {
        let (_tmp, provider) = provider();
        let created = provider.create(input()).await.unwrap();
        wait_ready(&provider, &created.id).await;

        let marker = provider.workspace_dir(&created.id).join("state.txt");
        tokio::fs::write(&marker, b"42").await.unwrap();

        let snapshot_id = provider.snapshot(&created.id).await.unwrap();
        let restored = provider.restore(&snapshot_id).await.unwrap();
        assert_ne!(restored.id, created.id);
        assert_eq!(restored.status, SandboxStatus::Ready);
        assert_eq!(restored.snapshot.as_deref(), Some(snapshot_id.as_str()));
        // Git state must be re-synced before writes are allowed again.
        assert_eq!(restored.git.sync_status, SyncStatus::Pending);

        let copied = provider.workspace_dir(&restored.id).join("state.txt");
        let content = tokio::fs::read_to_string(copied).await.unwrap();
        assert_eq!(content, "42");
    }

    #[tokio::test]
    async fn restore_unknown_snapshot_is_not_found() {
        let (_tmp, provider) = provider();
        let err = provider.restore("snap-missing").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }

    #[tokio::test]
    async fn stream_logs_tails_service_file() {
        let (_tmp, provider) = provider();
        let created = provider.create(input()).await.unwrap();
        wait_ready(&provider, &created.id).await;

        let log_path = provider
            .sandbox_dir(&created.id)
            .join("logs")
            .join("dev.log");
        tokio::fs::write(&log_path, b"line one\nline two\n")
            .await
            .unwrap();

        let mut stream = provider.stream_logs(&created.id, "dev").await.unwrap();
        let mut collected = String::new();
        use tokio_stream::StreamExt;
        while let Some(chunk) = stream.next().await {
            collected.push_str(&chunk);
        }
        assert!(collected.contains("line one"));
        assert!(collected.contains("line two"));
    }

    /// End-to-end clone + sync against a real local git repository.
    /// Skipped when `git` is not installed.
    #[tokio::test]
    async fn clone_and_sync_against_local_repo() {
        if std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_err()
        {
            return;
        }

        let (tmp, provider) = provider();
        let origin = tmp.path().join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        let git = |args: &[&str], cwd: &Path| {
            let status = std::process::Command::new("git")
                .args(args)
                .current_dir(cwd)
                .env("GIT_AUTHOR_NAME", "test")
                .env("GIT_AUTHOR_EMAIL", "test@example.com")
                .env("GIT_COMMITTER_NAME", "test")
                .env("GIT_COMMITTER_EMAIL", "test@example.com")
                .output()
                .unwrap();
            assert!(status.status.success(), "git {args:?} failed");
        };
        git(&["init", "-b", "main"], &origin);
        std::fs::write(origin.join("README.md"), "hi").unwrap();
        git(&["add", "."], &origin);
        git(&["commit", "-m", "init"], &origin);

        let created = provider
            .create(CreateInput {
                project_id: "proj".into(),
                repo: origin.to_string_lossy().to_string(),
                branch: "main".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        for _ in 0..200 {
            let info = provider.get(&created.id).await.unwrap().unwrap();
            if info.git.sync_status == SyncStatus::Synced {
                assert!(!info.git.commit.is_empty());
                assert!(info.git.synced_at.is_some());
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("clone never reached synced");
    }
}
