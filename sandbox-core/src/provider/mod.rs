//! Backend-neutral sandbox lifecycle contract.
//!
//! Every backend (local processes, hosted serverless) satisfies the
//! [`Provider`] trait. Callers hold sandboxes by id only; `SandboxInfo`
//! values returned from the trait are immutable snapshots of backend state.

pub mod hosted;
pub mod local;
pub mod mock;

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_stream::Stream;

use crate::error::Result;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    #[default]
    Initializing,
    Ready,
    Running,
    Suspended,
    Terminated,
}

impl SandboxStatus {
    /// Lifecycle advances monotonically except `running ↔ suspended`;
    /// `terminated` is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, SandboxStatus::Terminated)
    }

    pub fn at_least_ready(self) -> bool {
        !matches!(self, SandboxStatus::Initializing)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    Syncing,
    Synced,
    Error,
}

/// Immutable reference to a built image artifact.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub id: String,
    pub tag: String,
    pub digest: String,
    pub built_at: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GitState {
    pub repo: String,
    pub branch: String,
    /// Populated only when `sync_status == Synced`.
    #[serde(default)]
    pub commit: String,
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub synced_at: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

/// Developer-facing side process inside a sandbox (e.g. a dev server).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub status: ServiceStatus,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub internal_ip: String,
    #[serde(default)]
    pub ports: HashMap<String, u16>,
    #[serde(default)]
    pub public_url: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TimeInfo {
    pub created: u64,
    /// Set exactly once, when the sandbox first reaches `Ready`.
    #[serde(default)]
    pub ready: Option<u64>,
    pub last_activity: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub id: String,
    pub project_id: String,
    pub status: SandboxStatus,
    pub image: ImageRef,
    pub git: GitState,
    #[serde(default)]
    pub services: Vec<ServiceInfo>,
    pub network: NetworkInfo,
    /// Back-reference to the snapshot this sandbox was restored from.
    #[serde(default)]
    pub snapshot: Option<String>,
    pub time: TimeInfo,
}

/// Parameters for `Provider::create`.
#[derive(Clone, Debug, Default)]
pub struct CreateInput {
    pub project_id: String,
    pub repo: String,
    pub branch: String,
    pub image_tag: Option<String>,
    pub env: HashMap<String, String>,
    pub services: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Lazy, cancellable sequence of UTF-8 text chunks (lossily decoded).
pub type LogStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Backend-specific sandbox lifecycle.
///
/// Implementations must be race-safe: a `terminate` concurrent with a
/// background clone must not be overwritten back to a live status. Any
/// status-mutating background task re-reads the current status first and
/// aborts when it is `Terminated`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Allocate a sandbox in `Initializing` and kick off the git clone
    /// asynchronously; returns immediately. Failed creates leave no record.
    async fn create(&self, input: CreateInput) -> Result<SandboxInfo>;

    /// Pure observation; may refresh cached status from the backend.
    async fn get(&self, id: &str) -> Result<Option<SandboxInfo>>;

    async fn list(&self, project_id: Option<&str>) -> Result<Vec<SandboxInfo>>;

    /// Forbidden on `Terminated`.
    async fn start(&self, id: &str) -> Result<SandboxInfo>;

    async fn stop(&self, id: &str) -> Result<SandboxInfo>;

    /// Idempotent after the first call: a subsequent `get` returns
    /// `Terminated` or `None`.
    async fn terminate(&self, id: &str) -> Result<()>;

    /// Capture workspace (and, backend permitting, process) state.
    /// Does not change the sandbox status.
    async fn snapshot(&self, id: &str) -> Result<String>;

    /// Materialize a fresh sandbox pre-populated from a snapshot. The
    /// returned sandbox is `Ready`; its git state is copied from the
    /// snapshot but must be refreshed via `sync_git` before writes.
    async fn restore(&self, snapshot_id: &str) -> Result<SandboxInfo>;

    /// Run a command inside the sandbox. Backend/transport failures are
    /// surfaced as `exit_code = 1` with the error in `stderr`, not as an
    /// error result. Updates `time.last_activity`.
    async fn execute(&self, id: &str, argv: &[String], opts: ExecOptions) -> Result<ExecResult>;

    async fn stream_logs(&self, id: &str, service: &str) -> Result<LogStream>;

    /// Re-sync the sandbox's clone against its remote.
    async fn sync_git(&self, id: &str) -> Result<GitState>;

    async fn git_status(&self, id: &str) -> Result<GitState>;
}
