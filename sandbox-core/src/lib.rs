//! Sandbox orchestration core.
//!
//! Provisions, warms, gates, snapshots, restores, and recycles isolated
//! per-session execution environments against git repositories:
//!
//! - [`provider`]: backend-neutral sandbox lifecycle (local + hosted)
//! - [`image`]: image registry, tag grammar, and the scheduled builder
//! - [`pool`]: warm pool with per-tag replenishment and TTL sweeps
//! - [`gate`]: write-tool admission control against git sync state
//! - [`snapshot`]: per-session snapshot ring with restore
//! - [`github`]: GitHub App JWT + installation-token authentication

pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod github;
pub mod http;
pub mod image;
pub mod metrics;
pub mod poll;
pub mod pool;
pub mod provider;
pub mod snapshot;
pub mod util;

pub use config::OrchestratorConfig;
pub use error::{Result, SandboxError};
pub use gate::{GateDecision, PendingEdit, SyncGate, SyncGateConfig, ToolClass, classify};
pub use image::builder::{
    BuildBackend, BuildEvent, BuildJob, BuildRequest, BuildResult, BuildStage, BuildTarget,
    BuilderConfig, ImageBuilder, ShellBuildBackend,
};
pub use image::registry::{ImageQuery, ImageRegistry, RegistryConfig};
pub use image::{Image, ParsedTag, generate_tag, parse_tag};
pub use pool::{ClaimOutcome, PoolEntry, WarmPool, WarmPoolConfig, derive_tag};
pub use provider::hosted::{HostedConfig, HostedProvider};
pub use provider::local::LocalProvider;
pub use provider::{
    CreateInput, ExecOptions, ExecResult, GitState, ImageRef, LogStream, NetworkInfo, Provider,
    SandboxInfo, SandboxStatus, ServiceInfo, ServiceStatus, SyncStatus, TimeInfo,
};
pub use snapshot::{
    RestoreHandler, SnapshotConfig, SnapshotEvent, SnapshotManager, SnapshotRecord,
};
