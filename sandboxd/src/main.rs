//! Sandbox orchestration daemon.
//!
//! Wires the component graph (provider, registry, builder, warm pool, sync
//! gate, snapshot manager), starts the background schedules, and serves the
//! collaboration API.

use std::sync::Arc;

use sandbox_core::github::{AppAuth, GitHubAppConfig};
use sandbox_core::snapshot::RestoreHandler;
use sandbox_core::{
    BuildTarget, BuilderConfig, HostedConfig, HostedProvider, ImageBuilder, ImageRegistry,
    LocalProvider, OrchestratorConfig, Provider, RegistryConfig, Result, SandboxInfo,
    ShellBuildBackend, SnapshotConfig, SnapshotManager, SnapshotRecord, WarmPool, WarmPoolConfig,
};
use sandbox_collab::{CollabState, collab_router};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Restores snapshots through the configured provider.
struct ProviderRestore {
    provider: Arc<dyn Provider>,
}

#[async_trait::async_trait]
impl RestoreHandler for ProviderRestore {
    async fn restore(&self, snapshot: &SnapshotRecord) -> Result<SandboxInfo> {
        self.provider.restore(&snapshot.id).await
    }
}

fn build_provider(config: &OrchestratorConfig) -> Result<Arc<dyn Provider>> {
    let backend = std::env::var("SANDBOX_BACKEND").unwrap_or_else(|_| "local".to_string());
    match backend.as_str() {
        "hosted" => {
            let hosted = HostedConfig::resolve(
                config.hosted_token_id.clone(),
                config.hosted_token_secret.clone(),
                config.hosted_app_name.clone(),
                config.hosted_api_base_url.clone(),
            )?;
            info!("provider: hosted backend at {}", hosted.api_base_url);
            Ok(Arc::new(HostedProvider::new(hosted)?))
        }
        _ => {
            info!(
                "provider: local backend under {}",
                config.local_base_path.display()
            );
            Ok(Arc::new(LocalProvider::new(config.local_base_path.clone())?))
        }
    }
}

/// Parse `BUILD_TARGETS="org/repo#main,org/other#develop"`.
fn build_targets() -> Vec<BuildTarget> {
    std::env::var("BUILD_TARGETS")
        .unwrap_or_default()
        .split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let (repository, branch) = entry.split_once('#').unwrap_or((entry, "main"));
            Some(BuildTarget {
                repository: repository.to_string(),
                branch: branch.to_string(),
            })
        })
        .collect()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = OrchestratorConfig::load();
    let shutdown = CancellationToken::new();

    let provider = match build_provider(config) {
        Ok(provider) => provider,
        Err(err) => {
            error!("failed to initialize provider: {err}");
            std::process::exit(1);
        }
    };

    // Image pipeline.
    let registry = Arc::new(ImageRegistry::new(RegistryConfig {
        max_images_per_branch: config.max_images_per_branch,
        max_image_age: config.max_image_age,
    }));
    let auth = match (
        &config.github_app_id,
        &config.github_private_key,
        &config.github_installation_id,
    ) {
        (Some(app_id), Some(private_key), Some(installation_id)) => {
            info!("builder: GitHub App auth configured (app {app_id})");
            Some(Arc::new(AppAuth::new(GitHubAppConfig {
                app_id: app_id.clone(),
                private_key: private_key.clone(),
                installation_id: installation_id.clone(),
            })))
        }
        _ => None,
    };
    let builder = ImageBuilder::new(
        BuilderConfig {
            max_concurrent_builds: config.max_concurrent_builds,
            build_timeout: config.build_timeout,
            test_timeout: config.test_timeout,
            rebuild_interval: config.rebuild_interval,
            registry_prefix: config.registry_prefix.clone(),
            work_dir: config.local_base_path.join("builds"),
        },
        registry.clone(),
        Arc::new(ShellBuildBackend::default()),
        auth,
    );
    let targets = build_targets();
    if !targets.is_empty() {
        info!("builder: scheduling rebuilds for {} target(s)", targets.len());
        let _schedule = builder.start_schedule(targets, shutdown.clone());
    }

    // Warm pool.
    let pool = WarmPool::new(
        WarmPoolConfig {
            size: config.pool_size,
            ttl: config.pool_ttl,
            replenish_interval: config.pool_replenish_interval,
            typing_trigger: config.pool_typing_trigger,
            ..WarmPoolConfig::default()
        },
        provider.clone(),
    );
    let _sweeper = pool.start(shutdown.clone());

    // Snapshots restore through whichever provider is configured. The sync
    // gate is constructed by the agent tool layer, which consumes this
    // daemon; it has no standalone wiring here.
    let snapshots = Arc::new(SnapshotManager::new(SnapshotConfig {
        ttl: config.snapshot_ttl,
        max_per_session: config.max_snapshots_per_session,
    }));
    snapshots.on_restore(Arc::new(ProviderRestore {
        provider: provider.clone(),
    }));

    // HTTP surface.
    let state = CollabState::new(Some(provider.clone()));
    let router = collab_router(state);

    let listener = match tokio::net::TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {err}", config.listen_addr);
            std::process::exit(1);
        }
    };
    info!("listening on {}", config.listen_addr);

    let serve = axum::serve(listener, router).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    if let Err(err) = serve.await {
        error!("server error: {err}");
    }
}
