//! End-to-end flow across pool, gate, snapshots, and provider:
//! claim → gated writes → snapshot on agent-done → restore → re-sync.

use std::sync::Arc;
use std::time::Duration;

use sandbox_core::provider::mock::MockProvider;
use sandbox_core::snapshot::{RestoreHandler, SnapshotRecord};
use sandbox_core::{
    Provider, Result, SandboxInfo, SandboxStatus, SnapshotConfig, SnapshotManager, SyncGate,
    SyncGateConfig, SyncStatus, WarmPool, WarmPoolConfig,
};

struct ProviderRestore {
    provider: Arc<MockProvider>,
}

#[async_trait::async_trait]
impl RestoreHandler for ProviderRestore {
    async fn restore(&self, snapshot: &SnapshotRecord) -> Result<SandboxInfo> {
        self.provider.restore(&snapshot.id).await
    }
}

fn tight_pool(provider: Arc<MockProvider>) -> Arc<WarmPool> {
    WarmPool::new(
        WarmPoolConfig {
            size: 1,
            ttl: Duration::from_secs(60),
            replenish_interval: Duration::from_millis(50),
            typing_trigger: false,
            ready_poll_interval: Duration::from_millis(5),
            ready_timeout: Duration::from_secs(2),
        },
        provider,
    )
}

#[tokio::test]
async fn claim_gate_snapshot_restore_cycle() {
    let provider = Arc::new(MockProvider::new());
    let pool = tight_pool(provider.clone());
    let gate = SyncGate::new(SyncGateConfig {
        retry_interval: Duration::from_millis(10),
        max_wait: Duration::from_secs(2),
    });
    let snapshots = SnapshotManager::new(SnapshotConfig {
        ttl: Duration::from_secs(3600),
        max_per_session: 3,
    });
    snapshots.on_restore(Arc::new(ProviderRestore {
        provider: provider.clone(),
    }));

    // 1. Claim a sandbox; the fresh clone has not synced yet.
    let claim = pool.claim("github.com/acme/app", "proj-1", None).await.unwrap();
    assert!(!claim.from_warm_pool);
    let sandbox_id = claim.sandbox.id.clone();
    assert_eq!(claim.sandbox.git.sync_status, SyncStatus::Pending);

    // 2. Reads pass immediately; writes are blocked pre-sync.
    assert!(gate.check("grep", SyncStatus::Pending).allowed);
    let blocked = gate.check("edit", SyncStatus::Pending);
    assert!(!blocked.allowed);
    assert_eq!(blocked.retry_after, Some(10));

    // 3. A blocked write is released once the clone syncs.
    let wait = {
        let gate = &gate;
        let provider = provider.clone();
        let id = sandbox_id.clone();
        async move {
            gate.wait(
                "edit",
                &id,
                "call-1",
                || {
                    let provider = provider.clone();
                    let id = id.clone();
                    async move {
                        provider
                            .git_status(&id)
                            .await
                            .map(|g| g.sync_status)
                            .unwrap_or(SyncStatus::Error)
                    }
                },
                Some("src/lib.rs".into()),
            )
            .await
        }
    };
    let sync = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        provider.sync_git(&sandbox_id).await.unwrap();
    };
    let (decision, ()) = tokio::join!(wait, sync);
    assert!(decision.allowed);

    // 4. Agent done: snapshot the sandbox and record it for the session.
    let record = snapshots
        .capture(provider.as_ref(), &sandbox_id, "session-1")
        .await
        .unwrap();
    assert_eq!(record.git_commit, "mockcommit");
    assert!(snapshots.has_valid_snapshot("session-1"));
    provider.terminate(&sandbox_id).await.unwrap();

    // 5. Follow-up prompt: restore materializes a fresh sandbox that must
    //    re-sync before writes are allowed again.
    let restored = snapshots.restore("session-1").await.unwrap();
    assert_ne!(restored.id, sandbox_id);
    assert_eq!(restored.status, SandboxStatus::Ready);
    assert_eq!(restored.git.sync_status, SyncStatus::Pending);
    assert!(!gate.check("write", restored.git.sync_status).allowed);
}

#[tokio::test]
async fn pool_hit_after_replenish_serves_next_claim() {
    let provider = Arc::new(MockProvider::new());
    let pool = tight_pool(provider.clone());

    let first = pool.claim("acme/app", "proj", None).await.unwrap();
    assert!(!first.from_warm_pool);

    pool.warm("acme/app:latest", "acme/app", 1, None).await.unwrap();
    for _ in 0..100 {
        if pool.pool_size("acme/app:latest") >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let second = pool.claim("acme/app", "proj", None).await.unwrap();
    assert!(second.from_warm_pool);
    assert_ne!(second.sandbox.id, first.sandbox.id);
}

#[tokio::test]
async fn snapshot_cap_holds_across_captures() {
    let provider = Arc::new(MockProvider::new());
    let snapshots = SnapshotManager::new(SnapshotConfig {
        ttl: Duration::from_secs(3600),
        max_per_session: 2,
    });

    let sandbox = provider
        .create(sandbox_core::CreateInput {
            project_id: "proj".into(),
            repo: "acme/app".into(),
            branch: "main".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    provider.sync_git(&sandbox.id).await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..4 {
        let record = snapshots
            .capture(provider.as_ref(), &sandbox.id, "session-1")
            .await
            .unwrap();
        ids.push(record.id);
    }

    let listed = snapshots.by_session("session-1");
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, ids[3]);
    assert_eq!(listed[1].id, ids[2]);
    assert!(snapshots.get(&ids[0]).is_none());
    assert!(snapshots.get(&ids[1]).is_none());
}
