//! Warm pool: per-image-tag reserve of pre-initialized sandboxes.
//!
//! Claims pop the most recently added entry (LIFO, for freshness) and fall
//! through to a cold start on miss. Replenishment runs asynchronously and is
//! serialized per tag by an in-flight flag; the TTL sweep terminates aged
//! entries best-effort.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};
use crate::metrics::metrics;
use crate::poll::{PollOutcome, poll_until};
use crate::provider::{CreateInput, Provider, SandboxInfo, SandboxStatus};
use crate::util::{now_ts, parse_repository};

#[derive(Clone, Debug)]
pub struct WarmPoolConfig {
    /// Target number of warm entries per tag.
    pub size: usize,
    /// Max entry age before the sweep expires it.
    pub ttl: Duration,
    /// Sweep cadence.
    pub replenish_interval: Duration,
    /// Opportunistically warm a tag when the user starts typing.
    pub typing_trigger: bool,
    pub ready_poll_interval: Duration,
    pub ready_timeout: Duration,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            size: 2,
            ttl: Duration::from_secs(1800),
            replenish_interval: Duration::from_secs(60),
            typing_trigger: true,
            ready_poll_interval: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PoolEntry {
    pub sandbox_id: String,
    pub repository: String,
    pub image_tag: String,
    pub added_at: u64,
}

#[derive(Debug)]
pub struct ClaimOutcome {
    pub sandbox: SandboxInfo,
    pub from_warm_pool: bool,
}

#[derive(Default)]
struct TagPool {
    entries: Vec<PoolEntry>,
    in_flight: bool,
}

pub struct WarmPool {
    config: WarmPoolConfig,
    provider: Arc<dyn Provider>,
    pools: Mutex<HashMap<String, TagPool>>,
}

/// Derive the default pool tag for a repository URL: `{org}/{repo}:latest`.
pub fn derive_tag(repository: &str) -> Result<String> {
    let (org, repo) = parse_repository(repository)?;
    Ok(format!("{org}/{repo}:latest"))
}

/// Clears the per-tag in-flight flag when a warming pass exits by any path.
struct InFlightGuard<'a> {
    pool: &'a WarmPool,
    tag: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.pools.lock().unwrap().get_mut(&self.tag) {
            pool.in_flight = false;
        }
    }
}

impl WarmPool {
    pub fn new(config: WarmPoolConfig, provider: Arc<dyn Provider>) -> Arc<Self> {
        Arc::new(Self {
            config,
            provider,
            pools: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool_size(&self, tag: &str) -> usize {
        self.pools
            .lock()
            .unwrap()
            .get(tag)
            .map(|p| p.entries.len())
            .unwrap_or(0)
    }

    fn pop_entry(&self, tag: &str) -> Option<PoolEntry> {
        self.pools
            .lock()
            .unwrap()
            .get_mut(tag)
            .and_then(|p| p.entries.pop())
    }

    fn push_entry(&self, entry: PoolEntry) {
        self.pools
            .lock()
            .unwrap()
            .entry(entry.image_tag.clone())
            .or_default()
            .entries
            .push(entry);
    }

    /// Claim a sandbox for `(repository, project_id)`: pool hit when a fresh
    /// entry is available, otherwise a cold start. Either way an async
    /// replenishment is scheduled when the tag is below target size.
    pub async fn claim(
        self: &Arc<Self>,
        repository: &str,
        project_id: &str,
        image_tag: Option<&str>,
    ) -> Result<ClaimOutcome> {
        let tag = match image_tag {
            Some(tag) => tag.to_string(),
            None => derive_tag(repository)?,
        };

        // Pop the MRU entry; stale entries are discarded and the next tried.
        while let Some(entry) = self.pop_entry(&tag) {
            match self.provider.get(&entry.sandbox_id).await? {
                Some(info)
                    if matches!(
                        info.status,
                        SandboxStatus::Ready | SandboxStatus::Suspended
                    ) =>
                {
                    let sandbox = self.provider.start(&entry.sandbox_id).await?;
                    metrics().pool_hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    debug!("pool: hit for tag {tag} → sandbox {}", sandbox.id);
                    self.schedule_replenish(&tag, repository);
                    return Ok(ClaimOutcome {
                        sandbox,
                        from_warm_pool: true,
                    });
                }
                _ => {
                    debug!(
                        "pool: discarding stale entry {} for tag {tag}",
                        entry.sandbox_id
                    );
                    let _ = self.provider.terminate(&entry.sandbox_id).await;
                }
            }
        }

        // Cold start.
        metrics().pool_misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let created = self
            .provider
            .create(CreateInput {
                project_id: project_id.to_string(),
                repo: repository.to_string(),
                branch: String::new(),
                image_tag: Some(tag.clone()),
                ..Default::default()
            })
            .await?;

        let ready = match self.wait_for_ready(&created.id, None).await {
            Ok(info) => info,
            Err(err) => {
                // Never leak a half-provisioned sandbox.
                let _ = self.provider.terminate(&created.id).await;
                return Err(err);
            }
        };
        let sandbox = self.provider.start(&ready.id).await?;

        self.schedule_replenish(&tag, repository);
        Ok(ClaimOutcome {
            sandbox,
            from_warm_pool: false,
        })
    }

    /// Return a claimed sandbox to the pool. Running sandboxes are stopped
    /// first; terminated sandboxes are rejected.
    pub async fn release(&self, sandbox_id: &str) -> Result<()> {
        let info = self
            .provider
            .get(sandbox_id)
            .await?
            .ok_or_else(|| SandboxError::NotFound(format!("Sandbox '{sandbox_id}' not found")))?;
        if info.status == SandboxStatus::Terminated {
            return Err(SandboxError::InvalidState(format!(
                "Cannot pool terminated sandbox '{sandbox_id}'"
            )));
        }
        let info = if info.status == SandboxStatus::Running {
            self.provider.stop(sandbox_id).await?
        } else {
            info
        };

        if !matches!(info.status, SandboxStatus::Ready | SandboxStatus::Suspended) {
            return Err(SandboxError::InvalidState(format!(
                "Sandbox '{sandbox_id}' is not poolable in state {:?}",
                info.status
            )));
        }

        let image_tag = if info.image.tag.is_empty() {
            derive_tag(&info.git.repo)?
        } else {
            info.image.tag.clone()
        };
        self.push_entry(PoolEntry {
            sandbox_id: sandbox_id.to_string(),
            repository: info.git.repo.clone(),
            image_tag,
            added_at: now_ts(),
        });
        Ok(())
    }

    /// Poll `Provider::get` until the sandbox reaches `Ready`. Errors on
    /// `Terminated`, on the 120 s ceiling, and on cancellation.
    pub async fn wait_for_ready(
        &self,
        sandbox_id: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<SandboxInfo> {
        let outcome = poll_until(
            self.config.ready_poll_interval,
            self.config.ready_timeout,
            cancel,
            || async move {
                match self.provider.get(sandbox_id).await {
                    Ok(Some(info)) if info.status == SandboxStatus::Ready => Some(Ok(info)),
                    Ok(Some(info)) if info.status == SandboxStatus::Terminated => {
                        Some(Err(SandboxError::InvalidState(format!(
                            "Sandbox '{sandbox_id}' terminated while waiting for ready"
                        ))))
                    }
                    Ok(_) => None,
                    Err(err) => Some(Err(err)),
                }
            },
        )
        .await;

        match outcome {
            PollOutcome::Ready(result) => result,
            PollOutcome::Timeout => Err(SandboxError::Timeout(format!(
                "Sandbox '{sandbox_id}' not ready within {}s",
                self.config.ready_timeout.as_secs()
            ))),
            PollOutcome::Cancelled => Err(SandboxError::Cancelled),
        }
    }

    /// Spawn a background warming pass when the tag is below target size.
    fn schedule_replenish(self: &Arc<Self>, tag: &str, repository: &str) {
        if self.pool_size(tag) >= self.config.size {
            return;
        }
        let pool = self.clone();
        let tag = tag.to_string();
        let repository = repository.to_string();
        tokio::spawn(async move {
            let target = pool.config.size;
            if let Err(err) = pool.warm(&tag, &repository, target, None).await {
                warn!("pool: replenish failed for tag {tag}: {err}");
            }
        });
    }

    /// Bring the tag up to `target` entries, creating the deficit in
    /// parallel. Returns the number of entries added; returns immediately
    /// with 0 when another warming pass for this tag is already in flight.
    pub async fn warm(
        self: &Arc<Self>,
        tag: &str,
        repository: &str,
        target: usize,
        cancel: Option<CancellationToken>,
    ) -> Result<usize> {
        {
            let mut pools = self.pools.lock().unwrap();
            let pool = pools.entry(tag.to_string()).or_default();
            if pool.in_flight {
                return Ok(0);
            }
            pool.in_flight = true;
        }
        let _guard = InFlightGuard {
            pool: self.as_ref(),
            tag: tag.to_string(),
        };

        let deficit = target.saturating_sub(self.pool_size(tag));
        if deficit == 0 {
            return Ok(0);
        }

        let mut handles: Vec<JoinHandle<Result<()>>> = Vec::with_capacity(deficit);
        for _ in 0..deficit {
            let pool = self.clone();
            let tag = tag.to_string();
            let repository = repository.to_string();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let created = pool
                    .provider
                    .create(CreateInput {
                        project_id: String::new(),
                        repo: repository.clone(),
                        branch: String::new(),
                        image_tag: Some(tag.clone()),
                        ..Default::default()
                    })
                    .await?;

                match pool.wait_for_ready(&created.id, cancel.as_ref()).await {
                    Ok(_) => {
                        pool.push_entry(PoolEntry {
                            sandbox_id: created.id,
                            repository,
                            image_tag: tag,
                            added_at: now_ts(),
                        });
                        Ok(())
                    }
                    Err(err) => {
                        // Sandboxes created mid-cancel are terminated, not leaked.
                        let _ = pool.provider.terminate(&created.id).await;
                        Err(err)
                    }
                }
            }));
        }

        let mut added = 0;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => added += 1,
                Ok(Err(SandboxError::Cancelled)) => {
                    debug!("pool: warm task for tag {tag} cancelled");
                }
                Ok(Err(err)) => warn!("pool: warm task for tag {tag} failed: {err}"),
                Err(err) => warn!("pool: warm task for tag {tag} panicked: {err}"),
            }
        }
        if added > 0 {
            info!("pool: warmed {added} sandbox(es) for tag {tag}");
        }
        Ok(added)
    }

    /// Expire entries past their TTL, terminating the underlying sandboxes
    /// best-effort. Empty tag buckets are dropped.
    pub async fn sweep(&self) {
        let now = now_ts();
        let expired: Vec<PoolEntry> = {
            let mut pools = self.pools.lock().unwrap();
            let mut expired = Vec::new();
            for pool in pools.values_mut() {
                let ttl = self.config.ttl.as_secs();
                let (stale, fresh): (Vec<_>, Vec<_>) = pool
                    .entries
                    .drain(..)
                    .partition(|e| e.added_at + ttl <= now);
                pool.entries = fresh;
                expired.extend(stale);
            }
            pools.retain(|_, p| !p.entries.is_empty() || p.in_flight);
            expired
        };

        for entry in expired {
            info!(
                "pool: expiring entry {} for tag {} (added {}s ago)",
                entry.sandbox_id,
                entry.image_tag,
                now.saturating_sub(entry.added_at)
            );
            let _ = self.provider.terminate(&entry.sandbox_id).await;
            metrics().pool_expired.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Start the periodic expiration sweep. Sweeping begins here, not in the
    /// constructor, so building a pool never spawns tasks.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(pool.config.replenish_interval) => {
                        pool.sweep().await;
                    }
                }
            }
        })
    }

    /// Opportunistic warm-on-typing hook.
    pub fn note_typing(self: &Arc<Self>, repository: &str) {
        if !self.config.typing_trigger {
            return;
        }
        if let Ok(tag) = derive_tag(repository) {
            self.schedule_replenish(&tag, repository);
        }
    }
}
