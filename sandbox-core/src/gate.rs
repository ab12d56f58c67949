//! Sync gate: tool-level admission control that defers writes until a
//! sandbox's git clone is synced.
//!
//! Read-class tools always pass; write-class tools pass only against a
//! `Synced` clone and otherwise block, polling until sync completes, fails,
//! or the wait times out. Unknown tools are outside the contract and pass
//! (fail-open).

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::metrics::metrics;
use crate::provider::SyncStatus;
use crate::util::now_ms;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolClass {
    ReadOnly,
    Write,
    Unknown,
}

/// Deterministic classifier. Unknown tool names are not part of the
/// contract and are admitted as-is.
pub fn classify(tool: &str) -> ToolClass {
    match tool {
        "read" | "glob" | "grep" | "ls" | "codesearch" | "tree" | "find" => ToolClass::ReadOnly,
        "edit" | "write" | "patch" | "bash" | "multiedit" | "mv" | "rm" | "mkdir" => {
            ToolClass::Write
        }
        _ => ToolClass::Unknown,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    /// Suggested retry delay in milliseconds when blocked on sync.
    pub retry_after: Option<u64>,
}

impl GateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after: None,
        }
    }

    fn deny(reason: impl Into<String>, retry_after: Option<u64>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            retry_after,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PendingEdit {
    pub sandbox_id: String,
    pub tool: String,
    pub file: Option<String>,
    pub timestamp: u64,
    pub call_id: String,
}

#[derive(Clone, Debug)]
enum SyncSignal {
    Complete,
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct SyncGateConfig {
    pub retry_interval: Duration,
    pub max_wait: Duration,
}

impl Default for SyncGateConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(1000),
            max_wait: Duration::from_secs(120),
        }
    }
}

#[derive(Default)]
struct GateInner {
    /// Blocked write calls, keyed by sandbox then call id.
    pending: HashMap<String, Vec<PendingEdit>>,
    /// Waiters per sandbox, woken FIFO on sync completion.
    waiters: HashMap<String, VecDeque<oneshot::Sender<SyncSignal>>>,
}

pub struct SyncGate {
    config: SyncGateConfig,
    inner: Mutex<GateInner>,
}

/// Removes the pending-edit record on every exit path of `wait`.
struct PendingEditGuard<'a> {
    gate: &'a SyncGate,
    sandbox_id: String,
    call_id: String,
}

impl Drop for PendingEditGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.gate.inner.lock().unwrap();
        if let Some(edits) = inner.pending.get_mut(&self.sandbox_id) {
            edits.retain(|e| e.call_id != self.call_id);
            if edits.is_empty() {
                inner.pending.remove(&self.sandbox_id);
            }
        }
    }
}

impl SyncGate {
    pub fn new(config: SyncGateConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(GateInner::default()),
        }
    }

    /// Pure admission check for `(tool, sync status)`.
    pub fn check(&self, tool: &str, sync_status: SyncStatus) -> GateDecision {
        match classify(tool) {
            ToolClass::ReadOnly | ToolClass::Unknown => GateDecision::allow(),
            ToolClass::Write => match sync_status {
                SyncStatus::Synced => GateDecision::allow(),
                SyncStatus::Error => {
                    GateDecision::deny("git sync failed for this sandbox", None)
                }
                SyncStatus::Pending | SyncStatus::Syncing => GateDecision::deny(
                    format!("git clone is {sync_status:?}, write tools are deferred"),
                    Some(self.config.retry_interval.as_millis() as u64),
                ),
            },
        }
    }

    /// Block a write-class call until the sandbox syncs. Registers a
    /// pending-edit record for the duration of the wait; the record is
    /// removed on every exit path.
    pub async fn wait<F, Fut>(
        &self,
        tool: &str,
        sandbox_id: &str,
        call_id: &str,
        get_status: F,
        file: Option<String>,
    ) -> GateDecision
    where
        F: Fn() -> Fut,
        Fut: Future<Output = SyncStatus>,
    {
        if classify(tool) != ToolClass::Write {
            return GateDecision::allow();
        }
        match get_status().await {
            SyncStatus::Synced => return GateDecision::allow(),
            SyncStatus::Error => {
                return GateDecision::deny("git sync failed for this sandbox", None);
            }
            _ => {}
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner
                .pending
                .entry(sandbox_id.to_string())
                .or_default()
                .push(PendingEdit {
                    sandbox_id: sandbox_id.to_string(),
                    tool: tool.to_string(),
                    file,
                    timestamp: now_ms(),
                    call_id: call_id.to_string(),
                });
        }
        let _guard = PendingEditGuard {
            gate: self,
            sandbox_id: sandbox_id.to_string(),
            call_id: call_id.to_string(),
        };
        metrics()
            .writes_blocked
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        debug!("gate: blocking {tool} ({call_id}) on sandbox {sandbox_id}");

        let deadline = tokio::time::Instant::now() + self.config.max_wait;
        let mut rx = self.register_waiter(sandbox_id);

        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return GateDecision::deny(
                    format!(
                        "timed out after {}ms waiting for git sync",
                        self.config.max_wait.as_millis()
                    ),
                    None,
                );
            }
            let sleep_for = self.config.retry_interval.min(deadline - now);

            tokio::select! {
                signal = &mut rx => {
                    match signal {
                        Ok(SyncSignal::Complete) => {
                            metrics()
                                .writes_released
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            return GateDecision::allow();
                        }
                        Ok(SyncSignal::Failed(reason)) => {
                            return GateDecision::deny(reason, None);
                        }
                        // Sender dropped without a signal; re-arm and poll on.
                        Err(_) => rx = self.register_waiter(sandbox_id),
                    }
                }
                _ = tokio::time::sleep(sleep_for) => {
                    match get_status().await {
                        SyncStatus::Synced => {
                            metrics()
                                .writes_released
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            return GateDecision::allow();
                        }
                        SyncStatus::Error => {
                            return GateDecision::deny(
                                "git sync failed for this sandbox",
                                None,
                            );
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn register_waiter(&self, sandbox_id: &str) -> oneshot::Receiver<SyncSignal> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .unwrap()
            .waiters
            .entry(sandbox_id.to_string())
            .or_default()
            .push_back(tx);
        rx
    }

    /// Release every waiter for the sandbox (FIFO) and clear its pending
    /// edits.
    pub fn notify_sync_complete(&self, sandbox_id: &str) {
        self.drain(sandbox_id, SyncSignal::Complete);
    }

    /// Release waiters with a deny result.
    pub fn notify_sync_failed(&self, sandbox_id: &str, reason: &str) {
        self.drain(sandbox_id, SyncSignal::Failed(reason.to_string()));
    }

    fn drain(&self, sandbox_id: &str, signal: SyncSignal) {
        let waiters = {
            let mut inner = self.inner.lock().unwrap();
            inner.pending.remove(sandbox_id);
            inner.waiters.remove(sandbox_id).unwrap_or_default()
        };
        for tx in waiters {
            let _ = tx.send(signal.clone());
        }
    }

    pub fn get_pending_edits(&self, sandbox_id: &str) -> Vec<PendingEdit> {
        self.inner
            .lock()
            .unwrap()
            .pending
            .get(sandbox_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for SyncGate {
    fn default() -> Self {
        Self::new(SyncGateConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn gate_ms(retry: u64, max: u64) -> SyncGate {
        SyncGate::new(SyncGateConfig {
            retry_interval: Duration::from_millis(retry),
            max_wait: Duration::from_millis(max),
        })
    }

    #[test]
    fn classifier_matches_contract() {
        for tool in ["read", "glob", "grep", "ls", "codesearch", "tree", "find"] {
            assert_eq!(classify(tool), ToolClass::ReadOnly, "{tool}");
        }
        for tool in ["edit", "write", "patch", "bash", "multiedit", "mv", "rm", "mkdir"] {
            assert_eq!(classify(tool), ToolClass::Write, "{tool}");
        }
        assert_eq!(classify("somethingelse"), ToolClass::Unknown);
    }

    #[test]
    fn check_holds_for_every_tool_status_pair() {
        let gate = gate_ms(1000, 5000);
        let statuses = [
            SyncStatus::Pending,
            SyncStatus::Syncing,
            SyncStatus::Synced,
            SyncStatus::Error,
        ];
        for status in statuses {
            // readonly ⇒ always allowed
            assert!(gate.check("read", status).allowed);
            // unknown ⇒ allowed (fail-open)
            assert!(gate.check("launch-missiles", status).allowed);
        }
        // write ⇒ allowed iff synced
        assert!(gate.check("edit", SyncStatus::Synced).allowed);
        assert!(!gate.check("edit", SyncStatus::Pending).allowed);
        assert!(!gate.check("edit", SyncStatus::Syncing).allowed);
        assert!(!gate.check("edit", SyncStatus::Error).allowed);
    }

    #[test]
    fn blocked_check_carries_retry_after() {
        let gate = gate_ms(1000, 5000);
        let decision = gate.check("edit", SyncStatus::Pending);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Some(1000));
        // Sync errors are terminal, not retryable.
        assert_eq!(gate.check("edit", SyncStatus::Error).retry_after, None);
    }

    #[tokio::test]
    async fn wait_resolves_when_polling_sees_synced() {
        let gate = gate_ms(10, 5000);
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();

        let decision = gate
            .wait(
                "edit",
                "sb-1",
                "c1",
                move || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) >= 3 {
                            SyncStatus::Synced
                        } else {
                            SyncStatus::Pending
                        }
                    }
                },
                Some("src/main.rs".into()),
            )
            .await;

        assert!(decision.allowed);
        assert!(gate.get_pending_edits("sb-1").is_empty());
        assert!(polls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn wait_times_out_with_deny() {
        let gate = gate_ms(10, 60);
        let decision = gate
            .wait("write", "sb-1", "c1", || async { SyncStatus::Syncing }, None)
            .await;
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("timed out"));
        assert!(gate.get_pending_edits("sb-1").is_empty());
    }

    #[tokio::test]
    async fn wait_denies_on_sync_error() {
        let gate = gate_ms(10, 5000);
        let decision = gate
            .wait("edit", "sb-1", "c1", || async { SyncStatus::Error }, None)
            .await;
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("failed"));
    }

    #[tokio::test]
    async fn notify_complete_releases_waiters_in_fifo_order() {
        let gate = Arc::new(gate_ms(5000, 10_000)); // polling effectively off
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for call in ["c1", "c2", "c3"] {
            let gate = gate.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let decision = gate
                    .wait("edit", "sb-1", call, || async { SyncStatus::Pending }, None)
                    .await;
                order.lock().unwrap().push(call.to_string());
                decision
            }));
            // Ensure registration order is deterministic.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(gate.get_pending_edits("sb-1").len(), 3);

        gate.notify_sync_complete("sb-1");
        for handle in handles {
            assert!(handle.await.unwrap().allowed);
        }
        assert_eq!(*order.lock().unwrap(), vec!["c1", "c2", "c3"]);
        assert!(gate.get_pending_edits("sb-1").is_empty());
    }

    #[tokio::test]
    async fn notify_failed_denies_with_reason() {
        let gate = Arc::new(gate_ms(5000, 10_000));
        let waiting = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.wait("rm", "sb-2", "c9", || async { SyncStatus::Pending }, None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        gate.notify_sync_failed("sb-2", "remote rejected credentials");
        let decision = waiting.await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(
            decision.reason.as_deref(),
            Some("remote rejected credentials")
        );
        assert!(gate.get_pending_edits("sb-2").is_empty());
    }

    #[tokio::test]
    async fn readonly_wait_is_immediate() {
        let gate = gate_ms(10, 100);
        let decision = gate
            .wait("grep", "sb-1", "c1", || async { SyncStatus::Pending }, None)
            .await;
        assert!(decision.allowed);
        assert!(gate.get_pending_edits("sb-1").is_empty());
    }
}
