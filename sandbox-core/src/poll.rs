//! Cancellable polling primitive shared by wait-for-ready, sync-gate waits,
//! and build waits.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of a bounded poll loop.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    Timeout,
    Cancelled,
}

impl<T> PollOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready(_))
    }
}

/// Run `probe` immediately and then every `interval` until it yields a value,
/// `max` elapses, or `cancel` fires.
///
/// The probe returns `Some(value)` to finish the loop. Timeouts and
/// cancellation surface as variants, never as panics or errors.
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    max: Duration,
    cancel: Option<&CancellationToken>,
    mut probe: F,
) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + max;
    loop {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return PollOutcome::Cancelled;
            }
        }

        if let Some(value) = probe().await {
            return PollOutcome::Ready(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::Timeout;
        }
        let sleep_for = interval.min(deadline - now);

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => return PollOutcome::Cancelled,
                    _ = tokio::time::sleep(sleep_for) => {}
                }
            }
            None => tokio::time::sleep(sleep_for).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn resolves_when_probe_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let outcome = poll_until(
            Duration::from_millis(5),
            Duration::from_secs(1),
            None,
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) >= 2 {
                        Some(42u32)
                    } else {
                        None
                    }
                }
            },
        )
        .await;
        assert_eq!(outcome, PollOutcome::Ready(42));
        assert!(attempts.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn times_out() {
        let outcome: PollOutcome<()> = poll_until(
            Duration::from_millis(5),
            Duration::from_millis(20),
            None,
            || async { None },
        )
        .await;
        assert_eq!(outcome, PollOutcome::Timeout);
    }

    #[tokio::test]
    async fn cancellation_wins_over_probe() {
        let token = CancellationToken::new();
        token.cancel();
        let outcome: PollOutcome<()> = poll_until(
            Duration::from_millis(5),
            Duration::from_secs(10),
            Some(&token),
            || async { None },
        )
        .await;
        assert_eq!(outcome, PollOutcome::Cancelled);
    }

    #[tokio::test]
    async fn cancellation_during_sleep() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });
        let outcome: PollOutcome<()> = poll_until(
            Duration::from_millis(500),
            Duration::from_secs(10),
            Some(&token),
            || async { None },
        )
        .await;
        assert_eq!(outcome, PollOutcome::Cancelled);
    }
}
