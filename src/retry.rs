//! Bounded-attempt retry scheduling for failed async operations
//!
//! The [`RetryManager`] owns all pending retry state. Callers hand it a
//! failed operation together with a correlation id; the manager re-executes
//! the operation immediately and, on further failures, after exponentially
//! growing delays, until the attempt budget is exhausted. Nothing propagates
//! back to the caller: the manager only logs and tracks.

use dashmap::DashMap;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A retryable operation. Each invocation must produce a fresh future over
/// the same underlying work.
pub type RetryOperation = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Backoff parameters for retry chains.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of executions a chain may perform
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    /// Delay scheduled after attempt `failed_attempt` (1-based) fails:
    /// `min(base_delay * 2^(failed_attempt - 1), max_delay)`.
    pub fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

struct RetryEntry {
    attempt: u32,
    token: CancellationToken,
}

/// Schedules bounded, exponentially backed-off re-execution of failed
/// operations, keyed by correlation id.
///
/// Chains for different correlation ids run independently; the pending map
/// is sharded and never locked across ids. The manager must be stopped
/// before the resources its operations touch are torn down.
pub struct RetryManager {
    policy: RetryPolicy,
    pending: Arc<DashMap<String, RetryEntry>>,
}

impl RetryManager {
    /// Creates a manager with the given backoff policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Number of retry chains currently pending.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Starts a retry chain for a just-failed operation.
    ///
    /// Attempt 1 executes immediately on a spawned task. Failure of attempt
    /// `n` either schedules attempt `n + 1` after the policy delay or, once
    /// `n + 1` would exceed the budget, abandons the chain with a logged
    /// terminal failure. Success clears the chain. Scheduling the same
    /// correlation id again replaces (and cancels) the existing chain.
    pub fn schedule(&self, execute: RetryOperation, error: &dyn fmt::Display, correlation_id: &str) {
        let id = correlation_id.to_string();
        warn!(correlation_id = %id, error = %error, "operation failed, starting retry chain");

        let token = CancellationToken::new();
        if let Some(previous) = self.pending.insert(
            id.clone(),
            RetryEntry {
                attempt: 1,
                token: token.clone(),
            },
        ) {
            previous.token.cancel();
        }

        let policy = self.policy.clone();
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            let mut attempt: u32 = 1;
            loop {
                match execute().await {
                    Ok(()) => {
                        debug!(correlation_id = %id, attempt, "retried operation succeeded");
                        break;
                    }
                    Err(err) => {
                        if attempt + 1 > policy.max_attempts {
                            error!(
                                correlation_id = %id,
                                attempts = attempt,
                                error = %err,
                                "operation permanently failed, giving up"
                            );
                            break;
                        }
                        let delay = policy.backoff_delay(attempt);
                        attempt += 1;
                        if let Some(mut entry) = pending.get_mut(&id) {
                            entry.attempt = attempt;
                        }
                        warn!(
                            correlation_id = %id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "retry attempt failed, backing off"
                        );
                        tokio::select! {
                            _ = token.cancelled() => {
                                debug!(correlation_id = %id, "retry chain cancelled");
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
            // A replacement chain owns the map entry now; leave it alone.
            if !token.is_cancelled() {
                pending.remove(&id);
            }
        });
    }

    /// Cancels every pending chain and clears all retry state.
    ///
    /// Required in the owning component's shutdown path, strictly before the
    /// dependencies the retried operations touch are released.
    pub fn stop(&self) {
        let cancelled = self.pending.len();
        for entry in self.pending.iter() {
            entry.value().token.cancel();
        }
        self.pending.clear();
        if cancelled > 0 {
            info!(pending = cancelled, "retry manager stopped, pending retries cancelled");
        } else {
            debug!("retry manager stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }

    /// Operation that fails until it has been invoked `succeed_on` times;
    /// `succeed_on == u32::MAX` never succeeds.
    fn counting_operation(count: Arc<AtomicU32>, succeed_on: u32) -> RetryOperation {
        Arc::new(move || {
            let count = Arc::clone(&count);
            Box::pin(async move {
                let invocation = count.fetch_add(1, Ordering::SeqCst) + 1;
                if invocation >= succeed_on {
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("attempt {invocation} failed"))
                }
            })
        })
    }

    #[test]
    fn backoff_doubles_from_base_and_caps_at_max() {
        let policy = policy(10);
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(4000));
        assert_eq!(policy.backoff_delay(5), Duration::from_millis(16_000));
        assert_eq!(policy.backoff_delay(6), Duration::from_millis(30_000));
        assert_eq!(policy.backoff_delay(30), Duration::from_millis(30_000));
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_operation_runs_exactly_max_attempts_times() {
        let manager = RetryManager::new(policy(3));
        let count = Arc::new(AtomicU32::new(0));

        manager.schedule(
            counting_operation(Arc::clone(&count), u32::MAX),
            &"initial failure",
            "veh-1-42",
        );

        // Far past the whole backoff ladder; the virtual clock fast-forwards
        // through every scheduled delay.
        tokio::time::sleep(Duration::from_secs(300)).await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(manager.pending_count(), 0);

        // No late straggler after the chain was abandoned.
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_runs_immediately() {
        let manager = RetryManager::new(policy(5));
        let count = Arc::new(AtomicU32::new(0));

        manager.schedule(
            counting_operation(Arc::clone(&count), u32::MAX),
            &"initial failure",
            "veh-1-7",
        );

        // Only yield, never advance the clock: attempt 1 must not wait for
        // any timer.
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_clears_the_chain_without_further_attempts() {
        let manager = RetryManager::new(policy(5));
        let count = Arc::new(AtomicU32::new(0));

        manager.schedule(
            counting_operation(Arc::clone(&count), 2),
            &"initial failure",
            "veh-1-9",
        );

        tokio::time::sleep(Duration::from_secs(300)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_a_chain_waiting_on_its_timer() {
        let manager = RetryManager::new(policy(5));
        let count = Arc::new(AtomicU32::new(0));

        manager.schedule(
            counting_operation(Arc::clone(&count), u32::MAX),
            &"initial failure",
            "veh-1-11",
        );

        // Let attempt 1 run and the chain park on its first backoff timer.
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);

        manager.stop();
        assert_eq!(manager.pending_count(), 0);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1, "no invocation may follow stop()");
    }

    #[tokio::test(start_paused = true)]
    async fn chains_for_different_ids_run_independently() {
        let manager = RetryManager::new(policy(2));
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        manager.schedule(counting_operation(Arc::clone(&first), u32::MAX), &"a", "veh-0-1");
        manager.schedule(counting_operation(Arc::clone(&second), 1), &"b", "veh-0-2");

        tokio::time::sleep(Duration::from_secs(300)).await;

        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(manager.pending_count(), 0);
    }
}
