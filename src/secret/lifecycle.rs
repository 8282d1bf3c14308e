//! Secret lifecycle on top of the backing store.
//!
//! ```text
//! Absent -> Stored -> ConsumedDeleted      (consume_if_match)
//!                  -> EvictedByFailures    (register_failure_and_maybe_evict)
//!                  -> ExpiredByTTL         (store-side, implicit)
//! ```
//!
//! No in-process locks: every conditional transition is an optimistic
//! transaction against the store, so any number of workers can race on the
//! same identifier.

use super::policy::AccessPolicy;
use crate::store::{SharedBackend, Snapshot, StoreError, TxPlan, TxStatus, WriteOp};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Attempts made by a transactional operation before giving up on conflicts.
pub const MAX_TX_ATTEMPTS: u32 = 3;

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Secret not found or expired")]
    NotFound,

    #[error("Secret store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Concurrent modification persisted after {attempts} attempts")]
    ConcurrencyConflict { attempts: u32 },
}

/// Result type for lifecycle operations
pub type SecretResult<T> = Result<T, SecretError>;

/// Store key holding the sealed envelope.
pub fn secret_key(id: &str) -> String {
    format!("secret:{id}")
}

/// Store key holding the failed-attempt counter.
pub fn attempts_key(id: &str) -> String {
    format!("secret:attempts:{id}")
}

/// Result of `consume_if_match`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The secret matched and was deleted.
    Deleted,
    /// Nothing was stored under the id anymore.
    AlreadyGone,
    /// A different value is stored now; left untouched.
    Replaced,
}

/// Result of `register_failure_and_maybe_evict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureReport {
    /// Failed attempts including this one; 0 if the secret was already gone.
    pub count: u64,
    /// Attempts left before eviction.
    pub remaining: u32,
    /// This attempt destroyed the secret.
    pub evicted: bool,
}

/// What a transaction step decided after looking at the snapshot.
enum Decision<T> {
    Abort(T),
    Commit(Vec<WriteOp>, T),
    Fail(StoreError),
}

/// Implements the state-changing operations on stored secrets.
pub struct SecretManager {
    backend: SharedBackend,
    policy: AccessPolicy,
}

impl std::fmt::Debug for SecretManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretManager")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SecretManager {
    pub fn new(backend: SharedBackend, policy: AccessPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// Check that the backing store answers.
    pub async fn ping(&self) -> SecretResult<()> {
        Ok(self.backend.ping().await?)
    }

    /// Persist a sealed blob under `id` for `ttl`. Not retried.
    pub async fn store(&self, id: &str, blob: &[u8], ttl: Duration) -> SecretResult<()> {
        self.backend
            .set_with_ttl(&secret_key(id), blob, ttl)
            .await?;
        debug!(id, ttl_secs = ttl.as_secs(), "Secret stored");
        Ok(())
    }

    /// Fetch the sealed blob for `id`.
    pub async fn get(&self, id: &str) -> SecretResult<Vec<u8>> {
        self.backend
            .get(&secret_key(id))
            .await?
            .ok_or(SecretError::NotFound)
    }

    /// Delete the secret if it still holds exactly `expected`.
    ///
    /// Absent is a successful no-op. A different stored value is left alone
    /// and not retried: the caller already holds the plaintext it decrypted,
    /// but must not clobber whatever was written since.
    pub async fn consume_if_match(&self, id: &str, expected: &[u8]) -> SecretResult<ConsumeOutcome> {
        let key = secret_key(id);
        let watched = [key.clone()];

        let outcome = self
            .with_optimistic_transaction(&watched, MAX_TX_ATTEMPTS, |snap| {
                match snap.value(&key) {
                    None => Decision::Abort(ConsumeOutcome::AlreadyGone),
                    Some(current) if current != expected => {
                        Decision::Abort(ConsumeOutcome::Replaced)
                    }
                    Some(_) => Decision::Commit(
                        vec![WriteOp::Delete {
                            keys: vec![key.clone()],
                        }],
                        ConsumeOutcome::Deleted,
                    ),
                }
            })
            .await?;

        match outcome {
            ConsumeOutcome::Deleted => info!(id, "Secret consumed"),
            ConsumeOutcome::AlreadyGone => debug!(id, "Secret already gone at consume"),
            ConsumeOutcome::Replaced => warn!(id, "Secret changed since read, not deleted"),
        }
        Ok(outcome)
    }

    /// Count a wrong passcode and destroy the secret once the limit is hit.
    ///
    /// The counter's TTL is re-armed to the secret's remaining TTL in the
    /// same commit, so it never outlives the secret. Increment happens
    /// before the threshold check: the Nth failure is the one that evicts.
    pub async fn register_failure_and_maybe_evict(&self, id: &str) -> SecretResult<FailureReport> {
        let key = secret_key(id);
        let att = attempts_key(id);
        let watched = [key.clone(), att.clone()];
        let policy = self.policy;

        let report = self
            .with_optimistic_transaction(&watched, MAX_TX_ATTEMPTS, |snap| {
                if !snap.exists(&key) {
                    return Decision::Abort(FailureReport {
                        count: 0,
                        remaining: policy.remaining_attempts(0),
                        evicted: false,
                    });
                }

                let previous = match snap.counter(&att) {
                    Ok(n) => n.max(0) as u64,
                    Err(e) => return Decision::Fail(e),
                };
                let count = previous + 1;

                let mut ops = vec![WriteOp::Incr { key: att.clone() }];
                if let Some(deadline) = snap.deadline(&key) {
                    ops.push(WriteOp::ExpireAt {
                        key: att.clone(),
                        deadline,
                    });
                }

                let evicted = policy.is_exhausted(count);
                if evicted {
                    ops.push(WriteOp::Delete {
                        keys: vec![key.clone(), att.clone()],
                    });
                }

                Decision::Commit(
                    ops,
                    FailureReport {
                        count,
                        remaining: policy.remaining_attempts(count),
                        evicted,
                    },
                )
            })
            .await?;

        if report.evicted {
            info!(id, attempts = report.count, "Secret destroyed after too many failed attempts");
        } else if report.count > 0 {
            info!(id, attempts = report.count, remaining = report.remaining, "Failed read attempt");
        }
        Ok(report)
    }

    /// Remove the failure counter. Best-effort: errors are logged only.
    pub async fn clear_failure_counter(&self, id: &str) {
        if let Err(e) = self.backend.delete(&[attempts_key(id)]).await {
            warn!(id, error = %e, "Failed to delete attempts counter");
        }
    }

    /// Run `decide` against freshly observed state until a commit (or abort)
    /// goes through, retrying only on conflicts, at most `attempts` times.
    async fn with_optimistic_transaction<T, F>(
        &self,
        keys: &[String],
        attempts: u32,
        mut decide: F,
    ) -> SecretResult<T>
    where
        T: Send,
        F: FnMut(&Snapshot) -> Decision<T> + Send,
    {
        for attempt in 1..=attempts {
            let mut outcome: Option<Result<T, StoreError>> = None;

            let status = self
                .backend
                .run_transaction(keys, &mut |snap: &Snapshot| match decide(snap) {
                    Decision::Abort(value) => {
                        outcome = Some(Ok(value));
                        TxPlan::Abort
                    }
                    Decision::Commit(ops, value) => {
                        outcome = Some(Ok(value));
                        TxPlan::Commit(ops)
                    }
                    Decision::Fail(e) => {
                        outcome = Some(Err(e));
                        TxPlan::Abort
                    }
                })
                .await?;

            match (status, outcome) {
                (TxStatus::Committed | TxStatus::Aborted, Some(result)) => {
                    return result.map_err(SecretError::from);
                }
                _ => debug!(keys = ?keys, attempt, "Optimistic transaction retry"),
            }
        }

        warn!(keys = ?keys, attempts, "Optimistic transaction retries exhausted");
        Err(SecretError::ConcurrencyConflict { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, SecretBackend};
    use std::sync::Arc;

    const HOUR: Duration = Duration::from_secs(3600);

    fn manager() -> (Arc<MemoryBackend>, SecretManager) {
        let backend = Arc::new(MemoryBackend::new());
        let manager = SecretManager::new(backend.clone(), AccessPolicy::default());
        (backend, manager)
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let (_, manager) = manager();
        manager.store("id1", b"v1:blob", HOUR).await.unwrap();
        assert_eq!(manager.get("id1").await.unwrap(), b"v1:blob");
        assert!(matches!(manager.get("nope").await, Err(SecretError::NotFound)));
    }

    #[tokio::test]
    async fn test_consume_deletes_matching_value() {
        let (_, manager) = manager();
        manager.store("id1", b"blob", HOUR).await.unwrap();

        let outcome = manager.consume_if_match("id1", b"blob").await.unwrap();
        assert_eq!(outcome, ConsumeOutcome::Deleted);
        assert!(matches!(manager.get("id1").await, Err(SecretError::NotFound)));
    }

    #[tokio::test]
    async fn test_consume_absent_is_noop() {
        let (_, manager) = manager();
        let outcome = manager.consume_if_match("id1", b"blob").await.unwrap();
        assert_eq!(outcome, ConsumeOutcome::AlreadyGone);
    }

    #[tokio::test]
    async fn test_consume_leaves_replaced_value() {
        let (_, manager) = manager();
        manager.store("id1", b"newer", HOUR).await.unwrap();

        let outcome = manager.consume_if_match("id1", b"older").await.unwrap();
        assert_eq!(outcome, ConsumeOutcome::Replaced);
        assert_eq!(manager.get("id1").await.unwrap(), b"newer");
    }

    #[tokio::test]
    async fn test_failures_count_down_then_evict() {
        let (backend, manager) = manager();
        manager.store("id1", b"blob", HOUR).await.unwrap();

        let first = manager.register_failure_and_maybe_evict("id1").await.unwrap();
        assert_eq!((first.count, first.remaining, first.evicted), (1, 2, false));

        let second = manager.register_failure_and_maybe_evict("id1").await.unwrap();
        assert_eq!((second.count, second.remaining, second.evicted), (2, 1, false));

        let third = manager.register_failure_and_maybe_evict("id1").await.unwrap();
        assert_eq!((third.count, third.remaining, third.evicted), (3, 0, true));

        assert!(matches!(manager.get("id1").await, Err(SecretError::NotFound)));
        assert_eq!(backend.get(&attempts_key("id1")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failure_on_absent_secret_creates_nothing() {
        let (backend, manager) = manager();

        let report = manager.register_failure_and_maybe_evict("ghost").await.unwrap();
        assert_eq!(report.count, 0);
        assert!(!report.evicted);
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_ttl_follows_secret() {
        let (backend, manager) = manager();
        manager.store("id1", b"blob", HOUR).await.unwrap();

        tokio::time::advance(Duration::from_secs(600)).await;
        manager.register_failure_and_maybe_evict("id1").await.unwrap();

        let secret_ttl = backend.remaining_ttl(&secret_key("id1")).await.unwrap().unwrap();
        let counter_ttl = backend.remaining_ttl(&attempts_key("id1")).await.unwrap().unwrap();
        assert!(counter_ttl <= secret_ttl);
        assert_eq!(counter_ttl, Duration::from_secs(3000));

        // Both disappear together.
        tokio::time::advance(Duration::from_secs(3000)).await;
        assert!(backend.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_counter_never_outlives_secret_on_real_clock() {
        let (backend, manager) = manager();
        manager.store("id1", b"blob", HOUR).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        manager.register_failure_and_maybe_evict("id1").await.unwrap();

        let secret_ttl = backend.remaining_ttl(&secret_key("id1")).await.unwrap().unwrap();
        let counter_ttl = backend.remaining_ttl(&attempts_key("id1")).await.unwrap().unwrap();
        assert!(
            counter_ttl <= secret_ttl,
            "counter {:?} outlives secret {:?}",
            counter_ttl,
            secret_ttl
        );
    }

    #[tokio::test]
    async fn test_failure_retries_conflicts() {
        let (backend, manager) = manager();
        manager.store("id1", b"blob", HOUR).await.unwrap();

        backend.force_conflicts(MAX_TX_ATTEMPTS - 1);
        let report = manager.register_failure_and_maybe_evict("id1").await.unwrap();
        assert_eq!(report.count, 1);
    }

    #[tokio::test]
    async fn test_failure_conflict_exhaustion_surfaces() {
        let (backend, manager) = manager();
        manager.store("id1", b"blob", HOUR).await.unwrap();

        backend.force_conflicts(MAX_TX_ATTEMPTS);
        let result = manager.register_failure_and_maybe_evict("id1").await;
        assert!(matches!(
            result,
            Err(SecretError::ConcurrencyConflict { attempts }) if attempts == MAX_TX_ATTEMPTS
        ));

        // Nothing was counted.
        assert_eq!(backend.get(&attempts_key("id1")).await.unwrap(), None);
        assert_eq!(manager.get("id1").await.unwrap(), b"blob");
    }

    #[tokio::test]
    async fn test_corrupt_counter_is_not_retried() {
        let (backend, manager) = manager();
        manager.store("id1", b"blob", HOUR).await.unwrap();
        backend
            .set_with_ttl(&attempts_key("id1"), b"garbage", HOUR)
            .await
            .unwrap();

        let result = manager.register_failure_and_maybe_evict("id1").await;
        assert!(matches!(
            result,
            Err(SecretError::StoreUnavailable(StoreError::CorruptCounter(_)))
        ));
        assert_eq!(manager.get("id1").await.unwrap(), b"blob");
    }

    #[tokio::test]
    async fn test_clear_failure_counter() {
        let (backend, manager) = manager();
        manager.store("id1", b"blob", HOUR).await.unwrap();
        manager.register_failure_and_maybe_evict("id1").await.unwrap();

        manager.clear_failure_counter("id1").await;
        assert_eq!(backend.get(&attempts_key("id1")).await.unwrap(), None);

        // Clearing a missing counter is fine too.
        manager.clear_failure_counter("id1").await;
    }

    #[tokio::test]
    async fn test_custom_threshold() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = SecretManager::new(backend, AccessPolicy::default().with_max_attempts(1));
        manager.store("id1", b"blob", HOUR).await.unwrap();

        let report = manager.register_failure_and_maybe_evict("id1").await.unwrap();
        assert!(report.evicted);
        assert_eq!(report.remaining, 0);
    }

    #[test]
    fn test_key_namespaces() {
        assert_eq!(secret_key("abc"), "secret:abc");
        assert_eq!(attempts_key("abc"), "secret:attempts:abc");
    }
}
