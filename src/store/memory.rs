//! In-process backend with Redis-like TTL and WATCH semantics.
//!
//! Every write stamps the key with a fresh version from a global sequence.
//! A transaction records the versions it observed and commits only if they
//! are still current. Absent and expired keys both read as version 0, so a
//! key that disappears or reappears between observation and commit is a
//! conflict. Expiry is lazy: an expired entry is dropped the next time it is
//! touched, or by `purge_expired`.

use super::{
    parse_counter, Deadline, ObservedKey, Planner, SecretBackend, Snapshot, StoreResult, TxPlan,
    TxStatus, WriteOp,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
    version: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

/// In-memory secret backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Entry>,
    /// Serializes writers so a commit's version check and its writes are atomic.
    write_lock: Mutex<()>,
    sequence: AtomicU64,
    forced_conflicts: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with `TxStatus::Conflict`, as if
    /// another client had written a watched key.
    pub fn force_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let _guard = self.lock_writes();
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_version(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Live entry for `key`, evicting it first if it has expired.
    fn live(&self, key: &str, now: Instant) -> Option<Entry> {
        let entry = self.entries.get(key)?.clone();
        if entry.is_expired(now) {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry)
    }

    fn version_of(&self, key: &str, now: Instant) -> u64 {
        self.live(key, now).map_or(0, |e| e.version)
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Apply `ops` in order. Caller holds the write lock.
    fn apply(&self, ops: &[WriteOp], now: Instant) -> StoreResult<()> {
        // Validate counters up front so a bad op leaves nothing half-applied.
        for op in ops {
            if let WriteOp::Incr { key } = op {
                if let Some(entry) = self.live(key, now) {
                    parse_counter(key, &entry.value)?;
                }
            }
        }

        for op in ops {
            match op {
                WriteOp::Set { key, value, ttl } => {
                    self.entries.insert(
                        key.clone(),
                        Entry {
                            value: value.clone(),
                            expires_at: Some(now + *ttl),
                            version: self.next_version(),
                        },
                    );
                }
                WriteOp::Incr { key } => {
                    let (current, expires_at) = match self.live(key, now) {
                        Some(entry) => (parse_counter(key, &entry.value)?, entry.expires_at),
                        None => (0, None),
                    };
                    self.entries.insert(
                        key.clone(),
                        Entry {
                            value: (current + 1).to_string().into_bytes(),
                            expires_at,
                            version: self.next_version(),
                        },
                    );
                }
                WriteOp::ExpireAt { key, deadline } => {
                    if self.live(key, now).is_some() {
                        let version = self.next_version();
                        if let Some(mut entry) = self.entries.get_mut(key) {
                            entry.expires_at = Some(deadline.to_local());
                            entry.version = version;
                        }
                    }
                }
                WriteOp::Delete { keys } => {
                    for key in keys {
                        self.entries.remove(key);
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SecretBackend for MemoryBackend {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.live(key, Instant::now()).map(|e| e.value))
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let _guard = self.lock_writes();
        self.apply(
            &[WriteOp::Set {
                key: key.to_string(),
                value: value.to_vec(),
                ttl,
            }],
            Instant::now(),
        )
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        let _guard = self.lock_writes();
        self.apply(
            &[WriteOp::Delete {
                keys: keys.to_vec(),
            }],
            Instant::now(),
        )
    }

    async fn remaining_ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = Instant::now();
        Ok(self.live(key, now).and_then(|e| e.remaining(now)))
    }

    async fn run_transaction(
        &self,
        watched: &[String],
        plan: &mut Planner<'_>,
    ) -> StoreResult<TxStatus> {
        let now = Instant::now();
        let mut snapshot = Snapshot::default();
        let mut versions = HashMap::with_capacity(watched.len());
        for key in watched {
            let entry = self.live(key, now);
            versions.insert(key.as_str(), entry.as_ref().map_or(0, |e| e.version));
            snapshot.insert(
                key.as_str(),
                ObservedKey {
                    deadline: entry.as_ref().and_then(|e| e.expires_at).map(Deadline::Local),
                    value: entry.map(|e| e.value),
                },
            );
        }

        let ops = match plan(&snapshot) {
            TxPlan::Abort => return Ok(TxStatus::Aborted),
            TxPlan::Commit(ops) => ops,
        };

        let _guard = self.lock_writes();
        let now = Instant::now();
        let changed = versions
            .iter()
            .any(|(key, observed)| self.version_of(key, now) != *observed);
        if changed || self.take_forced_conflict() {
            debug!(keys = ?watched, "Transaction conflict");
            return Ok(TxStatus::Conflict);
        }

        self.apply(&ops, now)?;
        Ok(TxStatus::Committed)
    }
}
