//! Backing store adapter.
//!
//! The lifecycle manager only ever talks to a [`SecretBackend`]: a keyed
//! store with per-key TTL and watch-style optimistic transactions. Redis is
//! the production backend; [`MemoryBackend`] provides the same semantics
//! in-process for tests and local development.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Backing store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Value at {0} is not an integer counter")]
    CorruptCounter(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Absolute point at which a key expires, on the clock of the backend that
/// reported it.
///
/// Re-arming another key to the same `Deadline` gives both keys the same
/// expiry no matter how long the transaction took to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Local monotonic clock (in-process backends).
    Local(Instant),
    /// Server wall clock in Unix milliseconds (Redis `PEXPIRETIME`).
    UnixMillis(u64),
}

impl Deadline {
    /// Time left until the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        match *self {
            Self::Local(at) => at.saturating_duration_since(Instant::now()),
            Self::UnixMillis(ms) => Duration::from_millis(ms.saturating_sub(unix_millis_now())),
        }
    }

    pub fn to_local(self) -> Instant {
        match self {
            Self::Local(at) => at,
            Self::UnixMillis(_) => Instant::now() + self.remaining(),
        }
    }

    pub fn to_unix_millis(self) -> u64 {
        match self {
            Self::UnixMillis(ms) => ms,
            Self::Local(_) => unix_millis_now() + self.remaining().as_millis() as u64,
        }
    }
}

fn unix_millis_now() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Value and expiry of one watched key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedKey {
    pub value: Option<Vec<u8>>,
    /// `None` when the key is absent or has no expiry.
    pub deadline: Option<Deadline>,
}

/// State of the watched keys as seen at the start of a transaction.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    keys: HashMap<String, ObservedKey>,
}

impl Snapshot {
    pub fn insert(&mut self, key: impl Into<String>, observed: ObservedKey) {
        self.keys.insert(key.into(), observed);
    }

    pub fn value(&self, key: &str) -> Option<&[u8]> {
        self.keys.get(key)?.value.as_deref()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.value(key).is_some()
    }

    pub fn deadline(&self, key: &str) -> Option<Deadline> {
        self.keys.get(key)?.deadline
    }

    /// Read `key` as a decimal counter. Absent keys count as zero.
    pub fn counter(&self, key: &str) -> StoreResult<i64> {
        match self.value(key) {
            None => Ok(0),
            Some(raw) => parse_counter(key, raw),
        }
    }
}

pub(crate) fn parse_counter(key: &str, raw: &[u8]) -> StoreResult<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| StoreError::CorruptCounter(key.to_string()))
}

/// A single write queued inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Duration,
    },
    /// Increment an integer counter, creating it at 1. Keeps any existing TTL.
    Incr { key: String },
    /// Set the absolute expiry of an existing key.
    ExpireAt { key: String, deadline: Deadline },
    Delete { keys: Vec<String> },
}

/// What a transaction planner decided after looking at the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxPlan {
    /// Release the watch without writing anything.
    Abort,
    /// Apply these writes atomically if no watched key changed.
    Commit(Vec<WriteOp>),
}

/// Outcome of `run_transaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Committed,
    Aborted,
    /// A watched key changed between observation and commit; nothing was written.
    Conflict,
}

/// Planner callback for `run_transaction`.
pub type Planner<'a> = dyn FnMut(&Snapshot) -> TxPlan + Send + 'a;

/// Keyed store with per-key TTL and optimistic transactions.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Check that the store is reachable.
    async fn ping(&self) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    async fn delete(&self, keys: &[String]) -> StoreResult<()>;

    /// Remaining lifetime of `key`; `None` if absent or persistent.
    async fn remaining_ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Watch `watched`, hand a snapshot of them to `plan`, and commit the
    /// planned writes only if none of the watched keys changed meanwhile.
    async fn run_transaction(
        &self,
        watched: &[String],
        plan: &mut Planner<'_>,
    ) -> StoreResult<TxStatus>;
}

/// Shared backend handle for use across the application.
pub type SharedBackend = Arc<dyn SecretBackend>;
