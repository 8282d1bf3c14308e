//! Redis backend.
//!
//! Plain commands share one multiplexed connection. `WATCH` state lives on
//! the server per connection, so every transaction opens its own connection
//! and drops it when done. Every connection carries the same connect and
//! response timeouts.
//!
//! Transactions read expiries with `PEXPIRETIME` and re-arm them with
//! `PEXPIREAT`, which needs Redis 7.0 or newer.

use super::{
    Deadline, ObservedKey, Planner, SecretBackend, Snapshot, StoreResult, TxPlan, TxStatus,
    WriteOp,
};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncConnectionConfig, Client, Pipeline};
use std::time::Duration;
use tracing::{debug, info};

/// Redis-backed secret store
#[derive(Clone)]
pub struct RedisBackend {
    client: Client,
    conn: MultiplexedConnection,
    conn_config: AsyncConnectionConfig,
}

impl RedisBackend {
    /// Connect to `url` (e.g. `redis://localhost:6379/0`).
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let conn_config = AsyncConnectionConfig::new()
            .set_connection_timeout(connect_timeout)
            .set_response_timeout(response_timeout);
        let conn = client
            .get_multiplexed_async_connection_with_config(&conn_config)
            .await?;
        info!(
            connect_timeout_ms = connect_timeout.as_millis() as u64,
            response_timeout_ms = response_timeout.as_millis() as u64,
            "Connected to Redis"
        );
        Ok(Self {
            client,
            conn,
            conn_config,
        })
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend").finish_non_exhaustive()
    }
}

/// Redis rejects `PX 0`; round sub-millisecond durations up.
fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Map a `PTTL` reply: `-2` absent, `-1` no expiry.
fn ttl_from_pttl(ms: i64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms as u64))
}

/// Map a `PEXPIRETIME` reply: `-2` absent, `-1` no expiry.
fn deadline_from_pexpiretime(ms: i64) -> Option<Deadline> {
    (ms > 0).then_some(Deadline::UnixMillis(ms as u64))
}

fn queue_op(pipe: &mut Pipeline, op: &WriteOp) {
    match op {
        WriteOp::Set { key, value, ttl } => {
            pipe.cmd("SET")
                .arg(key)
                .arg(value.as_slice())
                .arg("PX")
                .arg(millis(*ttl));
        }
        WriteOp::Incr { key } => {
            pipe.cmd("INCR").arg(key);
        }
        WriteOp::ExpireAt { key, deadline } => {
            pipe.cmd("PEXPIREAT").arg(key).arg(deadline.to_unix_millis());
        }
        WriteOp::Delete { keys } => {
            pipe.cmd("DEL");
            for key in keys {
                pipe.arg(key);
            }
        }
    }
}

#[async_trait]
impl SecretBackend for RedisBackend {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        let _: i64 = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn remaining_ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        let ms: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(ttl_from_pttl(ms))
    }

    async fn run_transaction(
        &self,
        watched: &[String],
        plan: &mut Planner<'_>,
    ) -> StoreResult<TxStatus> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection_with_config(&self.conn_config)
            .await?;

        let mut watch = redis::cmd("WATCH");
        for key in watched {
            watch.arg(key);
        }
        let _: () = watch.query_async(&mut conn).await?;

        let mut snapshot = Snapshot::default();
        for key in watched {
            let (value, expire_time): (Option<Vec<u8>>, i64) = redis::pipe()
                .cmd("GET")
                .arg(key)
                .cmd("PEXPIRETIME")
                .arg(key)
                .query_async(&mut conn)
                .await?;
            snapshot.insert(
                key.as_str(),
                ObservedKey {
                    value,
                    deadline: deadline_from_pexpiretime(expire_time),
                },
            );
        }

        let ops = match plan(&snapshot) {
            TxPlan::Abort => {
                let _: () = redis::cmd("UNWATCH").query_async(&mut conn).await?;
                return Ok(TxStatus::Aborted);
            }
            TxPlan::Commit(ops) => ops,
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            queue_op(&mut pipe, op);
        }

        // EXEC replies nil when a watched key changed.
        let reply: Option<redis::Value> = pipe.query_async(&mut conn).await?;
        match reply {
            Some(_) => Ok(TxStatus::Committed),
            None => {
                debug!(keys = ?watched, "Transaction conflict");
                Ok(TxStatus::Conflict)
            }
        }
    }
}
