//! Capability registry client.
//!
//! The registry backend is a Redis server. Only the handful of commands the
//! fleet needs are exposed: `PING`, `DEL`, `HSET` and `HGETALL`. The launcher
//! seeds the table through this client and every worker reads it back through
//! the same one.

use crate::errors::{Result, WorkerError};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// TCP port the registry backend listens on
pub const REGISTRY_PORT: u16 = 6379;

/// Hash holding the `global rank -> capability` table
pub const CAPABILITY_KEY: &str = "compute_capability";

/// Host name of the registry unit on the job network
pub const DEFAULT_REGISTRY_HOST: &str = "hetero-fleet-registry";

/// Connect and per-command I/O timeout
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection to the capability registry.
pub struct RegistryClient {
    addr: String,
    conn: MultiplexedConnection,
}

/// Run one registry round trip under [`IO_TIMEOUT`].
async fn exchange<T, F>(addr: &str, command: &str, fut: F) -> Result<T>
where
    F: Future<Output = RedisResult<T>>,
{
    timeout(IO_TIMEOUT, fut)
        .await
        .map_err(|_| WorkerError::Registry(format!("{command} to {addr} timed out")))?
        .map_err(|e| WorkerError::Registry(format!("{command} to {addr} failed: {e}")))
}

impl RegistryClient {
    /// Connect to `host:port` with the standard timeout.
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = redis::Client::open(format!("redis://{addr}/"))
            .map_err(|e| WorkerError::Registry(format!("invalid registry address {addr}: {e}")))?;

        let conn = timeout(IO_TIMEOUT, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| WorkerError::Registry(format!("timed out connecting to {addr}")))?
            .map_err(|e| WorkerError::Registry(format!("cannot reach registry at {addr}: {e}")))?;

        debug!(addr = %addr, "Connected to registry");
        Ok(Self {
            addr: addr.to_string(),
            conn,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn ping(&mut self) -> Result<()> {
        let reply: String =
            exchange(&self.addr, "PING", redis::cmd("PING").query_async(&mut self.conn)).await?;
        if reply != "PONG" {
            return Err(WorkerError::Protocol(format!("unexpected PING reply {reply:?}")));
        }
        Ok(())
    }

    /// Delete a key. Returns the number of keys removed.
    pub async fn delete(&mut self, key: &str) -> Result<i64> {
        exchange(&self.addr, "DEL", self.conn.del(key)).await
    }

    /// Write every field of a hash in one command.
    pub async fn hset_all(&mut self, key: &str, entries: &[(String, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        exchange(&self.addr, "HSET", self.conn.hset_multiple(key, entries)).await
    }

    /// Read a whole hash. A missing key reads as an empty map.
    pub async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>> {
        exchange(&self.addr, "HGETALL", self.conn.hgetall(key)).await
    }
}
