//! Seeding the capability registry from the host.

use crate::errors::{FleetError, Result};
use async_trait::async_trait;
use fleet_worker::{RegistryClient, CAPABILITY_KEY};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Interval between readiness probes
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Writer side of the capability registry.
#[async_trait]
pub trait RegistrySeeder: Send + Sync {
    /// Wait until the backend at `addr` answers `PING`, up to `deadline`.
    async fn wait_ready(&self, addr: &str, deadline: Duration) -> Result<()>;

    /// Replace the capability table with `entries`.
    async fn seed(&self, addr: &str, entries: &[(String, String)]) -> Result<()>;
}

/// Seeds a Redis registry backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisSeeder;

#[async_trait]
impl RegistrySeeder for RedisSeeder {
    async fn wait_ready(&self, addr: &str, deadline: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            let probe = async {
                let mut client = RegistryClient::connect(addr).await?;
                client.ping().await
            };
            match probe.await {
                Ok(()) => {
                    debug!(addr, waited = ?started.elapsed(), "Registry ready");
                    return Ok(());
                }
                Err(e) if started.elapsed() >= deadline => {
                    return Err(FleetError::Runtime(format!(
                        "Registry at {addr} not ready after {}s: {e}",
                        deadline.as_secs()
                    )));
                }
                Err(_) => sleep(PROBE_INTERVAL).await,
            }
        }
    }

    async fn seed(&self, addr: &str, entries: &[(String, String)]) -> Result<()> {
        let mut client = RegistryClient::connect(addr).await?;
        client.delete(CAPABILITY_KEY).await?;
        client.hset_all(CAPABILITY_KEY, entries).await?;

        info!(addr, ranks = entries.len(), "Capability registry seeded");
        Ok(())
    }
}
