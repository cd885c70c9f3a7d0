use crate::env::WorkerEnv;
use crate::errors::{Result, WorkerError};
use crate::registry::{RegistryClient, CAPABILITY_KEY};
use std::collections::HashMap;
use tracing::{debug, info};

/// Compute capability of every rank in the job, indexed by global rank.
///
/// Read once per worker and passed by reference to every sampler built in
/// that worker.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityTable {
    capabilities: Vec<f64>,
}

impl CapabilityTable {
    /// Build a table, rejecting empty, non-finite or non-positive scores.
    pub fn new(capabilities: Vec<f64>) -> Result<Self> {
        if capabilities.is_empty() {
            return Err(WorkerError::Shard("capability table is empty".to_string()));
        }
        if let Some((rank, value)) = capabilities
            .iter()
            .enumerate()
            .find(|(_, c)| !c.is_finite() || **c <= 0.0)
        {
            return Err(WorkerError::Shard(format!(
                "rank {rank} has invalid capability {value}"
            )));
        }
        Ok(Self { capabilities })
    }

    /// Build from registry hash fields (`"<rank>" -> "<capability>"`).
    ///
    /// Every rank in `[0, world_size)` must be present and nothing else.
    pub fn from_entries(entries: &HashMap<String, String>, world_size: usize) -> Result<Self> {
        if entries.len() != world_size {
            return Err(WorkerError::Registry(format!(
                "capability table has {} entries, expected {world_size}",
                entries.len()
            )));
        }

        let mut capabilities = Vec::with_capacity(world_size);
        for rank in 0..world_size {
            let raw = entries.get(&rank.to_string()).ok_or_else(|| {
                WorkerError::Registry(format!("no capability recorded for rank {rank}"))
            })?;
            let value: f64 = raw.trim().parse().map_err(|_| {
                WorkerError::Registry(format!("rank {rank} has malformed capability {raw:?}"))
            })?;
            capabilities.push(value);
        }

        Self::new(capabilities)
    }

    /// Read the table for a job of `world_size` ranks over an open connection.
    pub async fn fetch(client: &mut RegistryClient, world_size: usize) -> Result<Self> {
        let entries = client.hgetall(CAPABILITY_KEY).await?;
        debug!(addr = %client.addr(), entries = entries.len(), "Read capability table");
        Self::from_entries(&entries, world_size)
    }

    /// Connect to the registry named by the worker environment and read the table.
    pub async fn fetch_for(env: &WorkerEnv) -> Result<Self> {
        let addr = env.registry_addr();
        let mut client = RegistryClient::connect(&addr).await?;
        let table = Self::fetch(&mut client, env.global_world_size).await?;

        info!(
            addr = %addr,
            world_size = table.world_size(),
            "Capability table loaded"
        );
        Ok(table)
    }

    /// Registry hash fields, in rank order.
    pub fn to_entries(&self) -> Vec<(String, String)> {
        self.capabilities
            .iter()
            .enumerate()
            .map(|(rank, c)| (rank.to_string(), c.to_string()))
            .collect()
    }

    pub fn get(&self, rank: usize) -> Option<f64> {
        self.capabilities.get(rank).copied()
    }

    pub fn world_size(&self) -> usize {
        self.capabilities.len()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::spawn_fake_registry;

    fn entries(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_rejects_invalid_scores() {
        assert!(CapabilityTable::new(vec![]).is_err());
        assert!(CapabilityTable::new(vec![10.0, 0.0]).is_err());
        assert!(CapabilityTable::new(vec![10.0, -1.0]).is_err());
        assert!(CapabilityTable::new(vec![f64::NAN]).is_err());
        assert!(CapabilityTable::new(vec![f64::INFINITY]).is_err());
    }

    #[test]
    fn test_from_entries_orders_by_rank() {
        let table =
            CapabilityTable::from_entries(&entries(&[("1", "2.5"), ("0", "10")]), 2).unwrap();
        assert_eq!(table.as_slice(), &[10.0, 2.5]);
        assert_eq!(table.get(1), Some(2.5));
        assert_eq!(table.get(2), None);
    }

    #[test]
    fn test_from_entries_requires_exact_rank_set() {
        // Missing rank
        assert!(CapabilityTable::from_entries(&entries(&[("0", "10"), ("2", "5")]), 2).is_err());
        // World size mismatch
        assert!(CapabilityTable::from_entries(&entries(&[("0", "10")]), 2).is_err());
        // Malformed value
        assert!(CapabilityTable::from_entries(&entries(&[("0", "fast")]), 1).is_err());
    }

    #[test]
    fn test_entries_parse_back() {
        let table = CapabilityTable::new(vec![10.0, 7.3, 2.5]).unwrap();
        let map: HashMap<String, String> = table.to_entries().into_iter().collect();
        assert_eq!(CapabilityTable::from_entries(&map, 3).unwrap(), table);
    }

    #[tokio::test]
    async fn test_fetch_from_registry() {
        let addr = spawn_fake_registry().await;
        let mut client = RegistryClient::connect(&addr.to_string()).await.unwrap();
        let seeded = CapabilityTable::new(vec![10.0, 2.5]).unwrap();
        client.hset_all(CAPABILITY_KEY, &seeded.to_entries()).await.unwrap();

        let table = CapabilityTable::fetch(&mut client, 2).await.unwrap();
        assert_eq!(table, seeded);
    }

    #[tokio::test]
    async fn test_fetch_unseeded_registry_fails() {
        let addr = spawn_fake_registry().await;
        let mut client = RegistryClient::connect(&addr.to_string()).await.unwrap();

        let err = CapabilityTable::fetch(&mut client, 2).await.unwrap_err();
        assert!(matches!(err, WorkerError::Registry(_)));
    }
}
