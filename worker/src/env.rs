//! Rank assignment handed to each execution unit through its environment.
//!
//! The launcher renders a [`WorkerEnv`] into environment variables with
//! [`WorkerEnv::to_vars`]; the worker parses them back with
//! [`WorkerEnv::from_env`]. Both sides share the variable names below.

use crate::errors::{Result, WorkerError};
use crate::registry::{DEFAULT_REGISTRY_HOST, REGISTRY_PORT};

pub const GROUP_RANK: &str = "GROUP_RANK";
pub const GROUP_WORLD_SIZE: &str = "GROUP_WORLD_SIZE";
pub const GLOBAL_WORLD_SIZE: &str = "GLOBAL_WORLD_SIZE";
pub const GLOBAL_RANK_START: &str = "GLOBAL_RANK_START";
pub const FLEET_DEVICE: &str = "FLEET_DEVICE";
pub const FLEET_REGISTRY_HOST: &str = "FLEET_REGISTRY_HOST";
pub const FLEET_JOB_ID: &str = "FLEET_JOB_ID";

/// Position of one execution unit in the group and global rank spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    /// Rank of this unit's family in the inter-family group
    pub group_rank: usize,

    /// Number of families taking part in the job
    pub group_world_size: usize,

    /// Number of devices taking part in the job
    pub global_world_size: usize,

    /// First global rank owned by this unit
    pub global_rank_start: usize,

    /// Device family tag (e.g. "CUDA")
    pub device: Option<String>,

    /// Registry host name on the job network
    pub registry_host: Option<String>,

    /// Job identifier
    pub job_id: Option<String>,
}

impl WorkerEnv {
    /// Read the rank assignment from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the rank assignment through an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Self {
            group_rank: required(&lookup, GROUP_RANK)?,
            group_world_size: required(&lookup, GROUP_WORLD_SIZE)?,
            global_world_size: required(&lookup, GLOBAL_WORLD_SIZE)?,
            global_rank_start: required(&lookup, GLOBAL_RANK_START)?,
            device: lookup(FLEET_DEVICE),
            registry_host: lookup(FLEET_REGISTRY_HOST),
            job_id: lookup(FLEET_JOB_ID),
        };
        env.validate()?;
        Ok(env)
    }

    fn validate(&self) -> Result<()> {
        if self.group_rank >= self.group_world_size {
            return Err(WorkerError::Env(format!(
                "{GROUP_RANK}={} is outside group world size {}",
                self.group_rank, self.group_world_size
            )));
        }
        if self.global_rank_start >= self.global_world_size {
            return Err(WorkerError::Env(format!(
                "{GLOBAL_RANK_START}={} is outside global world size {}",
                self.global_rank_start, self.global_world_size
            )));
        }
        Ok(())
    }

    /// Global rank of the process with the given rank inside this unit.
    pub fn global_rank(&self, local_rank: usize) -> Result<usize> {
        let rank = self.global_rank_start + local_rank;
        if rank >= self.global_world_size {
            return Err(WorkerError::Env(format!(
                "local rank {local_rank} maps to global rank {rank}, outside world size {}",
                self.global_world_size
            )));
        }
        Ok(rank)
    }

    /// `host:port` of the capability registry.
    pub fn registry_addr(&self) -> String {
        let host = self.registry_host.as_deref().unwrap_or(DEFAULT_REGISTRY_HOST);
        format!("{host}:{REGISTRY_PORT}")
    }

    /// Render as environment variables for an execution unit.
    pub fn to_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            (GROUP_RANK.to_string(), self.group_rank.to_string()),
            (GROUP_WORLD_SIZE.to_string(), self.group_world_size.to_string()),
            (GLOBAL_WORLD_SIZE.to_string(), self.global_world_size.to_string()),
            (GLOBAL_RANK_START.to_string(), self.global_rank_start.to_string()),
        ];
        let optional = [
            (FLEET_DEVICE, &self.device),
            (FLEET_REGISTRY_HOST, &self.registry_host),
            (FLEET_JOB_ID, &self.job_id),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                vars.push((key.to_string(), value.clone()));
            }
        }
        vars
    }
}

fn required<F>(lookup: &F, key: &str) -> Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)
        .ok_or_else(|| WorkerError::Env(format!("required variable {key} not set")))?;
    raw.trim()
        .parse()
        .map_err(|_| WorkerError::Env(format!("{key}={raw:?} is not a non-negative integer")))
}
