//! Container runtime seam.
//!
//! The orchestrator and the benchmark only talk to [`ContainerRuntime`].
//! [`DockerRuntime`] is the production implementation.

mod docker;
#[cfg(test)]
pub(crate) mod fake;

pub use docker::DockerRuntime;

use crate::device::Family;
use crate::errors::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;

/// Common prefix of every resource the launcher creates
pub const RESOURCE_PREFIX: &str = "hetero-fleet";

/// Label key carrying the job id on every created resource
pub const JOB_LABEL: &str = "hetero-fleet.job";

/// Name of the job network and of the shared volume
pub fn network_name() -> &'static str {
    RESOURCE_PREFIX
}

pub fn volume_name() -> &'static str {
    RESOURCE_PREFIX
}

/// Registry unit name, also its host name on the job network
pub fn registry_unit_name() -> &'static str {
    fleet_worker::DEFAULT_REGISTRY_HOST
}

pub fn worker_unit_name(family: Family) -> String {
    format!("{RESOURCE_PREFIX}-{}", family.tag())
}

pub fn benchmark_unit_name(family: Family, index: u32) -> String {
    format!("{RESOURCE_PREFIX}-benchmark-{}-{index}", family.tag())
}

/// Output lines of a unit, ending when the unit exits.
pub type LineStream = BoxStream<'static, Result<String>>;

/// How a unit gets access to accelerators.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceBindings {
    #[default]
    None,
    /// Vendor runtime request for specific device ids
    GpuRequest { device_ids: Vec<String> },
    /// Raw device nodes mapped at the same path
    DeviceNodes(Vec<String>),
}

/// Host path mounted into a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Named volume mounted into a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub volume: String,
    pub target: String,
}

/// Everything needed to create and start one execution unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitSpec {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub binds: Vec<BindMount>,
    pub volumes: Vec<VolumeMount>,
    pub network: Option<String>,
    pub working_dir: Option<String>,
    pub shm_size: Option<i64>,
    pub devices: DeviceBindings,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// tmpfs-backed volume shared by every worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub size: String,
    pub labels: HashMap<String, String>,
}

/// Labels attached to every resource of one job
pub fn job_labels(job_id: &str) -> HashMap<String, String> {
    HashMap::from([(JOB_LABEL.to_string(), job_id.to_string())])
}

/// Operations the launcher needs from a container engine.
///
/// Removal returns `Ok(false)` when the resource does not exist.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn create_network(&self, spec: &NetworkSpec) -> Result<()>;

    async fn remove_network(&self, name: &str) -> Result<bool>;

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<()>;

    async fn remove_volume(&self, name: &str) -> Result<bool>;

    /// Create and start a unit.
    async fn start_unit(&self, spec: &UnitSpec) -> Result<()>;

    /// Force-remove a unit, running or not.
    async fn remove_unit(&self, name: &str) -> Result<bool>;

    /// IP address of a unit on a network.
    async fn unit_address(&self, name: &str, network: &str) -> Result<String>;

    /// Follow a unit's combined stdout and stderr from the start.
    async fn follow_output(&self, name: &str) -> Result<LineStream>;

    /// Block until the unit exits and return its exit code.
    async fn wait_exit(&self, name: &str) -> Result<i64>;
}

/// Reassembles lines from arbitrarily split output chunks.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes, without terminators.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Trailing text without a newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}
