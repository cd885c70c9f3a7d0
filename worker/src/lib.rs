//! Worker-side support for heterogeneous fleet jobs.
//!
//! Every training process started by the launcher links this crate to:
//! - read its rank assignment from the environment ([`WorkerEnv`])
//! - fetch the capability table from the registry once ([`CapabilityTable`])
//! - pick its exact dataset shard ([`CapabilitySampler`])
//!
//! ```no_run
//! use fleet_worker::{CapabilitySampler, CapabilityTable, SamplerOptions, WorkerEnv};
//!
//! # async fn example() -> fleet_worker::Result<()> {
//! let env = WorkerEnv::from_env()?;
//! let table = CapabilityTable::fetch_for(&env).await?;
//!
//! let rank = env.global_rank(0)?;
//! let mut sampler = CapabilitySampler::new(50_000, 64, rank, &table, SamplerOptions::default())?;
//! for epoch in 0..10 {
//!     sampler.set_epoch(epoch);
//!     for index in &sampler {
//!         // load sample `index`
//!         # let _ = index;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod capability;
pub mod env;
pub mod errors;
pub mod registry;
pub mod sampler;

pub use capability::CapabilityTable;
pub use env::WorkerEnv;
pub use errors::{Result, WorkerError};
pub use registry::{RegistryClient, CAPABILITY_KEY, DEFAULT_REGISTRY_HOST, REGISTRY_PORT};
pub use sampler::{optimized_batch_size, CapabilitySampler, SamplerOptions, ShardLayout, WorkerShard};

/// Score assigned to the fastest device in the fleet.
pub const MAX_CAPABILITY: f64 = 10.0;
