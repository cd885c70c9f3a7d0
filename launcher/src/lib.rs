pub mod benchmark;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod errors;
pub mod interrupt;
pub mod monitor;
pub mod observability;
pub mod orchestrator;
pub mod plan;
pub mod registry;
pub mod runtime;
pub mod selection;

pub use benchmark::{normalize, parse_elapsed, BenchmarkOptions, Benchmarker, FamilyInventory};
pub use command::{CommandError, CommandOutput, CommandRunner};
pub use descriptor::{DeviceRecord, FamilyRecord, FleetDescriptor};
pub use device::{discover, family_spec, Device, Family, FamilySpec, LinkInfo, LinkStatus, FAMILIES};
pub use errors::{FleetError, Result};
pub use interrupt::{watch_ctrl_c, INTERRUPTED_EXIT_CODE};
pub use monitor::{UtilizationMonitor, UtilizationSummary};
pub use observability::{default_log_dir, init_production_logging, init_simple_logging};
pub use orchestrator::{JobReport, LaunchOptions, Launcher, UnitReport};
pub use plan::{FamilyAssignment, FleetPlan, PlannedDevice};
pub use registry::{RedisSeeder, RegistrySeeder};
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use selection::{DeviceSelector, Selection};
