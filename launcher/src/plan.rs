//! Rank assignment for one job.

use crate::descriptor::FleetDescriptor;
use crate::device::{Family, FAMILIES};
use crate::errors::{FleetError, Result};
use crate::runtime::registry_unit_name;
use crate::selection::{DeviceSelector, Selection};
use fleet_worker::{CapabilityTable, WorkerEnv};
use tracing::{info, warn};
use uuid::Uuid;

/// One selected device and its place in the global rank space.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedDevice {
    pub local_index: u32,
    pub global_rank: usize,
    pub compute_capability: f64,
}

/// One execution unit: a family and its contiguous block of global ranks.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyAssignment {
    pub family: Family,
    pub group_rank: usize,
    pub image: String,
    pub global_rank_start: usize,
    pub devices: Vec<PlannedDevice>,
}

impl FamilyAssignment {
    pub fn local_indices(&self) -> Vec<u32> {
        self.devices.iter().map(|d| d.local_index).collect()
    }
}

/// Selected families in table order with group and global world sizes.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetPlan {
    job_id: Uuid,
    families: Vec<FamilyAssignment>,
    global_world_size: usize,
}

impl FleetPlan {
    /// Apply the operator selection to the descriptor.
    ///
    /// Fails when nothing is selected, when an explicit index is not in the
    /// descriptor, or when a selected device has no benchmarked capability.
    pub fn build(descriptor: &FleetDescriptor, selection: &Selection) -> Result<Self> {
        let mut families = Vec::new();
        let mut next_rank = 0;

        for spec in FAMILIES.iter() {
            let family = spec.family;
            let selector = selection.selector(family);
            if selector == DeviceSelector::Exclude {
                continue;
            }

            let Some(record) = descriptor.family(family) else {
                if selector == DeviceSelector::All {
                    warn!(family = %family, "{} is all but the descriptor has no {family} devices, skipping", spec.selector_var);
                    continue;
                }
                return Err(FleetError::Config(format!(
                    "{}={selector} but the descriptor has no {family} devices",
                    spec.selector_var
                )));
            };

            // The vendor runtime numbers bound devices in ascending order
            let mut indices = selector.resolve(family, record.devices.len())?;
            indices.sort_unstable();
            if indices.is_empty() {
                continue;
            }

            let mut devices = Vec::with_capacity(indices.len());
            for index in indices {
                let device = &record.devices[index as usize];
                let compute_capability = device.compute_capability.ok_or_else(|| {
                    FleetError::Config(format!(
                        "{} has no compute_capability. Run 'hfleet init --force' to benchmark again.",
                        device.device_number
                    ))
                })?;
                devices.push(PlannedDevice {
                    local_index: index,
                    global_rank: next_rank + devices.len(),
                    compute_capability,
                });
            }

            let assignment = FamilyAssignment {
                family,
                group_rank: families.len(),
                image: record.image.clone(),
                global_rank_start: next_rank,
                devices,
            };
            next_rank += assignment.devices.len();
            families.push(assignment);
        }

        if next_rank == 0 {
            return Err(FleetError::Config(
                "No device available. Select devices with USE_CUDA / USE_MLU.".to_string(),
            ));
        }

        let plan = Self {
            job_id: Uuid::new_v4(),
            families,
            global_world_size: next_rank,
        };

        info!(
            job_id = %plan.job_id,
            group_world_size = plan.group_world_size(),
            global_world_size = plan.global_world_size,
            "Fleet plan ready"
        );
        Ok(plan)
    }

    pub fn job_id(&self) -> String {
        self.job_id.to_string()
    }

    pub fn families(&self) -> &[FamilyAssignment] {
        &self.families
    }

    pub fn group_world_size(&self) -> usize {
        self.families.len()
    }

    pub fn global_world_size(&self) -> usize {
        self.global_world_size
    }

    /// Environment of the unit running `assignment`.
    pub fn worker_env(&self, assignment: &FamilyAssignment) -> WorkerEnv {
        WorkerEnv {
            group_rank: assignment.group_rank,
            group_world_size: self.group_world_size(),
            global_world_size: self.global_world_size,
            global_rank_start: assignment.global_rank_start,
            device: Some(assignment.family.env_tag().to_string()),
            registry_host: Some(registry_unit_name().to_string()),
            job_id: Some(self.job_id()),
        }
    }

    /// Capabilities indexed by global rank.
    pub fn capability_table(&self) -> Result<CapabilityTable> {
        let capabilities = self
            .families
            .iter()
            .flat_map(|a| a.devices.iter().map(|d| d.compute_capability))
            .collect();
        Ok(CapabilityTable::new(capabilities)?)
    }
}
