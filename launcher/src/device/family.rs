use super::{inventory, Device, Family};
use crate::command::CommandRunner;
use crate::errors::Result;
use crate::runtime::DeviceBindings;
use futures::future::{BoxFuture, FutureExt};

/// Everything the launcher needs to know about one device family.
///
/// This table is the only place that enumerates supported families. Table
/// order is also global rank order.
pub struct FamilySpec {
    pub family: Family,

    /// Operator selection variable, e.g. `USE_CUDA`
    pub selector_var: &'static str,

    /// Image used when the descriptor is first created
    pub default_image: &'static str,

    /// Probe the host with the vendor query tool
    pub discover: for<'a> fn(&'a CommandRunner) -> BoxFuture<'a, Result<Vec<Device>>>,

    /// Map selected local indices to container device bindings
    pub bindings: fn(&[u32]) -> DeviceBindings,
}

static CUDA: FamilySpec = FamilySpec {
    family: Family::Cuda,
    selector_var: "USE_CUDA",
    default_image: "hetero-fleet:cuda",
    discover: discover_cuda,
    bindings: cuda_bindings,
};

static MLU: FamilySpec = FamilySpec {
    family: Family::Mlu,
    selector_var: "USE_MLU",
    default_image: "hetero-fleet:mlu",
    discover: discover_mlu,
    bindings: mlu_bindings,
};

/// Supported families in global rank order
pub static FAMILIES: [&FamilySpec; 2] = [&CUDA, &MLU];

pub fn family_spec(family: Family) -> &'static FamilySpec {
    match family {
        Family::Cuda => &CUDA,
        Family::Mlu => &MLU,
    }
}

fn discover_cuda(runner: &CommandRunner) -> BoxFuture<'_, Result<Vec<Device>>> {
    inventory::discover_nvidia(runner).boxed()
}

fn discover_mlu(runner: &CommandRunner) -> BoxFuture<'_, Result<Vec<Device>>> {
    inventory::discover_cambricon(runner).boxed()
}

fn cuda_bindings(indices: &[u32]) -> DeviceBindings {
    DeviceBindings::GpuRequest {
        device_ids: indices.iter().map(u32::to_string).collect(),
    }
}

fn mlu_bindings(indices: &[u32]) -> DeviceBindings {
    let mut nodes = vec!["/dev/cambricon_ctl".to_string()];
    for index in indices {
        nodes.push(format!("/dev/cambricon_dev{index}"));
        nodes.push(format!("/dev/cambricon_ipcm{index}"));
    }
    DeviceBindings::DeviceNodes(nodes)
}
