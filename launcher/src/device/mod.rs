//! Accelerator devices on this host.
//!
//! A [`Device`] is one probed accelerator. Devices are recreated on every
//! inventory run and persisted only inside the fleet descriptor.

mod family;
pub mod inventory;

pub use family::{family_spec, FamilySpec, FAMILIES};
pub use inventory::discover;

use crate::errors::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MIB: u64 = 1024 * 1024;

/// Vendor family of an accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Cuda,
    Mlu,
}

impl Family {
    /// Lower-case tag used in names, file names and the descriptor
    pub fn tag(&self) -> &'static str {
        match self {
            Family::Cuda => "cuda",
            Family::Mlu => "mlu",
        }
    }

    /// Upper-case tag handed to workers
    pub fn env_tag(&self) -> &'static str {
        match self {
            Family::Cuda => "CUDA",
            Family::Mlu => "MLU",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Family {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        FAMILIES
            .iter()
            .map(|spec| spec.family)
            .find(|family| family.tag().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| FleetError::Config(format!("Unknown device family: {s}")))
    }
}

/// PCIe link generation and width, current and maximum.
///
/// `None` is a field the vendor tool does not report (`[N/A]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub current_gen: Option<u32>,
    pub current_width: Option<u32>,
    pub max_gen: Option<u32>,
    pub max_width: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Running at maximum generation and width
    Nominal,
    /// Trained below maximum generation or width
    Degraded,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Nominal => f.write_str("ok"),
            LinkStatus::Degraded => f.write_str("downgraded"),
        }
    }
}

impl LinkInfo {
    pub fn status(&self) -> LinkStatus {
        if self.current_gen == self.max_gen && self.current_width == self.max_width {
            LinkStatus::Nominal
        } else {
            LinkStatus::Degraded
        }
    }
}

/// Text the vendor tool prints for an unreported field
const NOT_REPORTED: &str = "[N/A]";

fn link_field(value: Option<u32>) -> String {
    value.map_or_else(|| NOT_REPORTED.to_string(), |v| v.to_string())
}

impl fmt::Display for LinkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PCIe Gen{} x{} ({})",
            link_field(self.current_gen),
            link_field(self.current_width),
            self.status()
        )
    }
}

/// One physical accelerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub family: Family,

    /// 0-based index within the family, also the local rank
    pub local_index: u32,

    /// Product name reported by the vendor tool
    pub name: String,

    pub bus_id: String,

    pub link: LinkInfo,

    pub memory_bytes: u64,
}

impl Device {
    /// `<family>:<index>`, e.g. `cuda:0`
    pub fn device_number(&self) -> String {
        format!("{}:{}", self.family.tag(), self.local_index)
    }

    pub fn link_summary(&self) -> String {
        self.link.to_string()
    }

    pub fn memory_mib(&self) -> u64 {
        self.memory_bytes / MIB
    }

    pub fn memory_summary(&self) -> String {
        format!("{} MiB", self.memory_mib())
    }
}

pub(crate) fn mib_to_bytes(mib: u64) -> u64 {
    mib * MIB
}
