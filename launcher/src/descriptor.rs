//! Persistent fleet descriptor.
//!
//! Written once by `hfleet init`, read by every `hfleet run`. Saved at
//! `~/.config/hetero-fleet/fleet.toml`:
//!
//! ```toml
//! create_time = "2026-10-18 09:30:00"
//!
//! [devices.cuda]
//! image = "hetero-fleet:cuda"
//!
//! [[devices.cuda.device]]
//! device_number = "cuda:0"
//! name = "NVIDIA A100-PCIE-40GB"
//! bus_id = "00000000:3B:00.0"
//! link_status = "PCIe Gen4 x16 (ok)"
//! memory = "40960 MiB"
//! compute_capability = 10.0
//! ```

use crate::device::{Device, Family};
use crate::errors::{FleetError, Result};
use fleet_worker::MAX_CAPABILITY;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// `create_time` format, local time
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Benchmarked inventory of this host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetDescriptor {
    pub create_time: String,

    /// Family tag -> record
    #[serde(default)]
    pub devices: BTreeMap<String, FamilyRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyRecord {
    /// Image every unit of this family runs
    pub image: String,

    /// Devices ordered by local index
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_number: String,
    pub name: String,
    pub bus_id: String,
    pub link_status: String,
    pub memory: String,

    /// Normalized so the fastest device in the fleet scores `MAX_CAPABILITY`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_capability: Option<f64>,
}

impl DeviceRecord {
    pub fn from_device(device: &Device, compute_capability: f64) -> Self {
        Self {
            device_number: device.device_number(),
            name: device.name.clone(),
            bus_id: device.bus_id.clone(),
            link_status: device.link_summary(),
            memory: device.memory_summary(),
            compute_capability: Some(compute_capability),
        }
    }
}

impl FleetDescriptor {
    /// Empty descriptor stamped with the current local time.
    pub fn new() -> Self {
        Self {
            create_time: chrono::Local::now().format(TIME_FORMAT).to_string(),
            devices: BTreeMap::new(),
        }
    }

    pub fn insert_family(&mut self, family: Family, record: FamilyRecord) {
        self.devices.insert(family.tag().to_string(), record);
    }

    pub fn family(&self, family: Family) -> Option<&FamilyRecord> {
        self.devices.get(family.tag())
    }

    pub fn device_count(&self) -> usize {
        self.devices.values().map(|r| r.devices.len()).sum()
    }

    /// Get default descriptor path: `~/.config/hetero-fleet/fleet.toml`
    ///
    /// # Errors
    ///
    /// Returns `FleetError::Config` if home directory cannot be determined.
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| FleetError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".config").join("hetero-fleet").join("fleet.toml"))
    }

    /// Check structure: known families, contiguous device numbers, sane scores.
    pub fn validate(&self) -> Result<()> {
        chrono::NaiveDateTime::parse_from_str(&self.create_time, TIME_FORMAT).map_err(|_| {
            FleetError::Config(format!("Invalid create_time {:?}", self.create_time))
        })?;

        for (tag, record) in &self.devices {
            let family: Family = tag.parse()?;
            if record.image.trim().is_empty() {
                return Err(FleetError::Config(format!("No image configured for {family}")));
            }

            for (index, device) in record.devices.iter().enumerate() {
                let expected = format!("{}:{index}", family.tag());
                if device.device_number != expected {
                    return Err(FleetError::Config(format!(
                        "Device {} listed at position {index}, expected {expected}",
                        device.device_number
                    )));
                }
                if let Some(c) = device.compute_capability {
                    if !c.is_finite() || c <= 0.0 || c > MAX_CAPABILITY {
                        return Err(FleetError::Config(format!(
                            "Device {expected} has invalid compute_capability {c}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Save descriptor to file.
    ///
    /// Creates parent directories if they don't exist.
    /// Uses atomic write (temp file + rename) so readers never see a partial file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(
                    path = %parent.display(),
                    error = %e,
                    "Failed to create config directory"
                );
                e
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;

        let temp_path = path.with_extension("toml.tmp");
        fs::write(&temp_path, &toml_string).map_err(|e| {
            tracing::error!(
                path = %temp_path.display(),
                error = %e,
                "Failed to write temp descriptor file"
            );
            e
        })?;

        fs::rename(&temp_path, path).map_err(|e| {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp descriptor file"
            );
            e
        })?;

        tracing::info!(path = %path.display(), devices = self.device_count(), "Fleet descriptor saved");
        Ok(())
    }

    /// Load and validate a descriptor. A missing file is a configuration error.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FleetError::Config(format!(
                    "Fleet descriptor not found at {}. Run 'hfleet init' first.",
                    path.display()
                )));
            }
            Err(e) => {
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "Failed to read descriptor file"
                );
                return Err(e.into());
            }
        };

        let descriptor: Self = toml::from_str(&content)?;
        descriptor.validate()?;

        tracing::info!(
            path = %path.display(),
            create_time = %descriptor.create_time,
            devices = descriptor.device_count(),
            "Fleet descriptor loaded"
        );

        Ok(descriptor)
    }
}

impl Default for FleetDescriptor {
    fn default() -> Self {
        Self::new()
    }
}
