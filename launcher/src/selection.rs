//! Operator device selection (`USE_CUDA`, `USE_MLU`).

use crate::device::{Family, FAMILIES};
use crate::errors::{FleetError, Result};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Selection for one family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    /// Every device in the descriptor
    All,
    /// Family takes no part
    Exclude,
    /// Explicit local indices, in the given order
    Indices(Vec<u32>),
}

impl FromStr for DeviceSelector {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        let value = s.trim();
        if value.is_empty() || value == "-1" {
            return Ok(DeviceSelector::Exclude);
        }
        if value.eq_ignore_ascii_case("all") {
            return Ok(DeviceSelector::All);
        }

        let mut seen = HashSet::new();
        let mut indices = Vec::new();
        for item in value.split(',') {
            let index: u32 = item.trim().parse().map_err(|_| {
                FleetError::Config(format!("Invalid device index {:?} in {value:?}", item.trim()))
            })?;
            if !seen.insert(index) {
                return Err(FleetError::Config(format!(
                    "Device index {index} selected twice in {value:?}"
                )));
            }
            indices.push(index);
        }
        Ok(DeviceSelector::Indices(indices))
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::All => f.write_str("all"),
            DeviceSelector::Exclude => f.write_str("-1"),
            DeviceSelector::Indices(indices) => {
                let list: Vec<String> = indices.iter().map(u32::to_string).collect();
                f.write_str(&list.join(","))
            }
        }
    }
}

impl DeviceSelector {
    /// Local indices picked out of `available` devices.
    pub fn resolve(&self, family: Family, available: usize) -> Result<Vec<u32>> {
        match self {
            DeviceSelector::All => Ok((0..available as u32).collect()),
            DeviceSelector::Exclude => Ok(Vec::new()),
            DeviceSelector::Indices(indices) => {
                if let Some(bad) = indices.iter().find(|i| **i as usize >= available) {
                    return Err(FleetError::Config(format!(
                        "{family}:{bad} is selected but the descriptor lists {available} {family} device(s)"
                    )));
                }
                Ok(indices.clone())
            }
        }
    }
}

/// Selectors for every family. Unset variables are kept distinct from `-1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    selectors: BTreeMap<Family, Option<DeviceSelector>>,
}

impl Selection {
    /// Read every family's selector variable from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut selectors = BTreeMap::new();
        for spec in FAMILIES.iter() {
            let selector = match lookup(spec.selector_var) {
                Some(raw) if !raw.trim().is_empty() => Some(raw.parse().map_err(|e| match e {
                    FleetError::Config(m) => FleetError::Config(format!("{}: {m}", spec.selector_var)),
                    other => other,
                })?),
                _ => None,
            };
            selectors.insert(spec.family, selector);
        }
        Ok(Self { selectors })
    }

    /// Explicit selection, mainly for tests and embedding.
    pub fn with(mut self, family: Family, selector: DeviceSelector) -> Self {
        self.selectors.insert(family, Some(selector));
        self
    }

    /// Selector used by `run`. An unset variable excludes the family.
    pub fn selector(&self, family: Family) -> DeviceSelector {
        self.selectors
            .get(&family)
            .cloned()
            .flatten()
            .unwrap_or(DeviceSelector::Exclude)
    }

    /// Whether `init` should probe and benchmark this family.
    ///
    /// Only an explicit `-1` opts a family out of initialization.
    pub fn probes(&self, family: Family) -> bool {
        !matches!(self.selectors.get(&family), Some(Some(DeviceSelector::Exclude)))
    }
}
