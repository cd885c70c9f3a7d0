//! In-memory container runtime for tests.

use super::{ContainerRuntime, LineStream, NetworkSpec, UnitSpec, VolumeSpec};
use crate::errors::{FleetError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Shared, ordered record of every side effect
pub(crate) type EventLog = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct FakeState {
    images: HashSet<String>,
    networks: HashSet<String>,
    volumes: HashSet<String>,
    units: HashMap<String, UnitSpec>,
    /// Every spec passed to a successful `start_unit`, kept after removal
    started: HashMap<String, UnitSpec>,
    outputs: HashMap<String, Vec<String>>,
    exit_codes: HashMap<String, i64>,
    failing_starts: HashSet<String>,
    hanging: HashSet<String>,
}

#[derive(Default)]
pub(crate) struct FakeRuntime {
    state: Mutex<FakeState>,
    events: EventLog,
}

impl FakeRuntime {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_image(self, image: &str) -> Self {
        self.lock().images.insert(image.to_string());
        self
    }

    pub(crate) fn with_output(self, unit: &str, lines: &[&str]) -> Self {
        self.lock()
            .outputs
            .insert(unit.to_string(), lines.iter().map(|l| l.to_string()).collect());
        self
    }

    pub(crate) fn with_exit_code(self, unit: &str, code: i64) -> Self {
        self.lock().exit_codes.insert(unit.to_string(), code);
        self
    }

    pub(crate) fn failing_start(self, unit: &str) -> Self {
        self.lock().failing_starts.insert(unit.to_string());
        self
    }

    /// Unit prints its output and then never exits.
    pub(crate) fn hanging(self, unit: &str) -> Self {
        self.lock().hanging.insert(unit.to_string());
        self
    }

    /// Pre-existing unit, as left behind by a crashed launcher.
    pub(crate) fn with_leftover_unit(self, unit: &str) -> Self {
        self.lock().units.insert(
            unit.to_string(),
            UnitSpec {
                name: unit.to_string(),
                ..Default::default()
            },
        );
        self
    }

    pub(crate) fn event_log(&self) -> EventLog {
        self.events.clone()
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Spec of the last unit started under `name`, even if since removed.
    pub(crate) fn started_unit(&self, name: &str) -> Option<UnitSpec> {
        self.lock().started.get(name).cloned()
    }

    /// Networks, volumes and units that still exist
    pub(crate) fn remaining(&self) -> usize {
        let state = self.lock();
        state.networks.len() + state.volumes.len() + state.units.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, event: String) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.lock().images.contains(image))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<()> {
        self.record(format!("create_network {}", spec.name));
        if !self.lock().networks.insert(spec.name.clone()) {
            return Err(FleetError::Launch(format!("network {} exists", spec.name)));
        }
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<bool> {
        self.record(format!("remove_network {name}"));
        Ok(self.lock().networks.remove(name))
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<()> {
        self.record(format!("create_volume {}", spec.name));
        if !self.lock().volumes.insert(spec.name.clone()) {
            return Err(FleetError::Launch(format!("volume {} exists", spec.name)));
        }
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<bool> {
        self.record(format!("remove_volume {name}"));
        Ok(self.lock().volumes.remove(name))
    }

    async fn start_unit(&self, spec: &UnitSpec) -> Result<()> {
        self.record(format!("start_unit {}", spec.name));
        let mut state = self.lock();
        if state.failing_starts.contains(&spec.name) {
            return Err(FleetError::Launch(format!("device binding rejected for {}", spec.name)));
        }
        if state.units.contains_key(&spec.name) {
            return Err(FleetError::Launch(format!("unit {} exists", spec.name)));
        }
        state.units.insert(spec.name.clone(), spec.clone());
        state.started.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn remove_unit(&self, name: &str) -> Result<bool> {
        self.record(format!("remove_unit {name}"));
        Ok(self.lock().units.remove(name).is_some())
    }

    async fn unit_address(&self, name: &str, _network: &str) -> Result<String> {
        if self.lock().units.contains_key(name) {
            Ok("127.0.0.1".to_string())
        } else {
            Err(FleetError::Runtime(format!("no such unit {name}")))
        }
    }

    async fn follow_output(&self, name: &str) -> Result<LineStream> {
        let state = self.lock();
        let lines: Vec<Result<String>> = state
            .outputs
            .get(name)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(Ok)
            .collect();

        let stream = futures::stream::iter(lines);
        if state.hanging.contains(name) {
            Ok(stream.chain(futures::stream::pending()).boxed())
        } else {
            Ok(stream.boxed())
        }
    }

    async fn wait_exit(&self, name: &str) -> Result<i64> {
        let (hangs, code) = {
            let state = self.lock();
            (
                state.hanging.contains(name),
                state.exit_codes.get(name).copied().unwrap_or(0),
            )
        };
        if hangs {
            futures::future::pending::<()>().await;
        }
        Ok(code)
    }
}
