//! Job orchestration: resources, registry, worker units, log streams, teardown.
//!
//! ## Flow
//!
//! ```text
//! preflight -> leftovers removed -> network + volume -> registry unit
//!     -> registry ready -> capabilities seeded -> worker units + log tasks
//!     -> join log tasks -> exit codes -> teardown
//! ```
//!
//! Teardown runs on every path once anything has been created. An interrupt
//! flips a watch channel: no step starts after it, and log tasks stop
//! following, flush what they captured and return.

use crate::benchmark::DEFAULT_SHM_SIZE;
use crate::device::{family_spec, Family, FAMILIES};
use crate::errors::{FleetError, Result};
use crate::interrupt::{cancelled, interruptible, watch_ctrl_c};
use crate::monitor::{UtilizationMonitor, UtilizationSummary};
use crate::plan::{FamilyAssignment, FleetPlan};
use crate::registry::RegistrySeeder;
use crate::runtime::{
    job_labels, network_name, registry_unit_name, volume_name, worker_unit_name, BindMount,
    ContainerRuntime, LineStream, NetworkSpec, UnitSpec, VolumeMount, VolumeSpec,
};
use colored::Colorize;
use fleet_worker::REGISTRY_PORT;
use futures::future::{join_all, FutureExt};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

pub const DEFAULT_REGISTRY_IMAGE: &str = "redis:7-alpine";

/// Collective rendezvous scratch space inside every worker
pub const RENDEZVOUS_MOUNT: &str = "/tmp/rendezvous";

pub const RENDEZVOUS_VOLUME_SIZE: &str = "100m";

pub const DEFAULT_READY_DEADLINE: Duration = Duration::from_secs(30);

/// Options for one `hfleet run`.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchOptions {
    /// Training script mounted into every worker
    pub entrypoint: PathBuf,
    pub args: Vec<String>,
    pub interpreter: String,
    /// Directory receiving `log_<family>.txt`
    pub log_dir: PathBuf,
    /// Do not echo unit output to stdout
    pub quiet: bool,
    pub monitor: bool,
    pub registry_image: String,
    pub shm_size: i64,
    pub ready_deadline: Duration,
}

impl LaunchOptions {
    pub fn new(entrypoint: impl Into<PathBuf>) -> Self {
        Self {
            entrypoint: entrypoint.into(),
            args: Vec::new(),
            interpreter: "python".to_string(),
            log_dir: PathBuf::from("."),
            quiet: false,
            monitor: false,
            registry_image: DEFAULT_REGISTRY_IMAGE.to_string(),
            shm_size: DEFAULT_SHM_SIZE,
            ready_deadline: DEFAULT_READY_DEADLINE,
        }
    }

    pub fn log_path(&self, family: Family) -> PathBuf {
        self.log_dir.join(format!("log_{}.txt", family.tag()))
    }
}

/// Host paths resolved before anything is created.
#[derive(Debug, Clone)]
struct WorkerMounts {
    entrypoint: PathBuf,
    script_name: String,
    data_dir: PathBuf,
}

impl WorkerMounts {
    fn resolve(entrypoint: &Path) -> Result<Self> {
        let entrypoint = entrypoint.canonicalize().map_err(|e| {
            FleetError::Config(format!("Entrypoint {}: {e}", entrypoint.display()))
        })?;
        if !entrypoint.is_file() {
            return Err(FleetError::Config(format!(
                "Entrypoint {} is not a file",
                entrypoint.display()
            )));
        }

        let script_name = entrypoint
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                FleetError::Config(format!("Invalid entrypoint path {}", entrypoint.display()))
            })?
            .to_string();
        let data_dir = entrypoint
            .parent()
            .map(|dir| dir.join("data"))
            .unwrap_or_else(|| PathBuf::from("/data"));

        Ok(Self {
            entrypoint,
            script_name,
            data_dir,
        })
    }
}

/// Outcome of one worker unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitReport {
    pub family: Family,
    pub unit: String,
    pub exit_code: i64,
    pub lines: usize,
    pub log_path: PathBuf,
}

/// Outcome of a finished job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub job_id: String,
    pub units: Vec<UnitReport>,
    pub utilization: Option<UtilizationSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Resource {
    Network(String),
    Volume(String),
    Unit(String),
}

/// Every resource this launcher created, in creation order.
///
/// A resource is tracked before it is created so a half-failed create is
/// still cleaned up.
#[derive(Debug, Default)]
struct ResourceTracker {
    resources: Vec<Resource>,
}

impl ResourceTracker {
    fn track(&mut self, resource: Resource) {
        self.resources.push(resource);
    }

    fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Remove everything in reverse order. Every removal is attempted; the
    /// first failure is returned.
    async fn teardown(&mut self, runtime: &dyn ContainerRuntime) -> Result<()> {
        let mut first_error = None;

        while let Some(resource) = self.resources.pop() {
            let removed = match &resource {
                Resource::Unit(name) => runtime.remove_unit(name).await,
                Resource::Volume(name) => runtime.remove_volume(name).await,
                Resource::Network(name) => runtime.remove_network(name).await,
            };
            match removed {
                Ok(existed) => debug!(resource = ?resource, existed, "Removed"),
                Err(e) => {
                    error!(resource = ?resource, error = %e, "Teardown step failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
struct StreamReport {
    family: Family,
    lines: usize,
    log_path: PathBuf,
}

/// Follow one unit's output until it ends or `stop` flips, then write the
/// captured lines to `log_path`.
async fn stream_output(
    family: Family,
    mut output: LineStream,
    log_path: PathBuf,
    echo: bool,
    mut stop: watch::Receiver<bool>,
) -> StreamReport {
    let prefix = format!("[{}]", family.tag());
    let mut lines = Vec::new();
    let mut stopped = false;

    loop {
        tokio::select! {
            next = output.next() => match next {
                Some(Ok(line)) => {
                    if echo {
                        println!("{} {}", prefix.cyan(), line);
                    }
                    lines.push(line);
                }
                Some(Err(e)) => {
                    warn!(family = %family, error = %e, "Output stream failed");
                    break;
                }
                None => break,
            },
            _ = cancelled(&mut stop) => {
                stopped = true;
                break;
            }
        }
    }

    if stopped {
        // Keep whatever is already buffered
        while let Some(Some(Ok(line))) = output.next().now_or_never() {
            lines.push(line);
        }
        debug!(family = %family, lines = lines.len(), "Output stream stopped");
    }

    let mut text = lines.join("\n");
    if !lines.is_empty() {
        text.push('\n');
    }
    if let Err(e) = tokio::fs::write(&log_path, text).await {
        error!(path = %log_path.display(), error = %e, "Failed to write unit log");
    }

    StreamReport {
        family,
        lines: lines.len(),
        log_path,
    }
}

/// Runs fleet jobs against a container runtime.
pub struct Launcher {
    runtime: Arc<dyn ContainerRuntime>,
    seeder: Arc<dyn RegistrySeeder>,
    options: LaunchOptions,
}

impl Launcher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        seeder: Arc<dyn RegistrySeeder>,
        options: LaunchOptions,
    ) -> Self {
        Self {
            runtime,
            seeder,
            options,
        }
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    /// Run the job until it finishes or Ctrl+C is pressed.
    ///
    /// A second Ctrl+C during teardown exits the process at once.
    pub async fn run_until_interrupted(&self, plan: &FleetPlan) -> Result<JobReport> {
        let (cancel, watcher) = watch_ctrl_c();
        let result = self.run(plan, cancel).await;
        watcher.abort();
        result
    }

    /// Run the job; flipping `cancel` to `true` aborts it.
    #[instrument(skip_all, fields(job_id = %plan.job_id()))]
    pub async fn run(&self, plan: &FleetPlan, mut cancel: watch::Receiver<bool>) -> Result<JobReport> {
        let mounts = WorkerMounts::resolve(&self.options.entrypoint)?;
        std::fs::create_dir_all(&self.options.log_dir)?;
        self.check_images(plan).await?;

        let mut tracker = ResourceTracker::default();
        let result = self.execute(plan, &mounts, &mut tracker, &mut cancel).await;

        if !tracker.is_empty() {
            info!("Tearing down job resources");
        }
        let teardown = tracker.teardown(self.runtime.as_ref()).await;

        match (result, teardown) {
            (Ok(report), Ok(())) => {
                info!(units = report.units.len(), "Job finished");
                Ok(report)
            }
            (Err(e), teardown) => {
                if let Err(t) = teardown {
                    warn!(error = %t, "Teardown failed after job error");
                }
                Err(e)
            }
            (Ok(_), Err(e)) => Err(e),
        }
    }

    async fn check_images(&self, plan: &FleetPlan) -> Result<()> {
        let images = std::iter::once(self.options.registry_image.as_str())
            .chain(plan.families().iter().map(|a| a.image.as_str()));

        for image in images {
            if !self.runtime.image_exists(image).await? {
                return Err(FleetError::Launch(format!(
                    "Image {image} not found locally. Build or pull it first."
                )));
            }
        }
        Ok(())
    }

    /// Remove same-named resources left by an earlier launcher.
    async fn remove_leftovers(&self) -> Result<()> {
        let units = FAMILIES
            .iter()
            .map(|spec| worker_unit_name(spec.family))
            .chain(std::iter::once(registry_unit_name().to_string()));
        for unit in units {
            if self.runtime.remove_unit(&unit).await? {
                warn!(unit = %unit, "Removed leftover unit");
            }
        }
        if self.runtime.remove_volume(volume_name()).await? {
            warn!(volume = volume_name(), "Removed leftover volume");
        }
        if self.runtime.remove_network(network_name()).await? {
            warn!(network = network_name(), "Removed leftover network");
        }
        Ok(())
    }

    async fn execute(
        &self,
        plan: &FleetPlan,
        mounts: &WorkerMounts,
        tracker: &mut ResourceTracker,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<JobReport> {
        let job_id = plan.job_id();
        let labels = job_labels(&job_id);

        interruptible(cancel, self.remove_leftovers()).await?;

        tracker.track(Resource::Network(network_name().to_string()));
        let network = NetworkSpec {
            name: network_name().to_string(),
            labels: labels.clone(),
        };
        interruptible(cancel, self.runtime.create_network(&network)).await?;

        tracker.track(Resource::Volume(volume_name().to_string()));
        let volume = VolumeSpec {
            name: volume_name().to_string(),
            size: RENDEZVOUS_VOLUME_SIZE.to_string(),
            labels: labels.clone(),
        };
        interruptible(cancel, self.runtime.create_volume(&volume)).await?;

        self.start_registry(plan, tracker, cancel).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut streams = Vec::new();
        if let Err(e) = self
            .start_workers(plan, mounts, tracker, cancel, &stop_rx, &mut streams)
            .await
        {
            let _ = stop_tx.send(true);
            join_all(streams).await;
            return Err(e);
        }

        let monitor = self.options.monitor.then(|| {
            let families = plan.families().iter().map(|a| a.family).collect();
            tokio::spawn(UtilizationMonitor::new(families, &self.options.log_dir).run(stop_rx.clone()))
        });

        info!(units = streams.len(), "Waiting for worker units");
        let mut joined = Box::pin(join_all(streams));
        let joined = tokio::select! {
            reports = &mut joined => reports,
            _ = cancelled(cancel) => {
                warn!("Interrupted, stopping log streams");
                let _ = stop_tx.send(true);
                joined.await;
                if let Some(monitor) = monitor {
                    let _ = monitor.await;
                }
                return Err(FleetError::Interrupted);
            }
        };
        let _ = stop_tx.send(true);

        let utilization = match monitor {
            Some(handle) => match handle.await {
                Ok(Ok(summary)) => Some(summary),
                Ok(Err(e)) => {
                    warn!(error = %e, "Utilization monitor failed");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "Utilization monitor task panicked");
                    None
                }
            },
            None => None,
        };

        let mut units = Vec::with_capacity(joined.len());
        for joined in joined {
            let stream = joined.map_err(|e| FleetError::Runtime(format!("Log task failed: {e}")))?;
            let unit = worker_unit_name(stream.family);
            let exit_code = interruptible(cancel, self.runtime.wait_exit(&unit)).await?;
            info!(unit = %unit, exit_code, lines = stream.lines, "Unit exited");
            units.push(UnitReport {
                family: stream.family,
                unit,
                exit_code,
                lines: stream.lines,
                log_path: stream.log_path,
            });
        }

        if let Some(failed) = units.iter().find(|u| u.exit_code != 0) {
            return Err(FleetError::Runtime(format!(
                "{} exited with code {}. See {}",
                failed.unit,
                failed.exit_code,
                failed.log_path.display()
            )));
        }

        Ok(JobReport {
            job_id,
            units,
            utilization,
        })
    }

    async fn start_registry(
        &self,
        plan: &FleetPlan,
        tracker: &mut ResourceTracker,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let name = registry_unit_name().to_string();
        let spec = UnitSpec {
            name: name.clone(),
            image: self.options.registry_image.clone(),
            hostname: Some(name.clone()),
            network: Some(network_name().to_string()),
            labels: job_labels(&plan.job_id()),
            ..Default::default()
        };

        tracker.track(Resource::Unit(name.clone()));
        interruptible(cancel, self.runtime.start_unit(&spec)).await?;

        let ip = interruptible(cancel, self.runtime.unit_address(&name, network_name())).await?;
        let addr = format!("{ip}:{REGISTRY_PORT}");
        interruptible(cancel, self.seeder.wait_ready(&addr, self.options.ready_deadline)).await?;

        let entries = plan.capability_table()?.to_entries();
        interruptible(cancel, self.seeder.seed(&addr, &entries)).await?;
        Ok(())
    }

    fn worker_spec(&self, plan: &FleetPlan, assignment: &FamilyAssignment, mounts: &WorkerMounts) -> UnitSpec {
        let family = assignment.family;
        let script_target = format!("/{}", mounts.script_name);

        let mut command = vec![self.options.interpreter.clone(), script_target.clone()];
        command.extend(self.options.args.iter().cloned());

        UnitSpec {
            name: worker_unit_name(family),
            image: assignment.image.clone(),
            hostname: Some(family.tag().to_string()),
            command,
            env: plan.worker_env(assignment).to_vars(),
            binds: vec![
                BindMount {
                    source: mounts.entrypoint.display().to_string(),
                    target: script_target,
                    read_only: true,
                },
                BindMount {
                    source: mounts.data_dir.display().to_string(),
                    target: "/data".to_string(),
                    read_only: false,
                },
            ],
            volumes: vec![VolumeMount {
                volume: volume_name().to_string(),
                target: RENDEZVOUS_MOUNT.to_string(),
            }],
            network: Some(network_name().to_string()),
            working_dir: Some("/".to_string()),
            shm_size: Some(self.options.shm_size),
            devices: (family_spec(family).bindings)(&assignment.local_indices()),
            labels: job_labels(&plan.job_id()),
        }
    }

    async fn start_workers(
        &self,
        plan: &FleetPlan,
        mounts: &WorkerMounts,
        tracker: &mut ResourceTracker,
        cancel: &mut watch::Receiver<bool>,
        stop: &watch::Receiver<bool>,
        streams: &mut Vec<tokio::task::JoinHandle<StreamReport>>,
    ) -> Result<()> {
        for assignment in plan.families() {
            let spec = self.worker_spec(plan, assignment, mounts);
            info!(
                unit = %spec.name,
                devices = ?assignment.local_indices(),
                global_rank_start = assignment.global_rank_start,
                "Starting worker unit"
            );

            tracker.track(Resource::Unit(spec.name.clone()));
            interruptible(cancel, self.runtime.start_unit(&spec)).await?;

            let output = interruptible(cancel, self.runtime.follow_output(&spec.name)).await?;
            streams.push(tokio::spawn(stream_output(
                assignment.family,
                output,
                self.options.log_path(assignment.family),
                !self.options.quiet,
                stop.clone(),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DeviceRecord, FamilyRecord, FleetDescriptor};
    use crate::registry::tests::RecordingSeeder;
    use crate::runtime::fake::FakeRuntime;
    use crate::runtime::DeviceBindings;
    use crate::selection::{DeviceSelector, Selection};
    use tempfile::TempDir;

    fn plan() -> FleetPlan {
        let mut descriptor = FleetDescriptor::new();
        for (family, caps) in [(Family::Cuda, vec![10.0]), (Family::Mlu, vec![2.5])] {
            descriptor.insert_family(
                family,
                FamilyRecord {
                    image: format!("hetero-fleet:{family}"),
                    devices: caps
                        .iter()
                        .enumerate()
                        .map(|(i, c)| DeviceRecord {
                            device_number: format!("{family}:{i}"),
                            name: "accelerator".to_string(),
                            bus_id: String::new(),
                            link_status: String::new(),
                            memory: String::new(),
                            compute_capability: Some(*c),
                        })
                        .collect(),
                },
            );
        }
        let selection = Selection::default()
            .with(Family::Cuda, DeviceSelector::All)
            .with(Family::Mlu, DeviceSelector::All);
        FleetPlan::build(&descriptor, &selection).unwrap()
    }

    fn runtime() -> FakeRuntime {
        FakeRuntime::new()
            .with_image(DEFAULT_REGISTRY_IMAGE)
            .with_image("hetero-fleet:cuda")
            .with_image("hetero-fleet:mlu")
            .with_output("hetero-fleet-cuda", &["epoch 0 loss 1.0", "epoch 1 loss 0.5"])
            .with_output("hetero-fleet-mlu", &["epoch 0 loss 1.1"])
    }

    struct Fixture {
        _dir: TempDir,
        options: LaunchOptions,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let entrypoint = dir.path().join("train.py");
        std::fs::write(&entrypoint, "print('hi')\n").unwrap();

        let mut options = LaunchOptions::new(&entrypoint);
        options.log_dir = dir.path().join("logs");
        options.quiet = true;
        options.args = vec!["--epochs".to_string(), "2".to_string()];
        Fixture { _dir: dir, options }
    }

    fn launcher(runtime: &Arc<FakeRuntime>, options: LaunchOptions) -> Launcher {
        let seeder = RecordingSeeder {
            events: runtime.event_log(),
        };
        Launcher::new(runtime.clone(), Arc::new(seeder), options)
    }

    fn position(events: &[String], event: &str) -> usize {
        events
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("missing event {event:?} in {events:?}"))
    }

    #[tokio::test]
    async fn test_successful_job() {
        let fixture = fixture();
        let runtime = Arc::new(runtime());
        let plan = plan();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let report = launcher(&runtime, fixture.options.clone())
            .run(&plan, cancel_rx)
            .await
            .unwrap();

        assert_eq!(report.job_id, plan.job_id());
        assert_eq!(report.units.len(), 2);
        assert!(report.units.iter().all(|u| u.exit_code == 0));
        assert_eq!(report.units[0].lines, 2);

        let log = std::fs::read_to_string(fixture.options.log_path(Family::Cuda)).unwrap();
        assert_eq!(log, "epoch 0 loss 1.0\nepoch 1 loss 0.5\n");
        let log = std::fs::read_to_string(fixture.options.log_path(Family::Mlu)).unwrap();
        assert_eq!(log, "epoch 0 loss 1.1\n");

        assert_eq!(runtime.remaining(), 0);
    }

    #[tokio::test]
    async fn test_registry_seeded_before_workers_start() {
        let fixture = fixture();
        let runtime = Arc::new(runtime());
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        launcher(&runtime, fixture.options.clone())
            .run(&plan(), cancel_rx)
            .await
            .unwrap();

        let events = runtime.events();
        let network = position(&events, "create_network hetero-fleet");
        let registry = position(&events, "start_unit hetero-fleet-registry");
        let ready = position(&events, "registry_ready 127.0.0.1:6379");
        let seeded = position(&events, "seed 0=10 1=2.5");
        let cuda = position(&events, "start_unit hetero-fleet-cuda");
        let mlu = position(&events, "start_unit hetero-fleet-mlu");

        assert!(network < registry);
        assert!(registry < ready && ready < seeded);
        assert!(seeded < cuda && cuda < mlu);
    }

    #[tokio::test]
    async fn test_worker_unit_spec() {
        let fixture = fixture();
        let runtime = Arc::new(runtime());
        let plan = plan();
        let launcher = launcher(&runtime, fixture.options.clone());
        let mounts = WorkerMounts::resolve(&fixture.options.entrypoint).unwrap();

        let spec = launcher.worker_spec(&plan, &plan.families()[1], &mounts);
        assert_eq!(spec.name, "hetero-fleet-mlu");
        assert_eq!(spec.hostname.as_deref(), Some("mlu"));
        assert_eq!(spec.command, vec!["python", "/train.py", "--epochs", "2"]);
        assert_eq!(spec.binds[0].target, "/train.py");
        assert!(spec.binds[1].source.ends_with("data"));
        assert_eq!(spec.volumes[0].target, RENDEZVOUS_MOUNT);
        assert!(spec.env.contains(&("GLOBAL_RANK_START".to_string(), "1".to_string())));
        assert!(spec.env.contains(&("FLEET_DEVICE".to_string(), "MLU".to_string())));
        assert!(matches!(spec.devices, DeviceBindings::DeviceNodes(ref n) if n.len() == 3));

        // The runtime receives exactly this spec
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        launcher.run(&plan, cancel_rx).await.unwrap();
        assert_eq!(runtime.started_unit("hetero-fleet-mlu"), Some(spec));
        assert_eq!(
            runtime.started_unit("hetero-fleet-cuda").map(|s| s.devices),
            Some(DeviceBindings::GpuRequest {
                device_ids: vec!["0".to_string()]
            })
        );
    }

    #[tokio::test]
    async fn test_failed_unit_fails_job_and_tears_down() {
        let fixture = fixture();
        let runtime = Arc::new(runtime().with_exit_code("hetero-fleet-mlu", 2));
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let err = launcher(&runtime, fixture.options.clone())
            .run(&plan(), cancel_rx)
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::Runtime(ref m) if m.contains("code 2")));
        // Output was still drained to disk
        assert!(fixture.options.log_path(Family::Mlu).exists());
        assert_eq!(runtime.remaining(), 0);
    }

    #[tokio::test]
    async fn test_rejected_start_tears_down() {
        let fixture = fixture();
        let runtime = Arc::new(runtime().failing_start("hetero-fleet-mlu"));
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let err = launcher(&runtime, fixture.options.clone())
            .run(&plan(), cancel_rx)
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::Launch(_)));
        assert_eq!(runtime.remaining(), 0);
        let events = runtime.events();
        let teardown = events
            .iter()
            .rposition(|e| e == "remove_unit hetero-fleet-cuda")
            .unwrap();
        assert!(teardown > position(&events, "start_unit hetero-fleet-mlu"));
    }

    #[tokio::test]
    async fn test_interrupt_stops_streams_and_tears_down() {
        let fixture = fixture();
        let runtime = Arc::new(runtime().hanging("hetero-fleet-cuda"));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let launcher = launcher(&runtime, fixture.options.clone());
        let plan = plan();

        let job = launcher.run(&plan, cancel_rx);
        let interrupt = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(job, interrupt);

        assert!(matches!(result, Err(FleetError::Interrupted)));
        let log = std::fs::read_to_string(fixture.options.log_path(Family::Cuda)).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert_eq!(runtime.remaining(), 0);
    }

    #[tokio::test]
    async fn test_interrupt_before_start_creates_nothing_new() {
        let fixture = fixture();
        let runtime = Arc::new(runtime());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();

        let result = launcher(&runtime, fixture.options.clone())
            .run(&plan(), cancel_rx)
            .await;

        assert!(matches!(result, Err(FleetError::Interrupted)));
        assert!(runtime.events().iter().all(|e| !e.starts_with("create") && !e.starts_with("start")));
    }

    #[tokio::test]
    async fn test_missing_image_creates_nothing() {
        let fixture = fixture();
        let runtime = Arc::new(
            FakeRuntime::new()
                .with_image(DEFAULT_REGISTRY_IMAGE)
                .with_image("hetero-fleet:cuda"),
        );
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let err = launcher(&runtime, fixture.options.clone())
            .run(&plan(), cancel_rx)
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::Launch(ref m) if m.contains("hetero-fleet:mlu")));
        assert!(runtime.events().is_empty());
    }

    #[tokio::test]
    async fn test_leftovers_removed_before_create() {
        let fixture = fixture();
        let runtime = Arc::new(runtime().with_leftover_unit("hetero-fleet-registry"));
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        launcher(&runtime, fixture.options.clone())
            .run(&plan(), cancel_rx)
            .await
            .unwrap();

        let events = runtime.events();
        assert!(
            position(&events, "remove_unit hetero-fleet-registry")
                < position(&events, "start_unit hetero-fleet-registry")
        );
        assert_eq!(runtime.remaining(), 0);
    }

    #[tokio::test]
    async fn test_missing_entrypoint_is_config_error() {
        let fixture = fixture();
        let runtime = Arc::new(runtime());
        let mut options = fixture.options.clone();
        options.entrypoint = options.log_dir.join("missing.py");
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let err = launcher(&runtime, options).run(&plan(), cancel_rx).await.unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));
        assert!(runtime.events().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_attempts_every_removal() {
        struct FailingVolumes(FakeRuntime);

        #[async_trait::async_trait]
        impl ContainerRuntime for FailingVolumes {
            async fn image_exists(&self, image: &str) -> Result<bool> {
                self.0.image_exists(image).await
            }
            async fn create_network(&self, spec: &NetworkSpec) -> Result<()> {
                self.0.create_network(spec).await
            }
            async fn remove_network(&self, name: &str) -> Result<bool> {
                self.0.remove_network(name).await
            }
            async fn create_volume(&self, spec: &VolumeSpec) -> Result<()> {
                self.0.create_volume(spec).await
            }
            async fn remove_volume(&self, _name: &str) -> Result<bool> {
                Err(FleetError::Runtime("volume busy".to_string()))
            }
            async fn start_unit(&self, spec: &UnitSpec) -> Result<()> {
                self.0.start_unit(spec).await
            }
            async fn remove_unit(&self, name: &str) -> Result<bool> {
                self.0.remove_unit(name).await
            }
            async fn unit_address(&self, name: &str, network: &str) -> Result<String> {
                self.0.unit_address(name, network).await
            }
            async fn follow_output(&self, name: &str) -> Result<LineStream> {
                self.0.follow_output(name).await
            }
            async fn wait_exit(&self, name: &str) -> Result<i64> {
                self.0.wait_exit(name).await
            }
        }

        let runtime = FailingVolumes(FakeRuntime::new());
        let mut tracker = ResourceTracker::default();
        for resource in [
            Resource::Network("net".to_string()),
            Resource::Volume("vol".to_string()),
            Resource::Unit("unit".to_string()),
        ] {
            tracker.track(resource);
        }

        let err = tracker.teardown(&runtime).await.unwrap_err();
        assert!(err.to_string().contains("volume busy"));
        assert_eq!(
            runtime.0.events(),
            vec!["remove_unit unit", "remove_network net"]
        );
    }
}
