//! Per-device capability benchmark and descriptor rebuild.
//!
//! Each device runs a fixed workload alone in its own unit. The workload's
//! last output line is its elapsed time in seconds. Times are normalized so
//! the fastest device scores [`MAX_CAPABILITY`].

use crate::descriptor::{DeviceRecord, FamilyRecord, FleetDescriptor};
use crate::device::{family_spec, Device, Family};
use crate::errors::{FleetError, Result};
use crate::interrupt::{interruptible, never_cancelled};
use crate::runtime::{benchmark_unit_name, BindMount, ContainerRuntime, UnitSpec};
use fleet_worker::MAX_CAPABILITY;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

/// Workload baked into every family image
pub const DEFAULT_BENCHMARK_COMMAND: [&str; 2] = ["python", "/opt/hetero-fleet/benchmark.py"];

pub const DEFAULT_BENCHMARK_TIMEOUT: Duration = Duration::from_secs(600);

/// Shared memory for benchmark and worker units (16 GiB)
pub const DEFAULT_SHM_SIZE: i64 = 16 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkOptions {
    pub command: Vec<String>,
    /// Host script mounted into the unit instead of the baked-in workload
    pub script: Option<PathBuf>,
    pub timeout: Duration,
}

impl Default for BenchmarkOptions {
    fn default() -> Self {
        Self {
            command: DEFAULT_BENCHMARK_COMMAND.iter().map(|s| s.to_string()).collect(),
            script: None,
            timeout: DEFAULT_BENCHMARK_TIMEOUT,
        }
    }
}

impl BenchmarkOptions {
    /// Run a host script with `python` instead of the baked-in workload.
    pub fn with_script(mut self, script: &Path) -> Result<Self> {
        let script = script.canonicalize().map_err(|e| {
            FleetError::Config(format!("Benchmark script {}: {e}", script.display()))
        })?;
        let name = script
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| FleetError::Config(format!("Invalid script path {}", script.display())))?;
        self.command = vec!["python".to_string(), format!("/{name}")];
        self.script = Some(script);
        Ok(self)
    }
}

/// Devices found for one family and the image they run.
#[derive(Debug, Clone)]
pub struct FamilyInventory {
    pub family: Family,
    pub image: String,
    pub devices: Vec<Device>,
}

/// Elapsed seconds: the last non-empty output line.
pub fn parse_elapsed(lines: &[String]) -> Result<f64> {
    let last = lines
        .iter()
        .rev()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .ok_or_else(|| FleetError::Benchmark("workload printed nothing".to_string()))?;

    match last.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => Ok(secs),
        _ => Err(FleetError::Benchmark(format!(
            "last output line {last:?} is not an elapsed time"
        ))),
    }
}

/// `round(t_min / t * MAX_CAPABILITY, 1)`, rounding half to even.
pub fn normalize(elapsed: &[f64]) -> Vec<f64> {
    let t_min = elapsed.iter().copied().fold(f64::INFINITY, f64::min);
    elapsed
        .iter()
        .map(|t| {
            if *t == t_min {
                MAX_CAPABILITY
            } else {
                (t_min / t * MAX_CAPABILITY * 10.0).round_ties_even() / 10.0
            }
        })
        .collect()
}

/// Runs the benchmark workload through a container runtime.
pub struct Benchmarker<'a> {
    runtime: &'a dyn ContainerRuntime,
    options: BenchmarkOptions,
    cancel: watch::Receiver<bool>,
}

impl<'a> Benchmarker<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, options: BenchmarkOptions) -> Self {
        Self {
            runtime,
            options,
            cancel: never_cancelled(),
        }
    }

    /// Stop at the next step once `cancel` flips to `true`. A running unit is
    /// removed before returning [`FleetError::Interrupted`].
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    fn unit_spec(&self, device: &Device, image: &str) -> UnitSpec {
        let binds = self
            .options
            .script
            .iter()
            .filter_map(|script| {
                let name = script.file_name()?.to_str()?;
                Some(BindMount {
                    source: script.display().to_string(),
                    target: format!("/{name}"),
                    read_only: true,
                })
            })
            .collect();

        UnitSpec {
            name: benchmark_unit_name(device.family, device.local_index),
            image: image.to_string(),
            command: self.options.command.clone(),
            binds,
            working_dir: Some("/".to_string()),
            shm_size: Some(DEFAULT_SHM_SIZE),
            devices: (family_spec(device.family).bindings)(&[device.local_index]),
            ..Default::default()
        }
    }

    /// Elapsed seconds of the workload on one device.
    pub async fn benchmark(&self, device: &Device, image: &str) -> Result<f64> {
        let mut cancel = self.cancel.clone();
        if !interruptible(&mut cancel, self.runtime.image_exists(image)).await? {
            return Err(FleetError::Benchmark(format!(
                "Image {image} not found locally. Build or pull it first."
            )));
        }

        let spec = self.unit_spec(device, image);
        if interruptible(&mut cancel, self.runtime.remove_unit(&spec.name)).await? {
            warn!(unit = %spec.name, "Removed leftover benchmark unit");
        }

        let run = async { Ok::<_, FleetError>(timeout(self.options.timeout, self.run_unit(&spec)).await) };
        let outcome = interruptible(&mut cancel, run).await;

        // The unit goes away whatever happened
        let removal = self.runtime.remove_unit(&spec.name).await;

        let (exit_code, lines) = match outcome {
            Err(e) => {
                if let Err(removal_err) = &removal {
                    warn!(unit = %spec.name, error = %removal_err, "Failed to remove interrupted benchmark unit");
                }
                info!(device = %device.device_number(), "Benchmark interrupted");
                return Err(e);
            }
            Ok(Err(_)) => {
                return Err(FleetError::Benchmark(format!(
                    "{} timed out after {}s",
                    device.device_number(),
                    self.options.timeout.as_secs()
                )))
            }
            Ok(Ok(Err(e))) => {
                return Err(FleetError::Benchmark(format!("{}: {e}", device.device_number())))
            }
            Ok(Ok(Ok(result))) => result,
        };
        removal?;

        if exit_code != 0 {
            let tail = lines.last().map(String::as_str).unwrap_or("");
            return Err(FleetError::Benchmark(format!(
                "{} exited with code {exit_code}: {tail}",
                device.device_number()
            )));
        }

        let elapsed = parse_elapsed(&lines)
            .map_err(|e| FleetError::Benchmark(format!("{}: {e}", device.device_number())))?;
        info!(device = %device.device_number(), elapsed_secs = elapsed, "Benchmark finished");
        Ok(elapsed)
    }

    async fn run_unit(&self, spec: &UnitSpec) -> Result<(i64, Vec<String>)> {
        self.runtime.start_unit(spec).await?;

        let mut output = self.runtime.follow_output(&spec.name).await?;
        let mut lines = Vec::new();
        while let Some(line) = output.next().await {
            lines.push(line?);
        }

        let exit_code = self.runtime.wait_exit(&spec.name).await?;
        Ok((exit_code, lines))
    }

    /// Benchmark every device, one at a time, and build a descriptor.
    ///
    /// Nothing is returned unless every device succeeded. An interrupt stops
    /// before the next device.
    pub async fn build_descriptor(&self, inventories: &[FamilyInventory]) -> Result<FleetDescriptor> {
        let mut elapsed = Vec::new();
        for inventory in inventories {
            for device in &inventory.devices {
                elapsed.push(self.benchmark(device, &inventory.image).await?);
            }
        }

        let mut scores = normalize(&elapsed).into_iter();
        let mut descriptor = FleetDescriptor::new();
        for inventory in inventories {
            let devices = inventory
                .devices
                .iter()
                .zip(scores.by_ref())
                .map(|(device, score)| DeviceRecord::from_device(device, score))
                .collect();
            descriptor.insert_family(
                inventory.family,
                FamilyRecord {
                    image: inventory.image.clone(),
                    devices,
                },
            );
        }

        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Benchmark and then atomically replace the descriptor at `path`.
    ///
    /// A failed benchmark leaves any existing file untouched.
    pub async fn rebuild_descriptor(
        &self,
        inventories: &[FamilyInventory],
        path: &Path,
    ) -> Result<FleetDescriptor> {
        let descriptor = self.build_descriptor(inventories).await?;
        descriptor.save(path)?;
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{mib_to_bytes, LinkInfo};
    use crate::runtime::fake::FakeRuntime;
    use tempfile::TempDir;

    fn device(family: Family, local_index: u32) -> Device {
        Device {
            family,
            local_index,
            name: "accelerator".to_string(),
            bus_id: format!("0000:{local_index:02x}:00.0"),
            link: LinkInfo {
                current_gen: Some(4),
                current_width: Some(16),
                max_gen: Some(4),
                max_width: Some(16),
            },
            memory_bytes: mib_to_bytes(16384),
        }
    }

    fn inventories() -> Vec<FamilyInventory> {
        vec![
            FamilyInventory {
                family: Family::Cuda,
                image: "hetero-fleet:cuda".to_string(),
                devices: vec![device(Family::Cuda, 0)],
            },
            FamilyInventory {
                family: Family::Mlu,
                image: "hetero-fleet:mlu".to_string(),
                devices: vec![device(Family::Mlu, 0), device(Family::Mlu, 1)],
            },
        ]
    }

    fn runtime() -> FakeRuntime {
        FakeRuntime::new()
            .with_image("hetero-fleet:cuda")
            .with_image("hetero-fleet:mlu")
            .with_output("hetero-fleet-benchmark-cuda-0", &["warming up", "12.5"])
            .with_output("hetero-fleet-benchmark-mlu-0", &["50.0", ""])
            .with_output("hetero-fleet-benchmark-mlu-1", &["37.5"])
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(&[12.5, 50.0, 37.5]), vec![10.0, 2.5, 3.3]);
        assert_eq!(normalize(&[7.0]), vec![10.0]);
        assert_eq!(normalize(&[3.0, 3.0]), vec![10.0, 10.0]);
    }

    #[test]
    fn test_parse_elapsed() {
        let lines = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(parse_elapsed(&lines(&["step 1", "3.25", "  "])).unwrap(), 3.25);
        assert!(parse_elapsed(&lines(&[])).is_err());
        assert!(parse_elapsed(&lines(&["done"])).is_err());
        assert!(parse_elapsed(&lines(&["-1"])).is_err());
    }

    #[tokio::test]
    async fn test_build_descriptor() {
        let runtime = runtime();
        let descriptor = Benchmarker::new(&runtime, BenchmarkOptions::default())
            .build_descriptor(&inventories())
            .await
            .unwrap();

        let cuda = descriptor.family(Family::Cuda).unwrap();
        assert_eq!(cuda.devices[0].compute_capability, Some(10.0));
        let mlu = descriptor.family(Family::Mlu).unwrap();
        assert_eq!(mlu.devices[0].compute_capability, Some(2.5));
        assert_eq!(mlu.devices[1].compute_capability, Some(3.3));
        assert_eq!(mlu.devices[1].device_number, "mlu:1");

        // Every benchmark unit was removed
        assert_eq!(runtime.remaining(), 0);
    }

    #[tokio::test]
    async fn test_unit_is_pinned_to_one_device() {
        let runtime = runtime();
        let benchmarker = Benchmarker::new(&runtime, BenchmarkOptions::default());
        let spec = benchmarker.unit_spec(&device(Family::Mlu, 1), "hetero-fleet:mlu");

        assert_eq!(spec.name, "hetero-fleet-benchmark-mlu-1");
        assert_eq!(spec.devices, (family_spec(Family::Mlu).bindings)(&[1]));
        assert_eq!(spec.command, vec!["python", "/opt/hetero-fleet/benchmark.py"]);
    }

    #[tokio::test]
    async fn test_failing_benchmark_keeps_existing_descriptor() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fleet.toml");
        std::fs::write(&path, "create_time = \"2026-01-01 00:00:00\"\n").unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let runtime = runtime().with_exit_code("hetero-fleet-benchmark-mlu-1", 1);
        let err = Benchmarker::new(&runtime, BenchmarkOptions::default())
            .rebuild_descriptor(&inventories(), &path)
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::Benchmark(ref m) if m.contains("mlu:1")));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
        assert_eq!(runtime.remaining(), 0);
    }

    #[tokio::test]
    async fn test_benchmark_timeout_removes_unit() {
        let runtime = runtime().hanging("hetero-fleet-benchmark-cuda-0");
        let options = BenchmarkOptions {
            timeout: Duration::from_millis(50),
            ..Default::default()
        };

        let err = Benchmarker::new(&runtime, options)
            .benchmark(&device(Family::Cuda, 0), "hetero-fleet:cuda")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("timed out"));
        assert_eq!(runtime.remaining(), 0);
    }

    #[tokio::test]
    async fn test_interrupted_benchmark_removes_unit() {
        let runtime = runtime().hanging("hetero-fleet-benchmark-cuda-0");
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let benchmarker =
            Benchmarker::new(&runtime, BenchmarkOptions::default()).with_cancel(cancel_rx);

        let interrupt = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_tx.send(true).unwrap();
        };
        let cuda = device(Family::Cuda, 0);
        let (result, ()) = tokio::join!(
            benchmarker.benchmark(&cuda, "hetero-fleet:cuda"),
            interrupt
        );

        assert!(matches!(result, Err(FleetError::Interrupted)));
        assert_eq!(runtime.remaining(), 0);
        assert_eq!(
            runtime.events().last().map(String::as_str),
            Some("remove_unit hetero-fleet-benchmark-cuda-0")
        );
    }

    #[tokio::test]
    async fn test_interrupt_before_benchmark_keeps_descriptor() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fleet.toml");
        std::fs::write(&path, "create_time = \"2026-01-01 00:00:00\"\n").unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let runtime = runtime();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();

        let err = Benchmarker::new(&runtime, BenchmarkOptions::default())
            .with_cancel(cancel_rx)
            .rebuild_descriptor(&inventories(), &path)
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::Interrupted));
        assert!(runtime.events().iter().all(|e| !e.starts_with("start_unit")));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_missing_image() {
        let runtime = FakeRuntime::new();
        let err = Benchmarker::new(&runtime, BenchmarkOptions::default())
            .benchmark(&device(Family::Cuda, 0), "hetero-fleet:cuda")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found locally"));
    }

    #[tokio::test]
    async fn test_leftover_unit_is_replaced() {
        let runtime = runtime().with_leftover_unit("hetero-fleet-benchmark-cuda-0");
        let elapsed = Benchmarker::new(&runtime, BenchmarkOptions::default())
            .benchmark(&device(Family::Cuda, 0), "hetero-fleet:cuda")
            .await
            .unwrap();

        assert_eq!(elapsed, 12.5);
        let events = runtime.events();
        assert_eq!(events[0], "remove_unit hetero-fleet-benchmark-cuda-0");
        assert_eq!(events[1], "start_unit hetero-fleet-benchmark-cuda-0");
    }
}
