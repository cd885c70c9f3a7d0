//! Background accelerator utilization sampler for `hfleet run --monitor`.

use crate::command::{CommandError, CommandRunner};
use crate::device::Family;
use crate::errors::Result;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_SAMPLE_PERIOD: Duration = Duration::from_secs(1);

pub const UTILIZATION_FILE: &str = "utilization.csv";

/// One reading of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct UtilizationSample {
    pub elapsed_secs: f64,
    pub device: String,
    pub percent: u32,
}

/// Per-device mean over the whole job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UtilizationSummary {
    pub samples: usize,
    pub averages: BTreeMap<String, f64>,
}

impl UtilizationSummary {
    fn from_samples(samples: &[UtilizationSample]) -> Self {
        let mut totals: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for sample in samples {
            let entry = totals.entry(sample.device.clone()).or_default();
            entry.0 += u64::from(sample.percent);
            entry.1 += 1;
        }

        Self {
            samples: samples.len(),
            averages: totals
                .into_iter()
                .map(|(device, (sum, count))| (device, sum as f64 / count as f64))
                .collect(),
        }
    }
}

/// `nvidia-smi --query-gpu=utilization.gpu --format=csv,noheader,nounits`
pub fn parse_nvidia_utilization(stdout: &str) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Plain `cnmon` table. Device rows look like
/// `| 0     /     MLU370-S4     | 37%   ...  |`: the first cell holds the
/// device index and name, the second starts with the utilization.
pub fn parse_cnmon_utilization(stdout: &str) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut cells = line.trim().strip_prefix('|')?.split('|');
            let (index, _name) = cells.next()?.split_once('/')?;
            index.trim().parse::<u32>().ok()?;

            let percent = cells.next()?.split_whitespace().next()?.strip_suffix('%')?;
            percent.parse().ok()
        })
        .collect()
}

/// Samples every monitored family once per period until stopped.
pub struct UtilizationMonitor {
    runner: CommandRunner,
    families: Vec<Family>,
    period: Duration,
    path: PathBuf,
}

impl UtilizationMonitor {
    pub fn new(families: Vec<Family>, log_dir: &Path) -> Self {
        Self {
            runner: CommandRunner::new().timeout(Duration::from_secs(5)),
            families,
            period: DEFAULT_SAMPLE_PERIOD,
            path: log_dir.join(UTILIZATION_FILE),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current utilization of every device of one family.
    pub async fn sample(&self, family: Family) -> std::result::Result<Vec<u32>, CommandError> {
        match family {
            Family::Cuda => {
                let output = self
                    .runner
                    .execute(
                        "nvidia-smi",
                        &["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"],
                    )
                    .await?;
                Ok(parse_nvidia_utilization(&output.stdout))
            }
            Family::Mlu => {
                let output = self.runner.execute("cnmon", &[]).await?;
                Ok(parse_cnmon_utilization(&output.stdout))
            }
        }
    }

    /// Sample until `stop` flips, then write the CSV.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> Result<UtilizationSummary> {
        info!(families = ?self.families, path = %self.path.display(), "Utilization monitor started");

        let started = Instant::now();
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut samples = Vec::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let elapsed_secs = started.elapsed().as_secs_f64();
            for family in &self.families {
                match self.sample(*family).await {
                    Ok(readings) => {
                        samples.extend(readings.into_iter().enumerate().map(|(i, percent)| {
                            UtilizationSample {
                                elapsed_secs,
                                device: format!("{}:{i}", family.tag()),
                                percent,
                            }
                        }))
                    }
                    Err(e) => warn!(family = %family, error = %e, "Utilization sample failed"),
                }
            }
        }

        write_csv(&self.path, &samples)?;
        debug!(samples = samples.len(), "Utilization monitor stopped");
        Ok(UtilizationSummary::from_samples(&samples))
    }
}

fn write_csv(path: &Path, samples: &[UtilizationSample]) -> Result<()> {
    let mut csv = String::from("elapsed_secs,device,percent\n");
    for sample in samples {
        let _ = writeln!(csv, "{:.3},{},{}", sample.elapsed_secs, sample.device, sample.percent);
    }
    std::fs::write(path, csv)?;
    Ok(())
}
