//! hetero-fleet launcher - Command Line Interface
//!
//! Runs one data-parallel training job across every accelerator family on
//! this host, each family in its own container.
//!
//! ## Commands
//!
//! - `init` - Probe devices, benchmark them and write the fleet descriptor
//! - `run` - Launch a training entrypoint on the selected devices
//! - `status` - Show the fleet descriptor and the current selection
//!
//! Devices are selected with `USE_CUDA` / `USE_MLU` (`all`, `-1` or `0,2,...`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use fleet_launcher::{
    discover, init_production_logging, init_simple_logging, watch_ctrl_c, BenchmarkOptions,
    Benchmarker, CommandRunner, DockerRuntime, FamilyInventory, FleetDescriptor, FleetError,
    FleetPlan, JobReport, LaunchOptions, Launcher, RedisSeeder, Selection, FAMILIES,
    INTERRUPTED_EXIT_CODE,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// hetero-fleet - one training job across heterogeneous accelerators
#[derive(Parser, Debug)]
#[command(name = "hfleet")]
#[command(about = "Heterogeneous accelerator training launcher", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Probe and benchmark devices, then write the fleet descriptor
    Init {
        /// Rebuild the descriptor even if one exists
        #[arg(short, long)]
        force: bool,

        /// Host benchmark script to run instead of the one in the image
        #[arg(long)]
        benchmark_script: Option<PathBuf>,

        /// Per-device benchmark timeout in seconds
        #[arg(long, default_value = "600")]
        benchmark_timeout: u64,

        /// Log level (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },

    /// Launch a training entrypoint on the selected devices
    Run {
        /// Training script, mounted into every worker unit
        entrypoint: PathBuf,

        /// Interpreter used to start the entrypoint
        #[arg(long, default_value = "python")]
        interpreter: String,

        /// Directory for log_<family>.txt files
        #[arg(long, default_value = ".")]
        log_dir: PathBuf,

        /// Do not echo worker output
        #[arg(short, long)]
        quiet: bool,

        /// Sample accelerator utilization into utilization.csv
        #[arg(long)]
        monitor: bool,

        /// Image of the capability registry unit
        #[arg(long, default_value = fleet_launcher::orchestrator::DEFAULT_REGISTRY_IMAGE)]
        registry_image: String,

        /// Log level
        #[arg(short, long, default_value = "info")]
        log_level: String,

        /// Extra arguments passed to the entrypoint
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Show the fleet descriptor and the current selection
    Status {
        /// Log level
        #[arg(short, long, default_value = "warn")]
        log_level: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = dispatch(cli).await {
        if matches!(e.downcast_ref::<FleetError>(), Some(FleetError::Interrupted)) {
            eprintln!("\n{} Interrupted. Units started by this command were removed.", "⚠️ ".yellow());
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
        error!(error = %format!("{e:#}"), "Command failed");
        eprintln!("\n{} {e:#}", "✗".red());
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init {
            force,
            benchmark_script,
            benchmark_timeout,
            log_level,
        } => {
            init_simple_logging(&log_level)?;
            cmd_init(force, benchmark_script, benchmark_timeout).await
        }

        Commands::Run {
            entrypoint,
            interpreter,
            log_dir,
            quiet,
            monitor,
            registry_image,
            log_level,
            args,
        } => {
            // Production logging with file rotation for jobs
            init_production_logging(&log_level, None)?;

            let mut options = LaunchOptions::new(entrypoint);
            options.interpreter = interpreter;
            options.log_dir = log_dir;
            options.quiet = quiet;
            options.monitor = monitor;
            options.registry_image = registry_image;
            options.args = args;
            cmd_run(options).await
        }

        Commands::Status { log_level } => {
            init_simple_logging(&log_level)?;
            cmd_status()
        }
    }
}

/// Probe, benchmark and persist the fleet descriptor.
async fn cmd_init(force: bool, benchmark_script: Option<PathBuf>, timeout_secs: u64) -> Result<()> {
    let path = FleetDescriptor::default_path()?;
    let existing = if path.exists() {
        if !force {
            println!("✅ Fleet descriptor already exists: {}", path.display());
            println!("\nRun 'hfleet init --force' to benchmark again.");
            return Ok(());
        }
        FleetDescriptor::load(&path).ok()
    } else {
        None
    };

    println!("🔧 Initializing hetero-fleet...\n");

    let selection = Selection::from_env().context("Invalid device selection")?;
    let runner = CommandRunner::new().timeout(Duration::from_secs(60));

    println!("🔍 Probing devices...");
    let mut inventories = Vec::new();
    for spec in FAMILIES.iter() {
        let family = spec.family;
        if !selection.probes(family) {
            println!("   {}: skipped ({}=-1)", family, spec.selector_var);
            continue;
        }

        let devices = discover(family, &runner)
            .await
            .with_context(|| format!("Failed to probe {family} devices"))?;
        if devices.is_empty() {
            println!("   {}: none", family);
            continue;
        }
        for device in &devices {
            println!(
                "   {}  {}  {}  {}",
                device.device_number().bold(),
                device.name,
                device.link,
                device.memory_summary()
            );
        }

        // Keep images chosen for an earlier descriptor
        let image = existing
            .as_ref()
            .and_then(|d| d.family(family))
            .map(|r| r.image.clone())
            .unwrap_or_else(|| spec.default_image.to_string());

        inventories.push(FamilyInventory {
            family,
            image,
            devices,
        });
    }

    if inventories.is_empty() {
        anyhow::bail!("No accelerator found on this host");
    }

    let mut options = BenchmarkOptions {
        timeout: Duration::from_secs(timeout_secs),
        ..Default::default()
    };
    if let Some(script) = benchmark_script {
        options = options.with_script(&script)?;
    }

    let device_count: usize = inventories.iter().map(|i| i.devices.len()).sum();
    println!("\n⏱️  Benchmarking {device_count} device(s), one at a time...");

    let runtime = DockerRuntime::connect()
        .await
        .context("Failed to connect to the container runtime")?;
    let (cancel, watcher) = watch_ctrl_c();
    let rebuilt = Benchmarker::new(&runtime, options)
        .with_cancel(cancel)
        .rebuild_descriptor(&inventories, &path)
        .await;
    watcher.abort();
    let descriptor = rebuilt?;

    print_descriptor(&descriptor);
    println!("\n✓ Fleet descriptor saved to: {}", path.display());
    println!("\n✅ Fleet initialized successfully!");
    println!("\nNext steps:");
    println!("  USE_CUDA=all USE_MLU=all hfleet run train.py");

    Ok(())
}

/// Launch one job and wait for it.
async fn cmd_run(options: LaunchOptions) -> Result<()> {
    let descriptor = FleetDescriptor::load(&FleetDescriptor::default_path()?)?;
    let selection = Selection::from_env().context("Invalid device selection")?;
    let plan = FleetPlan::build(&descriptor, &selection)?;

    println!("🚀 Launching job {}\n", plan.job_id().bold());
    for assignment in plan.families() {
        let ranks = assignment.global_rank_start..assignment.global_rank_start + assignment.devices.len();
        println!(
            "   {}  devices {:?}  ranks {:?}  image {}",
            assignment.family.to_string().bold(),
            assignment.local_indices(),
            ranks,
            assignment.image
        );
    }
    println!();

    let runtime = DockerRuntime::connect()
        .await
        .context("Failed to connect to the container runtime")?;
    let launcher = Launcher::new(Arc::new(runtime), Arc::new(RedisSeeder), options);

    let report = launcher.run_until_interrupted(&plan).await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &JobReport) {
    println!("\n{}", "Job finished".green().bold());
    for unit in &report.units {
        println!(
            "   {}  exit {}  {} lines  {}",
            unit.family.to_string().bold(),
            unit.exit_code,
            unit.lines,
            unit.log_path.display()
        );
    }

    if let Some(utilization) = &report.utilization {
        println!("\n📈 Average utilization ({} samples)", utilization.samples);
        for (device, average) in &utilization.averages {
            println!("   {device}: {average:.2}%");
        }
    }
    info!(job_id = %report.job_id, "Job report printed");
}

/// Show the descriptor and what `run` would select right now.
fn cmd_status() -> Result<()> {
    println!("📊 hetero-fleet Status\n");

    let path = FleetDescriptor::default_path()?;
    let descriptor = match FleetDescriptor::load(&path) {
        Ok(descriptor) => descriptor,
        Err(FleetError::Config(message)) => {
            println!("⚠️  {message}");
            return Ok(());
        }
        Err(e) => return Err(e).context(format!("Failed to read {}", path.display())),
    };

    println!("✅ Descriptor: {}", path.display());
    println!("   Created: {}", descriptor.create_time);
    print_descriptor(&descriptor);

    println!("\n🎛️  Selection");
    match Selection::from_env() {
        Ok(selection) => {
            for spec in FAMILIES.iter() {
                println!(
                    "   {}={}",
                    spec.selector_var,
                    selection.selector(spec.family)
                );
            }
            match FleetPlan::build(&descriptor, &selection) {
                Ok(plan) => println!(
                    "   {} family group(s), {} rank(s)",
                    plan.group_world_size(),
                    plan.global_world_size()
                ),
                Err(e) => println!("   {} {e}", "⚠️ ".yellow()),
            }
        }
        Err(e) => println!("   {} {e}", "✗".red()),
    }

    Ok(())
}

fn print_descriptor(descriptor: &FleetDescriptor) {
    for (family, record) in &descriptor.devices {
        println!("\n   {} ({})", family.bold(), record.image);
        for device in &record.devices {
            let capability = device
                .compute_capability
                .map(|c| format!("{c:.1}"))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "     {:<8} {:>5}  {}  {}  {}",
                device.device_number,
                capability.cyan(),
                device.name,
                device.link_status,
                device.memory
            );
        }
    }
}
