//! Vendor query tools and their output formats.

use super::{family_spec, mib_to_bytes, Device, Family, LinkInfo};
use crate::command::{CommandError, CommandRunner};
use crate::errors::{FleetError, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

const NVIDIA_SMI: &str = "nvidia-smi";
const NVIDIA_QUERY: &str = "--query-gpu=name,pci.bus_id,pcie.link.gen.current,pcie.link.width.current,pcie.link.gen.max,pcie.link.width.max,memory.total";

const CNMON: &str = "cnmon";
const CNMON_REPORT: &str = "cnmon_info.json";

/// Probe the host for devices of one family.
///
/// An absent vendor tool yields an empty list. Index in the list is the local rank.
pub async fn discover(family: Family, runner: &CommandRunner) -> Result<Vec<Device>> {
    let devices = (family_spec(family).discover)(runner).await?;

    for device in &devices {
        info!(
            device = %device.device_number(),
            name = %device.name,
            bus_id = %device.bus_id,
            link = %device.link,
            memory = %device.memory_summary(),
            "Found device"
        );
    }
    if devices.is_empty() {
        info!(family = %family, "No devices found");
    }
    Ok(devices)
}

/// Map a command failure to discovery semantics. `None` means the tool is absent.
fn tool_output(
    result: std::result::Result<crate::command::CommandOutput, CommandError>,
) -> Result<Option<String>> {
    match result {
        Ok(output) if output.is_success() => Ok(Some(output.stdout)),
        Ok(output) => Err(FleetError::Discovery(format!(
            "query tool exited with status {}: {}",
            output.exit_code,
            output.stderr_trimmed()
        ))),
        Err(CommandError::NotFound { program }) => {
            info!(program = %program, "Query tool not installed, skipping family");
            Ok(None)
        }
        Err(e) => Err(FleetError::Discovery(e.to_string())),
    }
}

pub(crate) async fn discover_nvidia(runner: &CommandRunner) -> Result<Vec<Device>> {
    let result = runner
        .execute(NVIDIA_SMI, &[NVIDIA_QUERY, "--format=csv,noheader"])
        .await;
    match tool_output(result)? {
        Some(stdout) => parse_nvidia_smi_csv(&stdout),
        None => Ok(Vec::new()),
    }
}

pub(crate) async fn discover_cambricon(runner: &CommandRunner) -> Result<Vec<Device>> {
    // cnmon writes its report into the working directory
    let scratch = tempfile::TempDir::new()?;
    let result = runner
        .clone()
        .working_dir(scratch.path())
        .execute(CNMON, &["info", "-j"])
        .await;
    if tool_output(result)?.is_none() {
        return Ok(Vec::new());
    }

    let report_path = scratch.path().join(CNMON_REPORT);
    let report = tokio::fs::read_to_string(&report_path).await.map_err(|e| {
        FleetError::Discovery(format!("cannot read {}: {e}", report_path.display()))
    })?;
    parse_cnmon_json(&report)
}

/// Parse `nvidia-smi --format=csv,noheader` output for the inventory query.
pub fn parse_nvidia_smi_csv(text: &str) -> Result<Vec<Device>> {
    let mut devices = Vec::new();

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [name, bus_id, cur_gen, cur_width, max_gen, max_width, memory] = fields[..] else {
            return Err(FleetError::Discovery(format!(
                "expected 7 fields from {NVIDIA_SMI}, got {}: {line:?}",
                fields.len()
            )));
        };

        devices.push(Device {
            family: Family::Cuda,
            local_index: devices.len() as u32,
            name: name.to_string(),
            bus_id: bus_id.to_string(),
            link: LinkInfo {
                current_gen: parse_link_field(cur_gen, "link generation")?,
                current_width: parse_link_field(cur_width, "link width")?,
                max_gen: parse_link_field(max_gen, "max link generation")?,
                max_width: parse_link_field(max_width, "max link width")?,
            },
            memory_bytes: mib_to_bytes(parse_mib(memory)?),
        });
    }

    Ok(devices)
}

#[derive(Debug, Deserialize)]
struct CnmonReport {
    #[serde(rename = "CnmonInfo")]
    cards: Vec<CnmonCard>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CnmonCard {
    product_name: String,
    #[serde(rename = "PCI")]
    pci: CnmonPci,
    physical_mem_usage: CnmonMemory,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CnmonPci {
    #[serde(rename = "DomainID")]
    domain_id: Value,
    bus: Value,
    device: Value,
    function: Value,
    current_speed: String,
    max_speed: String,
    current_width: Value,
    max_width: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CnmonMemory {
    total: Value,
}

/// Parse the `cnmon info -j` report.
pub fn parse_cnmon_json(text: &str) -> Result<Vec<Device>> {
    let report: CnmonReport = serde_json::from_str(text)
        .map_err(|e| FleetError::Discovery(format!("malformed {CNMON_REPORT}: {e}")))?;

    report
        .cards
        .into_iter()
        .enumerate()
        .map(|(index, card)| {
            let pci = &card.pci;
            Ok(Device {
                family: Family::Mlu,
                local_index: index as u32,
                name: card.product_name.clone(),
                bus_id: format!(
                    "{}:{}:{}.{}",
                    text_of(&pci.domain_id),
                    text_of(&pci.bus),
                    text_of(&pci.device),
                    text_of(&pci.function)
                ),
                link: LinkInfo {
                    current_gen: Some(speed_to_generation(&pci.current_speed)?),
                    current_width: Some(parse_width(&pci.current_width)?),
                    max_gen: Some(speed_to_generation(&pci.max_speed)?),
                    max_width: Some(parse_width(&pci.max_width)?),
                },
                memory_bytes: mib_to_bytes(parse_mib(&text_of(&card.physical_mem_usage.total))?),
            })
        })
        .collect()
}

/// PCIe transfer rate to generation number
fn speed_to_generation(speed: &str) -> Result<u32> {
    match speed.trim() {
        "2.5 GT/s" => Ok(1),
        "5 GT/s" => Ok(2),
        "8 GT/s" => Ok(3),
        "16 GT/s" => Ok(4),
        "32 GT/s" => Ok(5),
        other => Err(FleetError::Discovery(format!("unknown PCIe speed {other:?}"))),
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// `x16` or `16`
fn parse_width(value: &Value) -> Result<u32> {
    let text = text_of(value);
    parse_number(text.trim_start_matches(['x', 'X']), "link width")
}

/// `40960 MiB` or `40960`
fn parse_mib(text: &str) -> Result<u64> {
    let number = text.trim().trim_end_matches("MiB").trim();
    parse_number(number, "memory")
}

/// A number, or `None` for `[N/A]` and other bracketed placeholders
fn parse_link_field(text: &str, what: &str) -> Result<Option<u32>> {
    let text = text.trim();
    if text == "N/A" || (text.starts_with('[') && text.ends_with(']')) {
        return Ok(None);
    }
    parse_number(text, what).map(Some)
}

fn parse_number<T: std::str::FromStr>(text: &str, what: &str) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| FleetError::Discovery(format!("invalid {what}: {text:?}")))
}
