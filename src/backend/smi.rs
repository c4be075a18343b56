use std::process::Command;

use anyhow::{Context, Result as AnyResult, bail};
use tracing::{debug, info, trace, warn};

use crate::{
    backend::{BackendKind, GpuBackend},
    errors::{GpuError, Result},
    identity::{BusAddress, CrossReference, cross_reference, runtime_addresses},
    native::ComputeRuntime,
    operating_point::{Outcome, SavedPowerLimit},
    telemetry::{ClockReport, SerialNumber, split_pci_ids},
};

const QUERY_FIELDS: [&str; 19] = [
    "index",
    "pci.domain",
    "pci.bus",
    "pci.device",
    "pci.device_id",
    "pci.sub_device_id",
    "name",
    "serial",
    "uuid",
    "vbios_version",
    "temperature.gpu",
    "fan.speed",
    "power.draw",
    "pstate",
    "power.limit",
    "power.default_limit",
    "power.min_limit",
    "power.max_limit",
    "driver_version",
];

// Runs the tool and returns its standard output
pub trait SmiRunner: Send {
    fn run(&self, args: &[String]) -> std::result::Result<String, String>;
}

pub struct SystemSmi;

impl SmiRunner for SystemSmi {
    fn run(&self, args: &[String]) -> std::result::Result<String, String> {
        trace!("Running nvidia-smi {}", args.join(" "));

        let output = Command::new("nvidia-smi")
            .args(args)
            .output()
            .map_err(|err| format!("nvidia-smi not found: {err}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let message = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(message.trim().to_string());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// One line of the CSV query. Values the tool reports as N/A or
// not supported are None.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmiRecord {
    pub index: u32,
    pub address: Option<BusAddress>,
    pub pci_device_id: Option<u32>,
    pub pci_subsystem_id: Option<u32>,
    pub name: Option<String>,
    pub serial: Option<String>,
    pub uuid: Option<String>,
    pub vbios: Option<String>,
    pub temperature: Option<u32>,
    pub fan: Option<u32>,
    // Power values in watts
    pub power_draw: Option<f32>,
    pub pstate: Option<u32>,
    pub power_limit: Option<f32>,
    pub default_power_limit: Option<f32>,
    pub min_power_limit: Option<f32>,
    pub max_power_limit: Option<f32>,
    pub driver_version: Option<String>,
}

fn field(value: &str) -> Option<&str> {
    match value {
        "" | "N/A" | "[N/A]" | "[Not Supported]" | "[Unknown Error]" => None,
        value => Some(value),
    }
}

fn parse_hex(value: &str) -> Option<u32> {
    let value = field(value)?;
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);

    u32::from_str_radix(digits, 16).ok()
}

fn parse_pstate(value: &str) -> Option<u32> {
    field(value)?.strip_prefix('P')?.parse().ok()
}

fn watts_to_mw(watts: f32) -> u32 {
    (watts * 1000.0).round() as u32
}

// Parse `--format=csv,noheader,nounits` output of the query above
pub fn parse_query(stdout: &str) -> Vec<SmiRecord> {
    let mut records = Vec::new();

    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if parts.len() < QUERY_FIELDS.len() {
            trace!("Skipping malformed nvidia-smi line: {line}");
            continue;
        }

        let index = match parts[0].parse::<u32>() {
            Ok(index) => index,
            Err(err) => {
                warn!("Failed to parse GPU index '{}': {}", parts[0], err);
                continue;
            }
        };

        let address = match (parse_hex(parts[1]), parse_hex(parts[2]), parse_hex(parts[3])) {
            (Some(domain), Some(bus), Some(device)) => Some(BusAddress {
                domain,
                bus,
                device,
            }),
            _ => None,
        };

        let text = |value: &str| field(value).map(str::to_string);
        let number = |value: &str| field(value).and_then(|v| v.parse::<u32>().ok());
        let watts = |value: &str| field(value).and_then(|v| v.parse::<f32>().ok());

        records.push(SmiRecord {
            index,
            address,
            pci_device_id: parse_hex(parts[4]),
            pci_subsystem_id: parse_hex(parts[5]),
            name: text(parts[6]),
            serial: text(parts[7]),
            uuid: text(parts[8]),
            vbios: text(parts[9]),
            temperature: number(parts[10]),
            fan: number(parts[11]),
            power_draw: watts(parts[12]),
            pstate: parse_pstate(parts[13]),
            power_limit: watts(parts[14]),
            default_power_limit: watts(parts[15]),
            min_power_limit: watts(parts[16]),
            max_power_limit: watts(parts[17]),
            driver_version: text(parts[18]),
        });
    }

    records
}

fn query_args(smi_index: Option<u32>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(index) = smi_index {
        args.push("-i".to_string());
        args.push(index.to_string());
    }
    args.push(format!("--query-gpu={}", QUERY_FIELDS.join(",")));
    args.push("--format=csv,noheader,nounits".to_string());

    args
}

// Fallback driving the `nvidia-smi` tool, one CSV query per reading
pub struct SmiBackend {
    runner: Box<dyn SmiRunner>,
    // Tool indices in enumeration order
    smi_indices: Vec<u32>,
    xref: CrossReference,
    driver_version: Option<String>,
    // Power limit baseline per runtime index
    saved_limits: Vec<Option<SavedPowerLimit>>,
}

impl SmiBackend {
    pub fn open(runtime: &dyn ComputeRuntime) -> AnyResult<Self> {
        Self::with_runner(Box::new(SystemSmi), runtime)
    }

    pub fn with_runner(runner: Box<dyn SmiRunner>, runtime: &dyn ComputeRuntime) -> AnyResult<Self> {
        let stdout = runner
            .run(&query_args(None))
            .map_err(|message| anyhow::anyhow!(message))
            .context("Failed to query nvidia-smi")?;

        let records = parse_query(&stdout);
        if records.is_empty() {
            bail!("nvidia-smi reported no GPU");
        }

        let runtime_addrs = runtime_addresses(runtime)
            .map_err(|status| anyhow::anyhow!("{status}"))
            .context("Failed to query CUDA devices")?;
        let smi_addrs: Vec<Option<BusAddress>> =
            records.iter().map(|record| record.address).collect();

        let xref = cross_reference(&runtime_addrs, &smi_addrs);

        info!(
            "nvidia-smi reports {} GPU(s), CUDA reports {} GPU(s), {} matched",
            records.len(),
            runtime_addrs.len(),
            xref.runtime_to_mgmt.iter().flatten().count()
        );

        Ok(Self {
            runner,
            smi_indices: records.iter().map(|record| record.index).collect(),
            driver_version: records.iter().find_map(|record| record.driver_version.clone()),
            saved_limits: vec![None; runtime_addrs.len()],
            xref,
        })
    }

    fn smi_index(&self, index: usize) -> Result<u32> {
        self.xref
            .runtime_to_mgmt
            .get(index)
            .copied()
            .flatten()
            .and_then(|m| self.smi_indices.get(m).copied())
            .ok_or(GpuError::DeviceUnmapped { index })
    }

    // Fresh readings of one device
    fn query(&self, index: usize, what: &'static str) -> Result<SmiRecord> {
        let smi_index = self.smi_index(index)?;

        let stdout = self
            .runner
            .run(&query_args(Some(smi_index)))
            .map_err(|message| {
                warn!("GPU #{index}: nvidia-smi query failed: {message}");
                GpuError::ReadFailed {
                    index,
                    what,
                    message,
                }
            })?;

        parse_query(&stdout)
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::ReadFailed {
                index,
                what,
                message: "unexpected nvidia-smi output".to_string(),
            })
    }

    fn reading<T>(
        &self,
        index: usize,
        what: &'static str,
        pick: impl FnOnce(SmiRecord) -> Option<T>,
    ) -> Result<T> {
        let record = self.query(index, what)?;

        pick(record).ok_or_else(|| {
            debug!("GPU #{index}: {what} is not reported by nvidia-smi");
            GpuError::Unsupported { index, what }
        })
    }

    fn apply_power_limit(&self, index: usize, smi_index: u32, watts: u32) -> Result<()> {
        let args = [
            "-i".to_string(),
            smi_index.to_string(),
            "-pl".to_string(),
            watts.to_string(),
        ];

        self.runner.run(&args).map(|_| ()).map_err(|message| {
            warn!("GPU #{index}: plimit {message}");
            GpuError::ApplyFailed {
                index,
                what: "power limit",
                message,
            }
        })
    }
}

impl GpuBackend for SmiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Smi
    }

    fn device_count(&self) -> usize {
        self.xref.runtime_to_mgmt.len()
    }

    fn driver_version(&self) -> Option<String> {
        self.driver_version.clone()
    }

    fn temperature(&self, index: usize) -> Result<u32> {
        self.reading(index, "temperature", |record| record.temperature)
    }

    fn fan_percent(&self, index: usize) -> Result<u32> {
        self.reading(index, "fan speed", |record| record.fan)
    }

    fn power_usage(&self, index: usize) -> Result<u32> {
        self.reading(index, "power usage", |record| record.power_draw.map(watts_to_mw))
    }

    fn performance_state(&self, index: usize) -> Result<u32> {
        self.reading(index, "performance state", |record| record.pstate)
    }

    fn bus_id(&self, index: usize) -> Result<u32> {
        self.reading(index, "bus id", |record| record.address.map(|a| a.bus))
    }

    fn pci_ids(&self, index: usize) -> Result<(u16, u16)> {
        self.reading(index, "pci ids", |record| {
            record
                .pci_device_id
                .map(|id| split_pci_ids(id, record.pci_subsystem_id.unwrap_or(0)))
        })
    }

    fn serial(&self, index: usize) -> Result<SerialNumber> {
        self.reading(index, "serial", |record| match record.serial {
            Some(serial) => Some(SerialNumber::Reported(serial)),
            None => record.uuid.as_deref().map(SerialNumber::from_uuid),
        })
    }

    fn bios_version(&self, index: usize) -> Result<String> {
        self.reading(index, "bios version", |record| record.vbios)
    }

    fn name(&self, index: usize) -> Result<String> {
        self.reading(index, "name", |record| record.name)
    }

    fn clock_report(&self, index: usize) -> Result<ClockReport> {
        self.smi_index(index)?;
        Err(GpuError::Unsupported {
            index,
            what: "clocks",
        })
    }

    fn set_application_clocks(
        &mut self,
        index: usize,
        mem: Option<u32>,
        gpu: Option<u32>,
    ) -> Result<Outcome> {
        self.smi_index(index)?;
        if mem.unwrap_or(0) == 0 && gpu.unwrap_or(0) == 0 {
            return Ok(Outcome::NoOp);
        }

        Err(GpuError::Unsupported {
            index,
            what: "application clocks",
        })
    }

    fn reset_application_clocks(&mut self, index: usize) -> Result<Outcome> {
        // Clocks are never changed through this backend
        self.smi_index(index)?;
        Ok(Outcome::NoOp)
    }

    fn set_pstate_clocks(
        &mut self,
        index: usize,
        pstate: Option<u8>,
        _mem: Option<u32>,
        _gpu: Option<u32>,
    ) -> Result<Outcome> {
        self.smi_index(index)?;
        if pstate.is_none() {
            return Ok(Outcome::NoOp);
        }

        Err(GpuError::Unsupported {
            index,
            what: "pstate clocks",
        })
    }

    fn set_power_limit(&mut self, index: usize, watts: u32) -> Result<Outcome> {
        let smi_index = self.smi_index(index)?;
        if watts == 0 {
            return Ok(Outcome::NoOp);
        }

        let record = self.query(index, "power limit")?;
        let Some(max) = record.max_power_limit.or(record.power_limit) else {
            return Err(GpuError::Unsupported {
                index,
                what: "power limit",
            });
        };
        let min = record.min_power_limit.unwrap_or(1.0);

        // Whole watts inside the allowed range, never past a fractional bound
        let limit = (watts as f32).min(max.floor()).max(min.ceil()) as u32;

        self.apply_power_limit(index, smi_index, limit)?;

        info!("GPU #{index}: power limit set to {limit}W (allowed range is {min}-{max})");

        if self.saved_limits[index].is_none() {
            self.saved_limits[index] = Some(
                record
                    .power_limit
                    .map(|watts| SavedPowerLimit::Known(watts_to_mw(watts)))
                    .unwrap_or(SavedPowerLimit::Unknown),
            );
        }

        Ok(Outcome::Changed)
    }

    fn reset_power_limit(&mut self, index: usize) -> Result<Outcome> {
        let smi_index = self.smi_index(index)?;

        let Some(saved) = self.saved_limits[index].take() else {
            return Ok(Outcome::NoOp);
        };

        let target = match saved {
            SavedPowerLimit::Known(limit) => Some((limit + 500) / 1000),
            SavedPowerLimit::Unknown => self
                .query(index, "default power limit")
                .ok()
                .and_then(|record| record.default_power_limit)
                .map(|watts| watts.round() as u32),
        };

        match target {
            Some(watts) => match self.apply_power_limit(index, smi_index, watts) {
                Ok(()) => info!("GPU #{index}: power limit restored to {watts}W"),
                Err(err) => warn!("{err}"),
            },
            None => warn!("GPU #{index}: no power limit to restore"),
        }

        Ok(Outcome::Restored)
    }

    fn restore_all(&mut self) -> usize {
        let mut restored = 0;

        for index in 0..self.saved_limits.len() {
            if self.saved_limits[index].is_none() {
                continue;
            }

            if let Err(err) = self.reset_power_limit(index) {
                warn!("{err}");
            }
            restored += 1;
        }

        restored
    }
}

impl Drop for SmiBackend {
    fn drop(&mut self) {
        self.restore_all();
    }
}
