use std::fmt;

use anyhow::{Context, Result as AnyResult, bail};
use tracing::{debug, info, warn};

use crate::{
    errors::{GpuError, Result},
    identity::ManagementHandle,
    native::{ComputeRuntime, nvml::NvmlLibrary},
    operating_point::Outcome,
    telemetry::{ClockReport, DeviceDescriptor, SerialNumber},
    vendor,
};

pub mod smi;

pub use smi::SmiBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Nvml,
    Smi,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Nvml => write!(f, "NVML"),
            BackendKind::Smi => write!(f, "nvidia-smi"),
        }
    }
}

// Device operations addressed by runtime index. NVML is preferred,
// `nvidia-smi` can read sensors and change the power limit but has
// no control over application clocks.
pub trait GpuBackend: Send {
    fn kind(&self) -> BackendKind;
    fn device_count(&self) -> usize;
    fn driver_version(&self) -> Option<String>;

    fn temperature(&self, index: usize) -> Result<u32>;
    fn fan_percent(&self, index: usize) -> Result<u32>;
    fn power_usage(&self, index: usize) -> Result<u32>;
    fn performance_state(&self, index: usize) -> Result<u32>;
    fn bus_id(&self, index: usize) -> Result<u32>;
    fn pci_ids(&self, index: usize) -> Result<(u16, u16)>;
    fn serial(&self, index: usize) -> Result<SerialNumber>;
    fn bios_version(&self, index: usize) -> Result<String>;
    fn name(&self, index: usize) -> Result<String>;
    fn clock_report(&self, index: usize) -> Result<ClockReport>;

    fn set_application_clocks(
        &mut self,
        index: usize,
        mem: Option<u32>,
        gpu: Option<u32>,
    ) -> Result<Outcome>;
    fn reset_application_clocks(&mut self, index: usize) -> Result<Outcome>;
    fn set_pstate_clocks(
        &mut self,
        index: usize,
        pstate: Option<u8>,
        mem: Option<u32>,
        gpu: Option<u32>,
    ) -> Result<Outcome>;
    fn set_power_limit(&mut self, index: usize, watts: u32) -> Result<Outcome>;
    fn reset_power_limit(&mut self, index: usize) -> Result<Outcome>;

    // Undo every outstanding change, returns the number of devices touched
    fn restore_all(&mut self) -> usize;

    fn vendor_name(&self, index: usize) -> Result<&'static str> {
        self.pci_ids(index)
            .map(|(vendor_id, _)| vendor::vendor_name(vendor_id))
    }

    // Collect every reading available for one device. Only an unmapped
    // device is an error, anything else just leaves a field empty.
    fn descriptor(&self, index: usize) -> Result<DeviceDescriptor> {
        let name = optional(self.name(index))?;
        let pci_ids = optional(self.pci_ids(index))?;

        Ok(DeviceDescriptor {
            index,
            name,
            bus_id: optional(self.bus_id(index))?,
            pci_ids,
            vendor: pci_ids
                .map(|(vendor_id, _)| vendor::vendor_name(vendor_id))
                .unwrap_or(""),
            serial: optional(self.serial(index))?,
            bios_version: optional(self.bios_version(index))?,
            clocks: optional(self.clock_report(index))?,
        })
    }
}

fn optional<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err @ GpuError::DeviceUnmapped { .. }) => Err(err),
        Err(err) => {
            if !err.is_unsupported() {
                debug!("{err}");
            }
            Ok(None)
        }
    }
}

impl GpuBackend for ManagementHandle {
    fn kind(&self) -> BackendKind {
        BackendKind::Nvml
    }

    fn device_count(&self) -> usize {
        self.runtime_count()
    }

    fn driver_version(&self) -> Option<String> {
        ManagementHandle::driver_version(self).map(str::to_string)
    }

    fn temperature(&self, index: usize) -> Result<u32> {
        ManagementHandle::temperature(self, index)
    }

    fn fan_percent(&self, index: usize) -> Result<u32> {
        ManagementHandle::fan_percent(self, index)
    }

    fn power_usage(&self, index: usize) -> Result<u32> {
        ManagementHandle::power_usage(self, index)
    }

    fn performance_state(&self, index: usize) -> Result<u32> {
        ManagementHandle::performance_state(self, index)
    }

    fn bus_id(&self, index: usize) -> Result<u32> {
        ManagementHandle::bus_id(self, index)
    }

    fn pci_ids(&self, index: usize) -> Result<(u16, u16)> {
        ManagementHandle::pci_ids(self, index)
    }

    fn serial(&self, index: usize) -> Result<SerialNumber> {
        ManagementHandle::serial(self, index)
    }

    fn bios_version(&self, index: usize) -> Result<String> {
        ManagementHandle::bios_version(self, index)
    }

    fn name(&self, index: usize) -> Result<String> {
        ManagementHandle::name(self, index)
    }

    fn clock_report(&self, index: usize) -> Result<ClockReport> {
        ManagementHandle::clock_report(self, index)
    }

    fn set_application_clocks(
        &mut self,
        index: usize,
        mem: Option<u32>,
        gpu: Option<u32>,
    ) -> Result<Outcome> {
        ManagementHandle::set_application_clocks(self, index, mem, gpu)
    }

    fn reset_application_clocks(&mut self, index: usize) -> Result<Outcome> {
        ManagementHandle::reset_application_clocks(self, index)
    }

    fn set_pstate_clocks(
        &mut self,
        index: usize,
        pstate: Option<u8>,
        mem: Option<u32>,
        gpu: Option<u32>,
    ) -> Result<Outcome> {
        ManagementHandle::set_pstate_clocks(self, index, pstate, mem, gpu)
    }

    fn set_power_limit(&mut self, index: usize, watts: u32) -> Result<Outcome> {
        ManagementHandle::set_power_limit(self, index, watts)
    }

    fn reset_power_limit(&mut self, index: usize) -> Result<Outcome> {
        ManagementHandle::reset_power_limit(self, index)
    }

    fn restore_all(&mut self) -> usize {
        ManagementHandle::restore_all(self)
    }

    fn vendor_name(&self, index: usize) -> Result<&'static str> {
        ManagementHandle::vendor_name(self, index)
    }
}

// Pick the first provider that works, NVML then nvidia-smi
pub fn select_backend(runtime: &dyn ComputeRuntime) -> AnyResult<Box<dyn GpuBackend>> {
    match open_nvml(runtime) {
        Ok(handle) => {
            info!("Using NVML backend");
            return Ok(Box::new(handle));
        }
        Err(err) => warn!("NVML unavailable: {err:#}"),
    }

    match SmiBackend::open(runtime) {
        Ok(backend) => {
            info!("Using nvidia-smi backend");
            Ok(Box::new(backend))
        }
        Err(err) => {
            warn!("nvidia-smi unavailable: {err:#}");
            bail!("No usable GPU management backend found")
        }
    }
}

fn open_nvml(runtime: &dyn ComputeRuntime) -> AnyResult<ManagementHandle> {
    let library = NvmlLibrary::open()
        .map_err(|status| anyhow::anyhow!("{status}"))
        .context("Failed to load the NVML library")?;

    ManagementHandle::build(Box::new(library), runtime)
        .context("Failed to build the NVML device tables")
}
