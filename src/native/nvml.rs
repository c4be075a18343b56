use libloading::Library;
use nvml_wrapper::{
    Device, Nvml,
    enum_wrappers::device::{
        Api, Clock, ClockId as NvmlClockId, PerformanceState, TemperatureSensor,
    },
    error::NvmlError,
};
use tracing::{debug, trace};

use crate::{
    capability::CapabilityTable,
    native::{
        ClockId, ClockType, DeviceHandle, EnableState, ManagementLibrary,
        NativeResult, NativeStatus, PciInfo, PowerConstraints, RestrictedApi,
    },
};

#[cfg(windows)]
const LIBRARY_NAMES: [&str; 1] = ["nvml.dll"];
#[cfg(not(windows))]
const LIBRARY_NAMES: [&str; 2] = ["libnvidia-ml.so.1", "libnvidia-ml.so"];

// NVML backed management library.
// Symbol availability is probed once with libloading, the session
// itself is driven through nvml-wrapper.
pub struct NvmlLibrary {
    capabilities: CapabilityTable,

    // Present between init() and shutdown()
    nvml: Option<Nvml>,
}

impl NvmlLibrary {
    // Locate the shared library and record which functions it exports.
    // This does not start a session, see `init`.
    pub fn open() -> NativeResult<Self> {
        let capabilities = probe_symbols().ok_or_else(|| {
            NativeStatus::Other("NVML shared library not found".to_string())
        })?;

        debug!("NVML exports {} known functions", capabilities.len());

        Ok(Self {
            capabilities,
            nvml: None,
        })
    }

    fn nvml(&self) -> NativeResult<&Nvml> {
        self.nvml.as_ref().ok_or(NativeStatus::Uninitialized)
    }

    fn device(&self, handle: DeviceHandle) -> NativeResult<Device<'_>> {
        let index = u32::try_from(handle.raw())
            .map_err(|_| NativeStatus::InvalidArgument)?;

        self.nvml()?.device_by_index(index).map_err(to_status)
    }
}

// Try every known library name and probe all capability symbols.
// The library is only kept open for the duration of the probe.
fn probe_symbols() -> Option<CapabilityTable> {
    let library = LIBRARY_NAMES.iter().find_map(|name| {
        // SAFETY: loading NVML runs no initialization code beyond
        // the dynamic linker's own
        match unsafe { Library::new(name) } {
            Ok(library) => Some(library),
            Err(err) => {
                trace!("Failed to load {name}: {err}");
                None
            }
        }
    })?;

    let table = CapabilityTable::probe(|symbol| {
        // SAFETY: the symbol is only looked up, never called
        unsafe { library.get::<unsafe extern "C" fn()>(symbol.as_bytes()) }
            .is_ok()
    });

    Some(table)
}

fn to_status(err: NvmlError) -> NativeStatus {
    match err {
        NvmlError::Uninitialized => NativeStatus::Uninitialized,
        NvmlError::InvalidArg => NativeStatus::InvalidArgument,
        NvmlError::NotSupported => NativeStatus::NotSupported,
        NvmlError::NoPermission => NativeStatus::NoPermission,
        NvmlError::NotFound => NativeStatus::NotFound,
        NvmlError::InsufficientSize(_) => NativeStatus::InsufficientSize,
        NvmlError::GpuLost => NativeStatus::GpuLost,
        NvmlError::FunctionNotFound | NvmlError::FailedToLoadSymbol(_) => {
            NativeStatus::FunctionNotFound
        }
        other => NativeStatus::Other(other.to_string()),
    }
}

fn to_clock(clock: ClockType) -> Clock {
    match clock {
        ClockType::Graphics => Clock::Graphics,
        ClockType::Memory => Clock::Memory,
    }
}

fn to_clock_id(id: ClockId) -> NvmlClockId {
    match id {
        ClockId::Current => NvmlClockId::Current,
        ClockId::AppClockTarget => NvmlClockId::TargetAppClock,
        ClockId::AppClockDefault => NvmlClockId::DefaultAppClock,
    }
}

fn to_api(api: RestrictedApi) -> Api {
    match api {
        RestrictedApi::ApplicationClocks => Api::ApplicationClocks,
    }
}

fn pstate_ordinal(state: PerformanceState) -> NativeResult<u32> {
    let ordinal = match state {
        PerformanceState::Zero => 0,
        PerformanceState::One => 1,
        PerformanceState::Two => 2,
        PerformanceState::Three => 3,
        PerformanceState::Four => 4,
        PerformanceState::Five => 5,
        PerformanceState::Six => 6,
        PerformanceState::Seven => 7,
        PerformanceState::Eight => 8,
        PerformanceState::Nine => 9,
        PerformanceState::Ten => 10,
        PerformanceState::Eleven => 11,
        PerformanceState::Twelve => 12,
        PerformanceState::Thirteen => 13,
        PerformanceState::Fourteen => 14,
        PerformanceState::Fifteen => 15,
        PerformanceState::Unknown => return Err(NativeStatus::NotSupported),
    };

    Ok(ordinal)
}

impl ManagementLibrary for NvmlLibrary {
    fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    fn init(&mut self) -> NativeResult<()> {
        if self.nvml.is_none() {
            self.nvml = Some(Nvml::init().map_err(to_status)?);
        }

        Ok(())
    }

    fn shutdown(&mut self) -> NativeResult<()> {
        match self.nvml.take() {
            Some(nvml) => nvml.shutdown().map_err(to_status),
            None => Ok(()),
        }
    }

    fn error_string(&self, status: &NativeStatus) -> String {
        status.to_string()
    }

    fn driver_version(&self) -> NativeResult<String> {
        self.nvml()?.sys_driver_version().map_err(to_status)
    }

    fn device_count(&self) -> NativeResult<u32> {
        self.nvml()?.device_count().map_err(to_status)
    }

    fn device_handle(&self, index: u32) -> NativeResult<DeviceHandle> {
        // Validate the index now, the device is fetched again per call
        self.nvml()?.device_by_index(index).map_err(to_status)?;

        Ok(DeviceHandle::from_raw(index.into()))
    }

    fn pci_info(&self, device: DeviceHandle) -> NativeResult<PciInfo> {
        let info = self.device(device)?.pci_info().map_err(to_status)?;

        Ok(PciInfo {
            domain: info.domain,
            bus: info.bus,
            device: info.device,
            pci_device_id: info.pci_device_id,
            pci_subsystem_id: info.pci_sub_system_id.unwrap_or(0),
            bus_id: info.bus_id,
        })
    }

    fn name(&self, device: DeviceHandle) -> NativeResult<String> {
        self.device(device)?.name().map_err(to_status)
    }

    fn api_restriction(
        &self,
        device: DeviceHandle,
        api: RestrictedApi,
    ) -> NativeResult<EnableState> {
        let restricted = self
            .device(device)?
            .is_api_restricted(to_api(api))
            .map_err(to_status)?;

        Ok(if restricted {
            EnableState::Enabled
        } else {
            EnableState::Disabled
        })
    }

    fn set_api_restriction(
        &mut self,
        device: DeviceHandle,
        api: RestrictedApi,
        state: EnableState,
    ) -> NativeResult<()> {
        let restricted = match state {
            EnableState::Enabled => true,
            EnableState::Disabled => false,
            EnableState::Unknown => return Err(NativeStatus::InvalidArgument),
        };

        self.device(device)?
            .set_api_restricted(to_api(api), restricted)
            .map_err(to_status)
    }

    fn applications_clock(
        &self,
        device: DeviceHandle,
        clock: ClockType,
    ) -> NativeResult<u32> {
        self.device(device)?
            .applications_clock(to_clock(clock))
            .map_err(to_status)
    }

    fn default_applications_clock(
        &self,
        device: DeviceHandle,
        clock: ClockType,
    ) -> NativeResult<u32> {
        self.device(device)?
            .default_applications_clock(to_clock(clock))
            .map_err(to_status)
    }

    fn set_applications_clocks(
        &mut self,
        device: DeviceHandle,
        mem: u32,
        graphics: u32,
    ) -> NativeResult<()> {
        self.device(device)?
            .set_applications_clocks(mem, graphics)
            .map_err(to_status)
    }

    fn reset_applications_clocks(
        &mut self,
        device: DeviceHandle,
    ) -> NativeResult<()> {
        self.device(device)?
            .reset_applications_clocks()
            .map_err(to_status)
    }

    fn supported_memory_clocks(
        &self,
        device: DeviceHandle,
    ) -> NativeResult<Vec<u32>> {
        self.device(device)?
            .supported_memory_clocks()
            .map_err(to_status)
    }

    fn supported_graphics_clocks(
        &self,
        device: DeviceHandle,
        mem: u32,
    ) -> NativeResult<Vec<u32>> {
        self.device(device)?
            .supported_graphics_clocks(mem)
            .map_err(to_status)
    }

    fn clock(
        &self,
        device: DeviceHandle,
        clock: ClockType,
        id: ClockId,
    ) -> NativeResult<u32> {
        self.device(device)?
            .clock(to_clock(clock), to_clock_id(id))
            .map_err(to_status)
    }

    fn power_limit_constraints(
        &self,
        device: DeviceHandle,
    ) -> NativeResult<PowerConstraints> {
        let constraints = self
            .device(device)?
            .power_management_limit_constraints()
            .map_err(to_status)?;

        Ok(PowerConstraints {
            min: constraints.min_limit,
            max: constraints.max_limit,
        })
    }

    fn power_limit(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.device(device)?
            .power_management_limit()
            .map_err(to_status)
    }

    fn default_power_limit(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.device(device)?
            .power_management_limit_default()
            .map_err(to_status)
    }

    fn set_power_limit(
        &mut self,
        device: DeviceHandle,
        limit: u32,
    ) -> NativeResult<()> {
        self.device(device)?
            .set_power_management_limit(limit)
            .map_err(to_status)
    }

    fn power_usage(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.device(device)?.power_usage().map_err(to_status)
    }

    fn temperature(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.device(device)?
            .temperature(TemperatureSensor::Gpu)
            .map_err(to_status)
    }

    fn fan_speed(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.device(device)?.fan_speed(0).map_err(to_status)
    }

    fn performance_state(&self, device: DeviceHandle) -> NativeResult<u32> {
        let state = self
            .device(device)?
            .performance_state()
            .map_err(to_status)?;

        pstate_ordinal(state)
    }

    fn serial(&self, device: DeviceHandle) -> NativeResult<String> {
        self.device(device)?.serial().map_err(to_status)
    }

    fn uuid(&self, device: DeviceHandle) -> NativeResult<String> {
        self.device(device)?.uuid().map_err(to_status)
    }

    fn vbios_version(&self, device: DeviceHandle) -> NativeResult<String> {
        self.device(device)?.vbios_version().map_err(to_status)
    }
}
