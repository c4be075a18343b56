use std::fmt;

use crate::capability::CapabilityTable;

pub mod cuda;
pub mod nvml;

#[cfg(test)]
pub mod fake;

pub type NativeResult<T> = Result<T, NativeStatus>;

// Non-success status returned by a native call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeStatus {
    Uninitialized,
    InvalidArgument,
    NotSupported,
    NoPermission,
    NotFound,
    InsufficientSize,
    GpuLost,
    // The symbol could not be resolved in the loaded library
    FunctionNotFound,
    Other(String),
}

impl NativeStatus {
    // True when the failure means "this driver cannot do it"
    // rather than "the call went wrong"
    pub fn is_unsupported(&self) -> bool {
        matches!(self, NativeStatus::NotSupported | NativeStatus::FunctionNotFound)
    }
}

impl fmt::Display for NativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeStatus::Uninitialized => write!(f, "Uninitialized"),
            NativeStatus::InvalidArgument => write!(f, "Invalid Argument"),
            NativeStatus::NotSupported => write!(f, "Not Supported"),
            NativeStatus::NoPermission => write!(f, "Insufficient Permissions"),
            NativeStatus::NotFound => write!(f, "Not Found"),
            NativeStatus::InsufficientSize => write!(f, "Insufficient Size"),
            NativeStatus::GpuLost => write!(f, "GPU is lost"),
            NativeStatus::FunctionNotFound => write!(f, "Function Not Found"),
            NativeStatus::Other(message) => write!(f, "{message}"),
        }
    }
}

// Opaque per-device reference handed out by the management library.
// Only meaningful to the library that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

// PCI location and identifiers as reported by the management library
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PciInfo {
    pub domain: u32,
    pub bus: u32,
    pub device: u32,
    // Combined device/vendor id (device in the upper 16 bits)
    pub pci_device_id: u32,
    // Combined subsystem/subvendor id, 0 when not reported
    pub pci_subsystem_id: u32,
    // Textual form, e.g. "00000000:01:00.0"
    pub bus_id: String,
}

// Tri-state permission flag for a restricted API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnableState {
    Enabled,
    Disabled,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictedApi {
    ApplicationClocks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockType {
    Graphics,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockId {
    Current,
    AppClockTarget,
    AppClockDefault,
}

// Hardware power limit bounds, in milliwatts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerConstraints {
    pub min: u32,
    pub max: u32,
}

// The hardware management API (NVML) as seen by the core. Nothing is
// loaded or resolved outside the provider. Every call may fail with a native status. Callers must check
// `capabilities()` before invoking anything outside the required set.
pub trait ManagementLibrary: Send {
    fn capabilities(&self) -> &CapabilityTable;

    fn init(&mut self) -> NativeResult<()>;
    fn shutdown(&mut self) -> NativeResult<()>;
    fn error_string(&self, status: &NativeStatus) -> String;

    fn driver_version(&self) -> NativeResult<String>;
    fn device_count(&self) -> NativeResult<u32>;
    fn device_handle(&self, index: u32) -> NativeResult<DeviceHandle>;

    fn pci_info(&self, device: DeviceHandle) -> NativeResult<PciInfo>;
    fn name(&self, device: DeviceHandle) -> NativeResult<String>;

    fn api_restriction(
        &self,
        device: DeviceHandle,
        api: RestrictedApi,
    ) -> NativeResult<EnableState>;
    fn set_api_restriction(
        &mut self,
        device: DeviceHandle,
        api: RestrictedApi,
        state: EnableState,
    ) -> NativeResult<()>;

    // Application clocks, all values in MHz
    fn applications_clock(
        &self,
        device: DeviceHandle,
        clock: ClockType,
    ) -> NativeResult<u32>;
    fn default_applications_clock(
        &self,
        device: DeviceHandle,
        clock: ClockType,
    ) -> NativeResult<u32>;
    fn set_applications_clocks(
        &mut self,
        device: DeviceHandle,
        mem: u32,
        graphics: u32,
    ) -> NativeResult<()>;
    fn reset_applications_clocks(&mut self, device: DeviceHandle)
    -> NativeResult<()>;
    // Both tables are ordered from the highest frequency to the lowest
    fn supported_memory_clocks(
        &self,
        device: DeviceHandle,
    ) -> NativeResult<Vec<u32>>;
    fn supported_graphics_clocks(
        &self,
        device: DeviceHandle,
        mem: u32,
    ) -> NativeResult<Vec<u32>>;
    fn clock(
        &self,
        device: DeviceHandle,
        clock: ClockType,
        id: ClockId,
    ) -> NativeResult<u32>;

    // Power management, all values in milliwatts
    fn power_limit_constraints(
        &self,
        device: DeviceHandle,
    ) -> NativeResult<PowerConstraints>;
    fn power_limit(&self, device: DeviceHandle) -> NativeResult<u32>;
    fn default_power_limit(&self, device: DeviceHandle) -> NativeResult<u32>;
    fn set_power_limit(
        &mut self,
        device: DeviceHandle,
        limit: u32,
    ) -> NativeResult<()>;
    fn power_usage(&self, device: DeviceHandle) -> NativeResult<u32>;

    fn temperature(&self, device: DeviceHandle) -> NativeResult<u32>;
    fn fan_speed(&self, device: DeviceHandle) -> NativeResult<u32>;
    fn performance_state(&self, device: DeviceHandle) -> NativeResult<u32>;

    fn serial(&self, device: DeviceHandle) -> NativeResult<String>;
    fn uuid(&self, device: DeviceHandle) -> NativeResult<String>;
    fn vbios_version(&self, device: DeviceHandle) -> NativeResult<String>;
}

// PCI location of a device as reported by the compute runtime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeDeviceProps {
    pub name: String,
    pub pci_domain_id: u32,
    pub pci_bus_id: u32,
    pub pci_device_id: u32,
}

// The compute runtime (CUDA). Its enumeration order is the one
// every caller of this crate uses to name devices.
pub trait ComputeRuntime {
    fn device_count(&self) -> NativeResult<u32>;
    fn device_properties(&self, index: u32) -> NativeResult<RuntimeDeviceProps>;
}
