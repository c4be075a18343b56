use std::fmt;

use tracing::{debug, warn};

use crate::{
    capability::Capability,
    errors::{GpuError, Result},
    identity::ManagementHandle,
    native::{ClockId, ClockType, DeviceHandle, ManagementLibrary, NativeResult},
    vendor,
};

const UUID_PREFIX: &str = "GPU-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialNumber {
    Reported(String),
    // Boards without a serial get the UUID minus its four character
    // type tag ("GPU-", "MIG-"). Unique per board, but not a real serial.
    DerivedFromUuid(String),
}

impl SerialNumber {
    pub fn from_uuid(uuid: &str) -> Self {
        let serial = uuid.get(UUID_PREFIX.len()..).unwrap_or("");
        SerialNumber::DerivedFromUuid(serial.to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            SerialNumber::Reported(serial) | SerialNumber::DerivedFromUuid(serial) => serial,
        }
    }

    pub fn is_derived(&self) -> bool {
        matches!(self, SerialNumber::DerivedFromUuid(_))
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// (vendor, device) pair of the board. The subsystem id identifies the
// board partner, the plain device id is used when it is not reported.
pub fn split_pci_ids(pci_device_id: u32, pci_subsystem_id: u32) -> (u16, u16) {
    let id = if pci_subsystem_id != 0 {
        pci_subsystem_id
    } else {
        pci_device_id
    };

    ((id & 0xFFFF) as u16, (id >> 16) as u16)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockPair {
    pub mem: Option<u32>,
    pub gpu: Option<u32>,
}

impl fmt::Display for ClockPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |clock: Option<u32>| clock.map_or("-".to_string(), |c| c.to_string());
        write!(f, "{}/{}", show(self.mem), show(self.gpu))
    }
}

// Application clocks of a device, in MHz
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockReport {
    pub default: ClockPair,
    pub target: ClockPair,
    pub current: ClockPair,
}

// Everything known about a device, as shown by the listing mode.
// Fields the driver cannot report are left empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub index: usize,
    pub name: Option<String>,
    pub bus_id: Option<u32>,
    pub pci_ids: Option<(u16, u16)>,
    pub vendor: &'static str,
    pub serial: Option<SerialNumber>,
    pub bios_version: Option<String>,
    pub clocks: Option<ClockReport>,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GPU #{}: {}",
            self.index,
            self.name.as_deref().unwrap_or("unknown")
        )?;

        if let Some(bus) = self.bus_id {
            write!(f, ", bus {bus}")?;
        }
        if let Some((vendor_id, device_id)) = self.pci_ids {
            write!(f, ", id {vendor_id:04x}:{device_id:04x}")?;
        }
        if !self.vendor.is_empty() {
            write!(f, " ({})", self.vendor)?;
        }
        if let Some(serial) = &self.serial {
            let note = if serial.is_derived() { " (from UUID)" } else { "" };
            write!(f, ", serial {serial}{note}")?;
        }
        if let Some(bios) = &self.bios_version {
            write!(f, ", bios {bios}")?;
        }
        if let Some(clocks) = &self.clocks {
            write!(
                f,
                ", clocks default {} target {} current {}",
                clocks.default, clocks.target, clocks.current
            )?;
        }

        Ok(())
    }
}

// Readings check that the driver exports the function before calling it.
// A missing function is Unsupported, distinct from a call that failed.
impl ManagementHandle {
    // Shared path of the native readings
    fn read<T>(
        &self,
        index: usize,
        capability: Capability,
        what: &'static str,
        call: impl FnOnce(&dyn ManagementLibrary, DeviceHandle) -> NativeResult<T>,
    ) -> Result<T> {
        let (_, handle) = self.resolve(index)?;

        if !self.lib.capabilities().has(capability) {
            debug!("GPU #{index}: {what} is not exported by the driver");
            return Err(GpuError::Unsupported { index, what });
        }

        call(self.lib.as_ref(), handle).map_err(|status| {
            if status.is_unsupported() {
                debug!("GPU #{index}: {what} is not supported");
                return GpuError::Unsupported { index, what };
            }

            let message = self.describe(&status);
            warn!("GPU #{index}: failed to read {what}: {message}");

            GpuError::ReadFailed {
                index,
                what,
                message,
            }
        })
    }

    // Core temperature in degrees Celsius
    pub fn temperature(&self, index: usize) -> Result<u32> {
        self.read(index, Capability::Temperature, "temperature", |lib, dev| {
            lib.temperature(dev)
        })
    }

    pub fn fan_percent(&self, index: usize) -> Result<u32> {
        self.read(index, Capability::FanSpeed, "fan speed", |lib, dev| {
            lib.fan_speed(dev)
        })
    }

    // Board power draw in milliwatts
    pub fn power_usage(&self, index: usize) -> Result<u32> {
        self.read(index, Capability::PowerUsage, "power usage", |lib, dev| {
            lib.power_usage(dev)
        })
    }

    pub fn performance_state(&self, index: usize) -> Result<u32> {
        self.read(
            index,
            Capability::PerformanceState,
            "performance state",
            |lib, dev| lib.performance_state(dev),
        )
    }

    // PCI bus number, taken from the tables built at startup
    pub fn bus_id(&self, index: usize) -> Result<u32> {
        let (device, _) = self.resolve(index)?;

        device
            .pci
            .as_ref()
            .map(|pci| pci.bus)
            .or_else(|| self.runtime_bus_id(index))
            .ok_or(GpuError::ReadFailed {
                index,
                what: "bus id",
                message: "PCI information unavailable".to_string(),
            })
    }

    pub fn pci_ids(&self, index: usize) -> Result<(u16, u16)> {
        let (device, _) = self.resolve(index)?;

        device
            .pci
            .as_ref()
            .map(|pci| split_pci_ids(pci.pci_device_id, pci.pci_subsystem_id))
            .ok_or(GpuError::ReadFailed {
                index,
                what: "pci ids",
                message: "PCI information unavailable".to_string(),
            })
    }

    // Board serial, or a substitute derived from the UUID when the
    // board does not report one
    pub fn serial(&self, index: usize) -> Result<SerialNumber> {
        let reported = self.read(index, Capability::Serial, "serial", |lib, dev| {
            lib.serial(dev)
        });

        match reported {
            Ok(serial) if !serial.is_empty() => return Ok(SerialNumber::Reported(serial)),
            Err(err @ GpuError::DeviceUnmapped { .. }) => return Err(err),
            _ => {}
        }

        self.read(index, Capability::Uuid, "serial", |lib, dev| lib.uuid(dev))
            .map(|uuid| SerialNumber::from_uuid(&uuid))
    }

    pub fn bios_version(&self, index: usize) -> Result<String> {
        self.read(index, Capability::VbiosVersion, "bios version", |lib, dev| {
            lib.vbios_version(dev)
        })
    }

    pub fn name(&self, index: usize) -> Result<String> {
        self.read(index, Capability::DeviceName, "name", |lib, dev| {
            lib.name(dev)
        })
    }

    // Default, target and current application clocks. Individual
    // values the driver refuses to report are left empty.
    pub fn clock_report(&self, index: usize) -> Result<ClockReport> {
        let pair = |id: ClockId| -> Result<ClockPair> {
            let read = |clock: ClockType| {
                self.read(index, Capability::Clock, "clocks", |lib, dev| {
                    lib.clock(dev, clock, id)
                })
            };

            let mem = read(ClockType::Memory);
            if let Err(err @ (GpuError::DeviceUnmapped { .. } | GpuError::Unsupported { .. })) =
                &mem
            {
                return Err(err.clone());
            }

            Ok(ClockPair {
                mem: mem.ok(),
                gpu: read(ClockType::Graphics).ok(),
            })
        };

        Ok(ClockReport {
            default: pair(ClockId::AppClockDefault)?,
            target: pair(ClockId::AppClockTarget)?,
            current: pair(ClockId::Current)?,
        })
    }

    pub fn vendor_name(&self, index: usize) -> Result<&'static str> {
        self.pci_ids(index)
            .map(|(vendor_id, _)| vendor::vendor_name(vendor_id))
    }

    // Board vendor of the device sitting on the given PCI bus.
    // Looks at every management device, mapped or not.
    pub fn vendor_for_bus(&self, bus: u32) -> Option<&'static str> {
        self.devices()
            .iter()
            .filter_map(|device| device.pci.as_ref())
            .find(|pci| pci.bus == bus)
            .map(|pci| {
                let (vendor_id, _) = split_pci_ids(pci.pci_device_id, pci.pci_subsystem_id);
                vendor::vendor_name(vendor_id)
            })
    }
}
