// In-memory management library and compute runtime used by the unit
// tests. Every mutating native call is recorded in a shared log.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{
    capability::CapabilityTable,
    native::{
        ClockId, ClockType, ComputeRuntime, DeviceHandle, EnableState,
        ManagementLibrary, NativeResult, NativeStatus, PciInfo,
        PowerConstraints, RestrictedApi, RuntimeDeviceProps,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Init,
    Shutdown,
    SetApiRestriction { device: u64 },
    SetApplicationsClocks { device: u64, mem: u32, graphics: u32 },
    ResetApplicationsClocks { device: u64 },
    SetPowerLimit { device: u64, limit: u32 },
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub pci: PciInfo,
    pub name: String,

    pub restriction: NativeResult<EnableState>,

    pub app_mem: NativeResult<u32>,
    pub app_gpu: NativeResult<u32>,
    pub default_mem: NativeResult<u32>,
    pub default_gpu: NativeResult<u32>,
    pub memory_clocks: NativeResult<Vec<u32>>,
    pub graphics_clocks: HashMap<u32, Vec<u32>>,
    pub set_clocks_result: NativeResult<()>,
    pub reset_clocks_result: NativeResult<()>,

    pub power_limit: NativeResult<u32>,
    pub constraints: NativeResult<PowerConstraints>,
    pub default_power_limit: NativeResult<u32>,
    pub set_power_result: NativeResult<()>,
    pub power_usage: NativeResult<u32>,

    pub temperature: NativeResult<u32>,
    pub fan_speed: NativeResult<u32>,
    pub pstate: NativeResult<u32>,
    pub serial: NativeResult<String>,
    pub uuid: NativeResult<String>,
    pub vbios: NativeResult<String>,
}

impl FakeDevice {
    pub fn at(domain: u32, bus: u32, device: u32) -> Self {
        Self {
            pci: PciInfo {
                domain,
                bus,
                device,
                pci_device_id: 0x1b8110de,
                pci_subsystem_id: 0x36133842,
                bus_id: format!("{domain:08X}:{bus:02X}:{device:02X}.0"),
            },
            name: format!("Fake GPU {bus}"),
            restriction: Ok(EnableState::Enabled),
            app_mem: Ok(3505),
            app_gpu: Ok(1506),
            default_mem: Ok(3505),
            default_gpu: Ok(1506),
            memory_clocks: Ok(vec![3505, 3304, 810, 405]),
            graphics_clocks: HashMap::from([
                (3505, vec![1911, 1506, 1240, 1000]),
                (3304, vec![1506, 1240, 1000]),
                (810, vec![1000, 800, 540]),
                (405, vec![405]),
            ]),
            set_clocks_result: Ok(()),
            reset_clocks_result: Ok(()),
            power_limit: Ok(180_000),
            constraints: Ok(PowerConstraints {
                min: 90_000,
                max: 217_000,
            }),
            default_power_limit: Ok(180_000),
            set_power_result: Ok(()),
            power_usage: Ok(95_250),
            temperature: Ok(61),
            fan_speed: Ok(42),
            pstate: Ok(2),
            serial: Ok("0323617023456".to_string()),
            uuid: Ok("GPU-f2bd642c-369f-5a14-e0b4-0d22dfe9a1fc".to_string()),
            vbios: Ok("86.04.50.00.70".to_string()),
        }
    }
}

pub struct FakeLibrary {
    pub capabilities: CapabilityTable,
    pub devices: Vec<FakeDevice>,
    pub init_result: NativeResult<()>,
    pub count_result: Option<NativeResult<u32>>,
    pub failing_handles: Vec<u32>,
    pub log: CallLog,
}

impl FakeLibrary {
    pub fn new(devices: Vec<FakeDevice>) -> Self {
        Self {
            capabilities: CapabilityTable::all(),
            devices,
            init_result: Ok(()),
            count_result: None,
            failing_handles: Vec::new(),
            log: CallLog::default(),
        }
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    fn record(&self, call: Call) {
        self.log.lock().unwrap().push(call);
    }

    fn dev(&self, handle: DeviceHandle) -> NativeResult<&FakeDevice> {
        self.devices
            .get(handle.raw() as usize)
            .ok_or(NativeStatus::InvalidArgument)
    }

    fn dev_mut(&mut self, handle: DeviceHandle) -> NativeResult<&mut FakeDevice> {
        self.devices
            .get_mut(handle.raw() as usize)
            .ok_or(NativeStatus::InvalidArgument)
    }
}

impl ManagementLibrary for FakeLibrary {
    fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    fn init(&mut self) -> NativeResult<()> {
        self.record(Call::Init);
        self.init_result.clone()
    }

    fn shutdown(&mut self) -> NativeResult<()> {
        self.record(Call::Shutdown);
        Ok(())
    }

    fn error_string(&self, status: &NativeStatus) -> String {
        status.to_string()
    }

    fn driver_version(&self) -> NativeResult<String> {
        Ok("550.54.14".to_string())
    }

    fn device_count(&self) -> NativeResult<u32> {
        self.count_result
            .clone()
            .unwrap_or(Ok(self.devices.len() as u32))
    }

    fn device_handle(&self, index: u32) -> NativeResult<DeviceHandle> {
        if self.failing_handles.contains(&index) {
            return Err(NativeStatus::GpuLost);
        }
        Ok(DeviceHandle::from_raw(index.into()))
    }

    fn pci_info(&self, device: DeviceHandle) -> NativeResult<PciInfo> {
        Ok(self.dev(device)?.pci.clone())
    }

    fn name(&self, device: DeviceHandle) -> NativeResult<String> {
        Ok(self.dev(device)?.name.clone())
    }

    fn api_restriction(
        &self,
        device: DeviceHandle,
        _api: RestrictedApi,
    ) -> NativeResult<EnableState> {
        self.dev(device)?.restriction.clone()
    }

    fn set_api_restriction(
        &mut self,
        device: DeviceHandle,
        _api: RestrictedApi,
        _state: EnableState,
    ) -> NativeResult<()> {
        self.record(Call::SetApiRestriction {
            device: device.raw(),
        });
        Ok(())
    }

    fn applications_clock(
        &self,
        device: DeviceHandle,
        clock: ClockType,
    ) -> NativeResult<u32> {
        let dev = self.dev(device)?;
        match clock {
            ClockType::Memory => dev.app_mem.clone(),
            _ => dev.app_gpu.clone(),
        }
    }

    fn default_applications_clock(
        &self,
        device: DeviceHandle,
        clock: ClockType,
    ) -> NativeResult<u32> {
        let dev = self.dev(device)?;
        match clock {
            ClockType::Memory => dev.default_mem.clone(),
            _ => dev.default_gpu.clone(),
        }
    }

    fn set_applications_clocks(
        &mut self,
        device: DeviceHandle,
        mem: u32,
        graphics: u32,
    ) -> NativeResult<()> {
        self.record(Call::SetApplicationsClocks {
            device: device.raw(),
            mem,
            graphics,
        });
        let dev = self.dev_mut(device)?;
        dev.set_clocks_result.clone()?;
        dev.app_mem = Ok(mem);
        dev.app_gpu = Ok(graphics);
        Ok(())
    }

    fn reset_applications_clocks(
        &mut self,
        device: DeviceHandle,
    ) -> NativeResult<()> {
        self.record(Call::ResetApplicationsClocks {
            device: device.raw(),
        });
        let dev = self.dev_mut(device)?;
        dev.reset_clocks_result.clone()?;
        dev.app_mem = dev.default_mem.clone();
        dev.app_gpu = dev.default_gpu.clone();
        Ok(())
    }

    fn supported_memory_clocks(
        &self,
        device: DeviceHandle,
    ) -> NativeResult<Vec<u32>> {
        self.dev(device)?.memory_clocks.clone()
    }

    fn supported_graphics_clocks(
        &self,
        device: DeviceHandle,
        mem: u32,
    ) -> NativeResult<Vec<u32>> {
        self.dev(device)?
            .graphics_clocks
            .get(&mem)
            .cloned()
            .ok_or(NativeStatus::InvalidArgument)
    }

    fn clock(
        &self,
        device: DeviceHandle,
        clock: ClockType,
        id: ClockId,
    ) -> NativeResult<u32> {
        let dev = self.dev(device)?;
        match (clock, id) {
            (ClockType::Memory, ClockId::AppClockDefault) => {
                dev.default_mem.clone()
            }
            (_, ClockId::AppClockDefault) => dev.default_gpu.clone(),
            (ClockType::Memory, _) => dev.app_mem.clone(),
            _ => dev.app_gpu.clone(),
        }
    }

    fn power_limit_constraints(
        &self,
        device: DeviceHandle,
    ) -> NativeResult<PowerConstraints> {
        self.dev(device)?.constraints.clone()
    }

    fn power_limit(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.dev(device)?.power_limit.clone()
    }

    fn default_power_limit(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.dev(device)?.default_power_limit.clone()
    }

    fn set_power_limit(
        &mut self,
        device: DeviceHandle,
        limit: u32,
    ) -> NativeResult<()> {
        self.record(Call::SetPowerLimit {
            device: device.raw(),
            limit,
        });
        let dev = self.dev_mut(device)?;
        dev.set_power_result.clone()?;
        dev.power_limit = Ok(limit);
        Ok(())
    }

    fn power_usage(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.dev(device)?.power_usage.clone()
    }

    fn temperature(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.dev(device)?.temperature.clone()
    }

    fn fan_speed(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.dev(device)?.fan_speed.clone()
    }

    fn performance_state(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.dev(device)?.pstate.clone()
    }

    fn serial(&self, device: DeviceHandle) -> NativeResult<String> {
        self.dev(device)?.serial.clone()
    }

    fn uuid(&self, device: DeviceHandle) -> NativeResult<String> {
        self.dev(device)?.uuid.clone()
    }

    fn vbios_version(&self, device: DeviceHandle) -> NativeResult<String> {
        self.dev(device)?.vbios.clone()
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    pub devices: Vec<RuntimeDeviceProps>,
    pub count_error: Option<NativeStatus>,
}

impl FakeRuntime {
    // One runtime device per (domain, bus, device) triple
    pub fn with_addresses(addresses: &[(u32, u32, u32)]) -> Self {
        let devices = addresses
            .iter()
            .map(|&(domain, bus, device)| RuntimeDeviceProps {
                name: format!("Fake GPU {bus}"),
                pci_domain_id: domain,
                pci_bus_id: bus,
                pci_device_id: device,
            })
            .collect();

        Self {
            devices,
            count_error: None,
        }
    }
}

impl ComputeRuntime for FakeRuntime {
    fn device_count(&self) -> NativeResult<u32> {
        match &self.count_error {
            Some(status) => Err(status.clone()),
            None => Ok(self.devices.len() as u32),
        }
    }

    fn device_properties(&self, index: u32) -> NativeResult<RuntimeDeviceProps> {
        self.devices
            .get(index as usize)
            .cloned()
            .ok_or(NativeStatus::InvalidArgument)
    }
}
