use tracing::{debug, info, warn};

use crate::{
    capability::Capability,
    errors::{GpuError, Result},
    native::{
        ComputeRuntime, DeviceHandle, EnableState, ManagementLibrary,
        NativeResult, NativeStatus, PciInfo, RestrictedApi,
    },
    operating_point::OperatingState,
};

// (domain, bus, device) triple identifying a physical PCI slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusAddress {
    pub domain: u32,
    pub bus: u32,
    pub device: u32,
}

impl From<&PciInfo> for BusAddress {
    fn from(pci: &PciInfo) -> Self {
        Self {
            domain: pci.domain,
            bus: pci.bus,
            device: pci.device,
        }
    }
}

// Partial bijection between runtime indices and management indices
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrossReference {
    pub runtime_to_mgmt: Vec<Option<usize>>,
    pub mgmt_to_runtime: Vec<Option<usize>>,
}

// Match every runtime device to the first management device at the
// same bus address. Devices whose address is unknown, or that have no
// counterpart, stay unmapped. A management device claimed by an
// earlier runtime index is never handed out twice.
pub fn cross_reference(
    runtime: &[Option<BusAddress>],
    mgmt: &[Option<BusAddress>],
) -> CrossReference {
    let mut xref = CrossReference {
        runtime_to_mgmt: vec![None; runtime.len()],
        mgmt_to_runtime: vec![None; mgmt.len()],
    };

    for (r, address) in runtime.iter().enumerate() {
        let Some(address) = address else {
            continue;
        };

        let found = mgmt.iter().enumerate().position(|(m, candidate)| {
            xref.mgmt_to_runtime[m].is_none() && candidate.as_ref() == Some(address)
        });

        if let Some(m) = found {
            debug!(
                "CUDA GPU {} matches NVML GPU {} by busId {}",
                r, m, address.bus
            );
            xref.runtime_to_mgmt[r] = Some(m);
            xref.mgmt_to_runtime[m] = Some(r);
        }
    }

    xref
}

// Bus address of every runtime device. Devices whose properties
// cannot be read are kept as None so indices stay aligned.
pub fn runtime_addresses(runtime: &dyn ComputeRuntime) -> NativeResult<Vec<Option<BusAddress>>> {
    let count = runtime.device_count()?;

    let addresses = (0..count)
        .map(|index| match runtime.device_properties(index) {
            Ok(props) => Some(BusAddress {
                domain: props.pci_domain_id,
                bus: props.pci_bus_id,
                device: props.pci_device_id,
            }),
            Err(status) => {
                warn!("GPU #{index}: failed to read CUDA device properties: {status}");
                None
            }
        })
        .collect();

    Ok(addresses)
}

// One device as enumerated by the management library
#[derive(Debug, Clone, Default)]
pub struct ManagedDevice {
    // Absent when the library refused to hand out a handle
    pub handle: Option<DeviceHandle>,
    pub pci: Option<PciInfo>,
    // Whether changing application clocks is permitted
    pub app_clocks: EnableState,
}

// Process wide management session plus the identity tables.
// The management library and the compute runtime number devices
// independently, the PCI slot is the only identifier they share.
// Every operation takes a runtime index and goes through these tables.
// Dropping the handle restores every device that was changed
// and then shuts the session down.
pub struct ManagementHandle {
    pub(crate) lib: Box<dyn ManagementLibrary>,
    driver_version: Option<String>,

    devices: Vec<ManagedDevice>,
    // Bus number reported by the runtime, matched or not
    runtime_bus_ids: Vec<Option<u32>>,
    xref: CrossReference,

    // Saved operating points, one per runtime index
    pub(crate) states: Vec<OperatingState>,
    closed: bool,
}

impl ManagementHandle {
    // Start a management session and resolve the identity of every
    // device visible to either enumeration
    pub fn build(
        mut lib: Box<dyn ManagementLibrary>,
        runtime: &dyn ComputeRuntime,
    ) -> Result<Self> {
        let missing = lib.capabilities().missing_required();
        if !missing.is_empty() {
            debug!("Failed to obtain required NVML function pointers");

            // Dropping the library releases whatever it acquired
            return Err(GpuError::CapabilityMissing(missing));
        }

        if let Err(status) = lib.init() {
            return Err(GpuError::SessionInit(lib.error_string(&status)));
        }

        match Self::resolve_devices(lib.as_mut(), runtime) {
            Ok((devices, runtime_bus_ids, xref)) => {
                let driver_version = Self::read_driver_version(lib.as_ref());
                let states = vec![OperatingState::default(); runtime_bus_ids.len()];

                info!(
                    "NVML reports {} GPU(s), CUDA reports {} GPU(s), {} matched",
                    devices.len(),
                    runtime_bus_ids.len(),
                    xref.runtime_to_mgmt.iter().flatten().count()
                );

                Ok(Self {
                    lib,
                    driver_version,
                    devices,
                    runtime_bus_ids,
                    xref,
                    states,
                    closed: false,
                })
            }
            Err(err) => {
                if let Err(status) = lib.shutdown() {
                    warn!("Failed to shut down NVML session: {status}");
                }

                Err(err)
            }
        }
    }

    fn read_driver_version(lib: &dyn ManagementLibrary) -> Option<String> {
        if !lib.capabilities().has(Capability::DriverVersion) {
            return None;
        }

        lib.driver_version()
            .inspect_err(|status| debug!("Failed to read driver version: {status}"))
            .ok()
    }

    fn resolve_devices(
        lib: &mut dyn ManagementLibrary,
        runtime: &dyn ComputeRuntime,
    ) -> Result<(Vec<ManagedDevice>, Vec<Option<u32>>, CrossReference)> {
        let mgmt_count = lib
            .device_count()
            .map_err(|status| GpuError::SessionInit(lib.error_string(&status)))?;

        // The runtime only reports devices usable for compute work,
        // so its count may legitimately differ from the library's
        let runtime_addrs = runtime_addresses(runtime).map_err(|status| {
            debug!("Failed to query CUDA device count!");
            GpuError::RuntimeQueryFailed(status.to_string())
        })?;
        let runtime_bus_ids = runtime_addrs
            .iter()
            .map(|address| address.map(|address| address.bus))
            .collect();

        let devices: Vec<ManagedDevice> = (0..mgmt_count)
            .map(|index| Self::open_device(lib, index))
            .collect();

        let mgmt_addrs: Vec<Option<BusAddress>> = devices
            .iter()
            .map(|device| device.pci.as_ref().map(BusAddress::from))
            .collect();

        let xref = cross_reference(&runtime_addrs, &mgmt_addrs);

        Ok((devices, runtime_bus_ids, xref))
    }

    // Fetch the handle and PCI information of one management device,
    // and try to unlock the application clock API on it
    fn open_device(lib: &mut dyn ManagementLibrary, index: u32) -> ManagedDevice {
        let handle = match lib.device_handle(index) {
            Ok(handle) => handle,
            Err(status) => {
                warn!("NVML GPU {index}: failed to get device handle: {status}");
                return ManagedDevice::default();
            }
        };

        let pci = lib
            .pci_info(handle)
            .inspect_err(|status| {
                warn!("NVML GPU {index}: failed to read PCI info: {status}")
            })
            .ok();

        if lib.capabilities().has(Capability::SetApiRestriction) {
            if let Err(status) = lib.set_api_restriction(
                handle,
                RestrictedApi::ApplicationClocks,
                EnableState::Enabled,
            ) {
                debug!("NVML GPU {index}: failed to set API restriction: {status}");
            }
        }

        let mut app_clocks = EnableState::Unknown;
        if lib.capabilities().has(Capability::GetApiRestriction) {
            match lib.api_restriction(handle, RestrictedApi::ApplicationClocks) {
                Ok(state) => app_clocks = state,
                Err(status) => {
                    debug!("NVML GPU {index}: failed to read API restriction: {status}")
                }
            }
        }

        ManagedDevice {
            handle: Some(handle),
            pci,
            app_clocks,
        }
    }

    pub fn driver_version(&self) -> Option<&str> {
        self.driver_version.as_deref()
    }

    pub fn mgmt_count(&self) -> usize {
        self.devices.len()
    }

    pub fn runtime_count(&self) -> usize {
        self.runtime_bus_ids.len()
    }

    pub fn cross_reference(&self) -> &CrossReference {
        &self.xref
    }

    pub fn mgmt_index(&self, runtime_index: usize) -> Option<usize> {
        self.xref.runtime_to_mgmt.get(runtime_index).copied().flatten()
    }

    pub fn runtime_index(&self, mgmt_index: usize) -> Option<usize> {
        self.xref.mgmt_to_runtime.get(mgmt_index).copied().flatten()
    }

    pub fn device(&self, mgmt_index: usize) -> Option<&ManagedDevice> {
        self.devices.get(mgmt_index)
    }

    pub fn devices(&self) -> &[ManagedDevice] {
        &self.devices
    }

    pub fn runtime_bus_id(&self, runtime_index: usize) -> Option<u32> {
        self.runtime_bus_ids.get(runtime_index).copied().flatten()
    }

    // Translate a runtime index into the management device behind it
    pub(crate) fn resolve(
        &self,
        runtime_index: usize,
    ) -> Result<(&ManagedDevice, DeviceHandle)> {
        self.mgmt_index(runtime_index)
            .and_then(|m| self.devices.get(m))
            .and_then(|device| device.handle.map(|handle| (device, handle)))
            .ok_or(GpuError::DeviceUnmapped {
                index: runtime_index,
            })
    }

    pub(crate) fn describe(&self, status: &NativeStatus) -> String {
        self.lib.error_string(status)
    }

    // Restore every device and release the session.
    // Equivalent to dropping the handle.
    pub fn destroy(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.restore_all();

        if let Err(status) = self.lib.shutdown() {
            warn!("Failed to shut down NVML session: {}", self.describe(&status));
        }
    }
}

impl Drop for ManagementHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capability::CapabilityTable,
        native::fake::{Call, FakeDevice, FakeLibrary, FakeRuntime},
    };

    fn addr(domain: u32, bus: u32, device: u32) -> Option<BusAddress> {
        Some(BusAddress { domain, bus, device })
    }

    fn assert_bijection(xref: &CrossReference) {
        for (m, r) in xref.mgmt_to_runtime.iter().enumerate() {
            if let Some(r) = r {
                assert_eq!(xref.runtime_to_mgmt[*r], Some(m));
            }
        }
        for (r, m) in xref.runtime_to_mgmt.iter().enumerate() {
            if let Some(m) = m {
                assert_eq!(xref.mgmt_to_runtime[*m], Some(r));
            }
        }
    }

    #[test]
    fn matches_by_bus_address_in_any_order() {
        let runtime = [addr(0, 2, 0), addr(0, 1, 0)];
        let mgmt = [addr(0, 1, 0), addr(0, 2, 0)];

        let xref = cross_reference(&runtime, &mgmt);

        assert_eq!(xref.runtime_to_mgmt, vec![Some(1), Some(0)]);
        assert_eq!(xref.mgmt_to_runtime, vec![Some(1), Some(0)]);
        assert_bijection(&xref);
    }

    #[test]
    fn unmatched_devices_stay_unmapped() {
        // Management sees a display only device the runtime ignores
        let runtime = [addr(0, 3, 0)];
        let mgmt = [addr(0, 1, 0), addr(0, 3, 0), None];

        let xref = cross_reference(&runtime, &mgmt);

        assert_eq!(xref.runtime_to_mgmt, vec![Some(1)]);
        assert_eq!(xref.mgmt_to_runtime, vec![None, Some(0), None]);
        assert_bijection(&xref);
    }

    #[test]
    fn all_three_fields_must_match() {
        let runtime = [addr(1, 1, 0), addr(0, 1, 1), addr(0, 1, 0)];
        let mgmt = [addr(0, 1, 0)];

        let xref = cross_reference(&runtime, &mgmt);

        assert_eq!(xref.runtime_to_mgmt, vec![None, None, Some(0)]);
    }

    #[test]
    fn duplicate_addresses_keep_first_match_and_bijection() {
        let runtime = [addr(0, 1, 0), addr(0, 1, 0)];
        let mgmt = [addr(0, 1, 0), addr(0, 1, 0)];

        let xref = cross_reference(&runtime, &mgmt);

        assert_eq!(xref.runtime_to_mgmt, vec![Some(0), Some(1)]);
        assert_bijection(&xref);

        // A single management entry is only ever claimed once
        let xref = cross_reference(&runtime, &mgmt[..1]);
        assert_eq!(xref.runtime_to_mgmt, vec![Some(0), None]);
        assert_bijection(&xref);
    }

    #[test]
    fn build_resolves_devices_and_permissions() {
        let mut second = FakeDevice::at(0, 2, 0);
        second.restriction = Ok(EnableState::Disabled);
        let lib = FakeLibrary::new(vec![FakeDevice::at(0, 1, 0), second]);
        let log = lib.log();
        let runtime = FakeRuntime::with_addresses(&[(0, 2, 0), (0, 1, 0), (0, 9, 0)]);

        let handle = ManagementHandle::build(Box::new(lib), &runtime).unwrap();

        assert_eq!(handle.mgmt_count(), 2);
        assert_eq!(handle.runtime_count(), 3);
        assert_eq!(handle.mgmt_index(0), Some(1));
        assert_eq!(handle.mgmt_index(1), Some(0));
        assert_eq!(handle.mgmt_index(2), None);
        assert_eq!(handle.runtime_index(0), Some(1));
        assert_eq!(handle.runtime_bus_id(2), Some(9));
        assert_eq!(handle.driver_version(), Some("550.54.14"));
        assert_eq!(handle.device(0).unwrap().app_clocks, EnableState::Enabled);
        assert_eq!(handle.device(1).unwrap().app_clocks, EnableState::Disabled);
        assert_bijection(handle.cross_reference());

        let calls = log.lock().unwrap().clone();
        assert_eq!(calls[0], Call::Init);
        assert!(calls.contains(&Call::SetApiRestriction { device: 0 }));
        assert!(calls.contains(&Call::SetApiRestriction { device: 1 }));
    }

    #[test]
    fn restriction_flag_stays_unknown_without_capability() {
        let mut lib = FakeLibrary::new(vec![FakeDevice::at(0, 1, 0)]);
        lib.capabilities.remove(Capability::GetApiRestriction);
        lib.capabilities.remove(Capability::SetApiRestriction);
        let log = lib.log();
        let runtime = FakeRuntime::with_addresses(&[(0, 1, 0)]);

        let handle = ManagementHandle::build(Box::new(lib), &runtime).unwrap();

        assert_eq!(handle.device(0).unwrap().app_clocks, EnableState::Unknown);
        assert!(
            !log.lock()
                .unwrap()
                .iter()
                .any(|call| matches!(call, Call::SetApiRestriction { .. }))
        );
    }

    #[test]
    fn failed_handle_leaves_device_unmapped() {
        let mut lib = FakeLibrary::new(vec![FakeDevice::at(0, 1, 0)]);
        lib.failing_handles.push(0);
        let runtime = FakeRuntime::with_addresses(&[(0, 1, 0)]);

        let handle = ManagementHandle::build(Box::new(lib), &runtime).unwrap();

        assert_eq!(handle.mgmt_index(0), None);
        assert_eq!(
            handle.temperature(0),
            Err(GpuError::DeviceUnmapped { index: 0 })
        );
    }

    #[test]
    fn missing_required_capability_fails_before_init() {
        let mut lib = FakeLibrary::new(vec![FakeDevice::at(0, 1, 0)]);
        lib.capabilities = CapabilityTable::all();
        lib.capabilities.remove(Capability::DeviceName);
        let log = lib.log();
        let runtime = FakeRuntime::with_addresses(&[(0, 1, 0)]);

        let err = ManagementHandle::build(Box::new(lib), &runtime)
            .err()
            .unwrap();

        assert_eq!(err, GpuError::CapabilityMissing(vec![Capability::DeviceName]));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn runtime_count_failure_shuts_session_down() {
        let lib = FakeLibrary::new(vec![FakeDevice::at(0, 1, 0)]);
        let log = lib.log();
        let runtime = FakeRuntime {
            count_error: Some(NativeStatus::Other("no CUDA-capable device".into())),
            ..FakeRuntime::default()
        };

        let err = ManagementHandle::build(Box::new(lib), &runtime)
            .err()
            .unwrap();

        assert!(matches!(err, GpuError::RuntimeQueryFailed(_)));
        assert_eq!(*log.lock().unwrap(), vec![Call::Init, Call::Shutdown]);
    }

    #[test]
    fn count_mismatch_is_not_an_error() {
        let lib = FakeLibrary::new(vec![
            FakeDevice::at(0, 1, 0),
            FakeDevice::at(0, 2, 0),
        ]);
        let runtime = FakeRuntime::with_addresses(&[(0, 2, 0)]);

        let handle = ManagementHandle::build(Box::new(lib), &runtime).unwrap();

        assert_eq!(handle.runtime_count(), 1);
        assert_eq!(handle.mgmt_index(0), Some(1));
        assert_eq!(handle.runtime_index(0), None);
    }

    #[test]
    fn init_failure_is_reported() {
        let mut lib = FakeLibrary::new(vec![]);
        lib.init_result = Err(NativeStatus::Other("Driver Not Loaded".into()));
        let runtime = FakeRuntime::default();

        let err = ManagementHandle::build(Box::new(lib), &runtime)
            .err()
            .unwrap();

        assert_eq!(err, GpuError::SessionInit("Driver Not Loaded".to_string()));
    }

    #[test]
    fn drop_shuts_session_down_once() {
        let lib = FakeLibrary::new(vec![FakeDevice::at(0, 1, 0)]);
        let log = lib.log();
        let runtime = FakeRuntime::with_addresses(&[(0, 1, 0)]);

        let handle = ManagementHandle::build(Box::new(lib), &runtime).unwrap();
        handle.destroy();

        let shutdowns = log
            .lock()
            .unwrap()
            .iter()
            .filter(|call| **call == Call::Shutdown)
            .count();
        assert_eq!(shutdowns, 1);
    }
}
