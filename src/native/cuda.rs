use std::{
    ffi::CStr,
    os::raw::{c_char, c_int, c_uint},
};

use libloading::Library;
use tracing::{debug, trace};

use crate::native::{ComputeRuntime, NativeResult, NativeStatus, RuntimeDeviceProps};

#[cfg(windows)]
const LIBRARY_NAMES: [&str; 1] = ["nvcuda.dll"];
#[cfg(not(windows))]
const LIBRARY_NAMES: [&str; 2] = ["libcuda.so.1", "libcuda.so"];

const CUDA_SUCCESS: c_int = 0;
const CUDA_ERROR_NOT_INITIALIZED: c_int = 3;
const CUDA_ERROR_NO_DEVICE: c_int = 100;
const CUDA_ERROR_INVALID_DEVICE: c_int = 101;

// CUdevice_attribute values used to locate a device on the PCI bus
const ATTRIBUTE_PCI_BUS_ID: c_int = 33;
const ATTRIBUTE_PCI_DEVICE_ID: c_int = 34;
const ATTRIBUTE_PCI_DOMAIN_ID: c_int = 50;

const NAME_BUFFER_SIZE: usize = 256;

type CuInit = unsafe extern "C" fn(c_uint) -> c_int;
type CuDeviceGetCount = unsafe extern "C" fn(*mut c_int) -> c_int;
type CuDeviceGet = unsafe extern "C" fn(*mut c_int, c_int) -> c_int;
type CuDeviceGetAttribute = unsafe extern "C" fn(*mut c_int, c_int, c_int) -> c_int;
type CuDeviceGetName = unsafe extern "C" fn(*mut c_char, c_int, c_int) -> c_int;

// Compute runtime backed by the CUDA driver API.
// The driver enumerates devices in the same order as the runtime API.
pub struct CudaRuntime {
    device_count: CuDeviceGetCount,
    device_get: CuDeviceGet,
    device_get_attribute: CuDeviceGetAttribute,
    device_get_name: CuDeviceGetName,

    // Keeps the function pointers above valid
    _library: Library,
}

fn to_status(code: c_int) -> NativeResult<()> {
    match code {
        CUDA_SUCCESS => Ok(()),
        CUDA_ERROR_NOT_INITIALIZED => Err(NativeStatus::Uninitialized),
        CUDA_ERROR_NO_DEVICE => Err(NativeStatus::NotFound),
        CUDA_ERROR_INVALID_DEVICE => Err(NativeStatus::InvalidArgument),
        code => Err(NativeStatus::Other(format!("CUDA error {code}"))),
    }
}

impl CudaRuntime {
    // Load the CUDA driver library and initialize it
    pub fn load() -> NativeResult<Self> {
        let library = LIBRARY_NAMES
            .iter()
            .find_map(|name| {
                // SAFETY: the CUDA driver has no load-time side effects
                // beyond the dynamic linker's own
                match unsafe { Library::new(name) } {
                    Ok(library) => Some(library),
                    Err(err) => {
                        trace!("Failed to load {name}: {err}");
                        None
                    }
                }
            })
            .ok_or_else(|| {
                NativeStatus::Other("CUDA driver library not found".to_string())
            })?;

        // SAFETY: the signatures match the CUDA driver API headers and
        // the pointers are kept alive by storing the library
        let runtime = unsafe {
            let init = *library
                .get::<CuInit>(b"cuInit")
                .map_err(|_| NativeStatus::FunctionNotFound)?;
            let device_count = *library
                .get::<CuDeviceGetCount>(b"cuDeviceGetCount")
                .map_err(|_| NativeStatus::FunctionNotFound)?;
            let device_get = *library
                .get::<CuDeviceGet>(b"cuDeviceGet")
                .map_err(|_| NativeStatus::FunctionNotFound)?;
            let device_get_attribute = *library
                .get::<CuDeviceGetAttribute>(b"cuDeviceGetAttribute")
                .map_err(|_| NativeStatus::FunctionNotFound)?;
            let device_get_name = *library
                .get::<CuDeviceGetName>(b"cuDeviceGetName")
                .map_err(|_| NativeStatus::FunctionNotFound)?;

            to_status(init(0))?;

            Self {
                device_count,
                device_get,
                device_get_attribute,
                device_get_name,
                _library: library,
            }
        };

        debug!("CUDA driver initialized");

        Ok(runtime)
    }

    fn attribute(&self, device: c_int, attribute: c_int) -> NativeResult<u32> {
        let mut value: c_int = 0;
        // SAFETY: value outlives the call
        to_status(unsafe {
            (self.device_get_attribute)(&mut value, attribute, device)
        })?;

        u32::try_from(value).map_err(|_| NativeStatus::InvalidArgument)
    }

    fn device_name(&self, device: c_int) -> NativeResult<String> {
        let mut buffer = [0 as c_char; NAME_BUFFER_SIZE];
        // SAFETY: the length passed matches the buffer size
        to_status(unsafe {
            (self.device_get_name)(
                buffer.as_mut_ptr(),
                NAME_BUFFER_SIZE as c_int,
                device,
            )
        })?;

        // SAFETY: the driver always nul terminates within the length given
        let name = unsafe { CStr::from_ptr(buffer.as_ptr()) };

        Ok(name.to_string_lossy().into_owned())
    }
}

impl ComputeRuntime for CudaRuntime {
    fn device_count(&self) -> NativeResult<u32> {
        let mut count: c_int = 0;
        // SAFETY: count outlives the call
        to_status(unsafe { (self.device_count)(&mut count) })?;

        u32::try_from(count).map_err(|_| NativeStatus::InvalidArgument)
    }

    fn device_properties(&self, index: u32) -> NativeResult<RuntimeDeviceProps> {
        let ordinal =
            c_int::try_from(index).map_err(|_| NativeStatus::InvalidArgument)?;

        let mut device: c_int = 0;
        // SAFETY: device outlives the call
        to_status(unsafe { (self.device_get)(&mut device, ordinal) })?;

        Ok(RuntimeDeviceProps {
            name: self.device_name(device).unwrap_or_default(),
            pci_domain_id: self.attribute(device, ATTRIBUTE_PCI_DOMAIN_ID)?,
            pci_bus_id: self.attribute(device, ATTRIBUTE_PCI_BUS_ID)?,
            pci_device_id: self.attribute(device, ATTRIBUTE_PCI_DEVICE_ID)?,
        })
    }
}
