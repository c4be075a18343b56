use thiserror::Error;

use crate::capability::Capability;

pub type Result<T> = std::result::Result<T, GpuError>;

fn join_names(caps: &[Capability]) -> String {
    caps.iter()
        .map(|cap| cap.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// Error type shared by every device operation.
// Construction errors (the first three variants) abort the
// whole subsystem, all the others only concern a single device.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("Missing required management functions: {}", join_names(.0))]
    CapabilityMissing(Vec<Capability>),
    #[error("Failed to initialize the management session: {0}")]
    SessionInit(String),
    #[error("Failed to query the compute runtime devices: {0}")]
    RuntimeQueryFailed(String),

    #[error("GPU #{index}: no matching management device")]
    DeviceUnmapped { index: usize },
    #[error("GPU #{index}: {what} is not supported by this driver")]
    Unsupported { index: usize, what: &'static str },
    #[error("GPU #{index}: {what} is not allowed by the driver")]
    PermissionDenied { index: usize, what: &'static str },
    #[error("GPU #{index}: unable to query {what}: {message}")]
    QueryFailed {
        index: usize,
        what: &'static str,
        message: String,
    },
    #[error("GPU #{index}: failed to apply {what}: {message}")]
    ApplyFailed {
        index: usize,
        what: &'static str,
        message: String,
    },
    #[error("GPU #{index}: failed to read {what}: {message}")]
    ReadFailed {
        index: usize,
        what: &'static str,
        message: String,
    },
}

impl GpuError {
    // Unsupported results are expected on older drivers and
    // should not be reported as errors
    pub fn is_unsupported(&self) -> bool {
        matches!(self, GpuError::Unsupported { .. })
    }

    // Runtime index the error refers to, if any
    pub fn device_index(&self) -> Option<usize> {
        match self {
            GpuError::CapabilityMissing(_)
            | GpuError::SessionInit(_)
            | GpuError::RuntimeQueryFailed(_) => None,
            GpuError::DeviceUnmapped { index }
            | GpuError::Unsupported { index, .. }
            | GpuError::PermissionDenied { index, .. }
            | GpuError::QueryFailed { index, .. }
            | GpuError::ApplyFailed { index, .. }
            | GpuError::ReadFailed { index, .. } => Some(*index),
        }
    }
}
