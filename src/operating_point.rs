use tracing::{debug, info, warn};

use crate::{
    capability::Capability,
    errors::{GpuError, Result},
    identity::ManagementHandle,
    native::{ClockType, DeviceHandle, EnableState},
};

// Only this many memory clocks are considered, extra entries are ignored
pub const MAX_MEMORY_CLOCKS: usize = 32;

// Lowest power limit accepted when the hardware reports no constraints, in mW
const DEFAULT_MIN_POWER_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    // Nothing was requested or nothing was saved
    NoOp,
    Changed,
    Restored,
}

// Application clocks in effect before the first change.
// A field is None when the value could not be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SavedClocks {
    pub mem: Option<u32>,
    pub gpu: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavedPowerLimit {
    // Limit in effect before the first change, in mW
    Known(u32),
    // The previous limit could not be read, restore the factory default
    Unknown,
}

// Per device record of what has to be restored. The first change
// sets the baseline and later changes never overwrite it. A restore
// clears it even when the native call fails, nothing retries at exit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatingState {
    pub saved_clocks: Option<SavedClocks>,
    pub saved_power_limit: Option<SavedPowerLimit>,
}

impl OperatingState {
    pub fn is_modified(&self) -> bool {
        self.saved_clocks.is_some() || self.saved_power_limit.is_some()
    }
}

// Highest supported clock not above the target. The table is ordered
// from the highest clock to the lowest, so this is the first entry at
// or below the target. When none qualifies the target is used as is.
pub fn select_at_or_below(table: &[u32], target: u32) -> u32 {
    table
        .iter()
        .copied()
        .find(|&clock| clock <= target)
        .unwrap_or(target)
}

// Memory clock of the given pstate. The table is ordered by pstate,
// P0 first.
pub fn select_for_pstate(table: &[u32], pstate: u8) -> Option<u32> {
    table.get(usize::from(pstate)).copied()
}

fn nonzero(value: Option<u32>) -> Option<u32> {
    value.filter(|&v| v != 0)
}

impl ManagementHandle {
    pub fn operating_state(&self, runtime_index: usize) -> Option<&OperatingState> {
        self.states.get(runtime_index)
    }

    // Apply the requested memory and graphics application clocks,
    // rounded down to the closest values the device supports
    pub fn set_application_clocks(
        &mut self,
        index: usize,
        mem: Option<u32>,
        gpu: Option<u32>,
    ) -> Result<Outcome> {
        self.resolve(index)?;

        let (mem, gpu) = (nonzero(mem), nonzero(gpu));
        if mem.is_none() && gpu.is_none() {
            return Ok(Outcome::NoOp);
        }

        let handle = self.clock_control(index, "application clocks")?;
        let snapshot = self.clock_snapshot(index, handle);
        let (mut mem_clk, mut gpu_clk) = self.target_clocks(index, handle, mem, gpu)?;

        let mem_clocks = self.memory_clock_table(handle);
        mem_clk = select_at_or_below(&mem_clocks, mem_clk);

        if let Some(gpu_clocks) = self.graphics_clock_table(handle, mem_clk) {
            debug!(
                "GPU #{}: {} clocks found for mem {}",
                index,
                gpu_clocks.len(),
                mem_clk
            );
            gpu_clk = select_at_or_below(&gpu_clocks, gpu_clk);
        }

        self.apply_clocks(index, handle, mem_clk, gpu_clk, snapshot)?;

        info!("GPU #{index}: application clocks set to {mem_clk}/{gpu_clk}");

        Ok(Outcome::Changed)
    }

    // Lock the memory clock to the given pstate, leaving the graphics
    // clock at the highest value that memory clock allows
    pub fn set_pstate_clocks(
        &mut self,
        index: usize,
        pstate: Option<u8>,
        mem: Option<u32>,
        gpu: Option<u32>,
    ) -> Result<Outcome> {
        self.resolve(index)?;

        let Some(pstate) = pstate else {
            return Ok(Outcome::NoOp);
        };

        let handle = self.clock_control(index, "pstate clocks")?;
        let snapshot = self.clock_snapshot(index, handle);
        let (mut mem_clk, mut gpu_clk) =
            self.target_clocks(index, handle, nonzero(mem), nonzero(gpu))?;

        let mem_clocks = self.memory_clock_table(handle);
        if usize::from(pstate) >= mem_clocks.len() {
            warn!(
                "GPU #{}: only {} mem clocks available (p-states)",
                index,
                mem_clocks.len()
            );
        }
        mem_clk = select_for_pstate(&mem_clocks, pstate).unwrap_or(mem_clk);

        // Do not limit the graphics clock, only memory follows the pstate
        if let Some(max) = self
            .graphics_clock_table(handle, mem_clk)
            .and_then(|table| table.into_iter().max())
        {
            gpu_clk = max;
        }

        self.apply_clocks(index, handle, mem_clk, gpu_clk, snapshot)?;

        info!("GPU #{index}: app clocks set to P{pstate} ({mem_clk}/{gpu_clk})");

        Ok(Outcome::Changed)
    }

    // Put the factory default application clocks back if they were changed
    pub fn reset_application_clocks(&mut self, index: usize) -> Result<Outcome> {
        let (_, handle) = self.resolve(index)?;

        if self.states[index].saved_clocks.is_none() {
            return Ok(Outcome::NoOp);
        }

        if self.lib.capabilities().has(Capability::ResetApplicationsClocks) {
            match self.lib.reset_applications_clocks(handle) {
                Ok(()) => info!("GPU #{index}: application clocks restored"),
                Err(status) => warn!(
                    "GPU #{}: unable to reset application clocks: {}",
                    index,
                    self.describe(&status)
                ),
            }
        } else {
            warn!("GPU #{index}: application clocks reset is not supported");
        }

        self.states[index].saved_clocks = None;

        Ok(Outcome::Restored)
    }

    // Set the power limit, in watts, clamped to what the hardware allows
    pub fn set_power_limit(&mut self, index: usize, watts: u32) -> Result<Outcome> {
        let (_, handle) = self.resolve(index)?;

        if watts == 0 {
            return Ok(Outcome::NoOp);
        }

        let caps = self.lib.capabilities();
        let unsupported = GpuError::Unsupported {
            index,
            what: "power limit",
        };
        if !caps.has(Capability::SetPowerLimit) {
            return Err(unsupported);
        }

        let mut min = DEFAULT_MIN_POWER_LIMIT;
        let mut max = 0;
        let mut constrained = false;
        if caps.has(Capability::PowerLimitConstraints) {
            match self.lib.power_limit_constraints(handle) {
                Ok(constraints) => {
                    min = constraints.min;
                    max = constraints.max;
                    constrained = true;
                }
                Err(status) => {
                    debug!("GPU #{index}: power limit constraints unavailable: {status}")
                }
            }
        }

        let can_read_limit = caps.has(Capability::PowerLimit);
        if !constrained && !can_read_limit {
            return Err(unsupported);
        }

        let previous = if can_read_limit {
            self.lib
                .power_limit(handle)
                .inspect_err(|status| {
                    debug!("GPU #{index}: unable to read power limit: {status}")
                })
                .ok()
        } else {
            None
        };

        // Without constraints the current limit is the only known bound
        if max == 0 {
            max = previous.unwrap_or(0);
        }

        let mut limit = watts.saturating_mul(1000);
        if max != 0 {
            limit = limit.min(max);
        }
        limit = limit.max(min);

        if let Err(status) = self.lib.set_power_limit(handle, limit) {
            let message = self.describe(&status);
            warn!("GPU #{index}: plimit {message}");

            return Err(GpuError::ApplyFailed {
                index,
                what: "power limit",
                message,
            });
        }

        info!(
            "GPU #{}: power limit set to {}W (allowed range is {}-{})",
            index,
            limit / 1000,
            min / 1000,
            max / 1000
        );

        let state = &mut self.states[index];
        if state.saved_power_limit.is_none() {
            state.saved_power_limit = Some(
                previous
                    .map(SavedPowerLimit::Known)
                    .unwrap_or(SavedPowerLimit::Unknown),
            );
        }

        Ok(Outcome::Changed)
    }

    // Put the power limit in effect before the first change back
    pub fn reset_power_limit(&mut self, index: usize) -> Result<Outcome> {
        let (_, handle) = self.resolve(index)?;

        let Some(saved) = self.states[index].saved_power_limit.take() else {
            return Ok(Outcome::NoOp);
        };

        let caps = self.lib.capabilities();
        let target = match saved {
            SavedPowerLimit::Known(limit) => Some(limit),
            SavedPowerLimit::Unknown if caps.has(Capability::PowerLimitDefault) => {
                self.lib
                    .default_power_limit(handle)
                    .inspect_err(|status| {
                        warn!("GPU #{index}: unable to read default power limit: {status}")
                    })
                    .ok()
            }
            SavedPowerLimit::Unknown => None,
        };

        match target {
            Some(limit) if caps.has(Capability::SetPowerLimit) => {
                match self.lib.set_power_limit(handle, limit) {
                    Ok(()) => info!(
                        "GPU #{}: power limit restored to {}W",
                        index,
                        limit / 1000
                    ),
                    Err(status) => warn!(
                        "GPU #{}: unable to restore power limit: {}",
                        index,
                        self.describe(&status)
                    ),
                }
            }
            _ => warn!("GPU #{index}: no power limit to restore"),
        }

        Ok(Outcome::Restored)
    }

    // Restore every device with outstanding changes.
    // Returns the number of devices that were touched.
    pub fn restore_all(&mut self) -> usize {
        let mut restored = 0;

        for index in 0..self.states.len() {
            if !self.states[index].is_modified() {
                continue;
            }

            let clocks = self.reset_application_clocks(index);
            let limit = self.reset_power_limit(index);

            for result in [clocks, limit] {
                if let Err(err) = result {
                    warn!("{err}");
                }
            }

            restored += 1;
        }

        restored
    }

    // The driver must export the clock functions and allow their use
    fn clock_control(&self, index: usize, what: &'static str) -> Result<DeviceHandle> {
        let (device, handle) = self.resolve(index)?;
        let caps = self.lib.capabilities();

        if !caps.has(Capability::SetApplicationsClocks)
            || !caps.has(Capability::DefaultApplicationsClock)
        {
            return Err(GpuError::Unsupported { index, what });
        }

        if device.app_clocks != EnableState::Enabled {
            warn!("GPU #{index}: NVML application clock feature is not allowed!");
            return Err(GpuError::PermissionDenied { index, what });
        }

        Ok(handle)
    }

    // Current application clocks, read before anything is changed.
    // Nothing is read once a baseline exists.
    fn clock_snapshot(&self, index: usize, handle: DeviceHandle) -> SavedClocks {
        if let Some(saved) = self.states[index].saved_clocks {
            return saved;
        }

        if !self.lib.capabilities().has(Capability::ApplicationsClock) {
            return SavedClocks::default();
        }

        SavedClocks {
            mem: self.lib.applications_clock(handle, ClockType::Memory).ok(),
            gpu: self.lib.applications_clock(handle, ClockType::Graphics).ok(),
        }
    }

    // Device default clocks overridden by whatever was requested
    fn target_clocks(
        &self,
        index: usize,
        handle: DeviceHandle,
        mem: Option<u32>,
        gpu: Option<u32>,
    ) -> Result<(u32, u32)> {
        let mem_clk = self
            .lib
            .default_applications_clock(handle, ClockType::Memory)
            .unwrap_or(0);

        let gpu_clk = self
            .lib
            .default_applications_clock(handle, ClockType::Graphics)
            .map_err(|status| {
                warn!("GPU #{index}: unable to query application clocks");

                GpuError::QueryFailed {
                    index,
                    what: "default application clocks",
                    message: self.describe(&status),
                }
            })?;

        debug!("GPU #{index}: default application clocks are {mem_clk}/{gpu_clk}");

        Ok((mem.unwrap_or(mem_clk), gpu.unwrap_or(gpu_clk)))
    }

    // Supported memory clocks, highest first. Empty when unknown.
    fn memory_clock_table(&self, handle: DeviceHandle) -> Vec<u32> {
        if !self.lib.capabilities().has(Capability::SupportedMemoryClocks) {
            return Vec::new();
        }

        let mut table = self
            .lib
            .supported_memory_clocks(handle)
            .inspect_err(|status| debug!("Supported memory clocks unavailable: {status}"))
            .unwrap_or_default();
        table.truncate(MAX_MEMORY_CLOCKS);

        table
    }

    // Supported graphics clocks for a memory clock, highest first
    fn graphics_clock_table(&self, handle: DeviceHandle, mem: u32) -> Option<Vec<u32>> {
        if !self
            .lib
            .capabilities()
            .has(Capability::SupportedGraphicsClocks)
        {
            return None;
        }

        self.lib
            .supported_graphics_clocks(handle, mem)
            .inspect_err(|status| {
                debug!("Supported graphics clocks for mem {mem} unavailable: {status}")
            })
            .ok()
            .filter(|table| !table.is_empty())
    }

    fn apply_clocks(
        &mut self,
        index: usize,
        handle: DeviceHandle,
        mem: u32,
        gpu: u32,
        snapshot: SavedClocks,
    ) -> Result<()> {
        if let Err(status) = self.lib.set_applications_clocks(handle, mem, gpu) {
            let message = self.describe(&status);
            warn!("GPU #{index}: {mem}/{gpu} - {message}");

            return Err(GpuError::ApplyFailed {
                index,
                what: "application clocks",
                message,
            });
        }

        // Keep the first baseline, later changes must not replace it
        let state = &mut self.states[index];
        if state.saved_clocks.is_none() {
            state.saved_clocks = Some(snapshot);
        }

        Ok(())
    }
}
