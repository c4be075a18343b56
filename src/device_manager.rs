use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::{
    select,
    sync::mpsc::{Receiver, Sender},
};
use tokio_util::sync::CancellationToken;

use tracing::{debug, error, info, trace, trace_span, warn};

use crate::{
    backend::GpuBackend,
    config::{Config, DeviceSettings},
    errors::GpuError,
};

#[derive(Debug)]
pub enum DeviceMessage {
    // Apply a new operating point to one device
    Apply(DeviceSettings),
    // Put one device back to its state before any change
    Restore { index: usize },

    UpdateInterval { new_duration: Duration },
}

// Owns the backend, applies the configured operating points and
// reports device telemetry until cancelled
pub struct DeviceManager {
    backend: Box<dyn GpuBackend>,
    config: Config,

    // Telemetry interval
    update_interval: Duration,
}

impl DeviceManager {
    pub fn new(backend: Box<dyn GpuBackend>, config: Config) -> Self {
        Self {
            backend,
            update_interval: config.poll_interval,
            config,
        }
    }

    // Run the device manager
    pub async fn run(
        &mut self,
        run_token: CancellationToken,
        mut rx_cmd: Receiver<DeviceMessage>,
        tx_err: Sender<anyhow::Error>,
    ) {
        info!("Device manager: Running ({} backend)", self.backend.kind());

        if let Err(err) = self.apply_all() {
            tx_err.send(err).await.unwrap_or_else(|err| {
                error!("Failed to send error over channel: {err}");
            });
        }

        let mut commands_open = true;

        loop {
            select! {
                _ = run_token.cancelled() => {
                    info!("Device manager: Quiting");

                    let restored = self.cleanup();
                    debug!("Restored {restored} device(s)");

                    break;
                },
                message = rx_cmd.recv(), if commands_open => {
                    // Every sender is gone, stop polling the channel
                    let Some(message) = message else {
                        commands_open = false;
                        continue;
                    };

                    trace!("Parsing message: {:?}", message);

                    let result = trace_span!("message parsing")
                        .in_scope(|| self.parse_msg(message));

                    if let Err(err) = result {
                        tx_err.send(err).await.unwrap_or_else(|err| {
                            error!("Failed to send error over channel: {err}");
                        });
                    }
                },
                _ = tokio::time::sleep(self.update_interval) => {
                    trace_span!("updating").in_scope(|| self.update());
                }
            }
        }
    }

    fn parse_msg(&mut self, message: DeviceMessage) -> Result<()> {
        match message {
            DeviceMessage::Apply(settings) => self.apply(&settings),
            DeviceMessage::Restore { index } => self.restore(index),
            DeviceMessage::UpdateInterval { new_duration } => {
                info!("Device manager: interval set to {new_duration:?}");
                self.update_interval = new_duration;
                Ok(())
            }
        }
    }

    // Apply the operating point of every configured device.
    // A failing device does not stop the others.
    pub fn apply_all(&mut self) -> Result<()> {
        let devices = self.config.devices.clone();

        let failed: Vec<String> = devices
            .iter()
            .filter(|settings| !settings.is_empty())
            .filter_map(|settings| self.apply(settings).err())
            .map(|err| err.to_string())
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("Failed to configure GPUs: {}", failed.join("; ")))
        }
    }

    // pstate first, then explicit clocks, then the power limit
    pub fn apply(&mut self, settings: &DeviceSettings) -> Result<()> {
        let index = settings.index;
        if index >= self.backend.device_count() {
            warn!("GPU #{index}: not present, settings ignored");
            return Ok(());
        }

        let mut errors = Vec::new();

        let results = [
            self.backend.set_pstate_clocks(
                index,
                settings.pstate,
                settings.mem_clock,
                settings.gpu_clock,
            ),
            self.backend
                .set_application_clocks(index, settings.mem_clock, settings.gpu_clock),
            self.backend
                .set_power_limit(index, settings.power_limit.unwrap_or(0)),
        ];

        for result in results {
            match result {
                Ok(_) => {}
                Err(err) if err.is_unsupported() => debug!("{err}"),
                Err(err) => errors.push(err),
            }
        }

        match errors.len() {
            0 => Ok(()),
            _ => Err(anyhow!(join_errors(&errors))),
        }
    }

    fn restore(&mut self, index: usize) -> Result<()> {
        let clocks = self.backend.reset_application_clocks(index);
        let limit = self.backend.reset_power_limit(index);

        let errors: Vec<GpuError> = [clocks, limit]
            .into_iter()
            .filter_map(|result| result.err())
            .collect();

        match errors.len() {
            0 => Ok(()),
            _ => Err(anyhow!(join_errors(&errors))),
        }
    }

    // Log the telemetry of every device
    fn update(&self) {
        for index in 0..self.backend.device_count() {
            match self.report(index) {
                Ok(line) => info!("{line}"),
                Err(err) if err.is_unsupported() => {}
                Err(err) => debug!("{err}"),
            }
        }
    }

    fn report(&self, index: usize) -> crate::errors::Result<String> {
        let temperature = self.backend.temperature(index)?;

        let mut line = format!("GPU #{index}: {temperature}C");
        if let Ok(fan) = self.backend.fan_percent(index) {
            line.push_str(&format!(" fan {fan}%"));
        }
        if let Ok(power) = self.backend.power_usage(index) {
            line.push_str(&format!(" {:.1}W", power as f32 / 1000.0));
        }
        if let Ok(pstate) = self.backend.performance_state(index) {
            line.push_str(&format!(" P{pstate}"));
        }

        Ok(line)
    }

    fn cleanup(&mut self) -> usize {
        self.backend.restore_all()
    }
}

fn join_errors(errors: &[GpuError]) -> String {
    errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
