use anyhow::{Context, Result};
use nvbridge::{
    arg_parser::ArgsOptions,
    backend::{GpuBackend, select_backend},
    config::Config,
    device_manager::{DeviceManager, DeviceMessage},
    logger,
    native::cuda::CudaRuntime,
};
use tokio::{select, signal::ctrl_c, sync::mpsc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    logger::init_logging();

    // Parse the command line arguments
    let args_options = ArgsOptions::parse();

    let config = load_config(&args_options)?;

    let backend = {
        let runtime = CudaRuntime::load()
            .map_err(|status| anyhow::anyhow!("{status}"))
            .context("Failed to load the CUDA driver")?;

        select_backend(&runtime)?
    };

    if let Some(version) = backend.driver_version() {
        info!("NVIDIA driver version {version}");
    }

    if args_options.list_devices {
        list_devices(backend.as_ref());
        return Ok(());
    }

    // This token and tracker will be used to handle graceful shutdown
    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    // Errors of the running tasks are reported here
    let (tx_err, mut rx_err) = mpsc::channel(16);

    // Start the device manager
    let (tx_device_manager, rx_device_manager) = mpsc::channel(16);
    {
        let token = token.clone();
        let tx_err = tx_err.clone();

        tracker.spawn(async move {
            let mut device_manager = DeviceManager::new(backend, config);
            device_manager.run(token, rx_device_manager, tx_err).await;
        });
    }

    let mut reload = ReloadSignal::new()?;

    loop {
        select! {
            _ = ctrl_c() => { break; },
            _ = reload.recv() => {
                info!("Reloading configuration");

                if let Err(err) = reload_config(&args_options, &tx_device_manager).await {
                    for e in err.chain() {
                        error!("{e}");
                    }
                }
            },
            err_msg = rx_err.recv() => {
                if let Some(err) = err_msg {
                    for e in err.chain() {
                        error!("{e}");
                    }
                }
            }
        }
    }

    // Cancel the token to communicate the program
    // termination to the running tasks
    token.cancel();

    // Wait for the tasks to finish
    tracker.close();
    tracker.wait().await;

    Ok(())
}

// Configuration file with the command line values on top
fn load_config(args_options: &ArgsOptions) -> Result<Config> {
    let mut config = Config::load(&args_options.config_file_path)?;

    config.apply_overrides(&args_options.overrides()?);

    if let Some(secs) = args_options.interval_secs {
        if secs == 0 {
            warn!("Ignoring a zero telemetry interval");
        } else {
            config.poll_interval = std::time::Duration::from_secs(secs);
        }
    }

    Ok(config)
}

async fn reload_config(
    args_options: &ArgsOptions,
    tx_device_manager: &mpsc::Sender<DeviceMessage>,
) -> Result<()> {
    let config = load_config(args_options)?;

    let messages = config
        .devices
        .into_iter()
        .map(DeviceMessage::Apply)
        .chain([DeviceMessage::UpdateInterval {
            new_duration: config.poll_interval,
        }]);

    for message in messages {
        tx_device_manager
            .send(message)
            .await
            .context("Device manager send error")?;
    }

    Ok(())
}

fn list_devices(backend: &dyn GpuBackend) {
    println!(
        "{} GPU(s) found through {}",
        backend.device_count(),
        backend.kind()
    );

    for index in 0..backend.device_count() {
        match backend.descriptor(index) {
            Ok(descriptor) => println!("{descriptor}"),
            Err(err) => println!("{err}"),
        }
    }
}

// SIGHUP asks for a configuration reload. Other platforms never reload.
struct ReloadSignal {
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl ReloadSignal {
    #[cfg(unix)]
    fn new() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        let hangup = signal(SignalKind::hangup())
            .with_context(|| "Failed to install the SIGHUP handler")?;

        Ok(Self { hangup })
    }

    #[cfg(not(unix))]
    fn new() -> Result<Self> {
        Ok(Self {})
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            if self.hangup.recv().await.is_some() {
                return;
            }
        }

        std::future::pending::<()>().await
    }
}
