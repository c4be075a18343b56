use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, ErrorKind},
    path::Path,
    time::Duration,
};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, trace, warn};

const DEVICES_JSON: &str = "devices";
const INTERVAL_JSON: &str = "poll_interval_secs";

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

// Operating point requested for one device, by runtime index.
// Absent fields leave the device untouched.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct DeviceSettings {
    pub index: usize,

    #[serde(default)]
    pub mem_clock: Option<u32>,
    #[serde(default)]
    pub gpu_clock: Option<u32>,
    // Watts
    #[serde(default)]
    pub power_limit: Option<u32>,
    #[serde(default)]
    pub pstate: Option<u8>,
}

impl DeviceSettings {
    pub fn is_empty(&self) -> bool {
        self.mem_clock.is_none()
            && self.gpu_clock.is_none()
            && self.power_limit.is_none()
            && self.pstate.is_none()
    }
}

// Per device values given on the command line, one entry per runtime
// index. None entries keep whatever the configuration file says.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceOverrides {
    pub mem_clock: Vec<Option<u32>>,
    pub gpu_clock: Vec<Option<u32>>,
    pub power_limit: Vec<Option<u32>>,
    pub pstate: Vec<Option<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub poll_interval: Duration,
    pub devices: Vec<DeviceSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            devices: Vec::new(),
        }
    }
}

impl Config {
    // Load the Json configuration, a missing file gives the defaults
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Parsing config file at: {:?}", path);

        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("Configuration file {:?} not found, using defaults", path);
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err).with_context(|| "Failed to open Json configuration file");
            }
        };

        let buf = BufReader::new(file);

        let config_json: Value = serde_json::from_reader(buf)
            .with_context(|| "Failed to parse Json configuration file")?;

        let config = Self::from_json(&config_json)?;
        trace!("Current configuration: {:?}", config);

        Ok(config)
    }

    fn from_json(config_json: &Value) -> Result<Self> {
        let mut config = Self::default();

        match &config_json[INTERVAL_JSON] {
            Value::Null => {}
            value => {
                let secs = value
                    .as_u64()
                    .filter(|secs| *secs > 0)
                    .with_context(|| format!("\"{INTERVAL_JSON}\" must be a positive integer"))?;
                config.poll_interval = Duration::from_secs(secs);
            }
        }

        // A broken device entry only loses that entry
        if let Value::Array(devices) = &config_json[DEVICES_JSON] {
            for device in devices {
                match serde_json::from_value::<DeviceSettings>(device.clone()) {
                    Ok(settings) => config.upsert(settings),
                    Err(err) => warn!("Failed to parse device settings: {err}"),
                }
            }
        }

        Ok(config)
    }

    // Later entries for the same index replace earlier ones
    fn upsert(&mut self, settings: DeviceSettings) {
        match self.devices.iter_mut().find(|d| d.index == settings.index) {
            Some(existing) => *existing = settings,
            None => self.devices.push(settings),
        }
    }

    pub fn settings_for(&self, index: usize) -> Option<&DeviceSettings> {
        self.devices.iter().find(|settings| settings.index == index)
    }

    fn settings_mut(&mut self, index: usize) -> &mut DeviceSettings {
        let position = match self.devices.iter().position(|d| d.index == index) {
            Some(position) => position,
            None => {
                self.devices.push(DeviceSettings {
                    index,
                    ..DeviceSettings::default()
                });
                self.devices.len() - 1
            }
        };

        &mut self.devices[position]
    }

    // Merge the command line values on top of the file
    pub fn apply_overrides(&mut self, overrides: &DeviceOverrides) {
        for (index, value) in overrides.mem_clock.iter().enumerate() {
            if let Some(value) = value {
                self.settings_mut(index).mem_clock = Some(*value);
            }
        }
        for (index, value) in overrides.gpu_clock.iter().enumerate() {
            if let Some(value) = value {
                self.settings_mut(index).gpu_clock = Some(*value);
            }
        }
        for (index, value) in overrides.power_limit.iter().enumerate() {
            if let Some(value) = value {
                self.settings_mut(index).power_limit = Some(*value);
            }
        }
        for (index, value) in overrides.pstate.iter().enumerate() {
            if let Some(value) = value {
                self.settings_mut(index).pstate = Some(*value);
            }
        }

        self.devices.sort_by_key(|settings| settings.index);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_device_settings() {
        let file = write_config(
            r#"{
                "poll_interval_secs": 2,
                "devices": [
                    { "index": 0, "mem_clock": 3505, "gpu_clock": 1506 },
                    { "index": 1, "power_limit": 150, "pstate": 2 }
                ]
            }"#,
        );

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(
            config.settings_for(0),
            Some(&DeviceSettings {
                index: 0,
                mem_clock: Some(3505),
                gpu_clock: Some(1506),
                ..DeviceSettings::default()
            })
        );
        assert_eq!(config.settings_for(1).unwrap().pstate, Some(2));
        assert_eq!(config.settings_for(2), None);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();

        let config = Config::load(&dir.path().join("missing.json")).unwrap();

        assert_eq!(config, Config::default());
    }

    #[test]
    fn invalid_json_is_an_error() {
        let file = write_config("{ not json");

        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let file = write_config(r#"{ "poll_interval_secs": 0 }"#);

        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn broken_device_entry_is_skipped() {
        let file = write_config(
            r#"{ "devices": [ { "mem_clock": 810 }, { "index": 3, "power_limit": 120 } ] }"#,
        );

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.settings_for(3).unwrap().power_limit, Some(120));
    }

    #[test]
    fn overrides_merge_on_top_of_file() {
        let mut config = Config::default();
        config.upsert(DeviceSettings {
            index: 1,
            mem_clock: Some(3505),
            power_limit: Some(150),
            ..DeviceSettings::default()
        });

        config.apply_overrides(&DeviceOverrides {
            mem_clock: vec![Some(810), Some(3304)],
            power_limit: vec![None, None],
            pstate: vec![None, None, Some(0)],
            ..DeviceOverrides::default()
        });

        assert_eq!(config.settings_for(0).unwrap().mem_clock, Some(810));
        let second = config.settings_for(1).unwrap();
        assert_eq!(second.mem_clock, Some(3304));
        assert_eq!(second.power_limit, Some(150));
        assert_eq!(config.settings_for(2).unwrap().pstate, Some(0));
        let indices: Vec<_> = config.devices.iter().map(|d| d.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
