use std::{path::PathBuf, str::FromStr};

use anyhow::{Context, Result};
use argparse::{ArgumentParser, Print, Store, StoreOption, StoreTrue};

use crate::config::DeviceOverrides;

pub struct ArgsOptions {
    pub config_file_path: PathBuf,

    // Print the device list and exit
    pub list_devices: bool,

    // Comma separated per device values, in runtime index order
    pub mem_clocks: String,
    pub gpu_clocks: String,
    pub power_limits: String,
    pub pstates: String,

    pub interval_secs: Option<u64>,
}

impl ArgsOptions {
    pub fn parse() -> Self {
        let mut options = ArgsOptions::default();

        {
            let mut parser = ArgumentParser::new();
            parser.set_description("Reconcile CUDA and NVML GPUs and apply clock and power settings");

            // Configuration file path
            parser.refer(&mut options.config_file_path).add_option(
                &["-c", "--config"],
                Store,
                "The file path of the configuration file",
            );

            parser.refer(&mut options.list_devices).add_option(
                &["-D", "--list"],
                StoreTrue,
                "List the detected GPUs and exit",
            );

            parser.refer(&mut options.mem_clocks).add_option(
                &["--mem-clock"],
                Store,
                "Memory application clocks in MHz, e.g. 3505,,810",
            );
            parser.refer(&mut options.gpu_clocks).add_option(
                &["--gpu-clock"],
                Store,
                "Graphics application clocks in MHz",
            );
            parser.refer(&mut options.power_limits).add_option(
                &["--plimit"],
                Store,
                "Power limits in watts",
            );
            parser.refer(&mut options.pstates).add_option(
                &["--pstate"],
                Store,
                "Memory clock pstates (0 is the fastest)",
            );

            parser.refer(&mut options.interval_secs).add_option(
                &["-i", "--interval"],
                StoreOption,
                "Seconds between two telemetry reports",
            );

            // Show version
            parser.add_option(
                &["-V", "--version"],
                Print(env!("CARGO_PKG_VERSION").to_string()),
                "Show the program version",
            );

            parser.parse_args_or_exit();
        }

        options
    }

    // Turn the per device lists into configuration overrides
    pub fn overrides(&self) -> Result<DeviceOverrides> {
        Ok(DeviceOverrides {
            mem_clock: parse_list(&self.mem_clocks).with_context(|| "Invalid --mem-clock list")?,
            gpu_clock: parse_list(&self.gpu_clocks).with_context(|| "Invalid --gpu-clock list")?,
            power_limit: parse_list(&self.power_limits)
                .with_context(|| "Invalid --plimit list")?,
            pstate: parse_list(&self.pstates).with_context(|| "Invalid --pstate list")?,
        })
    }
}

impl Default for ArgsOptions {
    fn default() -> Self {
        Self {
            config_file_path: PathBuf::from("nvbridge/config.json"),
            list_devices: false,
            mem_clocks: String::new(),
            gpu_clocks: String::new(),
            power_limits: String::new(),
            pstates: String::new(),
            interval_secs: None,
        }
    }
}

// Parse a comma separated list. Empty entries leave that device alone.
pub fn parse_list<T>(list: &str) -> Result<Vec<Option<T>>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if list.trim().is_empty() {
        return Ok(Vec::new());
    }

    list.split(',')
        .map(str::trim)
        .map(|entry| {
            if entry.is_empty() {
                return Ok(None);
            }

            entry
                .parse()
                .map(Some)
                .with_context(|| format!("\"{entry}\" is not a valid value"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_entries_are_skipped() {
        let list: Vec<Option<u32>> = parse_list("3505,, 810").unwrap();
        assert_eq!(list, vec![Some(3505), None, Some(810)]);
    }

    #[test]
    fn empty_list_is_empty() {
        assert!(parse_list::<u32>("").unwrap().is_empty());
    }

    #[test]
    fn invalid_entry_is_an_error() {
        assert!(parse_list::<u8>("1,fast").is_err());
        assert!(parse_list::<u8>("300").is_err());
    }

    #[test]
    fn overrides_from_options() {
        let options = ArgsOptions {
            power_limits: "120,150".to_string(),
            pstates: ",2".to_string(),
            ..ArgsOptions::default()
        };

        let overrides = options.overrides().unwrap();

        assert_eq!(overrides.power_limit, vec![Some(120), Some(150)]);
        assert_eq!(overrides.pstate, vec![None, Some(2)]);
        assert!(overrides.mem_clock.is_empty());
    }
}
