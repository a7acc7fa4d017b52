//! Configuration loading using Figment.
//!
//! Configuration is merged from:
//! 1. a TOML file (default `config/labctl.toml`)
//! 2. environment variables prefixed with `LABCTL_`, using `__` to nest
//!    (`LABCTL_POLLING__MIN_INTERVAL_MS=800`)
//!
//! Each device section is optional; a missing section means the instrument is
//! not part of this deployment.
//!
//! # Example
//! ```no_run
//! use labctl::config::Config;
//!
//! let config = Config::load_from("config/labctl.toml")?;
//! println!("polling floor: {} ms", config.polling.min_interval_ms);
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use labctl_core::error_recovery::RetryPolicy;
use labctl_core::polling::BackoffBounds;
use labctl_core::serial::{Parity, SerialSettings};
use labctl_driver_bk::SupplySettings;
use labctl_driver_omega::{MonitorSettings, UnitChannel, WordOrder};
use labctl_driver_omron::g9sp_frame::{MAX_INPUTS, MAX_OUTPUTS};
use labctl_driver_omron::{ControllerSettings, Interlock};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/labctl.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Adaptive polling and cache settings
    #[serde(default)]
    pub polling: PollingConfig,
    /// Bounded reconnect settings
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Modbus temperature monitor
    #[serde(default)]
    pub temperature_monitor: Option<TemperatureMonitorConfig>,
    /// Safety controller interlocks
    #[serde(default)]
    pub interlocks: Option<InterlocksConfig>,
    /// Programmable power supply
    #[serde(default)]
    pub power_supply: Option<PowerSupplyConfig>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured (development)
    #[default]
    Pretty,
    /// Single-line
    Compact,
    /// JSON lines for log aggregation
    Json,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// ANSI colours (pretty format only)
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            ansi: true,
        }
    }
}

/// `[polling]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Interval while a device is healthy
    pub min_interval_ms: u64,
    /// Backoff ceiling
    pub max_interval_ms: u64,
    /// Bad observations bridged with the last good value before escalating
    pub error_threshold: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 500,
            max_interval_ms: 5000,
            error_threshold: 3,
        }
    }
}

impl PollingConfig {
    /// Backoff bounds for the scheduler.
    pub fn bounds(&self) -> BackoffBounds {
        BackoffBounds {
            min_interval: Duration::from_millis(self.min_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
        }
    }
}

/// `[reconnect]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Open attempts per reconnect
    pub attempts: u32,
    /// Delay between attempts
    pub delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 1000,
        }
    }
}

impl ReconnectConfig {
    /// Retry policy used by every transport.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.attempts,
            backoff_delay: Duration::from_millis(self.delay_ms),
        }
    }
}

/// `[temperature_monitor]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureMonitorConfig {
    /// Serial port path
    pub port: String,
    /// Baud rate (8-N-1)
    #[serde(default = "default_modbus_baud")]
    pub baud_rate: u32,
    /// Response budget per transaction
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Half-word order of the process value
    #[serde(default)]
    pub word_order: WordOrder,
    /// Word written to READING_CONFIG at startup
    #[serde(default = "default_reading_config")]
    pub reading_config: u16,
    /// Lower validity bound (°C)
    #[serde(default = "default_min_celsius")]
    pub min_celsius: f64,
    /// Upper validity bound (°C)
    #[serde(default = "default_max_celsius")]
    pub max_celsius: f64,
    /// Monitored units
    #[serde(default = "default_units", rename = "unit")]
    pub units: Vec<UnitChannel>,
}

impl TemperatureMonitorConfig {
    /// Serial line settings.
    pub fn serial(&self) -> SerialSettings {
        SerialSettings::new(&self.port, self.baud_rate)
            .with_timeout(Duration::from_millis(self.timeout_ms))
    }

    /// Driver settings.
    pub fn monitor(&self) -> MonitorSettings {
        MonitorSettings {
            units: self.units.clone(),
            word_order: self.word_order,
            reading_config: self.reading_config,
            min_celsius: self.min_celsius,
            max_celsius: self.max_celsius,
        }
    }
}

/// `[interlocks]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterlocksConfig {
    /// Serial port path
    pub port: String,
    /// Baud rate (8-E-1), 9600 or 115200
    #[serde(default = "default_safety_baud")]
    pub baud_rate: u32,
    /// Response budget per poll
    #[serde(default = "default_safety_timeout_ms")]
    pub timeout_ms: u64,
    /// Configured safety input terminals
    #[serde(default = "default_input_count")]
    pub input_count: u8,
    /// Configured safety output terminals
    #[serde(default = "default_output_count")]
    pub output_count: u8,
    /// Output terminal reported as the controller-active channel
    #[serde(default = "default_active_output")]
    pub active_output: u8,
    /// Logical interlocks
    #[serde(default = "default_interlocks", rename = "interlock")]
    pub interlocks: Vec<Interlock>,
}

impl InterlocksConfig {
    /// Serial line settings.
    pub fn serial(&self) -> SerialSettings {
        SerialSettings::new(&self.port, self.baud_rate)
            .with_parity(Parity::Even)
            .with_timeout(Duration::from_millis(self.timeout_ms))
    }

    /// Driver settings.
    pub fn controller(&self) -> ControllerSettings {
        ControllerSettings {
            input_count: self.input_count,
            output_count: self.output_count,
            active_output: self.active_output,
            interlocks: self.interlocks.clone(),
        }
    }
}

/// `[power_supply]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSupplyConfig {
    /// Serial port path
    pub port: String,
    /// Baud rate (8-N-1)
    #[serde(default = "default_modbus_baud")]
    pub baud_rate: u32,
    /// Response budget per command
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Preset all setpoint writes go to
    #[serde(default = "default_working_preset")]
    pub working_preset: u8,
    /// Largest accepted voltage (V)
    #[serde(default = "default_max_voltage")]
    pub max_voltage: f64,
    /// Largest accepted current (A)
    #[serde(default = "default_max_current")]
    pub max_current: f64,
    /// Load resistance for the reported-current clamp (Ω)
    #[serde(default)]
    pub load_resistance_ohms: Option<f64>,
}

impl PowerSupplyConfig {
    /// Serial line settings.
    pub fn serial(&self) -> SerialSettings {
        SerialSettings::new(&self.port, self.baud_rate)
            .with_timeout(Duration::from_millis(self.timeout_ms))
    }

    /// Driver settings.
    pub fn supply(&self) -> SupplySettings {
        SupplySettings {
            working_preset: self.working_preset,
            max_voltage: self.max_voltage,
            max_current: self.max_current,
            load_resistance_ohms: self.load_resistance_ohms,
        }
    }
}

// Default value functions
fn default_modbus_baud() -> u32 {
    9600
}

fn default_safety_baud() -> u32 {
    9600
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_safety_timeout_ms() -> u64 {
    300
}

fn default_reading_config() -> u16 {
    MonitorSettings::default().reading_config
}

fn default_min_celsius() -> f64 {
    -90.0
}

fn default_max_celsius() -> f64 {
    500.0
}

fn default_units() -> Vec<UnitChannel> {
    MonitorSettings::default().units
}

fn default_input_count() -> u8 {
    ControllerSettings::default().input_count
}

fn default_output_count() -> u8 {
    ControllerSettings::default().output_count
}

fn default_active_output() -> u8 {
    ControllerSettings::default().active_output
}

fn default_interlocks() -> Vec<Interlock> {
    ControllerSettings::default().interlocks
}

fn default_working_preset() -> u8 {
    SupplySettings::default().working_preset
}

fn default_max_voltage() -> f64 {
    SupplySettings::default().max_voltage
}

fn default_max_current() -> f64 {
    SupplySettings::default().max_current
}

impl Config {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: Config = Self::figment(path)
            .extract()
            .with_context(|| format!("failed to load configuration from {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Provider stack: TOML file, then `LABCTL_` environment overrides.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("LABCTL_").split("__"))
    }

    /// Check ranges and cross-field rules.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            bail!(
                "invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            );
        }

        if self.polling.min_interval_ms == 0 {
            bail!("polling.min_interval_ms must be positive");
        }
        if self.polling.min_interval_ms > self.polling.max_interval_ms {
            bail!(
                "polling.min_interval_ms ({}) exceeds max_interval_ms ({})",
                self.polling.min_interval_ms,
                self.polling.max_interval_ms
            );
        }
        if self.polling.error_threshold == 0 {
            bail!("polling.error_threshold must be at least 1");
        }

        if let Some(monitor) = &self.temperature_monitor {
            if monitor.units.is_empty() {
                bail!("temperature_monitor needs at least one unit");
            }
            let mut seen = std::collections::HashSet::new();
            for unit in &monitor.units {
                if !(1..=247).contains(&unit.unit) {
                    bail!("temperature_monitor unit {} outside 1..=247", unit.unit);
                }
                if !seen.insert(unit.unit) {
                    bail!("temperature_monitor unit {} listed twice", unit.unit);
                }
            }
            if monitor.min_celsius >= monitor.max_celsius {
                bail!(
                    "temperature_monitor range [{}, {}] is empty",
                    monitor.min_celsius,
                    monitor.max_celsius
                );
            }
        }

        if let Some(interlocks) = &self.interlocks {
            if ![9600, 115_200].contains(&interlocks.baud_rate) {
                bail!(
                    "interlocks.baud_rate {} not supported, use 9600 or 115200",
                    interlocks.baud_rate
                );
            }
            if usize::from(interlocks.input_count) > MAX_INPUTS {
                bail!("interlocks.input_count {} exceeds {}", interlocks.input_count, MAX_INPUTS);
            }
            if usize::from(interlocks.output_count) > MAX_OUTPUTS {
                bail!("interlocks.output_count {} exceeds {}", interlocks.output_count, MAX_OUTPUTS);
            }
            labctl_driver_omron::validate_settings(&interlocks.controller())
                .context("interlock map does not fit the controller")?;
        }

        if let Some(psu) = &self.power_supply {
            if !(1..=3).contains(&psu.working_preset) {
                bail!("power_supply.working_preset {} outside 1..=3", psu.working_preset);
            }
            for (name, value) in [("max_voltage", psu.max_voltage), ("max_current", psu.max_current)] {
                if value.is_nan() || value <= 0.0 || value > labctl_driver_bk::ascii::MAX_FIELD_VALUE {
                    bail!(
                        "power_supply.{} {} outside (0, {}]",
                        name,
                        value,
                        labctl_driver_bk::ascii::MAX_FIELD_VALUE
                    );
                }
            }
            if let Some(ohms) = psu.load_resistance_ohms {
                if ohms.is_nan() || ohms <= 0.0 {
                    bail!("power_supply.load_resistance_ohms must be positive");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn empty_file_yields_defaults() {
        let file = write_config("");
        let config: Config = Config::figment(file.path()).extract().unwrap();
        assert_eq!(config.polling, PollingConfig::default());
        assert_eq!(config.reconnect.attempts, 3);
        assert!(config.temperature_monitor.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn device_sections_fill_defaults() {
        let file = write_config(
            r#"
            [temperature_monitor]
            port = "/dev/ttyUSB0"

            [interlocks]
            port = "/dev/ttyUSB1"
            baud_rate = 115200

            [power_supply]
            port = "/dev/ttyUSB2"
            load_resistance_ohms = 4.7
            "#,
        );
        let config: Config = Config::figment(file.path()).extract().unwrap();
        config.validate().unwrap();

        let monitor = config.temperature_monitor.unwrap();
        assert_eq!(monitor.units.len(), 6);
        assert_eq!(monitor.units[2].label, "Chamber Top");
        assert_eq!(monitor.word_order, WordOrder::LowFirst);
        assert_eq!(monitor.serial().baud_rate, 9600);

        let interlocks = config.interlocks.unwrap();
        assert_eq!(interlocks.interlocks.len(), 8);
        assert_eq!(interlocks.serial().parity, Parity::Even);
        assert_eq!(interlocks.serial().timeout, Duration::from_millis(300));

        let psu = config.power_supply.unwrap();
        assert_eq!(psu.supply().working_preset, 3);
        assert_eq!(psu.supply().load_resistance_ohms, Some(4.7));
    }

    #[test]
    fn interlock_tables_replace_the_default_map() {
        let file = write_config(
            r#"
            [interlocks]
            port = "COM4"
            input_count = 4

            [[interlocks.interlock]]
            name = "Door"
            inputs = [0, 1]

            [[interlocks.interlock]]
            name = "Water"
            inputs = [3]
            "#,
        );
        let config: Config = Config::figment(file.path()).extract().unwrap();
        config.validate().unwrap();
        let interlocks = config.interlocks.unwrap();
        assert_eq!(
            interlocks.interlocks,
            vec![Interlock::dual("Door", 0, 1), Interlock::single("Water", 3)]
        );
    }

    #[test]
    fn environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("labctl.toml", "[polling]\nmin_interval_ms = 750\n")?;
            jail.set_env("LABCTL_POLLING__MAX_INTERVAL_MS", "8000");
            let config = Config::load_from("labctl.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.polling.min_interval_ms, 750);
            assert_eq!(config.polling.max_interval_ms, 8000);
            Ok(())
        });
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.polling.min_interval_ms = 6000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());

        let file = write_config(
            r#"
            [temperature_monitor]
            port = "COM3"
            [[temperature_monitor.unit]]
            unit = 0
            label = "Broadcast"
            "#,
        );
        let config: Config = Config::figment(file.path()).extract().unwrap();
        assert!(config.validate().is_err());

        let file = write_config("[interlocks]\nport = \"COM4\"\nbaud_rate = 19200\n");
        let config: Config = Config::figment(file.path()).extract().unwrap();
        assert!(config.validate().is_err());

        let file = write_config("[interlocks]\nport = \"COM4\"\ninput_count = 8\n");
        let config: Config = Config::figment(file.path()).extract().unwrap();
        // default map uses inputs up to 12
        assert!(config.validate().is_err());

        let file = write_config("[power_supply]\nport = \"COM5\"\nmax_voltage = 120.0\n");
        let config: Config = Config::figment(file.path()).extract().unwrap();
        assert!(config.validate().is_err());

        let file = write_config("[power_supply]\nport = \"COM5\"\nworking_preset = 4\n");
        let config: Config = Config::figment(file.path()).extract().unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn shipped_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
        let config: Config = Config::figment(&path).extract().unwrap();
        config.validate().unwrap();
        assert_eq!(config.temperature_monitor.unwrap().units.len(), 5);
        assert_eq!(config.interlocks.unwrap().interlocks.len(), 8);
        assert_eq!(config.power_supply.unwrap().max_voltage, 84.0);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let config = Config::load_from("/nonexistent/labctl.toml").unwrap();
        assert_eq!(config, Config::default());
    }
}
