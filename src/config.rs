//! Station configuration using Figment.
//!
//! Configuration is layered, highest precedence last:
//! 1. Built-in defaults (the values the station ships with)
//! 2. A TOML file (`--config`, `config/station.toml`, or the user config dir)
//! 3. Environment variables prefixed with `SPECMON_`, nested with `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! SPECMON_APPLICATION__LOG_LEVEL=debug
//! SPECMON_MOTOR__PORT=/dev/ttyUSB1
//! SPECMON_AUTOMATION__THREAD_MAX_WORKERS=2
//! ```
//!
//! # Example
//!
//! ```no_run
//! use spectrum_monitor::config::Settings;
//!
//! let settings = Settings::load(None)?;
//! println!("Analyzer timeout: {} ms", settings.instrument.timeout_ms);
//! # Ok::<(), spectrum_monitor::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// VISA timeout bounds in milliseconds.
pub const VISA_TIMEOUT_RANGE_MS: (u64, u64) = (1000, 25000);
/// VISA read chunk bounds in bytes.
pub const VISA_CHUNK_SIZE_RANGE: (usize, usize) = (1024, 1_048_576);

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The layered providers could not be merged or deserialized.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// A value parsed but is not acceptable.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level station configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Spectrum analyzer (VISA) session settings
    pub instrument: InstrumentConfig,
    /// Antenna positioner (serial) session settings
    pub motor: MotorConfig,
    /// RF relay PLC (serial) session settings
    pub relay: RelayConfig,
    /// Encoder calibration
    pub calibration: CalibrationConfig,
    /// Automation scheduler policy
    pub automation: AutomationConfig,
    /// Loop pacing
    pub timing: TimingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Station name shown in logs and status
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    pub log_json: bool,
    /// Directory for saved sample records
    pub data_dir: Option<PathBuf>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Spectrum Monitor".to_string(),
            log_level: "info".to_string(),
            log_json: false,
            data_dir: None,
        }
    }
}

/// Message-based analyzer session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InstrumentConfig {
    /// VISA resource string to open at startup (e.g. "TCPIP0::10.0.0.5::INSTR")
    pub address: Option<String>,
    /// VISA I/O timeout in milliseconds
    pub timeout_ms: u64,
    /// Read chunk size in bytes
    pub chunk_size: usize,
    /// Assert END on the last byte of each write
    pub send_end: bool,
    /// Append and expect a termination character
    pub enable_termination: bool,
    /// Termination character, "\n" or "\r"
    pub termination: String,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            address: None,
            timeout_ms: 2000,
            chunk_size: 20480,
            send_end: true,
            enable_termination: true,
            termination: "\n".to_string(),
        }
    }
}

impl InstrumentConfig {
    /// Terminator appended to writes; empty when termination is disabled.
    pub fn write_terminator(&self) -> &str {
        if self.enable_termination {
            &self.termination
        } else {
            ""
        }
    }
}

/// Antenna positioner configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MotorConfig {
    /// Serial port to open at startup (e.g. "/dev/ttyUSB0", "COM3")
    pub port: Option<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// Port read timeout in milliseconds
    pub timeout_ms: u64,
    /// How long a query waits for a reply
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
    /// Pause between writing a command and polling for its reply
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9600,
            timeout_ms: 1000,
            query_timeout: Duration::from_secs(5),
            settle: Duration::from_millis(100),
        }
    }
}

/// RF relay PLC configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Serial port to open at startup
    pub port: Option<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// Port read timeout in milliseconds
    pub timeout_ms: u64,
    /// Window for collecting the echo of an opcode
    #[serde(with = "humantime_serde")]
    pub echo_window: Duration,
    /// Window for collecting the status reply after QUERY_STATUS
    #[serde(with = "humantime_serde")]
    pub status_window: Duration,
    /// Status window after P1_INIT
    #[serde(with = "humantime_serde")]
    pub init_window: Duration,
    /// Status window after P1_DISABLE
    #[serde(with = "humantime_serde")]
    pub disable_window: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            timeout_ms: 5000,
            echo_window: Duration::from_millis(1200),
            status_window: Duration::from_secs(5),
            init_window: Duration::from_secs(15),
            disable_window: Duration::from_secs(10),
        }
    }
}

/// Encoder calibration. Encoder home is the count with the dish parked (azimuth at true
/// north, elevation straight up); counts per rotation are per 360 degrees of antenna travel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Azimuth encoder home count
    pub x_enc_home: i64,
    /// Elevation encoder home count
    pub y_enc_home: i64,
    /// Azimuth encoder counts per antenna rotation
    pub x_countsperrotation: i64,
    /// Elevation encoder counts per antenna rotation
    pub y_countsperrotation: i64,
    /// Park azimuth in degrees
    pub park_azimuth: f64,
    /// Park elevation in degrees
    pub park_elevation: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            x_enc_home: -235_753_513,
            y_enc_home: 239_092_664,
            x_countsperrotation: 45_936_033,
            y_countsperrotation: 45_936_033,
            park_azimuth: 0.0,
            park_elevation: 0.0,
        }
    }
}

/// Automation scheduler policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutomationConfig {
    /// Worker pool size for fired jobs
    pub thread_max_workers: usize,
    /// Collapse missed fire times into a single run
    pub coalesce: bool,
    /// Concurrent instances allowed per job
    pub job_max_instances: usize,
    /// Lateness after which a fire time is dropped
    #[serde(with = "humantime_serde")]
    pub misfire_grace: Duration,
    /// Operation budget for one hook invocation
    pub max_operations: u64,
    /// Hook script loaded when automation starts without explicit text
    pub hooks_file: Option<PathBuf>,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            thread_max_workers: 1,
            coalesce: true,
            job_max_instances: 1,
            misfire_grace: Duration::from_secs(1),
            max_operations: 1_000_000,
            hooks_file: None,
        }
    }
}

/// Loop pacing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Sleep while a machine is idle
    #[serde(with = "humantime_serde")]
    pub idle_delay: Duration,
    /// Measurement LOOP interval
    #[serde(with = "humantime_serde")]
    pub analyzer_loop_delay: Duration,
    /// Display loop interval
    #[serde(with = "humantime_serde")]
    pub analyzer_refresh_delay: Duration,
    /// Motion LOOP interval
    #[serde(with = "humantime_serde")]
    pub motor_loop_delay: Duration,
    /// Status monitor interval
    #[serde(with = "humantime_serde")]
    pub status_monitor_delay: Duration,
    /// Budget for joining loops at shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            idle_delay: Duration::from_secs(1),
            analyzer_loop_delay: Duration::from_millis(500),
            analyzer_refresh_delay: Duration::from_millis(300),
            motor_loop_delay: Duration::from_millis(500),
            status_monitor_delay: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl Settings {
    /// Load configuration from an explicit file, or the first default location that exists.
    ///
    /// Missing files are not an error; built-in defaults and environment variables still apply.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).or_else(default_config_path);
        Self::figment(path.as_deref())
            .extract::<Self>()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))
            .and_then(|settings| {
                settings.validate()?;
                Ok(settings)
            })
    }

    /// The provider stack, exposed so callers can layer extra providers on top.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("SPECMON_").split("__"))
    }

    /// Validate configuration after loading
    ///
    /// Checks log level, VISA timeout and chunk ranges, the termination character,
    /// calibration divisors and the automation pool size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let (min, max) = VISA_TIMEOUT_RANGE_MS;
        if !(min..=max).contains(&self.instrument.timeout_ms) {
            return Err(ConfigError::ValidationError(format!(
                "instrument.timeout_ms {} must be within [{}, {}]",
                self.instrument.timeout_ms, min, max
            )));
        }

        let (min, max) = VISA_CHUNK_SIZE_RANGE;
        if !(min..=max).contains(&self.instrument.chunk_size) {
            return Err(ConfigError::ValidationError(format!(
                "instrument.chunk_size {} must be within [{}, {}]",
                self.instrument.chunk_size, min, max
            )));
        }

        if !["\n", "\r"].contains(&self.instrument.termination.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "instrument.termination {:?} must be \"\\n\" or \"\\r\"",
                self.instrument.termination
            )));
        }

        if self.calibration.x_countsperrotation == 0 || self.calibration.y_countsperrotation == 0 {
            return Err(ConfigError::ValidationError(
                "calibration counts per rotation cannot be zero".to_string(),
            ));
        }

        if self.automation.thread_max_workers == 0 {
            return Err(ConfigError::ValidationError(
                "automation.thread_max_workers must be at least 1".to_string(),
            ));
        }

        if self.automation.job_max_instances == 0 {
            return Err(ConfigError::ValidationError(
                "automation.job_max_instances must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// `config/station.toml` in the working directory, else the per-user config file.
pub fn default_config_path() -> Option<PathBuf> {
    let local = PathBuf::from("config/station.toml");
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("spectrum-monitor").join("config.toml"))
        .filter(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.automation.thread_max_workers, 1);
        assert!(settings.automation.coalesce);
        assert_eq!(settings.automation.misfire_grace, Duration::from_secs(1));
        assert_eq!(settings.calibration.x_enc_home, -235_753_513);
        assert_eq!(settings.timing.analyzer_refresh_delay, Duration::from_millis(300));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        let result = settings.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_visa_timeout_out_of_range() {
        let mut settings = Settings::default();
        settings.instrument.timeout_ms = 500;
        assert!(settings.validate().is_err());
        settings.instrument.timeout_ms = 25000;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_chunk_size_out_of_range() {
        let mut settings = Settings::default();
        settings.instrument.chunk_size = 2 * 1_048_576;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn test_termination_must_be_newline_or_return() {
        let mut settings = Settings::default();
        settings.instrument.termination = ";".to_string();
        assert!(settings.validate().is_err());
        settings.instrument.enable_termination = false;
        settings.instrument.termination = "\r".to_string();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.instrument.write_terminator(), "");
    }

    #[test]
    #[serial]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("create temp config");
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[motor]
port = "/dev/ttyUSB7"
settle = "250ms"

[automation]
thread_max_workers = 3
coalesce = false
misfire_grace = "30s"
"#
        )
        .expect("write temp config");

        let settings = Settings::load(Some(file.path())).expect("load config");
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.motor.port.as_deref(), Some("/dev/ttyUSB7"));
        assert_eq!(settings.motor.settle, Duration::from_millis(250));
        assert_eq!(settings.motor.baud_rate, 9600);
        assert_eq!(settings.automation.thread_max_workers, 3);
        assert!(!settings.automation.coalesce);
        assert_eq!(settings.automation.job_max_instances, 1);
        assert_eq!(settings.automation.misfire_grace, Duration::from_secs(30));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "station.toml",
                r#"
[relay]
port = "COM4"
"#,
            )?;
            jail.set_env("SPECMON_RELAY__PORT", "COM9");
            jail.set_env("SPECMON_APPLICATION__LOG_LEVEL", "warn");

            let settings = Settings::load(Some(Path::new("station.toml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(settings.relay.port.as_deref(), Some("COM9"));
            assert_eq!(settings.application.log_level, "warn");
            assert_eq!(settings.relay.baud_rate, 115_200);
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_invalid_file_value_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "station.toml",
                r#"
[instrument]
timeout_ms = 100
"#,
            )?;
            let result = Settings::load(Some(Path::new("station.toml")));
            assert!(matches!(result, Err(ConfigError::ValidationError(_))));
            Ok(())
        });
    }
}
