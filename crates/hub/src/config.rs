//! TOML config file loading and validation for the serial link, quiet hours,
//! CSV logs and git sync.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use time::UtcOffset;

use crate::manager::QuietHours;
use crate::protocol::is_reserved_byte;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub quiet_hours: QuietHoursConfig,
    pub logs: LogsConfig,
    pub sync: SyncConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".into(),
            baud_rate: 9600,
        }
    }
}

/// Loud window in local time: `[earliest_hour, latest_hour)`.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct QuietHoursConfig {
    pub earliest_hour: u8,
    pub latest_hour: u8,
    pub utc_offset_hours: i8,
}

impl Default for QuietHoursConfig {
    fn default() -> Self {
        // Pacific standard time.
        Self {
            earliest_hour: 6,
            latest_hour: 22,
            utc_offset_hours: -8,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    pub dir: String,
    pub sensor_file: String,
    pub effector_file: String,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            dir: "logs".into(),
            sensor_file: "sensors.csv".into(),
            effector_file: "effectors.csv".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub interval_hours: u64,
    pub repo_dir: String,
    pub remote: String,
    pub branch: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_hours: 6,
            repo_dir: ".".into(),
            remote: "origin".into(),
            branch: "main".into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Single ASCII character the firmware treats as "cycle every effector".
    /// Unset means no self-test at startup.
    pub self_test_byte: Option<String>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_serial(&mut errors);
        self.validate_quiet_hours(&mut errors);
        self.validate_logs(&mut errors);
        self.validate_sync(&mut errors);
        self.validate_device(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_serial(&self, errors: &mut Vec<String>) {
        if self.serial.port.trim().is_empty() {
            errors.push("serial: port is empty".into());
        }
        if self.serial.baud_rate == 0 {
            errors.push("serial: baud_rate must be positive".into());
        }
    }

    fn validate_quiet_hours(&self, errors: &mut Vec<String>) {
        let q = &self.quiet_hours;
        for (name, hour) in [("earliest_hour", q.earliest_hour), ("latest_hour", q.latest_hour)] {
            if hour > 23 {
                errors.push(format!("quiet_hours: {name} {hour} out of range [0, 23]"));
            }
        }
        if q.earliest_hour == q.latest_hour {
            errors.push(format!(
                "quiet_hours: earliest_hour and latest_hour are both {}, the loud window would be empty",
                q.earliest_hour
            ));
        }
        if !(-23..=23).contains(&q.utc_offset_hours) {
            errors.push(format!(
                "quiet_hours: utc_offset_hours {} out of range [-23, 23]",
                q.utc_offset_hours
            ));
        }
    }

    fn validate_logs(&self, errors: &mut Vec<String>) {
        let l = &self.logs;
        if l.dir.trim().is_empty() {
            errors.push("logs: dir is empty".into());
        }
        for (name, file) in [("sensor_file", &l.sensor_file), ("effector_file", &l.effector_file)] {
            if file.trim().is_empty() {
                errors.push(format!("logs: {name} is empty"));
            } else if file.contains('/') || file.contains('\\') {
                errors.push(format!("logs: {name} '{file}' must be a bare file name"));
            }
        }
        if l.sensor_file == l.effector_file {
            errors.push(format!(
                "logs: sensor_file and effector_file are both '{}'",
                l.sensor_file
            ));
        }
    }

    fn validate_sync(&self, errors: &mut Vec<String>) {
        let s = &self.sync;
        if !s.enabled {
            return;
        }
        if s.interval_hours == 0 {
            errors.push("sync: interval_hours must be positive".into());
        }
        if s.repo_dir.trim().is_empty() {
            errors.push("sync: repo_dir is empty".into());
        }
        if s.remote.trim().is_empty() {
            errors.push("sync: remote is empty".into());
        }
        if s.branch.trim().is_empty() {
            errors.push("sync: branch is empty".into());
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        let Some(raw) = &self.device.self_test_byte else {
            return;
        };
        match raw.as_bytes() {
            [b] if b.is_ascii_graphic() => {
                if is_reserved_byte(*b) {
                    errors.push(format!(
                        "device: self_test_byte '{raw}' collides with a protocol header or command byte"
                    ));
                }
            }
            _ => errors.push(format!(
                "device: self_test_byte {raw:?} must be a single printable ASCII character"
            )),
        }
    }

    // -- Typed accessors (only meaningful after validate) -------------------

    pub fn quiet_hours(&self) -> Result<QuietHours> {
        let q = &self.quiet_hours;
        let offset = UtcOffset::from_hms(q.utc_offset_hours, 0, 0)
            .with_context(|| format!("bad utc_offset_hours {}", q.utc_offset_hours))?;
        Ok(QuietHours::new(q.earliest_hour, q.latest_hour, offset))
    }

    pub fn self_test_byte(&self) -> Option<u8> {
        self.device
            .self_test_byte
            .as_deref()
            .and_then(|s| s.as_bytes().first().copied())
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
