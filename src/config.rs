//! Configuration for the chamber controller.
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! environment variables:
//! - `CHAMBER_HOST`: Server bind address (default: "0.0.0.0")
//! - `CHAMBER_PORT`: Server port (default: 8080)
//! - `VIEWER_USER` / `VIEWER_PASS`: read-only dashboard login
//! - `ADMIN_USER` / `ADMIN_PASS`: login allowed to change the chamber

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::preferences::{PidGains, Setpoints};
use crate::timer::{CONTROL_DELAY, LOG_DELAY, SENSOR_DELAY, TICK_TIME_DELAY};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid environment: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChamberConfig {
    pub server: ServerConfig,
    pub control: ControlConfig,
    pub setpoints: Setpoints,
    pub pid: PidGains,
    pub hardware: HardwareConfig,
    pub datalog: DataLogConfig,
}

impl ChamberConfig {
    /// Loads the file if given, then applies environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        ServerOverrides::from_env()?.apply(&mut config.server);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.setpoints
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let control = &self.control;
        for (name, value) in [
            ("tick_ms", control.tick_ms),
            ("sensor_interval_ms", control.sensor_interval_ms),
            ("control_interval_ms", control.control_interval_ms),
            ("log_interval_ms", control.log_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("control.{name} must be positive")));
            }
        }
        if control.max_sensor_errors == 0 {
            return Err(ConfigError::Invalid(
                "control.max_sensor_errors must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("deadband", control.deadband),
            ("humidity_band", control.humidity_band),
            ("min_vent_fan", control.min_vent_fan),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "control.{name} must be a non-negative number"
                )));
            }
        }
        if control.min_vent_fan > 1.0 {
            return Err(ConfigError::Invalid(
                "control.min_vent_fan must be at most 1.0".to_string(),
            ));
        }
        if !control.co2_full_scale.is_finite() || control.co2_full_scale <= 0.0 {
            return Err(ConfigError::Invalid(
                "control.co2_full_scale must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.hardware.neopixel_brightness) {
            return Err(ConfigError::Invalid(
                "hardware.neopixel_brightness must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// `CHAMBER_`-prefixed environment overrides
#[derive(Debug, Default, Deserialize)]
pub struct ServerOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl ServerOverrides {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("CHAMBER_").from_env::<ServerOverrides>()
    }

    pub fn apply(self, server: &mut ServerConfig) {
        if let Some(host) = self.host {
            server.host = host;
        }
        if let Some(port) = self.port {
            server.port = port;
        }
    }
}

/// Loop cadence and control-law tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub tick_ms: u32,
    pub sensor_interval_ms: u32,
    pub control_interval_ms: u32,
    pub log_interval_ms: u32,
    /// PID output magnitude below which the Peltier idles
    pub deadband: f32,
    /// Humidity error (%RH) that switches the humidifier
    pub humidity_band: f32,
    /// CO2 excess (ppm) at which the vents are fully open
    pub co2_full_scale: f32,
    /// Slowest useful vent fan speed
    pub min_vent_fan: f32,
    pub condense_pulse_ms: u32,
    /// Rest after a condensation pulse before another may start
    pub condense_holdoff_ms: u32,
    /// The condensation pulse only runs while the chamber is within this
    /// many degrees below the temperature setpoint, or above it
    pub condense_margin: f32,
    /// Time the Peltier rests before reversing direction
    pub reversal_dwell_ms: u32,
    /// Consecutive climate read failures before entering the error state
    pub max_sensor_errors: u32,
    pub photo_default_secs: u64,
    /// Probe that reads the air inside the chamber
    pub chamber_probe: String,
    /// Enter the active state at startup instead of standby
    pub autostart: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_ms: TICK_TIME_DELAY,
            sensor_interval_ms: SENSOR_DELAY,
            control_interval_ms: CONTROL_DELAY,
            log_interval_ms: LOG_DELAY,
            deadband: 0.1,
            humidity_band: 40.0,
            co2_full_scale: 500.0,
            min_vent_fan: 0.4,
            condense_pulse_ms: 3500,
            condense_holdoff_ms: 2000,
            condense_margin: 2.0,
            reversal_dwell_ms: 10_000,
            max_sensor_errors: 5,
            photo_default_secs: 30,
            chamber_probe: "Probe2".to_string(),
            autostart: false,
        }
    }
}

/// BCM pin numbers and hardware PWM channels
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PinConfig {
    pub water_pump: u8,
    pub humidifier: u8,
    pub peltier_fan: u8,
    pub intake_fan: u8,
    pub outflow_fan: u8,
    pub internal_fan: u8,
    pub white_leds_channel: u8,
    pub uv_leds_channel: u8,
    pub servo_channel: u8,
    pub peltier_left_enable: u8,
    pub peltier_right_enable: u8,
    pub peltier_left_pwm: u8,
    pub peltier_right_pwm: u8,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            water_pump: 27,
            humidifier: 23,
            peltier_fan: 1,
            intake_fan: 16,
            outflow_fan: 21,
            internal_fan: 20,
            white_leds_channel: 0,
            uv_leds_channel: 1,
            servo_channel: 2,
            peltier_left_enable: 26,
            peltier_right_enable: 6,
            peltier_left_pwm: 5,
            peltier_right_pwm: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub pins: PinConfig,
    /// Low-trigger relay board on the pump and humidifier
    pub relay_active_low: bool,
    pub fan_pwm_hz: f64,
    pub peltier_pwm_hz: f64,
    pub led_pwm_hz: f64,
    pub servo_min_duty: f32,
    pub servo_max_duty: f32,
    pub neopixel_count: usize,
    pub neopixel_brightness: f32,
    /// One-wire sysfs directory
    pub w1_dir: PathBuf,
    /// DS18B20 id to friendly name
    pub probe_names: BTreeMap<String, String>,
    pub co2_port: PathBuf,
    pub co2_baud: u32,
    /// IIO directory of the dht11 kernel driver
    pub dht_dir: PathBuf,
    pub dht_retries: u32,
    pub dht_retry_delay_ms: u64,
    /// I2C bus of the GXHTC3 fallback sensor, if fitted
    pub gxhtc3_bus: Option<u8>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        let probe_names = [
            ("28-02f3d446c2fc", "Probe1"), // Bottom probe (cold side)
            ("28-3c01f0953a0b", "Probe2"), // Top probe (hot side)
            ("28-65b00087d215", "Probe3"), // Coil probe
        ]
        .into_iter()
        .map(|(id, name)| (id.to_string(), name.to_string()))
        .collect();
        Self {
            pins: PinConfig::default(),
            relay_active_low: false,
            fan_pwm_hz: 20.0,
            peltier_pwm_hz: 40.0,
            led_pwm_hz: 1000.0,
            servo_min_duty: 4.5,
            servo_max_duty: 10.0,
            neopixel_count: 12,
            neopixel_brightness: 0.2,
            w1_dir: PathBuf::from("/sys/bus/w1/devices"),
            probe_names,
            co2_port: PathBuf::from("/dev/serial0"),
            co2_baud: 9600,
            dht_dir: PathBuf::from("/sys/bus/iio/devices/iio:device0"),
            dht_retries: 3,
            dht_retry_delay_ms: 1000,
            gxhtc3_bus: Some(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataLogConfig {
    /// CSV file; logging is off when unset
    pub path: Option<PathBuf>,
}

impl Default for DataLogConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("mushroom_chamber_data.csv")),
        }
    }
}

/// Dashboard logins, read from `VIEWER_USER`, `VIEWER_PASS`, `ADMIN_USER`, `ADMIN_PASS`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    pub viewer_user: Option<String>,
    pub viewer_pass: Option<String>,
    pub admin_user: Option<String>,
    pub admin_pass: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env::<Credentials>()
    }
}
