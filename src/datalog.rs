//! CSV data log.
//!
//! One row per log interval, appended to a file that gets a header the first
//! time it is written. Missing readings are empty fields.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::control::{Chamber, TIMESTAMP_FORMAT};
use crate::devices::Actuator;

pub const COLUMNS: [&str; 25] = [
    "timestamp",
    "system_state",
    "temp_setpoint",
    "humidity_setpoint",
    "co2_setpoint",
    "temp_probe1",
    "temp_probe2",
    "temp_probe3",
    "temp_dht",
    "temp_co2",
    "humidity",
    "co2_ppm",
    "peltier_mode",
    "peltier_duty",
    "peltier_enabled",
    "humidifier",
    "internal_fan",
    "vent_angle",
    "vent_fan_speed",
    "active_light_schedule",
    "neopixel_color",
    "neopixel_intensity",
    "white_intensity",
    "uv_intensity",
    "photo_mode",
];

/// One row of the log
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: String,
    pub system_state: String,
    pub temp_setpoint: f32,
    pub humidity_setpoint: f32,
    pub co2_setpoint: f32,
    pub temp_probes: [Option<f32>; 3],
    pub temp_dht: Option<f32>,
    pub temp_co2: Option<f32>,
    pub humidity: Option<f32>,
    pub co2_ppm: Option<f32>,
    pub peltier_mode: String,
    pub peltier_duty: f32,
    pub peltier_enabled: bool,
    pub humidifier: bool,
    pub internal_fan: bool,
    pub vent_angle: f32,
    pub vent_fan_speed: f32,
    pub active_light_schedule: Option<String>,
    pub neopixel_color: String,
    pub neopixel_intensity: f32,
    pub white_intensity: f32,
    pub uv_intensity: f32,
    pub photo_mode: bool,
}

impl LogRecord {
    /// Captures the chamber as it is now
    pub fn capture(chamber: &Chamber, now: DateTime<Local>) -> Self {
        let setpoints = chamber.setpoints();
        let readings = chamber.sensor_data();
        let probe = |name: &str| readings.temperatures.get(name).copied();
        let devices = chamber.devices();
        let peltier = devices.peltier_state();
        let (vent_angle, vent_fan_speed) = chamber.vent();
        let lights = chamber.lights();
        Self {
            timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
            system_state: chamber.state().to_string(),
            temp_setpoint: setpoints.temperature,
            humidity_setpoint: setpoints.humidity,
            co2_setpoint: setpoints.co2_max,
            temp_probes: [probe("Probe1"), probe("Probe2"), probe("Probe3")],
            temp_dht: chamber.climate_temperature(),
            temp_co2: probe(crate::control::CO2_SENSOR_KEY),
            humidity: readings.humidity,
            co2_ppm: readings.co2,
            peltier_mode: peltier.mode.as_str().to_string(),
            peltier_duty: peltier.duty_cycle,
            peltier_enabled: peltier.enabled,
            humidifier: devices.is_on(Actuator::Humidifier),
            internal_fan: devices.is_on(Actuator::InternalFan),
            vent_angle,
            vent_fan_speed,
            active_light_schedule: lights.schedule.clone(),
            neopixel_color: lights.colour.to_string(),
            neopixel_intensity: lights.brightness,
            white_intensity: devices.state(Actuator::WhiteLeds),
            uv_intensity: devices.state(Actuator::UvLeds),
            photo_mode: chamber.photo_mode(),
        }
    }

    fn fields(&self) -> Vec<String> {
        let opt = |v: Option<f32>| v.map(|v| v.to_string()).unwrap_or_default();
        let mut fields = vec![
            self.timestamp.clone(),
            self.system_state.clone(),
            self.temp_setpoint.to_string(),
            self.humidity_setpoint.to_string(),
            self.co2_setpoint.to_string(),
        ];
        fields.extend(self.temp_probes.iter().map(|t| opt(*t)));
        fields.extend([
            opt(self.temp_dht),
            opt(self.temp_co2),
            opt(self.humidity),
            opt(self.co2_ppm),
            self.peltier_mode.clone(),
            self.peltier_duty.to_string(),
            self.peltier_enabled.to_string(),
            self.humidifier.to_string(),
            self.internal_fan.to_string(),
            self.vent_angle.to_string(),
            self.vent_fan_speed.to_string(),
            self.active_light_schedule.clone().unwrap_or_default(),
            self.neopixel_color.clone(),
            self.neopixel_intensity.to_string(),
            self.white_intensity.to_string(),
            self.uv_intensity.to_string(),
            self.photo_mode.to_string(),
        ]);
        fields
    }

    /// Formats the record as one CSV line without the newline
    pub fn to_csv(&self) -> String {
        self.fields()
            .iter()
            .map(|f| escape(f))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Quotes a field holding a comma, quote or newline
pub fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

pub struct DataLogger {
    path: PathBuf,
}

impl DataLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &LogRecord) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "{}", COLUMNS.join(","))?;
        }
        writeln!(file, "{}", record.to_csv())
    }
}
