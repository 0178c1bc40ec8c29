use chrono::{NaiveTime, Timelike};
use heapless::String;
use serde::{Deserialize, Serialize};
use ufmt::uwrite;

use crate::devices::Colour;
use crate::error::{ChamberError, ChamberResult};

/// Accepted temperature setpoint range in Celsius
pub const TEMPERATURE_RANGE: (f32, f32) = (0.0, 50.0);

/// Setpoints define the grower-selected targets for the chamber.
/// temperature: Target air temperature in Celsius
/// humidity: Target relative humidity percentage
/// co2_max: CO2 level in ppm above which the chamber is ventilated
/// light_schedules: Daily windows when the lights are on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setpoints {
    pub temperature: f32,
    pub humidity: f32,
    pub co2_max: f32,
    pub light_schedules: Vec<LightSchedule>,
}

impl Default for Setpoints {
    fn default() -> Self {
        Setpoints {
            temperature: 20.0, // Fruiting temperature for most oyster strains
            humidity: 85.0,
            co2_max: 800.0,
            // 08:00 - 17:00 with every channel dark until configured
            light_schedules: vec![LightSchedule::new(
                hm(8, 0),
                hm(17, 0),
                Colour::Off,
                0.0,
                0.0,
                0.0,
            )],
        }
    }
}

/// One daily lighting window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightSchedule {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    #[serde(default)]
    pub colour: Colour,
    #[serde(default)]
    pub neopixel: f32,
    #[serde(default)]
    pub white: f32,
    #[serde(default)]
    pub uv: f32,
}

impl LightSchedule {
    pub fn new(
        start: NaiveTime,
        end: NaiveTime,
        colour: Colour,
        neopixel: f32,
        white: f32,
        uv: f32,
    ) -> Self {
        Self {
            start,
            end,
            colour,
            neopixel,
            white,
            uv,
        }
    }

    /// Checks if the lights should be on
    /// A window whose end is before its start runs over midnight
    /// param now: The current wall-clock time
    pub fn is_active(&self, now: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= now && now <= self.end
        } else {
            now >= self.start || now <= self.end
        }
    }

    /// Formats the window: HH:MM-HH:MM
    pub fn window_label(&self) -> String<11> {
        let mut label: String<11> = String::new();
        uwrite!(
            label,
            "{}:{}-{}:{}",
            pad_number(self.start.hour() as u8).as_str(),
            pad_number(self.start.minute() as u8).as_str(),
            pad_number(self.end.hour() as u8).as_str(),
            pad_number(self.end.minute() as u8).as_str()
        )
        .ok();
        label
    }

    fn validate(&self) -> ChamberResult<()> {
        for (name, value) in [
            ("neopixel", self.neopixel),
            ("white", self.white),
            ("uv", self.uv),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(ChamberError::InvalidSetpoint(format!(
                    "{name} intensity must be between 0.0 and 1.0, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Partial setpoint change; absent fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetpointUpdate {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub co2_max: Option<f32>,
    pub light_schedules: Option<Vec<LightSchedule>>,
}

impl SetpointUpdate {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.humidity.is_none()
            && self.co2_max.is_none()
            && self.light_schedules.is_none()
    }
}

impl Setpoints {
    /// Gets the first schedule covering the given time
    pub fn active_schedule(&self, now: NaiveTime) -> Option<&LightSchedule> {
        self.light_schedules.iter().find(|s| s.is_active(now))
    }

    /// Applies a partial update; nothing changes unless every field is valid
    pub fn apply(&mut self, update: SetpointUpdate) -> ChamberResult<()> {
        let mut next = self.clone();
        if let Some(temperature) = update.temperature {
            next.temperature = temperature;
        }
        if let Some(humidity) = update.humidity {
            next.humidity = humidity;
        }
        if let Some(co2_max) = update.co2_max {
            next.co2_max = co2_max;
        }
        if let Some(schedules) = update.light_schedules {
            next.light_schedules = schedules;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn validate(&self) -> ChamberResult<()> {
        let (t_min, t_max) = TEMPERATURE_RANGE;
        if !self.temperature.is_finite() || self.temperature < t_min || self.temperature > t_max {
            return Err(ChamberError::InvalidSetpoint(format!(
                "temperature {} C is outside {t_min}-{t_max} C",
                self.temperature
            )));
        }
        if !self.humidity.is_finite() || !(0.0..=100.0).contains(&self.humidity) {
            return Err(ChamberError::InvalidSetpoint(format!(
                "humidity {}% is outside 0-100%",
                self.humidity
            )));
        }
        if !self.co2_max.is_finite() || self.co2_max <= 0.0 {
            return Err(ChamberError::InvalidSetpoint(format!(
                "co2_max must be positive, got {}",
                self.co2_max
            )));
        }
        self.light_schedules.iter().try_for_each(LightSchedule::validate)
    }
}

/// Gains for the Peltier temperature loop
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl Default for PidGains {
    fn default() -> Self {
        PidGains {
            kp: 2.0,
            ki: 0.1,
            kd: 0.5,
        }
    }
}

impl PidGains {
    /// Returns the gains with any provided values replaced
    pub fn with_updates(self, kp: Option<f32>, ki: Option<f32>, kd: Option<f32>) -> ChamberResult<Self> {
        let next = PidGains {
            kp: kp.unwrap_or(self.kp),
            ki: ki.unwrap_or(self.ki),
            kd: kd.unwrap_or(self.kd),
        };
        for (name, gain) in [("kp", next.kp), ("ki", next.ki), ("kd", next.kd)] {
            if !gain.is_finite() || gain < 0.0 {
                return Err(ChamberError::InvalidPid(format!(
                    "{name} must be a non-negative number, got {gain}"
                )));
            }
        }
        Ok(next)
    }
}

/// Pads a number with a zero before it if < 10
/// NOTE: Only supports values <100
/// param num: number to be padded
/// returns: String with formatted value
fn pad_number(num: u8) -> String<2> {
    let mut padded = String::new();
    if num < 10 {
        uwrite!(padded, "0{}", num).ok();
    } else {
        uwrite!(padded, "{}", num).ok();
    }
    padded
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default()
}

/// Serializes schedule times as "HH:MM"
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    /// Accepts "HH:MM" or "HH:MM:SS"
    pub fn parse(raw: &str) -> Result<NaiveTime, String> {
        NaiveTime::parse_from_str(raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
            .map_err(|_| format!("invalid time '{raw}', expected HH:MM"))
    }
}
