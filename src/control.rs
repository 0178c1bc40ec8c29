//! The chamber core: state machine and control laws.
//!
//! [`Chamber`] owns the actuators and the latest readings. The runtime feeds it
//! sensor reports and elapsed time; every control interval it runs the
//! temperature, humidity, CO2 and light laws in that order.
//!
//! The Peltier is never reversed directly. Switching between heating and
//! cooling first stops the module, then holds it off for the reversal dwell.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, TimeDelta, Timelike};
use heapless::Deque;
use serde::{Deserialize, Serialize};

use crate::config::{ChamberConfig, ControlConfig};
use crate::devices::{Actuator, Colour, DeviceController, PeltierMode, PeltierState};
use crate::error::{ChamberError, ChamberResult, DeviceError};
use crate::pid::Pid;
use crate::preferences::{LightSchedule, PidGains, SetpointUpdate, Setpoints};
use crate::sensors::{ClimateSource, SensorReport};
use crate::timer::CountDownTimer;

/// Entries kept in the recent-error ring
pub const ERROR_CAPACITY: usize = 20;
pub const PID_LIMITS: (f32, f32) = (-1.0, 1.0);
pub const CO2_SENSOR_KEY: &str = "CO2_Sensor";

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemState {
    Standby,
    Active,
    Error,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Standby => "standby",
            SystemState::Active => "active",
            SystemState::Error => "error",
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemState {
    type Err = ChamberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standby" => Ok(SystemState::Standby),
            "active" => Ok(SystemState::Active),
            "error" => Ok(SystemState::Error),
            _ => Err(ChamberError::InvalidState(s.to_string())),
        }
    }
}

/// Temperature key for a climate reading
pub fn climate_key(source: ClimateSource) -> &'static str {
    match source {
        ClimateSource::Dht22 | ClimateSource::Simulated => "DHT_Sensor",
        ClimateSource::Gxhtc3 => "GXHTC3_Sensor",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEntry {
    pub timestamp: String,
    pub message: String,
}

/// Latest sensor values
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorData {
    pub temperatures: BTreeMap<String, f32>,
    pub humidity: Option<f32>,
    pub co2: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PidParameters {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    pub setpoint: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LightStatus {
    pub colour: Colour,
    pub brightness: f32,
    pub white: f32,
    pub uv: f32,
    /// Window label of the schedule in effect
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuatorStatus {
    pub peltier: PeltierState,
    pub servo_angle: f32,
    pub vent_fan_speed: f32,
    pub humidifier: bool,
    pub internal_fan: bool,
    pub lights: LightStatus,
    pub channels: BTreeMap<Actuator, f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlStatus {
    pub system_state: SystemState,
    pub setpoints: Setpoints,
    pub actuators: ActuatorStatus,
    pub photo_mode: bool,
    pub condensing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub timestamp: String,
    #[serde(flatten)]
    pub control: ControlStatus,
    pub sensors: SensorData,
    pub errors: Vec<ErrorEntry>,
}

pub struct Chamber {
    devices: DeviceController,
    config: ControlConfig,
    state: SystemState,
    setpoints: Setpoints,
    pid: Pid,
    readings: SensorData,
    climate_temperature: Option<f32>,
    vent_angle: f32,
    vent_fan_speed: f32,
    lights: LightStatus,
    errors: Deque<ErrorEntry, ERROR_CAPACITY>,
    climate_failures: u32,
    control_timer: CountDownTimer,
    control_elapsed_ms: u32,
    photo_timer: Option<CountDownTimer>,
    condense_timer: Option<CountDownTimer>,
    condense_holdoff: CountDownTimer,
    /// Direction of the last drive, kept after stopping so reversals can be spotted
    last_direction: PeltierMode,
    reversal_timer: CountDownTimer,
}

impl Chamber {
    pub fn new(devices: DeviceController, config: &ChamberConfig) -> Self {
        let state = if config.control.autostart {
            SystemState::Active
        } else {
            SystemState::Standby
        };
        Self {
            devices,
            config: config.control.clone(),
            state,
            setpoints: config.setpoints.clone(),
            pid: Pid::new(config.pid, PID_LIMITS),
            readings: SensorData::default(),
            climate_temperature: None,
            vent_angle: 0.0,
            vent_fan_speed: 0.0,
            lights: LightStatus {
                colour: Colour::Off,
                brightness: 0.0,
                white: 0.0,
                uv: 0.0,
                schedule: None,
            },
            errors: Deque::new(),
            climate_failures: 0,
            control_timer: CountDownTimer::finished(),
            control_elapsed_ms: 0,
            photo_timer: None,
            condense_timer: None,
            condense_holdoff: CountDownTimer::finished(),
            last_direction: PeltierMode::Off,
            reversal_timer: CountDownTimer::finished(),
        }
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn setpoints(&self) -> &Setpoints {
        &self.setpoints
    }

    pub fn devices(&self) -> &DeviceController {
        &self.devices
    }

    pub fn photo_mode(&self) -> bool {
        self.photo_timer.is_some()
    }

    pub fn condensing(&self) -> bool {
        self.condense_timer.is_some()
    }

    pub fn vent(&self) -> (f32, f32) {
        (self.vent_angle, self.vent_fan_speed)
    }

    pub fn lights(&self) -> &LightStatus {
        &self.lights
    }

    /// Temperature the PID regulates
    pub fn climate_temperature(&self) -> Option<f32> {
        self.climate_temperature
    }

    /// Folds one polling round into the readings
    pub fn apply_report(&mut self, report: SensorReport) {
        match report.probes {
            Ok(probes) => {
                for probe in probes {
                    self.readings.temperatures.insert(probe.name, probe.celsius);
                }
            }
            Err(e) => tracing::warn!(error = %e, "temperature probe read failed"),
        }

        match report.co2 {
            Ok(reading) => {
                self.readings
                    .temperatures
                    .insert(CO2_SENSOR_KEY.to_string(), reading.temperature as f32);
                // Zero ppm is the sensor warming up, the temperature is still good
                if reading.co2_ppm > 0 {
                    self.readings.co2 = Some(reading.co2_ppm as f32);
                } else {
                    tracing::warn!("ignoring zero CO2 reading");
                }
            }
            Err(e) => tracing::warn!(error = %e, "CO2 read failed"),
        }

        match report.climate {
            Ok(reading) => {
                self.readings.humidity = Some(reading.humidity);
                self.readings
                    .temperatures
                    .insert(climate_key(reading.source).to_string(), reading.celsius);
                self.climate_temperature = Some(reading.celsius);
                self.climate_failures = 0;
            }
            Err(e) => {
                self.climate_failures += 1;
                tracing::warn!(
                    error = %e,
                    failures = self.climate_failures,
                    "climate read failed"
                );
                if self.climate_failures >= self.config.max_sensor_errors
                    && self.state != SystemState::Error
                {
                    self.record_error(format!(
                        "Climate sensor failed {} times in a row: {e}",
                        self.climate_failures
                    ));
                    self.state = SystemState::Error;
                    self.safe_shutdown();
                }
            }
        }
    }

    /// Advances timers and runs the control laws when due
    /// param elapsed_ms: time since the previous tick
    /// param now: wall clock, used for light schedules
    pub fn tick(&mut self, elapsed_ms: u32, now: DateTime<Local>) {
        self.control_timer.tick(elapsed_ms);
        self.control_elapsed_ms = self.control_elapsed_ms.saturating_add(elapsed_ms);
        self.reversal_timer.tick(elapsed_ms);
        self.condense_holdoff.tick(elapsed_ms);

        if let Some(timer) = self.condense_timer.as_mut() {
            timer.tick(elapsed_ms);
            if timer.is_finished() {
                if let Err(e) = self.end_condensation() {
                    self.record_error(format!("Ending condensation pulse failed: {e}"));
                }
            }
        }

        if let Some(timer) = self.photo_timer.as_mut() {
            timer.tick(elapsed_ms);
            if timer.is_finished() {
                self.photo_timer = None;
                tracing::info!("photo mode ended");
                let restored = if self.state == SystemState::Active {
                    self.apply_lights(now)
                } else {
                    self.set_lights(Colour::Off, 0.0, 0.0, 0.0, None)
                };
                if let Err(e) = restored {
                    self.record_error(format!("Restoring lights failed: {e}"));
                }
            }
        }

        if self.control_timer.is_finished() {
            self.control_timer.set_time(self.config.control_interval_ms);
            let dt = self.control_elapsed_ms as f32 / 1000.0;
            self.control_elapsed_ms = 0;
            if self.state == SystemState::Active {
                self.control_step(dt, now);
            }
        }
    }

    fn control_step(&mut self, dt: f32, now: DateTime<Local>) {
        let results = [
            ("temperature", self.control_temperature(dt)),
            ("humidity", self.control_humidity()),
            ("co2", self.control_co2()),
            ("lights", self.apply_lights(now)),
        ];
        for (law, result) in results {
            if let Err(e) = result {
                self.record_error(format!("{law} control failed: {e}"));
            }
        }
    }

    fn control_temperature(&mut self, dt: f32) -> Result<(), DeviceError> {
        if self.condense_timer.is_some() {
            return Ok(());
        }
        let Some(measured) = self.climate_temperature else {
            return Ok(());
        };
        let output = self.pid.compute(self.setpoints.temperature, measured, dt);

        if output.abs() < self.config.deadband {
            self.stop_peltier()?;
            self.devices.turn_off(Actuator::PeltierFan)?;
            return self.devices.turn_off(Actuator::WaterPump);
        }

        let wanted = if output > 0.0 {
            PeltierMode::Heat
        } else {
            PeltierMode::Cool
        };
        if self.last_direction != PeltierMode::Off && self.last_direction != wanted {
            if self.devices.peltier_state().mode != PeltierMode::Off {
                tracing::info!(
                    from = self.last_direction.as_str(),
                    to = wanted.as_str(),
                    "reversing Peltier, holding off first"
                );
                self.stop_peltier()?;
            }
            if !self.reversal_timer.is_finished() {
                return Ok(());
            }
        }
        self.drive_peltier(output.abs(), wanted)
    }

    fn control_humidity(&mut self) -> Result<(), DeviceError> {
        let Some(humidity) = self.readings.humidity else {
            return Ok(());
        };
        let error = self.setpoints.humidity - humidity;
        let band = self.config.humidity_band;
        if error > band {
            self.devices.turn_on(Actuator::Humidifier)?;
            self.devices.turn_on(Actuator::InternalFan)
        } else if error < -band {
            self.devices.turn_off(Actuator::Humidifier)?;
            self.devices.turn_off(Actuator::InternalFan)?;
            let chamber = self.readings.temperatures.get(&self.config.chamber_probe).copied();
            let threshold = self.setpoints.temperature - self.config.condense_margin;
            if matches!(chamber, Some(t) if t > threshold)
                && self.condense_timer.is_none()
                && self.condense_holdoff.is_finished()
                && !self.is_heating()
            {
                self.start_condensation()?;
            }
            Ok(())
        } else {
            self.devices.turn_off(Actuator::Humidifier)?;
            self.devices.turn_on(Actuator::InternalFan)
        }
    }

    fn control_co2(&mut self) -> Result<(), DeviceError> {
        let Some(co2) = self.readings.co2 else {
            return Ok(());
        };
        let excess = co2 - self.setpoints.co2_max;
        let (angle, fan) = if excess > 0.0 {
            let ratio = (excess / self.config.co2_full_scale).min(1.0);
            ((180.0 * ratio).floor(), ratio.max(self.config.min_vent_fan))
        } else {
            (0.0, 0.0)
        };
        self.devices.set_servo_angle(angle)?;
        self.devices.set_pwm(Actuator::IntakeFan, fan)?;
        self.devices.set_pwm(Actuator::OutflowFan, fan)?;
        self.vent_angle = angle;
        self.vent_fan_speed = fan;
        Ok(())
    }

    /// Photo mode first, then the active schedule, else dark
    fn apply_lights(&mut self, now: DateTime<Local>) -> Result<(), DeviceError> {
        if self.photo_timer.is_some() {
            return self.set_lights(Colour::White, 1.0, 1.0, 0.0, None);
        }
        match self.setpoints.active_schedule(now.time()).cloned() {
            Some(schedule) => self.set_lights(
                schedule.colour,
                schedule.neopixel,
                schedule.white,
                schedule.uv,
                Some(schedule.window_label().as_str().to_string()),
            ),
            None => self.set_lights(Colour::Off, 0.0, 0.0, 0.0, None),
        }
    }

    fn set_lights(
        &mut self,
        colour: Colour,
        brightness: f32,
        white: f32,
        uv: f32,
        schedule: Option<String>,
    ) -> Result<(), DeviceError> {
        self.devices.set_neopixel_brightness(brightness)?;
        self.devices.set_neopixel_color(colour, None)?;
        self.devices.set_pwm(Actuator::WhiteLeds, white)?;
        self.devices.set_pwm(Actuator::UvLeds, uv)?;
        self.lights = LightStatus {
            colour,
            brightness,
            white,
            uv,
            schedule,
        };
        Ok(())
    }

    fn is_heating(&self) -> bool {
        self.last_direction == PeltierMode::Heat
            && (self.devices.peltier_state().mode == PeltierMode::Heat
                || !self.reversal_timer.is_finished())
    }

    fn drive_peltier(&mut self, power: f32, mode: PeltierMode) -> Result<(), DeviceError> {
        self.devices.peltier_enable()?;
        self.devices.turn_on(Actuator::PeltierFan)?;
        self.devices.turn_on(Actuator::WaterPump)?;
        self.devices.set_peltier(power, mode)?;
        self.last_direction = mode;
        Ok(())
    }

    /// Stops and disables the Peltier; the reversal dwell starts if it was running
    fn stop_peltier(&mut self) -> Result<(), DeviceError> {
        if self.devices.peltier_state().mode != PeltierMode::Off {
            self.reversal_timer.set_time(self.config.reversal_dwell_ms);
        }
        self.devices.set_peltier(0.0, PeltierMode::Off)
    }

    fn start_condensation(&mut self) -> Result<(), DeviceError> {
        tracing::info!(
            duration_ms = self.config.condense_pulse_ms,
            "starting condensation pulse"
        );
        self.condense_timer = Some(CountDownTimer::new(self.config.condense_pulse_ms));
        self.drive_peltier(1.0, PeltierMode::Cool)
    }

    fn end_condensation(&mut self) -> Result<(), DeviceError> {
        self.condense_timer = None;
        self.condense_holdoff.set_time(self.config.condense_holdoff_ms);
        tracing::debug!("condensation pulse finished");
        self.stop_peltier()?;
        self.devices.turn_off(Actuator::PeltierFan)?;
        self.devices.turn_off(Actuator::WaterPump)
    }

    /// Turns every output off, carrying on past individual failures
    pub fn safe_shutdown(&mut self) {
        tracing::info!("performing safe shutdown");
        if self.devices.peltier_state().mode != PeltierMode::Off {
            self.reversal_timer.set_time(self.config.reversal_dwell_ms);
        }
        for e in self.devices.all_off() {
            tracing::error!(error = %e, "device failed to shut down");
        }
        self.condense_timer = None;
        self.photo_timer = None;
        self.vent_angle = 0.0;
        self.vent_fan_speed = 0.0;
        self.lights = LightStatus {
            colour: Colour::Off,
            brightness: self.devices.neopixel_brightness(),
            white: 0.0,
            uv: 0.0,
            schedule: None,
        };
    }

    pub fn emergency_stop(&mut self) {
        tracing::error!("EMERGENCY STOP");
        self.record_error("Emergency stop activated");
        self.state = SystemState::Standby;
        self.safe_shutdown();
    }

    pub fn set_state(&mut self, state: &str) -> ChamberResult<()> {
        let state: SystemState = state.parse()?;
        self.set_system_state(state);
        Ok(())
    }

    pub fn set_system_state(&mut self, state: SystemState) {
        tracing::info!(from = %self.state, to = %state, "system state change");
        self.state = state;
        match state {
            SystemState::Active => {
                self.climate_failures = 0;
                self.pid.reset();
                self.control_timer = CountDownTimer::finished();
            }
            SystemState::Standby | SystemState::Error => self.safe_shutdown(),
        }
    }

    /// Lights the chamber for a photo, overriding the schedule
    /// param duration_s: seconds before the schedule takes over again
    pub fn trigger_photo_mode(&mut self, duration_s: u64) -> ChamberResult<()> {
        if duration_s == 0 {
            return Err(ChamberError::InvalidSetpoint(
                "photo duration must be positive".to_string(),
            ));
        }
        let ms = u32::try_from(duration_s.saturating_mul(1000)).unwrap_or(u32::MAX);
        self.photo_timer = Some(CountDownTimer::new(ms));
        tracing::info!(duration_s, "photo mode started");
        self.set_lights(Colour::White, 1.0, 1.0, 0.0, None)?;
        Ok(())
    }

    pub fn update_setpoints(&mut self, update: SetpointUpdate) -> ChamberResult<()> {
        if update.is_empty() {
            return Err(ChamberError::InvalidSetpoint(
                "no setpoint fields provided".to_string(),
            ));
        }
        self.setpoints.apply(update)?;
        tracing::info!(
            temperature = self.setpoints.temperature,
            humidity = self.setpoints.humidity,
            co2_max = self.setpoints.co2_max,
            schedules = self.setpoints.light_schedules.len(),
            "setpoints updated"
        );
        Ok(())
    }

    pub fn set_light_schedules(&mut self, schedules: Vec<LightSchedule>) -> ChamberResult<()> {
        self.update_setpoints(SetpointUpdate {
            light_schedules: Some(schedules),
            ..SetpointUpdate::default()
        })
    }

    /// Replaces the schedules with a one hour window starting now
    pub fn set_light_wavelengths(
        &mut self,
        colour: Colour,
        neopixel: f32,
        white: f32,
        uv: f32,
        now: DateTime<Local>,
    ) -> ChamberResult<()> {
        let time = now.time();
        let start = time
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(time);
        let end = start + TimeDelta::hours(1);
        self.set_light_schedules(vec![LightSchedule::new(
            start, end, colour, neopixel, white, uv,
        )])?;
        if self.state == SystemState::Active && self.photo_timer.is_none() {
            self.apply_lights(now)?;
        }
        Ok(())
    }

    pub fn pid_parameters(&self) -> PidParameters {
        let PidGains { kp, ki, kd } = self.pid.gains();
        PidParameters {
            kp,
            ki,
            kd,
            setpoint: self.setpoints.temperature,
        }
    }

    pub fn update_pid(
        &mut self,
        kp: Option<f32>,
        ki: Option<f32>,
        kd: Option<f32>,
    ) -> ChamberResult<PidGains> {
        let gains = self.pid.gains().with_updates(kp, ki, kd)?;
        self.pid.set_gains(gains);
        tracing::info!(kp = gains.kp, ki = gains.ki, kd = gains.kd, "PID gains updated");
        Ok(gains)
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        let entry = ErrorEntry {
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            message: message.into(),
        };
        tracing::error!(message = %entry.message, "chamber error");
        if self.errors.is_full() {
            self.errors.pop_front();
        }
        // Cannot fail after making room
        let _ = self.errors.push_back(entry);
    }

    pub fn errors(&self) -> Vec<ErrorEntry> {
        self.errors.iter().cloned().collect()
    }

    pub fn sensor_data(&self) -> SensorData {
        self.readings.clone()
    }

    pub fn control_status(&self) -> ControlStatus {
        ControlStatus {
            system_state: self.state,
            setpoints: self.setpoints.clone(),
            actuators: ActuatorStatus {
                peltier: self.devices.peltier_state(),
                servo_angle: self.devices.servo_angle(),
                vent_fan_speed: self.vent_fan_speed,
                humidifier: self.devices.is_on(Actuator::Humidifier),
                internal_fan: self.devices.is_on(Actuator::InternalFan),
                lights: self.lights.clone(),
                channels: self.devices.levels().clone(),
            },
            photo_mode: self.photo_mode(),
            condensing: self.condensing(),
        }
    }

    pub fn system_status(&self, now: DateTime<Local>) -> SystemStatus {
        SystemStatus {
            timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
            control: self.control_status(),
            sensors: self.sensor_data(),
            errors: self.errors(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::config::HardwareConfig;
    use crate::error::SensorError;
    use crate::hardware::sim::SimBoard;
    use crate::preferences::hhmm;
    use crate::sensors::{ClimateReading, Co2Reading, ProbeReading};

    fn chamber_with(config: ChamberConfig) -> (SimBoard, Chamber) {
        let board = SimBoard::new();
        let devices = board.build_devices(&HardwareConfig::default()).unwrap();
        let mut chamber = Chamber::new(devices, &config);
        chamber.set_system_state(SystemState::Active);
        (board, chamber)
    }

    fn chamber() -> (SimBoard, Chamber) {
        chamber_with(ChamberConfig::default())
    }

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 1, hour, minute, 0).unwrap()
    }

    fn co2(ppm: u16) -> Result<Co2Reading, SensorError> {
        Ok(Co2Reading {
            co2_ppm: ppm,
            temperature: 21,
            raw_temperature: 61,
            status: 0,
            ticks_high: 0,
            ticks_low: 0,
        })
    }

    fn report(celsius: f32, humidity: f32, ppm: u16) -> SensorReport {
        SensorReport {
            probes: Ok(vec![ProbeReading {
                name: "Probe2".to_string(),
                celsius,
            }]),
            co2: co2(ppm),
            climate: Ok(ClimateReading {
                celsius,
                humidity,
                source: ClimateSource::Dht22,
            }),
        }
    }

    fn failed_climate() -> SensorReport {
        SensorReport {
            probes: Err(SensorError::NoDevices("DS18B20")),
            co2: Err(SensorError::Bus("timeout".to_string())),
            climate: Err(SensorError::Exhausted {
                sensor: "DHT22",
                attempts: 3,
            }),
        }
    }

    #[test]
    fn test_state_parse() {
        assert_eq!("Active".parse::<SystemState>().unwrap(), SystemState::Active);
        assert!(matches!(
            "running".parse::<SystemState>(),
            Err(ChamberError::InvalidState(_))
        ));
    }

    #[test]
    fn test_no_control_before_first_reading() {
        let (board, mut chamber) = chamber();
        chamber.tick(2000, at(20, 0));
        assert_eq!(chamber.devices().peltier_state().mode, PeltierMode::Off);
        assert!(!board.is_high("humidifier"));
        assert_eq!(chamber.vent(), (0.0, 0.0));
    }

    #[test]
    fn test_heats_when_cold() {
        let (board, mut chamber) = chamber();
        chamber.apply_report(report(15.0, 85.0, 600));
        chamber.tick(2000, at(20, 0));
        let peltier = chamber.devices().peltier_state();
        assert_eq!(peltier.mode, PeltierMode::Heat);
        assert!(peltier.enabled);
        assert!(board.level("peltier_left_pwm") > 0.0);
        assert_eq!(board.level("peltier_right_pwm"), 0.0);
        assert!(chamber.devices().is_on(Actuator::PeltierFan));
        assert!(chamber.devices().is_on(Actuator::WaterPump));
    }

    #[test]
    fn test_deadband_idles_peltier() {
        let (_board, mut chamber) = chamber();
        chamber.apply_report(report(20.0, 85.0, 600));
        chamber.tick(2000, at(20, 0));
        let peltier = chamber.devices().peltier_state();
        assert_eq!(peltier.mode, PeltierMode::Off);
        assert!(!peltier.enabled);
        assert!(!chamber.devices().is_on(Actuator::PeltierFan));
        assert!(!chamber.devices().is_on(Actuator::WaterPump));
    }

    #[test]
    fn test_reversal_holds_off_for_dwell() {
        let (board, mut chamber) = chamber();
        chamber.apply_report(report(15.0, 85.0, 600));
        chamber.tick(2000, at(20, 0));
        assert_eq!(chamber.devices().peltier_state().mode, PeltierMode::Heat);

        chamber.apply_report(report(25.0, 85.0, 600));
        for _ in 0..5 {
            chamber.tick(2000, at(20, 0));
            let peltier = chamber.devices().peltier_state();
            assert_eq!(peltier.mode, PeltierMode::Off);
            assert!(!peltier.enabled);
            assert_eq!(board.level("peltier_left_pwm"), 0.0);
            assert_eq!(board.level("peltier_right_pwm"), 0.0);
            // Heat is still carried away while the bridge rests
            assert!(board.level(Actuator::PeltierFan.as_str()) > 0.0);
            assert!(board.is_high(Actuator::WaterPump.as_str()));
        }
        chamber.tick(2000, at(20, 0));
        assert_eq!(chamber.devices().peltier_state().mode, PeltierMode::Cool);
    }

    #[test]
    fn test_humidity_bands() {
        let mut config = ChamberConfig::default();
        config.control.humidity_band = 5.0;
        let (board, mut chamber) = chamber_with(config);

        chamber.apply_report(report(20.0, 70.0, 600));
        chamber.tick(2000, at(20, 0));
        assert!(board.is_high("humidifier"));
        assert!(chamber.devices().is_on(Actuator::InternalFan));

        chamber.apply_report(report(20.0, 83.0, 600));
        chamber.tick(2000, at(20, 0));
        assert!(!board.is_high("humidifier"));
        assert!(chamber.devices().is_on(Actuator::InternalFan));
    }

    #[test]
    fn test_condensation_pulse() {
        let mut config = ChamberConfig::default();
        config.control.humidity_band = 5.0;
        let (board, mut chamber) = chamber_with(config);

        chamber.apply_report(report(20.0, 95.0, 600));
        chamber.tick(2000, at(20, 0));
        assert!(chamber.condensing());
        assert!(!chamber.devices().is_on(Actuator::Humidifier));
        assert!(!chamber.devices().is_on(Actuator::InternalFan));
        let peltier = chamber.devices().peltier_state();
        assert_eq!(peltier.mode, PeltierMode::Cool);
        assert_eq!(peltier.duty_cycle, 1.0);
        assert!((board.level("peltier_right_pwm") - 1.0).abs() < 1e-6);

        // Temperature control yields while the pulse runs
        chamber.tick(2000, at(20, 0));
        assert!(chamber.condensing());
        assert_eq!(chamber.devices().peltier_state().mode, PeltierMode::Cool);
    }

    #[test]
    fn test_condensation_pulse_finishes() {
        let mut config = ChamberConfig::default();
        config.control.humidity_band = 5.0;
        config.control.control_interval_ms = 60_000;
        let (_board, mut chamber) = chamber_with(config);

        chamber.apply_report(report(20.0, 95.0, 600));
        chamber.tick(100, at(20, 0));
        assert!(chamber.condensing());
        chamber.tick(3500, at(20, 0));
        assert!(!chamber.condensing());
        assert_eq!(chamber.devices().peltier_state().mode, PeltierMode::Off);
        assert!(!chamber.devices().is_on(Actuator::WaterPump));
    }

    #[test]
    fn test_condensation_rests_between_pulses() {
        let mut config = ChamberConfig::default();
        config.control.humidity_band = 5.0;
        config.control.control_interval_ms = 1000;
        let (_board, mut chamber) = chamber_with(config);

        chamber.apply_report(report(20.0, 95.0, 600));
        chamber.tick(1000, at(20, 0));
        assert!(chamber.condensing());
        for _ in 0..3 {
            chamber.tick(1000, at(20, 0));
        }
        // Pulse ended on this tick; the control step that follows must not re-arm
        chamber.tick(1000, at(20, 0));
        assert!(!chamber.condensing());
        chamber.tick(1000, at(20, 0));
        assert!(!chamber.condensing());
        chamber.tick(1000, at(20, 0));
        assert!(chamber.condensing());
    }

    #[test]
    fn test_no_condensation_while_heating() {
        let mut config = ChamberConfig::default();
        config.control.humidity_band = 5.0;
        let (_board, mut chamber) = chamber_with(config);

        // Probe2 is warm but the air sensor says the chamber is cold
        chamber.apply_report(SensorReport {
            probes: Ok(vec![ProbeReading {
                name: "Probe2".to_string(),
                celsius: 21.0,
            }]),
            co2: co2(600),
            climate: Ok(ClimateReading {
                celsius: 15.0,
                humidity: 95.0,
                source: ClimateSource::Dht22,
            }),
        });
        chamber.tick(2000, at(20, 0));
        assert_eq!(chamber.devices().peltier_state().mode, PeltierMode::Heat);
        assert!(!chamber.condensing());
    }

    #[test]
    fn test_co2_venting() {
        let (board, mut chamber) = chamber();
        chamber.apply_report(report(20.0, 85.0, 1050));
        chamber.tick(2000, at(20, 0));
        assert_eq!(chamber.vent(), (90.0, 0.5));
        assert_eq!(chamber.devices().servo_angle(), 90.0);
        assert!((board.level("outflow_fan") - 0.5).abs() < 0.001);

        chamber.apply_report(report(20.0, 85.0, 820));
        chamber.tick(2000, at(20, 0));
        assert_eq!(chamber.vent(), (7.0, 0.4));

        chamber.apply_report(report(20.0, 85.0, 2000));
        chamber.tick(2000, at(20, 0));
        assert_eq!(chamber.vent(), (180.0, 1.0));

        chamber.apply_report(report(20.0, 85.0, 700));
        chamber.tick(2000, at(20, 0));
        assert_eq!(chamber.vent(), (0.0, 0.0));
        assert_eq!(board.level("intake_fan"), 0.0);
    }

    #[test]
    fn test_zero_co2_keeps_ppm_but_stores_temperature() {
        let (_board, mut chamber) = chamber();
        chamber.apply_report(report(20.0, 85.0, 900));
        assert_eq!(chamber.sensor_data().temperatures[CO2_SENSOR_KEY], 21.0);

        let mut warming_up = report(20.0, 85.0, 0);
        if let Ok(reading) = warming_up.co2.as_mut() {
            reading.temperature = 30;
        }
        chamber.apply_report(warming_up);
        assert_eq!(chamber.sensor_data().co2, Some(900.0));
        assert_eq!(chamber.sensor_data().temperatures[CO2_SENSOR_KEY], 30.0);
    }

    fn blue_day() -> LightSchedule {
        LightSchedule::new(
            hhmm::parse("08:00").unwrap(),
            hhmm::parse("17:00").unwrap(),
            Colour::Blue,
            0.5,
            0.3,
            0.1,
        )
    }

    #[test]
    fn test_schedule_drives_lights() {
        let (board, mut chamber) = chamber();
        chamber.set_light_schedules(vec![blue_day()]).unwrap();

        chamber.tick(2000, at(9, 0));
        assert!((board.level("white_leds") - 0.3).abs() < 0.001);
        assert!((board.level("uv_leds") - 0.1).abs() < 0.001);
        assert_eq!(chamber.lights().colour, Colour::Blue);
        assert_eq!(chamber.lights().schedule.as_deref(), Some("08:00-17:00"));
        assert_eq!(chamber.devices().neopixel_brightness(), 0.5);

        chamber.tick(2000, at(18, 0));
        assert_eq!(board.level("white_leds"), 0.0);
        assert_eq!(chamber.lights().colour, Colour::Off);
        assert!(chamber.lights().schedule.is_none());
    }

    #[test]
    fn test_photo_mode_overrides_then_restores() {
        let (board, mut chamber) = chamber();
        chamber.set_light_schedules(vec![blue_day()]).unwrap();
        chamber.trigger_photo_mode(30).unwrap();
        assert!(chamber.photo_mode());
        assert_eq!(board.level("white_leds"), 1.0);

        chamber.tick(2000, at(9, 0));
        assert_eq!(chamber.lights().colour, Colour::White);

        chamber.tick(28_000, at(9, 0));
        assert!(!chamber.photo_mode());
        assert_eq!(chamber.lights().colour, Colour::Blue);
        assert!((board.level("white_leds") - 0.3).abs() < 0.001);
    }

    #[test]
    fn test_photo_mode_expiry_in_standby_stays_dark() {
        let (board, mut chamber) = chamber();
        chamber.set_light_schedules(vec![blue_day()]).unwrap();
        chamber.set_system_state(SystemState::Standby);
        chamber.trigger_photo_mode(5).unwrap();
        assert_eq!(board.level("white_leds"), 1.0);

        chamber.tick(5000, at(9, 0));
        assert!(!chamber.photo_mode());
        assert_eq!(chamber.lights().colour, Colour::Off);
        assert_eq!(board.level("white_leds"), 0.0);
        assert_eq!(board.level("uv_leds"), 0.0);
    }

    #[test]
    fn test_photo_mode_needs_duration() {
        let (_board, mut chamber) = chamber();
        assert!(chamber.trigger_photo_mode(0).is_err());
    }

    #[test]
    fn test_light_wavelengths_wrap_midnight() {
        let (board, mut chamber) = chamber();
        chamber
            .set_light_wavelengths(Colour::Red, 0.8, 0.2, 0.0, at(23, 30))
            .unwrap();
        let schedule = &chamber.setpoints().light_schedules[0];
        assert_eq!(schedule.window_label().as_str(), "23:30-00:30");
        assert_eq!(chamber.lights().colour, Colour::Red);
        assert!((board.level("white_leds") - 0.2).abs() < 0.001);
        assert!(schedule.is_active(hhmm::parse("00:15").unwrap()));
    }

    #[test]
    fn test_climate_failures_enter_error_state() {
        let (_board, mut chamber) = chamber();
        chamber.apply_report(report(15.0, 85.0, 600));
        chamber.tick(2000, at(20, 0));
        assert_eq!(chamber.devices().peltier_state().mode, PeltierMode::Heat);

        for _ in 0..4 {
            chamber.apply_report(failed_climate());
        }
        assert_eq!(chamber.state(), SystemState::Active);
        chamber.apply_report(failed_climate());
        assert_eq!(chamber.state(), SystemState::Error);
        assert_eq!(chamber.devices().peltier_state().mode, PeltierMode::Off);
        assert!(chamber.devices().levels().values().all(|l| *l == 0.0));
        assert_eq!(chamber.errors().len(), 1);
        // Readings from before the failures are kept
        assert_eq!(chamber.sensor_data().co2, Some(600.0));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let (_board, mut chamber) = chamber();
        for _ in 0..4 {
            chamber.apply_report(failed_climate());
        }
        chamber.apply_report(report(20.0, 85.0, 600));
        for _ in 0..4 {
            chamber.apply_report(failed_climate());
        }
        assert_eq!(chamber.state(), SystemState::Active);
    }

    #[test]
    fn test_standby_shuts_down() {
        let (board, mut chamber) = chamber();
        chamber.apply_report(report(15.0, 30.0, 1300));
        chamber.tick(2000, at(20, 0));
        assert!(board.is_high("humidifier"));

        chamber.set_state("standby").unwrap();
        assert_eq!(chamber.state(), SystemState::Standby);
        assert!(!board.is_high("humidifier"));
        assert_eq!(chamber.devices().servo_angle(), 0.0);
        assert_eq!(chamber.vent(), (0.0, 0.0));
        assert!(!chamber.devices().peltier_state().enabled);

        // Nothing runs in standby
        chamber.tick(2000, at(20, 0));
        assert!(!board.is_high("humidifier"));
        assert!(chamber.set_state("bogus").is_err());
    }

    #[test]
    fn test_emergency_stop() {
        let (_board, mut chamber) = chamber();
        chamber.apply_report(report(15.0, 30.0, 1300));
        chamber.tick(2000, at(20, 0));
        chamber.emergency_stop();
        assert_eq!(chamber.state(), SystemState::Standby);
        assert!(chamber.devices().levels().values().all(|l| *l == 0.0));
        assert_eq!(chamber.errors()[0].message, "Emergency stop activated");
    }

    #[test]
    fn test_error_ring_is_bounded() {
        let (_board, mut chamber) = chamber();
        for i in 0..25 {
            chamber.record_error(format!("error {i}"));
        }
        let errors = chamber.errors();
        assert_eq!(errors.len(), ERROR_CAPACITY);
        assert_eq!(errors[0].message, "error 5");
        assert_eq!(errors[ERROR_CAPACITY - 1].message, "error 24");
    }

    #[test]
    fn test_setpoint_updates() {
        let (_board, mut chamber) = chamber();
        assert!(chamber.update_setpoints(SetpointUpdate::default()).is_err());
        let rejected = SetpointUpdate {
            temperature: Some(22.0),
            humidity: Some(140.0),
            ..SetpointUpdate::default()
        };
        assert!(chamber.update_setpoints(rejected).is_err());
        assert_eq!(chamber.setpoints().temperature, 20.0);

        chamber
            .update_setpoints(SetpointUpdate {
                temperature: Some(22.0),
                ..SetpointUpdate::default()
            })
            .unwrap();
        assert_eq!(chamber.pid_parameters().setpoint, 22.0);
    }

    #[test]
    fn test_pid_update() {
        let (_board, mut chamber) = chamber();
        let gains = chamber.update_pid(Some(3.0), None, Some(0.0)).unwrap();
        assert_eq!(gains, PidGains { kp: 3.0, ki: 0.1, kd: 0.0 });
        assert!(chamber.update_pid(Some(-1.0), None, None).is_err());
        assert_eq!(chamber.pid_parameters().kp, 3.0);
    }

    #[test]
    fn test_status_snapshot_serializes() {
        let (_board, mut chamber) = chamber();
        chamber.apply_report(report(19.5, 85.0, 900));
        chamber.tick(2000, at(12, 0));
        let status = serde_json::to_value(chamber.system_status(at(12, 0))).unwrap();
        assert_eq!(status["system_state"], "active");
        assert_eq!(status["timestamp"], "2024-06-01 12:00:00");
        assert_eq!(status["sensors"]["temperatures"]["DHT_Sensor"], 19.5);
        assert_eq!(status["sensors"]["co2"], 900.0);
        assert!(status["actuators"]["channels"]["intake_fan"].is_number());
        assert!(status["errors"].as_array().unwrap().is_empty());
    }
}
