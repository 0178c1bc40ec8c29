//! In-memory board and plant model.
//!
//! [`SimBoard`] hands out `embedded-hal` pins, PWM channels and an SPI bus that
//! record what was written to them. [`SimSensors`] reads those outputs back and
//! integrates a first-order model of the chamber so the controller can run
//! without a Raspberry Pi attached.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use embedded_hal::digital::{ErrorType as PinErrorType, OutputPin};
use embedded_hal::pwm::{ErrorType as PwmErrorType, SetDutyCycle};
use embedded_hal::spi::{ErrorType as SpiErrorType, SpiBus};

use crate::config::HardwareConfig;
use crate::devices::{
    Actuator, DeviceController, HBridge, NeoPixelStrip, PwmChannel, Servo, SpiPixelBus,
    SwitchChannel,
};
use crate::error::{DeviceError, SensorError};
use crate::sensors::{ClimateReading, ClimateSource, Co2Reading, ProbeReading, SensorSuite};

const SIM_MAX_DUTY: u16 = 10_000;

#[derive(Default)]
struct BoardState {
    duty: BTreeMap<String, u16>,
    pins: BTreeMap<String, bool>,
    frame: Vec<u8>,
}

/// Shared record of every simulated output
#[derive(Clone, Default)]
pub struct SimBoard {
    state: Arc<Mutex<BoardState>>,
}

impl SimBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pwm(&self, name: &str) -> SimPwm {
        self.lock().duty.entry(name.to_string()).or_insert(0);
        SimPwm {
            name: name.to_string(),
            state: Arc::clone(&self.state),
        }
    }

    pub fn pin(&self, name: &str) -> SimPin {
        self.lock().pins.entry(name.to_string()).or_insert(false);
        SimPin {
            name: name.to_string(),
            state: Arc::clone(&self.state),
        }
    }

    pub fn spi(&self) -> SimSpi {
        SimSpi {
            state: Arc::clone(&self.state),
        }
    }

    /// Duty of a PWM output as a fraction, or 1.0/0.0 for a pin
    pub fn level(&self, name: &str) -> f32 {
        let state = self.lock();
        if let Some(duty) = state.duty.get(name) {
            return *duty as f32 / SIM_MAX_DUTY as f32;
        }
        match state.pins.get(name) {
            Some(true) => 1.0,
            _ => 0.0,
        }
    }

    pub fn is_high(&self, name: &str) -> bool {
        self.lock().pins.get(name).copied().unwrap_or(false)
    }

    /// Last frame clocked out to the NeoPixels
    pub fn last_frame(&self) -> Vec<u8> {
        self.lock().frame.clone()
    }

    /// Wires a full [`DeviceController`] onto this board
    pub fn build_devices(&self, config: &HardwareConfig) -> Result<DeviceController, DeviceError> {
        let mut builder = DeviceController::builder();
        for actuator in Actuator::ALL {
            let name = actuator.as_str();
            builder = if actuator.is_switched() {
                builder.channel(
                    actuator,
                    SwitchChannel::new(name, self.pin(name)).active_low(config.relay_active_low),
                )
            } else {
                builder.channel(actuator, PwmChannel::new(name, self.pwm(name)))
            };
        }
        builder
            .peltier(HBridge::new(
                SwitchChannel::new("peltier_left_enable", self.pin("peltier_left_enable")),
                SwitchChannel::new("peltier_right_enable", self.pin("peltier_right_enable")),
                PwmChannel::new("peltier_left_pwm", self.pwm("peltier_left_pwm")),
                PwmChannel::new("peltier_right_pwm", self.pwm("peltier_right_pwm")),
            ))
            .servo(Servo::new(
                PwmChannel::new("vent_servo", self.pwm("vent_servo")),
                config.servo_min_duty,
                config.servo_max_duty,
            ))
            .pixels(NeoPixelStrip::new(
                SpiPixelBus::new(self.spi()),
                config.neopixel_count,
                config.neopixel_brightness,
            ))
            .build()
    }
}

pub struct SimPwm {
    name: String,
    state: Arc<Mutex<BoardState>>,
}

impl PwmErrorType for SimPwm {
    type Error = Infallible;
}

impl SetDutyCycle for SimPwm {
    fn max_duty_cycle(&self) -> u16 {
        SIM_MAX_DUTY
    }

    fn set_duty_cycle(&mut self, duty: u16) -> Result<(), Self::Error> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.duty.insert(self.name.clone(), duty.min(SIM_MAX_DUTY));
        Ok(())
    }
}

pub struct SimPin {
    name: String,
    state: Arc<Mutex<BoardState>>,
}

impl SimPin {
    fn write(&mut self, high: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pins.insert(self.name.clone(), high);
    }
}

impl PinErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.write(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.write(true);
        Ok(())
    }
}

pub struct SimSpi {
    state: Arc<Mutex<BoardState>>,
}

impl SpiErrorType for SimSpi {
    type Error = Infallible;
}

impl SpiBus<u8> for SimSpi {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        words.fill(0);
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.frame = words.to_vec();
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        read.fill(0);
        self.write(write)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let written = words.to_vec();
        words.fill(0);
        self.write(&written)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

const AMBIENT_TEMPERATURE: f32 = 22.0;
const AMBIENT_HUMIDITY: f32 = 50.0;
const AMBIENT_CO2: f32 = 420.0;
/// Degrees per second at full Peltier drive
const PELTIER_RATE: f32 = 0.02;
const THERMAL_TAU_S: f32 = 600.0;
/// %RH per second with the humidifier running
const HUMIDIFIER_RATE: f32 = 0.5;
const MOISTURE_TAU_S: f32 = 1200.0;
/// ppm per second from the substrate
const RESPIRATION_RATE: f32 = 0.5;
/// Fraction of the CO2 excess removed per second at full fan speed
const VENT_RATE: f32 = 1.0 / 60.0;

/// First-order plant state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlantState {
    pub temperature: f32,
    pub humidity: f32,
    pub co2: f32,
    /// Peltier cold-plate offset seen by the coil probe
    pub coil_offset: f32,
}

impl Default for PlantState {
    fn default() -> Self {
        Self {
            temperature: AMBIENT_TEMPERATURE,
            humidity: AMBIENT_HUMIDITY,
            co2: 650.0,
            coil_offset: 0.0,
        }
    }
}

/// Sensors that answer from the plant model driven by a [`SimBoard`]
pub struct SimSensors {
    board: SimBoard,
    plant: PlantState,
    last_step: Instant,
    climate_fault: Arc<AtomicBool>,
}

impl SimSensors {
    pub fn new(board: SimBoard) -> Self {
        Self::with_state(board, PlantState::default())
    }

    pub fn with_state(board: SimBoard, plant: PlantState) -> Self {
        Self {
            board,
            plant,
            last_step: Instant::now(),
            climate_fault: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While set, every climate read fails
    pub fn climate_fault(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.climate_fault)
    }

    pub fn plant(&self) -> PlantState {
        self.plant
    }

    /// Integrates the plant forward
    /// param dt: seconds to advance
    pub fn step(&mut self, dt: f32) {
        let board = &self.board;
        let enabled =
            board.is_high("peltier_left_enable") || board.is_high("peltier_right_enable");
        let drive = if enabled {
            board.level("peltier_left_pwm") - board.level("peltier_right_pwm")
        } else {
            0.0
        };
        let humidifier = board.level(Actuator::Humidifier.as_str());
        let vent = board
            .level(Actuator::IntakeFan.as_str())
            .max(board.level(Actuator::OutflowFan.as_str()));

        let plant = &mut self.plant;
        plant.temperature += dt
            * (PELTIER_RATE * drive + (AMBIENT_TEMPERATURE - plant.temperature) / THERMAL_TAU_S);
        plant.humidity += dt
            * (HUMIDIFIER_RATE * humidifier + (AMBIENT_HUMIDITY - plant.humidity) / MOISTURE_TAU_S
                - vent * VENT_RATE * (plant.humidity - AMBIENT_HUMIDITY) / 10.0);
        plant.humidity = plant.humidity.clamp(0.0, 100.0);
        plant.co2 += dt * (RESPIRATION_RATE - vent * VENT_RATE * (plant.co2 - AMBIENT_CO2));
        plant.co2 = plant.co2.max(AMBIENT_CO2);
        plant.coil_offset = 5.0 * drive;
    }

    fn advance(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_step).as_secs_f32();
        self.last_step = now;
        self.step(dt);
    }
}

impl SensorSuite for SimSensors {
    fn probes(&mut self) -> Result<Vec<ProbeReading>, SensorError> {
        self.advance();
        let t = self.plant.temperature;
        Ok(vec![
            ProbeReading {
                name: "Probe1".to_string(),
                celsius: t - 0.3,
            },
            ProbeReading {
                name: "Probe2".to_string(),
                celsius: t,
            },
            ProbeReading {
                name: "Probe3".to_string(),
                celsius: t + self.plant.coil_offset,
            },
        ])
    }

    fn co2(&mut self) -> Result<Co2Reading, SensorError> {
        self.advance();
        let raw_temperature = (self.plant.temperature.round() as i16 + 40).clamp(0, 255) as u8;
        Ok(Co2Reading {
            co2_ppm: self.plant.co2.round().clamp(0.0, u16::MAX as f32) as u16,
            temperature: raw_temperature as i16 - 40,
            raw_temperature,
            status: 0,
            ticks_high: 0,
            ticks_low: 0,
        })
    }

    fn climate(&mut self) -> Result<ClimateReading, SensorError> {
        if self.climate_fault.load(Ordering::Relaxed) {
            return Err(SensorError::Exhausted {
                sensor: "DHT22",
                attempts: 1,
            });
        }
        self.advance();
        Ok(ClimateReading {
            celsius: self.plant.temperature + 0.2,
            humidity: self.plant.humidity,
            source: ClimateSource::Simulated,
        })
    }

    fn disable_co2_abc(&mut self) -> Result<(), SensorError> {
        tracing::info!("simulated CO2 sensor: automatic baseline calibration disabled");
        Ok(())
    }
}
