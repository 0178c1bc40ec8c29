//! Actuator layer.
//!
//! Every output is driven through the object-safe [`Channel`] trait so the
//! controller does not care whether a fan sits on a hardware PWM channel, a
//! software PWM pin or a relay. Adapters exist for any `embedded-hal`
//! [`SetDutyCycle`] or [`OutputPin`]. All levels are fractions in 0.0 - 1.0.

mod neopixel;
mod peltier;
mod servo;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use embedded_hal::digital::OutputPin;
use embedded_hal::pwm::SetDutyCycle;
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

pub use neopixel::{
    encode_frame, Colour, NeoPixelStrip, PixelBus, Rgb, SpiPixelBus, RESET_BYTES, SPI_CLOCK_HZ,
};
pub use peltier::{HBridge, PeltierMode, PeltierState};
pub use servo::Servo;

/// Labelled outputs on the chamber board
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actuator {
    WaterPump,
    WhiteLeds,
    UvLeds,
    PeltierFan,
    IntakeFan,
    OutflowFan,
    InternalFan,
    Humidifier,
}

impl Actuator {
    pub const ALL: [Actuator; 8] = [
        Actuator::WaterPump,
        Actuator::WhiteLeds,
        Actuator::UvLeds,
        Actuator::PeltierFan,
        Actuator::IntakeFan,
        Actuator::OutflowFan,
        Actuator::InternalFan,
        Actuator::Humidifier,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Actuator::WaterPump => "water_pump",
            Actuator::WhiteLeds => "white_leds",
            Actuator::UvLeds => "uv_leds",
            Actuator::PeltierFan => "peltier_fan",
            Actuator::IntakeFan => "intake_fan",
            Actuator::OutflowFan => "outflow_fan",
            Actuator::InternalFan => "internal_fan",
            Actuator::Humidifier => "humidifier",
        }
    }

    /// Relay-driven outputs that only know on and off
    pub fn is_switched(&self) -> bool {
        matches!(self, Actuator::WaterPump | Actuator::Humidifier)
    }
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Actuator {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Actuator::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| DeviceError::MissingChannel(s.to_string()))
    }
}

/// Sink for an output level between 0.0 and 1.0
pub trait Channel: Send {
    fn set_level(&mut self, level: f32) -> Result<(), DeviceError>;
}

/// Drives a PWM output, scaling the level onto the duty range
pub struct PwmChannel<C> {
    label: String,
    pwm: C,
}

impl<C: SetDutyCycle> PwmChannel<C> {
    pub fn new(label: impl Into<String>, pwm: C) -> Self {
        Self {
            label: label.into(),
            pwm,
        }
    }
}

impl<C: SetDutyCycle + Send> Channel for PwmChannel<C> {
    fn set_level(&mut self, level: f32) -> Result<(), DeviceError> {
        let max = self.pwm.max_duty_cycle();
        let duty = (level.clamp(0.0, 1.0) * max as f32).round() as u16;
        self.pwm
            .set_duty_cycle(duty.min(max))
            .map_err(|e| DeviceError::hardware(self.label.as_str(), format!("{e:?}")))
    }
}

/// Drives a relay or enable line; any level above zero switches it on
pub struct SwitchChannel<P> {
    label: String,
    pin: P,
    active_low: bool,
}

impl<P: OutputPin> SwitchChannel<P> {
    pub fn new(label: impl Into<String>, pin: P) -> Self {
        Self {
            label: label.into(),
            pin,
            active_low: false,
        }
    }

    /// For low-trigger relay boards (OFF = HIGH)
    pub fn active_low(mut self, active_low: bool) -> Self {
        self.active_low = active_low;
        self
    }
}

impl<P: OutputPin + Send> Channel for SwitchChannel<P> {
    fn set_level(&mut self, level: f32) -> Result<(), DeviceError> {
        let on = level > 0.0;
        let result = if on != self.active_low {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        result.map_err(|e| DeviceError::hardware(self.label.as_str(), format!("{e:?}")))
    }
}

/// Owns every actuator in the chamber and remembers what it last commanded
pub struct DeviceController {
    channels: BTreeMap<Actuator, Box<dyn Channel>>,
    levels: BTreeMap<Actuator, f32>,
    peltier: HBridge,
    servo: Servo,
    pixels: NeoPixelStrip,
}

/// Collects channels before they are checked into a [`DeviceController`]
#[derive(Default)]
pub struct DeviceControllerBuilder {
    channels: BTreeMap<Actuator, Box<dyn Channel>>,
    peltier: Option<HBridge>,
    servo: Option<Servo>,
    pixels: Option<NeoPixelStrip>,
}

impl DeviceControllerBuilder {
    pub fn channel(mut self, actuator: Actuator, channel: impl Channel + 'static) -> Self {
        self.channels.insert(actuator, Box::new(channel));
        self
    }

    pub fn peltier(mut self, peltier: HBridge) -> Self {
        self.peltier = Some(peltier);
        self
    }

    pub fn servo(mut self, servo: Servo) -> Self {
        self.servo = Some(servo);
        self
    }

    pub fn pixels(mut self, pixels: NeoPixelStrip) -> Self {
        self.pixels = Some(pixels);
        self
    }

    /// Fails if any actuator is left unwired
    pub fn build(self) -> Result<DeviceController, DeviceError> {
        if let Some(missing) = Actuator::ALL.iter().find(|a| !self.channels.contains_key(a)) {
            return Err(DeviceError::MissingChannel(missing.to_string()));
        }
        let levels = Actuator::ALL.iter().map(|a| (*a, 0.0)).collect();
        Ok(DeviceController {
            channels: self.channels,
            levels,
            peltier: self
                .peltier
                .ok_or_else(|| DeviceError::MissingChannel("peltier".to_string()))?,
            servo: self
                .servo
                .ok_or_else(|| DeviceError::MissingChannel("vent_servo".to_string()))?,
            pixels: self
                .pixels
                .ok_or_else(|| DeviceError::MissingChannel("neopixels".to_string()))?,
        })
    }
}

impl DeviceController {
    pub fn builder() -> DeviceControllerBuilder {
        DeviceControllerBuilder::default()
    }

    /// Sets an output level, clamped to 0.0 - 1.0
    pub fn set_pwm(&mut self, actuator: Actuator, level: f32) -> Result<(), DeviceError> {
        let level = if level.is_finite() { level.clamp(0.0, 1.0) } else { 0.0 };
        let level = if actuator.is_switched() && level > 0.0 { 1.0 } else { level };
        let channel = self
            .channels
            .get_mut(&actuator)
            .ok_or_else(|| DeviceError::MissingChannel(actuator.to_string()))?;
        channel.set_level(level)?;
        self.levels.insert(actuator, level);
        Ok(())
    }

    pub fn turn_on(&mut self, actuator: Actuator) -> Result<(), DeviceError> {
        self.set_pwm(actuator, 1.0)
    }

    pub fn turn_off(&mut self, actuator: Actuator) -> Result<(), DeviceError> {
        self.set_pwm(actuator, 0.0)
    }

    /// Last commanded level
    pub fn state(&self, actuator: Actuator) -> f32 {
        self.levels.get(&actuator).copied().unwrap_or(0.0)
    }

    pub fn is_on(&self, actuator: Actuator) -> bool {
        self.state(actuator) > 0.0
    }

    pub fn levels(&self) -> &BTreeMap<Actuator, f32> {
        &self.levels
    }

    pub fn peltier_enable(&mut self) -> Result<(), DeviceError> {
        self.peltier.enable(true, true)
    }

    pub fn peltier_disable(&mut self) -> Result<(), DeviceError> {
        self.peltier.disable()
    }

    pub fn set_peltier(&mut self, power: f32, mode: PeltierMode) -> Result<(), DeviceError> {
        self.peltier.drive(power, mode)
    }

    pub fn peltier_state(&self) -> PeltierState {
        self.peltier.state()
    }

    pub fn set_servo_angle(&mut self, angle: f32) -> Result<(), DeviceError> {
        self.servo.set_angle(angle)
    }

    pub fn servo_angle(&self) -> f32 {
        self.servo.angle()
    }

    /// Sets all pixels, or only the listed ones
    pub fn set_neopixel_color(
        &mut self,
        colour: Colour,
        indices: Option<&[usize]>,
    ) -> Result<(), DeviceError> {
        match indices {
            None => self.pixels.fill(colour),
            Some(indices) => self.pixels.set(colour, indices),
        }
    }

    pub fn set_neopixel_brightness(&mut self, brightness: f32) -> Result<(), DeviceError> {
        self.pixels.set_brightness(brightness)
    }

    pub fn neopixel_brightness(&self) -> f32 {
        self.pixels.brightness()
    }

    pub fn neopixel_state(&self) -> &[Rgb] {
        self.pixels.state()
    }

    pub fn neopixel_pixel(&self, index: usize) -> Result<Rgb, DeviceError> {
        self.pixels.pixel(index)
    }

    /// Turns everything off, carrying on past failures
    /// returns every error hit along the way
    pub fn all_off(&mut self) -> Vec<DeviceError> {
        let mut failures = Vec::new();
        for actuator in Actuator::ALL {
            if let Err(e) = self.turn_off(actuator) {
                failures.push(e);
            }
        }
        if let Err(e) = self.peltier.drive(0.0, PeltierMode::Off) {
            failures.push(e);
        }
        if let Err(e) = self.peltier.disable() {
            failures.push(e);
        }
        if let Err(e) = self.servo.set_angle(0.0) {
            failures.push(e);
        }
        if let Err(e) = self.pixels.fill(Colour::Off) {
            failures.push(e);
        }
        failures
    }
}
