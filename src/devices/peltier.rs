use serde::{Deserialize, Serialize};

use super::Channel;
use crate::error::DeviceError;

/// Direction the Peltier is pumping heat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeltierMode {
    Heat,
    Cool,
    Off,
}

impl PeltierMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeltierMode::Heat => "heat",
            PeltierMode::Cool => "cool",
            PeltierMode::Off => "off",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PeltierState {
    pub mode: PeltierMode,
    /// 0.0 - 1.0
    pub duty_cycle: f32,
    pub enabled: bool,
}

/// Full H-bridge driving the Peltier module.
/// Only one leg is ever driven, so heating and cooling cannot overlap.
pub struct HBridge {
    left_enable: Box<dyn Channel>,
    right_enable: Box<dyn Channel>,
    left_pwm: Box<dyn Channel>,
    right_pwm: Box<dyn Channel>,
    left_level: f32,
    right_level: f32,
    left_enabled: bool,
    right_enabled: bool,
}

impl HBridge {
    pub fn new(
        left_enable: impl Channel + 'static,
        right_enable: impl Channel + 'static,
        left_pwm: impl Channel + 'static,
        right_pwm: impl Channel + 'static,
    ) -> Self {
        Self {
            left_enable: Box::new(left_enable),
            right_enable: Box::new(right_enable),
            left_pwm: Box::new(left_pwm),
            right_pwm: Box::new(right_pwm),
            left_level: 0.0,
            right_level: 0.0,
            left_enabled: false,
            right_enabled: false,
        }
    }

    pub fn enable(&mut self, left: bool, right: bool) -> Result<(), DeviceError> {
        self.left_enable.set_level(if left { 1.0 } else { 0.0 })?;
        self.left_enabled = left;
        self.right_enable.set_level(if right { 1.0 } else { 0.0 })?;
        self.right_enabled = right;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<(), DeviceError> {
        self.enable(false, false)
    }

    /// Drives one leg of the bridge
    /// param power: duty cycle 0.0 - 1.0
    /// param mode: Cool drives the right leg, Heat the left, Off stops and disables
    pub fn drive(&mut self, power: f32, mode: PeltierMode) -> Result<(), DeviceError> {
        let power = if power.is_finite() { power.clamp(0.0, 1.0) } else { 0.0 };
        match mode {
            PeltierMode::Cool => {
                // Idle leg first so both sides are never high together
                self.set_left(0.0)?;
                self.set_right(power)
            }
            PeltierMode::Heat => {
                self.set_right(0.0)?;
                self.set_left(power)
            }
            PeltierMode::Off => {
                self.set_left(0.0)?;
                self.set_right(0.0)?;
                self.disable()
            }
        }
    }

    pub fn state(&self) -> PeltierState {
        let (mode, duty_cycle) = if self.left_level > 0.0 && self.right_level == 0.0 {
            (PeltierMode::Heat, self.left_level)
        } else if self.right_level > 0.0 && self.left_level == 0.0 {
            (PeltierMode::Cool, self.right_level)
        } else {
            (PeltierMode::Off, 0.0)
        };
        PeltierState {
            mode,
            duty_cycle,
            enabled: self.left_enabled || self.right_enabled,
        }
    }

    fn set_left(&mut self, level: f32) -> Result<(), DeviceError> {
        self.left_pwm.set_level(level)?;
        self.left_level = level;
        Ok(())
    }

    fn set_right(&mut self, level: f32) -> Result<(), DeviceError> {
        self.right_pwm.set_level(level)?;
        self.right_level = level;
        Ok(())
    }
}
