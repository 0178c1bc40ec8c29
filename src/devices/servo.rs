use super::Channel;
use crate::error::DeviceError;

/// Vent servos sharing one 50 Hz PWM line
pub struct Servo {
    channel: Box<dyn Channel>,
    min_duty: f32,
    max_duty: f32,
    angle: f32,
}

impl Servo {
    /// param min_duty: duty cycle percent at 0 degrees
    /// param max_duty: duty cycle percent at 180 degrees
    pub fn new(channel: impl Channel + 'static, min_duty: f32, max_duty: f32) -> Self {
        Self {
            channel: Box::new(channel),
            min_duty,
            max_duty,
            angle: 0.0,
        }
    }

    /// Maps an angle (0-180) onto a duty cycle percent
    pub fn angle_to_duty(&self, angle: f32) -> f32 {
        self.min_duty + (angle / 180.0) * (self.max_duty - self.min_duty)
    }

    pub fn set_angle(&mut self, angle: f32) -> Result<(), DeviceError> {
        let clamped = if angle.is_finite() { angle.clamp(0.0, 180.0) } else { 0.0 };
        self.channel.set_level(self.angle_to_duty(clamped) / 100.0)?;
        self.angle = clamped;
        Ok(())
    }

    /// Last commanded angle in degrees
    pub fn angle(&self) -> f32 {
        self.angle
    }
}
