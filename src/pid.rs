//! Positional PID controller for the Peltier loop.

use crate::preferences::PidGains;

/// PID with clamped output and integral
#[derive(Debug, Clone)]
pub struct Pid {
    gains: PidGains,
    limits: (f32, f32),
    integral: f32,
    last_measurement: Option<f32>,
}

impl Pid {
    pub fn new(gains: PidGains, limits: (f32, f32)) -> Self {
        Self {
            gains,
            limits,
            integral: 0.0,
            last_measurement: None,
        }
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    /// Changes the gains without clearing history
    pub fn set_gains(&mut self, gains: PidGains) {
        self.gains = gains;
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_measurement = None;
    }

    /// Computes the next output
    /// param setpoint: target value
    /// param measurement: current process value
    /// param dt: seconds since the previous call
    pub fn compute(&mut self, setpoint: f32, measurement: f32, dt: f32) -> f32 {
        let (low, high) = self.limits;
        let error = setpoint - measurement;
        let proportional = self.gains.kp * error;

        let dt = if dt.is_finite() && dt > 0.0 { dt } else { 0.0 };
        self.integral = (self.integral + self.gains.ki * error * dt).clamp(low, high);

        // Derivative on measurement avoids a kick when the setpoint moves
        let derivative = match self.last_measurement {
            Some(previous) if dt > 0.0 => -self.gains.kd * (measurement - previous) / dt,
            _ => 0.0,
        };
        self.last_measurement = Some(measurement);

        (proportional + self.integral + derivative).clamp(low, high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(kp: f32, ki: f32, kd: f32) -> Pid {
        Pid::new(PidGains { kp, ki, kd }, (-1.0, 1.0))
    }

    #[test]
    fn test_proportional_sign() {
        let mut controller = pid(0.5, 0.0, 0.0);
        assert!(controller.compute(20.0, 19.0, 2.0) > 0.0);
        assert!(controller.compute(20.0, 21.0, 2.0) < 0.0);
    }

    #[test]
    fn test_output_clamped() {
        let mut controller = pid(2.0, 0.0, 0.0);
        assert_eq!(controller.compute(20.0, 10.0, 2.0), 1.0);
        assert_eq!(controller.compute(20.0, 30.0, 2.0), -1.0);
    }

    #[test]
    fn test_integral_windup_bounded() {
        let mut controller = pid(0.0, 1.0, 0.0);
        for _ in 0..100 {
            controller.compute(20.0, 10.0, 2.0);
        }
        // One step the other way must move off the rail immediately
        let out = controller.compute(20.0, 20.5, 2.0);
        assert!(out < 1.0);
    }

    #[test]
    fn test_first_sample_has_no_derivative() {
        let mut controller = pid(0.0, 0.0, 10.0);
        assert_eq!(controller.compute(20.0, 15.0, 2.0), 0.0);
        // Rising measurement pushes output down
        assert!(controller.compute(20.0, 15.5, 2.0) < 0.0);
    }

    #[test]
    fn test_reset_clears_integral() {
        let mut controller = pid(0.0, 0.1, 0.0);
        controller.compute(20.0, 18.0, 2.0);
        controller.reset();
        assert_eq!(controller.compute(20.0, 20.0, 2.0), 0.0);
    }
}
