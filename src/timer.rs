/// Countdown in milliseconds, advanced by the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountDownTimer {
    target_ms: u32,
}

pub const TICK_TIME_DELAY: u32 = 100;
pub const SENSOR_DELAY: u32 = 2000; // 2000ms ideally
pub const CONTROL_DELAY: u32 = 2000;
pub const LOG_DELAY: u32 = 5000;

impl CountDownTimer {
    pub fn new(target_ms: u32) -> CountDownTimer {
        Self { target_ms }
    }

    /// A timer that is already finished
    pub fn finished() -> CountDownTimer {
        Self { target_ms: 0 }
    }

    /// Advances the countdown
    /// param elapsed_ms: time since the previous tick
    pub fn tick(&mut self, elapsed_ms: u32) {
        self.target_ms = self.target_ms.saturating_sub(elapsed_ms);
    }

    pub fn set_time(&mut self, ms: u32) {
        self.target_ms = ms;
    }

    pub fn remaining_ms(&self) -> u32 {
        self.target_ms
    }

    pub fn is_finished(&self) -> bool {
        self.target_ms == 0
    }
}
