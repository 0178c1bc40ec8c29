//! Error types for the chamber controller.
//!
//! Each layer has its own enum: hardware faults surface as [`DeviceError`],
//! sensor faults as [`SensorError`] and rejected commands as [`ChamberError`].

use thiserror::Error;

/// Errors raised while driving actuators
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The underlying pin, PWM or bus rejected the write
    #[error("hardware error on {target}: {message}")]
    Hardware { target: String, message: String },

    /// Colour name not in the palette
    #[error("unknown colour '{0}'")]
    UnknownColour(String),

    /// Pixel index past the end of the strip
    #[error("pixel index {index} out of range (0-{max})")]
    PixelIndex { index: usize, max: usize },

    /// Brightness outside 0.0 - 1.0
    #[error("brightness must be between 0.0 and 1.0, got {0}")]
    Brightness(f32),

    /// A required channel was never wired up
    #[error("no channel configured for {0}")]
    MissingChannel(String),
}

impl DeviceError {
    pub fn hardware(target: impl Into<String>, message: impl Into<String>) -> Self {
        DeviceError::Hardware {
            target: target.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while reading sensors
#[derive(Error, Debug)]
pub enum SensorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The one-wire driver never reported a good CRC
    #[error("CRC check failed for {device} after {attempts} attempts")]
    Crc { device: String, attempts: u32 },

    /// A frame with a bad checksum
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },

    /// A frame that is not a valid response
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("no {0} devices found")]
    NoDevices(&'static str),

    /// Every retry failed
    #[error("{sensor} read failed after {attempts} attempts")]
    Exhausted { sensor: &'static str, attempts: u32 },

    /// I2C or other bus fault
    #[error("bus error: {0}")]
    Bus(String),
}

/// Errors returned by chamber commands
#[derive(Error, Debug)]
pub enum ChamberError {
    #[error("Invalid system state: {0}")]
    InvalidState(String),

    #[error("Invalid setpoint: {0}")]
    InvalidSetpoint(String),

    #[error("Invalid PID parameter: {0}")]
    InvalidPid(String),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

/// Result type alias for chamber commands.
pub type ChamberResult<T> = Result<T, ChamberError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_display() {
        let err = DeviceError::hardware("intake_fan", "write failed");
        assert_eq!(err.to_string(), "hardware error on intake_fan: write failed");
    }

    #[test]
    fn test_invalid_state_display() {
        let err = ChamberError::InvalidState("running".to_string());
        assert_eq!(err.to_string(), "Invalid system state: running");
    }

    #[test]
    fn test_checksum_display() {
        let err = SensorError::Checksum {
            expected: 0x79,
            actual: 0x00,
        };
        assert_eq!(err.to_string(), "checksum mismatch: expected 0x79, got 0x00");
    }
}
