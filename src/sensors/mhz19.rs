use std::io::{Read, Write};

use super::Co2Reading;
use crate::error::SensorError;

/// "Read CO2 concentration"
pub const READ_COMMAND: [u8; 9] = [0xFF, 0x01, 0x86, 0x00, 0x00, 0x00, 0x00, 0x00, 0x79];
/// "Automatic baseline correction off"; persists across power cycles
pub const ABC_OFF_COMMAND: [u8; 9] = [0xFF, 0x01, 0x79, 0x00, 0x00, 0x00, 0x00, 0x00, 0x86];

/// Checksum over bytes 1..=7 of a frame
pub fn checksum(frame: &[u8; 9]) -> u8 {
    let sum = frame[1..8].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    (!sum).wrapping_add(1)
}

/// Decodes a 9 byte response to [`READ_COMMAND`]
pub fn parse_response(frame: &[u8]) -> Result<Co2Reading, SensorError> {
    let frame: &[u8; 9] = frame
        .try_into()
        .map_err(|_| SensorError::UnexpectedResponse(format!("{} bytes", frame.len())))?;
    if frame[0] != 0xFF || frame[1] != 0x86 {
        return Err(SensorError::UnexpectedResponse(hex::encode(frame)));
    }
    let expected = checksum(frame);
    if frame[8] != expected {
        return Err(SensorError::Checksum {
            expected,
            actual: frame[8],
        });
    }
    Ok(Co2Reading {
        co2_ppm: u16::from_be_bytes([frame[2], frame[3]]),
        temperature: frame[4] as i16 - 40,
        raw_temperature: frame[4],
        status: frame[5],
        ticks_high: frame[6],
        ticks_low: frame[7],
    })
}

/// MH-Z19 NDIR CO2 sensor on a 9600 baud serial port
pub struct Mhz19<P> {
    port: P,
}

impl<P: Read + Write> Mhz19<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    pub fn read(&mut self) -> Result<Co2Reading, SensorError> {
        self.port.write_all(&READ_COMMAND)?;
        self.port.flush()?;
        let mut frame = [0u8; 9];
        self.port.read_exact(&mut frame)?;
        parse_response(&frame)
    }

    pub fn disable_abc(&mut self) -> Result<(), SensorError> {
        self.port.write_all(&ABC_OFF_COMMAND)?;
        self.port.flush()?;
        tracing::info!("CO2 automatic baseline calibration disabled");
        Ok(())
    }

    pub fn into_inner(self) -> P {
        self.port
    }
}
