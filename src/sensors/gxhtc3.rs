use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;

use super::{ClimateReading, ClimateSource};
use crate::error::SensorError;

pub const GXHTC3_ADDRESS: u8 = 0x70;

const WAKEUP: [u8; 2] = [0x35, 0x17];
/// Normal mode, clock stretching, temperature first
const MEASURE: [u8; 2] = [0x7C, 0xA2];
const SLEEP: [u8; 2] = [0xB0, 0x98];

/// Sensirion-style CRC-8 (poly 0x31, init 0xFF)
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xFF;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x31 } else { crc << 1 };
        }
    }
    crc
}

/// GXHTC3 temperature and humidity sensor
pub struct Gxhtc3<I, D> {
    i2c: I,
    delay: D,
}

impl<I: I2c, D: DelayNs> Gxhtc3<I, D> {
    pub fn new(i2c: I, delay: D) -> Self {
        Self { i2c, delay }
    }

    /// Wakes the sensor, takes one measurement and puts it back to sleep
    pub fn read(&mut self) -> Result<ClimateReading, SensorError> {
        self.write(&WAKEUP)?;
        self.delay.delay_ms(1);
        self.write(&MEASURE)?;
        self.delay.delay_ms(20);
        let mut data = [0u8; 6];
        self.i2c
            .read(GXHTC3_ADDRESS, &mut data)
            .map_err(|e| SensorError::Bus(format!("{e:?}")))?;
        self.write(&SLEEP)?;

        let temp_raw = word(&data[0..3])?;
        let hum_raw = word(&data[3..6])?;
        Ok(ClimateReading {
            celsius: -45.0 + 175.0 * temp_raw as f32 / 65535.0,
            humidity: 100.0 * hum_raw as f32 / 65535.0,
            source: ClimateSource::Gxhtc3,
        })
    }

    fn write(&mut self, command: &[u8; 2]) -> Result<(), SensorError> {
        self.i2c
            .write(GXHTC3_ADDRESS, command)
            .map_err(|e| SensorError::Bus(format!("{e:?}")))
    }
}

/// Checks the CRC on a [msb, lsb, crc] triple
fn word(chunk: &[u8]) -> Result<u16, SensorError> {
    let expected = crc8(&chunk[..2]);
    if chunk[2] != expected {
        return Err(SensorError::Checksum {
            expected,
            actual: chunk[2],
        });
    }
    Ok(u16::from_be_bytes([chunk[0], chunk[1]]))
}
