//! Sensor layer.
//!
//! Each sensor driver reads one device. [`ChamberSensors`] bundles the set
//! fitted to the chamber behind the [`SensorSuite`] trait, which is what the
//! control loop polls.

mod dht22;
mod ds18b20;
mod gxhtc3;
mod mhz19;

use std::io::{Read, Write};

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use serde::Serialize;

use crate::error::SensorError;

pub use dht22::Dht22;
pub use ds18b20::{parse_w1_slave, Ds18b20Bus};
pub use gxhtc3::{crc8, Gxhtc3, GXHTC3_ADDRESS};
pub use mhz19::{checksum, parse_response, Mhz19, ABC_OFF_COMMAND, READ_COMMAND};

/// One DS18B20 temperature
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReading {
    pub name: String,
    pub celsius: f32,
}

/// Decoded MH-Z19 response
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Co2Reading {
    pub co2_ppm: u16,
    pub temperature: i16,
    pub raw_temperature: u8,
    pub status: u8,
    pub ticks_high: u8,
    pub ticks_low: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClimateSource {
    Dht22,
    Gxhtc3,
    Simulated,
}

/// Air temperature and relative humidity
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClimateReading {
    pub celsius: f32,
    pub humidity: f32,
    pub source: ClimateSource,
}

/// Outcome of one polling round; each source succeeds or fails on its own
#[derive(Debug)]
pub struct SensorReport {
    pub probes: Result<Vec<ProbeReading>, SensorError>,
    pub co2: Result<Co2Reading, SensorError>,
    pub climate: Result<ClimateReading, SensorError>,
}

/// Blocking sensor access used from the control loop
pub trait SensorSuite: Send + 'static {
    fn probes(&mut self) -> Result<Vec<ProbeReading>, SensorError>;

    fn co2(&mut self) -> Result<Co2Reading, SensorError>;

    fn climate(&mut self) -> Result<ClimateReading, SensorError>;

    /// Turns off automatic baseline calibration on the CO2 sensor
    fn disable_co2_abc(&mut self) -> Result<(), SensorError>;

    fn read_all(&mut self) -> SensorReport {
        SensorReport {
            probes: self.probes(),
            co2: self.co2(),
            climate: self.climate(),
        }
    }
}

/// The sensors fitted to the chamber
pub struct ChamberSensors<P, I, D> {
    probes: Ds18b20Bus,
    co2: Mhz19<P>,
    dht: Dht22,
    fallback: Option<Gxhtc3<I, D>>,
}

impl<P, I, D> ChamberSensors<P, I, D>
where
    P: Read + Write,
    I: I2c,
    D: DelayNs,
{
    pub fn new(probes: Ds18b20Bus, co2: Mhz19<P>, dht: Dht22, fallback: Option<Gxhtc3<I, D>>) -> Self {
        Self {
            probes,
            co2,
            dht,
            fallback,
        }
    }
}

impl<P, I, D> SensorSuite for ChamberSensors<P, I, D>
where
    P: Read + Write + Send + 'static,
    I: I2c + Send + 'static,
    D: DelayNs + Send + 'static,
{
    fn probes(&mut self) -> Result<Vec<ProbeReading>, SensorError> {
        self.probes.read_all()
    }

    fn co2(&mut self) -> Result<Co2Reading, SensorError> {
        self.co2.read()
    }

    fn climate(&mut self) -> Result<ClimateReading, SensorError> {
        match self.dht.read() {
            Ok(reading) => Ok(reading),
            Err(e) => match self.fallback.as_mut() {
                Some(gxhtc3) => {
                    tracing::warn!(error = %e, "DHT22 failed, falling back to GXHTC3");
                    gxhtc3.read()
                }
                None => Err(e),
            },
        }
    }

    fn disable_co2_abc(&mut self) -> Result<(), SensorError> {
        self.co2.disable_abc()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory doubles for sensor buses

    use std::collections::VecDeque;
    use std::convert::Infallible;
    use std::io::{self, Read, Write};

    use embedded_hal::delay::DelayNs;
    use embedded_hal::i2c::{ErrorType, I2c, Operation};

    /// Serial port that replays a canned response
    pub struct FakePort {
        pub written: Vec<u8>,
        pub response: io::Cursor<Vec<u8>>,
    }

    impl FakePort {
        pub fn new(response: &[u8]) -> Self {
            Self {
                written: Vec::new(),
                response: io::Cursor::new(response.to_vec()),
            }
        }
    }

    impl Read for FakePort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.response.read(buf)
        }
    }

    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// I2C bus that records writes and answers reads from a queue
    #[derive(Default)]
    pub struct FakeI2c {
        pub writes: Vec<(u8, Vec<u8>)>,
        pub reads: VecDeque<Vec<u8>>,
    }

    impl ErrorType for FakeI2c {
        type Error = Infallible;
    }

    impl I2c for FakeI2c {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            for op in operations {
                match op {
                    Operation::Write(bytes) => self.writes.push((address, bytes.to_vec())),
                    Operation::Read(buf) => {
                        let data = self.reads.pop_front().unwrap_or_default();
                        for (slot, byte) in buf.iter_mut().zip(data) {
                            *slot = byte;
                        }
                    }
                }
            }
            Ok(())
        }
    }

    pub struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }
}
