use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use super::{ClimateReading, ClimateSource};
use crate::error::SensorError;

/// DHT22 read through the Linux `dht11` IIO driver.
/// The driver times the single-wire protocol; reads fail often and are retried.
pub struct Dht22 {
    dir: PathBuf,
    retries: u32,
    retry_delay: Duration,
}

impl Dht22 {
    /// param dir: IIO device directory, e.g. /sys/bus/iio/devices/iio:device0
    /// param retries: attempts before giving up
    /// param retry_delay: pause between attempts
    pub fn new(dir: impl AsRef<Path>, retries: u32, retry_delay: Duration) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            retries: retries.max(1),
            retry_delay,
        }
    }

    pub fn read(&self) -> Result<ClimateReading, SensorError> {
        // No point retrying a sensor that is not there
        if !self.dir.is_dir() {
            return Err(SensorError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", self.dir.display()),
            )));
        }
        for attempt in 1..=self.retries {
            match self.read_once() {
                Ok(reading) => return Ok(reading),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "DHT22 read failed");
                    if attempt < self.retries {
                        thread::sleep(self.retry_delay);
                    }
                }
            }
        }
        Err(SensorError::Exhausted {
            sensor: "DHT22",
            attempts: self.retries,
        })
    }

    fn read_once(&self) -> Result<ClimateReading, SensorError> {
        let celsius = read_milli(&self.dir.join("in_temp_input"))?;
        let humidity = read_milli(&self.dir.join("in_humidityrelative_input"))?;
        Ok(ClimateReading {
            celsius,
            humidity,
            source: ClimateSource::Dht22,
        })
    }
}

/// IIO exposes milli-units as integers
fn read_milli(path: &Path) -> Result<f32, SensorError> {
    let raw = fs::read_to_string(path)?;
    let value: i32 = raw
        .trim()
        .parse()
        .map_err(|_| SensorError::Parse(format!("bad value '{}' in {}", raw.trim(), path.display())))?;
    Ok(value as f32 / 1000.0)
}
