use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use super::ProbeReading;
use crate::error::SensorError;

const FAMILY_PREFIX: &str = "28-";
const CRC_RETRIES: u32 = 3;
const CRC_RETRY_DELAY: Duration = Duration::from_millis(50);

/// DS18B20 probes exposed by the w1-therm kernel driver
pub struct Ds18b20Bus {
    base_dir: PathBuf,
    names: BTreeMap<String, String>,
}

impl Ds18b20Bus {
    /// param base_dir: usually /sys/bus/w1/devices
    /// param names: device id to friendly name
    pub fn new(base_dir: impl AsRef<Path>, names: BTreeMap<String, String>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            names,
        }
    }

    /// Lists DS18B20 device ids in a stable order
    pub fn devices(&self) -> Result<Vec<String>, SensorError> {
        let mut ids: Vec<String> = fs::read_dir(&self.base_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(FAMILY_PREFIX))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Reads one probe, re-reading while the driver reports a bad CRC
    pub fn read_device(&self, id: &str) -> Result<f32, SensorError> {
        let path = self.base_dir.join(id).join("w1_slave");
        for attempt in 1..=CRC_RETRIES {
            let contents = fs::read_to_string(&path)?;
            if let Some(celsius) = parse_w1_slave(&contents)? {
                return Ok(celsius);
            }
            if attempt < CRC_RETRIES {
                thread::sleep(CRC_RETRY_DELAY);
            }
        }
        Err(SensorError::Crc {
            device: id.to_string(),
            attempts: CRC_RETRIES,
        })
    }

    pub fn read_all(&self) -> Result<Vec<ProbeReading>, SensorError> {
        let ids = self.devices()?;
        if ids.is_empty() {
            return Err(SensorError::NoDevices("DS18B20"));
        }
        ids.iter()
            .map(|id| {
                Ok(ProbeReading {
                    name: self.names.get(id).cloned().unwrap_or_else(|| id.clone()),
                    celsius: self.read_device(id)?,
                })
            })
            .collect()
    }
}

/// Parses a w1_slave file
/// returns None while the CRC line does not end in YES
pub fn parse_w1_slave(contents: &str) -> Result<Option<f32>, SensorError> {
    let mut lines = contents.lines();
    let crc_line = lines.next().unwrap_or_default();
    if !crc_line.trim_end().ends_with("YES") {
        return Ok(None);
    }
    let data_line = lines
        .next()
        .ok_or_else(|| SensorError::Parse("w1_slave is missing its data line".to_string()))?;
    let (_, raw) = data_line
        .split_once("t=")
        .ok_or_else(|| SensorError::Parse(format!("no t= in '{data_line}'")))?;
    let millidegrees: i32 = raw
        .trim()
        .parse()
        .map_err(|_| SensorError::Parse(format!("bad temperature '{raw}'")))?;
    Ok(Some(millidegrees as f32 / 1000.0))
}
