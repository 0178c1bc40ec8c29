//! Hardware backends.
//!
//! A backend produces the [`DeviceController`] and the [`SensorSuite`] the
//! chamber runs on: either the in-memory simulator or, with the `rpi`
//! feature, the Raspberry Pi peripherals.

#[cfg(feature = "rpi")]
pub mod rpi;
pub mod sim;

use crate::config::HardwareConfig;
use crate::devices::DeviceController;
use crate::error::DeviceError;
use crate::sensors::SensorSuite;

/// Outputs and inputs of one chamber
pub struct Hardware {
    pub devices: DeviceController,
    pub sensors: Box<dyn SensorSuite>,
}

/// Builds the simulated chamber
pub fn simulated(config: &HardwareConfig) -> Result<Hardware, DeviceError> {
    let board = sim::SimBoard::new();
    let devices = board.build_devices(config)?;
    Ok(Hardware {
        devices,
        sensors: Box::new(sim::SimSensors::new(board)),
    })
}

/// Builds the real chamber, or the simulator when asked for it
pub fn open(config: &HardwareConfig, simulate: bool) -> Result<Hardware, DeviceError> {
    if simulate {
        tracing::info!("using simulated hardware");
        return simulated(config);
    }
    #[cfg(feature = "rpi")]
    {
        rpi::open(config)
    }
    #[cfg(not(feature = "rpi"))]
    {
        Err(DeviceError::hardware(
            "board",
            "built without the rpi feature; run with --simulate",
        ))
    }
}
