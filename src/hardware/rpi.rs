//! Raspberry Pi backend on `rppal`.
//!
//! Relays, H-bridge enables, the NeoPixel SPI bus and the GXHTC3 I2C bus go
//! through rppal's `embedded-hal` implementations. Software PWM, hardware PWM
//! and the UART only have inherent APIs, so small adapters cover those.

use std::io;
use std::time::Duration;

use rppal::gpio::{Gpio, OutputPin};
use rppal::hal::Delay;
use rppal::i2c::I2c;
use rppal::pwm::{Channel as PwmLine, Polarity, Pwm};
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};
use rppal::uart::{Parity, Uart};

use crate::config::HardwareConfig;
use crate::devices::{
    Actuator, Channel, DeviceController, HBridge, NeoPixelStrip, Servo, SpiPixelBus,
    SwitchChannel, SPI_CLOCK_HZ,
};
use crate::error::DeviceError;
use crate::hardware::Hardware;
use crate::sensors::{ChamberSensors, Dht22, Ds18b20Bus, Gxhtc3, Mhz19};

const SERVO_PWM_HZ: f64 = 50.0;

/// Software PWM on a GPIO pin
pub struct SoftPwm {
    label: String,
    pin: OutputPin,
    frequency: f64,
}

impl SoftPwm {
    pub fn new(label: impl Into<String>, pin: OutputPin, frequency: f64) -> Self {
        Self {
            label: label.into(),
            pin,
            frequency,
        }
    }
}

impl Channel for SoftPwm {
    fn set_level(&mut self, level: f32) -> Result<(), DeviceError> {
        let result = if level <= 0.0 {
            self.pin.clear_pwm().map(|_| self.pin.set_low())
        } else {
            self.pin
                .set_pwm_frequency(self.frequency, level.clamp(0.0, 1.0) as f64)
        };
        result.map_err(|e| DeviceError::hardware(self.label.as_str(), e.to_string()))
    }
}

/// One of the SoC's hardware PWM channels
pub struct HardPwm {
    label: String,
    pwm: Pwm,
}

impl HardPwm {
    pub fn open(label: impl Into<String>, line: u8, frequency: f64) -> Result<Self, DeviceError> {
        let label = label.into();
        let line = match line {
            0 => PwmLine::Pwm0,
            1 => PwmLine::Pwm1,
            2 => PwmLine::Pwm2,
            3 => PwmLine::Pwm3,
            other => {
                return Err(DeviceError::hardware(label, format!("no PWM channel {other}")));
            }
        };
        let pwm = Pwm::with_frequency(line, frequency, 0.0, Polarity::Normal, true)
            .map_err(|e| DeviceError::hardware(label.as_str(), e.to_string()))?;
        Ok(Self { label, pwm })
    }
}

impl Channel for HardPwm {
    fn set_level(&mut self, level: f32) -> Result<(), DeviceError> {
        self.pwm
            .set_duty_cycle(level.clamp(0.0, 1.0) as f64)
            .map_err(|e| DeviceError::hardware(self.label.as_str(), e.to_string()))
    }
}

/// `std::io` view of the serial port for the MH-Z19 driver
pub struct UartPort {
    uart: Uart,
}

impl UartPort {
    pub fn open(config: &HardwareConfig) -> Result<Self, DeviceError> {
        let target = config.co2_port.display().to_string();
        let mut uart = Uart::with_path(&config.co2_port, config.co2_baud, Parity::None, 8, 1)
            .map_err(|e| DeviceError::hardware(target.as_str(), e.to_string()))?;
        // Block for a full 9 byte frame, up to 3 s
        uart.set_read_mode(9, Duration::from_secs(3))
            .map_err(|e| DeviceError::hardware(target.as_str(), e.to_string()))?;
        Ok(Self { uart })
    }
}

impl io::Read for UartPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.uart.read(buf).map_err(io::Error::other)
    }
}

impl io::Write for UartPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.uart.write(buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.uart.drain().map_err(io::Error::other)
    }
}

pub type PiSensors = ChamberSensors<UartPort, I2c, Delay>;

fn output(gpio: &Gpio, label: &str, bcm: u8) -> Result<OutputPin, DeviceError> {
    gpio.get(bcm)
        .map(|pin| pin.into_output_low())
        .map_err(|e| DeviceError::hardware(label, format!("GPIO{bcm}: {e}")))
}

/// Claims every peripheral in the pin map
pub fn open(config: &HardwareConfig) -> Result<Hardware, DeviceError> {
    let gpio = Gpio::new().map_err(|e| DeviceError::hardware("gpio", e.to_string()))?;
    let pins = &config.pins;

    let mut builder = DeviceController::builder();
    for (actuator, bcm) in [
        (Actuator::WaterPump, pins.water_pump),
        (Actuator::Humidifier, pins.humidifier),
    ] {
        let pin = output(&gpio, actuator.as_str(), bcm)?;
        builder = builder.channel(
            actuator,
            SwitchChannel::new(actuator.as_str(), pin).active_low(config.relay_active_low),
        );
    }
    for (actuator, bcm) in [
        (Actuator::PeltierFan, pins.peltier_fan),
        (Actuator::IntakeFan, pins.intake_fan),
        (Actuator::OutflowFan, pins.outflow_fan),
        (Actuator::InternalFan, pins.internal_fan),
    ] {
        let pin = output(&gpio, actuator.as_str(), bcm)?;
        builder = builder.channel(
            actuator,
            SoftPwm::new(actuator.as_str(), pin, config.fan_pwm_hz),
        );
    }
    for (actuator, line) in [
        (Actuator::WhiteLeds, pins.white_leds_channel),
        (Actuator::UvLeds, pins.uv_leds_channel),
    ] {
        builder = builder.channel(
            actuator,
            HardPwm::open(actuator.as_str(), line, config.led_pwm_hz)?,
        );
    }

    let peltier = HBridge::new(
        SwitchChannel::new(
            "peltier_left_enable",
            output(&gpio, "peltier_left_enable", pins.peltier_left_enable)?,
        ),
        SwitchChannel::new(
            "peltier_right_enable",
            output(&gpio, "peltier_right_enable", pins.peltier_right_enable)?,
        ),
        SoftPwm::new(
            "peltier_left_pwm",
            output(&gpio, "peltier_left_pwm", pins.peltier_left_pwm)?,
            config.peltier_pwm_hz,
        ),
        SoftPwm::new(
            "peltier_right_pwm",
            output(&gpio, "peltier_right_pwm", pins.peltier_right_pwm)?,
            config.peltier_pwm_hz,
        ),
    );
    let servo = Servo::new(
        HardPwm::open("vent_servo", pins.servo_channel, SERVO_PWM_HZ)?,
        config.servo_min_duty,
        config.servo_max_duty,
    );
    let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, SPI_CLOCK_HZ, Mode::Mode0)
        .map_err(|e| DeviceError::hardware("neopixels", e.to_string()))?;
    let pixels = NeoPixelStrip::new(
        SpiPixelBus::new(spi),
        config.neopixel_count,
        config.neopixel_brightness,
    );

    let devices = builder
        .peltier(peltier)
        .servo(servo)
        .pixels(pixels)
        .build()?;

    Ok(Hardware {
        devices,
        sensors: Box::new(open_sensors(config)?),
    })
}

fn open_sensors(config: &HardwareConfig) -> Result<PiSensors, DeviceError> {
    let fallback = match config.gxhtc3_bus {
        Some(bus) => match I2c::with_bus(bus) {
            Ok(i2c) => Some(Gxhtc3::new(i2c, Delay::new())),
            Err(e) => {
                tracing::warn!(bus, error = %e, "GXHTC3 bus unavailable, running without fallback");
                None
            }
        },
        None => None,
    };
    Ok(ChamberSensors::new(
        Ds18b20Bus::new(&config.w1_dir, config.probe_names.clone()),
        Mhz19::new(UartPort::open(config)?),
        Dht22::new(
            &config.dht_dir,
            config.dht_retries,
            Duration::from_millis(config.dht_retry_delay_ms),
        ),
        fallback,
    ))
}
