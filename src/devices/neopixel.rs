//! WS2812 ("NeoPixel") strip driven from an SPI bus.
//!
//! At 6.4 MHz one SPI byte lasts one WS2812 bit period (1.25 us), so each data
//! bit becomes a byte whose high part is the pulse width: `0xF0` for a one and
//! `0xC0` for a zero. Pixels go out in GRB order followed by a low latch.

use std::fmt;
use std::str::FromStr;

use embedded_hal::spi::SpiBus;
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

pub const SPI_CLOCK_HZ: u32 = 6_400_000;
const ONE: u8 = 0b1111_0000;
const ZERO: u8 = 0b1100_0000;
/// Low time after a frame, at least 80 us
pub const RESET_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

/// Named colours the strip understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Colour {
    Red,
    Green,
    Blue,
    Yellow,
    Cyan,
    Magenta,
    White,
    Orange,
    Purple,
    #[default]
    Off,
}

impl Colour {
    pub const ALL: [Colour; 10] = [
        Colour::Red,
        Colour::Green,
        Colour::Blue,
        Colour::Yellow,
        Colour::Cyan,
        Colour::Magenta,
        Colour::White,
        Colour::Orange,
        Colour::Purple,
        Colour::Off,
    ];

    pub fn rgb(self) -> Rgb {
        match self {
            Colour::Red => Rgb(255, 0, 0),
            Colour::Green => Rgb(0, 255, 0),
            Colour::Blue => Rgb(0, 0, 255),
            Colour::Yellow => Rgb(255, 255, 0),
            Colour::Cyan => Rgb(0, 255, 255),
            Colour::Magenta => Rgb(255, 0, 255),
            Colour::White => Rgb(255, 255, 255),
            Colour::Orange => Rgb(255, 165, 0),
            Colour::Purple => Rgb(128, 0, 128),
            Colour::Off => Rgb(0, 0, 0),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Colour::Red => "red",
            Colour::Green => "green",
            Colour::Blue => "blue",
            Colour::Yellow => "yellow",
            Colour::Cyan => "cyan",
            Colour::Magenta => "magenta",
            Colour::White => "white",
            Colour::Orange => "orange",
            Colour::Purple => "purple",
            Colour::Off => "off",
        }
    }
}

impl fmt::Display for Colour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Colour {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Colour::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| DeviceError::UnknownColour(s.to_string()))
    }
}

/// Anything that can clock a finished frame out to the strip
pub trait PixelBus: Send {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), DeviceError>;
}

/// [`PixelBus`] over an `embedded-hal` SPI bus clocked at [`SPI_CLOCK_HZ`]
pub struct SpiPixelBus<S> {
    spi: S,
}

impl<S: SpiBus<u8>> SpiPixelBus<S> {
    pub fn new(spi: S) -> Self {
        Self { spi }
    }
}

impl<S: SpiBus<u8> + Send> PixelBus for SpiPixelBus<S> {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), DeviceError> {
        self.spi
            .write(frame)
            .and_then(|_| self.spi.flush())
            .map_err(|e| DeviceError::hardware("neopixels", format!("{e:?}")))
    }
}

/// Encodes pixels into SPI bytes, scaling by brightness
/// param pixels: colours in strip order
/// param brightness: 0.0 - 1.0
/// param out: buffer that is cleared and refilled
pub fn encode_frame(pixels: &[Rgb], brightness: f32, out: &mut Vec<u8>) {
    out.clear();
    out.reserve(pixels.len() * 24 + RESET_BYTES);
    let scale = |c: u8| (c as f32 * brightness.clamp(0.0, 1.0)).round() as u8;
    for Rgb(r, g, b) in pixels {
        for byte in [scale(*g), scale(*r), scale(*b)] {
            for bit in (0..8).rev() {
                out.push(if byte & (1 << bit) != 0 { ONE } else { ZERO });
            }
        }
    }
    out.extend(std::iter::repeat(0u8).take(RESET_BYTES));
}

pub struct NeoPixelStrip {
    bus: Box<dyn PixelBus>,
    pixels: Vec<Rgb>,
    brightness: f32,
    frame: Vec<u8>,
}

impl NeoPixelStrip {
    pub fn new(bus: impl PixelBus + 'static, count: usize, brightness: f32) -> Self {
        Self {
            bus: Box::new(bus),
            pixels: vec![Rgb::default(); count],
            brightness: brightness.clamp(0.0, 1.0),
            frame: Vec::new(),
        }
    }

    pub fn fill(&mut self, colour: Colour) -> Result<(), DeviceError> {
        self.pixels.fill(colour.rgb());
        self.show()
    }

    /// Sets the listed pixels; indices past the end are skipped
    pub fn set(&mut self, colour: Colour, indices: &[usize]) -> Result<(), DeviceError> {
        for &index in indices {
            if let Some(pixel) = self.pixels.get_mut(index) {
                *pixel = colour.rgb();
            }
        }
        self.show()
    }

    pub fn set_brightness(&mut self, brightness: f32) -> Result<(), DeviceError> {
        if !(0.0..=1.0).contains(&brightness) {
            return Err(DeviceError::Brightness(brightness));
        }
        self.brightness = brightness;
        self.show()
    }

    pub fn brightness(&self) -> f32 {
        self.brightness
    }

    pub fn state(&self) -> &[Rgb] {
        &self.pixels
    }

    pub fn pixel(&self, index: usize) -> Result<Rgb, DeviceError> {
        self.pixels.get(index).copied().ok_or(DeviceError::PixelIndex {
            index,
            max: self.pixels.len().saturating_sub(1),
        })
    }

    fn show(&mut self) -> Result<(), DeviceError> {
        encode_frame(&self.pixels, self.brightness, &mut self.frame);
        self.bus.write_frame(&self.frame)
    }
}
