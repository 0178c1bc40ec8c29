//! # mushroom-chamber
//! ## An environmental controller for a mushroom fruiting chamber
//!
//! Features:
//! - Peltier heating and cooling under PID control, never both at once
//! - Humidifier control with a condensation pulse
//! - CO2 venting through servo vents and fans
//! - Scheduled NeoPixel, white and UV lighting with a photo mode
//! - CSV data logging
//! - Web dashboard and JSON API with viewer and admin logins

pub mod auth;
pub mod config;
pub mod control;
pub mod datalog;
pub mod devices;
pub mod error;
pub mod hardware;
pub mod pid;
pub mod preferences;
pub mod rendering;
pub mod runtime;
pub mod sensors;
pub mod server;
pub mod timer;
