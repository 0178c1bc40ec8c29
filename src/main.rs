//! Mushroom chamber controller binary.
//!
//! `serve` runs the control loop and the web interface. The other commands
//! are bench diagnostics that talk to the hardware directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mushroom_chamber::auth::Auth;
use mushroom_chamber::config::{ChamberConfig, Credentials};
use mushroom_chamber::devices::Actuator;
use mushroom_chamber::hardware;
use mushroom_chamber::runtime::ChamberService;
use mushroom_chamber::sensors::SensorReport;
use mushroom_chamber::server::{self, AppState};

#[derive(Debug, Parser)]
#[command(name = "mushroom-chamber", version, about = "Mushroom fruiting chamber controller")]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run against the simulated chamber instead of real hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the controller and the web interface
    Serve {
        /// Listen address, overriding the config and CHAMBER_HOST/CHAMBER_PORT
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print readings from every sensor side by side
    Sensors {
        #[arg(long, default_value_t = 5)]
        count: u32,
        #[arg(long, default_value_t = 2)]
        interval_secs: u64,
    },
    /// Drive one output, hold it, then turn it off
    Actuate {
        actuator: Actuator,
        /// 0.0 to 1.0; switched outputs treat anything above zero as on
        level: f32,
        #[arg(long, default_value_t = 5)]
        hold_secs: u64,
    },
    /// Permanently disable automatic baseline calibration on the CO2 sensor
    DisableAbc,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mushroom_chamber=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = ChamberConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Serve { bind } => serve(config, cli.simulate, bind).await,
        Command::Sensors {
            count,
            interval_secs,
        } => sensors(&config, cli.simulate, count, Duration::from_secs(interval_secs)).await,
        Command::Actuate {
            actuator,
            level,
            hold_secs,
        } => actuate(&config, cli.simulate, actuator, level, Duration::from_secs(hold_secs)).await,
        Command::DisableAbc => disable_abc(&config, cli.simulate),
    }
}

async fn serve(config: ChamberConfig, simulate: bool, bind: Option<String>) -> anyhow::Result<()> {
    tracing::info!("Mushroom chamber starting");
    let credentials = Credentials::from_env().context("reading credentials")?;
    let auth = Arc::new(Auth::new(&credentials));
    tracing::info!(users = auth.users().len(), "dashboard users loaded");

    let addr = bind.unwrap_or_else(|| config.server.bind_address());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    let hardware = hardware::open(&config.hardware, simulate).context("opening hardware")?;
    let mut service = ChamberService::new(hardware, &config);
    service.start();

    let state = AppState::new(service.chamber(), auth, config.control.photo_default_secs);
    tracing::info!("Server listening on {}", addr);

    let served = server::serve(listener, state, shutdown_signal()).await;
    service.shutdown().await;
    served?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn fmt_reading(value: Option<f32>, unit: &str) -> String {
    value.map_or_else(|| "--".to_string(), |v| format!("{v:.1}{unit}"))
}

fn print_report(round: u32, report: &SensorReport) {
    println!("Round {round}");
    println!("  {:<16} {:>10} {:>10}", "Sensor", "Temp", "Humidity");
    match &report.probes {
        Ok(probes) => {
            for probe in probes {
                println!("  {:<16} {:>10} {:>10}", probe.name, fmt_reading(Some(probe.celsius), "C"), "--");
            }
        }
        Err(e) => println!("  {:<16} error: {e}", "DS18B20"),
    }
    match &report.climate {
        Ok(climate) => println!(
            "  {:<16} {:>10} {:>10}",
            format!("{:?}", climate.source),
            fmt_reading(Some(climate.celsius), "C"),
            fmt_reading(Some(climate.humidity), "%"),
        ),
        Err(e) => println!("  {:<16} error: {e}", "Climate"),
    }
    match &report.co2 {
        Ok(co2) => println!(
            "  {:<16} {:>10} {:>10}   CO2 {} ppm",
            "MH-Z19",
            fmt_reading(Some(co2.temperature as f32), "C"),
            "--",
            co2.co2_ppm
        ),
        Err(e) => println!("  {:<16} error: {e}", "MH-Z19"),
    }
}

async fn sensors(
    config: &ChamberConfig,
    simulate: bool,
    count: u32,
    interval: Duration,
) -> anyhow::Result<()> {
    let hardware = hardware::open(&config.hardware, simulate).context("opening hardware")?;
    // Outputs stay claimed while the sensors are read
    let _devices = hardware.devices;
    let mut suite = hardware.sensors;
    for round in 1..=count {
        let (returned, report) = tokio::task::spawn_blocking(move || {
            let report = suite.read_all();
            (suite, report)
        })
        .await
        .context("sensor read task failed")?;
        suite = returned;
        print_report(round, &report);
        if round < count {
            tokio::time::sleep(interval).await;
        }
    }
    Ok(())
}

async fn actuate(
    config: &ChamberConfig,
    simulate: bool,
    actuator: Actuator,
    level: f32,
    hold: Duration,
) -> anyhow::Result<()> {
    let mut hardware = hardware::open(&config.hardware, simulate).context("opening hardware")?;
    let devices = &mut hardware.devices;
    devices
        .set_pwm(actuator, level)
        .with_context(|| format!("driving {actuator}"))?;
    println!("{actuator} at {:.0}% for {}s", devices.state(actuator) * 100.0, hold.as_secs());
    tokio::select! {
        _ = tokio::time::sleep(hold) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }
    devices
        .turn_off(actuator)
        .with_context(|| format!("turning off {actuator}"))?;
    println!("{actuator} off");
    Ok(())
}

fn disable_abc(config: &ChamberConfig, simulate: bool) -> anyhow::Result<()> {
    let mut hardware = hardware::open(&config.hardware, simulate).context("opening hardware")?;
    hardware
        .sensors
        .disable_co2_abc()
        .context("disabling CO2 automatic baseline calibration")?;
    println!("CO2 automatic baseline calibration disabled");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
