//! Background tasks that keep the chamber running.
//!
//! The sensor task polls the [`SensorSuite`] off the async threads and folds
//! each report into the chamber. The control task ticks the chamber and
//! appends a CSV record every log interval.

use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::{ChamberConfig, ControlConfig};
use crate::control::Chamber;
use crate::datalog::{DataLogger, LogRecord};
use crate::hardware::Hardware;
use crate::sensors::SensorSuite;

pub struct ChamberService {
    chamber: Arc<Mutex<Chamber>>,
    sensors: Option<Box<dyn SensorSuite>>,
    config: ControlConfig,
    logger: Option<Arc<DataLogger>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChamberService {
    pub fn new(hardware: Hardware, config: &ChamberConfig) -> Self {
        let chamber = Chamber::new(hardware.devices, config);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            chamber: Arc::new(Mutex::new(chamber)),
            sensors: Some(hardware.sensors),
            config: config.control.clone(),
            logger: config
                .datalog
                .path
                .as_ref()
                .map(|path| Arc::new(DataLogger::new(path))),
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// Shared handle for the HTTP layer
    pub fn chamber(&self) -> Arc<Mutex<Chamber>> {
        Arc::clone(&self.chamber)
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Spawns the sensor and control tasks
    pub fn start(&mut self) {
        let Some(sensors) = self.sensors.take() else {
            tracing::warn!("chamber service already started");
            return;
        };
        tracing::info!(
            tick_ms = self.config.tick_ms,
            sensor_interval_ms = self.config.sensor_interval_ms,
            log = ?self.logger.as_ref().map(|l| l.path().to_path_buf()),
            "starting chamber service"
        );
        self.tasks.push(tokio::spawn(sensor_loop(
            Arc::clone(&self.chamber),
            sensors,
            Duration::from_millis(self.config.sensor_interval_ms.into()),
            self.shutdown_tx.subscribe(),
        )));
        self.tasks.push(tokio::spawn(control_loop(
            Arc::clone(&self.chamber),
            self.config.clone(),
            self.logger.clone(),
            self.shutdown_tx.subscribe(),
        )));
    }

    /// Stops both tasks and turns every output off
    pub async fn shutdown(&mut self) {
        tracing::info!("stopping chamber service");
        // Only fails when no task is listening
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "chamber task ended abnormally");
            }
        }
        self.chamber.lock().await.safe_shutdown();
    }
}

async fn sensor_loop(
    chamber: Arc<Mutex<Chamber>>,
    sensors: Box<dyn SensorSuite>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // A panicking read poisons the lock; the suite is still usable after it
    let sensors = Arc::new(std::sync::Mutex::new(sensors));
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        let suite = Arc::clone(&sensors);
        let polled = tokio::task::spawn_blocking(move || {
            suite
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .read_all()
        })
        .await;
        match polled {
            Ok(report) => chamber.lock().await.apply_report(report),
            Err(e) => {
                tracing::error!(error = %e, "sensor read task failed");
                chamber
                    .lock()
                    .await
                    .record_error(format!("Sensor task failed: {e}"));
            }
        }
    }
    tracing::debug!("sensor task stopped");
}

async fn control_loop(
    chamber: Arc<Mutex<Chamber>>,
    config: ControlConfig,
    logger: Option<Arc<DataLogger>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = time::interval(Duration::from_millis(config.tick_ms.into()));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = Instant::now();
    let mut since_log = 0u32;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        let now = Instant::now();
        let elapsed_ms = u32::try_from(now.duration_since(last).as_millis()).unwrap_or(u32::MAX);
        last = now;

        let record = {
            let mut chamber = chamber.lock().await;
            chamber.tick(elapsed_ms, Local::now());
            since_log = since_log.saturating_add(elapsed_ms);
            match &logger {
                Some(_) if since_log >= config.log_interval_ms => {
                    since_log = 0;
                    Some(LogRecord::capture(&chamber, Local::now()))
                }
                _ => None,
            }
        };

        if let (Some(record), Some(logger)) = (record, logger.as_ref()) {
            let logger = Arc::clone(logger);
            let written = tokio::task::spawn_blocking(move || logger.append(&record)).await;
            let failure = match written {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("Data log write failed: {e}")),
                Err(e) => Some(format!("Data log task failed: {e}")),
            };
            if let Some(message) = failure {
                chamber.lock().await.record_error(message);
            }
        }
    }
    tracing::debug!("control task stopped");
}
