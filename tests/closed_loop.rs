use chrono::{DateTime, Local, TimeDelta, TimeZone};

use mushroom_chamber::config::{ChamberConfig, HardwareConfig};
use mushroom_chamber::control::{Chamber, SystemState};
use mushroom_chamber::devices::{Actuator, PeltierMode};
use mushroom_chamber::hardware::sim::{PlantState, SimBoard, SimSensors};
use mushroom_chamber::sensors::SensorSuite;

const STEP_MS: u32 = 2000;

fn rig(plant: PlantState) -> (SimBoard, SimSensors, Chamber) {
    let board = SimBoard::new();
    let devices = board.build_devices(&HardwareConfig::default()).unwrap();
    let sensors = SimSensors::with_state(board.clone(), plant);
    let mut chamber = Chamber::new(devices, &ChamberConfig::default());
    chamber.set_system_state(SystemState::Active);
    (board, sensors, chamber)
}

fn start() -> DateTime<Local> {
    Local.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// Advances plant and controller together by one control interval
fn step(sensors: &mut SimSensors, chamber: &mut Chamber, now: DateTime<Local>) {
    sensors.step(STEP_MS as f32 / 1000.0);
    chamber.apply_report(sensors.read_all());
    chamber.tick(STEP_MS, now);
}

#[test]
fn test_warm_chamber_is_cooled_without_fighting() {
    let (board, mut sensors, mut chamber) = rig(PlantState {
        temperature: 26.0,
        ..PlantState::default()
    });
    let mut now = start();
    let mut saw_cooling = false;
    for _ in 0..900 {
        step(&mut sensors, &mut chamber, now);
        now += TimeDelta::milliseconds(STEP_MS.into());

        let both_legs = board.level("peltier_left_pwm") > 0.0 && board.level("peltier_right_pwm") > 0.0;
        assert!(!both_legs, "heating and cooling driven together");
        saw_cooling |= chamber.devices().peltier_state().mode == PeltierMode::Cool;
    }
    assert!(saw_cooling);
    let temperature = sensors.plant().temperature;
    assert!(temperature < 23.0, "chamber still at {temperature} C");
    assert_eq!(chamber.state(), SystemState::Active);
}

#[test]
fn test_dry_chamber_runs_humidifier() {
    let (board, mut sensors, mut chamber) = rig(PlantState {
        humidity: 40.0,
        ..PlantState::default()
    });
    step(&mut sensors, &mut chamber, start());
    assert!(chamber.devices().is_on(Actuator::Humidifier));
    assert!(chamber.devices().is_on(Actuator::InternalFan));
    assert!(board.is_high(Actuator::Humidifier.as_str()));
}

#[test]
fn test_stale_air_opens_vents_until_cleared() {
    let (_board, mut sensors, mut chamber) = rig(PlantState {
        co2: 1500.0,
        ..PlantState::default()
    });
    let mut now = start();
    step(&mut sensors, &mut chamber, now);
    let (angle, fan) = chamber.vent();
    assert_eq!(angle, 180.0);
    assert_eq!(fan, 1.0);

    for _ in 0..600 {
        now += TimeDelta::milliseconds(STEP_MS.into());
        step(&mut sensors, &mut chamber, now);
    }
    assert!(sensors.plant().co2 < 1500.0);
    assert!(chamber.vent().0 < 180.0);
}

#[test]
fn test_climate_failures_stop_the_chamber() {
    let (board, mut sensors, mut chamber) = rig(PlantState {
        temperature: 26.0,
        ..PlantState::default()
    });
    let mut now = start();
    step(&mut sensors, &mut chamber, now);
    assert!(board.level("peltier_right_pwm") > 0.0);

    sensors
        .climate_fault()
        .store(true, std::sync::atomic::Ordering::Relaxed);
    for _ in 0..5 {
        now += TimeDelta::milliseconds(STEP_MS.into());
        step(&mut sensors, &mut chamber, now);
    }
    assert_eq!(chamber.state(), SystemState::Error);
    assert_eq!(board.level("peltier_right_pwm"), 0.0);
    assert!(!chamber.errors().is_empty());
}
