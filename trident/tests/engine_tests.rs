//! Engine integration tests: full command → planner → scheduler → pin
//! round trips over the simulation backend and a controlled clock.
//!
//! Pin-level assertions only look at states that survive the shutdown
//! path (defaults), because the living-pin registry is process-global and
//! tests run concurrently.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use trident::engine::{Emitter, Engine};
use trident::intake::command_queue;
use trident_common::command::MachineCommand;
use trident_common::config::PrinterConfig;
use trident_hal::{Level, PinBackend, SimBus, SimClock};

fn sim_engine(
    config: &PrinterConfig,
    bus: &SimBus,
    commands: Vec<MachineCommand>,
) -> Engine<SimClock> {
    let abort = Arc::new(AtomicBool::new(false));
    let (sender, receiver) = command_queue(abort.clone());
    for command in commands {
        sender.send(command).unwrap();
    }
    drop(sender); // engine drains the queue and exits
    Engine::new(
        config,
        PinBackend::Sim(bus.clone()),
        SimClock::starting_at(1_000_000),
        receiver,
        abort,
        Emitter::Direct,
    )
    .unwrap()
}

fn trigger_all_endstops(config: &PrinterConfig, bus: &SimBus) {
    for pin in [
        config.pins.endstop_a.pin,
        config.pins.endstop_b.pin,
        config.pins.endstop_c.pin,
    ] {
        bus.set_external(pin, Some(Level::High));
    }
}

#[test]
fn homing_sets_known_position() {
    let config = PrinterConfig::default();
    let bus = SimBus::new();
    trigger_all_endstops(&config, &bus);

    let mut engine = sim_engine(&config, &bus, vec![MachineCommand::Home]);
    assert!(!engine.planner().is_homed());
    engine.run();

    assert!(engine.planner().is_homed());
    let position = engine.planner().position_um();
    // Carriages at H = 467 330 µm; effector centered below them.
    assert!(position[0].abs() < 1e-3);
    assert!(position[1].abs() < 1e-3);
    assert!((position[2] - 276_228.0).abs() < 2.0, "z = {}", position[2]);
    assert_eq!(engine.planner().carriage_steps(), [11_711; 3]);
}

#[test]
fn implicit_home_precedes_first_move() {
    let config = PrinterConfig::default();
    let bus = SimBus::new();
    trigger_all_endstops(&config, &bus);

    // The endstops stay "pressed" in the sim, so after the implicit home
    // completes and the queued move starts, the mid-move guard fires and
    // aborts it. Both behaviors are visible: the move was planned (its
    // target was committed), which only happens after a successful home,
    // and the abort then invalidated the homed flag.
    let mut engine = sim_engine(
        &config,
        &bus,
        vec![MachineCommand::Move {
            x_um: Some(5_000.0),
            y_um: None,
            z_um: Some(250_000.0),
            e_um: None,
            feedrate_mm_min: Some(3_000.0),
        }],
    );
    engine.run();

    let position = engine.planner().position_um();
    assert!((position[0] - 5_000.0).abs() < 1e-6, "x = {}", position[0]);
    assert!(position[1].abs() < 1e-3, "y = {}", position[1]);
    assert!((position[2] - 250_000.0).abs() < 1e-6, "z = {}", position[2]);
    // The held switch aborted the move mid-flight: position no longer
    // trusted.
    assert!(!engine.planner().is_homed());
}

#[test]
fn move_executes_and_commits_position() {
    let mut config = PrinterConfig::default();
    config.rates.home_before_first_move = false;
    let bus = SimBus::new();
    // Endstops untouched: pull-down keeps them released.

    let target_z = 200_000.0;
    let mut engine = sim_engine(
        &config,
        &bus,
        vec![MachineCommand::Move {
            x_um: Some(8_000.0),
            y_um: Some(-4_000.0),
            z_um: Some(target_z),
            e_um: None,
            feedrate_mm_min: Some(3_000.0),
        }],
    );
    engine.run();

    let position = engine.planner().position_um();
    assert!((position[0] - 8_000.0).abs() < 1e-6);
    assert!((position[1] + 4_000.0).abs() < 1e-6);
    assert!((position[2] - target_z).abs() < 1e-6);
    // Steps flowed: thousands of pulse starts and ends.
    assert!(engine.stats().dispatched > 1_000, "{}", engine.stats().dispatched);
    // With the sim clock deadlines are met exactly, modulo the 1 µs DIR
    // setup hold that can nudge past a shared deadline.
    assert!(engine.stats().max_latency_us <= 2, "{}", engine.stats().max_latency_us);
    assert_eq!(engine.stats().overruns, 0);
    // Pulses all closed: STEP lines parked at their default (low).
    assert_eq!(bus.driven_level(config.pins.step_a), Some(Level::Low));
    assert_eq!(bus.driven_level(config.pins.step_b), Some(Level::Low));
    assert_eq!(bus.driven_level(config.pins.step_c), Some(Level::Low));
}

#[test]
fn out_of_envelope_move_is_rejected_not_fatal() {
    let mut config = PrinterConfig::default();
    config.rates.home_before_first_move = false;
    let bus = SimBus::new();

    let mut engine = sim_engine(
        &config,
        &bus,
        vec![
            MachineCommand::Move {
                x_um: Some(90_000.0), // outside the 85 mm build radius
                y_um: Some(0.0),
                z_um: Some(200_000.0),
                e_um: None,
                feedrate_mm_min: None,
            },
            MachineCommand::Dwell { duration_us: 500 },
        ],
    );
    let before = engine.planner().position_um();
    engine.run();
    // Rejected move left the position untouched; the dwell still ran.
    assert_eq!(engine.planner().position_um(), before);
}

#[test]
fn dwell_blocks_until_its_deadline() {
    let mut config = PrinterConfig::default();
    config.rates.home_before_first_move = false;
    let bus = SimBus::new();
    let mut engine = sim_engine(
        &config,
        &bus,
        vec![MachineCommand::Dwell {
            duration_us: 250_000,
        }],
    );
    engine.run();
    assert!(engine.is_idle());
    assert!(engine.stats().dispatched >= 1);
}

#[test]
fn emergency_stop_aborts_and_parks_pins() {
    let config = PrinterConfig::default();
    let bus = SimBus::new();
    trigger_all_endstops(&config, &bus);

    let mut engine = sim_engine(
        &config,
        &bus,
        vec![
            MachineCommand::SetFan { duty: 0.5 },
            MachineCommand::EmergencyStop,
            // Never reached: the abort flag stops the loop first.
            MachineCommand::Home,
        ],
    );
    engine.run();

    // Every output is at its default state. The enable line is
    // write-inverted, so its logical-low default parks physically high
    // (drivers released).
    assert_eq!(bus.driven_level(config.pins.enable.pin), Some(Level::High));
    assert_eq!(bus.driven_level(config.pins.step_a), Some(Level::Low));
    assert_eq!(bus.driven_level(config.pins.dir_a), Some(Level::Low));
    // Hotend is write-inverted too: off = physically high.
    assert_eq!(bus.driven_level(config.pins.hotend.pin), Some(Level::High));
    assert_eq!(bus.driven_level(config.pins.fan.pin), Some(Level::Low));
    assert!(!engine.planner().is_homed());
}

#[test]
fn set_fan_runs_its_pwm_chain() {
    let mut config = PrinterConfig::default();
    config.rates.home_before_first_move = false;
    let bus = SimBus::new();
    let mut engine = sim_engine(
        &config,
        &bus,
        vec![
            MachineCommand::SetFan { duty: 0.25 },
            MachineCommand::Dwell { duration_us: 100_000 },
        ],
    );
    engine.run();
    // The chain ran at least one rising and one falling edge before the
    // drain stopped it.
    assert!(engine.stats().dispatched >= 3);
    // Shutdown parks the fan low again.
    assert_eq!(bus.driven_level(config.pins.fan.pin), Some(Level::Low));
}
