//! The engine: command dispatch, event application, and the main loop.
//!
//! Single-threaded and cooperative. The scheduler decides *when*; this
//! module decides *what*: step pulses through the A4988 drivers, PWM edges
//! on the heater and fan, thermistor phase transitions, endstop reactions,
//! and the handoff from one machine command to the next. At most one
//! motion is in flight; commands are consumed only while idle.

use crate::control::TempController;
use crate::emitter::DmaEmitter;
use crate::error::EngineError;
use crate::scheduler::event::{PwmChannel, SchedEvent};
use crate::scheduler::Scheduler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::Duration;
use trident_common::command::MachineCommand;
use trident_common::config::PrinterConfig;
use trident_common::consts::{DIR_SETUP_US, ENDSTOP_POLL_US, STEP_PULSE_US, THERM_POLL_US};
use trident_hal::drivers::{A4988, Endstop, RcThermistor, ThermPoll};
use trident_hal::pin::deactivate_all;
use trident_hal::{Clock, DefaultState, IoPin, Level, PinBackend, PinFlags, PrimitiveIoPin};
use trident_motion::kinematics::DeltaKinematics;
use trident_motion::matrix::Matrix3;
use trident_motion::planner::MotionPlanner;
use trident_motion::stepper::{Axis, HomingStepper, MergedSteps, StepDirection, StepSource};

/// Scheduling margin between planning a motion and its first deadline [µs].
const MOTION_LEAD_US: u64 = 1_000;

/// Part-cooling fan software PWM period [µs] (25 Hz).
const FAN_PWM_PERIOD_US: u64 = 40_000;

/// PWM edges are scheduled this far past the tick that computes them, so
/// the DMA rasterizer always sees them ahead of its read cursor. A fixed
/// phase shift; duty is unaffected.
const PWM_EDGE_LEAD_US: u64 = 1_000;

/// How to get edges onto the pins.
pub enum Emitter {
    /// Busy-wait to each deadline, then write GPIO directly.
    Direct,
    /// Rasterize edges into the DMA ring ahead of time.
    Dma(DmaEmitter),
}

enum EngineState {
    Idle,
    Moving,
    Homing,
    Dwelling,
    WaitingTemp { tolerance_c: f64 },
}

pub struct Engine<C: Clock> {
    scheduler: Scheduler<C>,
    planner: MotionPlanner,
    /// A, B, C, E in axis order.
    steppers: [A4988; 4],
    endstops: [Endstop; 3],
    therm: RcThermistor,
    hotend: IoPin,
    fan: IoPin,
    temp: TempController,
    emitter: Emitter,
    intake: Receiver<MachineCommand>,
    abort: Arc<AtomicBool>,

    state: EngineState,
    motion: Option<MergedSteps>,
    homing: [Option<HomingStepper>; 3],
    pending_move: Option<MachineCommand>,
    hotend_duty: f64,
    fan_duty: f64,
    temp_chain_live: bool,
    fan_chain_live: bool,
    /// Intake closed; stop renewing recurring chains and drain out.
    draining: bool,
    /// Lead distance for holding DMA rasterization near the window [µs].
    dma_lead_us: u64,
}

impl<C: Clock> Engine<C> {
    /// Wire up every driver from the pin configuration and hand the
    /// engine its clock, backend, and command queue.
    pub fn new(
        config: &PrinterConfig,
        backend: PinBackend,
        clock: C,
        intake: Receiver<MachineCommand>,
        abort: Arc<AtomicBool>,
        emitter: Emitter,
    ) -> Result<Self, EngineError> {
        let pins = &config.pins;
        let out = |line: u32, inverted: bool| {
            let flags = if inverted {
                PinFlags::INVERT_WRITES
            } else {
                PinFlags::empty()
            };
            IoPin::new(
                PrimitiveIoPin::new(backend.clone(), line),
                flags,
                DefaultState::Low,
            )
        };

        let enable = Arc::new(out(pins.enable.pin, pins.enable.inverted));
        enable.make_digital_output(Level::Low);

        let steppers = [
            A4988::new(out(pins.step_a, false), out(pins.dir_a, false), enable.clone()),
            A4988::new(out(pins.step_b, false), out(pins.dir_b, false), enable.clone()),
            A4988::new(out(pins.step_c, false), out(pins.dir_c, false), enable.clone()),
            A4988::new(out(pins.step_e, false), out(pins.dir_e, false), enable),
        ];

        let endstop = |cfg: &trident_common::config::InputPin| {
            let flags = if cfg.inverted {
                PinFlags::INVERT_READS
            } else {
                PinFlags::empty()
            };
            let pin = IoPin::new(
                PrimitiveIoPin::new(backend.clone(), cfg.pin),
                flags,
                DefaultState::HighImpedance,
            );
            Endstop::new(pin, cfg.pull.into())
        };
        let endstops = [
            endstop(&pins.endstop_a),
            endstop(&pins.endstop_b),
            endstop(&pins.endstop_c),
        ];

        let therm_pin = IoPin::new(
            PrimitiveIoPin::new(backend.clone(), pins.therm_sense),
            PinFlags::empty(),
            DefaultState::HighImpedance,
        );
        let therm = RcThermistor::new(therm_pin, config.thermistor.clone());

        let hotend = out(pins.hotend.pin, pins.hotend.inverted);
        hotend.make_digital_output(Level::Low);
        let fan = out(pins.fan.pin, pins.fan.inverted);
        fan.make_digital_output(Level::Low);

        let bed_level = Matrix3::from_rows(config.bed_level.matrix);
        let kin = DeltaKinematics::new(&config.geometry, bed_level)?;
        let planner = MotionPlanner::new(kin, config.rates.clone())?;

        let dma_lead_us = match &emitter {
            Emitter::Dma(em) => em.window_us() / 2,
            Emitter::Direct => 0,
        };

        Ok(Self {
            scheduler: Scheduler::new(clock),
            planner,
            steppers,
            endstops,
            therm,
            hotend,
            fan,
            temp: TempController::new(&config.heater),
            emitter,
            intake,
            abort,
            state: EngineState::Idle,
            motion: None,
            homing: [None, None, None],
            pending_move: None,
            hotend_duty: 0.0,
            fan_duty: 0.0,
            temp_chain_live: false,
            fan_chain_live: false,
            draining: false,
            dma_lead_us,
        })
    }

    pub fn planner(&self) -> &MotionPlanner {
        &self.planner
    }

    pub fn stats(&self) -> &crate::scheduler::SchedStats {
        self.scheduler.stats()
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, EngineState::Idle)
    }

    /// Duty cycle the heater PWM is currently running.
    pub fn hotend_duty(&self) -> f64 {
        self.hotend_duty
    }

    /// The main loop. Returns when the abort flag is raised or the intake
    /// closes and all pending work has drained.
    pub fn run(&mut self) {
        tracing::info!("engine running");
        loop {
            if self.abort.load(Ordering::SeqCst) {
                tracing::warn!("abort flag raised; stopping");
                break;
            }

            if matches!(self.state, EngineState::Idle) {
                match self.intake.try_recv() {
                    Ok(cmd) => {
                        self.dispatch(cmd);
                        continue;
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => {
                        self.draining = true;
                        if self.scheduler.is_empty() {
                            break;
                        }
                    }
                }
            }

            if self.scheduler.is_empty() {
                // Nothing scheduled: block briefly for the next command.
                match self.intake.recv_timeout(Duration::from_millis(20)) {
                    Ok(cmd) => self.dispatch(cmd),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                continue;
            }

            if let Some((deadline, event)) = self.pop_next_event() {
                self.apply(deadline, event);
            }
        }
        self.shutdown();
    }

    /// Pop the next event, honoring the emission mode: direct mode waits
    /// out the deadline; DMA mode pops pin edges early so they can be
    /// rasterized ahead of the read cursor.
    fn pop_next_event(&mut self) -> Option<(u64, SchedEvent)> {
        match &mut self.emitter {
            Emitter::Direct => self.scheduler.pop_blocking(),
            Emitter::Dma(em) => {
                em.maintain();
                if self.scheduler.peek_is_pin_edge()? {
                    let horizon = em.horizon_us();
                    match self.scheduler.pop_before(horizon) {
                        Some(popped) => Some(popped),
                        None => {
                            // Beyond the window: hold until the deadline
                            // drifts into rasterization range.
                            let deadline = self.scheduler.peek_deadline()?;
                            self.scheduler
                                .clock()
                                .wait_until(deadline.saturating_sub(self.dma_lead_us));
                            None
                        }
                    }
                } else {
                    self.scheduler.pop_blocking()
                }
            }
        }
    }

    // ─── Command dispatch ───────────────────────────────────────────

    fn dispatch(&mut self, command: MachineCommand) {
        tracing::debug!(?command, "dispatch");
        match command {
            MachineCommand::Move {
                x_um,
                y_um,
                z_um,
                e_um,
                feedrate_mm_min,
            } => {
                if self.planner.needs_home() {
                    tracing::info!("implicit home before first move");
                    self.pending_move = Some(MachineCommand::Move {
                        x_um,
                        y_um,
                        z_um,
                        e_um,
                        feedrate_mm_min,
                    });
                    self.start_home();
                } else {
                    self.start_move(x_um, y_um, z_um, e_um, feedrate_mm_min);
                }
            }
            MachineCommand::Home => self.start_home(),
            MachineCommand::Dwell { duration_us } => {
                let now = self.scheduler.now_us();
                self.scheduler.push(now + duration_us, SchedEvent::NoOp);
                self.state = EngineState::Dwelling;
            }
            MachineCommand::SetHotendTemp { deg_c } => {
                tracing::info!(deg_c = ?deg_c, "hotend target");
                self.temp.set_target(deg_c);
                if deg_c.is_some() {
                    self.ensure_temp_chain();
                }
            }
            MachineCommand::WaitHotendTemp { tolerance_c } => {
                if self.temp.target_c().is_some() {
                    self.ensure_temp_chain();
                    self.state = EngineState::WaitingTemp { tolerance_c };
                } else {
                    tracing::warn!("wait-for-temp without a target; ignored");
                }
            }
            MachineCommand::SetFan { duty } => {
                self.fan_duty = duty.clamp(0.0, 1.0);
                self.ensure_fan_chain();
            }
            MachineCommand::EmergencyStop => self.emergency_stop(),
        }
    }

    fn start_move(
        &mut self,
        x_um: Option<f64>,
        y_um: Option<f64>,
        z_um: Option<f64>,
        e_um: Option<f64>,
        feedrate_mm_min: Option<f64>,
    ) {
        let start = self.scheduler.now_us() + MOTION_LEAD_US;
        match self
            .planner
            .plan_move(x_um, y_um, z_um, e_um, feedrate_mm_min, start)
        {
            Ok(Some(mut plan)) => {
                if let Some(first) = plan.steps.next_step() {
                    self.steppers[0].enable(true);
                    self.scheduler.push(
                        first.deadline_us,
                        SchedEvent::StepPulseStart {
                            axis: first.axis,
                            direction: first.direction,
                        },
                    );
                    self.motion = Some(plan.steps);
                    self.state = EngineState::Moving;
                    self.push_endstop_polls(start);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "move rejected"),
        }
    }

    fn start_home(&mut self) {
        let start = self.scheduler.now_us() + MOTION_LEAD_US;
        let plan = self.planner.plan_home(start);
        self.steppers[0].enable(true);
        let [a, b, c] = plan.steppers;
        self.homing = [Some(a), Some(b), Some(c)];
        self.state = EngineState::Homing;
        for tower in 0..3 {
            self.pump_homing_axis(tower);
        }
        self.push_endstop_polls(start);
        tracing::info!("homing started");
    }

    fn push_endstop_polls(&mut self, start_us: u64) {
        // Stale chains from a previous motion would re-arm themselves once
        // a new motion is in flight; one chain per tower, always.
        self.scheduler
            .retain(|e| !matches!(e, SchedEvent::EndstopPoll { .. }));
        for tower in 0..3 {
            self.scheduler
                .push(start_us + ENDSTOP_POLL_US, SchedEvent::EndstopPoll { tower });
        }
    }

    fn ensure_temp_chain(&mut self) {
        if !self.temp_chain_live {
            self.temp_chain_live = true;
            let now = self.scheduler.now_us();
            self.scheduler.push(now, SchedEvent::TempControl);
        }
    }

    fn ensure_fan_chain(&mut self) {
        if !self.fan_chain_live {
            self.fan_chain_live = true;
            let now = self.scheduler.now_us();
            self.scheduler.push(
                now + PWM_EDGE_LEAD_US,
                SchedEvent::PwmEdge {
                    channel: PwmChannel::Fan,
                    rising: true,
                },
            );
        }
    }

    // ─── Event application ──────────────────────────────────────────

    fn apply(&mut self, deadline: u64, event: SchedEvent) {
        match event {
            SchedEvent::StepPulseStart { axis, direction } => {
                self.apply_step_start(deadline, axis, direction)
            }
            SchedEvent::StepPulseEnd { axis } => self.steppers[axis.index()].step_low(),
            SchedEvent::PwmEdge { channel, rising } => {
                self.apply_pwm_edge(deadline, channel, rising)
            }
            SchedEvent::EndstopPoll { tower } => self.apply_endstop_poll(deadline, tower),
            SchedEvent::ThermDischargeDone => {
                let now = self.scheduler.now_us();
                self.therm.begin_reading(now);
                self.scheduler.push(now + THERM_POLL_US, SchedEvent::ThermPoll);
            }
            SchedEvent::ThermPoll => self.apply_therm_poll(deadline),
            SchedEvent::TempControl => self.apply_temp_control(deadline),
            SchedEvent::NoOp => {
                if matches!(self.state, EngineState::Dwelling) {
                    self.state = EngineState::Idle;
                }
            }
        }
    }

    fn apply_step_start(&mut self, deadline: u64, axis: Axis, direction: StepDirection) {
        let forward = direction == StepDirection::Forward;
        let idx = axis.index();
        match &mut self.emitter {
            Emitter::Direct => {
                if self.steppers[idx].set_direction(forward) {
                    // Hold DIR stable before the rising edge.
                    let now = self.scheduler.now_us();
                    self.scheduler.clock().wait_until(now + DIR_SETUP_US);
                }
                self.steppers[idx].step_high();
                self.scheduler
                    .push(deadline + STEP_PULSE_US, SchedEvent::StepPulseEnd { axis });
            }
            Emitter::Dma(em) => {
                let driver = &mut self.steppers[idx];
                let changed = driver.note_direction(forward);
                if let (Some(step_line), Some(dir_line)) =
                    (driver.step_line(), driver.dir_line())
                {
                    let step_high = driver.step_set_is_physical_high();
                    let dir_fwd_high = driver.dir_forward_is_physical_high();
                    if changed {
                        let phys = if forward { dir_fwd_high } else { !dir_fwd_high };
                        log_underrun(em.emit(
                            deadline.saturating_sub(DIR_SETUP_US),
                            dir_line,
                            phys,
                        ));
                    }
                    log_underrun(em.emit(deadline, step_line, step_high));
                    log_underrun(em.emit(deadline + STEP_PULSE_US, step_line, !step_high));
                } else {
                    // Null or simulated lines have no DMA bit; fall back to
                    // immediate writes.
                    driver.set_direction(forward);
                    driver.step_high();
                    driver.step_low();
                }
            }
        }
        self.pump_after_step(axis);
    }

    /// Refill the heap with the next event of whichever stream produced
    /// this step.
    fn pump_after_step(&mut self, axis: Axis) {
        match self.state {
            EngineState::Moving => {
                let exhausted = match &mut self.motion {
                    Some(stream) => match stream.next_step() {
                        Some(ev) => {
                            self.scheduler.push(
                                ev.deadline_us,
                                SchedEvent::StepPulseStart {
                                    axis: ev.axis,
                                    direction: ev.direction,
                                },
                            );
                            false
                        }
                        None => true,
                    },
                    None => false,
                };
                if exhausted {
                    self.motion = None;
                    self.state = EngineState::Idle;
                    tracing::debug!(position = ?self.planner.position_um(), "move complete");
                }
            }
            EngineState::Homing => self.pump_homing_axis(axis.index()),
            _ => {}
        }
    }

    fn pump_homing_axis(&mut self, tower: usize) {
        if tower >= 3 {
            return;
        }
        let exhausted = match &mut self.homing[tower] {
            Some(source) => match source.next_step() {
                Some(ev) => {
                    self.scheduler.push(
                        ev.deadline_us,
                        SchedEvent::StepPulseStart {
                            axis: ev.axis,
                            direction: ev.direction,
                        },
                    );
                    false
                }
                None => true,
            },
            None => false,
        };
        if exhausted {
            // Ran the whole travel without a trigger: a wiring or switch
            // fault. Abort rather than grind the carriage into the frame.
            tracing::error!(tower, "homing travel exhausted without endstop trigger");
            self.abort_motion();
        }
    }

    fn apply_endstop_poll(&mut self, deadline: u64, tower: usize) {
        match self.state {
            EngineState::Homing => {
                if self.endstops[tower].is_triggered() {
                    self.homing[tower] = None;
                    // Retract this carriage's remaining steps; everything
                    // else in the heap stands.
                    self.scheduler.retain(|e| {
                        !matches!(e,
                            SchedEvent::StepPulseStart { axis, .. } if axis.index() == tower)
                    });
                    tracing::info!(tower, "endstop reached");
                    if self.homing.iter().all(Option::is_none) {
                        match self.planner.finish_home() {
                            Ok(()) => {
                                self.state = EngineState::Idle;
                                if let Some(cmd) = self.pending_move.take() {
                                    self.dispatch(cmd);
                                }
                            }
                            Err(e) => tracing::error!(error = %e, "home finish failed"),
                        }
                    }
                } else {
                    self.scheduler
                        .push(deadline + ENDSTOP_POLL_US, SchedEvent::EndstopPoll { tower });
                }
            }
            EngineState::Moving => {
                if self.endstops[tower].is_triggered() {
                    let err = EngineError::EndstopTriggeredMidMove { tower };
                    tracing::error!(error = %err, "aborting move");
                    self.abort_motion();
                } else {
                    self.scheduler
                        .push(deadline + ENDSTOP_POLL_US, SchedEvent::EndstopPoll { tower });
                }
            }
            // Poll chains die with the motion that spawned them.
            _ => {}
        }
    }

    fn apply_pwm_edge(&mut self, deadline: u64, channel: PwmChannel, rising: bool) {
        match channel {
            PwmChannel::Hotend => {
                let level = if rising { Level::High } else { Level::Low };
                write_pin(&mut self.emitter, &self.hotend, deadline, level);
            }
            PwmChannel::Fan => {
                if rising {
                    let duty = self.fan_duty;
                    if duty > 0.001 {
                        write_pin(&mut self.emitter, &self.fan, deadline, Level::High);
                        if duty < 0.999 {
                            let fall = deadline + (duty * FAN_PWM_PERIOD_US as f64) as u64;
                            self.scheduler.push(
                                fall,
                                SchedEvent::PwmEdge {
                                    channel,
                                    rising: false,
                                },
                            );
                        }
                    } else {
                        write_pin(&mut self.emitter, &self.fan, deadline, Level::Low);
                    }
                    if !self.draining {
                        self.scheduler.push(
                            deadline + FAN_PWM_PERIOD_US,
                            SchedEvent::PwmEdge {
                                channel,
                                rising: true,
                            },
                        );
                    } else {
                        self.fan_chain_live = false;
                    }
                } else {
                    write_pin(&mut self.emitter, &self.fan, deadline, Level::Low);
                }
            }
        }
    }

    fn apply_therm_poll(&mut self, deadline: u64) {
        let now = self.scheduler.now_us();
        match self.therm.poll(now) {
            ThermPoll::Pending => {
                // Only the chain belonging to the live read renews itself;
                // a restarted cycle spawns a fresh one.
                if self.therm.is_reading() {
                    self.scheduler
                        .push(deadline + THERM_POLL_US, SchedEvent::ThermPoll);
                }
            }
            ThermPoll::Done(deg_c) => {
                tracing::trace!(deg_c, "thermistor sample");
                self.temp.on_sample(deg_c);
                if let EngineState::WaitingTemp { tolerance_c } = self.state {
                    if self.temp.at_target(tolerance_c) {
                        tracing::info!(deg_c, "temperature reached");
                        self.state = EngineState::Idle;
                    }
                }
            }
            ThermPoll::Fault => {
                if self.temp.on_sample_fault() {
                    let err = EngineError::TempSensorFault;
                    tracing::error!(error = %err, "heater latched off");
                    if let EngineState::WaitingTemp { .. } = self.state {
                        // Never wait forever on a dead sensor.
                        self.state = EngineState::Idle;
                    }
                }
            }
        }
    }

    fn apply_temp_control(&mut self, deadline: u64) {
        let duty = self.temp.compute_duty();
        self.hotend_duty = duty;

        let period = self.temp.period_us();
        let pulse_start = deadline + PWM_EDGE_LEAD_US;
        if duty > 0.001 {
            self.scheduler.push(
                pulse_start,
                SchedEvent::PwmEdge {
                    channel: PwmChannel::Hotend,
                    rising: true,
                },
            );
            if duty < 0.999 {
                let fall = pulse_start + (duty * period as f64) as u64;
                self.scheduler.push(
                    fall,
                    SchedEvent::PwmEdge {
                        channel: PwmChannel::Hotend,
                        rising: false,
                    },
                );
            }
        } else {
            self.scheduler.push(
                pulse_start,
                SchedEvent::PwmEdge {
                    channel: PwmChannel::Hotend,
                    rising: false,
                },
            );
        }

        // One thermistor read per control period. A read still pending
        // from the previous period never crossed the threshold: count it
        // as a discarded sample so a dead sensor latches the heater off.
        if self.therm.is_reading() && self.temp.on_sample_fault() {
            let err = EngineError::TempSensorFault;
            tracing::error!(error = %err, "heater latched off");
        }
        let discharge_done = self.therm.start_discharge(deadline);
        self.scheduler
            .push(discharge_done, SchedEvent::ThermDischargeDone);

        if !self.draining {
            self.scheduler.push(deadline + period, SchedEvent::TempControl);
        } else {
            self.temp_chain_live = false;
        }
    }

    // ─── Failure paths ──────────────────────────────────────────────

    /// Abort whatever motion is in flight. Open pulses still close (their
    /// falling edges stay in the heap); the believed position is no longer
    /// trusted.
    fn abort_motion(&mut self) {
        self.scheduler.retain(|e| {
            !matches!(
                e,
                SchedEvent::StepPulseStart { .. } | SchedEvent::EndstopPoll { .. } | SchedEvent::NoOp
            )
        });
        self.motion = None;
        self.homing = [None, None, None];
        self.pending_move = None;
        self.planner.invalidate_position();
        self.state = EngineState::Idle;
    }

    fn emergency_stop(&mut self) {
        tracing::warn!("emergency stop");
        self.abort.store(true, Ordering::SeqCst);
        self.scheduler.clear();
        self.motion = None;
        self.homing = [None, None, None];
        self.pending_move = None;
        deactivate_all();
    }

    fn shutdown(&mut self) {
        if let Emitter::Dma(em) = &mut self.emitter {
            em.shutdown();
        }
        self.steppers[0].enable(false);
        deactivate_all();
        let stats = self.scheduler.stats();
        tracing::info!(
            dispatched = stats.dispatched,
            max_latency_us = stats.max_latency_us,
            overruns = stats.overruns,
            "engine stopped"
        );
    }
}

/// Route one logical pin level through the active emission path.
fn write_pin(emitter: &mut Emitter, pin: &IoPin, deadline_us: u64, level: Level) {
    match emitter {
        Emitter::Direct => pin.digital_write(level),
        Emitter::Dma(em) => match pin.line() {
            Some(line) => {
                let physical_high = pin.translate_write(level) == Level::High;
                log_underrun(em.emit(deadline_us, line, physical_high));
            }
            None => pin.digital_write(level),
        },
    }
}

fn log_underrun(result: Result<(), EngineError>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "DMA emission");
    }
}
