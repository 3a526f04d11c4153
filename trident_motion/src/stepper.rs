//! Lazy per-axis step generation.
//!
//! Each axis exposes the step boundaries its carriage crosses during a
//! motion segment as a pull iterator of `(axis, direction, deadline)`
//! events. For the delta towers the carriage height is a nonlinear
//! function of path position, so crossings are found numerically: a
//! bracketing scan in path-fraction space followed by bisection, then the
//! acceleration profile's closed-form inverse maps the crossing fraction
//! to an absolute time.
//!
//! The extruder is a plain linear map with steps spread uniformly in path
//! distance. Homing uses a constant step rate, bounded by the full travel.

use crate::accel::AccelProfile;
use std::sync::Arc;
use trident_common::consts::MIN_STEP_SPACING_US;

/// A motion axis: three delta towers plus the extruder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    A,
    B,
    C,
    E,
}

impl Axis {
    pub const ALL: [Axis; 4] = [Axis::A, Axis::B, Axis::C, Axis::E];

    pub fn index(self) -> usize {
        match self {
            Axis::A => 0,
            Axis::B => 1,
            Axis::C => 2,
            Axis::E => 3,
        }
    }

    pub fn tower(i: usize) -> Axis {
        match i {
            0 => Axis::A,
            1 => Axis::B,
            2 => Axis::C,
            _ => Axis::E,
        }
    }
}

/// Step direction: `Forward` raises a carriage or extrudes filament.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    Forward,
    Backward,
}

/// One step to be emitted at an absolute system-timer time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepEvent {
    pub axis: Axis,
    pub direction: StepDirection,
    pub deadline_us: u64,
}

/// A lazy, finite sequence of step events. Exhaustion is the only exit:
/// sources never fail, they run dry.
pub trait StepSource {
    fn next_step(&mut self) -> Option<StepEvent>;
}

// ─── Tower path ─────────────────────────────────────────────────────

/// Carriage height along a straight Cartesian segment, seen from one
/// tower. Coordinates are already bed-level corrected.
#[derive(Debug, Clone)]
pub struct TowerPath {
    start: [f64; 3],
    delta: [f64; 3],
    tower_x: f64,
    tower_y: f64,
    l_sq: f64,
}

impl TowerPath {
    pub fn new(start: [f64; 3], end: [f64; 3], tower_xy: (f64, f64), l_sq: f64) -> Self {
        Self {
            start,
            delta: [end[0] - start[0], end[1] - start[1], end[2] - start[2]],
            tower_x: tower_xy.0,
            tower_y: tower_xy.1,
            l_sq,
        }
    }

    /// Carriage height [µm] at path fraction `f` in [0, 1].
    pub fn height_at(&self, f: f64) -> f64 {
        let x = self.start[0] + f * self.delta[0];
        let y = self.start[1] + f * self.delta[1];
        let z = self.start[2] + f * self.delta[2];
        let dx = x - self.tower_x;
        let dy = y - self.tower_y;
        // The planner validated both endpoints; interior points of a chord
        // through a convex envelope stay reachable.
        z + (self.l_sq - dx * dx - dy * dy).max(0.0).sqrt()
    }
}

// ─── Delta axis stepper ─────────────────────────────────────────────

/// Step events for one delta tower over one motion segment.
pub struct DeltaAxisStepper {
    axis: Axis,
    path: TowerPath,
    /// Steps per µm of carriage travel.
    steps_per_um: f64,
    /// Carriage step position; `round(h · steps_per_um)` of the current
    /// height.
    current_steps: i64,
    profile: Arc<AccelProfile>,
    start_us: u64,
    /// Path fraction reached so far.
    f_now: f64,
    /// Bracketing scan increment in path-fraction space.
    scan_df: f64,
    last_deadline_us: u64,
    done: bool,
}

impl DeltaAxisStepper {
    pub fn new(
        axis: Axis,
        path: TowerPath,
        steps_per_m: f64,
        start_steps: i64,
        profile: Arc<AccelProfile>,
        start_us: u64,
    ) -> Self {
        let steps_per_um = steps_per_m * 1e-6;
        // Scan roughly four samples per expected step so each bracket holds
        // at most one crossing; the extremum of a non-monotone height adds
        // at most one direction reversal, which the margin absorbs.
        let est_steps =
            ((path.height_at(1.0) - path.height_at(0.0)).abs() * steps_per_um).ceil() + 8.0;
        let scan_df = 1.0 / (est_steps * 4.0);
        Self {
            axis,
            path,
            steps_per_um,
            current_steps: start_steps,
            profile,
            start_us,
            f_now: 0.0,
            scan_df,
            last_deadline_us: 0,
            done: false,
        }
    }

    /// Carriage step position after the events emitted so far.
    pub fn current_steps(&self) -> i64 {
        self.current_steps
    }

    /// Height at which `round(h · steps_per_um)` ticks from
    /// `current_steps` to the neighbor in the given direction.
    fn threshold(&self, up: bool) -> f64 {
        let half = if up { 0.5 } else { -0.5 };
        (self.current_steps as f64 + half) / self.steps_per_um
    }

    /// Bisect a bracketed crossing of `target_h` in `(lo, hi]`.
    fn bisect(&self, target_h: f64, mut lo: f64, mut hi: f64, rising: bool) -> f64 {
        for _ in 0..48 {
            let mid = 0.5 * (lo + hi);
            let crossed = if rising {
                self.path.height_at(mid) >= target_h
            } else {
                self.path.height_at(mid) <= target_h
            };
            if crossed {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        hi
    }

    fn emit(&mut self, f_cross: f64, up: bool) -> StepEvent {
        let s = f_cross * self.profile.distance_um();
        let t = self.start_us + (self.profile.time_at_distance(s) * 1e6).round() as u64;
        let deadline_us = if self.last_deadline_us == 0 {
            t
        } else {
            t.max(self.last_deadline_us + MIN_STEP_SPACING_US)
        };
        self.last_deadline_us = deadline_us;
        self.f_now = f_cross;
        self.current_steps += if up { 1 } else { -1 };
        StepEvent {
            axis: self.axis,
            direction: if up {
                StepDirection::Forward
            } else {
                StepDirection::Backward
            },
            deadline_us,
        }
    }
}

impl StepSource for DeltaAxisStepper {
    fn next_step(&mut self) -> Option<StepEvent> {
        if self.done {
            return None;
        }
        let up_h = self.threshold(true);
        let dn_h = self.threshold(false);

        let mut f = self.f_now;
        while f < 1.0 {
            let f_next = (f + self.scan_df).min(1.0);
            let h = self.path.height_at(f_next);
            if h >= up_h {
                let f_cross = self.bisect(up_h, f, f_next, true);
                return Some(self.emit(f_cross, true));
            }
            if h <= dn_h {
                let f_cross = self.bisect(dn_h, f, f_next, false);
                return Some(self.emit(f_cross, false));
            }
            f = f_next;
        }
        self.done = true;
        None
    }
}

// ─── Extruder stepper ───────────────────────────────────────────────

/// Extruder steps spread uniformly in path distance under the shared
/// velocity profile.
pub struct ExtruderStepper {
    total_steps: u64,
    direction: StepDirection,
    profile: Arc<AccelProfile>,
    start_us: u64,
    emitted: u64,
    last_deadline_us: u64,
}

impl ExtruderStepper {
    pub fn new(delta_steps: i64, profile: Arc<AccelProfile>, start_us: u64) -> Self {
        Self {
            total_steps: delta_steps.unsigned_abs(),
            direction: if delta_steps >= 0 {
                StepDirection::Forward
            } else {
                StepDirection::Backward
            },
            profile,
            start_us,
            emitted: 0,
            last_deadline_us: 0,
        }
    }
}

impl StepSource for ExtruderStepper {
    fn next_step(&mut self) -> Option<StepEvent> {
        if self.emitted >= self.total_steps {
            return None;
        }
        let fraction = (self.emitted as f64 + 0.5) / self.total_steps as f64;
        let s = fraction * self.profile.distance_um();
        let t = self.start_us + (self.profile.time_at_distance(s) * 1e6).round() as u64;
        let deadline_us = if self.last_deadline_us == 0 {
            t
        } else {
            t.max(self.last_deadline_us + MIN_STEP_SPACING_US)
        };
        self.last_deadline_us = deadline_us;
        self.emitted += 1;
        Some(StepEvent {
            axis: Axis::E,
            direction: self.direction,
            deadline_us,
        })
    }
}

// ─── Homing stepper ─────────────────────────────────────────────────

/// Constant-rate upward steps for the homing approach. The sequence is
/// bounded by the full-travel ceiling; the endstop normally cuts it short.
pub struct HomingStepper {
    axis: Axis,
    period_us: u64,
    start_us: u64,
    remaining: u64,
    emitted: u64,
}

impl HomingStepper {
    pub fn new(axis: Axis, period_us: u64, max_steps: u64, start_us: u64) -> Self {
        Self {
            axis,
            period_us: period_us.max(MIN_STEP_SPACING_US),
            start_us,
            remaining: max_steps,
            emitted: 0,
        }
    }
}

impl StepSource for HomingStepper {
    fn next_step(&mut self) -> Option<StepEvent> {
        if self.emitted >= self.remaining {
            return None;
        }
        self.emitted += 1;
        Some(StepEvent {
            axis: self.axis,
            direction: StepDirection::Forward,
            deadline_us: self.start_us + self.emitted * self.period_us,
        })
    }
}

// ─── Merge ──────────────────────────────────────────────────────────

/// Merge several per-axis sources into one deadline-ordered stream.
///
/// One pending event is held per source; each pull takes the earliest and
/// refills from its source. Ties resolve in source order, which keeps the
/// merge stable.
pub struct MergedSteps {
    sources: Vec<Box<dyn StepSource + Send>>,
    pending: Vec<Option<StepEvent>>,
}

impl MergedSteps {
    pub fn new(mut sources: Vec<Box<dyn StepSource + Send>>) -> Self {
        let pending = sources.iter_mut().map(|s| s.next_step()).collect();
        Self { sources, pending }
    }
}

impl StepSource for MergedSteps {
    fn next_step(&mut self) -> Option<StepEvent> {
        let mut best: Option<(usize, u64)> = None;
        for (i, ev) in self.pending.iter().enumerate() {
            if let Some(ev) = ev {
                match best {
                    Some((_, deadline)) if deadline <= ev.deadline_us => {}
                    _ => best = Some((i, ev.deadline_us)),
                }
            }
        }
        let (i, _) = best?;
        let event = self.pending[i].take();
        self.pending[i] = self.sources[i].next_step();
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::DeltaKinematics;
    use crate::matrix::Matrix3;
    use trident_common::config::GeometryConfig;

    fn kin() -> DeltaKinematics {
        DeltaKinematics::new(&GeometryConfig::default(), Matrix3::identity()).unwrap()
    }

    fn tower_stepper(
        kin: &DeltaKinematics,
        tower: usize,
        start: [f64; 3],
        end: [f64; 3],
        v: f64,
    ) -> DeltaAxisStepper {
        let d = ((end[0] - start[0]).powi(2)
            + (end[1] - start[1]).powi(2)
            + (end[2] - start[2]).powi(2))
        .sqrt();
        let profile = Arc::new(AccelProfile::plan(d, v, 0.0, 0.0, 1_200_000.0));
        let path = TowerPath::new(start, end, kin.tower_xy(tower), kin.rod_length_sq());
        let h0 = kin.carriage_heights(start).unwrap()[tower];
        DeltaAxisStepper::new(
            Axis::tower(tower),
            path,
            kin.steps_per_m(),
            kin.steps_for_height(h0),
            profile,
            1_000,
        )
    }

    fn drain(source: &mut dyn StepSource) -> Vec<StepEvent> {
        let mut events = Vec::new();
        while let Some(ev) = source.next_step() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn vertical_move_emits_exact_step_count() {
        let kin = kin();
        // Straight up at the center: every tower height tracks z exactly.
        let start = [0.0, 0.0, 0.0];
        let end = [0.0, 0.0, 10_000.0];
        let mut stepper = tower_stepper(&kin, 0, start, end, 50_000.0);
        let events = drain(&mut stepper);

        let h0 = kin.carriage_heights(start).unwrap()[0];
        let h1 = kin.carriage_heights(end).unwrap()[0];
        let expected = (kin.steps_for_height(h1) - kin.steps_for_height(h0)).unsigned_abs();
        assert_eq!(events.len() as u64, expected);
        assert!(events
            .iter()
            .all(|e| e.direction == StepDirection::Forward));
        assert_eq!(stepper.current_steps(), kin.steps_for_height(h1));
    }

    #[test]
    fn lateral_move_conserves_steps_on_every_tower() {
        let kin = kin();
        let start = [-20_000.0, 10_000.0, 5_000.0];
        let end = [35_000.0, -25_000.0, 15_000.0];
        for tower in 0..3 {
            let mut stepper = tower_stepper(&kin, tower, start, end, 50_000.0);
            let events = drain(&mut stepper);
            let h0 = kin.carriage_heights(start).unwrap()[tower];
            let h1 = kin.carriage_heights(end).unwrap()[tower];
            let net: i64 = events
                .iter()
                .map(|e| match e.direction {
                    StepDirection::Forward => 1,
                    StepDirection::Backward => -1,
                })
                .sum();
            assert_eq!(
                net,
                kin.steps_for_height(h1) - kin.steps_for_height(h0),
                "tower {tower}"
            );
        }
    }

    #[test]
    fn deadlines_are_monotone_with_minimum_spacing() {
        let kin = kin();
        let mut stepper = tower_stepper(
            &kin,
            1,
            [0.0, 0.0, 0.0],
            [40_000.0, 20_000.0, 8_000.0],
            50_000.0,
        );
        let events = drain(&mut stepper);
        assert!(!events.is_empty());
        for pair in events.windows(2) {
            assert!(
                pair[1].deadline_us >= pair[0].deadline_us + MIN_STEP_SPACING_US,
                "{:?} then {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn deadlines_end_inside_segment_duration() {
        let kin = kin();
        let start = [0.0, 0.0, 0.0];
        let end = [0.0, 0.0, 20_000.0];
        let d = 20_000.0;
        let profile = Arc::new(AccelProfile::plan(d, 50_000.0, 0.0, 0.0, 1_200_000.0));
        let h0 = kin.carriage_heights(start).unwrap()[0];
        let mut stepper = DeltaAxisStepper::new(
            Axis::A,
            TowerPath::new(start, end, kin.tower_xy(0), kin.rod_length_sq()),
            kin.steps_per_m(),
            kin.steps_for_height(h0),
            profile.clone(),
            1_000,
        );
        let events = drain(&mut stepper);
        let t_end = 1_000 + (profile.duration_s() * 1e6) as u64;
        // Small slack for the minimum-spacing pushback on the final steps.
        for ev in &events {
            assert!(ev.deadline_us <= t_end + 100, "{ev:?} past {t_end}");
        }
    }

    #[test]
    fn extruder_emits_linear_step_count() {
        let profile = Arc::new(AccelProfile::plan(5_000.0, 50_000.0, 0.0, 0.0, 1_200_000.0));
        let mut stepper = ExtruderStepper::new(400, profile, 0);
        let events = drain(&mut stepper);
        assert_eq!(events.len(), 400);
        assert!(events.iter().all(|e| e.axis == Axis::E));
        assert!(events
            .iter()
            .all(|e| e.direction == StepDirection::Forward));
        for pair in events.windows(2) {
            assert!(pair[1].deadline_us >= pair[0].deadline_us + MIN_STEP_SPACING_US);
        }
    }

    #[test]
    fn retraction_steps_backward() {
        let profile = Arc::new(AccelProfile::plan(500.0, 60_000.0, 0.0, 0.0, 1_200_000.0));
        let mut stepper = ExtruderStepper::new(-40, profile, 0);
        let events = drain(&mut stepper);
        assert_eq!(events.len(), 40);
        assert!(events
            .iter()
            .all(|e| e.direction == StepDirection::Backward));
    }

    #[test]
    fn homing_stepper_paces_and_bounds() {
        let mut stepper = HomingStepper::new(Axis::B, 250, 5, 10_000);
        let events = drain(&mut stepper);
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].deadline_us, 10_250);
        assert_eq!(events[4].deadline_us, 11_250);
        assert!(events
            .iter()
            .all(|e| e.direction == StepDirection::Forward));
    }

    #[test]
    fn merge_orders_across_sources() {
        let a = HomingStepper::new(Axis::A, 300, 4, 0);
        let b = HomingStepper::new(Axis::B, 200, 6, 0);
        let sources: Vec<Box<dyn StepSource + Send>> = vec![Box::new(a), Box::new(b)];
        let mut merged = MergedSteps::new(sources);
        let events = drain(&mut merged);
        assert_eq!(events.len(), 10);
        for pair in events.windows(2) {
            assert!(pair[1].deadline_us >= pair[0].deadline_us);
        }
        // Equal deadlines (600, 1200) resolve in source order: A first.
        let at_600: Vec<Axis> = events
            .iter()
            .filter(|e| e.deadline_us == 600)
            .map(|e| e.axis)
            .collect();
        assert_eq!(at_600, vec![Axis::A, Axis::B]);
    }
}
