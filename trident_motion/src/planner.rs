//! Motion planner: commands in, merged step streams out.
//!
//! The planner owns the machine's believed position (carriage steps plus
//! Cartesian shadow) and turns each move into one acceleration profile
//! shared by four axis steppers. One motion is in flight at a time; the
//! planner commits the end position when the plan is handed out.

use crate::accel::AccelProfile;
use crate::error::MotionError;
use crate::kinematics::DeltaKinematics;
use crate::stepper::{
    Axis, DeltaAxisStepper, ExtruderStepper, HomingStepper, MergedSteps, StepSource, TowerPath,
};
use std::sync::Arc;
use trident_common::command::FeedrateKind;
use trident_common::config::RateConfig;
use trident_common::consts::MIN_STEP_SPACING_US;

/// Moves shorter than this are dropped as no-ops [µm].
const MIN_SEGMENT_UM: f64 = 0.5;

/// Extra travel allowed past the nominal height during homing, for
/// carriages that start below zero or lost steps.
const HOME_TRAVEL_MARGIN: f64 = 1.25;

/// A planned move: the merged lazy step stream plus its nominal duration.
pub struct MovePlan {
    pub steps: MergedSteps,
    pub duration_us: u64,
    pub kind: FeedrateKind,
}

impl std::fmt::Debug for MovePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MovePlan")
            .field("duration_us", &self.duration_us)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// A planned homing approach: one independent stepper per tower. The
/// scheduler retires each one as its endstop triggers.
pub struct HomePlan {
    pub steppers: [HomingStepper; 3],
}

pub struct MotionPlanner {
    kin: DeltaKinematics,
    rates: RateConfig,
    carriage_steps: [i64; 3],
    e_steps: i64,
    position_um: [f64; 3],
    e_position_um: f64,
    homed: bool,
}

impl MotionPlanner {
    pub fn new(kin: DeltaKinematics, rates: RateConfig) -> Result<Self, MotionError> {
        // Until the first home the position is a guess; starting from the
        // homed pose keeps the numbers finite and the guard below keeps it
        // honest.
        let position_um = kin.home_cartesian()?;
        let carriage_steps = kin.carriage_steps(position_um)?;
        Ok(Self {
            kin,
            rates,
            carriage_steps,
            e_steps: 0,
            position_um,
            e_position_um: 0.0,
            homed: false,
        })
    }

    pub fn kinematics(&self) -> &DeltaKinematics {
        &self.kin
    }

    pub fn position_um(&self) -> [f64; 3] {
        self.position_um
    }

    pub fn carriage_steps(&self) -> [i64; 3] {
        self.carriage_steps
    }

    pub fn is_homed(&self) -> bool {
        self.homed
    }

    /// Whether the next move must be preceded by an implicit home.
    pub fn needs_home(&self) -> bool {
        self.rates.home_before_first_move && !self.homed
    }

    /// After an aborted motion the believed position is wrong; force a
    /// home before anything else moves.
    pub fn invalidate_position(&mut self) {
        self.homed = false;
    }

    /// Plan a linear move starting at `start_us`. `None` components keep
    /// the current coordinate. Returns `Ok(None)` for no-op moves.
    ///
    /// On success the planner's position is committed to the target; the
    /// returned stream owns the actual emission.
    pub fn plan_move(
        &mut self,
        x_um: Option<f64>,
        y_um: Option<f64>,
        z_um: Option<f64>,
        e_um: Option<f64>,
        feedrate_mm_min: Option<f64>,
        start_us: u64,
    ) -> Result<Option<MovePlan>, MotionError> {
        let target = [
            x_um.unwrap_or(self.position_um[0]),
            y_um.unwrap_or(self.position_um[1]),
            z_um.unwrap_or(self.position_um[2]),
        ];
        let e_target = e_um.unwrap_or(self.e_position_um);

        // Envelope check up front; a rejected move leaves no state behind.
        let target_steps = self.kin.carriage_steps(target)?;
        let target_e_steps = self.kin.e_steps(e_target);

        let cart_d = dist(self.position_um, target);
        let delta_e = e_target - self.e_position_um;
        if cart_d < MIN_SEGMENT_UM && delta_e.abs() < MIN_SEGMENT_UM {
            return Ok(None);
        }

        let kind = if cart_d >= MIN_SEGMENT_UM {
            FeedrateKind::Move
        } else if delta_e < 0.0 {
            FeedrateKind::Retract
        } else {
            FeedrateKind::Extrude
        };

        // mm/min → µm/s; mm/s caps → µm/s.
        let requested = feedrate_mm_min.map(|f| f * 1000.0 / 60.0);
        let (distance, cap) = match kind {
            FeedrateKind::Move => (cart_d, self.rates.max_move_rate_mm_s * 1000.0),
            FeedrateKind::Extrude | FeedrateKind::Retract => {
                (delta_e.abs(), self.rates.max_extrude_rate_mm_s * 1000.0)
            }
            FeedrateKind::Home => (cart_d, self.rates.home_rate_mm_s * 1000.0),
        };
        let v_cruise = requested.unwrap_or(cap).min(cap);

        let profile = Arc::new(AccelProfile::plan(
            distance,
            v_cruise,
            0.0,
            0.0,
            self.rates.max_accel_um_s2,
        ));
        let duration_us = (profile.duration_s() * 1e6).ceil() as u64;

        let start_corr = self.kin.corrected(self.position_um)?;
        let end_corr = self.kin.corrected(target)?;

        let mut sources: Vec<Box<dyn StepSource + Send>> = Vec::with_capacity(4);
        for tower in 0..3 {
            let path = TowerPath::new(
                start_corr,
                end_corr,
                self.kin.tower_xy(tower),
                self.kin.rod_length_sq(),
            );
            sources.push(Box::new(DeltaAxisStepper::new(
                Axis::tower(tower),
                path,
                self.kin.steps_per_m(),
                self.carriage_steps[tower],
                profile.clone(),
                start_us,
            )));
        }
        let delta_e_steps = target_e_steps - self.e_steps;
        if delta_e_steps != 0 {
            sources.push(Box::new(ExtruderStepper::new(
                delta_e_steps,
                profile.clone(),
                start_us,
            )));
        }

        self.position_um = target;
        self.carriage_steps = target_steps;
        self.e_position_um = e_target;
        self.e_steps = target_e_steps;

        Ok(Some(MovePlan {
            steps: MergedSteps::new(sources),
            duration_us,
            kind,
        }))
    }

    /// Plan the homing approach: all three carriages up at the homing
    /// rate until their endstops trigger.
    pub fn plan_home(&self, start_us: u64) -> HomePlan {
        let v_um_s = self.rates.home_rate_mm_s * 1000.0;
        let steps_per_s = v_um_s * 1e-6 * self.kin.steps_per_m();
        let period_us = ((1e6 / steps_per_s).round() as u64).max(MIN_STEP_SPACING_US);
        let max_steps = (self.kin.home_height_um() * 1e-6
            * self.kin.steps_per_m()
            * HOME_TRAVEL_MARGIN) as u64;
        HomePlan {
            steppers: [
                HomingStepper::new(Axis::A, period_us, max_steps, start_us),
                HomingStepper::new(Axis::B, period_us, max_steps, start_us),
                HomingStepper::new(Axis::C, period_us, max_steps, start_us),
            ],
        }
    }

    /// All endstops have triggered: the carriages sit at the homed height
    /// and the effector position is known again.
    pub fn finish_home(&mut self) -> Result<(), MotionError> {
        let h = self.kin.home_height_um();
        let steps = self.kin.steps_for_height(h);
        self.carriage_steps = [steps; 3];
        self.position_um = self.kin.home_cartesian()?;
        self.homed = true;
        tracing::info!(
            x = self.position_um[0],
            y = self.position_um[1],
            z = self.position_um[2],
            "homed"
        );
        Ok(())
    }
}

fn dist(a: [f64; 3], b: [f64; 3]) -> f64 {
    ((b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2) + (b[2] - a[2]).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::Matrix3;
    use crate::stepper::StepDirection;
    use trident_common::config::GeometryConfig;

    fn planner() -> MotionPlanner {
        let kin = DeltaKinematics::new(&GeometryConfig::default(), Matrix3::identity()).unwrap();
        MotionPlanner::new(kin, RateConfig::default()).unwrap()
    }

    fn drain(steps: &mut MergedSteps) -> Vec<crate::stepper::StepEvent> {
        let mut events = Vec::new();
        while let Some(ev) = steps.next_step() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn fresh_planner_wants_a_home() {
        let p = planner();
        assert!(!p.is_homed());
        assert!(p.needs_home());
    }

    #[test]
    fn move_commits_position_and_conserves_steps() {
        let mut p = planner();
        p.finish_home().unwrap();
        let before = p.carriage_steps();
        let home = p.position_um();

        let target_z = home[2] - 50_000.0;
        let mut plan = p
            .plan_move(
                Some(10_000.0),
                Some(-5_000.0),
                Some(target_z),
                None,
                Some(3_000.0), // 50 mm/s
                1_000,
            )
            .unwrap()
            .expect("real move");
        let after = p.carriage_steps();
        assert_ne!(before, after);

        let events = drain(&mut plan.steps);
        let mut net = [0i64; 3];
        for ev in &events {
            let idx = ev.axis.index();
            assert!(idx < 3, "no extruder steps expected");
            net[idx] += match ev.direction {
                StepDirection::Forward => 1,
                StepDirection::Backward => -1,
            };
        }
        for tower in 0..3 {
            assert_eq!(net[tower], after[tower] - before[tower], "tower {tower}");
        }
    }

    #[test]
    fn out_of_envelope_move_rejected_and_position_kept() {
        let mut p = planner();
        p.finish_home().unwrap();
        let pos = p.position_um();
        let err = p
            .plan_move(Some(90_000.0), Some(0.0), Some(0.0), None, None, 0)
            .unwrap_err();
        assert!(matches!(err, MotionError::OutOfEnvelope { .. }));
        assert_eq!(p.position_um(), pos);
    }

    #[test]
    fn noop_move_returns_none() {
        let mut p = planner();
        p.finish_home().unwrap();
        let plan = p
            .plan_move(None, None, None, None, Some(1_200.0), 0)
            .unwrap();
        assert!(plan.is_none());
    }

    #[test]
    fn extrusion_only_move_uses_extruder_axis() {
        let mut p = planner();
        p.finish_home().unwrap();
        let mut plan = p
            .plan_move(None, None, None, Some(2_000.0), Some(600.0), 0)
            .unwrap()
            .expect("extrusion move");
        assert_eq!(plan.kind, FeedrateKind::Extrude);
        let events = drain(&mut plan.steps);
        // 2 mm of filament at 80 000 steps/m = 160 steps.
        assert_eq!(events.len(), 160);
        assert!(events.iter().all(|e| e.axis == Axis::E));
    }

    #[test]
    fn feedrate_is_clamped_by_move_cap() {
        let mut p = planner();
        p.finish_home().unwrap();
        let home = p.position_um();
        // Request 300 mm/s; cap is 50 mm/s. Over 60 mm that bounds the
        // duration from below by ~1.24 s.
        let plan = p
            .plan_move(
                None,
                None,
                Some(home[2] - 60_000.0),
                None,
                Some(18_000.0),
                0,
            )
            .unwrap()
            .expect("move");
        assert!(
            plan.duration_us > 1_200_000,
            "duration {} too short for a 50 mm/s cap",
            plan.duration_us
        );
    }

    #[test]
    fn home_plan_paces_at_home_rate() {
        let p = planner();
        let plan = p.plan_home(0);
        // 10 mm/s at 25 060 steps/m → ~250.6 steps/s → ~3 990 µs period.
        let mut s = plan.steppers;
        let first = s[0].next_step().unwrap();
        assert!((3_900..4_100).contains(&first.deadline_us), "{first:?}");
    }

    #[test]
    fn finish_home_sets_known_position() {
        let mut p = planner();
        p.finish_home().unwrap();
        assert!(p.is_homed());
        assert!(!p.needs_home());
        let steps = p.carriage_steps();
        // 467 330 µm at 25 060 steps/m.
        assert_eq!(steps, [11_711; 3]);
        p.invalidate_position();
        assert!(p.needs_home());
    }
}
