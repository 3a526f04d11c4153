//! # Trident Motion Library
//!
//! The geometry and trajectory half of the motion core: the bed-level
//! correction matrix, the linear-delta coordinate map, the constant
//! acceleration profile, lazy per-axis step generation, and the planner
//! that turns machine commands into merged step-event streams.
//!
//! Everything here is pure math over microsecond deadlines — no hardware,
//! no clocks, no pins — which is what keeps the whole pipeline testable on
//! a development machine.

pub mod accel;
pub mod error;
pub mod kinematics;
pub mod matrix;
pub mod planner;
pub mod stepper;

pub use error::MotionError;
pub use kinematics::DeltaKinematics;
pub use planner::MotionPlanner;
pub use stepper::{Axis, StepDirection, StepEvent, StepSource};
