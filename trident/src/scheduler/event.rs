//! Scheduler event vocabulary and the deadline/priority ordering.

use trident_motion::stepper::{Axis, StepDirection};

/// Software-PWM output channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PwmChannel {
    Hotend,
    Fan,
}

/// One scheduled action.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SchedEvent {
    /// Read one endstop; cancels homing steps or aborts a move.
    EndstopPoll { tower: usize },
    /// STEP falling edge.
    StepPulseEnd { axis: Axis },
    /// STEP rising edge (with DIR latched first).
    StepPulseStart { axis: Axis, direction: StepDirection },
    /// Software PWM transition.
    PwmEdge { channel: PwmChannel, rising: bool },
    /// Thermistor discharge finished; release the pin and start timing.
    ThermDischargeDone,
    /// Thermistor read-phase sample.
    ThermPoll,
    /// Temperature control tick: PID step plus PWM edge emission.
    TempControl,
    /// Dwell barrier; the scheduler does not advance past it.
    NoOp,
}

impl SchedEvent {
    /// Tie-break rank for events sharing a deadline. Endstop reads come
    /// first, then falling step edges (so a pulse is never stranded open),
    /// then rising edges, PWM, thermistor work, control, and dwells.
    pub fn rank(&self) -> u8 {
        match self {
            Self::EndstopPoll { .. } => 0,
            Self::StepPulseEnd { .. } => 1,
            Self::StepPulseStart { .. } => 2,
            Self::PwmEdge { .. } => 3,
            Self::ThermDischargeDone | Self::ThermPoll => 4,
            Self::TempControl => 5,
            Self::NoOp => 6,
        }
    }

    /// Whether this event is a raw pin transition that DMA mode rasterizes
    /// into ring frames instead of applying at its deadline.
    pub fn is_pin_edge(&self) -> bool {
        matches!(
            self,
            Self::StepPulseStart { .. } | Self::StepPulseEnd { .. } | Self::PwmEdge { .. }
        )
    }
}
