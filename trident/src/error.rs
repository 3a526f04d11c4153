//! Engine error types.
//!
//! Runtime errors are logged and survived where the machine can continue
//! safely (underrun, sensor fault, mid-move endstop); init errors are
//! fatal and bubble up to a non-zero exit.

use thiserror::Error;
use trident_common::config::ConfigError;
use trident_hal::HalError;
use trident_motion::MotionError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The DMA read cursor caught the rasterization cursor; events inside
    /// the missed window were dropped, never re-scheduled.
    #[error("DMA underrun: {dropped} pin events dropped")]
    DmaUnderrun { dropped: u64 },

    /// An endstop closed during a non-homing move. The move is aborted and
    /// the position is no longer trusted.
    #[error("endstop {tower} triggered mid-move; motion aborted")]
    EndstopTriggeredMidMove { tower: usize },

    /// Too many consecutive bad thermistor reads; heater latched off.
    #[error("thermistor fault: heater latched off")]
    TempSensorFault,

    #[error(transparent)]
    Hal(#[from] HalError),

    #[error(transparent)]
    Motion(#[from] MotionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
