//! Motion-layer error types.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum MotionError {
    /// Requested Cartesian position is outside the build envelope. The
    /// move is rejected; the planner reports and continues.
    #[error("position ({x_um:.0}, {y_um:.0}, {z_um:.0}) µm is outside the build envelope")]
    OutOfEnvelope { x_um: f64, y_um: f64, z_um: f64 },

    /// Geometry constants cannot form a working delta (fatal at init).
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
}
