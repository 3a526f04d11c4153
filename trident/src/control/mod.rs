//! Temperature regulation: PID, derivative filtering, and the PWM duty
//! controller driving the hotend.

pub mod filters;
pub mod pid;
pub mod temp;

pub use temp::TempController;
