//! Device drivers built on the pin abstraction.

pub mod a4988;
pub mod endstop;
pub mod thermistor;

pub use a4988::A4988;
pub use endstop::Endstop;
pub use thermistor::{RcThermistor, ThermPoll};
