//! Carriage endstop: a debounce-free level read over an input pin.
//!
//! The physical lever is assumed clean; the pin's `INVERT_READS` flag
//! normalizes polarity so a triggered switch always reads logical high.

use crate::gpio::{Level, Pull};
use crate::pin::IoPin;

pub struct Endstop {
    pin: IoPin,
}

impl Endstop {
    /// Configure the pin as an input with the given pull and wrap it.
    pub fn new(pin: IoPin, pull: Pull) -> Self {
        pin.make_digital_input(pull);
        Self { pin }
    }

    /// Whether the carriage is pressing the switch.
    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.pin.digital_read() == Level::High
    }
}
