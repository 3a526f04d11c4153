//! A4988-class stepper driver: STEP, DIR, and a (shared) ENABLE line.
//!
//! The driver only owns level changes; the scheduler owns *when* they
//! happen. A step is a rising STEP edge followed by a falling edge
//! `STEP_PULSE_US` later, with DIR stable `DIR_SETUP_US` before the rise.

use crate::gpio::Level;
use crate::pin::IoPin;
use std::sync::Arc;

pub struct A4988 {
    step: IoPin,
    dir: IoPin,
    /// ENABLE is shared by all four drivers on the reference board.
    enable: Arc<IoPin>,
    last_forward: Option<bool>,
}

impl A4988 {
    /// Take ownership of the STEP and DIR lines, driving both low.
    pub fn new(step: IoPin, dir: IoPin, enable: Arc<IoPin>) -> Self {
        step.make_digital_output(Level::Low);
        dir.make_digital_output(Level::Low);
        Self {
            step,
            dir,
            enable,
            last_forward: None,
        }
    }

    /// Energize or release the motor. Inversion lives in the pin flags.
    pub fn enable(&self, on: bool) {
        self.enable.digital_write(Level::from_bool(on));
    }

    /// Latch the travel direction. Returns `true` if the DIR line actually
    /// changed — the caller must then honor the setup time before stepping.
    pub fn set_direction(&mut self, forward: bool) -> bool {
        if self.last_forward == Some(forward) {
            return false;
        }
        self.dir.digital_write(Level::from_bool(forward));
        self.last_forward = Some(forward);
        true
    }

    /// Track a direction change without touching the DIR line. DMA
    /// emission rasterizes the level into a ring frame instead of writing
    /// it now, so the change must not land early.
    pub fn note_direction(&mut self, forward: bool) -> bool {
        if self.last_forward == Some(forward) {
            return false;
        }
        self.last_forward = Some(forward);
        true
    }

    /// STEP rising edge.
    #[inline]
    pub fn step_high(&self) {
        self.step.digital_write(Level::High);
    }

    /// STEP falling edge.
    #[inline]
    pub fn step_low(&self) {
        self.step.digital_write(Level::Low);
    }

    /// BCM line of the STEP pin, for DMA rasterization.
    pub fn step_line(&self) -> Option<u32> {
        self.step.line()
    }

    /// BCM line of the DIR pin, for DMA rasterization.
    pub fn dir_line(&self) -> Option<u32> {
        self.dir.line()
    }

    /// Physical level the STEP pin needs for a logical high, accounting
    /// for inversion — what gets OR-ed into a DMA frame.
    pub fn step_set_is_physical_high(&self) -> bool {
        self.step.translate_write(Level::High) == Level::High
    }

    /// Physical level DIR needs for "forward".
    pub fn dir_forward_is_physical_high(&self) -> bool {
        self.dir.translate_write(Level::High) == Level::High
    }
}
