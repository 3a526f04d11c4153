//! Timing constants shared across the motion core.
//!
//! All absolute times in the system are microseconds on the BCM2835 free
//! running system timer, which ticks at exactly 1 MHz.

/// System timer frequency [Hz].
pub const TIMER_HZ: u64 = 1_000_000;

/// Width of a STEP pulse on an A4988-class driver [µs].
pub const STEP_PULSE_US: u64 = 2;

/// Required DIR stability before a STEP rising edge [µs].
pub const DIR_SETUP_US: u64 = 1;

/// Minimum spacing between consecutive step events on one axis [µs].
pub const MIN_STEP_SPACING_US: u64 = 2;

/// Above this distance to a deadline the scheduler sleeps instead of
/// busy-waiting [µs].
pub const LONG_SLEEP_THRESHOLD_US: u64 = 200;

/// Margin subtracted from a sleep so the busy-wait always finishes the
/// approach to the deadline [µs].
pub const BUSY_WAIT_GUARD_US: u64 = 50;

/// Spacing of DMA ring frames [µs]. One frame is one `{GPSET0, GPCLR0}`
/// register image.
pub const DMA_FRAME_PERIOD_US: u64 = 1;

/// Endstop poll interval while a motion is in flight [µs].
pub const ENDSTOP_POLL_US: u64 = 500;

/// Thermistor read-phase poll interval [µs].
pub const THERM_POLL_US: u64 = 1_000;

/// Bounded depth of the command intake queue. The producer blocks when the
/// queue is full, which is the backpressure contract with the parser.
pub const COMMAND_QUEUE_DEPTH: usize = 64;
