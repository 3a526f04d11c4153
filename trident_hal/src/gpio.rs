//! GPIO register block and the primitive pin.
//!
//! A `PrimitiveIoPin` is one hardware line identified by its BCM GPIO
//! number, with three backends: the memory-mapped register block, an
//! in-memory simulation bus, and the distinguished null pin on which every
//! operation is a no-op.

use crate::mmap::PeripheralWindow;
use std::sync::{Arc, Mutex};

/// Number of GPIO lines on the SoC.
pub const GPIO_LINES: u32 = 54;

// GPIO register word offsets.
const GPFSEL0: usize = 0x00 / 4;
const GPSET0: usize = 0x1C / 4;
const GPCLR0: usize = 0x28 / 4;
const GPLEV0: usize = 0x34 / 4;
const GPPUD: usize = 0x94 / 4;
const GPPUDCLK0: usize = 0x98 / 4;

/// Byte offset of GPSET0 inside the GPIO block — the DMA destination.
pub const GPSET0_BYTE_OFFSET: u32 = 0x1C;

/// Logic level on a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    #[inline]
    pub fn inverted(self) -> Self {
        match self {
            Self::Low => Self::High,
            Self::High => Self::Low,
        }
    }

    #[inline]
    pub fn is_high(self) -> bool {
        self == Self::High
    }

    #[inline]
    pub fn from_bool(high: bool) -> Self {
        if high {
            Self::High
        } else {
            Self::Low
        }
    }
}

/// Pull resistor selection for inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pull {
    #[default]
    Off,
    Down,
    Up,
}

impl From<trident_common::config::PullSetting> for Pull {
    fn from(value: trident_common::config::PullSetting) -> Self {
        use trident_common::config::PullSetting;
        match value {
            PullSetting::Off => Self::Off,
            PullSetting::Down => Self::Down,
            PullSetting::Up => Self::Up,
        }
    }
}

// ─── Hardware block ─────────────────────────────────────────────────

/// The memory-mapped GPIO register block.
#[derive(Clone)]
pub struct GpioBlock {
    win: Arc<PeripheralWindow>,
}

impl GpioBlock {
    pub fn new(win: Arc<PeripheralWindow>) -> Self {
        Self { win }
    }

    fn set_function(&self, pin: u32, bits: u32) {
        let reg = GPFSEL0 + (pin / 10) as usize;
        let shift = (pin % 10) * 3;
        self.win.write_masked(reg, 0b111 << shift, bits << shift);
    }

    pub fn set_output(&self, pin: u32) {
        self.set_function(pin, 0b001);
    }

    pub fn set_input(&self, pin: u32, pull: Pull) {
        self.set_function(pin, 0b000);
        self.apply_pull(pin, pull);
    }

    fn apply_pull(&self, pin: u32, pull: Pull) {
        let code = match pull {
            Pull::Off => 0,
            Pull::Down => 1,
            Pull::Up => 2,
        };
        // Datasheet sequence: program GPPUD, wait 150 cycles, clock it into
        // the target line, wait again, then release both registers.
        self.win.write_word(GPPUD, code);
        spin_delay();
        let clk_reg = GPPUDCLK0 + (pin / 32) as usize;
        self.win.write_word(clk_reg, 1 << (pin % 32));
        spin_delay();
        self.win.write_word(GPPUD, 0);
        self.win.write_word(clk_reg, 0);
    }

    pub fn write(&self, pin: u32, level: Level) {
        let base = if level.is_high() { GPSET0 } else { GPCLR0 };
        let reg = base + (pin / 32) as usize;
        self.win.write_word(reg, 1 << (pin % 32));
    }

    pub fn read(&self, pin: u32) -> Level {
        let reg = GPLEV0 + (pin / 32) as usize;
        Level::from_bool(self.win.read_word(reg) >> (pin % 32) & 1 != 0)
    }
}

#[inline]
fn spin_delay() {
    for _ in 0..150 {
        std::hint::spin_loop();
    }
}

// ─── Simulation bus ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimMode {
    Input(Pull),
    Output,
}

struct SimBusInner {
    modes: [SimMode; GPIO_LINES as usize],
    driven: [Level; GPIO_LINES as usize],
    external: [Option<Level>; GPIO_LINES as usize],
}

/// In-memory GPIO twin for tests and `--simulate` runs.
///
/// Output lines remember what was driven onto them; input lines read an
/// externally injected level, falling back to what the pull resistor
/// would produce on an open line.
#[derive(Clone)]
pub struct SimBus(Arc<Mutex<SimBusInner>>);

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBus {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(SimBusInner {
            modes: [SimMode::Input(Pull::Off); GPIO_LINES as usize],
            driven: [Level::Low; GPIO_LINES as usize],
            external: [None; GPIO_LINES as usize],
        })))
    }

    pub fn set_output(&self, pin: u32, level: Level) {
        let mut inner = self.0.lock().unwrap_or_else(|e| e.into_inner());
        inner.modes[pin as usize] = SimMode::Output;
        inner.driven[pin as usize] = level;
    }

    pub fn set_input(&self, pin: u32, pull: Pull) {
        let mut inner = self.0.lock().unwrap_or_else(|e| e.into_inner());
        inner.modes[pin as usize] = SimMode::Input(pull);
    }

    pub fn write(&self, pin: u32, level: Level) {
        let mut inner = self.0.lock().unwrap_or_else(|e| e.into_inner());
        inner.driven[pin as usize] = level;
    }

    pub fn read(&self, pin: u32) -> Level {
        let inner = self.0.lock().unwrap_or_else(|e| e.into_inner());
        match inner.modes[pin as usize] {
            SimMode::Output => inner.driven[pin as usize],
            SimMode::Input(pull) => inner.external[pin as usize].unwrap_or(match pull {
                Pull::Up => Level::High,
                Pull::Down | Pull::Off => Level::Low,
            }),
        }
    }

    /// Inject an external level onto a line, as a sensor or switch would.
    pub fn set_external(&self, pin: u32, level: Option<Level>) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).external[pin as usize] = level;
    }

    /// What the line is currently driving, or `None` if it is an input.
    pub fn driven_level(&self, pin: u32) -> Option<Level> {
        let inner = self.0.lock().unwrap_or_else(|e| e.into_inner());
        match inner.modes[pin as usize] {
            SimMode::Output => Some(inner.driven[pin as usize]),
            SimMode::Input(_) => None,
        }
    }

    /// Whether the line is configured as an input.
    pub fn is_input(&self, pin: u32) -> bool {
        matches!(
            self.0.lock().unwrap_or_else(|e| e.into_inner()).modes[pin as usize],
            SimMode::Input(_)
        )
    }
}

// ─── Primitive pin ──────────────────────────────────────────────────

/// Where a primitive pin's operations land.
#[derive(Clone)]
pub enum PinBackend {
    /// The distinguished null backend: all operations are no-ops.
    Null,
    /// The real memory-mapped register block.
    Mem(GpioBlock),
    /// The simulation bus.
    Sim(SimBus),
}

/// One hardware line. Mode and level control only; inversion and default
/// state live in the `IoPin` wrapper.
#[derive(Clone)]
pub struct PrimitiveIoPin {
    backend: PinBackend,
    pin: u32,
}

impl PrimitiveIoPin {
    pub fn new(backend: PinBackend, pin: u32) -> Self {
        debug_assert!(matches!(backend, PinBackend::Null) || pin < GPIO_LINES);
        Self { backend, pin }
    }

    /// The null pin: every operation is a no-op and reads return low.
    pub fn null() -> Self {
        Self {
            backend: PinBackend::Null,
            pin: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.backend, PinBackend::Null)
    }

    /// BCM line number, or `None` for the null pin.
    pub fn line(&self) -> Option<u32> {
        if self.is_null() {
            None
        } else {
            Some(self.pin)
        }
    }

    /// Make the line an output and give it `level` in one call, so it is
    /// never observable in an undefined state.
    pub fn make_digital_output(&self, level: Level) {
        match &self.backend {
            PinBackend::Null => {}
            PinBackend::Mem(gpio) => {
                gpio.write(self.pin, level);
                gpio.set_output(self.pin);
            }
            PinBackend::Sim(bus) => bus.set_output(self.pin, level),
        }
    }

    pub fn make_digital_input(&self, pull: Pull) {
        match &self.backend {
            PinBackend::Null => {}
            PinBackend::Mem(gpio) => gpio.set_input(self.pin, pull),
            PinBackend::Sim(bus) => bus.set_input(self.pin, pull),
        }
    }

    pub fn digital_write(&self, level: Level) {
        match &self.backend {
            PinBackend::Null => {}
            PinBackend::Mem(gpio) => gpio.write(self.pin, level),
            PinBackend::Sim(bus) => bus.write(self.pin, level),
        }
    }

    pub fn digital_read(&self) -> Level {
        match &self.backend {
            PinBackend::Null => Level::Low,
            PinBackend::Mem(gpio) => gpio.read(self.pin),
            PinBackend::Sim(bus) => bus.read(self.pin),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_pin_is_silent() {
        let pin = PrimitiveIoPin::null();
        assert!(pin.is_null());
        assert_eq!(pin.line(), None);
        pin.make_digital_output(Level::High);
        pin.digital_write(Level::High);
        assert_eq!(pin.digital_read(), Level::Low);
    }

    #[test]
    fn sim_output_reads_back_driven_level() {
        let bus = SimBus::new();
        let pin = PrimitiveIoPin::new(PinBackend::Sim(bus.clone()), 4);
        pin.make_digital_output(Level::High);
        assert_eq!(pin.digital_read(), Level::High);
        assert_eq!(bus.driven_level(4), Some(Level::High));
        pin.digital_write(Level::Low);
        assert_eq!(bus.driven_level(4), Some(Level::Low));
    }

    #[test]
    fn sim_input_follows_external_then_pull() {
        let bus = SimBus::new();
        let pin = PrimitiveIoPin::new(PinBackend::Sim(bus.clone()), 17);
        pin.make_digital_input(Pull::Up);
        // Open line: pull-up wins.
        assert_eq!(pin.digital_read(), Level::High);
        bus.set_external(17, Some(Level::Low));
        assert_eq!(pin.digital_read(), Level::Low);
    }
}
