//! Inversion-aware, exit-safe pin wrapper.
//!
//! Every component above the HAL talks to an `IoPin`, never to a primitive
//! pin. The wrapper carries the electrical inversion flags and a default
//! state, and keeps itself in the process-wide living-pin registry so that
//! `deactivate_all` can drive every line to a safe state on any exit path.
//!
//! At most one live `IoPin` references a given hardware line; construction
//! happens on the main thread during bring-up, after which the registry is
//! only read.

use crate::gpio::{Level, PrimitiveIoPin, Pull};
use bitflags::bitflags;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Once, OnceLock};

bitflags! {
    /// Electrical inversion between the logical and physical level.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PinFlags: u8 {
        const INVERT_READS = 1 << 0;
        const INVERT_WRITES = 1 << 1;
    }
}

/// What a pin is driven to when it is dropped or deactivated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultState {
    /// Output, logical low after inversion is applied.
    #[default]
    Low,
    /// Output, logical high after inversion is applied.
    High,
    /// High-impedance input.
    HighImpedance,
    /// Leave the line exactly as it is.
    Untouched,
}

struct LivingPin {
    prim: PrimitiveIoPin,
    flags: PinFlags,
    default_state: DefaultState,
}

static NEXT_PIN_ID: AtomicU64 = AtomicU64::new(1);
static LIVING_PINS: OnceLock<Mutex<HashMap<u64, LivingPin>>> = OnceLock::new();
static EXIT_HOOK: Once = Once::new();

extern "C" {
    fn atexit(cb: extern "C" fn()) -> libc::c_int;
}

fn registry() -> &'static Mutex<HashMap<u64, LivingPin>> {
    LIVING_PINS.get_or_init(|| Mutex::new(HashMap::new()))
}

extern "C" fn deactivate_all_at_exit() {
    deactivate_all();
}

/// Drive every living pin to its default state.
///
/// Called by the atexit hook, the SIGINT handler, and the engine's clean
/// shutdown path; it is idempotent.
pub fn deactivate_all() {
    tracing::info!("deactivating all pins");
    let pins = registry().lock().unwrap_or_else(|e| e.into_inner());
    for living in pins.values() {
        drive_to_default(&living.prim, living.flags, living.default_state);
    }
}

/// Number of pins currently registered. Test hook.
pub fn living_pin_count() -> usize {
    registry().lock().unwrap_or_else(|e| e.into_inner()).len()
}

fn drive_to_default(prim: &PrimitiveIoPin, flags: PinFlags, default_state: DefaultState) {
    if prim.is_null() {
        return;
    }
    match default_state {
        DefaultState::Low => prim.make_digital_output(translate(flags, Level::Low)),
        DefaultState::High => prim.make_digital_output(translate(flags, Level::High)),
        DefaultState::HighImpedance => prim.make_digital_input(Pull::Off),
        DefaultState::Untouched => {}
    }
}

#[inline]
fn translate(flags: PinFlags, level: Level) -> Level {
    if flags.contains(PinFlags::INVERT_WRITES) {
        level.inverted()
    } else {
        level
    }
}

/// An owned hardware line with inversion and a safe default state.
pub struct IoPin {
    id: u64,
    prim: PrimitiveIoPin,
    flags: PinFlags,
    default_state: DefaultState,
}

impl IoPin {
    /// Wrap a primitive pin. Registers the pin in the living-pin set and,
    /// on first construction anywhere in the process, installs the exit
    /// hook that deactivates everything.
    pub fn new(prim: PrimitiveIoPin, flags: PinFlags, default_state: DefaultState) -> Self {
        EXIT_HOOK.call_once(|| unsafe {
            atexit(deactivate_all_at_exit);
        });
        let id = NEXT_PIN_ID.fetch_add(1, Ordering::Relaxed);
        registry().lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            LivingPin {
                prim: prim.clone(),
                flags,
                default_state,
            },
        );
        Self {
            id,
            prim,
            flags,
            default_state,
        }
    }

    /// A null wrapper; writes vanish and reads return logical low.
    pub fn null() -> Self {
        Self::new(PrimitiveIoPin::null(), PinFlags::empty(), DefaultState::Untouched)
    }

    pub fn is_null(&self) -> bool {
        self.prim.is_null()
    }

    /// BCM line number, or `None` for a null pin.
    pub fn line(&self) -> Option<u32> {
        self.prim.line()
    }

    pub fn set_default_state(&mut self, state: DefaultState) {
        self.default_state = state;
        if let Some(living) = registry()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&self.id)
        {
            living.default_state = state;
        }
    }

    /// The physical level a logical write of `level` lands as.
    #[inline]
    pub fn translate_write(&self, level: Level) -> Level {
        translate(self.flags, level)
    }

    /// The physical duty cycle a logical duty of `duty` lands as.
    #[inline]
    pub fn translate_duty(&self, duty: f64) -> f64 {
        if self.flags.contains(PinFlags::INVERT_WRITES) {
            1.0 - duty
        } else {
            duty
        }
    }

    /// Make the line an output at the given logical level.
    pub fn make_digital_output(&self, level: Level) {
        self.prim.make_digital_output(self.translate_write(level));
    }

    pub fn make_digital_input(&self, pull: Pull) {
        self.prim.make_digital_input(pull);
    }

    pub fn digital_write(&self, level: Level) {
        self.prim.digital_write(self.translate_write(level));
    }

    pub fn digital_read(&self) -> Level {
        let raw = self.prim.digital_read();
        if self.flags.contains(PinFlags::INVERT_READS) {
            raw.inverted()
        } else {
            raw
        }
    }

    /// Drive the line to its default state now, without dropping it.
    pub fn set_to_default(&self) {
        drive_to_default(&self.prim, self.flags, self.default_state);
    }
}

impl Drop for IoPin {
    fn drop(&mut self) {
        self.set_to_default();
        registry()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}
