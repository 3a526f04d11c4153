//! The 1 MHz system timer and the `Clock` abstraction.
//!
//! Everything time-related in the core goes through `Clock` so the
//! scheduler and drivers run unmodified against the hardware counter, a
//! process-monotonic clock (`--simulate`), or a fully controlled test clock.

use crate::mmap::PeripheralWindow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use trident_common::consts::{BUSY_WAIT_GUARD_US, LONG_SLEEP_THRESHOLD_US};

// System timer register word offsets.
const TIMER_CLO: usize = 0x04 / 4;
const TIMER_CHI: usize = 0x08 / 4;

/// Microsecond clock with deadline waiting.
pub trait Clock {
    /// Current time [µs].
    fn now_us(&self) -> u64;

    /// Block until `deadline_us`. Far deadlines sleep, the last stretch is
    /// a busy-wait so the return is tight.
    fn wait_until(&self, deadline_us: u64);
}

fn sleep_then_spin<F: Fn() -> u64>(now_us: F, deadline_us: u64) {
    let now = now_us();
    if deadline_us <= now {
        return;
    }
    let delta = deadline_us - now;
    if delta > LONG_SLEEP_THRESHOLD_US {
        std::thread::sleep(Duration::from_micros(delta - BUSY_WAIT_GUARD_US));
    }
    while now_us() < deadline_us {
        std::hint::spin_loop();
    }
}

// ─── Hardware timer ─────────────────────────────────────────────────

/// The free-running 1 MHz counter in the system timer peripheral.
#[derive(Clone)]
pub struct SysTimer {
    win: Arc<PeripheralWindow>,
}

impl SysTimer {
    pub fn new(win: Arc<PeripheralWindow>) -> Self {
        Self { win }
    }
}

impl Clock for SysTimer {
    fn now_us(&self) -> u64 {
        // CHI/CLO are separate registers; re-read CHI to defend against a
        // low-word wrap between the two reads.
        loop {
            let hi = self.win.read_word(TIMER_CHI) as u64;
            let lo = self.win.read_word(TIMER_CLO) as u64;
            if self.win.read_word(TIMER_CHI) as u64 == hi {
                return (hi << 32) | lo;
            }
        }
    }

    fn wait_until(&self, deadline_us: u64) {
        sleep_then_spin(|| self.now_us(), deadline_us);
    }
}

// ─── Monotonic fallback ─────────────────────────────────────────────

/// Wall-clock microseconds since construction. Used by `--simulate` runs
/// where there is no system timer to map.
#[derive(Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn wait_until(&self, deadline_us: u64) {
        sleep_then_spin(|| self.now_us(), deadline_us);
    }
}

// ─── Test clock ─────────────────────────────────────────────────────

/// Fully controlled clock: waiting jumps time forward instead of blocking.
#[derive(Clone, Default)]
pub struct SimClock {
    now: Arc<AtomicU64>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(us: u64) -> Self {
        let clock = Self::default();
        clock.now.store(us, Ordering::SeqCst);
        clock
    }

    pub fn advance(&self, us: u64) {
        self.now.fetch_add(us, Ordering::SeqCst);
    }

    pub fn set(&self, us: u64) {
        self.now.store(us, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn wait_until(&self, deadline_us: u64) {
        self.now.fetch_max(deadline_us, Ordering::SeqCst);
    }
}
