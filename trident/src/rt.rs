//! Real-time process setup.
//!
//! Opt-in tightening of the scheduling environment before the event loop
//! starts: lock all current and future pages in RAM and request a
//! SCHED_FIFO priority. Both need privileges the process may not have, so
//! failure is reported, not fatal — the engine degrades to best-effort
//! timing, which is the baseline contract anyway.

use std::io;

/// Default SCHED_FIFO priority for the engine thread.
pub const DEFAULT_RT_PRIORITY: i32 = 80;

/// Lock memory and switch to SCHED_FIFO at the given priority.
pub fn lock_and_prioritize(priority: i32) -> Result<(), io::Error> {
    // Page faults during a busy-wait are deadline killers; pin everything.
    if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let param = libc::sched_param {
        sched_priority: priority,
    };
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } != 0 {
        return Err(io::Error::last_os_error());
    }
    tracing::info!(priority, "running with SCHED_FIFO and locked memory");
    Ok(())
}
