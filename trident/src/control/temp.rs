//! Hotend temperature controller.
//!
//! One thermistor sample per PWM period feeds the PID; the resulting duty
//! becomes the falling-edge offset of that period's pulse. A run of failed
//! samples latches the heater off until a new target is set.

use super::pid::{DutyPid, PidGains};
use trident_common::config::HeaterConfig;

pub struct TempController {
    gains: PidGains,
    pid: DutyPid,
    period_us: u64,
    fault_limit: u32,
    target_c: Option<f64>,
    latest_c: Option<f64>,
    consecutive_faults: u32,
    fault_latched: bool,
}

impl TempController {
    pub fn new(cfg: &HeaterConfig) -> Self {
        Self {
            gains: PidGains {
                kp: cfg.kp,
                ki: cfg.ki,
                kd: cfg.kd,
                lpf_hz: cfg.derivative_lpf_hz,
            },
            pid: DutyPid::default(),
            period_us: (1e6 / cfg.pwm_hz).round() as u64,
            fault_limit: cfg.sensor_fault_limit,
            target_c: None,
            latest_c: None,
            consecutive_faults: 0,
            fault_latched: false,
        }
    }

    /// PWM period [µs].
    pub fn period_us(&self) -> u64 {
        self.period_us
    }

    pub fn target_c(&self) -> Option<f64> {
        self.target_c
    }

    pub fn latest_c(&self) -> Option<f64> {
        self.latest_c
    }

    pub fn is_fault_latched(&self) -> bool {
        self.fault_latched
    }

    /// Set or clear the target. Clears a fault latch — the operator's
    /// explicit action is the re-arm.
    pub fn set_target(&mut self, deg_c: Option<f64>) {
        self.target_c = deg_c;
        self.fault_latched = false;
        self.consecutive_faults = 0;
        self.pid.reset();
    }

    /// A good thermistor sample.
    pub fn on_sample(&mut self, deg_c: f64) {
        self.latest_c = Some(deg_c);
        self.consecutive_faults = 0;
    }

    /// A discarded thermistor sample. Returns `true` at the moment the
    /// fault latches.
    pub fn on_sample_fault(&mut self) -> bool {
        self.consecutive_faults += 1;
        if !self.fault_latched && self.consecutive_faults >= self.fault_limit {
            self.fault_latched = true;
            return true;
        }
        false
    }

    /// Whether the measured temperature is within `tolerance` of target.
    pub fn at_target(&self, tolerance_c: f64) -> bool {
        match (self.target_c, self.latest_c) {
            (Some(t), Some(m)) => (t - m).abs() <= tolerance_c,
            _ => false,
        }
    }

    /// Duty cycle for the coming PWM period.
    pub fn compute_duty(&mut self) -> f64 {
        if self.fault_latched {
            return 0.0;
        }
        let (target, measured) = match (self.target_c, self.latest_c) {
            (Some(t), Some(m)) => (t, m),
            _ => return 0.0,
        };
        let dt = self.period_us as f64 * 1e-6;
        self.pid.update(&self.gains, target, measured, dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> TempController {
        TempController::new(&HeaterConfig::default())
    }

    #[test]
    fn period_matches_pwm_frequency() {
        let c = controller();
        assert_eq!(c.period_us(), 200_000); // 5 Hz
    }

    #[test]
    fn no_target_means_zero_duty() {
        let mut c = controller();
        c.on_sample(25.0);
        assert_eq!(c.compute_duty(), 0.0);
    }

    #[test]
    fn cold_hotend_with_target_drives_hard() {
        let mut c = controller();
        c.set_target(Some(200.0));
        c.on_sample(20.0);
        assert!(c.compute_duty() > 0.9);
    }

    #[test]
    fn overshoot_cuts_drive() {
        let mut c = controller();
        c.set_target(Some(200.0));
        c.on_sample(230.0);
        assert_eq!(c.compute_duty(), 0.0);
    }

    #[test]
    fn fault_latches_after_limit_and_kills_duty() {
        let mut c = controller();
        c.set_target(Some(200.0));
        c.on_sample(100.0);
        let limit = HeaterConfig::default().sensor_fault_limit;
        for i in 0..limit {
            let latched = c.on_sample_fault();
            assert_eq!(latched, i + 1 == limit, "at fault {i}");
        }
        assert!(c.is_fault_latched());
        assert_eq!(c.compute_duty(), 0.0);
        // Latching reports once.
        assert!(!c.on_sample_fault());
    }

    #[test]
    fn good_sample_resets_fault_run() {
        let mut c = controller();
        c.set_target(Some(200.0));
        for _ in 0..3 {
            c.on_sample_fault();
        }
        c.on_sample(150.0);
        for _ in 0..3 {
            assert!(!c.on_sample_fault());
        }
        assert!(!c.is_fault_latched());
    }

    #[test]
    fn new_target_rearms_after_fault() {
        let mut c = controller();
        c.set_target(Some(200.0));
        for _ in 0..10 {
            c.on_sample_fault();
        }
        assert!(c.is_fault_latched());
        c.set_target(Some(180.0));
        assert!(!c.is_fault_latched());
        c.on_sample(20.0);
        assert!(c.compute_duty() > 0.0);
    }

    #[test]
    fn at_target_respects_tolerance() {
        let mut c = controller();
        c.set_target(Some(200.0));
        c.on_sample(197.0);
        assert!(c.at_target(5.0));
        assert!(!c.at_target(1.0));
    }
}
