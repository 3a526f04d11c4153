//! Heater PID with derivative-on-measurement and a filtered D term.
//!
//! Output is a duty cycle in [0, 1]. The derivative acts on the measured
//! temperature (not the error) so a setpoint change cannot kick the
//! output, and it is low-pass filtered before use. The integral is clamped
//! so its contribution alone never exceeds full duty, which bounds windup
//! during long heat-ups.

use super::filters::{lowpass_apply, LowPassState};

/// PID gains in duty-cycle units.
#[derive(Debug, Clone, Copy)]
pub struct PidGains {
    /// Proportional gain [duty/°C].
    pub kp: f64,
    /// Integral gain [duty/(°C·s)] (0 = disabled).
    pub ki: f64,
    /// Derivative gain [duty·s/°C] (0 = disabled).
    pub kd: f64,
    /// Derivative low-pass cutoff [Hz] (0 = unfiltered).
    pub lpf_hz: f64,
}

/// Internal controller state, preserved across cycles.
#[derive(Debug, Clone, Copy, Default)]
pub struct DutyPid {
    integral: f64,
    derivative_lpf: LowPassState,
    prev_measurement: Option<f64>,
}

impl DutyPid {
    /// Reset all internal state. Required when the target changes or the
    /// heater is re-armed after a fault.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Compute one cycle: duty in [0, 1].
    pub fn update(&mut self, gains: &PidGains, setpoint: f64, measurement: f64, dt: f64) -> f64 {
        if dt <= 0.0 {
            return 0.0;
        }
        let error = setpoint - measurement;

        let p_term = gains.kp * error;

        let i_term = if gains.ki != 0.0 {
            self.integral += error * dt;
            // Keep the integral's contribution inside the duty range.
            let max_integral = 1.0 / gains.ki;
            self.integral = self.integral.clamp(0.0, max_integral);
            gains.ki * self.integral
        } else {
            self.integral = 0.0;
            0.0
        };

        let d_term = if gains.kd != 0.0 {
            let raw = match self.prev_measurement {
                Some(prev) => (measurement - prev) / dt,
                None => 0.0,
            };
            let filtered = lowpass_apply(&mut self.derivative_lpf, gains.lpf_hz, raw, dt);
            gains.kd * filtered
        } else {
            0.0
        };
        self.prev_measurement = Some(measurement);

        // Rising measurement opposes the drive.
        (p_term + i_term - d_term).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f64 = 0.2; // 5 Hz heater period

    fn gains(kp: f64, ki: f64, kd: f64) -> PidGains {
        PidGains {
            kp,
            ki,
            kd,
            lpf_hz: 0.0,
        }
    }

    #[test]
    fn proportional_only() {
        let mut pid = DutyPid::default();
        let out = pid.update(&gains(0.01, 0.0, 0.0), 200.0, 150.0, DT);
        assert!((out - 0.5).abs() < 1e-12);
    }

    #[test]
    fn output_saturates_at_full_duty() {
        let mut pid = DutyPid::default();
        let out = pid.update(&gains(0.1, 0.0, 0.0), 250.0, 20.0, DT);
        assert_eq!(out, 1.0);
    }

    #[test]
    fn output_never_goes_negative() {
        let mut pid = DutyPid::default();
        let out = pid.update(&gains(0.1, 0.0, 0.0), 20.0, 200.0, DT);
        assert_eq!(out, 0.0);
    }

    #[test]
    fn integral_accumulates_toward_setpoint() {
        let mut pid = DutyPid::default();
        let g = gains(0.0, 0.01, 0.0);
        let first = pid.update(&g, 100.0, 90.0, DT);
        let mut last = first;
        for _ in 0..10 {
            last = pid.update(&g, 100.0, 90.0, DT);
        }
        assert!(last > first);
    }

    #[test]
    fn integral_contribution_is_bounded() {
        let mut pid = DutyPid::default();
        let g = gains(0.0, 0.001, 0.0);
        // A long saturation period must not wind the integral past the
        // point where its term alone exceeds full duty.
        for _ in 0..100_000 {
            pid.update(&g, 300.0, 20.0, DT);
        }
        let out = pid.update(&g, 300.0, 299.9, DT);
        assert!(out <= 1.0);
        // And it unwinds once the error reverses.
        for _ in 0..100_000 {
            pid.update(&g, 300.0, 400.0, DT);
        }
        let recovered = pid.update(&g, 300.0, 299.0, DT);
        assert!(recovered < 1.0);
    }

    #[test]
    fn rising_temperature_reduces_drive() {
        let mut pid = DutyPid::default();
        let g = PidGains {
            kp: 0.01,
            ki: 0.0,
            kd: 0.05,
            lpf_hz: 0.0,
        };
        pid.update(&g, 200.0, 100.0, DT);
        // Fast rise: derivative term subtracts.
        let rising = pid.update(&g, 200.0, 110.0, DT);
        let mut pid2 = DutyPid::default();
        pid2.update(&g, 200.0, 110.0, DT);
        let steady = pid2.update(&g, 200.0, 110.0, DT);
        assert!(rising < steady);
    }

    #[test]
    fn setpoint_step_does_not_kick_derivative() {
        let mut pid = DutyPid::default();
        let g = PidGains {
            kp: 0.0,
            ki: 0.0,
            kd: 1.0,
            lpf_hz: 0.0,
        };
        pid.update(&g, 50.0, 40.0, DT);
        // Setpoint jumps, measurement constant → derivative stays zero.
        let out = pid.update(&g, 250.0, 40.0, DT);
        assert_eq!(out, 0.0);
    }

    #[test]
    fn reset_clears_state() {
        let mut pid = DutyPid::default();
        let g = gains(0.01, 0.01, 0.01);
        for _ in 0..50 {
            pid.update(&g, 200.0, 100.0, DT);
        }
        pid.reset();
        assert_eq!(pid.integral, 0.0);
        assert!(pid.prev_measurement.is_none());
    }
}
