//! Constant-acceleration velocity profile.
//!
//! A segment accelerates from `v_entry` to a peak no higher than the
//! requested cruise velocity, cruises, and decelerates to `v_exit`. When
//! the segment is too short for the full trapezoid it degenerates to a
//! triangle with the peak chosen so the three phases exactly cover the
//! distance.
//!
//! Velocities are µm/s, distances µm, times seconds. Deadline conversion
//! to microseconds happens at the step-generation layer.

#[derive(Debug, Clone)]
pub struct AccelProfile {
    v_entry: f64,
    v_peak: f64,
    v_exit: f64,
    accel: f64,
    distance: f64,
    d_accel: f64,
    d_cruise: f64,
    t_accel: f64,
    t_cruise: f64,
    t_decel: f64,
}

impl AccelProfile {
    /// Plan a profile over `distance_um` at the requested cruise velocity.
    ///
    /// `v_entry` and `v_exit` are zero at the ends of each planner batch;
    /// the parameters exist so a look-ahead planner could join segments.
    pub fn plan(
        distance_um: f64,
        v_cruise: f64,
        v_entry: f64,
        v_exit: f64,
        accel: f64,
    ) -> Self {
        debug_assert!(accel > 0.0);
        if distance_um <= 0.0 {
            return Self {
                v_entry,
                v_peak: v_entry,
                v_exit,
                accel,
                distance: 0.0,
                d_accel: 0.0,
                d_cruise: 0.0,
                t_accel: 0.0,
                t_cruise: 0.0,
                t_decel: 0.0,
            };
        }

        let d_accel_full = (v_cruise * v_cruise - v_entry * v_entry) / (2.0 * accel);
        let d_decel_full = (v_cruise * v_cruise - v_exit * v_exit) / (2.0 * accel);

        let v_peak = if d_accel_full + d_decel_full <= distance_um {
            v_cruise
        } else {
            // Triangular profile: peak where the two ramps meet.
            let v = ((2.0 * accel * distance_um + v_entry * v_entry + v_exit * v_exit) / 2.0)
                .sqrt();
            v.max(v_entry.max(v_exit))
        };

        let d_accel = (v_peak * v_peak - v_entry * v_entry) / (2.0 * accel);
        let d_decel = (v_peak * v_peak - v_exit * v_exit) / (2.0 * accel);
        let d_cruise = (distance_um - d_accel - d_decel).max(0.0);

        Self {
            v_entry,
            v_peak,
            v_exit,
            accel,
            distance: distance_um,
            d_accel,
            d_cruise,
            t_accel: (v_peak - v_entry) / accel,
            t_cruise: if v_peak > 0.0 { d_cruise / v_peak } else { 0.0 },
            t_decel: (v_peak - v_exit) / accel,
        }
    }

    pub fn distance_um(&self) -> f64 {
        self.distance
    }

    pub fn peak_velocity(&self) -> f64 {
        self.v_peak
    }

    /// Total segment time [s].
    pub fn duration_s(&self) -> f64 {
        self.t_accel + self.t_cruise + self.t_decel
    }

    /// Path velocity at time `t` [µm/s].
    pub fn velocity_at(&self, t: f64) -> f64 {
        if t <= 0.0 {
            return self.v_entry;
        }
        if t < self.t_accel {
            return self.v_entry + self.accel * t;
        }
        if t < self.t_accel + self.t_cruise {
            return self.v_peak;
        }
        let td = t - self.t_accel - self.t_cruise;
        if td < self.t_decel {
            return self.v_peak - self.accel * td;
        }
        self.v_exit
    }

    /// Path distance covered by time `t` [µm]. Monotone in `t`.
    pub fn distance_at(&self, t: f64) -> f64 {
        if t <= 0.0 {
            return 0.0;
        }
        if t < self.t_accel {
            return self.v_entry * t + 0.5 * self.accel * t * t;
        }
        let mut s = self.d_accel;
        let tc = t - self.t_accel;
        if tc < self.t_cruise {
            return s + self.v_peak * tc;
        }
        s += self.d_cruise;
        let td = (tc - self.t_cruise).min(self.t_decel);
        s + self.v_peak * td - 0.5 * self.accel * td * td
    }

    /// The time at which path distance `s` is reached: the inverse of
    /// `distance_at`, closed-form per phase.
    pub fn time_at_distance(&self, s: f64) -> f64 {
        if s <= 0.0 {
            return 0.0;
        }
        if s >= self.distance {
            return self.duration_s();
        }
        if s < self.d_accel {
            // s = v_entry·t + a·t²/2
            let disc = (self.v_entry * self.v_entry + 2.0 * self.accel * s).sqrt();
            return (disc - self.v_entry) / self.accel;
        }
        let sc = s - self.d_accel;
        if sc < self.d_cruise {
            return self.t_accel + sc / self.v_peak;
        }
        let sd = sc - self.d_cruise;
        // sd = v_peak·t − a·t²/2
        let disc = (self.v_peak * self.v_peak - 2.0 * self.accel * sd).max(0.0).sqrt();
        self.t_accel + self.t_cruise + (self.v_peak - disc) / self.accel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference segment: 10 mm at 50 mm/s with 1200 mm/s².
    fn reference() -> AccelProfile {
        AccelProfile::plan(10_000.0, 50_000.0, 0.0, 0.0, 1_200_000.0)
    }

    #[test]
    fn trapezoid_duration_matches_hand_calculation() {
        let p = reference();
        assert!((p.peak_velocity() - 50_000.0).abs() < 1e-9);
        // 2·(50/1200) ramp + (10 − 50²/1200)/50 cruise = 0.24167 s
        assert!(
            (p.duration_s() - 0.241_67).abs() < 1e-4,
            "duration {}",
            p.duration_s()
        );
    }

    #[test]
    fn distance_at_end_equals_segment_length() {
        let p = reference();
        assert!((p.distance_at(p.duration_s()) - 10_000.0).abs() < 1e-6);
        assert!((p.distance_at(p.duration_s() + 1.0) - 10_000.0).abs() < 1e-6);
    }

    #[test]
    fn velocity_integral_recovers_distance() {
        // Trapezoid-rule integral of v(t); exact on the linear ramps, so
        // only the two phase-boundary intervals contribute error.
        for (d, vc) in [(10_000.0, 50_000.0), (1_000.0, 50_000.0), (40_000.0, 20_000.0)] {
            let p = AccelProfile::plan(d, vc, 0.0, 0.0, 1_200_000.0);
            let n = 100_000;
            let dt = p.duration_s() / n as f64;
            let mut integral = 0.0;
            for k in 0..n {
                let t0 = k as f64 * dt;
                integral += 0.5 * (p.velocity_at(t0) + p.velocity_at(t0 + dt)) * dt;
            }
            let rel = (integral - d).abs() / d;
            assert!(rel < 1e-6, "d={d} vc={vc}: integral {integral} rel {rel}");
        }
    }

    #[test]
    fn short_segment_degenerates_to_triangle() {
        // 1 mm can't reach 50 mm/s at 1200 mm/s².
        let p = AccelProfile::plan(1_000.0, 50_000.0, 0.0, 0.0, 1_200_000.0);
        let expected_peak = (1_200_000.0f64 * 1_000.0).sqrt();
        assert!(
            (p.peak_velocity() - expected_peak).abs() < 1e-6,
            "peak {}",
            p.peak_velocity()
        );
        assert!((p.distance_at(p.duration_s()) - 1_000.0).abs() < 1e-6);
        assert!(p.t_cruise.abs() < 1e-12);
    }

    #[test]
    fn time_at_distance_inverts_distance_at() {
        let p = reference();
        for frac in [0.01, 0.1, 0.3, 0.5, 0.7, 0.9, 0.99] {
            let s = frac * 10_000.0;
            let t = p.time_at_distance(s);
            assert!(
                (p.distance_at(t) - s).abs() < 1e-6,
                "s={s}: t={t}, got {}",
                p.distance_at(t)
            );
        }
    }

    #[test]
    fn time_at_distance_is_monotone() {
        let p = AccelProfile::plan(3_000.0, 50_000.0, 0.0, 0.0, 1_200_000.0);
        let mut last = -1.0;
        for k in 0..=300 {
            let t = p.time_at_distance(k as f64 * 10.0);
            assert!(t >= last);
            last = t;
        }
    }

    #[test]
    fn zero_length_profile_is_empty() {
        let p = AccelProfile::plan(0.0, 50_000.0, 0.0, 0.0, 1_200_000.0);
        assert_eq!(p.duration_s(), 0.0);
        assert_eq!(p.distance_at(1.0), 0.0);
        assert_eq!(p.time_at_distance(10.0), 0.0);
    }
}
