//! ADC-less RC thermistor measurement.
//!
//! The sense pin first discharges the timing capacitor by driving it low,
//! then goes high-impedance while the capacitor recharges through the
//! thermistor. The time until the pin reads high again is proportional to
//! the RC product, from which the beta equation recovers temperature.
//!
//! The scheduler drives the phases; this type only holds the state machine
//! and the conversion math.

use crate::gpio::{Level, Pull};
use crate::pin::IoPin;
use trident_common::config::ThermConfig;

/// Lowest believable reading [°C].
pub const TEMP_MIN_C: f64 = -50.0;
/// Highest believable reading [°C].
pub const TEMP_MAX_C: f64 = 500.0;
/// A charge taking longer than this multiple of the expected time means
/// the sensor is absent or shorted; the sample is discarded.
const TIMEOUT_FACTOR: f64 = 5.0;

const KELVIN_OFFSET: f64 = 273.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Discharging,
    Reading,
}

/// Result of one read-phase poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThermPoll {
    /// Capacitor still charging; poll again later.
    Pending,
    /// Threshold crossed; here is the temperature [°C].
    Done(f64),
    /// Charge time out of bounds; sample discarded.
    Fault,
}

pub struct RcThermistor {
    pin: IoPin,
    cfg: ThermConfig,
    phase: Phase,
    read_start_us: u64,
    /// ln(Vcc / (Vcc − Vthresh)), precomputed.
    ln_factor: f64,
    /// Expected charge time at the reference resistance [µs].
    expected_dt_us: f64,
}

impl RcThermistor {
    pub fn new(pin: IoPin, cfg: ThermConfig) -> Self {
        let ln_factor = (cfg.vcc_mv / (cfg.vcc_mv - cfg.threshold_mv)).ln();
        let cap_f = cfg.cap_pf * 1e-12;
        let expected_dt_us = (cfg.r0_ohm + cfg.r_series_ohm) * cap_f * ln_factor * 1e6;
        Self {
            pin,
            cfg,
            phase: Phase::Idle,
            read_start_us: 0,
            ln_factor,
            expected_dt_us,
        }
    }

    /// Whether a read phase is in progress. A read still pending when the
    /// next measurement cycle starts means the charge never crossed the
    /// threshold — the caller treats that as a discarded sample.
    pub fn is_reading(&self) -> bool {
        self.phase == Phase::Reading
    }

    /// Begin a measurement cycle: drive the capacitor low. Returns the
    /// time at which the discharge is complete and `begin_reading` must be
    /// called.
    pub fn start_discharge(&mut self, now_us: u64) -> u64 {
        self.pin.make_digital_output(Level::Low);
        self.phase = Phase::Discharging;
        now_us + self.cfg.discharge_us
    }

    /// Release the pin to high-impedance and snapshot the timer; the
    /// capacitor now charges through the thermistor.
    pub fn begin_reading(&mut self, now_us: u64) {
        self.pin.make_digital_input(Pull::Off);
        self.read_start_us = now_us;
        self.phase = Phase::Reading;
    }

    /// One read-phase sample. The first poll observing the pin high yields
    /// the elapsed charge time and therefore the temperature.
    pub fn poll(&mut self, now_us: u64) -> ThermPoll {
        if self.phase != Phase::Reading {
            return ThermPoll::Pending;
        }
        let dt_us = now_us.saturating_sub(self.read_start_us);
        if self.pin.digital_read() == Level::High {
            self.phase = Phase::Idle;
            if (dt_us as f64) > self.timeout_us() {
                return ThermPoll::Fault;
            }
            return ThermPoll::Done(self.temperature_from_dt(dt_us));
        }
        if (dt_us as f64) > self.timeout_us() {
            self.phase = Phase::Idle;
            return ThermPoll::Fault;
        }
        ThermPoll::Pending
    }

    fn timeout_us(&self) -> f64 {
        self.expected_dt_us * TIMEOUT_FACTOR
    }

    /// Charge time → resistance → Steinhart-beta temperature.
    pub fn temperature_from_dt(&self, dt_us: u64) -> f64 {
        let cap_f = self.cfg.cap_pf * 1e-12;
        let r_total = dt_us as f64 * 1e-6 / (cap_f * self.ln_factor);
        let r_therm = (r_total - self.cfg.r_series_ohm).max(1.0);
        let inv_t = 1.0 / (self.cfg.t0_c + KELVIN_OFFSET)
            + (r_therm / self.cfg.r0_ohm).ln() / self.cfg.beta;
        (1.0 / inv_t - KELVIN_OFFSET).clamp(TEMP_MIN_C, TEMP_MAX_C)
    }

    /// Charge time that would be observed at a given thermistor
    /// resistance. Test helper and sanity check for the ceiling.
    pub fn dt_for_resistance(&self, r_ohm: f64) -> u64 {
        let cap_f = self.cfg.cap_pf * 1e-12;
        ((r_ohm + self.cfg.r_series_ohm) * cap_f * self.ln_factor * 1e6).round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{PinBackend, PrimitiveIoPin, SimBus};
    use crate::pin::{DefaultState, PinFlags};

    fn make(bus: &SimBus) -> RcThermistor {
        let pin = IoPin::new(
            PrimitiveIoPin::new(PinBackend::Sim(bus.clone()), 7),
            PinFlags::empty(),
            DefaultState::Untouched,
        );
        RcThermistor::new(pin, ThermConfig::default())
    }

    #[test]
    fn reference_resistance_reads_reference_temperature() {
        let bus = SimBus::new();
        let therm = make(&bus);
        let dt = therm.dt_for_resistance(100_000.0);
        let t = therm.temperature_from_dt(dt);
        assert!((t - 25.0).abs() < 0.1, "expected ~25°C, got {t}");
    }

    #[test]
    fn lower_resistance_means_hotter() {
        let bus = SimBus::new();
        let therm = make(&bus);
        let cold = therm.temperature_from_dt(therm.dt_for_resistance(100_000.0));
        let hot = therm.temperature_from_dt(therm.dt_for_resistance(10_000.0));
        assert!(hot > cold + 30.0, "hot={hot} cold={cold}");
    }

    #[test]
    fn conversion_clamps_to_sane_range() {
        let bus = SimBus::new();
        let therm = make(&bus);
        assert_eq!(therm.temperature_from_dt(0), TEMP_MAX_C);
        let t = therm.temperature_from_dt(60_000_000);
        assert!((TEMP_MIN_C..=TEMP_MAX_C).contains(&t));
    }

    #[test]
    fn full_cycle_through_the_sim_bus() {
        let bus = SimBus::new();
        let mut therm = make(&bus);

        let discharge_done = therm.start_discharge(1_000);
        assert_eq!(discharge_done, 1_000 + ThermConfig::default().discharge_us);
        // The pin is actively pulling the capacitor low.
        assert_eq!(bus.driven_level(7), Some(Level::Low));

        therm.begin_reading(discharge_done);
        assert!(bus.is_input(7));
        // Capacitor below threshold: pending.
        assert_eq!(therm.poll(discharge_done + 1_000), ThermPoll::Pending);

        // Threshold crossing at the charge time of R0: ~25 °C.
        let dt = therm.dt_for_resistance(100_000.0);
        bus.set_external(7, Some(Level::High));
        match therm.poll(discharge_done + dt) {
            ThermPoll::Done(t) => assert!((t - 25.0).abs() < 0.5, "{t}"),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn overlong_charge_is_a_fault() {
        let bus = SimBus::new();
        let mut therm = make(&bus);
        let done = therm.start_discharge(0);
        therm.begin_reading(done);
        // Never crosses threshold within 5x the expected time.
        let too_late = done + 10 * therm.dt_for_resistance(100_000.0);
        assert_eq!(therm.poll(too_late), ThermPoll::Fault);
        // The cycle is over; subsequent polls are inert.
        assert_eq!(therm.poll(too_late + 1), ThermPoll::Pending);
    }
}
