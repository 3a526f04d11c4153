//! Printer configuration: TOML loading and semantic validation.
//!
//! Geometry, rate, thermal, and pin assignments are runtime configuration —
//! nothing is baked into the binary. A config that violates the geometric
//! invariants is fatal at init, before any pin is touched.
//!
//! # TOML Example
//!
//! ```toml
//! [shared]
//! log_level = "info"
//! service_name = "trident-kossel-01"
//!
//! [geometry]
//! r_um = 111000
//! l_um = 221000
//! h_um = 467330
//! build_radius_um = 85000
//! steps_per_m = 25060.0
//! steps_per_m_e = 80000.0
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the specified path.
    #[error("configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Logging verbosity level. Lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// The `tracing` filter directive equivalent of this level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Common fields shared by every Trident binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Machine instance identifier.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_service_name() -> String {
    "trident".to_string()
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            service_name: default_service_name(),
        }
    }
}

/// Load any `Deserialize` config type from a TOML file.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound);
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;
    toml::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))
}

// ─── Geometry ───────────────────────────────────────────────────────

/// Linear-delta frame geometry. Lengths in micrometers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeometryConfig {
    /// Horizontal distance from platform center to each tower [µm].
    #[serde(default = "default_r_um")]
    pub r_um: u64,

    /// Length of each connecting rod [µm].
    #[serde(default = "default_l_um")]
    pub l_um: u64,

    /// Carriage height at the homed position [µm].
    #[serde(default = "default_h_um")]
    pub h_um: u64,

    /// Maximum allowed XY radius of the effector [µm].
    #[serde(default = "default_build_radius_um")]
    pub build_radius_um: u64,

    /// Carriage steps per meter of vertical travel (towers A, B, C).
    #[serde(default = "default_steps_per_m")]
    pub steps_per_m: f64,

    /// Extruder steps per meter of filament.
    #[serde(default = "default_steps_per_m_e")]
    pub steps_per_m_e: f64,
}

fn default_r_um() -> u64 {
    111_000
}
fn default_l_um() -> u64 {
    221_000
}
fn default_h_um() -> u64 {
    467_330
}
fn default_build_radius_um() -> u64 {
    85_000
}
fn default_steps_per_m() -> f64 {
    25_060.0
}
fn default_steps_per_m_e() -> f64 {
    80_000.0
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            r_um: default_r_um(),
            l_um: default_l_um(),
            h_um: default_h_um(),
            build_radius_um: default_build_radius_um(),
            steps_per_m: default_steps_per_m(),
            steps_per_m_e: default_steps_per_m_e(),
        }
    }
}

impl GeometryConfig {
    /// Check the geometric invariants.
    ///
    /// `r`, `l`, `h` must be positive; the build radius must fit inside the
    /// tower circle; and the rods must be long enough to reach the edge of
    /// the build area: `l² ≥ (r − build_radius)²`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.r_um == 0 || self.l_um == 0 || self.h_um == 0 {
            return Err(ConfigError::ValidationError(
                "geometry: r_um, l_um and h_um must all be positive".to_string(),
            ));
        }
        if self.build_radius_um > self.r_um {
            return Err(ConfigError::ValidationError(format!(
                "geometry: build_radius_um ({}) exceeds tower radius r_um ({})",
                self.build_radius_um, self.r_um
            )));
        }
        let margin = self.r_um - self.build_radius_um;
        if self.l_um * self.l_um < margin * margin {
            return Err(ConfigError::ValidationError(format!(
                "geometry: rod length l_um ({}) cannot reach the build edge",
                self.l_um
            )));
        }
        if self.steps_per_m <= 0.0 || self.steps_per_m_e <= 0.0 {
            return Err(ConfigError::ValidationError(
                "geometry: steps_per_m and steps_per_m_e must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ─── Rates ──────────────────────────────────────────────────────────

/// Motion rate and acceleration caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    /// Maximum path acceleration [µm/s²].
    #[serde(default = "default_max_accel")]
    pub max_accel_um_s2: f64,

    /// Cap on travel/print feedrate [mm/s].
    #[serde(default = "default_max_move_rate")]
    pub max_move_rate_mm_s: f64,

    /// Cap on extrusion/retract feedrate [mm/s].
    #[serde(default = "default_max_extrude_rate")]
    pub max_extrude_rate_mm_s: f64,

    /// Homing approach rate [mm/s]. Homing ignores the requested feedrate.
    #[serde(default = "default_home_rate")]
    pub home_rate_mm_s: f64,

    /// Insert an implicit home before the first move after startup.
    #[serde(default = "default_true")]
    pub home_before_first_move: bool,
}

fn default_max_accel() -> f64 {
    1_200_000.0
}
fn default_max_move_rate() -> f64 {
    50.0
}
fn default_max_extrude_rate() -> f64 {
    60.0
}
fn default_home_rate() -> f64 {
    10.0
}
fn default_true() -> bool {
    true
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            max_accel_um_s2: default_max_accel(),
            max_move_rate_mm_s: default_max_move_rate(),
            max_extrude_rate_mm_s: default_max_extrude_rate(),
            home_rate_mm_s: default_home_rate(),
            home_before_first_move: default_true(),
        }
    }
}

impl RateConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_accel_um_s2 <= 0.0 {
            return Err(ConfigError::ValidationError(
                "rates: max_accel_um_s2 must be positive".to_string(),
            ));
        }
        if self.max_move_rate_mm_s <= 0.0
            || self.max_extrude_rate_mm_s <= 0.0
            || self.home_rate_mm_s <= 0.0
        {
            return Err(ConfigError::ValidationError(
                "rates: all rate caps must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ─── Bed level ──────────────────────────────────────────────────────

/// Bed-leveling correction: a 3×3 integer matrix with fixed-point
/// denominator 1e9, applied to every Cartesian position before the
/// kinematic transform. Identity when the section is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BedLevelConfig {
    pub matrix: [[i64; 3]; 3],
}

impl Default for BedLevelConfig {
    fn default() -> Self {
        Self {
            matrix: [
                [1_000_000_000, 0, 0],
                [0, 1_000_000_000, 0],
                [0, 0, 1_000_000_000],
            ],
        }
    }
}

// ─── Thermistor ─────────────────────────────────────────────────────

/// RC-discharge thermistor measurement constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermConfig {
    /// Series resistance in the charge path [Ω].
    #[serde(default = "default_r_series")]
    pub r_series_ohm: f64,

    /// Timing capacitor [pF].
    #[serde(default = "default_cap_pf")]
    pub cap_pf: f64,

    /// Supply voltage [mV].
    #[serde(default = "default_vcc_mv")]
    pub vcc_mv: f64,

    /// Input high threshold of the sense pin [mV].
    #[serde(default = "default_threshold_mv")]
    pub threshold_mv: f64,

    /// Thermistor reference temperature [°C].
    #[serde(default = "default_t0_c")]
    pub t0_c: f64,

    /// Thermistor resistance at the reference temperature [Ω].
    #[serde(default = "default_r0_ohm")]
    pub r0_ohm: f64,

    /// Thermistor beta coefficient [K].
    #[serde(default = "default_beta")]
    pub beta: f64,

    /// How long the capacitor is actively discharged before a read [µs].
    #[serde(default = "default_discharge_us")]
    pub discharge_us: u64,
}

fn default_r_series() -> f64 {
    665.0
}
fn default_cap_pf() -> f64 {
    2_200_000.0
}
fn default_vcc_mv() -> f64 {
    3_300.0
}
fn default_threshold_mv() -> f64 {
    1_600.0
}
fn default_t0_c() -> f64 {
    25.0
}
fn default_r0_ohm() -> f64 {
    100_000.0
}
fn default_beta() -> f64 {
    3_950.0
}
fn default_discharge_us() -> u64 {
    5_000
}

impl Default for ThermConfig {
    fn default() -> Self {
        Self {
            r_series_ohm: default_r_series(),
            cap_pf: default_cap_pf(),
            vcc_mv: default_vcc_mv(),
            threshold_mv: default_threshold_mv(),
            t0_c: default_t0_c(),
            r0_ohm: default_r0_ohm(),
            beta: default_beta(),
            discharge_us: default_discharge_us(),
        }
    }
}

impl ThermConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold_mv <= 0.0 || self.threshold_mv >= self.vcc_mv {
            return Err(ConfigError::ValidationError(
                "thermistor: threshold_mv must sit strictly between 0 and vcc_mv".to_string(),
            ));
        }
        if self.cap_pf <= 0.0 || self.r0_ohm <= 0.0 || self.beta <= 0.0 {
            return Err(ConfigError::ValidationError(
                "thermistor: cap_pf, r0_ohm and beta must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ─── Heater ─────────────────────────────────────────────────────────

/// Hotend PID and PWM parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaterConfig {
    /// Proportional gain [duty/°C].
    #[serde(default = "default_kp")]
    pub kp: f64,

    /// Integral gain [duty/(°C·s)].
    #[serde(default = "default_ki")]
    pub ki: f64,

    /// Derivative gain [duty·s/°C].
    #[serde(default = "default_kd")]
    pub kd: f64,

    /// Low-pass cutoff for the derivative term [Hz]. 0 disables the filter.
    #[serde(default = "default_lpf_hz")]
    pub derivative_lpf_hz: f64,

    /// Heater PWM frequency [Hz].
    #[serde(default = "default_pwm_hz")]
    pub pwm_hz: f64,

    /// Consecutive failed thermistor reads before the heater is latched off.
    #[serde(default = "default_fault_limit")]
    pub sensor_fault_limit: u32,
}

fn default_kp() -> f64 {
    0.018
}
fn default_ki() -> f64 {
    0.000_25
}
fn default_kd() -> f64 {
    0.001
}
fn default_lpf_hz() -> f64 {
    0.33
}
fn default_pwm_hz() -> f64 {
    5.0
}
fn default_fault_limit() -> u32 {
    5
}

impl Default for HeaterConfig {
    fn default() -> Self {
        Self {
            kp: default_kp(),
            ki: default_ki(),
            kd: default_kd(),
            derivative_lpf_hz: default_lpf_hz(),
            pwm_hz: default_pwm_hz(),
            sensor_fault_limit: default_fault_limit(),
        }
    }
}

impl HeaterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pwm_hz <= 0.0 {
            return Err(ConfigError::ValidationError(
                "heater: pwm_hz must be positive".to_string(),
            ));
        }
        if self.sensor_fault_limit == 0 {
            return Err(ConfigError::ValidationError(
                "heater: sensor_fault_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ─── Pins ───────────────────────────────────────────────────────────

/// Pull resistor selection for an input pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PullSetting {
    #[default]
    Off,
    Up,
    Down,
}

/// One output pin assignment with optional electrical inversion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OutputPin {
    pub pin: u32,
    #[serde(default)]
    pub inverted: bool,
}

/// One input pin assignment: inversion plus pull resistor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InputPin {
    pub pin: u32,
    #[serde(default)]
    pub inverted: bool,
    #[serde(default)]
    pub pull: PullSetting,
}

/// Full GPIO assignment for the reference delta. Nothing is hard-coded;
/// the defaults are the reference wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinConfig {
    #[serde(default = "default_step_a")]
    pub step_a: u32,
    #[serde(default = "default_dir_a")]
    pub dir_a: u32,
    #[serde(default = "default_step_b")]
    pub step_b: u32,
    #[serde(default = "default_dir_b")]
    pub dir_b: u32,
    #[serde(default = "default_step_c")]
    pub step_c: u32,
    #[serde(default = "default_dir_c")]
    pub dir_c: u32,
    #[serde(default = "default_step_e")]
    pub step_e: u32,
    #[serde(default = "default_dir_e")]
    pub dir_e: u32,

    /// Shared stepper ENABLE line. The A4988 enable input is active-low, so
    /// the reference wiring inverts it.
    #[serde(default = "default_enable")]
    pub enable: OutputPin,

    #[serde(default = "default_endstop_a")]
    pub endstop_a: InputPin,
    #[serde(default = "default_endstop_b")]
    pub endstop_b: InputPin,
    #[serde(default = "default_endstop_c")]
    pub endstop_c: InputPin,

    /// Thermistor RC sense line.
    #[serde(default = "default_therm_sense")]
    pub therm_sense: u32,

    #[serde(default = "default_hotend")]
    pub hotend: OutputPin,

    #[serde(default = "default_fan")]
    pub fan: OutputPin,
}

fn default_step_a() -> u32 {
    22
}
fn default_dir_a() -> u32 {
    23
}
fn default_step_b() -> u32 {
    19
}
fn default_dir_b() -> u32 {
    21
}
fn default_step_c() -> u32 {
    13
}
fn default_dir_c() -> u32 {
    15
}
fn default_step_e() -> u32 {
    3
}
fn default_dir_e() -> u32 {
    5
}
fn default_enable() -> OutputPin {
    OutputPin {
        pin: 16,
        inverted: true,
    }
}
fn default_endstop_a() -> InputPin {
    InputPin {
        pin: 18,
        inverted: false,
        pull: PullSetting::Down,
    }
}
fn default_endstop_b() -> InputPin {
    InputPin {
        pin: 24,
        inverted: false,
        pull: PullSetting::Down,
    }
}
fn default_endstop_c() -> InputPin {
    InputPin {
        pin: 26,
        inverted: false,
        pull: PullSetting::Down,
    }
}
fn default_therm_sense() -> u32 {
    7
}
fn default_hotend() -> OutputPin {
    OutputPin {
        pin: 10,
        inverted: true,
    }
}
fn default_fan() -> OutputPin {
    OutputPin {
        pin: 8,
        inverted: false,
    }
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            step_a: default_step_a(),
            dir_a: default_dir_a(),
            step_b: default_step_b(),
            dir_b: default_dir_b(),
            step_c: default_step_c(),
            dir_c: default_dir_c(),
            step_e: default_step_e(),
            dir_e: default_dir_e(),
            enable: default_enable(),
            endstop_a: default_endstop_a(),
            endstop_b: default_endstop_b(),
            endstop_c: default_endstop_c(),
            therm_sense: default_therm_sense(),
            hotend: default_hotend(),
            fan: default_fan(),
        }
    }
}

impl PinConfig {
    /// All assignments as `(role, pin)` pairs, for uniqueness checking.
    pub fn assignments(&self) -> Vec<(&'static str, u32)> {
        vec![
            ("step_a", self.step_a),
            ("dir_a", self.dir_a),
            ("step_b", self.step_b),
            ("dir_b", self.dir_b),
            ("step_c", self.step_c),
            ("dir_c", self.dir_c),
            ("step_e", self.step_e),
            ("dir_e", self.dir_e),
            ("enable", self.enable.pin),
            ("endstop_a", self.endstop_a.pin),
            ("endstop_b", self.endstop_b.pin),
            ("endstop_c", self.endstop_c.pin),
            ("therm_sense", self.therm_sense),
            ("hotend", self.hotend.pin),
            ("fan", self.fan.pin),
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen: std::collections::HashMap<u32, &'static str> =
            std::collections::HashMap::new();
        for (role, pin) in self.assignments() {
            if pin >= 54 {
                return Err(ConfigError::ValidationError(format!(
                    "pins: GPIO {pin} for '{role}' out of range (0-53)"
                )));
            }
            if let Some(prev) = seen.insert(pin, role) {
                return Err(ConfigError::ValidationError(format!(
                    "pins: GPIO {pin} assigned to both '{prev}' and '{role}'"
                )));
            }
        }
        Ok(())
    }
}

// ─── HAL selection ──────────────────────────────────────────────────

/// Low-level peripheral parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HalConfig {
    /// Physical base address of the peripheral block. 0x2000_0000 on
    /// BCM2835, 0x3F00_0000 on BCM2836/7.
    #[serde(default = "default_peripheral_base")]
    pub peripheral_base: u64,

    /// DMA channel used for GPIO emission.
    #[serde(default = "default_dma_channel")]
    pub dma_channel: u32,

    /// Pages of DMA ring source frames (512 one-microsecond frames each).
    #[serde(default = "default_ring_pages")]
    pub dma_ring_pages: usize,
}

fn default_peripheral_base() -> u64 {
    0x2000_0000
}
fn default_dma_channel() -> u32 {
    5
}
fn default_ring_pages() -> usize {
    8
}

impl Default for HalConfig {
    fn default() -> Self {
        Self {
            peripheral_base: default_peripheral_base(),
            dma_channel: default_dma_channel(),
            dma_ring_pages: default_ring_pages(),
        }
    }
}

impl HalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dma_channel > 14 {
            return Err(ConfigError::ValidationError(format!(
                "hal: dma_channel {} out of range (0-14)",
                self.dma_channel
            )));
        }
        if self.dma_ring_pages == 0 {
            return Err(ConfigError::ValidationError(
                "hal: dma_ring_pages must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ─── Top level ──────────────────────────────────────────────────────

/// The complete printer configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrinterConfig {
    #[serde(default)]
    pub shared: SharedConfig,
    #[serde(default)]
    pub geometry: GeometryConfig,
    #[serde(default)]
    pub rates: RateConfig,
    #[serde(default)]
    pub bed_level: BedLevelConfig,
    #[serde(default)]
    pub thermistor: ThermConfig,
    #[serde(default)]
    pub heater: HeaterConfig,
    #[serde(default)]
    pub pins: PinConfig,
    #[serde(default)]
    pub hal: HalConfig,
}

impl PrinterConfig {
    /// Load from a TOML file and run the full validation pass.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Run every section's semantic validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.geometry.validate()?;
        self.rates.validate()?;
        self.thermistor.validate()?;
        self.heater.validate()?;
        self.pins.validate()?;
        self.hal.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PrinterConfig::default();
        config.validate().unwrap();
    }

    #[test]
    fn default_geometry_matches_reference_delta() {
        let g = GeometryConfig::default();
        assert_eq!(g.r_um, 111_000);
        assert_eq!(g.l_um, 221_000);
        assert_eq!(g.h_um, 467_330);
        assert_eq!(g.build_radius_um, 85_000);
    }

    #[test]
    fn zero_rod_length_rejected() {
        let mut g = GeometryConfig::default();
        g.l_um = 0;
        assert!(matches!(
            g.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn build_radius_larger_than_tower_radius_rejected() {
        let mut g = GeometryConfig::default();
        g.build_radius_um = g.r_um + 1;
        assert!(g.validate().is_err());
    }

    #[test]
    fn short_rods_rejected() {
        let mut g = GeometryConfig::default();
        g.build_radius_um = 1_000;
        g.l_um = 50_000; // margin is 110 000 µm, rods only 50 000
        assert!(g.validate().is_err());
    }

    #[test]
    fn duplicate_pin_rejected() {
        let mut pins = PinConfig::default();
        pins.fan.pin = pins.hotend.pin;
        let err = pins.validate().unwrap_err();
        match err {
            ConfigError::ValidationError(msg) => {
                assert!(msg.contains("assigned to both"), "{msg}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn thermistor_threshold_must_be_below_vcc() {
        let mut t = ThermConfig::default();
        t.threshold_mv = t.vcc_mv;
        assert!(t.validate().is_err());
    }

    #[test]
    fn bed_level_default_is_identity() {
        let b = BedLevelConfig::default();
        for (i, row) in b.matrix.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                assert_eq!(v, if i == j { 1_000_000_000 } else { 0 });
            }
        }
    }

    #[test]
    fn minimal_toml_parses_with_defaults() {
        let config: PrinterConfig = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.pins.step_a, 22);
        assert_eq!(config.hal.dma_channel, 5);
    }

    #[test]
    fn toml_overrides_defaults() {
        let raw = r#"
[geometry]
r_um = 125000
l_um = 215000

[rates]
max_move_rate_mm_s = 45.0

[pins]
step_a = 40
"#;
        let config: PrinterConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.geometry.r_um, 125_000);
        assert_eq!(config.geometry.l_um, 215_000);
        assert_eq!(config.geometry.h_um, 467_330); // default retained
        assert_eq!(config.rates.max_move_rate_mm_s, 45.0);
        assert_eq!(config.pins.step_a, 40);
    }
}
