//! Config loading integration tests: real files on disk, full documents.

use std::io::Write;
use tempfile::NamedTempFile;
use trident_common::config::{ConfigError, PrinterConfig};

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn missing_file_is_file_not_found() {
    let err = PrinterConfig::load(std::path::Path::new("/nonexistent/trident.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::FileNotFound));
}

#[test]
fn invalid_toml_is_parse_error() {
    let file = write_config("[geometry\nr_um = ");
    let err = PrinterConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::ParseError(_)));
}

#[test]
fn full_reference_config_loads() {
    let file = write_config(
        r#"
[shared]
log_level = "debug"
service_name = "kossel-bench"

[geometry]
r_um = 111000
l_um = 221000
h_um = 467330
build_radius_um = 85000
steps_per_m = 25060.0
steps_per_m_e = 80000.0

[rates]
max_accel_um_s2 = 1200000.0
max_move_rate_mm_s = 50.0
max_extrude_rate_mm_s = 60.0
home_rate_mm_s = 10.0

[bed_level]
matrix = [
    [999975003, 5356, -7070522],
    [5356, 999998852, 1515111],
    [7070522, -1515111, 999973855],
]

[thermistor]
r_series_ohm = 665.0
cap_pf = 2200000.0
vcc_mv = 3300.0
threshold_mv = 1600.0
t0_c = 25.0
r0_ohm = 100000.0
beta = 3950.0

[pins]
step_a = 22
dir_a = 23
enable = { pin = 16, inverted = true }
endstop_a = { pin = 18, inverted = true, pull = "down" }
"#,
    );
    let config = PrinterConfig::load(file.path()).unwrap();
    assert_eq!(config.shared.service_name, "kossel-bench");
    assert_eq!(config.bed_level.matrix[0][0], 999_975_003);
    assert_eq!(config.pins.endstop_a.pin, 18);
    assert!(config.pins.endstop_a.inverted);
}

#[test]
fn geometry_violation_is_fatal_at_load() {
    let file = write_config(
        r#"
[geometry]
r_um = 111000
build_radius_um = 120000
"#,
    );
    let err = PrinterConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));
}
