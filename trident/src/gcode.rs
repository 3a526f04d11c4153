//! Thin G-code adapter.
//!
//! Translates one already-received command line into a `MachineCommand`.
//! This is glue at the edge of the core: no modal state, no checksums, no
//! transport — those belong to the host-side sender. Coordinates arrive in
//! millimeters (absolute), feedrate in mm/min, and are normalized to the
//! core's micrometer units here.

use thiserror::Error;
use trident_common::command::MachineCommand;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GcodeError {
    #[error("unsupported command: {0}")]
    Unsupported(String),

    #[error("bad {letter} value: {raw}")]
    BadNumber { letter: char, raw: String },
}

/// Parse one line. Returns `Ok(None)` for blank lines and pure comments.
pub fn parse_line(line: &str) -> Result<Option<MachineCommand>, GcodeError> {
    let line = match line.split(';').next() {
        Some(code) => code.trim(),
        None => return Ok(None),
    };
    if line.is_empty() {
        return Ok(None);
    }

    let mut words = line.split_whitespace();
    let head = words.next().unwrap_or("").to_ascii_uppercase();

    match head.as_str() {
        "G0" | "G1" => {
            let mut x = None;
            let mut y = None;
            let mut z = None;
            let mut e = None;
            let mut f = None;
            for word in words {
                let (letter, value) = split_word(word)?;
                match letter {
                    'X' => x = Some(value * 1_000.0),
                    'Y' => y = Some(value * 1_000.0),
                    'Z' => z = Some(value * 1_000.0),
                    'E' => e = Some(value * 1_000.0),
                    'F' => f = Some(value),
                    _ => return Err(GcodeError::Unsupported(word.to_string())),
                }
            }
            Ok(Some(MachineCommand::Move {
                x_um: x,
                y_um: y,
                z_um: z,
                e_um: e,
                feedrate_mm_min: f,
            }))
        }
        "G4" => {
            let mut duration_us = 0u64;
            for word in words {
                let (letter, value) = split_word(word)?;
                match letter {
                    'P' => duration_us = (value * 1_000.0) as u64, // milliseconds
                    'S' => duration_us = (value * 1_000_000.0) as u64, // seconds
                    _ => return Err(GcodeError::Unsupported(word.to_string())),
                }
            }
            Ok(Some(MachineCommand::Dwell { duration_us }))
        }
        "G28" => Ok(Some(MachineCommand::Home)),
        "M104" | "M109" => {
            let mut target = None;
            for word in words {
                let (letter, value) = split_word(word)?;
                if letter == 'S' {
                    target = (value > 0.0).then_some(value);
                }
            }
            Ok(Some(MachineCommand::SetHotendTemp { deg_c: target }))
        }
        "M106" => {
            let mut duty = 1.0;
            for word in words {
                let (letter, value) = split_word(word)?;
                if letter == 'S' {
                    duty = (value / 255.0).clamp(0.0, 1.0);
                }
            }
            Ok(Some(MachineCommand::SetFan { duty }))
        }
        "M107" => Ok(Some(MachineCommand::SetFan { duty: 0.0 })),
        "M112" => Ok(Some(MachineCommand::EmergencyStop)),
        other => Err(GcodeError::Unsupported(other.to_string())),
    }
}

fn split_word(word: &str) -> Result<(char, f64), GcodeError> {
    let mut chars = word.chars();
    let letter = chars
        .next()
        .map(|c| c.to_ascii_uppercase())
        .unwrap_or(' ');
    let raw = chars.as_str();
    raw.parse::<f64>()
        .map(|value| (letter, value))
        .map_err(|_| GcodeError::BadNumber {
            letter,
            raw: raw.to_string(),
        })
}
