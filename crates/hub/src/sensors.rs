//! Sensor snapshot and the positional line parser.
//!
//! The microcontroller prints one reading per line, e.g.
//!
//! ```text
//! iSoilH: 52.10% SoilT: 31.40*C AirH: 61.00% AirT: 24.20*C HI: 24.50*C
//! ```
//!
//! Fields are taken by whitespace-token position (counting the header token)
//! with a fixed number of trailing unit characters stripped.

use thiserror::Error;
use time::OffsetDateTime;

/// (token index, trailing unit chars) for each consumed field.
const SOIL_HUMIDITY: (usize, usize) = (1, 1);
const SOIL_TEMPERATURE: (usize, usize) = (3, 2);
const AIR_HUMIDITY: (usize, usize) = (5, 1);
const AIR_TEMPERATURE: (usize, usize) = (7, 2);

#[derive(Debug, Clone, PartialEq)]
pub struct SensorSnapshot {
    pub captured_at: OffsetDateTime,
    pub soil_humidity: f64,
    pub soil_temperature: f64,
    pub air_humidity: f64,
    pub air_temperature: f64,
    /// Reserved for an O2 probe; the current firmware never reports it.
    pub air_o2: Option<f64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum SensorParseError {
    #[error("sensor line has no {field} token at position {index}")]
    MissingField { field: &'static str, index: usize },
    #[error("{field} token {token:?} is not a number")]
    NotANumber { field: &'static str, token: String },
}

impl SensorSnapshot {
    /// Parse a full sensor line. Either every field parses or the line is
    /// rejected as a whole.
    pub fn parse(line: &str, captured_at: OffsetDateTime) -> Result<Self, SensorParseError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();

        let soil_humidity = field(&tokens, "soil_humidity", SOIL_HUMIDITY)?;
        let soil_temperature = field(&tokens, "soil_temperature", SOIL_TEMPERATURE)?;
        let air_humidity = field(&tokens, "system_air_humidity", AIR_HUMIDITY)?;
        let air_temperature = field(&tokens, "system_air_temperature", AIR_TEMPERATURE)?;

        Ok(Self {
            captured_at,
            soil_humidity,
            soil_temperature,
            air_humidity,
            air_temperature,
            air_o2: None,
        })
    }
}

fn field(
    tokens: &[&str],
    name: &'static str,
    (index, unit_chars): (usize, usize),
) -> Result<f64, SensorParseError> {
    let token = tokens
        .get(index)
        .ok_or(SensorParseError::MissingField { field: name, index })?;
    let number = strip_trailing_chars(token, unit_chars);

    match number.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(SensorParseError::NotANumber {
            field: name,
            token: token.to_string(),
        }),
    }
}

/// Drop the last `n` characters (not bytes, so `°C` counts as two).
fn strip_trailing_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return s;
    }
    match s.char_indices().rev().nth(n - 1) {
        Some((i, _)) => &s[..i],
        None => "",
    }
}

// ===========================================================================
// Tests
// ===========================================================================
