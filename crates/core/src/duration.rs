// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ISO-8601 duration parsing and formatting.
//!
//! Pipeline specs carry timeouts and retry intervals as ISO-8601 duration
//! strings (`PT30S`, `PT0.05S`, `P1DT2H`). Only fixed-length units are
//! accepted: days, weeks, hours, minutes, seconds. Calendar units (years,
//! months) have no fixed length and are rejected. A fraction is allowed on
//! the seconds component only.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;
use thiserror::Error;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Errors from parsing an ISO-8601 duration string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("empty duration string")]
    Empty,
    #[error("duration must start with 'P': {0:?}")]
    MissingPrefix(String),
    #[error("duration has no components: {0:?}")]
    NoComponents(String),
    #[error("invalid number {number:?} in duration {input:?}")]
    InvalidNumber { input: String, number: String },
    #[error("unknown or out-of-order unit {unit:?} in duration {input:?}")]
    UnknownUnit { input: String, unit: char },
    #[error("calendar units are not supported in duration {0:?}")]
    CalendarUnit(String),
    #[error("only the seconds component may carry a fraction: {0:?}")]
    MisplacedFraction(String),
}

/// Parse an ISO-8601 duration string into a `Duration`.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationError::Empty);
    }
    let body = s
        .strip_prefix('P')
        .ok_or_else(|| DurationError::MissingPrefix(input.to_string()))?;
    if body.is_empty() {
        return Err(DurationError::NoComponents(input.to_string()));
    }

    let (date_part, time_part) = match body.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (body, None),
    };
    if time_part == Some("") {
        return Err(DurationError::NoComponents(input.to_string()));
    }

    let mut nanos: u128 = 0;
    let mut seen = false;
    if !date_part.is_empty() {
        nanos += parse_components(date_part, &[('W', 604_800), ('D', 86_400)], input)?;
        seen = true;
    }
    if let Some(time_part) = time_part {
        nanos += parse_components(time_part, &[('H', 3_600), ('M', 60), ('S', 1)], input)?;
        seen = true;
    }
    if !seen {
        return Err(DurationError::NoComponents(input.to_string()));
    }

    let secs = (nanos / NANOS_PER_SEC) as u64;
    let subsec = (nanos % NANOS_PER_SEC) as u32;
    Ok(Duration::new(secs, subsec))
}

/// Parse one `P`/`T` segment: a sequence of `<number><unit>` components in
/// declining unit order. Returns total nanoseconds.
fn parse_components(
    part: &str,
    units: &[(char, u64)],
    input: &str,
) -> Result<u128, DurationError> {
    let bytes = part.as_bytes();
    let mut nanos: u128 = 0;
    let mut next_unit = 0usize;
    let mut i = 0usize;
    while i < part.len() {
        let start = i;
        while i < part.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
            i += 1;
        }
        let number = &part[start..i];
        let Some(unit) = part[i..].chars().next() else {
            return Err(DurationError::InvalidNumber {
                input: input.to_string(),
                number: number.to_string(),
            });
        };
        i += unit.len_utf8();

        if matches!(unit, 'Y') || (unit == 'M' && units[0].0 == 'W') {
            return Err(DurationError::CalendarUnit(input.to_string()));
        }
        let pos = units[next_unit..]
            .iter()
            .position(|(u, _)| *u == unit)
            .ok_or(DurationError::UnknownUnit {
                input: input.to_string(),
                unit,
            })?;
        let secs_per_unit = units[next_unit + pos].1;
        next_unit += pos + 1;

        nanos += parse_number(number, unit, secs_per_unit, input)?;
    }
    Ok(nanos)
}

fn parse_number(
    number: &str,
    unit: char,
    secs_per_unit: u64,
    input: &str,
) -> Result<u128, DurationError> {
    let invalid = || DurationError::InvalidNumber {
        input: input.to_string(),
        number: number.to_string(),
    };
    if number.is_empty() {
        return Err(invalid());
    }
    let (whole, frac) = match number.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (number, None),
    };
    if frac.is_some() && unit != 'S' {
        return Err(DurationError::MisplacedFraction(input.to_string()));
    }
    let whole: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let mut nanos = whole as u128 * secs_per_unit as u128 * NANOS_PER_SEC;
    if let Some(frac) = frac {
        if frac.is_empty() || frac.contains('.') || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        // Scale the fraction to nanoseconds, truncating past 9 digits.
        let digits: String = frac.chars().take(9).collect();
        let scale = 10u128.pow(9 - digits.len() as u32);
        let frac: u128 = digits.parse().map_err(|_| invalid())?;
        nanos += frac * scale;
    }
    Ok(nanos)
}

/// Format a `Duration` as an ISO-8601 duration string.
pub fn format_duration(d: Duration) -> String {
    let mut secs = d.as_secs();
    let nanos = d.subsec_nanos();
    if secs == 0 && nanos == 0 {
        return "PT0S".to_string();
    }

    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3_600;
    secs %= 3_600;
    let minutes = secs / 60;
    secs %= 60;

    let mut out = String::from("P");
    if days > 0 {
        out.push_str(&format!("{days}D"));
    }
    if hours > 0 || minutes > 0 || secs > 0 || nanos > 0 {
        out.push('T');
        if hours > 0 {
            out.push_str(&format!("{hours}H"));
        }
        if minutes > 0 {
            out.push_str(&format!("{minutes}M"));
        }
        if nanos > 0 {
            let frac = format!("{nanos:09}");
            let frac = frac.trim_end_matches('0');
            out.push_str(&format!("{secs}.{frac}S"));
        } else if secs > 0 {
            out.push_str(&format!("{secs}S"));
        }
    }
    out
}

/// Serde adapter for `Duration` fields carried as ISO-8601 strings.
pub mod iso8601 {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(de)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for `Option<Duration>` fields carried as ISO-8601 strings.
pub mod iso8601_opt {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => ser.serialize_some(&format_duration(*d)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        let s: Option<String> = Option::deserialize(de)?;
        s.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
#[path = "duration_tests.rs"]
mod tests;
