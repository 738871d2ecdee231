//! Hold-duration parsing.
//!
//! Accepts the humanised forms used in `tasklock.toml` (`"30s"`, `"5m"`,
//! `"1h30m"`, `"1500ms"`, bare seconds) as well as the ISO-8601 form
//! (`"PT5M"`, `"PT14M"`, `"P1DT2H"`) that lock annotations are usually
//! written in.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

use crate::error::{CoreError, Result};

/// Parse a duration string. See the module docs for the accepted syntax.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid(input, "empty duration"));
    }

    let upper = trimmed.to_ascii_uppercase();
    if upper.starts_with('P') {
        return parse_iso8601(&upper).ok_or_else(|| invalid(input, "malformed ISO-8601 duration"));
    }

    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    parse_humanized(trimmed).ok_or_else(|| invalid(input, "expected e.g. 30s, 5m, 2h or PT5M"))
}

/// Render a duration back in the humanised form `parse_duration` accepts.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

fn invalid(input: &str, reason: &str) -> CoreError {
    CoreError::InvalidDuration {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

/// `1h30m`, `45s`, `1500ms`, `2d`. One or more number/unit pairs.
fn parse_humanized(s: &str) -> Option<Duration> {
    let mut total_ms: u128 = 0;
    let mut chars = s.chars().peekable();
    let mut seen_pair = false;

    while chars.peek().is_some() {
        let mut digits = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
            digits.push(c);
            chars.next();
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_alphabetic) {
            unit.push(c.to_ascii_lowercase());
            chars.next();
        }
        if digits.is_empty() || unit.is_empty() {
            return None;
        }
        let value: u128 = digits.parse().ok()?;
        let factor: u128 = match unit.as_str() {
            "ms" => 1,
            "s" | "sec" | "secs" => 1_000,
            "m" | "min" | "mins" => 60_000,
            "h" | "hr" | "hrs" => 3_600_000,
            "d" | "day" | "days" => 86_400_000,
            _ => return None,
        };
        total_ms = total_ms.checked_add(value.checked_mul(factor)?)?;
        seen_pair = true;
    }

    if !seen_pair {
        return None;
    }
    Some(Duration::from_millis(u64::try_from(total_ms).ok()?))
}

/// `P[nD][T[nH][nM][n[.f]S]]`
fn parse_iso8601(s: &str) -> Option<Duration> {
    let rest = s.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => {
            if t.is_empty() {
                return None;
            }
            (d, t)
        }
        None => (rest, ""),
    };
    if date_part.is_empty() && time_part.is_empty() {
        return None;
    }

    let secs = sum_units(date_part, &[('W', 604_800.0), ('D', 86_400.0)])?
        + sum_units(time_part, &[('H', 3_600.0), ('M', 60.0), ('S', 1.0)])?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Units must appear in the given order, each at most once.
fn sum_units(part: &str, units: &[(char, f64)]) -> Option<f64> {
    let mut total = 0.0;
    let mut number = String::new();
    let mut next_unit = 0;

    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let offset = units[next_unit..].iter().position(|(u, _)| *u == c)?;
        let (_, factor) = units[next_unit + offset];
        next_unit += offset + 1;
        let value: f64 = number.parse().ok()?;
        total += value * factor;
        number.clear();
    }

    if !number.is_empty() {
        return None;
    }
    Some(total)
}

/// serde adapter: `#[serde(with = "tasklock_core::duration::humanized")]`.
pub mod humanized {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_humanized_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1500ms").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn parses_iso8601_annotation_values() {
        assert_eq!(parse_duration("PT5M").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("PT14M").unwrap(), Duration::from_secs(840));
        assert_eq!(parse_duration("pt1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("P1DT2H").unwrap(), Duration::from_secs(93_600));
        assert_eq!(parse_duration("PT0.5S").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "abc", "5x", "m5", "PT", "P", "PT5M3H", "-5s"] {
            assert!(parse_duration(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn format_round_trips_through_parse() {
        for d in [
            Duration::from_secs(300),
            Duration::from_secs(7200),
            Duration::from_secs(45),
            Duration::from_millis(1500),
        ] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }
}
