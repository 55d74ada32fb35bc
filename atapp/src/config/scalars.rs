// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Human-friendly scalar grammars used by the configuration tree
//!
//! Durations accept an integer with an optional unit suffix
//! (`ns us ms s m h d w`, defaulting to seconds). Timestamps accept
//! `YYYY-MM-DD[T ]hh:mm:ss` with an optional `Z` or `±HH[:MM]` offset.

use std::time::{Duration, SystemTime};

use crate::errors::AppError;

/// Parse a duration scalar such as `16ms`, `30s`, `5m` or a bare `10`
/// (seconds). Whitespace between number and unit is allowed.
pub fn parse_duration(input: &str) -> Result<Duration, AppError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AppError::BadData);
    }

    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);
    let value: u64 = digits.parse().map_err(|_| AppError::BadData)?;

    match unit.trim().to_ascii_lowercase().as_str() {
        "ns" | "nanos" | "nanosecond" | "nanoseconds" => Ok(Duration::from_nanos(value)),
        "us" | "micros" | "microsecond" | "microseconds" => Ok(Duration::from_micros(value)),
        "ms" | "millis" | "millisecond" | "milliseconds" => Ok(Duration::from_millis(value)),
        "" | "s" | "sec" | "second" | "seconds" => Ok(Duration::from_secs(value)),
        "m" | "min" | "minute" | "minutes" => Ok(Duration::from_secs(value * 60)),
        "h" | "hour" | "hours" => Ok(Duration::from_secs(value * 3600)),
        "d" | "day" | "days" => Ok(Duration::from_secs(value * 86400)),
        "w" | "week" | "weeks" => Ok(Duration::from_secs(value * 604800)),
        _ => Err(AppError::BadData),
    }
}

fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    // Howard Hinnant's civil-from-days inverse; valid over the whole i64
    // range we care about.
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (month as i64 + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

/// Parse a timestamp scalar such as `2024-05-01T12:30:00Z` or
/// `2024-05-01 12:30:00+08:00`. Without an offset the timestamp is taken
/// as UTC.
pub fn parse_timepoint(input: &str) -> Result<SystemTime, AppError> {
    let input = input.trim();
    let (date, rest) = input.split_once(['T', ' ']).ok_or(AppError::BadData)?;

    let mut date_parts = date.split('-');
    let year: i64 = date_parts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or(AppError::BadData)?;
    let month: u32 = date_parts
        .next()
        .and_then(|v| v.parse().ok())
        .filter(|m| (1..=12).contains(m))
        .ok_or(AppError::BadData)?;
    let day: u32 = date_parts
        .next()
        .and_then(|v| v.parse().ok())
        .filter(|d| (1..=31).contains(d))
        .ok_or(AppError::BadData)?;

    // peel the timezone suffix off the time-of-day part
    let (time, offset_secs) = if let Some(stripped) = rest.strip_suffix(['Z', 'z']) {
        (stripped, 0i64)
    } else if let Some(idx) = rest.rfind(['+', '-']) {
        let (time, tz) = rest.split_at(idx);
        let sign: i64 = if tz.starts_with('-') { -1 } else { 1 };
        let tz = &tz[1..];
        let (hh, mm) = match tz.split_once(':') {
            Some((h, m)) => (h, m),
            None => (tz, "0"),
        };
        let hours: i64 = hh.parse().map_err(|_| AppError::BadData)?;
        let minutes: i64 = mm.parse().map_err(|_| AppError::BadData)?;
        (time, sign * (hours * 3600 + minutes * 60))
    } else {
        (rest, 0i64)
    };

    let mut time_parts = time.split(':');
    let hour: i64 = time_parts
        .next()
        .and_then(|v| v.parse().ok())
        .filter(|h| (0..24).contains(h))
        .ok_or(AppError::BadData)?;
    let minute: i64 = time_parts
        .next()
        .and_then(|v| v.parse().ok())
        .filter(|m| (0..60).contains(m))
        .ok_or(AppError::BadData)?;
    let second: i64 = time_parts
        .next()
        .and_then(|v| v.parse().ok())
        .filter(|s| (0..61).contains(s))
        .ok_or(AppError::BadData)?;

    let days = days_from_civil(year, month, day);
    let epoch_secs = days * 86400 + hour * 3600 + minute * 60 + second - offset_secs;
    if epoch_secs < 0 {
        return Err(AppError::BadData);
    }

    Ok(SystemTime::UNIX_EPOCH + Duration::from_secs(epoch_secs as u64))
}

/// Serde adapter for duration scalars, accepting either the suffixed
/// string form or a bare integer second count.
pub mod duration_serde {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Deserialize a duration scalar.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Seconds(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => super::parse_duration(&text)
                .map_err(|_| D::Error::custom(format!("invalid duration scalar '{text}'"))),
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        }
    }

    /// Serialize as whole milliseconds (`"250ms"`) for readability.
    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_with_suffixes() {
        assert_eq!(Duration::from_nanos(5), parse_duration("5ns").unwrap());
        assert_eq!(Duration::from_micros(7), parse_duration("7us").unwrap());
        assert_eq!(Duration::from_millis(16), parse_duration("16ms").unwrap());
        assert_eq!(Duration::from_secs(30), parse_duration("30s").unwrap());
        assert_eq!(Duration::from_secs(30), parse_duration("30").unwrap());
        assert_eq!(Duration::from_secs(120), parse_duration("2m").unwrap());
        assert_eq!(Duration::from_secs(7200), parse_duration("2h").unwrap());
        assert_eq!(Duration::from_secs(86400), parse_duration("1d").unwrap());
        assert_eq!(Duration::from_secs(604800), parse_duration("1w").unwrap());
        assert_eq!(Duration::from_secs(9), parse_duration(" 9 s ").unwrap());
    }

    #[test]
    fn bad_durations_rejected() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("5fortnights").is_err());
    }

    #[test]
    fn timestamps_parse() {
        let epoch = parse_timepoint("1970-01-01T00:00:00Z").unwrap();
        assert_eq!(SystemTime::UNIX_EPOCH, epoch);

        let t = parse_timepoint("2024-05-01 12:30:00").unwrap();
        let tz = parse_timepoint("2024-05-01T20:30:00+08:00").unwrap();
        assert_eq!(t, tz);

        let back = parse_timepoint("2024-05-01T04:30:00-08:00").unwrap();
        assert_eq!(t, back);
    }

    #[test]
    fn bad_timestamps_rejected() {
        assert!(parse_timepoint("2024-13-01T00:00:00Z").is_err());
        assert!(parse_timepoint("not-a-date").is_err());
        assert!(parse_timepoint("2024-05-01").is_err());
    }
}
