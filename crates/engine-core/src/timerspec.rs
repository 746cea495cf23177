//! ISO-8601 timer spec parsing: durations (`PT30S`), dates
//! (`2025-12-31T23:59:59Z`), and finite-repeat cycles (`R3/PT20S`).
//!
//! This is deliberately hand-rolled rather than pulled from a calendar/DSL
//! crate: the grammar is three small cases and `chrono` already covers the
//! date arm.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum TimerSpec {
    Duration(std::time::Duration),
    Date(DateTime<Utc>),
    /// `R<n>/PT<duration>` — finite repeats, `n` additional fires after the
    /// first (per the ISO-8601 repeating-interval grammar).
    Cycle {
        repeats: u32,
        interval: std::time::Duration,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerSpecError {
    #[error("not a recognized ISO-8601 timer spec: {0}")]
    Unrecognized(String),
    #[error("unsupported duration designator in: {0}")]
    UnsupportedDesignator(String),
}

impl TimerSpec {
    pub fn parse(raw: &str) -> Result<Self, TimerSpecError> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix('R') {
            let (count_str, duration_str) = rest
                .split_once('/')
                .ok_or_else(|| TimerSpecError::Unrecognized(raw.to_string()))?;
            let repeats: u32 = count_str
                .parse()
                .map_err(|_| TimerSpecError::Unrecognized(raw.to_string()))?;
            let interval = parse_duration(duration_str)?;
            return Ok(TimerSpec::Cycle { repeats, interval });
        }
        if raw.starts_with('P') {
            return Ok(TimerSpec::Duration(parse_duration(raw)?));
        }
        let date = DateTime::parse_from_rfc3339(raw)
            .map_err(|_| TimerSpecError::Unrecognized(raw.to_string()))?
            .with_timezone(&Utc);
        Ok(TimerSpec::Date(date))
    }

    /// Resolve a due timestamp from `now`, for the first fire.
    pub fn due_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimerSpec::Duration(d) => now + chrono::Duration::from_std(*d).unwrap_or_default(),
            TimerSpec::Date(d) => *d,
            TimerSpec::Cycle { interval, .. } => {
                now + chrono::Duration::from_std(*interval).unwrap_or_default()
            }
        }
    }
}

/// Parse a subset of ISO-8601 durations: `PT<n>H`, `PT<n>M`, `PT<n>S`,
/// `P<n>D`, and simple combinations like `PT1H30M`.
fn parse_duration(raw: &str) -> Result<std::time::Duration, TimerSpecError> {
    let raw = raw.trim();
    if !raw.starts_with('P') {
        return Err(TimerSpecError::Unrecognized(raw.to_string()));
    }
    let mut total_secs: u64 = 0;
    let mut chars = raw.chars().peekable();
    chars.next(); // consume 'P'
    let mut in_time = false;
    let mut num = String::new();

    while let Some(&c) = chars.peek() {
        match c {
            'T' => {
                in_time = true;
                chars.next();
            }
            '0'..='9' => {
                num.push(c);
                chars.next();
            }
            'D' | 'H' | 'M' | 'S' => {
                let n: u64 = num
                    .parse()
                    .map_err(|_| TimerSpecError::Unrecognized(raw.to_string()))?;
                num.clear();
                let secs = match c {
                    'D' if !in_time => n * 86_400,
                    'H' if in_time => n * 3_600,
                    'M' if in_time => n * 60,
                    'S' if in_time => n,
                    _ => return Err(TimerSpecError::UnsupportedDesignator(raw.to_string())),
                };
                total_secs += secs;
                chars.next();
            }
            _ => return Err(TimerSpecError::Unrecognized(raw.to_string())),
        }
    }
    Ok(std::time::Duration::from_secs(total_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_duration() {
        assert_eq!(
            TimerSpec::parse("PT30S").unwrap(),
            TimerSpec::Duration(std::time::Duration::from_secs(30))
        );
    }

    #[test]
    fn parses_compound_duration() {
        assert_eq!(
            TimerSpec::parse("PT1H30M").unwrap(),
            TimerSpec::Duration(std::time::Duration::from_secs(5400))
        );
    }

    #[test]
    fn parses_date() {
        let spec = TimerSpec::parse("2025-12-31T23:59:59Z").unwrap();
        assert!(matches!(spec, TimerSpec::Date(_)));
    }

    #[test]
    fn parses_finite_cycle() {
        assert_eq!(
            TimerSpec::parse("R3/PT20S").unwrap(),
            TimerSpec::Cycle {
                repeats: 3,
                interval: std::time::Duration::from_secs(20)
            }
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(TimerSpec::parse("not-a-timer").is_err());
    }
}
