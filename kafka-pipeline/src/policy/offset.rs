use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};

use crate::error::ConfigError;

/// Where consumption of a newly assigned partition starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffsetKind {
    /// Low watermark
    Begin,
    /// High watermark
    End,
    /// Committed position, falling back to the low watermark
    Stored,
    /// Committed position, falling back to the high watermark
    StoredOrEnd,
}

impl OffsetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetKind::Begin => "begin",
            OffsetKind::End => "end",
            OffsetKind::Stored => "stored",
            OffsetKind::StoredOrEnd => "stored_or_end",
        }
    }
}

impl fmt::Display for OffsetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OffsetKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "begin" | "beginning" | "earliest" => Ok(OffsetKind::Begin),
            "end" | "latest" => Ok(OffsetKind::End),
            "stored" => Ok(OffsetKind::Stored),
            "storedorend" | "stored_or_end" => Ok(OffsetKind::StoredOrEnd),
            other => Err(ConfigError::InvalidArgument {
                name: "offset".to_string(),
                message: format!("unknown offset kind {other:?}"),
            }),
        }
    }
}

/// Symbolic start-offset policy, resolved per partition at assignment time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetPolicy {
    kind: OffsetKind,
    bias: i64,
    as_of: Option<DateTime<Utc>>,
}

impl OffsetPolicy {
    pub fn new(kind: OffsetKind, bias: i64) -> Self {
        Self {
            kind,
            bias,
            as_of: None,
        }
    }

    /// Start from the first offset whose timestamp is at or after `date`.
    pub fn as_of(date: DateTime<Utc>) -> Self {
        Self {
            kind: OffsetKind::Begin,
            bias: 0,
            as_of: Some(date),
        }
    }

    /// Attach an as-of date to a kind/bias policy. Combining a non-zero bias with
    /// a date is rejected by `validate`.
    pub fn with_as_of(mut self, date: DateTime<Utc>) -> Self {
        self.as_of = Some(date);
        self
    }

    pub fn kind(&self) -> OffsetKind {
        self.kind
    }

    pub fn bias(&self) -> i64 {
        self.bias
    }

    pub fn as_of_date(&self) -> Option<DateTime<Utc>> {
        self.as_of
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.as_of.is_some() && self.bias != 0 {
            return Err(ConfigError::AmbiguousOffset);
        }
        Ok(())
    }

    /// Parse an as-of argument: an RFC 3339 timestamp, a `YYYY-MM-DD` date (UTC
    /// midnight), or a duration such as `30m`, `2h`, `1d12h` counted back from `now`.
    pub fn parse_as_of(text: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, ConfigError> {
        let text = text.trim();

        if let Ok(date) = DateTime::parse_from_rfc3339(text) {
            return Ok(date.with_timezone(&Utc));
        }

        if let Ok(day) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            if let Some(midnight) = day.and_hms_opt(0, 0, 0) {
                return Ok(midnight.and_utc());
            }
        }

        let lookback = parse_duration(text)?;
        now.checked_sub_signed(lookback)
            .ok_or_else(|| invalid_as_of(text, "duration reaches before the supported date range"))
    }
}

fn parse_duration(text: &str) -> Result<TimeDelta, ConfigError> {
    let body = text.strip_prefix('-').unwrap_or(text);
    if body.is_empty() {
        return Err(invalid_as_of(text, "expected a date or a duration"));
    }

    let mut total = TimeDelta::zero();
    let mut digits = String::new();
    for c in body.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        let amount: i64 = digits
            .parse()
            .map_err(|_| invalid_as_of(text, "expected a number before each unit"))?;
        digits.clear();

        let part = match c.to_ascii_lowercase() {
            's' => TimeDelta::try_seconds(amount),
            'm' => TimeDelta::try_minutes(amount),
            'h' => TimeDelta::try_hours(amount),
            'd' => TimeDelta::try_days(amount),
            'w' => TimeDelta::try_weeks(amount),
            _ => return Err(invalid_as_of(text, "unknown duration unit")),
        }
        .ok_or_else(|| invalid_as_of(text, "duration out of range"))?;

        total = total
            .checked_add(&part)
            .ok_or_else(|| invalid_as_of(text, "duration out of range"))?;
    }

    if !digits.is_empty() {
        return Err(invalid_as_of(text, "missing unit after number"));
    }

    Ok(total)
}

fn invalid_as_of(text: &str, message: &str) -> ConfigError {
    ConfigError::InvalidArgument {
        name: "offset".to_string(),
        message: format!("{message}: {text:?}"),
    }
}
