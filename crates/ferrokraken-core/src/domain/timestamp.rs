use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::ValidationError;

/// Numeric values above this are treated as milliseconds, below as seconds.
const MILLIS_THRESHOLD: f64 = 1_000_000_000_000.0;

/// UTC instant with millisecond precision, stored as epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        Self::from_offset_datetime(OffsetDateTime::now_utc())
    }

    pub fn from_offset_datetime(value: OffsetDateTime) -> Self {
        let millis = value.unix_timestamp_nanos() / 1_000_000;
        Self(millis as i64)
    }

    /// Interprets an epoch number, guessing seconds vs milliseconds by magnitude.
    pub fn from_epoch_number(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        let millis = if value > MILLIS_THRESHOLD {
            value
        } else {
            value * 1_000.0
        };
        Some(Self(millis as i64))
    }

    /// Parses epoch seconds/milliseconds or an ISO-8601 string.
    ///
    /// ISO strings without an offset are read as UTC.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        let invalid = || ValidationError::InvalidTimestamp {
            value: input.to_owned(),
        };
        if trimmed.is_empty() {
            return Err(invalid());
        }

        if let Ok(number) = trimmed.parse::<f64>() {
            return Self::from_epoch_number(number).ok_or_else(invalid);
        }

        if let Ok(parsed) = OffsetDateTime::parse(trimmed, &Rfc3339) {
            return Ok(Self::from_offset_datetime(parsed));
        }
        if let Ok(parsed) = OffsetDateTime::parse(trimmed, &Iso8601::DEFAULT) {
            return Ok(Self::from_offset_datetime(parsed));
        }
        PrimitiveDateTime::parse(trimmed, &Iso8601::DEFAULT)
            .map(|naive| Self::from_offset_datetime(naive.assume_utc()))
            .map_err(|_| invalid())
    }

    pub fn to_offset_datetime(self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000_000).ok()
    }

    /// RFC3339 rendering, or `None` when the instant is outside the supported calendar.
    pub fn format_rfc3339(self) -> Option<String> {
        self.to_offset_datetime()
            .and_then(|value| value.format(&Rfc3339).ok())
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.format_rfc3339() {
            Some(formatted) => f.write_str(&formatted),
            None => write!(f, "{}ms", self.0),
        }
    }
}
