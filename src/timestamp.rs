use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::str::FromStr;
use std::time::{SystemTime, SystemTimeError};

/// A Unix timestamp represented as a `u64`, used for schedule boundaries,
/// record creation times, and rate-limit windows.
///
/// Serialized as a stringified integer to avoid loss of precision in JSON.
/// For example, `1699999999` becomes `"1699999999"` in the wire format.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash)]
pub struct UnixTimestamp(pub u64);

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let ts = s
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom("timestamp must be a non-negative integer"))?;
        Ok(UnixTimestamp(ts))
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0 + rhs)
    }
}

impl UnixTimestamp {
    pub fn try_now() -> Result<Self, SystemTimeError> {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_secs();
        Ok(Self(now))
    }

    pub fn seconds_since_epoch(&self) -> u64 {
        self.0
    }

    /// The UTC calendar day this instant falls on.
    pub fn utc_day(&self) -> UtcDay {
        UtcDay(self.0 / 86_400)
    }

    pub fn saturating_sub(&self, secs: u64) -> Self {
        Self(self.0.saturating_sub(secs))
    }
}

/// A UTC calendar day, counted in whole days since the Unix epoch.
///
/// Daily spend accounting compares days by value; the wire format is the
/// ISO date (`"2026-08-01"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcDay(pub u64);

impl UtcDay {
    /// Civil date for this day number (proleptic Gregorian).
    fn to_civil(self) -> (i64, u32, u32) {
        // Howard Hinnant's civil_from_days.
        let z = self.0 as i64 + 719_468;
        let era = z.div_euclid(146_097);
        let doe = z.rem_euclid(146_097);
        let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
        let y = yoe + era * 400;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
        let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
        (if m <= 2 { y + 1 } else { y }, m, d)
    }

    /// Day number for a civil date. Returns `None` for dates before 1970.
    fn from_civil(y: i64, m: u32, d: u32) -> Option<Self> {
        // Howard Hinnant's days_from_civil.
        let y = if m <= 2 { y - 1 } else { y };
        let era = y.div_euclid(400);
        let yoe = y.rem_euclid(400);
        let mp = if m > 2 { m - 3 } else { m + 9 } as i64;
        let doy = (153 * mp + 2) / 5 + d as i64 - 1;
        let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
        let days = era * 146_097 + doe - 719_468;
        u64::try_from(days).ok().map(Self)
    }
}

impl Display for UtcDay {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let (y, m, d) = self.to_civil();
        write!(f, "{y:04}-{m:02}-{d:02}")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid UTC date, expected YYYY-MM-DD")]
pub struct UtcDayParseError;

impl FromStr for UtcDay {
    type Err = UtcDayParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '-');
        let y: i64 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or(UtcDayParseError)?;
        let m: u32 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or(UtcDayParseError)?;
        let d: u32 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or(UtcDayParseError)?;
        if !(1..=12).contains(&m) || !(1..=31).contains(&d) {
            return Err(UtcDayParseError);
        }
        Self::from_civil(y, m, d).ok_or(UtcDayParseError)
    }
}

impl Serialize for UtcDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for UtcDay {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
