//! Dynamic cell values produced by the row decoder.

#![allow(clippy::cast_possible_truncation)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConversionError;

const MICROS_PER_SECOND: i64 = 1_000_000;
const SECONDS_PER_DAY: i64 = 86_400;

/// A dynamically-typed value decoded from a result-set cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,

    /// Signed integer
    Int(i64),

    /// Unsigned integer too large for `Int`
    UInt(u64),

    /// Floating point
    Float(f64),

    /// Exact decimal kept in its textual form
    Decimal(String),

    /// Text decoded with the connection encoding
    Text(String),

    /// Raw bytes
    Bytes(Vec<u8>),

    /// Date (days since 1970-01-01)
    Date(i32),

    /// Signed time-of-day or interval (microseconds)
    Time(i64),

    /// Naive timestamp (microseconds since 1970-01-01 00:00:00)
    Timestamp(i64),

    /// JSON document
    Json(serde_json::Value),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Int(_) => "INTEGER",
            Value::UInt(_) => "UNSIGNED",
            Value::Float(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date(_) => "DATE",
            Value::Time(_) => "TIME",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Json(_) => "JSON",
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Try to convert this value to a u64.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Build a `Date` from a calendar date, rejecting impossible dates.
    pub fn date(year: i32, month: u32, day: u32) -> Option<Self> {
        days_from_civil(year, month, day).map(Value::Date)
    }

    /// Build a `Timestamp` from calendar fields.
    pub fn timestamp(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
        micros: u32,
    ) -> Option<Self> {
        if hour > 23 || minute > 59 || second > 59 || micros > 999_999 {
            return None;
        }
        let days = i64::from(days_from_civil(year, month, day)?);
        let secs = days * SECONDS_PER_DAY
            + i64::from(hour) * 3600
            + i64::from(minute) * 60
            + i64::from(second);
        Some(Value::Timestamp(secs * MICROS_PER_SECOND + i64::from(micros)))
    }
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
pub fn days_from_civil(year: i32, month: u32, day: u32) -> Option<i32> {
    if !(1..=9999).contains(&year) || day == 0 || day > days_in_month(year, month) {
        return None;
    }
    let y = i64::from(if month <= 2 { year - 1 } else { year });
    let m = i64::from(month);
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    i32::try_from(era * 146_097 + doe - 719_468).ok()
}

/// Calendar date for a day count since 1970-01-01.
pub fn civil_from_days(days: i32) -> (i32, u32, u32) {
    let z = i64::from(days) + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year as i32, month, day)
}

fn write_fraction(f: &mut fmt::Formatter<'_>, micros: i64) -> fmt::Result {
    if micros != 0 {
        write!(f, ".{:06}", micros)?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Decimal(s) | Value::Text(s) => f.write_str(s),
            Value::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            Value::Date(days) => {
                let (y, m, d) = civil_from_days(*days);
                write!(f, "{y:04}-{m:02}-{d:02}")
            }
            Value::Time(micros) => {
                let sign = if *micros < 0 { "-" } else { "" };
                let abs = micros.unsigned_abs();
                let secs = abs / 1_000_000;
                write!(
                    f,
                    "{sign}{}:{:02}:{:02}",
                    secs / 3600,
                    (secs / 60) % 60,
                    secs % 60
                )?;
                write_fraction(f, (abs % 1_000_000) as i64)
            }
            Value::Timestamp(micros) => {
                let secs = micros.div_euclid(MICROS_PER_SECOND);
                let frac = micros.rem_euclid(MICROS_PER_SECOND);
                let days = secs.div_euclid(SECONDS_PER_DAY);
                let tod = secs.rem_euclid(SECONDS_PER_DAY);
                let (y, m, d) = civil_from_days(days as i32);
                write!(
                    f,
                    "{y:04}-{m:02}-{d:02} {:02}:{:02}:{:02}",
                    tod / 3600,
                    (tod / 60) % 60,
                    tod % 60
                )?;
                write_fraction(f, frac)
            }
            Value::Json(j) => write!(f, "{j}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        i64::try_from(v).map_or(Value::UInt(v), Value::Int)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

fn mismatch(expected: &str, value: &Value) -> ConversionError {
    ConversionError::new(format!("expected {expected}, found {}", value.type_name()))
}

impl TryFrom<Value> for i64 {
    type Error = ConversionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_i64().ok_or_else(|| mismatch("i64", &value))
    }
}

impl TryFrom<Value> for u64 {
    type Error = ConversionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_u64().ok_or_else(|| mismatch("u64", &value))
    }
}

impl TryFrom<Value> for f64 {
    type Error = ConversionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_f64().ok_or_else(|| mismatch("f64", &value))
    }
}

impl TryFrom<Value> for String {
    type Error = ConversionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(s) | Value::Decimal(s) => Ok(s),
            other => Err(mismatch("text", &other)),
        }
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = ConversionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bytes(b) => Ok(b),
            Value::Text(s) => Ok(s.into_bytes()),
            other => Err(mismatch("bytes", &other)),
        }
    }
}

impl<T> TryFrom<Value> for Option<T>
where
    T: TryFrom<Value, Error = ConversionError>,
{
    type Error = ConversionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(None),
            v => T::try_from(v).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_unsigned() {
        assert_eq!(Value::from(42u64), Value::Int(42));
        assert_eq!(Value::from(u64::MAX), Value::UInt(u64::MAX));
    }

    #[test]
    fn test_from_option() {
        let none: Value = Option::<i64>::None.into();
        assert_eq!(none, Value::Null);
        let some: Value = Some("x").into();
        assert_eq!(some, Value::Text("x".to_string()));
    }

    #[test]
    fn test_try_from() {
        assert_eq!(i64::try_from(Value::Int(-7)).unwrap(), -7);
        assert_eq!(u64::try_from(Value::UInt(u64::MAX)).unwrap(), u64::MAX);
        assert!(i64::try_from(Value::UInt(u64::MAX)).is_err());
        assert_eq!(
            String::try_from(Value::Text("abc".to_string())).unwrap(),
            "abc"
        );
        assert!(String::try_from(Value::Bytes(vec![1])).is_err());
        assert_eq!(Option::<i64>::try_from(Value::Null).unwrap(), None);
    }

    #[test]
    fn test_civil_days() {
        assert_eq!(days_from_civil(1970, 1, 1), Some(0));
        assert_eq!(days_from_civil(2000, 3, 1), Some(11_017));
        assert_eq!(days_from_civil(1969, 12, 31), Some(-1));
        assert_eq!(days_from_civil(2023, 2, 29), None);
        assert_eq!(days_from_civil(2024, 2, 29), Some(19_782));
        assert_eq!(days_from_civil(0, 1, 1), None);
        assert_eq!(civil_from_days(19_782), (2024, 2, 29));
        assert_eq!(civil_from_days(-1), (1969, 12, 31));
    }

    #[test]
    fn test_display_temporal() {
        assert_eq!(Value::date(2024, 2, 29).unwrap().to_string(), "2024-02-29");
        assert_eq!(
            Value::timestamp(2021, 7, 4, 13, 5, 9, 0).unwrap().to_string(),
            "2021-07-04 13:05:09"
        );
        assert_eq!(
            Value::timestamp(1960, 1, 1, 0, 0, 0, 250).unwrap().to_string(),
            "1960-01-01 00:00:00.000250"
        );
        assert_eq!(Value::Time(-(3600 + 2) * 1_000_000).to_string(), "-1:00:02");
        assert_eq!(Value::Time(838 * 3_600_000_000).to_string(), "838:00:00");
    }

    #[test]
    fn test_timestamp_rejects_out_of_range_fields() {
        assert!(Value::timestamp(2021, 1, 1, 24, 0, 0, 0).is_none());
        assert!(Value::timestamp(2021, 13, 1, 0, 0, 0, 0).is_none());
    }
}
