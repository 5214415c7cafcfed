//! Caller-side conversion of decoded values into Rust types.
//!
//! Decoding leaves most columns as PostgreSQL's text; [`FromValue`] finishes
//! the job when the caller knows what type it wants.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::error::{DriverError, Result};
use crate::pg::types::Value;

/// Conversion from a decoded [`Value`].
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch<T>(value: &Value, target: &str) -> Result<T> {
    Err(DriverError::Conversion(match value {
        Value::Null => format!("cannot convert NULL to {}", target),
        Value::Text(text) => format!("cannot convert {:?} to {}", text, target),
        other => format!("cannot convert {} value to {}", other.kind(), target),
    }))
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Text(text) => match text.as_str() {
                "true" | "t" => Ok(true),
                "false" | "f" => Ok(false),
                _ => mismatch(value, "bool"),
            },
            _ => mismatch(value, "bool"),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int(v) => Ok(*v),
            Value::Text(text) => text.parse().or_else(|_| mismatch(value, "i64")),
            _ => mismatch(value, "i64"),
        }
    }
}

macro_rules! narrow_int {
    ($($t:ty),*) => {
        $(
            impl FromValue for $t {
                fn from_value(value: &Value) -> Result<Self> {
                    let wide = i64::from_value(value)?;
                    <$t>::try_from(wide).or_else(|_| mismatch(value, stringify!($t)))
                }
            }
        )*
    };
}

narrow_int!(i32, i16);

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            Value::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                digits => digits.parse().or_else(|_| mismatch(value, "f64")),
            },
            _ => mismatch(value, "f64"),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self> {
        f64::from_value(value).map(|v| v as f32)
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(text) => Ok(text.clone()),
            Value::Int(v) => Ok(v.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Bytes(bytes) => {
                String::from_utf8(bytes.clone()).or_else(|_| mismatch(value, "String"))
            }
            _ => mismatch(value, "String"),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bytes(bytes) => Ok(bytes.clone()),
            Value::Text(text) => Ok(text.as_bytes().to_vec()),
            _ => mismatch(value, "Vec<u8>"),
        }
    }
}

impl FromValue for DateTime<FixedOffset> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Timestamp(ts) => Ok(*ts),
            Value::Text(text) => parse_timestamp(text).ok_or_else(|| {
                DriverError::Conversion(format!("cannot parse {:?} as a timestamp", text))
            }),
            _ => mismatch(value, "timestamp"),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> Result<Self> {
        DateTime::<FixedOffset>::from_value(value).map(|ts| ts.with_timezone(&Utc))
    }
}

/// The wall-clock reading; any offset is dropped.
impl FromValue for NaiveDateTime {
    fn from_value(value: &Value) -> Result<Self> {
        DateTime::<FixedOffset>::from_value(value).map(|ts| ts.naive_local())
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(text) => NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .or_else(|_| mismatch(value, "date")),
            other => NaiveDateTime::from_value(other).map(|ts| ts.date()),
        }
    }
}

impl FromValue for NaiveTime {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(text) => {
                NaiveTime::parse_from_str(text, "%H:%M:%S%.f").or_else(|_| mismatch(value, "time"))
            }
            Value::Timestamp(ts) => Ok(ts.time()),
            _ => mismatch(value, "time"),
        }
    }
}

/// Parse PostgreSQL's `timestamptz`, `timestamp` or `date` output.
/// Values without an offset are taken to be UTC.
fn parse_timestamp(text: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(ts) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(ts);
    }
    let utc = FixedOffset::east_opt(0)?;
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc().with_timezone(&utc));
    }
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().with_timezone(&utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    #[test]
    fn booleans() {
        assert!(bool::from_value(&text("true")).unwrap());
        assert!(!bool::from_value(&text("f")).unwrap());
        assert!(bool::from_value(&text("yes")).is_err());
    }

    #[test]
    fn integers() {
        assert_eq!(i64::from_value(&text("1099511627776")).unwrap(), 1_099_511_627_776);
        assert_eq!(i32::from_value(&text("-7")).unwrap(), -7);
        assert!(i16::from_value(&text("70000")).is_err());
        assert!(i64::from_value(&text("1.5")).is_err());
    }

    #[test]
    fn floats() {
        assert_eq!(f64::from_value(&text("1.25")).unwrap(), 1.25);
        assert!(f64::from_value(&text("NaN")).unwrap().is_nan());
        assert_eq!(f64::from_value(&text("-Infinity")).unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn null_needs_an_option() {
        assert!(matches!(
            String::from_value(&Value::Null),
            Err(DriverError::Conversion(_))
        ));
        assert_eq!(Option::<String>::from_value(&Value::Null).unwrap(), None);
        assert_eq!(Option::<i64>::from_value(&text("5")).unwrap(), Some(5));
    }

    #[test]
    fn timestamps() {
        let ts = DateTime::<FixedOffset>::from_value(&text("2024-03-01 12:30:45.25+02")).unwrap();
        assert_eq!(ts.offset().local_minus_utc(), 2 * 3600);
        assert_eq!(ts.nanosecond(), 250_000_000);

        let ts = DateTime::<Utc>::from_value(&text("2024-03-01 12:30:45+05:30")).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 45).unwrap());

        let naive = NaiveDateTime::from_value(&text("2024-03-01 12:30:45")).unwrap();
        assert_eq!(naive.hour(), 12);

        let date = NaiveDate::from_value(&text("2024-03-01")).unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());

        assert!(DateTime::<Utc>::from_value(&text("yesterday")).is_err());
    }

    #[test]
    fn bytes_and_strings() {
        assert_eq!(Vec::<u8>::from_value(&Value::Bytes(vec![1, 2])).unwrap(), vec![1, 2]);
        assert_eq!(String::from_value(&text("héllo")).unwrap(), "héllo");
        assert!(String::from_value(&Value::Bytes(vec![0xff])).is_err());
    }
}
