//! PostgreSQL text-format type codec.
//!
//! Arguments are always sent in text format and results are always requested
//! in text format. Encoding turns a [`Value`] into the string PostgreSQL
//! parses for a parameter; decoding looks at a column's type OID and either
//! passes the text through, rewrites it (booleans) or converts it (bytea).
//! Final typed conversion of pass-through text is left to [`crate::scan`].
//!
//! Reference: https://www.postgresql.org/docs/current/datatype.html

use std::borrow::Cow;
use std::fmt::Write as _;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};

use crate::error::{DriverError, Result};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from `pg_type.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID: Oid = Oid(26);
    pub const XID: Oid = Oid(28);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const UNKNOWN: Oid = Oid(705);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const TIMETZ: Oid = Oid(1266);
    pub const NUMERIC: Oid = Oid(1700);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Types whose text form is handed to the caller unchanged.
    pub fn is_pass_through(self) -> bool {
        matches!(
            self,
            Oid::CHAR
                | Oid::BPCHAR
                | Oid::VARCHAR
                | Oid::TEXT
                | Oid::NAME
                | Oid::INT2
                | Oid::INT4
                | Oid::INT8
                | Oid::OID
                | Oid::XID
                | Oid::FLOAT4
                | Oid::FLOAT8
                | Oid::NUMERIC
                | Oid::DATE
                | Oid::TIME
                | Oid::TIMETZ
                | Oid::TIMESTAMP
                | Oid::TIMESTAMPTZ
                | Oid::INTERVAL
        )
    }

    /// Whether [`decode`] knows how to handle this type.
    pub fn is_supported(self) -> bool {
        self == Oid::BOOL || self == Oid::BYTEA || self.is_pass_through()
    }
}

// ============================================================================
// Values
// ============================================================================

/// A driver-neutral value: a query argument or a decoded result cell.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Text(String),
    Timestamp(DateTime<FixedOffset>),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short type name, used in conversion errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
        }
    }
}

// ============================================================================
// Argument conversion
// ============================================================================

/// Conversion of Rust values into query arguments.
///
/// Conversions that cannot be represented by [`Value`] fail with
/// [`DriverError::UnsupportedArgumentType`].
pub trait ToValue {
    fn to_value(&self) -> Result<Value>;
}

impl ToValue for Value {
    fn to_value(&self) -> Result<Value> {
        Ok(self.clone())
    }
}

impl<T: ToValue + ?Sized> ToValue for &T {
    fn to_value(&self) -> Result<Value> {
        (**self).to_value()
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_value(&self) -> Result<Value> {
        match self {
            Some(v) => v.to_value(),
            None => Ok(Value::Null),
        }
    }
}

impl ToValue for bool {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Bool(*self))
    }
}

macro_rules! lossless_int {
    ($($t:ty),*) => {
        $(
            impl ToValue for $t {
                fn to_value(&self) -> Result<Value> {
                    Ok(Value::Int(i64::from(*self)))
                }
            }
        )*
    };
}

lossless_int!(i8, i16, i32, i64, u8, u16, u32);

macro_rules! checked_int {
    ($($t:ty),*) => {
        $(
            impl ToValue for $t {
                fn to_value(&self) -> Result<Value> {
                    i64::try_from(*self).map(Value::Int).map_err(|_| {
                        DriverError::UnsupportedArgumentType(format!(
                            "{} value {} does not fit in a 64-bit signed integer",
                            stringify!($t),
                            self
                        ))
                    })
                }
            }
        )*
    };
}

checked_int!(u64, usize, i128, u128);

impl ToValue for f32 {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Float(f64::from(*self)))
    }
}

impl ToValue for f64 {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Float(*self))
    }
}

impl ToValue for str {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Text(self.to_string()))
    }
}

impl ToValue for String {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Text(self.clone()))
    }
}

impl ToValue for [u8] {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Bytes(self.to_vec()))
    }
}

impl ToValue for Vec<u8> {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Bytes(self.clone()))
    }
}

impl<Tz: TimeZone> ToValue for DateTime<Tz> {
    fn to_value(&self) -> Result<Value> {
        let offset = chrono::Offset::fix(self.offset());
        Ok(Value::Timestamp(self.with_timezone(&offset)))
    }
}

/// Naive timestamps are taken to be UTC.
impl ToValue for NaiveDateTime {
    fn to_value(&self) -> Result<Value> {
        Utc.from_utc_datetime(self).to_value()
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a value into PostgreSQL text format.
pub fn encode(value: &Value) -> Result<Cow<'_, str>> {
    let text = match value {
        Value::Null => Cow::Borrowed("NULL"),
        Value::Bool(true) => Cow::Borrowed("t"),
        Value::Bool(false) => Cow::Borrowed("f"),
        Value::Int(v) => Cow::Owned(v.to_string()),
        Value::Float(v) => Cow::Owned(encode_float(*v)),
        Value::Bytes(v) => Cow::Owned(encode_bytea(v)),
        Value::Text(v) => Cow::Borrowed(v.as_str()),
        Value::Timestamp(v) => Cow::Owned(encode_timestamp(v)),
    };
    Ok(text)
}

/// Encode a value into an argument slot; NULL becomes a protocol-level null.
pub fn encode_argument(value: &Value) -> Result<Option<String>> {
    if value.is_null() {
        return Ok(None);
    }
    encode(value).map(|text| Some(text.into_owned()))
}

fn encode_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "Infinity".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        // Shortest digits that round-trip, exponential notation.
        format!("{:E}", v)
    }
}

fn encode_bytea(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// `YYYY-MM-DD HH:MM:SS.ffffff±HH`
fn encode_timestamp(ts: &DateTime<FixedOffset>) -> String {
    let mut offset = ts.offset().local_minus_utc();
    // The wire form only carries whole hours.
    let local = if offset % 3600 == 0 {
        ts.naive_local()
    } else {
        offset = 0;
        ts.naive_utc()
    };
    let sign = if offset < 0 { '-' } else { '+' };
    format!(
        "{}{}{:02}",
        local.format("%Y-%m-%d %H:%M:%S%.6f"),
        sign,
        offset.abs() / 3600
    )
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a text-format cell of type `oid`. `None` is SQL NULL.
pub fn decode(oid: Oid, data: Option<&[u8]>) -> Result<Value> {
    let Some(data) = data else {
        return Ok(Value::Null);
    };

    match oid {
        Oid::BOOL => {
            let truthy = data == b"t";
            Ok(Value::Text(if truthy { "true" } else { "false" }.to_string()))
        }
        Oid::BYTEA => {
            let hex = data
                .strip_prefix(b"\\x")
                .ok_or(DriverError::InvalidByteFormat)?;
            decode_hex(hex).map(Value::Bytes)
        }
        _ if oid.is_pass_through() => std::str::from_utf8(data)
            .map(|s| Value::Text(s.to_string()))
            .map_err(|e| DriverError::Decode(format!("invalid UTF-8 in column: {}", e))),
        _ => Err(DriverError::UnsupportedColumnType { oid: oid.as_i32() }),
    }
}

fn decode_hex(hex: &[u8]) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(DriverError::HexDecodeError(format!(
            "odd length hex string ({} digits)",
            hex.len()
        )));
    }

    hex.chunks_exact(2)
        .map(|pair| Ok((hex_digit(pair[0])? << 4) | hex_digit(pair[1])?))
        .collect()
}

fn hex_digit(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(DriverError::HexDecodeError(format!(
            "invalid byte {:#04x}",
            c
        ))),
    }
}
