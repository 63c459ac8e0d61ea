//! Decoded values.
use std::{fmt, str::FromStr};

use bytes::Bytes;

/// A non-NULL value, one variant per wire type category.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    TinyInt(u8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Real(f32),
    Float(f64),
    Numeric(Numeric),
    /// Money, fixed at scale 4.
    Money(Numeric),
    DateTime(DateTime),
    /// Days since 1900-01-01.
    Date(i32),
    /// 1/300 second ticks since midnight.
    Time(u32),
    String(String),
    Binary(Bytes),
    Guid([u8; 16]),
}

impl Value {
    /// Name of the variant, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::TinyInt(_) => "tinyint",
            Self::SmallInt(_) => "smallint",
            Self::Int(_) => "int",
            Self::BigInt(_) => "bigint",
            Self::Real(_) => "real",
            Self::Float(_) => "float",
            Self::Numeric(_) => "numeric",
            Self::Money(_) => "money",
            Self::DateTime(_) => "datetime",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::String(_) => "string",
            Self::Binary(_) => "binary",
            Self::Guid(_) => "guid",
        }
    }
}

macro_rules! from {
    ($($ty:ty => $variant:ident;)*) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value.into())
                }
            }
        )*
    };
}

from! {
    bool => Bool;
    u8 => TinyInt;
    i16 => SmallInt;
    i32 => Int;
    i64 => BigInt;
    f32 => Real;
    f64 => Float;
    Numeric => Numeric;
    DateTime => DateTime;
    String => String;
    &str => String;
    Bytes => Binary;
    Vec<u8> => Binary;
    [u8; 16] => Guid;
}

/// Column or parameter value, tri-state.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnValue {
    Value(Value),
    /// SQL NULL, distinct from an empty value.
    Null,
    /// Large object not read yet.
    Unread,
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Option<Value>> for ColumnValue {
    fn from(value: Option<Value>) -> Self {
        match value {
            Some(v) => Self::Value(v),
            None => Self::Null,
        }
    }
}

/// Fixed point decimal of up to 38 digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Numeric {
    value: i128,
    scale: u8,
}

/// Maximum decimal digits.
pub const MAX_PRECISION: u8 = 38;

impl Numeric {
    /// Create from unscaled `value` and `scale`, `1234, 2` is `12.34`.
    pub fn new(value: i128, scale: u8) -> Numeric {
        Numeric { value, scale }
    }

    /// Unscaled value.
    pub fn mantissa(&self) -> i128 {
        self.value
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    /// Count of significant digits, at least `1`.
    pub fn digits(&self) -> u8 {
        let mut n = self.value.unsigned_abs();
        let mut digits = 1;
        while n >= 10 {
            n /= 10;
            digits += 1;
        }
        digits
    }

    /// Change scale, rounding half away from zero when digits are dropped.
    pub fn rescale(&self, scale: u8) -> Result<Numeric, ConversionError> {
        use std::cmp::Ordering::*;
        let value = match scale.cmp(&self.scale) {
            Equal => self.value,
            Greater => {
                let factor = pow10(scale - self.scale).ok_or_else(|| ConversionError::overflow(self))?;
                self.value.checked_mul(factor).ok_or_else(|| ConversionError::overflow(self))?
            },
            Less => match pow10(self.scale - scale) {
                Some(divisor) => {
                    let quotient = self.value / divisor;
                    let remainder = (self.value % divisor).unsigned_abs();
                    if remainder * 2 >= divisor.unsigned_abs() {
                        quotient + self.value.signum()
                    } else {
                        quotient
                    }
                },
                None => 0,
            },
        };
        Ok(Numeric { value, scale })
    }

    /// Rescale and check the value fits `precision` digits.
    pub fn fit(&self, precision: u8, scale: u8) -> Result<Numeric, ConversionError> {
        let me = self.rescale(scale)?;
        if me.value != 0 && me.digits() > precision {
            return Err(ConversionError::Precision { value: self.to_string(), precision, scale });
        }
        Ok(me)
    }
}

fn pow10(exp: u8) -> Option<i128> {
    10i128.checked_pow(exp as u32)
}

impl From<i32> for Numeric {
    fn from(value: i32) -> Self {
        Numeric::new(value.into(), 0)
    }
}

impl From<i64> for Numeric {
    fn from(value: i64) -> Self {
        Numeric::new(value.into(), 0)
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.value.unsigned_abs().to_string();
        let scale = self.scale as usize;
        if self.value < 0 {
            f.write_str("-")?;
        }
        if scale == 0 {
            return f.write_str(&digits);
        }
        if digits.len() <= scale {
            write!(f, "0.{}{digits}", "0".repeat(scale - digits.len()))
        } else {
            let (int, frac) = digits.split_at(digits.len() - scale);
            write!(f, "{int}.{frac}")
        }
    }
}

impl fmt::Debug for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Numeric({self})")
    }
}

impl FromStr for Numeric {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConversionError::Parse { input: s.into() };
        let (negative, body) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };
        let (int, frac) = body.split_once('.').unwrap_or((body, ""));
        if int.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if frac.len() > MAX_PRECISION as usize {
            return Err(invalid());
        }

        let mut value: i128 = 0;
        for b in int.bytes().chain(frac.bytes()) {
            if !b.is_ascii_digit() {
                return Err(invalid());
            }
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add((b - b'0') as i128))
                .ok_or_else(invalid)?;
        }

        let value = if negative { -value } else { value };
        Ok(Numeric::new(value, frac.len() as u8))
    }
}

/// Ticks per second of the datetime time part.
pub const TICKS_PER_SECOND: u32 = 300;
/// Ticks per day of the datetime time part.
pub const TICKS_PER_DAY: u32 = TICKS_PER_SECOND * 86_400;

/// Datetime as sent on the wire, days since 1900-01-01 and 1/300 second ticks.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateTime {
    pub days: i32,
    pub ticks: u32,
}

impl DateTime {
    pub fn new(days: i32, ticks: u32) -> DateTime {
        DateTime { days, ticks }
    }

    /// Build from calendar fields.
    pub fn from_parts(year: i32, month: u8, day: u8, hour: u8, minute: u8, second: u8, millis: u16) -> DateTime {
        let days = days_from_civil(year, month as u32, day as u32) - days_from_civil(1900, 1, 1);
        let seconds = hour as u32 * 3600 + minute as u32 * 60 + second as u32;
        let ticks = seconds * TICKS_PER_SECOND + (millis as u32 * 3 + 5) / 10;
        DateTime { days, ticks }
    }

    /// Calendar date `(year, month, day)`.
    pub fn date(&self) -> (i32, u8, u8) {
        let (y, m, d) = civil_from_days(self.days + days_from_civil(1900, 1, 1));
        (y, m as u8, d as u8)
    }

    /// Time of day `(hour, minute, second, millisecond)`.
    pub fn time(&self) -> (u8, u8, u8, u16) {
        let seconds = self.ticks / TICKS_PER_SECOND;
        let millis = ((self.ticks % TICKS_PER_SECOND) * 10 + 1) / 3;
        ((seconds / 3600) as u8, (seconds / 60 % 60) as u8, (seconds % 60) as u8, millis as u16)
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (y, mo, d) = self.date();
        let (h, mi, s, ms) = self.time();
        write!(f, "{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02}.{ms:03}")
    }
}

impl fmt::Debug for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DateTime({self})")
    }
}

// days between 1970-01-01 and a proleptic gregorian date
fn days_from_civil(y: i32, m: u32, d: u32) -> i32 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = (y - era * 400) as u32;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i32 - 719_468
}

fn civil_from_days(z: i32) -> (i32, u32, u32) {
    let z = z + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i32 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// An error when a value does not fit its wire type.
pub enum ConversionError {
    /// Value has more digits than the declared precision allows.
    Precision {
        value: String,
        precision: u8,
        scale: u8,
    },
    /// Arithmetic overflow while rescaling.
    Overflow {
        value: String,
    },
    /// Value is longer than the wire type can carry.
    TooLong {
        type_name: &'static str,
        len: usize,
    },
    /// Invalid numeric text.
    Parse {
        input: String,
    },
    /// Value can not be sent as the declared type.
    Incompatible {
        value: &'static str,
        type_name: &'static str,
    },
}

impl ConversionError {
    fn overflow(value: &Numeric) -> ConversionError {
        Self::Overflow { value: value.to_string() }
    }
}

impl std::error::Error for ConversionError { }

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Precision { value, precision, scale } => {
                write!(f, "value `{value}` does not fit decimal({precision},{scale})")
            },
            Self::Overflow { value } => write!(f, "value `{value}` overflows while rescaling"),
            Self::TooLong { type_name, len } => write!(f, "value of {len} bytes is too long for `{type_name}`"),
            Self::Parse { input } => write!(f, "invalid numeric `{input}`"),
            Self::Incompatible { value, type_name } => {
                write!(f, "{value} value can not be sent as `{type_name}`")
            },
        }
    }
}

impl fmt::Debug for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rescale_rounds_half_away_from_zero() {
        let n: Numeric = "2.345".parse().unwrap();
        assert_eq!(n.rescale(2).unwrap().to_string(), "2.35");
        let n: Numeric = "-2.345".parse().unwrap();
        assert_eq!(n.rescale(2).unwrap().to_string(), "-2.35");
        let n: Numeric = "2.344".parse().unwrap();
        assert_eq!(n.rescale(2).unwrap().to_string(), "2.34");
        let n: Numeric = "0.5".parse().unwrap();
        assert_eq!(n.rescale(0).unwrap().to_string(), "1");
    }

    #[test]
    fn precision_overflow() {
        let n: Numeric = "12345.6".parse().unwrap();
        assert!(n.fit(5, 2).is_err());
        assert_eq!(n.fit(7, 2).unwrap().to_string(), "12345.60");
    }

    #[test]
    fn display_small_fraction() {
        assert_eq!(Numeric::new(5, 3).to_string(), "0.005");
        assert_eq!(Numeric::new(-5, 3).to_string(), "-0.005");
        assert_eq!(Numeric::new(12345, 0).to_string(), "12345");
    }

    #[test]
    fn reject_bad_numeric() {
        assert!("".parse::<Numeric>().is_err());
        assert!("1.2.3".parse::<Numeric>().is_err());
        assert!("abc".parse::<Numeric>().is_err());
    }

    #[test]
    fn datetime_calendar() {
        let epoch = DateTime::new(0, 0);
        assert_eq!(epoch.to_string(), "1900-01-01 00:00:00.000");

        let dt = DateTime::from_parts(2024, 2, 29, 13, 45, 30, 500);
        assert_eq!(dt.date(), (2024, 2, 29));
        assert_eq!(dt.time(), (13, 45, 30, 500));
        assert_eq!(dt.to_string(), "2024-02-29 13:45:30.500");

        let before = DateTime::new(-1, 0);
        assert_eq!(before.date(), (1899, 12, 31));
    }
}
