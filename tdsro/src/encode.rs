//! Parameter encoding.
//!
//! A parameter is written as type tag, type info sized by the length class
//! of the tag, then the value behind a length prefix of the same class, or
//! the class NULL sentinel.
use bytes::{BufMut, BytesMut};

use crate::{
    ext::{BufMutExt, UsizeExt},
    param::Param,
    tds::{Charset, Dialect, Kind, Length, NumericLayout, ServerFlavor, WireType, token},
    value::{ConversionError, DateTime, Numeric, Value},
};

/// Collation sent with character parameters when the server announced none,
/// `SQL_Latin1_General_CP1_CI_AS`.
pub const DEFAULT_COLLATION: [u8; 5] = [0x09, 0x04, 0xD0, 0x00, 0x34];

/// Session values the encoder depends on.
#[derive(Clone, Copy, Debug)]
pub struct EncodeContext {
    pub dialect: Dialect,
    pub charset: Charset,
    pub collation: [u8; 5],
}

impl EncodeContext {
    pub fn new(dialect: Dialect) -> EncodeContext {
        EncodeContext { dialect, charset: Charset::default(), collation: DEFAULT_COLLATION }
    }
}

/// Write one RPC parameter, TDS 7.x.
pub fn rpc_param(buf: &mut BytesMut, ctx: &EncodeContext, param: &Param) -> Result<(), ConversionError> {
    buf.put_b_ucs2(param.name().unwrap_or_default());
    buf.put_u8(if param.is_output() { token::PARAM_BY_REF } else { 0 });

    let ty = ctx.dialect.wire_type(param.sql_type());
    type_info(buf, ctx, &ty);
    value(buf, ctx, &ty, param.input_value())
}

fn type_info(buf: &mut BytesMut, ctx: &EncodeContext, ty: &WireType) {
    buf.put_u8(ty.info.tag);
    match ty.info.length {
        Length::Fixed(_) => {},
        Length::Byte => buf.put_u8(ty.max_len.min(255) as u8),
        Length::Short => buf.put_u16_le(ty.max_len.min(8000) as u16),
        Length::Long | Length::Text => buf.put_u32_le(ty.max_len),
    }
    if ty.info.has_precision() {
        buf.put_u8(ty.precision);
        buf.put_u8(ty.scale);
    }
    if ctx.dialect.has_collation(ty.info) {
        buf.put_slice(&ctx.collation);
    }
}

/// Write one PARAMFMT entry, TDS 5.0.
pub fn param_format(buf: &mut BytesMut, ctx: &EncodeContext, param: &Param) {
    let name = ctx.charset.encode(param.name().unwrap_or_default());
    buf.put_b_bytes(&name);
    buf.put_u8(if param.is_output() { token::PARAM_BY_REF } else { 0 });
    buf.put_u32_le(0); // usertype

    let ty = ctx.dialect.wire_type(param.sql_type());
    buf.put_u8(ty.info.tag);
    match ty.info.length {
        Length::Fixed(_) => {},
        Length::Byte => buf.put_u8(ty.max_len.min(255) as u8),
        Length::Short => buf.put_u16_le(ty.max_len.min(u16::MAX as u32) as u16),
        Length::Long => buf.put_u32_le(ty.max_len),
        Length::Text => {
            buf.put_u32_le(ty.max_len);
            buf.put_u16_le(0); // table name
        },
    }
    if ty.info.has_precision() {
        buf.put_u8(ty.precision);
        buf.put_u8(ty.scale);
    }
    buf.put_u8(0); // locale
}

/// Write the value of one PARAMS entry, TDS 5.0.
pub fn param_value(buf: &mut BytesMut, ctx: &EncodeContext, param: &Param) -> Result<(), ConversionError> {
    let ty = ctx.dialect.wire_type(param.sql_type());
    value(buf, ctx, &ty, param.input_value())
}

fn value(buf: &mut BytesMut, ctx: &EncodeContext, ty: &WireType, value: Option<&Value>) -> Result<(), ConversionError> {
    let Some(value) = value else {
        match ty.info.length {
            Length::Fixed(_) => return Err(incompatible("null", ty)),
            Length::Byte => buf.put_u8(0),
            Length::Short => buf.put_u16_le(0xFFFF),
            Length::Long => buf.put_u32_le(0),
            Length::Text => match ctx.dialect.flavor {
                ServerFlavor::SqlServer => buf.put_u32_le(0xFFFF_FFFF),
                ServerFlavor::Sybase => buf.put_u32_le(0),
            },
        }
        return Ok(());
    };

    let mut bytes = value_bytes(ctx, ty, value)?;

    // sybase reads an empty character value as NULL
    if bytes.is_empty() && ctx.dialect.flavor == ServerFlavor::Sybase && ty.info.kind.is_character() {
        bytes.push(b' ');
    }

    let too_long = || ConversionError::TooLong { type_name: ty.info.name, len: bytes.len() };
    match ty.info.length {
        Length::Fixed(_) => {},
        Length::Byte => {
            if bytes.len() > 255 {
                return Err(too_long());
            }
            buf.put_u8(bytes.len() as u8);
        },
        Length::Short => {
            if bytes.len() > ty.max_len.min(8000) as usize {
                return Err(too_long());
            }
            buf.put_u16_le(bytes.len() as u16);
        },
        Length::Long | Length::Text => {
            if bytes.len() > i32::MAX as usize {
                return Err(too_long());
            }
            buf.put_u32_le(bytes.len().to_u32_sat());
        },
    }
    buf.put_slice(&bytes);
    Ok(())
}

fn incompatible(value: &'static str, ty: &WireType) -> ConversionError {
    ConversionError::Incompatible { value, type_name: ty.info.name }
}

fn value_bytes(ctx: &EncodeContext, ty: &WireType, value: &Value) -> Result<Vec<u8>, ConversionError> {
    let mismatch = || incompatible(value.type_name(), ty);

    let bytes = match ty.info.kind {
        Kind::Null => Vec::new(),
        Kind::Bit => vec![integer(value).ok_or_else(mismatch)?.map(|v| v != 0)? as u8],
        Kind::Int => {
            let v = integer(value).ok_or_else(mismatch)??;
            match ty.max_len {
                1 => vec![u8::try_from(v).map_err(|_| overflow(value))?],
                2 => i16::try_from(v).map_err(|_| overflow(value))?.to_le_bytes().to_vec(),
                4 => i32::try_from(v).map_err(|_| overflow(value))?.to_le_bytes().to_vec(),
                _ => v.to_le_bytes().to_vec(),
            }
        },
        Kind::Float => {
            let v = float(value).ok_or_else(mismatch)?;
            match ty.max_len {
                4 => (v as f32).to_le_bytes().to_vec(),
                _ => v.to_le_bytes().to_vec(),
            }
        },
        Kind::Money => {
            let n = numeric(value).ok_or_else(mismatch)?.fit(19, 4)?;
            let v = i64::try_from(n.mantissa()).map_err(|_| overflow(value))?;
            let mut out = Vec::with_capacity(8);
            out.extend_from_slice(&((v >> 32) as i32).to_le_bytes());
            out.extend_from_slice(&(v as u32).to_le_bytes());
            out
        },
        Kind::DateTime => {
            let dt = datetime(value).ok_or_else(mismatch)?;
            let mut out = Vec::with_capacity(8);
            out.extend_from_slice(&dt.days.to_le_bytes());
            out.extend_from_slice(&dt.ticks.to_le_bytes());
            out
        },
        Kind::Date => match value {
            Value::Date(days) => days.to_le_bytes().to_vec(),
            Value::DateTime(dt) => dt.days.to_le_bytes().to_vec(),
            _ => return Err(mismatch()),
        },
        Kind::Time => match value {
            Value::Time(ticks) => ticks.to_le_bytes().to_vec(),
            Value::DateTime(dt) => dt.ticks.to_le_bytes().to_vec(),
            _ => return Err(mismatch()),
        },
        Kind::Decimal => {
            let n = numeric(value).ok_or_else(mismatch)?;
            numeric_to_wire(n, ty.precision, ty.scale, ctx.dialect.numeric())?
        },
        Kind::Char | Kind::Text => match value {
            Value::String(s) => ctx.charset.encode(s),
            _ => return Err(mismatch()),
        },
        Kind::NChar | Kind::NText => match value {
            Value::String(s) => {
                let mut out = BytesMut::with_capacity(s.len() * 2);
                out.put_ucs2(s);
                out.to_vec()
            },
            _ => return Err(mismatch()),
        },
        Kind::Binary | Kind::Image => match value {
            Value::Binary(b) => b.to_vec(),
            Value::Guid(g) => g.to_vec(),
            _ => return Err(mismatch()),
        },
        Kind::Guid => match value {
            Value::Guid(g) => g.to_vec(),
            _ => return Err(mismatch()),
        },
    };
    Ok(bytes)
}

fn overflow(value: &Value) -> ConversionError {
    ConversionError::Overflow { value: format!("{value:?}") }
}

fn integer(value: &Value) -> Option<Result<i64, ConversionError>> {
    let v = match *value {
        Value::Bool(b) => b as i64,
        Value::TinyInt(v) => v.into(),
        Value::SmallInt(v) => v.into(),
        Value::Int(v) => v.into(),
        Value::BigInt(v) => v,
        Value::Numeric(n) if n.scale() == 0 => {
            return Some(i64::try_from(n.mantissa()).map_err(|_| overflow(value)));
        },
        _ => return None,
    };
    Some(Ok(v))
}

fn float(value: &Value) -> Option<f64> {
    match *value {
        Value::Real(v) => Some(v.into()),
        Value::Float(v) => Some(v),
        Value::TinyInt(v) => Some(v.into()),
        Value::SmallInt(v) => Some(v.into()),
        Value::Int(v) => Some(v.into()),
        Value::BigInt(v) => Some(v as f64),
        Value::Numeric(n) | Value::Money(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

fn numeric(value: &Value) -> Option<Numeric> {
    match *value {
        Value::Numeric(n) | Value::Money(n) => Some(n),
        Value::TinyInt(v) => Some(Numeric::new(v.into(), 0)),
        Value::SmallInt(v) => Some(Numeric::new(v.into(), 0)),
        Value::Int(v) => Some(v.into()),
        Value::BigInt(v) => Some(v.into()),
        _ => None,
    }
}

fn datetime(value: &Value) -> Option<DateTime> {
    match *value {
        Value::DateTime(dt) => Some(dt),
        Value::Date(days) => Some(DateTime::new(days, 0)),
        Value::Time(ticks) => Some(DateTime::new(0, ticks)),
        _ => None,
    }
}

/// Sign byte then magnitude, rounded to `scale` and checked against `precision`.
pub fn numeric_to_wire(n: Numeric, precision: u8, scale: u8, layout: NumericLayout) -> Result<Vec<u8>, ConversionError> {
    let n = n.fit(precision, scale)?;
    let len = layout.byte_len(precision) - 1;
    let magnitude = n.mantissa().unsigned_abs();

    let mut out = Vec::with_capacity(len + 1);
    out.push(layout.sign_byte(n.mantissa() < 0));
    match layout {
        NumericLayout::SqlServer => out.extend_from_slice(&magnitude.to_le_bytes()[..len]),
        NumericLayout::Sybase => out.extend_from_slice(&magnitude.to_be_bytes()[16 - len..]),
    }
    Ok(out)
}

/// Write a DBRPC token naming the procedure, TDS 5.0.
pub fn dbrpc(buf: &mut BytesMut, ctx: &EncodeContext, name: &str, has_params: bool) {
    let name = ctx.charset.encode(name);
    let name = &name[..name.len().min(255)];
    buf.put_u8(token::DBRPC);
    buf.put_u16_le((1 + name.len() + 2) as u16);
    buf.put_b_bytes(name);
    buf.put_u16_le(if has_params { 0x0002 } else { 0 });
}

/// Write a LANGUAGE token carrying SQL text, TDS 5.0.
pub fn language(buf: &mut BytesMut, ctx: &EncodeContext, sql: &str) {
    let text = ctx.charset.encode(sql);
    buf.put_u8(token::LANGUAGE);
    buf.put_u32_le(text.len().to_u32_sat().saturating_add(1));
    buf.put_u8(0); // no parameters follow
    buf.put_slice(&text);
}

/// Write PARAMFMT and PARAMS tokens for `params`, TDS 5.0.
pub fn sybase_params(buf: &mut BytesMut, ctx: &EncodeContext, params: &[Param]) -> Result<(), ConversionError> {
    if params.is_empty() {
        return Ok(());
    }

    let mut format = BytesMut::new();
    format.put_u16_le(params.len() as u16);
    for param in params {
        param_format(&mut format, ctx, param);
    }
    buf.put_u8(token::PARAMFMT);
    buf.put_u16_le(format.len().to_u16_sat());
    buf.put_slice(&format);

    buf.put_u8(token::PARAMS);
    for param in params {
        param_value(buf, ctx, param)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{param::SqlType, tds::TdsVersion};

    fn ctx(flavor: ServerFlavor, version: TdsVersion) -> EncodeContext {
        EncodeContext::new(Dialect::new(flavor, version))
    }

    #[test]
    fn int_param_layout() {
        let ctx = ctx(ServerFlavor::SqlServer, TdsVersion::V71);
        let mut buf = BytesMut::new();
        rpc_param(&mut buf, &ctx, &Param::input(42i32).named("a")).unwrap();
        assert_eq!(&buf[..], &[2, b'@', 0, b'a', 0, 0x00, 0x26, 4, 4, 42, 0, 0, 0]);
    }

    #[test]
    fn null_sentinels() {
        let ctx = ctx(ServerFlavor::SqlServer, TdsVersion::V71);

        let mut buf = BytesMut::new();
        rpc_param(&mut buf, &ctx, &Param::null(SqlType::Int)).unwrap();
        assert_eq!(&buf[..], &[0, 0x00, 0x26, 4, 0]);

        let mut buf = BytesMut::new();
        rpc_param(&mut buf, &ctx, &Param::null(SqlType::NVarChar(10))).unwrap();
        assert_eq!(buf[2], 0xE7);
        assert_eq!(&buf[buf.len() - 2..], &[0xFF, 0xFF]);

        let mut buf = BytesMut::new();
        rpc_param(&mut buf, &ctx, &Param::null(SqlType::NText)).unwrap();
        assert_eq!(&buf[buf.len() - 4..], &[0xFF; 4]);
    }

    #[test]
    fn output_flag() {
        let ctx = ctx(ServerFlavor::SqlServer, TdsVersion::V70);
        let mut buf = BytesMut::new();
        rpc_param(&mut buf, &ctx, &Param::output(SqlType::Int)).unwrap();
        assert_eq!(buf[1], token::PARAM_BY_REF);
    }

    #[test]
    fn collation_on_71_only() {
        let mut buf = BytesMut::new();
        rpc_param(&mut buf, &ctx(ServerFlavor::SqlServer, TdsVersion::V70), &Param::input("a")).unwrap();
        // name, status, tag, max len, len, 'a'
        assert_eq!(buf.len(), 1 + 1 + 1 + 2 + 2 + 2);

        let mut buf = BytesMut::new();
        rpc_param(&mut buf, &ctx(ServerFlavor::SqlServer, TdsVersion::V71), &Param::input("a")).unwrap();
        assert_eq!(buf.len(), 1 + 1 + 1 + 2 + 5 + 2 + 2);
        assert_eq!(&buf[5..10], &DEFAULT_COLLATION);
    }

    #[test]
    fn astral_string_goes_ntext() {
        let ctx = ctx(ServerFlavor::SqlServer, TdsVersion::V71);
        let mut buf = BytesMut::new();
        rpc_param(&mut buf, &ctx, &Param::input("\u{1F600}".repeat(3000))).unwrap();
        assert_eq!(buf[2], 0x63);
    }

    #[test]
    fn numeric_layouts() {
        let n = Numeric::new(-12345, 2);
        let mssql = numeric_to_wire(n, 10, 2, NumericLayout::SqlServer).unwrap();
        assert_eq!(mssql, [0, 0x39, 0x30, 0, 0, 0, 0, 0, 0]);

        let sybase = numeric_to_wire(n, 10, 2, NumericLayout::Sybase).unwrap();
        assert_eq!(sybase, [1, 0, 0, 0, 0x30, 0x39]);
    }

    #[test]
    fn numeric_precision_overflow() {
        let err = numeric_to_wire(Numeric::new(123456, 0), 5, 0, NumericLayout::SqlServer);
        assert!(matches!(err, Err(ConversionError::Precision { .. })));
    }

    #[test]
    fn money_words() {
        let ctx = ctx(ServerFlavor::SqlServer, TdsVersion::V71);
        let ty = ctx.dialect.wire_type(SqlType::Money);
        let bytes = value_bytes(&ctx, &ty, &Value::Money(Numeric::new(-1, 4))).unwrap();
        assert_eq!(bytes, [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        let bytes = value_bytes(&ctx, &ty, &Value::Money(Numeric::new(1 << 32, 4))).unwrap();
        assert_eq!(bytes, [1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn sybase_empty_string_is_space() {
        let ctx = ctx(ServerFlavor::Sybase, TdsVersion::V50);
        let mut buf = BytesMut::new();
        param_value(&mut buf, &ctx, &Param::input("").typed(SqlType::VarChar(10))).unwrap();
        assert_eq!(&buf[..], &[1, b' ']);
    }

    #[test]
    fn tinyint_range() {
        let ctx = ctx(ServerFlavor::SqlServer, TdsVersion::V71);
        let mut buf = BytesMut::new();
        let err = rpc_param(&mut buf, &ctx, &Param::input(300i32).typed(SqlType::TinyInt));
        assert!(err.is_err());
    }

    #[test]
    fn language_token() {
        let ctx = ctx(ServerFlavor::Sybase, TdsVersion::V50);
        let mut buf = BytesMut::new();
        language(&mut buf, &ctx, "select 1");
        assert_eq!(&buf[..6], &[0x21, 9, 0, 0, 0, 0]);
        assert_eq!(&buf[6..], b"select 1");
    }
}
