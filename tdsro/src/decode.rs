//! Token decoding.
//!
//! [`TokenReader`] turns the payload of a response message into [`Token`]s.
//! It keeps the column formats of the current result so rows and returned
//! parameters can be decoded, and the position of large object columns left
//! unread in the last row.
use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;

use crate::{
    Result,
    common::verbose,
    codec::ResponseStream,
    error::UsageError,
    message::ServerMessage,
    row::{ColumnDescriptor, NULLABLE, Row},
    tds::{
        Charset, Dialect, Kind, Length, NumericLayout, ProtocolError, TdsVersion, decode_ucs2,
        token::{self as tag, DoneStatus, token_name},
    },
    token::{Done, DoneKind, EnvChange, LoginAck, ReturnValue, Token},
    transport::PacketSource,
    value::{ColumnValue, DateTime, Numeric, Value},
};

/// Largest single value accepted from the server.
const MAX_VALUE_LEN: usize = i32::MAX as usize;

/// Sybase format status bit, column accepts NULL.
const SYBASE_NULLABLE: u8 = 0x20;

/// COLINFO status bit, real column name follows.
const COLINFO_DIFFERENT_NAME: u8 = 0x20;

/// Length of a text pointer timestamp.
const TEXT_TIMESTAMP_LEN: usize = 8;

/// PLP total length of a NULL value.
const PLP_NULL: u64 = u64::MAX;

/// Stateful decoder of response tokens.
#[derive(Debug)]
pub struct TokenReader {
    dialect: Dialect,
    columns: Arc<[ColumnDescriptor]>,
    param_format: Arc<[ColumnDescriptor]>,
    tables: Vec<String>,
    lazy_lobs: bool,
    /// First unread column of the last row.
    pending: Option<usize>,
}

impl TokenReader {
    pub fn new(dialect: Dialect, lazy_lobs: bool) -> TokenReader {
        TokenReader {
            dialect,
            columns: Arc::from([]),
            param_format: Arc::from([]),
            tables: Vec::new(),
            lazy_lobs,
            pending: None,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn set_dialect(&mut self, dialect: Dialect) {
        self.dialect = dialect;
    }

    /// Columns of the current result.
    pub fn columns(&self) -> &Arc<[ColumnDescriptor]> {
        &self.columns
    }

    /// Read the next token.
    ///
    /// Large object columns left unread in the previous row are skipped first.
    pub async fn next_token<S: PacketSource>(&mut self, r: &mut ResponseStream<S>) -> Result<Token> {
        self.skip_pending(r).await?;

        loop {
            let tag = r.read_u8().await?;
            verbose!(token = token_name(tag), "token");

            let token = match tag {
                tag::COLMETADATA => Token::ColumnMetadata(self.read_colmetadata(r).await?),
                tag::ROWFMT => Token::ColumnMetadata(self.read_rowfmt(r).await?),
                tag::ROW => Token::Row(self.read_row(r).await?),
                tag::DONE | tag::DONEPROC | tag::DONEINPROC => Token::Done(self.read_done(r, tag).await?),
                tag::ENVCHANGE => Token::EnvChange(self.read_envchange(r).await?),
                tag::ERROR | tag::INFO => Token::Message(self.read_message(r, tag).await?),
                tag::EED => Token::Message(self.read_eed(r).await?),
                tag::RETURN_STATUS => Token::ReturnStatus(r.read_i32().await?),
                tag::RETURN_VALUE => Token::ReturnValues(vec![self.read_return_value(r).await?]),
                tag::PARAMS => Token::ReturnValues(self.read_params(r).await?),
                tag::LOGINACK => Token::LoginAck(self.read_login_ack(r).await?),
                tag::ORDER => Token::Order(self.read_order(r).await?),
                tag::TABNAME => Token::TableName(self.read_tabname(r).await?),
                tag::COLINFO => Token::ColumnInfo(self.read_colinfo(r).await?),
                tag::CAPABILITY => Token::Capability(read_body(r).await?),
                tag::PARAMFMT => {
                    self.param_format = self.read_paramfmt(r).await?;
                    continue;
                },
                tag::SSPI | tag::CONTROL => {
                    read_body(r).await?;
                    continue;
                },
                _ => return Err(ProtocolError::unknown_token(tag).into()),
            };
            return Ok(token);
        }
    }

    // ===== Formats =====

    async fn read_colmetadata<S: PacketSource>(&mut self, r: &mut ResponseStream<S>) -> Result<Arc<[ColumnDescriptor]>> {
        let count = r.read_u16().await?;
        let mut columns = Vec::with_capacity(if count == 0xFFFF { 0 } else { count as usize });

        if count != 0xFFFF {
            for _ in 0..count {
                let usertype = match self.dialect.usertype_len() {
                    4 => r.read_u32().await?,
                    _ => r.read_u16().await?.into(),
                };
                let flags = r.read_u16().await?;
                let mut column = self.read_type_info(r, true).await?;
                column.usertype = usertype;
                column.flags = flags;
                column.name = r.read_b_string(true).await?;
                columns.push(column);
            }
        }

        self.set_columns(columns.into());
        Ok(self.columns.clone())
    }

    async fn read_rowfmt<S: PacketSource>(&mut self, r: &mut ResponseStream<S>) -> Result<Arc<[ColumnDescriptor]>> {
        let columns = self.read_sybase_format(r).await?;
        self.set_columns(columns.into());
        Ok(self.columns.clone())
    }

    async fn read_paramfmt<S: PacketSource>(&mut self, r: &mut ResponseStream<S>) -> Result<Arc<[ColumnDescriptor]>> {
        Ok(self.read_sybase_format(r).await?.into())
    }

    /// ROWFMT and PARAMFMT share one layout.
    async fn read_sybase_format<S: PacketSource>(&mut self, r: &mut ResponseStream<S>) -> Result<Vec<ColumnDescriptor>> {
        let _len = r.read_u16().await?;
        let count = r.read_u16().await?;
        let mut columns = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let name = r.read_b_string(false).await?;
            let status = r.read_u8().await?;
            let usertype = r.read_u32().await?;
            let mut column = self.read_type_info(r, true).await?;
            let locale = r.read_u8().await?;
            r.skip(locale as usize).await?;

            column.name = name;
            column.usertype = usertype;
            // raw status kept in the high byte
            column.flags = if status & SYBASE_NULLABLE != 0 { NULLABLE } else { 0 };
            column.flags |= (status as u16) << 8;
            columns.push(column);
        }

        Ok(columns)
    }

    /// `TYPE_INFO` of a column or returned value.
    ///
    /// `table`: text types carry the name of their table.
    async fn read_type_info<S: PacketSource>(&self, r: &mut ResponseStream<S>, table: bool) -> Result<ColumnDescriptor> {
        let type_tag = r.read_u8().await?;
        let info = self.dialect.lookup(type_tag)?;
        let mut column = ColumnDescriptor::new(info, r.charset());

        column.max_len = match info.length {
            Length::Fixed(n) => n.into(),
            Length::Byte => r.read_u8().await?.into(),
            Length::Short => {
                let n = r.read_u16().await?;
                column.plp = n == 0xFFFF && self.dialect.version >= TdsVersion::V72;
                n.into()
            },
            Length::Long | Length::Text => r.read_u32().await?,
        };

        if info.has_precision() {
            column.precision = r.read_u8().await?;
            column.scale = r.read_u8().await?;
        }

        if self.dialect.has_collation(info) {
            let collation = r.read_array::<5>().await?;
            column.charset = Charset::from_collation(&collation);
            column.collation = Some(collation);
        }

        if table && info.length == Length::Text {
            column.table = Some(match self.dialect.version {
                TdsVersion::V50 => {
                    let len = r.read_u16().await?;
                    r.read_string(len as usize, false).await?
                },
                TdsVersion::V72 => {
                    let parts = r.read_u8().await?;
                    let mut name = String::new();
                    for i in 0..parts {
                        if i > 0 {
                            name.push('.');
                        }
                        name.push_str(&r.read_us_string(true).await?);
                    }
                    name
                },
                _ => r.read_us_string(true).await?,
            });
        }

        Ok(column)
    }

    fn set_columns(&mut self, columns: Arc<[ColumnDescriptor]>) {
        self.columns = columns;
        self.tables.clear();
        self.pending = None;
    }

    // ===== Values =====

    async fn read_row<S: PacketSource>(&mut self, r: &mut ResponseStream<S>) -> Result<Row> {
        let columns = self.columns.clone();
        let mut values = Vec::with_capacity(columns.len());

        for (i, column) in columns.iter().enumerate() {
            if self.pending.is_some() || (self.lazy_lobs && column.kind().is_lob()) {
                self.pending.get_or_insert(i);
                values.push(ColumnValue::Unread);
                continue;
            }
            values.push(self.read_value(r, column).await?);
        }

        Ok(Row::new(columns, values))
    }

    /// Read the large object columns left unread in `row`.
    ///
    /// `row` must be the last row read from this stream.
    pub async fn read_remaining<S: PacketSource>(&mut self, r: &mut ResponseStream<S>, row: &mut Row) -> Result<()> {
        let Some(start) = self.pending else {
            return match row.has_unread() {
                true => Err(UsageError::new("row values are no longer available").into()),
                false => Ok(()),
            };
        };
        if !Arc::ptr_eq(row.columns(), &self.columns) || row.values().get(start) != Some(&ColumnValue::Unread) {
            return Err(UsageError::new("row is not the last row read").into());
        }

        self.pending = None;
        let columns = self.columns.clone();
        for (i, column) in columns.iter().enumerate().skip(start) {
            row.values_mut()[i] = self.read_value(r, column).await?;
        }
        Ok(())
    }

    async fn skip_pending<S: PacketSource>(&mut self, r: &mut ResponseStream<S>) -> Result<()> {
        let Some(start) = self.pending.take() else {
            return Ok(());
        };
        let columns = self.columns.clone();
        for column in &columns[start..] {
            skip_value(r, column).await?;
        }
        Ok(())
    }

    async fn read_value<S: PacketSource>(&self, r: &mut ResponseStream<S>, column: &ColumnDescriptor) -> Result<ColumnValue> {
        match read_value_bytes(r, column).await? {
            Some(bytes) => Ok(ColumnValue::Value(decode_value(&self.dialect, column, &bytes)?)),
            None => Ok(ColumnValue::Null),
        }
    }

    async fn read_return_value<S: PacketSource>(&mut self, r: &mut ResponseStream<S>) -> Result<ReturnValue> {
        let ordinal = r.read_u16().await?;
        let name = r.read_b_string(true).await?;
        let status = r.read_u8().await?;
        let usertype = match self.dialect.usertype_len() {
            4 => r.read_u32().await?,
            _ => r.read_u16().await?.into(),
        };
        let flags = r.read_u16().await?;
        let mut descriptor = self.read_type_info(r, false).await?;
        descriptor.usertype = usertype;
        descriptor.flags = flags;
        descriptor.name = name.clone();
        let value = self.read_value(r, &descriptor).await?;
        Ok(ReturnValue { ordinal, name, status, descriptor, value })
    }

    async fn read_params<S: PacketSource>(&mut self, r: &mut ResponseStream<S>) -> Result<Vec<ReturnValue>> {
        let format = self.param_format.clone();
        let mut values = Vec::with_capacity(format.len());
        for (i, descriptor) in format.iter().enumerate() {
            let value = self.read_value(r, descriptor).await?;
            values.push(ReturnValue {
                ordinal: (i + 1) as u16,
                name: descriptor.name.clone(),
                status: (descriptor.flags >> 8) as u8,
                descriptor: descriptor.clone(),
                value,
            });
        }
        Ok(values)
    }

    // ===== Status =====

    async fn read_done<S: PacketSource>(&self, r: &mut ResponseStream<S>, tag: u8) -> Result<Done> {
        let status = DoneStatus(r.read_u16().await?);
        let command = r.read_u16().await?;
        let count = match self.dialect.wide_row_count() {
            true => r.read_u64().await?,
            false => r.read_u32().await?.into(),
        };
        let kind = match tag {
            tag::DONEPROC => DoneKind::Proc,
            tag::DONEINPROC => DoneKind::InProc,
            _ => DoneKind::Done,
        };
        Ok(Done { kind, status, command, count })
    }

    async fn read_envchange<S: PacketSource>(&self, r: &mut ResponseStream<S>) -> Result<EnvChange> {
        let mut body = Body::new(tag::ENVCHANGE, read_body(r).await?, r.charset(), self.dialect.is_wide());
        let ty = body.u8()?;
        let change = match ty {
            tag::env::DATABASE => {
                let new = body.b_string()?;
                let old = body.b_string()?;
                EnvChange::Database { old, new }
            },
            tag::env::LANGUAGE => EnvChange::Language(body.b_string()?),
            tag::env::CHARSET => EnvChange::Charset(body.b_string()?),
            tag::env::PACKET_SIZE => {
                let size = body.b_string()?;
                let size = size.trim().parse().map_err(|_| body.malformed("invalid packet size"))?;
                EnvChange::PacketSize(size)
            },
            tag::env::SORT_ID if self.dialect.is_wide() => EnvChange::Locale(body.b_string()?),
            tag::env::SORT_FLAGS if self.dialect.is_wide() => EnvChange::ComparisonFlags(body.b_string()?),
            tag::env::COLLATION => EnvChange::Collation(body.b_bytes()?),
            tag::env::BEGIN_TRANSACTION => EnvChange::BeginTransaction(body.b_bytes()?),
            tag::env::COMMIT_TRANSACTION => EnvChange::CommitTransaction,
            tag::env::ROLLBACK_TRANSACTION => EnvChange::RollbackTransaction,
            other => EnvChange::Other(other),
        };
        Ok(change)
    }

    async fn read_message<S: PacketSource>(&self, r: &mut ResponseStream<S>, tag: u8) -> Result<ServerMessage> {
        let mut body = Body::new(tag, read_body(r).await?, r.charset(), self.dialect.is_wide());
        let number = body.i32()?;
        let state = body.u8()?;
        let severity = body.u8()?;
        let text = body.us_string()?;
        let server = body.b_string()?;
        let procedure = body.b_string()?;
        let line = match self.dialect.version {
            TdsVersion::V72 => body.i32()?,
            _ => body.u16()?.into(),
        };
        Ok(ServerMessage { number, state, severity, text, server, procedure, line, sql_state: None })
    }

    async fn read_eed<S: PacketSource>(&self, r: &mut ResponseStream<S>) -> Result<ServerMessage> {
        let mut body = Body::new(tag::EED, read_body(r).await?, r.charset(), false);
        let number = body.i32()?;
        let state = body.u8()?;
        let severity = body.u8()?;
        let sql_state = body.b_string()?;
        let _status = body.u8()?;
        let _transtate = body.u16()?;
        let text = body.us_string()?;
        let server = body.b_string()?;
        let procedure = body.b_string()?;
        let line = body.u16()?.into();
        let sql_state = (!sql_state.is_empty()).then_some(sql_state);
        Ok(ServerMessage { number, state, severity, text, server, procedure, line, sql_state })
    }

    async fn read_login_ack<S: PacketSource>(&self, r: &mut ResponseStream<S>) -> Result<LoginAck> {
        let mut body = Body::new(tag::LOGINACK, read_body(r).await?, r.charset(), self.dialect.is_wide());
        let interface = body.u8()?;
        let version = u32::from_be_bytes(body.array()?);
        let program = body.b_string()?;
        let program_version = body.array()?;
        Ok(LoginAck { interface, version, program, program_version })
    }

    // ===== Browse mode =====

    async fn read_order<S: PacketSource>(&self, r: &mut ResponseStream<S>) -> Result<Vec<u16>> {
        let mut body = Body::new(tag::ORDER, read_body(r).await?, r.charset(), self.dialect.is_wide());
        let mut columns = Vec::new();
        while body.has_remaining() {
            columns.push(match self.dialect.is_wide() {
                true => body.u16()?,
                false => body.u8()?.into(),
            });
        }
        Ok(columns)
    }

    async fn read_tabname<S: PacketSource>(&mut self, r: &mut ResponseStream<S>) -> Result<Vec<String>> {
        let mut body = Body::new(tag::TABNAME, read_body(r).await?, r.charset(), self.dialect.is_wide());
        let mut tables = Vec::new();
        while body.has_remaining() {
            let name = match self.dialect.version {
                TdsVersion::V50 => body.b_string()?,
                TdsVersion::V72 => {
                    let parts = body.u8()?;
                    let mut name = String::new();
                    for i in 0..parts {
                        if i > 0 {
                            name.push('.');
                        }
                        name.push_str(&body.us_string()?);
                    }
                    name
                },
                _ => body.us_string()?,
            };
            tables.push(name);
        }
        self.tables = tables.clone();
        Ok(tables)
    }

    async fn read_colinfo<S: PacketSource>(&mut self, r: &mut ResponseStream<S>) -> Result<Arc<[ColumnDescriptor]>> {
        let mut body = Body::new(tag::COLINFO, read_body(r).await?, r.charset(), self.dialect.is_wide());
        let mut columns = self.columns.to_vec();

        while body.has_remaining() {
            let column = body.u8()? as usize;
            let table = body.u8()? as usize;
            let status = body.u8()?;
            let real_name = match status & COLINFO_DIFFERENT_NAME {
                0 => None,
                _ => Some(body.b_string()?),
            };

            let Some(descriptor) = column.checked_sub(1).and_then(|i| columns.get_mut(i)) else {
                continue;
            };
            if let Some(name) = table.checked_sub(1).and_then(|i| self.tables.get(i)) {
                descriptor.table = Some(name.clone());
            }
            if real_name.is_some() {
                descriptor.real_name = real_name;
            }
        }

        self.columns = columns.into();
        Ok(self.columns.clone())
    }
}

// ===== Value bytes =====

fn check_len(tag: u8, len: usize) -> Result<usize> {
    match len > MAX_VALUE_LEN {
        true => Err(ProtocolError::invalid_length(tag, len).into()),
        false => Ok(len),
    }
}

/// Read the raw bytes of one value, `None` is NULL.
async fn read_value_bytes<S: PacketSource>(r: &mut ResponseStream<S>, column: &ColumnDescriptor) -> Result<Option<Bytes>> {
    let tag = column.info.tag;
    let len = match column.info.length {
        Length::Fixed(0) => return Ok(None),
        Length::Fixed(n) => n as usize,
        Length::Byte => match r.read_u8().await? {
            0 => return Ok(None),
            n => n as usize,
        },
        Length::Short if column.plp => return read_plp(r, tag).await,
        Length::Short => match r.read_u16().await? {
            0xFFFF => return Ok(None),
            n => n as usize,
        },
        Length::Long => match r.read_u32().await? {
            0 => return Ok(None),
            n => check_len(tag, n as usize)?,
        },
        Length::Text => match r.read_u8().await? {
            0 => return Ok(None),
            ptr => {
                r.skip(ptr as usize + TEXT_TIMESTAMP_LEN).await?;
                check_len(tag, r.read_u32().await? as usize)?
            },
        },
    };
    Ok(Some(r.read_exact(len).await?))
}

async fn read_plp<S: PacketSource>(r: &mut ResponseStream<S>, tag: u8) -> Result<Option<Bytes>> {
    let total = r.read_u64().await?;
    if total == PLP_NULL {
        return Ok(None);
    }

    let mut out = BytesMut::new();
    loop {
        let chunk = r.read_u32().await? as usize;
        if chunk == 0 {
            break;
        }
        check_len(tag, out.len() + chunk)?;
        out.extend_from_slice(&r.read_exact(chunk).await?);
    }
    Ok(Some(out.freeze()))
}

async fn skip_value<S: PacketSource>(r: &mut ResponseStream<S>, column: &ColumnDescriptor) -> Result<()> {
    let len = match column.info.length {
        Length::Fixed(n) => n as usize,
        Length::Byte => r.read_u8().await? as usize,
        Length::Short if column.plp => {
            if r.read_u64().await? == PLP_NULL {
                return Ok(());
            }
            loop {
                match r.read_u32().await? {
                    0 => return Ok(()),
                    chunk => r.skip(chunk as usize).await?,
                }
            }
        },
        Length::Short => match r.read_u16().await? {
            0xFFFF => 0,
            n => n as usize,
        },
        Length::Long => r.read_u32().await? as usize,
        Length::Text => match r.read_u8().await? {
            0 => 0,
            ptr => {
                r.skip(ptr as usize + TEXT_TIMESTAMP_LEN).await?;
                r.read_u32().await? as usize
            },
        },
    };
    r.skip(len).await
}

/// Read a token body prefixed by its two byte length.
async fn read_body<S: PacketSource>(r: &mut ResponseStream<S>) -> Result<Bytes> {
    let len = r.read_u16().await?;
    r.read_exact(len as usize).await
}

/// Decode the raw bytes of a non-NULL value.
pub fn decode_value(dialect: &Dialect, column: &ColumnDescriptor, bytes: &[u8]) -> Result<Value, ProtocolError> {
    let tag = column.info.tag;
    let invalid = || ProtocolError::invalid_length(tag, bytes.len());

    let value = match column.info.kind {
        Kind::Null => return Err(invalid()),
        Kind::Bit => match bytes {
            [b] => Value::Bool(*b != 0),
            _ => return Err(invalid()),
        },
        Kind::Int => match bytes.len() {
            1 => Value::TinyInt(bytes[0]),
            2 => Value::SmallInt(i16::from_le_bytes(array(bytes)?)),
            4 => Value::Int(i32::from_le_bytes(array(bytes)?)),
            8 => Value::BigInt(i64::from_le_bytes(array(bytes)?)),
            _ => return Err(invalid()),
        },
        Kind::Float => match bytes.len() {
            4 => Value::Real(f32::from_le_bytes(array(bytes)?)),
            8 => Value::Float(f64::from_le_bytes(array(bytes)?)),
            _ => return Err(invalid()),
        },
        Kind::Money => match bytes.len() {
            4 => Value::Money(Numeric::new(i32::from_le_bytes(array(bytes)?).into(), 4)),
            8 => {
                let hi = i32::from_le_bytes(array(&bytes[..4])?) as i64;
                let lo = u32::from_le_bytes(array(&bytes[4..])?) as i64;
                Value::Money(Numeric::new(((hi << 32) | lo).into(), 4))
            },
            _ => return Err(invalid()),
        },
        Kind::DateTime => match bytes.len() {
            4 => {
                let days = u16::from_le_bytes(array(&bytes[..2])?);
                let minutes = u16::from_le_bytes(array(&bytes[2..])?);
                Value::DateTime(DateTime::new(days.into(), minutes as u32 * 60 * crate::value::TICKS_PER_SECOND))
            },
            8 => {
                let days = i32::from_le_bytes(array(&bytes[..4])?);
                let ticks = u32::from_le_bytes(array(&bytes[4..])?);
                Value::DateTime(DateTime::new(days, ticks))
            },
            _ => return Err(invalid()),
        },
        Kind::Date => Value::Date(i32::from_le_bytes(array(bytes)?)),
        Kind::Time => Value::Time(u32::from_le_bytes(array(bytes)?)),
        Kind::Decimal => Value::Numeric(numeric_from_wire(tag, bytes, column.scale, dialect.numeric())?),
        Kind::Char | Kind::Text => Value::String(column.charset.decode(bytes)),
        Kind::NChar | Kind::NText => Value::String(decode_ucs2(bytes)),
        Kind::Binary | Kind::Image => Value::Binary(Bytes::copy_from_slice(bytes)),
        Kind::Guid => Value::Guid(array(bytes)?),
    };
    Ok(value)
}

fn array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], ProtocolError> {
    bytes.try_into().map_err(|_| ProtocolError::malformed(tag::ROW, "value length does not match its type"))
}

/// Sign byte then magnitude, in the byte order of `layout`.
pub fn numeric_from_wire(tag: u8, bytes: &[u8], scale: u8, layout: NumericLayout) -> Result<Numeric, ProtocolError> {
    let invalid = || ProtocolError::invalid_length(tag, bytes.len());
    let Some((&sign, magnitude)) = bytes.split_first() else {
        return Err(invalid());
    };
    if magnitude.len() > 16 {
        return Err(invalid());
    }

    let mut buf = [0u8; 16];
    let magnitude = match layout {
        NumericLayout::SqlServer => {
            buf[..magnitude.len()].copy_from_slice(magnitude);
            u128::from_le_bytes(buf)
        },
        NumericLayout::Sybase => {
            buf[16 - magnitude.len()..].copy_from_slice(magnitude);
            u128::from_be_bytes(buf)
        },
    };
    let value = i128::try_from(magnitude).map_err(|_| invalid())?;
    let value = if layout.is_positive(sign) { value } else { -value };
    Ok(Numeric::new(value, scale))
}

// ===== Length prefixed bodies =====

/// Bounds checked reader over a token body.
struct Body {
    tag: u8,
    buf: Bytes,
    charset: Charset,
    wide: bool,
}

impl Body {
    fn new(tag: u8, buf: Bytes, charset: Charset, wide: bool) -> Body {
        Body { tag, buf, charset, wide }
    }

    fn malformed(&self, reason: &'static str) -> ProtocolError {
        ProtocolError::malformed(self.tag, reason)
    }

    fn has_remaining(&self) -> bool {
        self.buf.has_remaining()
    }

    fn bytes(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        if self.buf.remaining() < len {
            return Err(self.malformed("token body is truncated"));
        }
        Ok(self.buf.split_to(len))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn string(&mut self, len: usize) -> Result<String, ProtocolError> {
        match self.wide {
            true => Ok(decode_ucs2(&self.bytes(len * 2)?)),
            false => {
                let bytes = self.bytes(len)?;
                Ok(self.charset.decode(&bytes))
            },
        }
    }

    fn b_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u8()? as usize;
        self.string(len)
    }

    fn us_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u16()? as usize;
        self.string(len)
    }

    fn b_bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.u8()? as usize;
        self.bytes(len)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::VecDeque;

    use bytes::BufMut;
    use proptest::prelude::*;

    use super::*;
    use crate::{
        encode::numeric_to_wire,
        ext::BufMutExt,
        tds::{Packet, PacketType, ServerFlavor},
    };

    pub(crate) fn stream(payload: &[u8]) -> ResponseStream<VecDeque<Packet>> {
        let packet = Packet::new(PacketType::Reply, 1, 1, true, Bytes::copy_from_slice(payload));
        ResponseStream::new(VecDeque::from([packet]), Charset::default())
    }

    fn mssql(version: TdsVersion) -> Dialect {
        Dialect::new(ServerFlavor::SqlServer, version)
    }

    fn sybase() -> Dialect {
        Dialect::new(ServerFlavor::Sybase, TdsVersion::V50)
    }

    /// COLMETADATA of `(id int not null, name nvarchar(10) null)` for 7.1.
    fn colmetadata(buf: &mut BytesMut) {
        buf.put_u8(tag::COLMETADATA);
        buf.put_u16_le(2);
        buf.put_u16_le(0);
        buf.put_u16_le(0);
        buf.put_u8(0x38);
        buf.put_b_ucs2("id");
        buf.put_u16_le(0);
        buf.put_u16_le(NULLABLE);
        buf.put_u8(0xE7);
        buf.put_u16_le(20);
        buf.put_slice(&[0x09, 0x04, 0xD0, 0x00, 0x34]);
        buf.put_b_ucs2("name");
    }

    #[tokio::test]
    async fn rows_and_done() {
        let mut buf = BytesMut::new();
        colmetadata(&mut buf);
        buf.put_u8(tag::ROW);
        buf.put_i32_le(7);
        buf.put_u16_le(4);
        buf.put_ucs2("hi");
        buf.put_u8(tag::ROW);
        buf.put_i32_le(8);
        buf.put_u16_le(0xFFFF);
        buf.put_u8(tag::DONE);
        buf.put_u16_le(DoneStatus::COUNT);
        buf.put_u16_le(0xC1);
        buf.put_u32_le(2);

        let mut r = stream(&buf);
        let mut reader = TokenReader::new(mssql(TdsVersion::V71), false);

        let Token::ColumnMetadata(columns) = reader.next_token(&mut r).await.unwrap() else { panic!() };
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[1].label(), "name");
        assert!(columns[1].is_nullable());
        assert_eq!(columns[1].collation(), Some(&[0x09, 0x04, 0xD0, 0x00, 0x34]));

        let Token::Row(row) = reader.next_token(&mut r).await.unwrap() else { panic!() };
        assert_eq!(row.try_get::<_, i32>("id").unwrap(), 7);
        assert_eq!(row.try_get::<_, String>("name").unwrap(), "hi");

        let Token::Row(row) = reader.next_token(&mut r).await.unwrap() else { panic!() };
        assert!(row.values()[1].is_null());

        let Token::Done(done) = reader.next_token(&mut r).await.unwrap() else { panic!() };
        assert_eq!(done.rows_affected(), Some(2));
        assert!(done.is_final());
    }

    #[tokio::test]
    async fn empty_string_is_not_null() {
        let mut buf = BytesMut::new();
        colmetadata(&mut buf);
        buf.put_u8(tag::ROW);
        buf.put_i32_le(1);
        buf.put_u16_le(0);

        let mut r = stream(&buf);
        let mut reader = TokenReader::new(mssql(TdsVersion::V71), false);
        reader.next_token(&mut r).await.unwrap();
        let Token::Row(row) = reader.next_token(&mut r).await.unwrap() else { panic!() };
        assert_eq!(row.values()[1], ColumnValue::Value(Value::String(String::new())));
    }

    fn text_column(buf: &mut BytesMut) {
        buf.put_u8(tag::COLMETADATA);
        buf.put_u16_le(2);
        buf.put_u16_le(0);
        buf.put_u16_le(NULLABLE);
        buf.put_u8(0x23);
        buf.put_u32_le(0x7FFF_FFFF);
        buf.put_slice(&[0x09, 0x04, 0xD0, 0x00, 0x34]);
        buf.put_us_ucs2("notes");
        buf.put_b_ucs2("body");
        buf.put_u16_le(0);
        buf.put_u16_le(0);
        buf.put_u8(0x38);
        buf.put_b_ucs2("n");
    }

    fn text_row(buf: &mut BytesMut, text: &[u8], n: i32) {
        buf.put_u8(tag::ROW);
        buf.put_u8(16);
        buf.put_slice(&[0xAA; 16]);
        buf.put_slice(&[0xBB; 8]);
        buf.put_u32_le(text.len() as u32);
        buf.put_slice(text);
        buf.put_i32_le(n);
    }

    #[tokio::test]
    async fn lazy_lob_read_remaining() {
        let mut buf = BytesMut::new();
        text_column(&mut buf);
        text_row(&mut buf, b"long text", 5);

        let mut r = stream(&buf);
        let mut reader = TokenReader::new(mssql(TdsVersion::V71), true);
        let Token::ColumnMetadata(columns) = reader.next_token(&mut r).await.unwrap() else { panic!() };
        assert_eq!(columns[0].table(), Some("notes"));

        let Token::Row(mut row) = reader.next_token(&mut r).await.unwrap() else { panic!() };
        assert_eq!(row.values(), &[ColumnValue::Unread, ColumnValue::Unread]);

        reader.read_remaining(&mut r, &mut row).await.unwrap();
        assert_eq!(row.try_get::<_, String>(0).unwrap(), "long text");
        assert_eq!(row.try_get::<_, i32>(1).unwrap(), 5);
    }

    #[tokio::test]
    async fn lazy_lob_is_skipped() {
        let mut buf = BytesMut::new();
        text_column(&mut buf);
        text_row(&mut buf, b"first", 1);
        text_row(&mut buf, b"second", 2);

        let mut r = stream(&buf);
        let mut reader = TokenReader::new(mssql(TdsVersion::V71), true);
        reader.next_token(&mut r).await.unwrap();
        let Token::Row(first) = reader.next_token(&mut r).await.unwrap() else { panic!() };
        let Token::Row(mut second) = reader.next_token(&mut r).await.unwrap() else { panic!() };
        assert!(first.has_unread());

        reader.read_remaining(&mut r, &mut second).await.unwrap();
        assert_eq!(second.try_get::<_, String>(0).unwrap(), "second");
        assert!(r.at_end().await.unwrap());
    }

    #[tokio::test]
    async fn plp_chunks() {
        let mut buf = BytesMut::new();
        buf.put_u8(tag::COLMETADATA);
        buf.put_u16_le(1);
        buf.put_u32_le(0);
        buf.put_u16_le(NULLABLE);
        buf.put_u8(0xA5);
        buf.put_u16_le(0xFFFF);
        buf.put_b_ucs2("blob");
        buf.put_u8(tag::ROW);
        buf.put_u64_le(5);
        buf.put_u32_le(2);
        buf.put_slice(&[1, 2]);
        buf.put_u32_le(3);
        buf.put_slice(&[3, 4, 5]);
        buf.put_u32_le(0);
        buf.put_u8(tag::ROW);
        buf.put_u64_le(u64::MAX);

        let mut r = stream(&buf);
        let mut reader = TokenReader::new(mssql(TdsVersion::V72), false);
        reader.next_token(&mut r).await.unwrap();
        let Token::Row(row) = reader.next_token(&mut r).await.unwrap() else { panic!() };
        assert_eq!(row.try_get::<_, Vec<u8>>(0).unwrap(), vec![1, 2, 3, 4, 5]);
        let Token::Row(row) = reader.next_token(&mut r).await.unwrap() else { panic!() };
        assert!(row.values()[0].is_null());
    }

    #[tokio::test]
    async fn envchange_and_messages() {
        let mut buf = BytesMut::new();
        let mut env = BytesMut::new();
        env.put_u8(tag::env::DATABASE);
        env.put_b_ucs2("sales");
        env.put_b_ucs2("master");
        buf.put_u8(tag::ENVCHANGE);
        buf.put_u16_le(env.len() as u16);
        buf.put_slice(&env);

        let mut msg = BytesMut::new();
        msg.put_i32_le(208);
        msg.put_u8(1);
        msg.put_u8(16);
        msg.put_us_ucs2("Invalid object name 'foo'.");
        msg.put_b_ucs2("srv");
        msg.put_b_ucs2("");
        msg.put_u16_le(3);
        buf.put_u8(tag::ERROR);
        buf.put_u16_le(msg.len() as u16);
        buf.put_slice(&msg);

        let mut r = stream(&buf);
        let mut reader = TokenReader::new(mssql(TdsVersion::V71), false);

        let token = reader.next_token(&mut r).await.unwrap();
        assert_eq!(token, Token::EnvChange(EnvChange::Database { old: "master".into(), new: "sales".into() }));

        let Token::Message(message) = reader.next_token(&mut r).await.unwrap() else { panic!() };
        assert_eq!(message.number, 208);
        assert!(message.is_error());
        assert_eq!(message.line, 3);
    }

    #[tokio::test]
    async fn truncated_body_is_protocol_error() {
        let mut r = stream(&[tag::ERROR, 2, 0, 1, 2]);
        let mut reader = TokenReader::new(mssql(TdsVersion::V71), false);
        let err = reader.next_token(&mut r).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn unknown_token() {
        let mut r = stream(&[0x42]);
        let mut reader = TokenReader::new(mssql(TdsVersion::V71), false);
        let err = reader.next_token(&mut r).await.unwrap_err();
        assert!(matches!(err.kind(), crate::ErrorKind::Protocol(ProtocolError::UnknownToken { tag: 0x42 })));
    }

    #[tokio::test]
    async fn return_value() {
        let mut buf = BytesMut::new();
        buf.put_u8(tag::RETURN_VALUE);
        buf.put_u16_le(1);
        buf.put_b_ucs2("@out");
        buf.put_u8(1);
        buf.put_u16_le(0);
        buf.put_u16_le(NULLABLE);
        buf.put_u8(0x26);
        buf.put_u8(4);
        buf.put_u8(4);
        buf.put_i32_le(42);

        let mut r = stream(&buf);
        let mut reader = TokenReader::new(mssql(TdsVersion::V71), false);
        let Token::ReturnValues(values) = reader.next_token(&mut r).await.unwrap() else { panic!() };
        assert_eq!(values[0].name, "@out");
        assert_eq!(values[0].value, ColumnValue::Value(Value::Int(42)));
    }

    #[tokio::test]
    async fn sybase_formats_and_params() {
        let mut fmt = BytesMut::new();
        fmt.put_u16_le(1);
        fmt.put_b_bytes(b"@total");
        fmt.put_u8(0x01);
        fmt.put_u32_le(0);
        fmt.put_u8(0x6C);
        fmt.put_u8(6);
        fmt.put_u8(10);
        fmt.put_u8(2);
        fmt.put_u8(0);

        let mut buf = BytesMut::new();
        buf.put_u8(tag::PARAMFMT);
        buf.put_u16_le(fmt.len() as u16);
        buf.put_slice(&fmt);
        buf.put_u8(tag::PARAMS);
        buf.put_u8(6);
        buf.put_slice(&numeric_to_wire(Numeric::new(-12345, 2), 10, 2, NumericLayout::Sybase).unwrap());

        let mut msg = BytesMut::new();
        msg.put_i32_le(2601);
        msg.put_u8(1);
        msg.put_u8(14);
        msg.put_b_bytes(b"23000");
        msg.put_u8(0);
        msg.put_u16_le(0);
        msg.put_u16_le(4);
        msg.put_slice(b"dup!");
        msg.put_b_bytes(b"ase");
        msg.put_b_bytes(b"");
        msg.put_u16_le(1);
        buf.put_u8(tag::EED);
        buf.put_u16_le(msg.len() as u16);
        buf.put_slice(&msg);

        let mut r = stream(&buf);
        let mut reader = TokenReader::new(sybase(), false);

        let Token::ReturnValues(values) = reader.next_token(&mut r).await.unwrap() else { panic!() };
        assert_eq!(values[0].name, "@total");
        assert_eq!(values[0].value, ColumnValue::Value(Value::Numeric(Numeric::new(-12345, 2))));

        let Token::Message(message) = reader.next_token(&mut r).await.unwrap() else { panic!() };
        assert_eq!(message.sql_state.as_deref(), Some("23000"));
        assert_eq!(message.text, "dup!");
        assert!(message.is_error());
    }

    #[test]
    fn fixed_values() {
        let dialect = mssql(TdsVersion::V71);
        let column = |t| ColumnDescriptor::new(dialect.lookup(t).unwrap(), Charset::default());

        let money = decode_value(&dialect, &column(0x3C), &[0, 0, 0, 0, 0x10, 0x27, 0, 0]).unwrap();
        assert_eq!(money, Value::Money(Numeric::new(10_000, 4)));

        let small = decode_value(&dialect, &column(0x3A), &[1, 0, 60, 0]).unwrap();
        assert_eq!(small.clone(), Value::DateTime(DateTime::new(1, 3600 * 300)));

        let guid = decode_value(&dialect, &column(0x24), &[7; 16]).unwrap();
        assert_eq!(guid, Value::Guid([7; 16]));

        assert!(decode_value(&dialect, &column(0x26), &[1, 2, 3]).is_err());
    }

    proptest! {
        #[test]
        fn numeric_round_trip(
            value in -99_999_999_999_999_999_999_999_999_999_999_999_999i128..=99_999_999_999_999_999_999_999_999_999_999_999_999i128,
            scale in 0u8..=38,
            sybase in any::<bool>(),
        ) {
            let layout = if sybase { NumericLayout::Sybase } else { NumericLayout::SqlServer };
            let n = Numeric::new(value, scale);
            let wire = numeric_to_wire(n, 38, scale, layout).unwrap();
            prop_assert_eq!(wire.len(), layout.byte_len(38));
            prop_assert_eq!(numeric_from_wire(0x6C, &wire, scale, layout).unwrap(), n);
        }

        #[test]
        fn numeric_round_trip_small_precision(value in -99_999i128..=99_999, sybase in any::<bool>()) {
            let layout = if sybase { NumericLayout::Sybase } else { NumericLayout::SqlServer };
            let n = Numeric::new(value, 2);
            let wire = numeric_to_wire(n, 5, 2, layout).unwrap();
            prop_assert_eq!(numeric_from_wire(0x6C, &wire, 2, layout).unwrap(), n);
        }
    }
}
