//! Result rows.
//!
//! - [`ColumnDescriptor`]
//! - [`Row`]
//! - [`Column`]
//! - [`FromRow`]
//! - [`Decode`]
//!
//! - [`Index`]
//! - [`DecodeError`]
use bytes::Bytes;
use std::{borrow::Cow, fmt, sync::Arc};

use crate::{
    tds::{Charset, Kind, TypeInfo},
    value::{ColumnValue, DateTime, Numeric, Value},
};

/// Column flag, value may be NULL.
pub(crate) const NULLABLE: u16 = 0x0001;

/// Description of one result column or returned parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnDescriptor {
    pub(crate) info: &'static TypeInfo,
    pub(crate) usertype: u32,
    pub(crate) flags: u16,
    pub(crate) max_len: u32,
    pub(crate) precision: u8,
    pub(crate) scale: u8,
    pub(crate) collation: Option<[u8; 5]>,
    pub(crate) charset: Charset,
    /// Partially length prefixed `(max)` column.
    pub(crate) plp: bool,
    pub(crate) name: String,
    pub(crate) real_name: Option<String>,
    pub(crate) table: Option<String>,
}

impl ColumnDescriptor {
    pub(crate) fn new(info: &'static TypeInfo, charset: Charset) -> ColumnDescriptor {
        ColumnDescriptor {
            info,
            usertype: 0,
            flags: 0,
            max_len: 0,
            precision: 0,
            scale: 0,
            collation: None,
            charset,
            plp: false,
            name: String::new(),
            real_name: None,
            table: None,
        }
    }

    pub fn type_info(&self) -> &'static TypeInfo {
        self.info
    }

    /// Wire type name, e.g. `nvarchar`.
    pub fn type_name(&self) -> &'static str {
        self.info.name
    }

    pub fn kind(&self) -> Kind {
        self.info.kind
    }

    pub fn usertype(&self) -> u32 {
        self.usertype
    }

    pub fn max_length(&self) -> u32 {
        self.max_len
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    pub fn is_nullable(&self) -> bool {
        self.flags & NULLABLE != 0
    }

    pub fn collation(&self) -> Option<&[u8; 5]> {
        self.collation.as_ref()
    }

    /// Charset used to decode single byte character values.
    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// Display name of the column.
    pub fn label(&self) -> &str {
        &self.name
    }

    /// Name of the underlying table column, when the server reported it.
    pub fn name(&self) -> &str {
        self.real_name.as_deref().unwrap_or(&self.name)
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }
}

/// One result row.
///
/// Column descriptors are shared by every row of a result.
#[derive(Clone, PartialEq)]
pub struct Row {
    columns: Arc<[ColumnDescriptor]>,
    values: Vec<ColumnValue>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[ColumnDescriptor]>, values: Vec<ColumnValue>) -> Row {
        Row { columns, values }
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn columns(&self) -> &Arc<[ColumnDescriptor]> {
        &self.columns
    }

    pub fn values(&self) -> &[ColumnValue] {
        &self.values
    }

    pub(crate) fn values_mut(&mut self) -> &mut [ColumnValue] {
        &mut self.values
    }

    /// Returns `true` if any large object column is not read yet.
    pub fn has_unread(&self) -> bool {
        self.values.iter().any(|v| matches!(v, ColumnValue::Unread))
    }

    /// Get column by index or name.
    pub fn column<I: Index>(&self, idx: I) -> Result<Column<'_>, DecodeError> {
        let nth = idx.position(&self.columns)?;
        Ok(Column { descriptor: &self.columns[nth], value: &self.values[nth] })
    }

    /// Try get and decode column.
    pub fn try_get<I: Index, R: Decode>(&self, idx: I) -> Result<R, DecodeError> {
        R::decode(self.column(idx)?)
    }

    /// Try decode type using [`FromRow`] implementation.
    pub fn decode<D: FromRow>(self) -> Result<D, DecodeError> {
        D::from_row(self)
    }

    /// Iterate columns in order.
    pub fn iter(&self) -> impl Iterator<Item = Column<'_>> {
        self.columns.iter().zip(&self.values).map(|(descriptor, value)| Column { descriptor, value })
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for column in self.iter() {
            dbg.key(&column.descriptor.label());
            match column.value {
                ColumnValue::Value(v) => dbg.value(v),
                ColumnValue::Null => dbg.value(&format_args!("NULL")),
                ColumnValue::Unread => dbg.value(&format_args!("<unread>")),
            };
        }
        dbg.finish()
    }
}

/// Borrowed column of a [`Row`].
#[derive(Clone, Copy, Debug)]
pub struct Column<'a> {
    descriptor: &'a ColumnDescriptor,
    value: &'a ColumnValue,
}

impl<'a> Column<'a> {
    pub fn descriptor(&self) -> &'a ColumnDescriptor {
        self.descriptor
    }

    pub fn name(&self) -> &'a str {
        self.descriptor.label()
    }

    pub fn value(&self) -> &'a ColumnValue {
        self.value
    }

    /// Return `true` if value is NULL.
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Value, or [`DecodeError::Null`] and [`DecodeError::Unread`].
    pub fn try_value(&self) -> Result<&'a Value, DecodeError> {
        match self.value {
            ColumnValue::Value(v) => Ok(v),
            ColumnValue::Null => Err(DecodeError::Null),
            ColumnValue::Unread => Err(DecodeError::Unread),
        }
    }

    /// Try decode type using [`Decode`] implementation.
    pub fn decode<D: Decode>(self) -> Result<D, DecodeError> {
        D::decode(self)
    }
}

// ===== Traits =====

/// Type that can be constructed from a row.
pub trait FromRow: Sized {
    /// Construct self from row.
    fn from_row(row: Row) -> Result<Self, DecodeError>;
}

impl FromRow for Row {
    fn from_row(row: Row) -> Result<Self, DecodeError> {
        Ok(row)
    }
}

impl FromRow for () {
    fn from_row(_: Row) -> Result<Self, DecodeError> {
        Ok(())
    }
}

macro_rules! from_row_tuple {
    ($($t:ident $i:literal),*) => {
        impl<$($t),*> FromRow for ($($t),*,)
        where
            $($t: Decode),*
        {
            fn from_row(row: Row) -> Result<Self, DecodeError> {
                Ok((
                    $(row.try_get($i)?),*,
                ))
            }
        }
    };
}

from_row_tuple!(T0 0);
from_row_tuple!(T0 0, T1 1);
from_row_tuple!(T0 0, T1 1, T2 2);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4);

/// A type that can be constructed from [`Column`].
pub trait Decode: Sized {
    /// Try decode self from column.
    fn decode(column: Column<'_>) -> Result<Self, DecodeError>;
}

impl<T: Decode> Decode for Option<T> {
    fn decode(column: Column<'_>) -> Result<Self, DecodeError> {
        match column.is_null() {
            true => Ok(None),
            false => column.decode().map(Some),
        }
    }
}

impl Decode for ColumnValue {
    fn decode(column: Column<'_>) -> Result<Self, DecodeError> {
        Ok(column.value.clone())
    }
}

impl Decode for Value {
    fn decode(column: Column<'_>) -> Result<Self, DecodeError> {
        column.try_value().cloned()
    }
}

fn mismatch(expected: &'static str, found: &Value) -> DecodeError {
    DecodeError::TypeMismatch { expected, found: found.type_name() }
}

macro_rules! decode {
    ($($ty:ty, $name:literal: $($pat:pat => $body:expr),*;)*) => {
        $(
            impl Decode for $ty {
                fn decode(column: Column<'_>) -> Result<Self, DecodeError> {
                    match column.try_value()? {
                        $($pat => Ok($body),)*
                        other => Err(mismatch($name, other)),
                    }
                }
            }
        )*
    };
}

decode! {
    bool, "bool": Value::Bool(v) => *v;
    u8, "tinyint": Value::TinyInt(v) => *v;
    i16, "smallint":
        Value::TinyInt(v) => (*v).into(),
        Value::SmallInt(v) => *v;
    i32, "int":
        Value::TinyInt(v) => (*v).into(),
        Value::SmallInt(v) => (*v).into(),
        Value::Int(v) => *v;
    i64, "bigint":
        Value::TinyInt(v) => (*v).into(),
        Value::SmallInt(v) => (*v).into(),
        Value::Int(v) => (*v).into(),
        Value::BigInt(v) => *v;
    f32, "real": Value::Real(v) => *v;
    f64, "float":
        Value::Real(v) => (*v).into(),
        Value::Float(v) => *v;
    Numeric, "numeric":
        Value::Numeric(v) | Value::Money(v) => *v,
        Value::TinyInt(v) => Numeric::new((*v).into(), 0),
        Value::SmallInt(v) => Numeric::new((*v).into(), 0),
        Value::Int(v) => Numeric::new((*v).into(), 0),
        Value::BigInt(v) => Numeric::new((*v).into(), 0);
    DateTime, "datetime":
        Value::DateTime(v) => *v,
        Value::Date(days) => DateTime::new(*days, 0),
        Value::Time(ticks) => DateTime::new(0, *ticks);
    String, "string": Value::String(v) => v.clone();
    Bytes, "binary": Value::Binary(v) => v.clone();
    Vec<u8>, "binary": Value::Binary(v) => v.to_vec();
    [u8; 16], "guid": Value::Guid(v) => *v;
}

/// Type that can be used for indexing column.
pub trait Index: Sized + sealed::Sealed {
    /// Returns the position of the column.
    fn position(self, columns: &[ColumnDescriptor]) -> Result<usize, DecodeError>;
}

impl Index for usize {
    fn position(self, columns: &[ColumnDescriptor]) -> Result<usize, DecodeError> {
        match self < columns.len() {
            true => Ok(self),
            false => Err(DecodeError::IndexOutOfBounds(self)),
        }
    }
}

/// Column label, ASCII case-insensitive.
impl Index for &str {
    fn position(self, columns: &[ColumnDescriptor]) -> Result<usize, DecodeError> {
        columns
            .iter()
            .position(|c| c.label().eq_ignore_ascii_case(self))
            .ok_or_else(|| DecodeError::ColumnNotFound(String::from(self).into()))
    }
}

mod sealed {
    pub trait Sealed { }
    impl Sealed for usize { }
    impl Sealed for &str { }
}

/// An error when decoding row value.
pub enum DecodeError {
    /// Column requested not found.
    ColumnNotFound(Cow<'static, str>),
    /// Index requested is out of bounds.
    IndexOutOfBounds(usize),
    /// Value has a different type than requested.
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    /// Value is null.
    Null,
    /// Large object value is not read yet.
    Unread,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode value, ")?;
        match self {
            Self::ColumnNotFound(name) => write!(f, "column not found: {name:?}"),
            Self::IndexOutOfBounds(u) => write!(f, "index out of bounds: {u:?}"),
            Self::TypeMismatch { expected, found } => write!(f, "expected {expected}, found {found}"),
            Self::Null => write!(f, "unexpected NULL value"),
            Self::Unread => write!(f, "large object value not read"),
        }
    }
}

impl std::error::Error for DecodeError { }

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tds::types::SQL_SERVER;

    fn row() -> Row {
        let charset = Charset::default();
        let mut id = ColumnDescriptor::new(SQL_SERVER.lookup(0x38).unwrap(), charset);
        id.name = "Id".into();
        let mut name = ColumnDescriptor::new(SQL_SERVER.lookup(0xE7).unwrap(), charset);
        name.name = "name".into();
        name.flags = NULLABLE;
        let mut body = ColumnDescriptor::new(SQL_SERVER.lookup(0x23).unwrap(), charset);
        body.name = "body".into();

        Row::new(
            vec![id, name, body].into(),
            vec![ColumnValue::Value(Value::Int(7)), ColumnValue::Null, ColumnValue::Unread],
        )
    }

    #[test]
    fn get_by_index_and_name() {
        let row = row();
        assert_eq!(row.try_get::<_, i32>(0).unwrap(), 7);
        assert_eq!(row.try_get::<_, i64>("ID").unwrap(), 7);
        assert_eq!(row.try_get::<_, Option<String>>("name").unwrap(), None);
        assert!(row.column("name").unwrap().descriptor().is_nullable());
    }

    #[test]
    fn decode_errors() {
        let row = row();
        assert!(matches!(row.try_get::<_, String>(1), Err(DecodeError::Null)));
        assert!(matches!(row.try_get::<_, String>(2), Err(DecodeError::Unread)));
        assert!(matches!(row.try_get::<_, String>(0), Err(DecodeError::TypeMismatch { .. })));
        assert!(matches!(row.try_get::<_, i32>(9), Err(DecodeError::IndexOutOfBounds(9))));
        assert!(matches!(row.try_get::<_, i32>("nope"), Err(DecodeError::ColumnNotFound(_))));
        assert!(row.has_unread());
    }

    #[test]
    fn tuple_from_row() {
        let (id, name) = row().decode::<(i32, Option<String>)>().unwrap();
        assert_eq!(id, 7);
        assert_eq!(name, None);
    }
}
