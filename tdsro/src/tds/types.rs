//! Wire type tables.
//!
//! The two server families share most of the type grammar but disagree on a
//! handful of tags, length classes and the decimal layout. The differences
//! live here as data, one table per family, and a [`Dialect`] picked once at
//! login selects the table every encoder and decoder consults.
use std::fmt;

use super::ProtocolError;
use crate::param::SqlType;

/// Negotiated protocol version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TdsVersion {
    /// Sybase ASE.
    V50,
    /// SQL Server 7.0.
    V70,
    /// SQL Server 2000.
    V71,
    /// SQL Server 2005.
    V72,
}

impl TdsVersion {
    /// Version written in the LOGIN7 record, little-endian on the wire.
    pub fn login7_version(self) -> u32 {
        match self {
            Self::V50 => 0x0500_0000,
            Self::V70 => 0x7000_0000,
            Self::V71 => 0x7100_0001,
            Self::V72 => 0x7209_0002,
        }
    }

    /// Map the big-endian LOGINACK version.
    pub fn from_login_ack(version: u32) -> Option<TdsVersion> {
        match version {
            0x0500_0000 => Some(Self::V50),
            0x0700_0000 => Some(Self::V70),
            0x0701_0000 | 0x7100_0001 => Some(Self::V71),
            0x7209_0002 => Some(Self::V72),
            _ => None,
        }
    }

    /// Strings and names travel as UCS-2.
    pub fn is_wide(self) -> bool {
        self >= Self::V70
    }

    pub fn parse(s: &str) -> Option<TdsVersion> {
        match s {
            "5.0" => Some(Self::V50),
            "7.0" => Some(Self::V70),
            "7.1" | "8.0" => Some(Self::V71),
            "7.2" | "9.0" => Some(Self::V72),
            _ => None,
        }
    }
}

impl fmt::Display for TdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::V50 => "5.0",
            Self::V70 => "7.0",
            Self::V71 => "7.1",
            Self::V72 => "7.2",
        })
    }
}

/// Server family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerFlavor {
    SqlServer,
    Sybase,
}

impl ServerFlavor {
    pub fn default_port(self) -> u16 {
        match self {
            Self::SqlServer => 1433,
            Self::Sybase => 5000,
        }
    }

    pub fn default_version(self) -> TdsVersion {
        match self {
            Self::SqlServer => TdsVersion::V71,
            Self::Sybase => TdsVersion::V50,
        }
    }

    pub fn parse(s: &str) -> Option<ServerFlavor> {
        match s.to_ascii_lowercase().as_str() {
            "sqlserver" | "mssql" => Some(Self::SqlServer),
            "sybase" | "ase" => Some(Self::Sybase),
            _ => None,
        }
    }
}

/// Value category of a wire type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Null,
    Bit,
    Int,
    Float,
    Money,
    DateTime,
    Date,
    Time,
    Decimal,
    Char,
    NChar,
    Binary,
    Guid,
    Text,
    NText,
    Image,
}

impl Kind {
    /// Large object kinds, read lazily when requested.
    pub fn is_lob(self) -> bool {
        matches!(self, Self::Text | Self::NText | Self::Image)
    }

    pub fn is_character(self) -> bool {
        matches!(self, Self::Char | Self::NChar | Self::Text | Self::NText)
    }
}

/// How the length of a value is encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Length {
    /// No length prefix, value is always present.
    Fixed(u8),
    /// One byte length, `0` is NULL.
    Byte,
    /// Two byte length, `0xFFFF` is NULL, or PLP when the declared size is `0xFFFF`.
    Short,
    /// Four byte length, `0` is NULL.
    Long,
    /// Text pointer prefixed in rows, four byte length in parameters.
    Text,
}

/// Static description of one wire type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypeInfo {
    pub tag: u8,
    pub name: &'static str,
    pub kind: Kind,
    pub length: Length,
}

impl TypeInfo {
    const fn new(tag: u8, name: &'static str, kind: Kind, length: Length) -> TypeInfo {
        TypeInfo { tag, name, kind, length }
    }

    /// Type info carries precision and scale bytes.
    pub fn has_precision(&self) -> bool {
        matches!(self.kind, Kind::Decimal)
    }
}

/// Byte order of the decimal magnitude.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumericLayout {
    /// Sign byte `1` is positive, little-endian magnitude of 4, 8, 12 or 16 bytes.
    SqlServer,
    /// Sign byte `0` is positive, big-endian magnitude sized by precision.
    Sybase,
}

impl NumericLayout {
    /// Wire length including the sign byte.
    pub fn byte_len(self, precision: u8) -> usize {
        match self {
            Self::SqlServer => match precision {
                0..=9 => 5,
                10..=19 => 9,
                20..=28 => 13,
                _ => 17,
            },
            Self::Sybase => SYBASE_NUMERIC_BYTES[precision.min(38) as usize] as usize,
        }
    }

    pub fn is_positive(self, sign: u8) -> bool {
        match self {
            Self::SqlServer => sign == 1,
            Self::Sybase => sign == 0,
        }
    }

    pub fn sign_byte(self, negative: bool) -> u8 {
        match (self, negative) {
            (Self::SqlServer, false) | (Self::Sybase, true) => 1,
            (Self::SqlServer, true) | (Self::Sybase, false) => 0,
        }
    }
}

/// Sybase decimal wire length, sign included, by precision.
const SYBASE_NUMERIC_BYTES: [u8; 39] = [
    2, 2, 2, 3, 3, 4, 4, 4, 5, 5, 6, 6, 6, 7, 7, 8, 8, 9, 9, 9,
    10, 10, 11, 11, 11, 12, 12, 13, 13, 14, 14, 14, 15, 15, 16, 16, 16, 17, 17,
];

/// Type repertoire of one server family.
#[derive(Debug, PartialEq, Eq)]
pub struct TypeTable {
    pub flavor: ServerFlavor,
    pub numeric: NumericLayout,
    pub types: &'static [TypeInfo],
}

impl TypeTable {
    pub fn lookup(&self, tag: u8) -> Option<&'static TypeInfo> {
        self.types.iter().find(|e| e.tag == tag)
    }

    fn get(&self, tag: u8) -> &'static TypeInfo {
        match self.lookup(tag) {
            Some(info) => info,
            None => &NULL_TYPE,
        }
    }
}

use Kind as K;
use Length as L;

const NULL_TYPE: TypeInfo = TypeInfo::new(0x1F, "null", K::Null, L::Fixed(0));

pub const SQL_SERVER: TypeTable = TypeTable {
    flavor: ServerFlavor::SqlServer,
    numeric: NumericLayout::SqlServer,
    types: &[
        NULL_TYPE,
        TypeInfo::new(0x30, "tinyint", K::Int, L::Fixed(1)),
        TypeInfo::new(0x32, "bit", K::Bit, L::Fixed(1)),
        TypeInfo::new(0x34, "smallint", K::Int, L::Fixed(2)),
        TypeInfo::new(0x38, "int", K::Int, L::Fixed(4)),
        TypeInfo::new(0x7F, "bigint", K::Int, L::Fixed(8)),
        TypeInfo::new(0x3A, "smalldatetime", K::DateTime, L::Fixed(4)),
        TypeInfo::new(0x3D, "datetime", K::DateTime, L::Fixed(8)),
        TypeInfo::new(0x3B, "real", K::Float, L::Fixed(4)),
        TypeInfo::new(0x3E, "float", K::Float, L::Fixed(8)),
        TypeInfo::new(0x7A, "smallmoney", K::Money, L::Fixed(4)),
        TypeInfo::new(0x3C, "money", K::Money, L::Fixed(8)),
        TypeInfo::new(0x26, "intn", K::Int, L::Byte),
        TypeInfo::new(0x68, "bitn", K::Bit, L::Byte),
        TypeInfo::new(0x6D, "floatn", K::Float, L::Byte),
        TypeInfo::new(0x6E, "moneyn", K::Money, L::Byte),
        TypeInfo::new(0x6F, "datetimen", K::DateTime, L::Byte),
        TypeInfo::new(0x6A, "decimal", K::Decimal, L::Byte),
        TypeInfo::new(0x6C, "numeric", K::Decimal, L::Byte),
        TypeInfo::new(0x37, "decimal", K::Decimal, L::Byte),
        TypeInfo::new(0x3F, "numeric", K::Decimal, L::Byte),
        TypeInfo::new(0x24, "uniqueidentifier", K::Guid, L::Byte),
        TypeInfo::new(0x2F, "char", K::Char, L::Byte),
        TypeInfo::new(0x27, "varchar", K::Char, L::Byte),
        TypeInfo::new(0x2D, "binary", K::Binary, L::Byte),
        TypeInfo::new(0x25, "varbinary", K::Binary, L::Byte),
        TypeInfo::new(0xAF, "char", K::Char, L::Short),
        TypeInfo::new(0xA7, "varchar", K::Char, L::Short),
        TypeInfo::new(0xAD, "binary", K::Binary, L::Short),
        TypeInfo::new(0xA5, "varbinary", K::Binary, L::Short),
        TypeInfo::new(0xEF, "nchar", K::NChar, L::Short),
        TypeInfo::new(0xE7, "nvarchar", K::NChar, L::Short),
        TypeInfo::new(0x23, "text", K::Text, L::Text),
        TypeInfo::new(0x63, "ntext", K::NText, L::Text),
        TypeInfo::new(0x22, "image", K::Image, L::Text),
    ],
};

pub const SYBASE: TypeTable = TypeTable {
    flavor: ServerFlavor::Sybase,
    numeric: NumericLayout::Sybase,
    types: &[
        NULL_TYPE,
        TypeInfo::new(0x30, "tinyint", K::Int, L::Fixed(1)),
        TypeInfo::new(0x32, "bit", K::Bit, L::Fixed(1)),
        TypeInfo::new(0x34, "smallint", K::Int, L::Fixed(2)),
        TypeInfo::new(0x38, "int", K::Int, L::Fixed(4)),
        TypeInfo::new(0x3A, "smalldatetime", K::DateTime, L::Fixed(4)),
        TypeInfo::new(0x3D, "datetime", K::DateTime, L::Fixed(8)),
        TypeInfo::new(0x3B, "real", K::Float, L::Fixed(4)),
        TypeInfo::new(0x3E, "float", K::Float, L::Fixed(8)),
        TypeInfo::new(0x7A, "smallmoney", K::Money, L::Fixed(4)),
        TypeInfo::new(0x3C, "money", K::Money, L::Fixed(8)),
        TypeInfo::new(0x31, "date", K::Date, L::Fixed(4)),
        TypeInfo::new(0x33, "time", K::Time, L::Fixed(4)),
        TypeInfo::new(0x26, "intn", K::Int, L::Byte),
        TypeInfo::new(0x6D, "floatn", K::Float, L::Byte),
        TypeInfo::new(0x6E, "moneyn", K::Money, L::Byte),
        TypeInfo::new(0x6F, "datetimen", K::DateTime, L::Byte),
        TypeInfo::new(0x7B, "daten", K::Date, L::Byte),
        TypeInfo::new(0x93, "timen", K::Time, L::Byte),
        TypeInfo::new(0x6A, "decimal", K::Decimal, L::Byte),
        TypeInfo::new(0x6C, "numeric", K::Decimal, L::Byte),
        TypeInfo::new(0x37, "decimal", K::Decimal, L::Byte),
        TypeInfo::new(0x3F, "numeric", K::Decimal, L::Byte),
        TypeInfo::new(0x2F, "char", K::Char, L::Byte),
        TypeInfo::new(0x27, "varchar", K::Char, L::Byte),
        TypeInfo::new(0x2D, "binary", K::Binary, L::Byte),
        TypeInfo::new(0x25, "varbinary", K::Binary, L::Byte),
        TypeInfo::new(0xAF, "longchar", K::Char, L::Long),
        TypeInfo::new(0xE1, "longbinary", K::Binary, L::Long),
        TypeInfo::new(0x23, "text", K::Text, L::Text),
        TypeInfo::new(0x22, "image", K::Image, L::Text),
    ],
};

/// Wire type selected for a parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireType {
    pub info: &'static TypeInfo,
    /// Declared maximum length in bytes.
    pub max_len: u32,
    pub precision: u8,
    pub scale: u8,
}

impl WireType {
    fn new(info: &'static TypeInfo, max_len: u32) -> WireType {
        WireType { info, max_len, precision: 0, scale: 0 }
    }
}

/// Protocol rules of a session: server family, version and type table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dialect {
    pub flavor: ServerFlavor,
    pub version: TdsVersion,
    table: &'static TypeTable,
}

impl Dialect {
    pub fn new(flavor: ServerFlavor, version: TdsVersion) -> Dialect {
        let table = match flavor {
            ServerFlavor::SqlServer => &SQL_SERVER,
            ServerFlavor::Sybase => &SYBASE,
        };
        Dialect { flavor, version, table }
    }

    pub fn table(&self) -> &'static TypeTable {
        self.table
    }

    pub fn lookup(&self, tag: u8) -> Result<&'static TypeInfo, ProtocolError> {
        self.table.lookup(tag).ok_or(ProtocolError::unknown_type(tag))
    }

    pub fn numeric(&self) -> NumericLayout {
        self.table.numeric
    }

    pub fn is_wide(&self) -> bool {
        self.version.is_wide()
    }

    /// Character type info carries a 5 byte collation.
    pub fn has_collation(&self, info: &TypeInfo) -> bool {
        self.version >= TdsVersion::V71 && info.kind.is_character() && info.length != Length::Byte
    }

    /// User type field width in metadata tokens.
    pub fn usertype_len(&self) -> usize {
        match self.version {
            TdsVersion::V72 => 4,
            TdsVersion::V50 => 4,
            _ => 2,
        }
    }

    /// DONE row count is 8 bytes wide.
    pub fn wide_row_count(&self) -> bool {
        self.version >= TdsVersion::V72
    }

    /// Requests carry the ALL_HEADERS transaction descriptor.
    pub fn has_all_headers(&self) -> bool {
        self.version >= TdsVersion::V72
    }

    /// Procedure can be addressed by well known numeric id.
    pub fn has_proc_ids(&self) -> bool {
        self.flavor == ServerFlavor::SqlServer && self.version >= TdsVersion::V71
    }

    /// Transactions are driven by transaction manager requests.
    pub fn has_transaction_manager(&self) -> bool {
        self.version >= TdsVersion::V72
    }

    /// Select the wire type used to send a parameter.
    pub fn wire_type(&self, ty: SqlType) -> WireType {
        let t = self.table;
        let sybase = self.flavor == ServerFlavor::Sybase;
        let int8 = !sybase && self.version >= TdsVersion::V71;
        match ty {
            SqlType::Bit if sybase => WireType::new(t.get(0x26), 1),
            SqlType::Bit => WireType::new(t.get(0x68), 1),
            SqlType::TinyInt => WireType::new(t.get(0x26), 1),
            SqlType::SmallInt => WireType::new(t.get(0x26), 2),
            SqlType::Int => WireType::new(t.get(0x26), 4),
            SqlType::BigInt if int8 => WireType::new(t.get(0x26), 8),
            SqlType::BigInt => self.wire_type(SqlType::Decimal { precision: 19, scale: 0 }),
            SqlType::Real => WireType::new(t.get(0x6D), 4),
            SqlType::Float => WireType::new(t.get(0x6D), 8),
            SqlType::Money => WireType::new(t.get(0x6E), 8),
            SqlType::DateTime => WireType::new(t.get(0x6F), 8),
            SqlType::Date if sybase => WireType::new(t.get(0x7B), 4),
            SqlType::Time if sybase => WireType::new(t.get(0x93), 4),
            SqlType::Date | SqlType::Time => WireType::new(t.get(0x6F), 8),
            SqlType::Decimal { precision, scale } => {
                let precision = precision.clamp(1, 38);
                let tag = if sybase { 0x6C } else { 0x6A };
                let max_len = self.numeric().byte_len(precision) as u32;
                WireType { info: t.get(tag), max_len, precision, scale: scale.min(precision) }
            },
            SqlType::Guid if sybase => WireType::new(t.get(0x25), 16),
            SqlType::Guid => WireType::new(t.get(0x24), 16),
            SqlType::VarChar(n) if sybase && n <= 255 => WireType::new(t.get(0x27), n.max(1)),
            SqlType::VarChar(_) if sybase => WireType::new(t.get(0xAF), i32::MAX as u32),
            SqlType::VarChar(n) if n <= 8000 => WireType::new(t.get(0xA7), n.max(1)),
            SqlType::NVarChar(n) if sybase => self.wire_type(SqlType::VarChar(n.saturating_mul(3))),
            SqlType::NVarChar(n) if n <= 4000 && self.is_wide() => WireType::new(t.get(0xE7), n.max(1) * 2),
            SqlType::VarChar(_) | SqlType::Text => WireType::new(t.get(0x23), i32::MAX as u32),
            SqlType::NVarChar(_) | SqlType::NText if sybase => WireType::new(t.get(0x23), i32::MAX as u32),
            SqlType::NVarChar(_) | SqlType::NText => WireType::new(t.get(0x63), i32::MAX as u32),
            SqlType::VarBinary(n) if sybase && n <= 255 => WireType::new(t.get(0x25), n.max(1)),
            SqlType::VarBinary(_) if sybase => WireType::new(t.get(0xE1), i32::MAX as u32),
            SqlType::VarBinary(n) if n <= 8000 => WireType::new(t.get(0xA5), n.max(1)),
            SqlType::VarBinary(_) | SqlType::Image => WireType::new(t.get(0x22), i32::MAX as u32),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} TDS {}", self.flavor, self.version)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn divergent_tags() {
        let mssql = Dialect::new(ServerFlavor::SqlServer, TdsVersion::V71);
        let sybase = Dialect::new(ServerFlavor::Sybase, TdsVersion::V50);

        assert_eq!(mssql.lookup(0xAF).unwrap().length, Length::Short);
        assert_eq!(sybase.lookup(0xAF).unwrap().length, Length::Long);
        assert!(mssql.lookup(0xE1).is_err());
        assert!(sybase.lookup(0xE7).is_err());
        assert_eq!(sybase.lookup(0x31).unwrap().kind, Kind::Date);
    }

    #[test]
    fn numeric_lengths() {
        assert_eq!(NumericLayout::SqlServer.byte_len(9), 5);
        assert_eq!(NumericLayout::SqlServer.byte_len(38), 17);
        assert_eq!(NumericLayout::Sybase.byte_len(10), 6);
        assert_eq!(NumericLayout::Sybase.byte_len(38), 17);
    }

    #[test]
    fn parameter_types_follow_dialect() {
        let v70 = Dialect::new(ServerFlavor::SqlServer, TdsVersion::V70);
        let big = v70.wire_type(SqlType::BigInt);
        assert_eq!(big.info.kind, Kind::Decimal);
        assert_eq!(big.precision, 19);

        let v71 = Dialect::new(ServerFlavor::SqlServer, TdsVersion::V71);
        assert_eq!(v71.wire_type(SqlType::BigInt).max_len, 8);
        assert_eq!(v71.wire_type(SqlType::NVarChar(10)).info.tag, 0xE7);
        assert_eq!(v71.wire_type(SqlType::NVarChar(5000)).info.tag, 0x63);

        let sybase = Dialect::new(ServerFlavor::Sybase, TdsVersion::V50);
        assert_eq!(sybase.wire_type(SqlType::NVarChar(10)).info.tag, 0x27);
        assert_eq!(sybase.wire_type(SqlType::VarChar(300)).info.tag, 0xAF);
    }

    #[test]
    fn login_ack_versions() {
        assert_eq!(TdsVersion::from_login_ack(0x7100_0001), Some(TdsVersion::V71));
        assert_eq!(TdsVersion::from_login_ack(0x0500_0000), Some(TdsVersion::V50));
        assert_eq!(TdsVersion::from_login_ack(0x0402_0000), None);
    }
}
