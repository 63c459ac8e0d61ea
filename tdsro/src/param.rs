//! Procedure call parameters.
use crate::value::{ColumnValue, Value};

/// Declared SQL type of a parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SqlType {
    Bit,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Real,
    Float,
    Decimal {
        precision: u8,
        scale: u8,
    },
    Money,
    DateTime,
    Date,
    Time,
    /// Maximum length in bytes.
    VarChar(u32),
    /// Maximum length in characters.
    NVarChar(u32),
    Text,
    NText,
    VarBinary(u32),
    Image,
    Guid,
}

impl SqlType {
    /// Type used to send `value` when none is declared.
    pub fn of(value: &Value) -> SqlType {
        match value {
            Value::Bool(_) => Self::Bit,
            Value::TinyInt(_) => Self::TinyInt,
            Value::SmallInt(_) => Self::SmallInt,
            Value::Int(_) => Self::Int,
            Value::BigInt(_) => Self::BigInt,
            Value::Real(_) => Self::Real,
            Value::Float(_) => Self::Float,
            Value::Numeric(n) => Self::Decimal { precision: 38, scale: n.scale() },
            Value::Money(_) => Self::Money,
            Value::DateTime(_) => Self::DateTime,
            Value::Date(_) => Self::Date,
            Value::Time(_) => Self::Time,
            Value::String(s) if s.encode_utf16().count() <= 4000 => Self::NVarChar(4000),
            Value::String(_) => Self::NText,
            Value::Binary(b) if b.len() <= 8000 => Self::VarBinary(8000),
            Value::Binary(_) => Self::Image,
            Value::Guid(_) => Self::Guid,
        }
    }

    /// Type name as written in a parameter declaration list.
    pub fn declaration(&self) -> String {
        match *self {
            Self::Bit => "bit".into(),
            Self::TinyInt => "tinyint".into(),
            Self::SmallInt => "smallint".into(),
            Self::Int => "int".into(),
            Self::BigInt => "bigint".into(),
            Self::Real => "real".into(),
            Self::Float => "float".into(),
            Self::Decimal { precision, scale } => format!("decimal({precision},{scale})"),
            Self::Money => "money".into(),
            Self::DateTime | Self::Date | Self::Time => "datetime".into(),
            Self::VarChar(n) if n <= 8000 => format!("varchar({n})"),
            Self::VarChar(_) | Self::Text => "text".into(),
            Self::NVarChar(n) if n <= 4000 => format!("nvarchar({n})"),
            Self::NVarChar(_) | Self::NText => "ntext".into(),
            Self::VarBinary(n) if n <= 8000 => format!("varbinary({n})"),
            Self::VarBinary(_) | Self::Image => "image".into(),
            Self::Guid => "uniqueidentifier".into(),
        }
    }
}

/// Parameter direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
    InOut,
}

/// One procedure call parameter.
///
/// The bound input and the value returned by the server live in separate
/// slots, so the same parameter list can be executed again.
#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    name: Option<String>,
    direction: Direction,
    ty: Option<SqlType>,
    input: Option<Value>,
    output: ColumnValue,
}

impl Param {
    fn new(direction: Direction, ty: Option<SqlType>, input: Option<Value>) -> Param {
        Param { name: None, direction, ty, input, output: ColumnValue::Unread }
    }

    /// Input parameter.
    pub fn input(value: impl Into<Value>) -> Param {
        Self::new(Direction::In, None, Some(value.into()))
    }

    /// Input parameter bound to NULL.
    pub fn null(ty: SqlType) -> Param {
        Self::new(Direction::In, Some(ty), None)
    }

    /// Output parameter.
    pub fn output(ty: SqlType) -> Param {
        Self::new(Direction::Out, Some(ty), None)
    }

    /// Input-output parameter.
    pub fn in_out(value: impl Into<Value>) -> Param {
        Self::new(Direction::InOut, None, Some(value.into()))
    }

    /// Set parameter name, e.g. `@total`.
    pub fn named(mut self, name: impl Into<String>) -> Param {
        let mut name = name.into();
        if !name.starts_with('@') {
            name.insert(0, '@');
        }
        self.name = Some(name);
        self
    }

    /// Declare the SQL type explicitly.
    pub fn typed(mut self, ty: SqlType) -> Param {
        self.ty = Some(ty);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_output(&self) -> bool {
        !matches!(self.direction, Direction::In)
    }

    /// The bound input, `None` is NULL.
    pub fn input_value(&self) -> Option<&Value> {
        self.input.as_ref()
    }

    /// Value returned by the server, [`ColumnValue::Unread`] until it arrives.
    pub fn output_value(&self) -> &ColumnValue {
        &self.output
    }

    /// Returned value was NULL.
    pub fn was_null(&self) -> bool {
        self.output.is_null()
    }

    /// Declared type, or the type inferred from the input.
    pub fn sql_type(&self) -> SqlType {
        match (self.ty, &self.input) {
            (Some(ty), _) => ty,
            (None, Some(value)) => SqlType::of(value),
            (None, None) => SqlType::NVarChar(4000),
        }
    }

    pub(crate) fn set_output(&mut self, value: ColumnValue) {
        self.output = value;
    }

    /// Forget the returned value before executing again.
    pub fn reset_output(&mut self) {
        self.output = ColumnValue::Unread;
    }
}
