//! Sql string operation.
//!
//! SQL text is opaque to the driver except for `?` placeholders, which are
//! found outside string literals, quoted identifiers and comments.
use std::fmt::Write;

use crate::{
    Result,
    error::UsageError,
    param::Param,
    tds::{Dialect, ServerFlavor},
    value::{DateTime, Value},
};

/// Byte offsets of every `?` placeholder in `sql`.
pub fn placeholders(sql: &str) -> Vec<usize> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'?' => out.push(i),
            quote @ (b'\'' | b'"') => i = skip_quoted(bytes, i, quote),
            b'[' => i = skip_quoted(bytes, i, b']'),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = match bytes[i..].iter().position(|&b| b == b'\n') {
                    Some(n) => i + n,
                    None => bytes.len(),
                };
            },
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            _ => {},
        }
        i += 1;
    }

    out
}

/// Index of the closing quote, a doubled quote is an escaped one.
fn skip_quoted(bytes: &[u8], start: usize, close: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == close {
            if bytes.get(i + 1) == Some(&close) {
                i += 2;
                continue;
            }
            return i;
        }
        i += 1;
    }
    bytes.len()
}

/// Index of the last byte of a, possibly nested, block comment.
fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0;
    let mut i = start;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            },
            (b'*', b'/') => {
                depth -= 1;
                if depth == 0 {
                    return i + 1;
                }
                i += 2;
            },
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Replace `?` placeholders with `@P0`, `@P1` and so on.
///
/// Returns the rewritten text and the placeholder count.
pub fn number_placeholders(sql: &str) -> (String, usize) {
    let positions = placeholders(sql);
    let mut out = String::with_capacity(sql.len() + positions.len() * 3);
    let mut last = 0;
    let mut buf = itoa::Buffer::new();

    for (n, &at) in positions.iter().enumerate() {
        out.push_str(&sql[last..at]);
        out.push_str("@P");
        out.push_str(buf.format(n));
        last = at + 1;
    }
    out.push_str(&sql[last..]);

    (out, positions.len())
}

/// Parameter declaration list, e.g. `@P0 int,@P1 nvarchar(4000) output`.
pub fn declarations(params: &[Param]) -> String {
    let mut out = String::new();
    let mut buf = itoa::Buffer::new();
    for (n, param) in params.iter().enumerate() {
        if n > 0 {
            out.push(',');
        }
        match param.name() {
            Some(name) => out.push_str(name),
            None => {
                out.push_str("@P");
                out.push_str(buf.format(n));
            },
        }
        out.push(' ');
        out.push_str(&param.sql_type().declaration());
        if param.is_output() {
            out.push_str(" output");
        }
    }
    out
}

/// Replace `?` placeholders with the SQL literal of each parameter input.
pub fn substitute(sql: &str, params: &[Param], dialect: &Dialect) -> Result<String> {
    let positions = placeholders(sql);
    if positions.len() != params.len() {
        return Err(UsageError::new("placeholder count does not match parameter count").into());
    }

    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut last = 0;
    for (&at, param) in positions.iter().zip(params) {
        out.push_str(&sql[last..at]);
        match param.input_value() {
            Some(value) => write_literal(&mut out, value, dialect),
            None => out.push_str("NULL"),
        }
        last = at + 1;
    }
    out.push_str(&sql[last..]);
    Ok(out)
}

/// Write `value` as a SQL literal.
pub fn write_literal(out: &mut String, value: &Value, dialect: &Dialect) {
    // writing into a String never fails
    let _ = match value {
        Value::Bool(v) => write!(out, "{}", *v as u8),
        Value::TinyInt(v) => write!(out, "{v}"),
        Value::SmallInt(v) => write!(out, "{v}"),
        Value::Int(v) => write!(out, "{v}"),
        Value::BigInt(v) => write!(out, "{v}"),
        Value::Real(v) => write!(out, "{v:?}"),
        Value::Float(v) => write!(out, "{v:?}"),
        Value::Numeric(v) => write!(out, "{v}"),
        Value::Money(v) => write!(out, "{v}"),
        Value::DateTime(v) => {
            let (y, mo, d) = v.date();
            let (h, mi, s, ms) = v.time();
            write!(out, "'{y:04}{mo:02}{d:02} {h:02}:{mi:02}:{s:02}.{ms:03}'")
        },
        Value::Date(days) => {
            let (y, mo, d) = DateTime::new(*days, 0).date();
            write!(out, "'{y:04}{mo:02}{d:02}'")
        },
        Value::Time(ticks) => {
            let (h, mi, s, ms) = DateTime::new(0, *ticks).time();
            write!(out, "'{h:02}:{mi:02}:{s:02}.{ms:03}'")
        },
        Value::String(v) => {
            if dialect.flavor == ServerFlavor::SqlServer && dialect.is_wide() {
                out.push('N');
            }
            out.push('\'');
            out.push_str(&v.replace('\'', "''"));
            out.push('\'');
            Ok(())
        },
        Value::Binary(v) => write_hex(out, v),
        Value::Guid(v) if dialect.flavor == ServerFlavor::SqlServer => {
            write!(
                out,
                "'{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}'",
                v[3], v[2], v[1], v[0], v[5], v[4], v[7], v[6],
                v[8], v[9], v[10], v[11], v[12], v[13], v[14], v[15],
            )
        },
        Value::Guid(v) => write_hex(out, v),
    };
}

fn write_hex(out: &mut String, bytes: &[u8]) -> std::fmt::Result {
    out.push_str("0x");
    for b in bytes {
        write!(out, "{b:02X}")?;
    }
    Ok(())
}

/// Short description of SQL text for logs.
pub(crate) fn preview(sql: &str) -> &str {
    let end = sql.char_indices().nth(64).map(|(i, _)| i).unwrap_or(sql.len());
    &sql[..end]
}
