//! Protocol error
use std::fmt;

use super::token;

/// An error when translating bytes from the server.
///
/// Protocol errors are fatal to the session, framing can not be recovered
/// once the byte stream is misread.
pub enum ProtocolError {
    /// Packet header carries an unknown message type.
    UnknownPacket {
        kind: u8,
    },
    /// Packet header length is shorter than the header itself.
    InvalidLength {
        length: u16,
    },
    /// Read past the final packet of a message.
    UnexpectedEof,
    /// Unknown token tag.
    UnknownToken {
        tag: u8,
    },
    /// Unknown or unsupported wire type tag.
    UnknownType {
        tag: u8,
    },
    /// A value length is not valid for its wire type.
    InvalidValueLength {
        tag: u8,
        length: usize,
    },
    /// Malformed token body.
    Malformed {
        token: u8,
        reason: &'static str,
    },
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UnknownPacket { kind } => write!(f, "unknown packet type `0x{kind:02X}`"),
            Self::InvalidLength { length } => write!(f, "invalid packet length `{length}`"),
            Self::UnexpectedEof => f.write_str("unexpected end of message"),
            Self::UnknownToken { tag } => write!(f, "unknown token `0x{tag:02X}`"),
            Self::UnknownType { tag } => write!(f, "unknown data type `0x{tag:02X}`"),
            Self::InvalidValueLength { tag, length } => {
                write!(f, "invalid length `{length}` for data type `0x{tag:02X}`")
            },
            Self::Malformed { token, reason } => {
                write!(f, "malformed `{}` token: {reason}", token::token_name(token))
            },
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl ProtocolError {
    pub(crate) fn unknown_token(tag: u8) -> ProtocolError {
        Self::UnknownToken { tag }
    }

    pub(crate) fn unknown_type(tag: u8) -> ProtocolError {
        Self::UnknownType { tag }
    }

    pub(crate) fn invalid_length(tag: u8, length: usize) -> ProtocolError {
        Self::InvalidValueLength { tag, length }
    }

    pub(crate) fn malformed(token: u8, reason: &'static str) -> ProtocolError {
        Self::Malformed { token, reason }
    }
}
