//! `tdsro` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    message::MessageChain,
    row::DecodeError,
    session::{ConfigError, LoginError},
    tds::ProtocolError,
    value::ConversionError,
};

/// A specialized [`Result`] type for `tdsro` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `tdsro` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Attach additional context to the error message.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Returns `true` if the session that produced this error can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Protocol(_) | ErrorKind::ConnectionLost(_))
    }

    /// Returns the server message chain if this is a server error.
    pub fn server_messages(&self) -> Option<&MessageChain> {
        match &self.kind {
            ErrorKind::Server(chain) => Some(chain),
            _ => None,
        }
    }
}

/// All possible error kind from `tdsro` library.
pub enum ErrorKind {
    Config(ConfigError),
    Protocol(ProtocolError),
    ConnectionLost(ConnectionLost),
    Io(io::Error),
    Login(LoginError),
    Server(MessageChain),
    Timeout(Timeout),
    Cancelled(Cancelled),
    Conversion(ConversionError),
    ResourceExhausted(ResourceExhausted),
    Usage(UsageError),
    Decode(DecodeError),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ConfigError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<ConnectionLost>e => ErrorKind::ConnectionLost(e));
from!(<std::io::Error>e => ErrorKind::Io(e));
from!(<LoginError>e => ErrorKind::Login(e));
from!(<MessageChain>e => ErrorKind::Server(e));
from!(<Timeout>e => ErrorKind::Timeout(e));
from!(<Cancelled>e => ErrorKind::Cancelled(e));
from!(<ConversionError>e => ErrorKind::Conversion(e));
from!(<ResourceExhausted>e => ErrorKind::ResourceExhausted(e));
from!(<UsageError>e => ErrorKind::Usage(e));
from!(<DecodeError>e => ErrorKind::Decode(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::ConnectionLost(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Login(e) => e.fmt(f),
            Self::Server(e) => e.fmt(f),
            Self::Timeout(e) => e.fmt(f),
            Self::Cancelled(e) => e.fmt(f),
            Self::Conversion(e) => e.fmt(f),
            Self::ResourceExhausted(e) => e.fmt(f),
            Self::Usage(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

macro_rules! unit_error {
    ($(#[$meta:meta])* $name:ident, $msg:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name;

        impl std::error::Error for $name { }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str($msg)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "\"{self}\"")
            }
        }
    };
}

unit_error! {
    /// The physical connection failed, every logical stream of the session is unusable.
    ConnectionLost, "connection lost, session must reconnect"
}

unit_error! {
    /// The client-side deadline elapsed and the server acknowledged the cancellation.
    Timeout, "request timed out"
}

unit_error! {
    /// The request was cancelled and the server acknowledged the cancellation.
    Cancelled, "request cancelled"
}

unit_error! {
    /// Every logical stream id is in use.
    ResourceExhausted, "no free logical stream id"
}

/// An error caused by calling an operation in a state that does not allow it.
pub struct UsageError {
    reason: &'static str,
}

impl UsageError {
    pub(crate) fn new(reason: &'static str) -> Self {
        Self { reason }
    }
}

impl std::error::Error for UsageError { }

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid usage: {}", self.reason)
    }
}

impl fmt::Debug for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
