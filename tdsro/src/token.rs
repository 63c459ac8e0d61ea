//! Decoded response tokens.
use bytes::Bytes;
use std::sync::Arc;

use crate::{
    message::ServerMessage,
    row::{ColumnDescriptor, Row},
    tds::token::DoneStatus,
    value::ColumnValue,
};

/// One unit of a response message.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    /// Columns of the rows that follow.
    ColumnMetadata(Arc<[ColumnDescriptor]>),
    Row(Row),
    Done(Done),
    /// ERROR, INFO or EED message.
    Message(ServerMessage),
    EnvChange(EnvChange),
    ReturnStatus(i32),
    /// Output parameter values, in the order the server sent them.
    ReturnValues(Vec<ReturnValue>),
    LoginAck(LoginAck),
    /// Column numbers of the ORDER BY clause, one based.
    Order(Vec<u16>),
    /// Column metadata updated with real names and tables.
    ColumnInfo(Arc<[ColumnDescriptor]>),
    TableName(Vec<String>),
    Capability(Bytes),
}

/// Which DONE token ended a statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoneKind {
    /// End of a SQL statement.
    Done,
    /// End of a stored procedure.
    Proc,
    /// End of a statement inside a stored procedure.
    InProc,
}

/// DONE, DONEPROC or DONEINPROC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Done {
    pub kind: DoneKind,
    pub status: DoneStatus,
    pub command: u16,
    pub count: u64,
}

impl Done {
    /// More token groups follow in this message.
    pub fn has_more(&self) -> bool {
        self.status.more()
    }

    /// Affected row count, when valid.
    pub fn rows_affected(&self) -> Option<u64> {
        self.status.has_count().then_some(self.count)
    }

    /// Final token of a response message.
    pub fn is_final(&self) -> bool {
        !self.has_more()
    }
}

/// Server side environment change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvChange {
    Database { old: String, new: String },
    Language(String),
    Charset(String),
    PacketSize(u32),
    /// Unicode locale id.
    Locale(String),
    /// Unicode comparison flags.
    ComparisonFlags(String),
    Collation(Bytes),
    /// Transaction started, with its descriptor.
    BeginTransaction(Bytes),
    CommitTransaction,
    RollbackTransaction,
    /// Change the client does not track.
    Other(u8),
}

/// Value of one output parameter or function result.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnValue {
    /// Parameter position as reported by the server, `0` when unknown.
    pub ordinal: u16,
    pub name: String,
    pub status: u8,
    pub descriptor: ColumnDescriptor,
    pub value: ColumnValue,
}

/// Login acknowledgement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginAck {
    /// SQL interface, on TDS 5.0 the login status.
    pub interface: u8,
    /// Protocol version, as the big-endian word sent by the server.
    pub version: u32,
    pub program: String,
    pub program_version: [u8; 4],
}

impl LoginAck {
    /// TDS 5.0 login status, login accepted.
    pub const SYBASE_SUCCEED: u8 = 5;
    /// TDS 5.0 login status, login rejected.
    pub const SYBASE_FAIL: u8 = 6;
}
