//! Token tags and status bits.

pub const LANGUAGE: u8 = 0x21;
pub const RETURN_STATUS: u8 = 0x79;
pub const COLMETADATA: u8 = 0x81;
pub const TABNAME: u8 = 0xA4;
pub const COLINFO: u8 = 0xA5;
pub const ORDER: u8 = 0xA9;
pub const ERROR: u8 = 0xAA;
pub const INFO: u8 = 0xAB;
pub const RETURN_VALUE: u8 = 0xAC;
pub const LOGINACK: u8 = 0xAD;
pub const CONTROL: u8 = 0xAE;
pub const ROW: u8 = 0xD1;
pub const PARAMS: u8 = 0xD7;
pub const CAPABILITY: u8 = 0xE2;
pub const ENVCHANGE: u8 = 0xE3;
pub const EED: u8 = 0xE5;
pub const DBRPC: u8 = 0xE6;
pub const PARAMFMT: u8 = 0xEC;
pub const SSPI: u8 = 0xED;
pub const ROWFMT: u8 = 0xEE;
pub const DONE: u8 = 0xFD;
pub const DONEPROC: u8 = 0xFE;
pub const DONEINPROC: u8 = 0xFF;

/// Token name for diagnostics.
pub fn token_name(tag: u8) -> &'static str {
    match tag {
        LANGUAGE => "LANGUAGE",
        RETURN_STATUS => "RETURNSTATUS",
        COLMETADATA => "COLMETADATA",
        TABNAME => "TABNAME",
        COLINFO => "COLINFO",
        ORDER => "ORDER",
        ERROR => "ERROR",
        INFO => "INFO",
        RETURN_VALUE => "RETURNVALUE",
        LOGINACK => "LOGINACK",
        CONTROL => "CONTROL",
        ROW => "ROW",
        PARAMS => "PARAMS",
        CAPABILITY => "CAPABILITY",
        ENVCHANGE => "ENVCHANGE",
        EED => "EED",
        DBRPC => "DBRPC",
        PARAMFMT => "PARAMFMT",
        SSPI => "SSPI",
        ROWFMT => "ROWFMT",
        DONE => "DONE",
        DONEPROC => "DONEPROC",
        DONEINPROC => "DONEINPROC",
        _ => "UNKNOWN",
    }
}

/// Status bitmask of the DONE token family.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct DoneStatus(pub u16);

impl DoneStatus {
    pub const FINAL: u16 = 0x00;
    pub const MORE: u16 = 0x01;
    pub const ERROR: u16 = 0x02;
    pub const IN_XACT: u16 = 0x04;
    pub const COUNT: u16 = 0x10;
    pub const ATTN: u16 = 0x20;
    pub const SRVERROR: u16 = 0x100;

    /// More token groups follow in this message.
    pub fn more(self) -> bool {
        self.0 & Self::MORE != 0
    }

    pub fn error(self) -> bool {
        self.0 & (Self::ERROR | Self::SRVERROR) != 0
    }

    pub fn in_transaction(self) -> bool {
        self.0 & Self::IN_XACT != 0
    }

    /// Row count is valid.
    pub fn has_count(self) -> bool {
        self.0 & Self::COUNT != 0
    }

    /// Acknowledges an attention signal.
    pub fn attention(self) -> bool {
        self.0 & Self::ATTN != 0
    }
}

impl std::fmt::Debug for DoneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DoneStatus(0x{:04X})", self.0)
    }
}

/// ENVCHANGE types.
pub mod env {
    pub const DATABASE: u8 = 1;
    pub const LANGUAGE: u8 = 2;
    pub const CHARSET: u8 = 3;
    pub const PACKET_SIZE: u8 = 4;
    pub const SORT_ID: u8 = 5;
    pub const SORT_FLAGS: u8 = 6;
    pub const COLLATION: u8 = 7;
    pub const BEGIN_TRANSACTION: u8 = 8;
    pub const COMMIT_TRANSACTION: u8 = 9;
    pub const ROLLBACK_TRANSACTION: u8 = 10;
}

/// Transaction manager request types.
pub mod tm {
    pub const BEGIN: u16 = 5;
    pub const COMMIT: u16 = 7;
    pub const ROLLBACK: u16 = 8;
    pub const SAVE: u16 = 9;
}

/// Well known procedure ids for `0xFFFF` prefixed rpc names.
pub mod proc_id {
    pub const SP_EXECUTE: u16 = 12;
    pub const SP_PREPEXEC: u16 = 13;
}

/// RPC parameter status, by reference (output) parameter.
pub const PARAM_BY_REF: u8 = 0x01;
