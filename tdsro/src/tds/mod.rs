//! Tabular Data Stream protocol.
//!
//! Every request and response is a message split into packets. Each packet
//! starts with an 8 byte header:
//!
//! ```text
//! +------+--------+------------+------------+-----------+--------+
//! | type | status |   length   |  channel   | packet id | window |
//! |  u8  |   u8   | u16 (BE)   | u16 (BE)   |    u8     |   u8   |
//! +------+--------+------------+------------+-----------+--------+
//! ```
//!
//! `length` includes the header. Status bit `0x01` marks the last packet of a
//! message. `channel` names the logical stream the packet belongs to.
//!
//! Payload of a response message is a sequence of tokens, each starting with
//! a one byte tag. Payload integers are little-endian.
//!
//! <https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-tds>
mod error;
mod charset;
pub mod packet;
pub mod token;
pub mod types;

pub use error::ProtocolError;
pub use charset::{Charset, decode_ucs2};
pub use packet::{Packet, PacketHeader, PacketType};
pub use types::{Dialect, Kind, Length, NumericLayout, ServerFlavor, TdsVersion, TypeInfo, WireType};
