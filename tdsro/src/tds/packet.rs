//! Packet framing.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::ProtocolError;

/// Packet header length, in bytes.
pub const HEADER_LEN: usize = 8;
/// Smallest packet size a server accepts.
pub const MIN_PACKET_SIZE: usize = 512;
/// Packet size used until the server negotiates another.
pub const DEFAULT_PACKET_SIZE: usize = 4096;
/// Largest packet size the header length field can express.
pub const MAX_PACKET_SIZE: usize = 32767;

/// Status bit marking the last packet of a message.
pub const STATUS_EOM: u8 = 0x01;

/// Message type in the packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// SQL batch, TDS 7.x.
    SqlBatch = 0x01,
    /// Legacy login record, TDS 5.0.
    Login = 0x02,
    /// Remote procedure call, TDS 7.x.
    Rpc = 0x03,
    /// Server response.
    Reply = 0x04,
    /// Out-of-band attention signal.
    Attention = 0x06,
    /// Bulk load data.
    BulkLoad = 0x07,
    /// Transaction manager request, TDS 7.2.
    TransactionManager = 0x0E,
    /// Token based request, TDS 5.0.
    Normal = 0x0F,
    /// LOGIN7 record, TDS 7.x.
    Login7 = 0x10,
}

impl PacketType {
    pub fn from_u8(kind: u8) -> Option<PacketType> {
        let me = match kind {
            0x01 => Self::SqlBatch,
            0x02 => Self::Login,
            0x03 => Self::Rpc,
            0x04 => Self::Reply,
            0x06 => Self::Attention,
            0x07 => Self::BulkLoad,
            0x0E => Self::TransactionManager,
            0x0F => Self::Normal,
            0x10 => Self::Login7,
            _ => return None,
        };
        Some(me)
    }
}

/// The 8 byte packet header.
///
/// Multi-byte fields are big-endian, unlike the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketType,
    pub status: u8,
    /// Packet length including this header.
    pub length: u16,
    /// Logical stream id.
    pub channel: u16,
    pub packet_id: u8,
    pub window: u8,
}

impl PacketHeader {
    pub fn is_last(&self) -> bool {
        self.status & STATUS_EOM != 0
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize - HEADER_LEN
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.status);
        buf.put_u16(self.length);
        buf.put_u16(self.channel);
        buf.put_u8(self.packet_id);
        buf.put_u8(self.window);
    }

    /// Decode header, `header` must be at least [`HEADER_LEN`] long.
    pub fn decode(mut header: &[u8]) -> Result<PacketHeader, ProtocolError> {
        let kind = header.get_u8();
        let Some(kind) = PacketType::from_u8(kind) else {
            return Err(ProtocolError::UnknownPacket { kind });
        };
        let status = header.get_u8();
        let length = header.get_u16();
        if (length as usize) < HEADER_LEN {
            return Err(ProtocolError::InvalidLength { length });
        }
        let channel = header.get_u16();
        let packet_id = header.get_u8();
        let window = header.get_u8();
        Ok(PacketHeader { kind, status, length, channel, packet_id, window })
    }
}

/// One framed packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    /// Create packet, payload must fit in [`MAX_PACKET_SIZE`].
    pub fn new(kind: PacketType, channel: u16, packet_id: u8, last: bool, payload: Bytes) -> Packet {
        debug_assert!(payload.len() + HEADER_LEN <= MAX_PACKET_SIZE);
        let header = PacketHeader {
            kind,
            status: if last { STATUS_EOM } else { 0 },
            length: (payload.len() + HEADER_LEN) as u16,
            channel,
            packet_id,
            window: 0,
        };
        Packet { header, payload }
    }

    /// The attention signal, a payload-less last packet.
    pub fn attention(channel: u16) -> Packet {
        Packet::new(PacketType::Attention, channel, 1, true, Bytes::new())
    }

    pub fn channel(&self) -> u16 {
        self.header.channel
    }

    pub fn is_last(&self) -> bool {
        self.header.is_last()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN + self.payload.len());
        self.header.encode(buf);
        buf.put_slice(&self.payload);
    }

    /// Try to split one packet from the front of `buf`.
    ///
    /// Returns `None` when `buf` does not hold a complete packet yet,
    /// in which case `buf` is left untouched.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        let Some(header) = buf.get(..HEADER_LEN) else {
            return Ok(None);
        };
        let header = PacketHeader::decode(header)?;
        let length = header.length as usize;
        if buf.len() < length {
            buf.reserve(length - buf.len());
            return Ok(None);
        }
        buf.advance(HEADER_LEN);
        let payload = buf.split_to(length - HEADER_LEN).freeze();
        Ok(Some(Packet { header, payload }))
    }
}
