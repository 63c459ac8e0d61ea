use bytes::{Bytes, BytesMut};

use crate::{
    ext::BufMutExt,
    tds::{Charset, Packet, PacketType, packet::{HEADER_LEN, MAX_PACKET_SIZE, MIN_PACKET_SIZE}},
};

macro_rules! put_le {
    ($($name:ident: $ty:ty;)*) => {
        $(
            pub fn $name(&mut self, value: $ty) {
                self.put_slice(&value.to_le_bytes());
            }
        )*
    };
}

/// Outbound message writer which cuts packets at the negotiated packet size.
///
/// Only the final packet, produced by [`finish`][RequestStream::finish],
/// carries the last packet status bit.
#[derive(Debug)]
pub struct RequestStream {
    kind: PacketType,
    channel: u16,
    capacity: usize,
    packet_id: u8,
    buf: BytesMut,
    packets: Vec<Packet>,
}

impl RequestStream {
    pub fn new(kind: PacketType, channel: u16, packet_size: usize) -> RequestStream {
        let packet_size = packet_size.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE);
        let capacity = packet_size - HEADER_LEN;
        RequestStream {
            kind,
            channel,
            capacity,
            packet_id: 1,
            buf: BytesMut::with_capacity(capacity),
            packets: Vec::new(),
        }
    }

    /// Maximum payload of one packet.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn put_u8(&mut self, value: u8) {
        self.put_slice(&[value]);
    }

    put_le! {
        put_u16_le: u16;
        put_i16_le: i16;
        put_u32_le: u32;
        put_i32_le: i32;
        put_u64_le: u64;
        put_i64_le: i64;
        put_f32_le: f32;
        put_f64_le: f64;
    }

    pub fn put_u32(&mut self, value: u32) {
        self.put_slice(&value.to_be_bytes());
    }

    /// Append raw bytes, cutting full packets as the buffer fills up.
    pub fn put_slice(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let room = self.capacity - self.buf.len();
            if room == 0 {
                self.cut(false);
                continue;
            }
            let n = room.min(bytes.len());
            self.buf.extend_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
        }
    }

    /// Append string as UTF-16LE.
    pub fn put_ucs2(&mut self, string: &str) {
        let mut scratch = BytesMut::with_capacity(string.len() * 2);
        scratch.put_ucs2(string);
        self.put_slice(&scratch);
    }

    /// Append string in a single byte charset.
    pub fn put_str(&mut self, string: &str, charset: &Charset) {
        self.put_slice(&charset.encode(string));
    }

    fn cut(&mut self, last: bool) {
        let payload: Bytes = self.buf.split().freeze();
        let packet = Packet::new(self.kind, self.channel, self.packet_id, last, payload);
        self.packets.push(packet);
        self.packet_id = self.packet_id.wrapping_add(1);
    }

    /// Cut the final packet and return the whole message.
    pub fn finish(mut self) -> Vec<Packet> {
        self.cut(true);
        self.packets
    }
}
