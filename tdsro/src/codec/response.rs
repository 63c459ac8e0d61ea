use bytes::{Buf, Bytes, BytesMut};

use crate::{
    Result,
    common::verbose,
    tds::{Charset, ProtocolError, decode_ucs2},
    transport::PacketSource,
};

macro_rules! read_le {
    ($($name:ident: $ty:ty;)*) => {
        $(
            pub async fn $name(&mut self) -> Result<$ty> {
                Ok(<$ty>::from_le_bytes(self.read_array().await?))
            }
        )*
    };
}

/// Inbound message reader over the packets of one logical stream.
///
/// Values may span packet boundaries, the next packet is fetched from the
/// source whenever the current payload runs out.
#[derive(Debug)]
pub struct ResponseStream<S> {
    source: S,
    current: Bytes,
    last: bool,
    unread: Option<u8>,
    charset: Charset,
}

impl<S: PacketSource> ResponseStream<S> {
    pub fn new(source: S, charset: Charset) -> ResponseStream<S> {
        ResponseStream { source, current: Bytes::new(), last: false, unread: None, charset }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    pub fn set_charset(&mut self, charset: Charset) {
        self.charset = charset;
    }

    /// Make sure `current` holds at least one byte.
    async fn fill(&mut self) -> Result<()> {
        while self.current.is_empty() {
            if self.last {
                return Err(ProtocolError::UnexpectedEof.into());
            }
            let packet = self.source.recv_packet().await?;
            verbose!(channel = packet.channel(), len = packet.payload.len(), last = packet.is_last(), "packet");
            self.last = packet.is_last();
            self.current = packet.payload;
        }
        Ok(())
    }

    /// Returns `true` when every byte of the current message is consumed.
    ///
    /// May wait for the next packet to find out.
    pub async fn at_end(&mut self) -> Result<bool> {
        loop {
            if self.unread.is_some() || !self.current.is_empty() {
                return Ok(false);
            }
            if self.last {
                return Ok(true);
            }
            let packet = self.source.recv_packet().await?;
            self.last = packet.is_last();
            self.current = packet.payload;
        }
    }

    /// Start reading the next message on the same stream.
    ///
    /// Unread bytes of the current message are discarded.
    pub fn next_message(&mut self) {
        self.current = Bytes::new();
        self.unread = None;
        self.last = false;
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        if let Some(byte) = self.unread.take() {
            return Ok(byte);
        }
        self.fill().await?;
        Ok(self.current.get_u8())
    }

    read_le! {
        read_i8: i8;
        read_u16: u16;
        read_i16: i16;
        read_u32: u32;
        read_i32: i32;
        read_u64: u64;
        read_i64: i64;
        read_f32: f32;
        read_f64: f64;
    }

    /// Next byte without consuming it.
    pub async fn peek(&mut self) -> Result<u8> {
        let byte = self.read_u8().await?;
        self.unread = Some(byte);
        Ok(byte)
    }

    pub async fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        let mut filled = 0;
        if N > 0 {
            if let Some(byte) = self.unread.take() {
                out[0] = byte;
                filled = 1;
            }
        }
        while filled < N {
            self.fill().await?;
            let n = (N - filled).min(self.current.len());
            self.current.copy_to_slice(&mut out[filled..filled + n]);
            filled += n;
        }
        Ok(out)
    }

    /// Read exactly `len` bytes.
    pub async fn read_exact(&mut self, len: usize) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        if self.unread.is_none() {
            self.fill().await?;
            if self.current.len() >= len {
                return Ok(self.current.split_to(len));
            }
        }

        let mut out = BytesMut::with_capacity(len);
        if let Some(byte) = self.unread.take() {
            out.extend_from_slice(&[byte]);
        }
        while out.len() < len {
            self.fill().await?;
            let n = (len - out.len()).min(self.current.len());
            out.extend_from_slice(&self.current.split_to(n));
        }
        Ok(out.freeze())
    }

    /// Discard exactly `len` bytes.
    pub async fn skip(&mut self, mut len: usize) -> Result<()> {
        if len > 0 && self.unread.take().is_some() {
            len -= 1;
        }
        while len > 0 {
            self.fill().await?;
            let n = len.min(self.current.len());
            self.current.advance(n);
            len -= n;
        }
        Ok(())
    }

    /// Read `len` characters, two bytes each when `wide`.
    pub async fn read_string(&mut self, len: usize, wide: bool) -> Result<String> {
        if wide {
            let bytes = self.read_exact(len * 2).await?;
            Ok(decode_ucs2(&bytes))
        } else {
            let bytes = self.read_exact(len).await?;
            Ok(self.charset.decode(&bytes))
        }
    }

    /// String with one byte length prefix.
    pub async fn read_b_string(&mut self, wide: bool) -> Result<String> {
        let len = self.read_u8().await? as usize;
        self.read_string(len, wide).await
    }

    /// String with two byte length prefix.
    pub async fn read_us_string(&mut self, wide: bool) -> Result<String> {
        let len = self.read_u16().await? as usize;
        self.read_string(len, wide).await
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;

    use bytes::Bytes;
    use proptest::prelude::*;

    use super::*;
    use crate::tds::{Packet, PacketType};

    fn packets(chunks: &[&[u8]]) -> VecDeque<Packet> {
        let n = chunks.len();
        chunks
            .iter()
            .enumerate()
            .map(|(i, c)| Packet::new(PacketType::Reply, 1, i as u8 + 1, i + 1 == n, Bytes::copy_from_slice(c)))
            .collect()
    }

    fn reader(chunks: &[&[u8]]) -> ResponseStream<VecDeque<Packet>> {
        ResponseStream::new(packets(chunks), Charset::default())
    }

    #[tokio::test]
    async fn values_across_boundaries() {
        let mut r = reader(&[&[0x01, 0x02], &[], &[0x03, 0x04, 0xAA], &[0xBB]]);
        assert_eq!(r.read_i32().await.unwrap(), 0x04030201);
        assert_eq!(r.read_u16().await.unwrap(), 0xBBAA);
        assert!(r.at_end().await.unwrap());
    }

    #[tokio::test]
    async fn peek_then_read() {
        let mut r = reader(&[&[0xFD], &[0x01, 0x00]]);
        assert_eq!(r.peek().await.unwrap(), 0xFD);
        assert_eq!(r.peek().await.unwrap(), 0xFD);
        assert_eq!(&r.read_exact(3).await.unwrap()[..], &[0xFD, 0x01, 0x00]);
    }

    #[tokio::test]
    async fn skip_crosses_packets() {
        let mut r = reader(&[&[1, 2, 3], &[4, 5], &[6]]);
        r.skip(4).await.unwrap();
        assert_eq!(r.read_u8().await.unwrap(), 5);
        assert_eq!(r.read_u8().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn eof_after_last_packet() {
        let mut r = reader(&[&[1]]);
        r.read_u8().await.unwrap();
        let err = r.read_u8().await.unwrap_err();
        assert!(matches!(err.kind(), crate::ErrorKind::Protocol(ProtocolError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn next_message_continues_stream() {
        let mut source = packets(&[&[1]]);
        source.extend(packets(&[&[2]]));
        let mut r = ResponseStream::new(source, Charset::default());
        assert_eq!(r.read_u8().await.unwrap(), 1);
        assert!(r.at_end().await.unwrap());
        r.next_message();
        assert_eq!(r.read_u8().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn wide_and_narrow_strings() {
        let mut r = reader(&[&[2, b'h', 0], &[b'i', 0, 3, b'c', b'a', 0xe9]]);
        assert_eq!(r.read_b_string(true).await.unwrap(), "hi");
        assert_eq!(r.read_b_string(false).await.unwrap(), "caé");
    }

    fn block_on<F: Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
    }

    proptest! {
        #[test]
        fn split_points_do_not_change_bytes(
            data in proptest::collection::vec(any::<u8>(), 1..2048),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..12),
        ) {
            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(data.len() + 1)).collect();
            points.push(0);
            points.push(data.len());
            points.sort_unstable();

            let chunks: Vec<&[u8]> = points.windows(2).map(|w| &data[w[0]..w[1]]).collect();
            let mut r = reader(&chunks);

            let read = block_on(async {
                let mut out = Vec::new();
                while !r.at_end().await.unwrap() {
                    out.push(r.read_u8().await.unwrap());
                }
                out
            });
            prop_assert_eq!(read, data);
        }

        #[test]
        fn i64_reads_match_split(
            values in proptest::collection::vec(any::<i64>(), 1..64),
            size in 1usize..24,
        ) {
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            let chunks: Vec<&[u8]> = bytes.chunks(size).collect();
            let mut r = reader(&chunks);
            let read = block_on(async {
                let mut out = Vec::new();
                for _ in 0..values.len() {
                    out.push(r.read_i64().await.unwrap());
                }
                out
            });
            prop_assert_eq!(read, values);
        }
    }
}
