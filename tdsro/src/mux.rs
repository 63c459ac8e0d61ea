//! Logical streams over one physical connection.
//!
//! There is no background task. Whichever caller blocks in [`receive`]
//! first performs the physical read under the reader lock, then either keeps
//! the packet or queues it for the stream its channel names.
//!
//! [`receive`]: Multiplexer::receive
use std::{
    collections::{HashMap, VecDeque, hash_map::Entry},
    io,
    pin::Pin,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, ready},
};

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf},
    sync::Mutex as AsyncMutex,
};

use crate::{
    ConnectionLost, Error, ResourceExhausted, Result, UsageError,
    common::{debug, lock, verbose},
    net::Socket,
    tds::Packet,
};

/// Logical stream id, carried in the packet header channel field.
pub type StreamId = u16;

/// Stream used by the login handshake, open from the start.
pub const CONTROL_STREAM: StreamId = 0;

const READ_CHUNK: usize = 4096;

/// Shared socket with per-stream packet routing.
pub struct Multiplexer {
    writer: AsyncMutex<Writer>,
    reader: AsyncMutex<Reader>,
    routes: Mutex<Routes>,
    dead: AtomicBool,
}

/// Kills the connection if dropped before the packet is fully written.
struct WriteGuard<'a> {
    mux: &'a Multiplexer,
    armed: bool,
}

impl WriteGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("packet write interrupted");
            self.mux.kill();
        }
    }
}

struct Writer {
    io: WriteHalf<Socket>,
    buf: BytesMut,
}

struct Reader {
    io: ReadHalf<Socket>,
    buf: BytesMut,
}

struct Routes {
    next: StreamId,
    limit: StreamId,
    open: HashMap<StreamId, VecDeque<Packet>>,
}

impl Multiplexer {
    pub fn new(socket: Socket) -> Multiplexer {
        Self::with_limit(socket, StreamId::MAX)
    }

    /// Create multiplexer which allocates ids in `1..=limit`.
    pub fn with_limit(socket: Socket, limit: StreamId) -> Multiplexer {
        let (read, write) = tokio::io::split(socket);
        let mut open = HashMap::new();
        open.insert(CONTROL_STREAM, VecDeque::new());
        Multiplexer {
            writer: AsyncMutex::new(Writer { io: write, buf: BytesMut::with_capacity(READ_CHUNK) }),
            reader: AsyncMutex::new(Reader { io: read, buf: BytesMut::with_capacity(READ_CHUNK) }),
            routes: Mutex::new(Routes { next: 1, limit: limit.max(1), open }),
            dead: AtomicBool::new(false),
        }
    }

    /// Returns `true` once any transport failure occurred.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Mark the connection unusable, every stream fails from now on.
    pub fn kill(&self) {
        if !self.dead.swap(true, Ordering::AcqRel) {
            debug!("connection marked dead");
        }
    }

    fn check(&self) -> Result<()> {
        match self.is_dead() {
            true => Err(ConnectionLost.into()),
            false => Ok(()),
        }
    }

    /// Allocate a fresh stream id.
    pub fn open_stream(&self) -> Result<StreamId> {
        self.check()?;
        let mut routes = lock(&self.routes);
        let limit = routes.limit;
        for _ in 0..limit {
            let id = routes.next;
            routes.next = if id >= limit { 1 } else { id + 1 };
            if let Entry::Vacant(entry) = routes.open.entry(id) {
                entry.insert(VecDeque::new());
                verbose!(id, "stream opened");
                return Ok(id);
            }
        }
        Err(ResourceExhausted.into())
    }

    /// Detach stream id from routing, dropping its queued packets.
    pub fn close_stream(&self, id: StreamId) {
        if let Some(_queue) = lock(&self.routes).open.remove(&id) {
            verbose!(id, dropped = _queue.len(), "stream closed");
        }
    }

    /// Number of open streams, the control stream included.
    pub fn open_streams(&self) -> usize {
        lock(&self.routes).open.len()
    }

    /// Write packets of one stream in order.
    ///
    /// The write lock is held for one packet at a time, so an attention
    /// signal waits behind at most one packet of another stream.
    ///
    /// Dropping the future while a packet is partly written kills the
    /// connection, the peer can no longer find the next header.
    pub async fn send(&self, packets: Vec<Packet>) -> Result<()> {
        for packet in packets {
            let mut writer = self.writer.lock().await;
            self.check()?;
            let guard = WriteGuard { mux: self, armed: true };
            if let Err(err) = writer.write(&packet).await {
                self.kill();
                return Err(Error::from(ConnectionLost).context(err.to_string()));
            }
            guard.disarm();
        }
        Ok(())
    }

    /// Send the attention signal for `id`.
    ///
    /// The caller must keep reading the stream until the server acknowledges.
    pub async fn cancel(&self, id: StreamId) -> Result<()> {
        debug!("sending attention on stream {id}");
        self.send(vec![Packet::attention(id)]).await
    }

    /// Wait for the next packet addressed to `id`.
    ///
    /// Cancel safe, a dropped call never loses a packet or corrupts framing.
    pub async fn receive(&self, id: StreamId) -> Result<Packet> {
        loop {
            if let Some(packet) = self.take(id)? {
                return Ok(packet);
            }

            let mut reader = self.reader.lock().await;

            // the previous lock holder may have read our packet
            if let Some(packet) = self.take(id)? {
                return Ok(packet);
            }

            let packet = match (ReadPacket { reader: &mut reader }).await {
                Ok(packet) => packet,
                Err(err) => {
                    self.kill();
                    return Err(match err.is_fatal() {
                        true => err,
                        false => Error::from(ConnectionLost).context(err.to_string()),
                    });
                },
            };
            if packet.channel() == id {
                return Ok(packet);
            }
            // queue before unlocking, the next lock holder may be its reader
            self.dispatch(packet);
            drop(reader);
        }
    }

    fn take(&self, id: StreamId) -> Result<Option<Packet>> {
        self.check()?;
        match lock(&self.routes).open.get_mut(&id) {
            Some(queue) => Ok(queue.pop_front()),
            None => Err(UsageError::new("stream is closed").into()),
        }
    }

    fn dispatch(&self, packet: Packet) {
        let channel = packet.channel();
        match lock(&self.routes).open.get_mut(&channel) {
            Some(queue) => queue.push_back(packet),
            None => {
                verbose!(channel, "discard packet of closed stream");
            },
        }
    }

    /// Close the write half, the connection is unusable afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.writer.lock().await.io.shutdown().await;
        self.kill();
        result.map_err(Into::into)
    }
}

impl Writer {
    async fn write(&mut self, packet: &Packet) -> io::Result<()> {
        self.buf.clear();
        packet.encode(&mut self.buf);
        verbose!(channel = packet.channel(), kind = ?packet.header.kind, len = self.buf.len(), "write");
        self.io.write_all(&self.buf).await?;
        self.io.flush().await
    }
}

pin_project_lite::pin_project! {
    /// Read exactly one packet from the socket.
    ///
    /// Partial bytes stay in the reader buffer when dropped.
    struct ReadPacket<'r> {
        reader: &'r mut Reader,
    }
}

impl Future for ReadPacket<'_> {
    type Output = Result<Packet>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.project();
        let reader = &mut **me.reader;

        loop {
            if let Some(packet) = Packet::decode(&mut reader.buf)? {
                return Poll::Ready(Ok(packet));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut reader.io).poll_read(cx, &mut buf))?;

            let filled = buf.filled();
            if filled.is_empty() {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()));
            }
            reader.buf.extend_from_slice(filled);
        }
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("open_streams", &self.open_streams())
            .field("dead", &self.is_dead())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::{ErrorKind, tds::PacketType};

    fn pair(limit: StreamId) -> (Multiplexer, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (Multiplexer::with_limit(Socket::from_stream(client), limit), server)
    }

    async fn write_reply(server: &mut DuplexStream, channel: u16, payload: &'static [u8]) {
        let mut buf = BytesMut::new();
        Packet::new(PacketType::Reply, channel, 1, true, Bytes::from_static(payload)).encode(&mut buf);
        server.write_all(&buf).await.unwrap();
    }

    #[tokio::test]
    async fn routes_by_channel() {
        let (mux, mut server) = pair(StreamId::MAX);
        let a = mux.open_stream().unwrap();
        let b = mux.open_stream().unwrap();
        assert_ne!(a, b);

        write_reply(&mut server, a, b"a1").await;
        write_reply(&mut server, b, b"b1").await;
        write_reply(&mut server, a, b"a2").await;

        // b reads past the first packet of a, which gets queued
        assert_eq!(&mux.receive(b).await.unwrap().payload[..], b"b1");
        assert_eq!(&mux.receive(a).await.unwrap().payload[..], b"a1");
        assert_eq!(&mux.receive(a).await.unwrap().payload[..], b"a2");
    }

    #[tokio::test]
    async fn concurrent_receivers() {
        let (mux, mut server) = pair(StreamId::MAX);
        let mux = std::sync::Arc::new(mux);
        let a = mux.open_stream().unwrap();
        let b = mux.open_stream().unwrap();

        let ta = tokio::spawn({
            let mux = mux.clone();
            async move { mux.receive(a).await.unwrap().payload }
        });
        let tb = tokio::spawn({
            let mux = mux.clone();
            async move { mux.receive(b).await.unwrap().payload }
        });

        write_reply(&mut server, b, b"for b").await;
        write_reply(&mut server, a, b"for a").await;

        assert_eq!(&ta.await.unwrap()[..], b"for a");
        assert_eq!(&tb.await.unwrap()[..], b"for b");
    }

    #[tokio::test]
    async fn closed_stream_packets_are_discarded() {
        let (mux, mut server) = pair(StreamId::MAX);
        let a = mux.open_stream().unwrap();
        let b = mux.open_stream().unwrap();
        mux.close_stream(b);
        mux.close_stream(b);

        write_reply(&mut server, b, b"late").await;
        write_reply(&mut server, a, b"mine").await;

        assert_eq!(&mux.receive(a).await.unwrap().payload[..], b"mine");
        assert!(mux.receive(b).await.is_err());
    }

    #[tokio::test]
    async fn id_space_exhaustion() {
        let (mux, _server) = pair(2);
        let a = mux.open_stream().unwrap();
        let b = mux.open_stream().unwrap();
        let err = mux.open_stream().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ResourceExhausted(_)));

        mux.close_stream(a);
        assert_eq!(mux.open_stream().unwrap(), a);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn transport_failure_is_fatal() {
        let (mux, server) = pair(StreamId::MAX);
        let a = mux.open_stream().unwrap();
        drop(server);

        let err = mux.receive(a).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConnectionLost(_)));
        assert!(mux.is_dead());

        let err = mux.open_stream().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn dropped_send_kills_connection() {
        // the peer never reads, the write stalls once the pipe is full
        let (client, _server) = tokio::io::duplex(100);
        let mux = Multiplexer::new(Socket::from_stream(client));
        let a = mux.open_stream().unwrap();
        let packet = Packet::new(PacketType::SqlBatch, a, 1, true, Bytes::from(vec![0u8; 1000]));

        let send = tokio::time::timeout(Duration::from_millis(50), mux.send(vec![packet]));
        assert!(send.await.is_err());
        assert!(mux.is_dead());

        let packet = Packet::new(PacketType::SqlBatch, a, 1, true, Bytes::from_static(b"x"));
        let err = mux.send(vec![packet]).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn attention_is_written() {
        let (mux, mut server) = pair(StreamId::MAX);
        let a = mux.open_stream().unwrap();
        mux.cancel(a).await.unwrap();

        let mut header = [0u8; 8];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], PacketType::Attention as u8);
        assert_eq!(header[1], 0x01);
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), 8);
        assert_eq!(u16::from_be_bytes([header[4], header[5]]), a);
    }
}
