//! Session and its protocol state.
//!
//! A [`Session`] owns one physical connection. Requests open logical streams
//! on the connection [`Multiplexer`], and the server environment they report
//! (database, packet size, collation, transaction descriptor) is kept in one
//! [`Environment`] shared by every stream.
use std::sync::{Arc, Mutex};

use crate::{
    Result,
    common::{debug, lock},
    mux::Multiplexer,
    net::Socket,
    tds::{Charset, Dialect, ServerFlavor, TdsVersion, packet::{MAX_PACKET_SIZE, MIN_PACKET_SIZE}},
    token::EnvChange,
};

mod cache;
mod config;
mod login;
mod request;
mod stream;
mod transaction;

pub use config::{Config, ConfigError};
pub use login::LoginError;
pub use request::{Batch, ProcedureCall, Request};
pub use stream::{CancelHandle, LogicalStream};
pub use transaction::Savepoint;

use cache::ProcCache;

/// State shared by a session and its streams.
pub(crate) struct Shared {
    pub(crate) mux: Multiplexer,
    pub(crate) env: Mutex<Environment>,
    pub(crate) config: Config,
}

/// Session values the server may change.
#[derive(Debug)]
pub(crate) struct Environment {
    pub(crate) dialect: Dialect,
    pub(crate) packet_size: usize,
    pub(crate) database: String,
    pub(crate) language: String,
    pub(crate) charset: Charset,
    pub(crate) collation: Option<[u8; 5]>,
    /// Current transaction descriptor, zero outside a transaction.
    pub(crate) descriptor: [u8; 8],
    pub(crate) depth: u32,
    /// Ids of established savepoints, oldest first.
    pub(crate) savepoints: Vec<u32>,
    pub(crate) next_savepoint: u32,
    pub(crate) cache: ProcCache,
}

impl Environment {
    fn new(config: &Config) -> Environment {
        Environment {
            dialect: Dialect::new(config.flavor, config.version),
            packet_size: config.packet_size.into(),
            database: config.database.clone(),
            language: config.language.clone(),
            charset: Charset::from_server_name(&config.charset),
            collation: None,
            descriptor: [0; 8],
            depth: 0,
            savepoints: Vec::new(),
            next_savepoint: 0,
            cache: ProcCache::new(config.proc_cache),
        }
    }

    /// Apply a server environment change, returns the charset now in effect.
    pub(crate) fn apply(&mut self, change: &EnvChange) -> Charset {
        match change {
            EnvChange::Database { new, .. } => {
                debug!("database changed to {new}");
                self.database.clone_from(new);
            },
            EnvChange::Language(language) => self.language.clone_from(language),
            EnvChange::Charset(name) => {
                debug!("charset changed to {name}");
                self.charset = Charset::from_server_name(name);
            },
            EnvChange::PacketSize(size) => {
                let size = (*size as usize).clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE);
                debug!("packet size changed to {size}");
                self.packet_size = size;
            },
            EnvChange::Collation(bytes) => {
                if let Ok(collation) = <[u8; 5]>::try_from(&bytes[..]) {
                    self.collation = Some(collation);
                    self.charset = Charset::from_collation(&collation);
                }
            },
            EnvChange::BeginTransaction(descriptor) => {
                let len = descriptor.len().min(8);
                self.descriptor = [0; 8];
                self.descriptor[..len].copy_from_slice(&descriptor[..len]);
            },
            EnvChange::CommitTransaction => self.descriptor = [0; 8],
            EnvChange::RollbackTransaction => {
                if self.depth > 0 {
                    debug!("transaction rolled back by server");
                }
                self.reset_transaction();
                self.cache.rollback();
            },
            EnvChange::Locale(_) | EnvChange::ComparisonFlags(_) | EnvChange::Other(_) => {},
        }
        self.charset
    }

    fn reset_transaction(&mut self) {
        self.descriptor = [0; 8];
        self.depth = 0;
        self.savepoints.clear();
    }
}

/// Connection state as seen from the session.
///
/// Login completes inside [`Session::connect`], a session is never observed
/// before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Connection closed or lost.
    Disconnected,
    /// No exchange in progress.
    Ready,
    /// At least one logical stream is open.
    Executing,
}

/// A logged in connection to the server.
///
/// Cheap to clone, clones share the connection. Exchanges of different
/// clones are multiplexed as logical streams.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Connect over TCP and log in.
    pub async fn connect(config: Config) -> Result<Session> {
        config.validate()?;
        let socket = Socket::connect_tcp(&config.host, config.port).await?;
        Self::connect_inner(socket, config).await
    }

    /// Log in over an already established transport.
    pub async fn connect_with(socket: Socket, config: Config) -> Result<Session> {
        config.validate()?;
        Self::connect_inner(socket, config).await
    }

    async fn connect_inner(socket: Socket, config: Config) -> Result<Session> {
        let shared = Arc::new(Shared {
            mux: Multiplexer::with_limit(socket, config.max_streams),
            env: Mutex::new(Environment::new(&config)),
            config,
        });

        login::login(&shared).await?;
        Ok(Session { shared })
    }

    /// Send a request, the response is read from the returned stream.
    pub async fn execute(&self, request: impl Into<Request>) -> Result<LogicalStream> {
        request::execute(&self.shared, request.into()).await
    }

    pub fn state(&self) -> State {
        if self.shared.mux.is_dead() {
            State::Disconnected
        } else if self.shared.mux.open_streams() > 1 {
            // the control stream is always routed
            State::Executing
        } else {
            State::Ready
        }
    }

    /// Negotiated packet size.
    pub fn packet_size(&self) -> usize {
        lock(&self.shared.env).packet_size
    }

    /// Current database.
    pub fn database(&self) -> String {
        lock(&self.shared.env).database.clone()
    }

    pub fn language(&self) -> String {
        lock(&self.shared.env).language.clone()
    }

    /// Charset of single byte character data.
    pub fn charset(&self) -> Charset {
        lock(&self.shared.env).charset
    }

    /// Default collation of the current database, TDS 7.1 and later.
    pub fn collation(&self) -> Option<[u8; 5]> {
        lock(&self.shared.env).collation
    }

    pub fn version(&self) -> TdsVersion {
        lock(&self.shared.env).dialect.version
    }

    pub fn flavor(&self) -> ServerFlavor {
        lock(&self.shared.env).dialect.flavor
    }

    pub fn dialect(&self) -> Dialect {
        lock(&self.shared.env).dialect
    }

    /// Number of open transactions, `0` in autocommit mode.
    pub fn transaction_depth(&self) -> u32 {
        lock(&self.shared.env).depth
    }

    pub fn autocommit(&self) -> bool {
        self.transaction_depth() == 0
    }

    /// Number of prepared statement handles currently cached.
    pub fn cached_procedures(&self) -> usize {
        lock(&self.shared.env).cache.len()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Shut the connection down, every stream fails afterwards.
    pub async fn close(&self) -> Result<()> {
        debug!("closing session");
        self.shared.mux.shutdown().await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("env", &*lock(&self.shared.env))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::{BufMut, Bytes, BytesMut};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::{
        ColumnValue, ErrorKind, Param, SqlType, Value,
        ext::BufMutExt,
        tds::{Packet, PacketType, token as tag, token::DoneStatus},
        token::Token,
    };

    /// Scripted server end of an in-memory connection.
    pub(crate) struct MockServer {
        io: DuplexStream,
        buf: BytesMut,
    }

    /// Request message read by [`MockServer`].
    pub(crate) struct Received {
        pub(crate) kind: PacketType,
        pub(crate) channel: u16,
        pub(crate) payload: Bytes,
    }

    impl MockServer {
        pub(crate) async fn read(&mut self) -> Received {
            let mut payload = BytesMut::new();
            loop {
                if let Some(packet) = Packet::decode(&mut self.buf).unwrap() {
                    payload.extend_from_slice(&packet.payload);
                    if packet.is_last() {
                        let received = Received {
                            kind: packet.header.kind,
                            channel: packet.channel(),
                            payload: payload.freeze(),
                        };
                        return received;
                    }
                    continue;
                }
                let n = self.io.read_buf(&mut self.buf).await.unwrap();
                assert!(n > 0, "client closed the connection");
            }
        }

        pub(crate) async fn reply(&mut self, channel: u16, payload: &[u8]) {
            let packet = Packet::new(PacketType::Reply, channel, 1, true, Bytes::copy_from_slice(payload));
            let mut buf = BytesMut::new();
            packet.encode(&mut buf);
            self.io.write_all(&buf).await.unwrap();
        }

        /// Read the login record and accept it.
        pub(crate) async fn accept_login(&mut self) {
            let login = self.read().await;
            assert_eq!(login.kind, PacketType::Login7);
            let mut buf = BytesMut::new();
            envchange(&mut buf, tag::env::PACKET_SIZE, "4096", "512");
            done(&mut buf, tag::DONE, DoneStatus::FINAL, 0);
            self.reply(0, &buf).await;
        }
    }

    pub(crate) fn envchange(buf: &mut BytesMut, ty: u8, new: &str, old: &str) {
        let mut body = BytesMut::new();
        body.put_u8(ty);
        body.put_b_ucs2(new);
        body.put_b_ucs2(old);
        buf.put_u8(tag::ENVCHANGE);
        buf.put_u16_le(body.len() as u16);
        buf.put_slice(&body);
    }

    pub(crate) fn done(buf: &mut BytesMut, token: u8, status: u16, count: u32) {
        buf.put_u8(token);
        buf.put_u16_le(status);
        buf.put_u16_le(0xC1);
        buf.put_u32_le(count);
    }

    pub(crate) fn error(buf: &mut BytesMut, number: i32, severity: u8, text: &str) {
        let mut body = BytesMut::new();
        body.put_i32_le(number);
        body.put_u8(1);
        body.put_u8(severity);
        body.put_us_ucs2(text);
        body.put_b_ucs2("mock");
        body.put_b_ucs2("");
        body.put_u16_le(1);
        buf.put_u8(if severity > 10 { tag::ERROR } else { tag::INFO });
        buf.put_u16_le(body.len() as u16);
        buf.put_slice(&body);
    }

    /// RETURNVALUE of a nullable int.
    pub(crate) fn return_int(buf: &mut BytesMut, name: &str, value: i32) {
        buf.put_u8(tag::RETURN_VALUE);
        buf.put_u16_le(1);
        buf.put_b_ucs2(name);
        buf.put_u8(1);
        buf.put_u16_le(0);
        buf.put_u16_le(0x01);
        buf.put_u8(0x26);
        buf.put_u8(4);
        buf.put_u8(4);
        buf.put_i32_le(value);
    }

    /// Finish `response` with a final DONE, then reply on `channel`.
    async fn respond(server: &mut MockServer, channel: u16, mut response: BytesMut) {
        done(&mut response, tag::DONE, DoneStatus::FINAL, 0);
        server.reply(channel, &response).await;
    }

    fn config() -> Config {
        Config::default().packet_size(512).timeout(Some(Duration::from_secs(5)))
    }

    pub(crate) async fn connect(config: Config) -> (Session, MockServer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut server = MockServer { io: server, buf: BytesMut::new() };
        let (session, ()) = tokio::join!(
            Session::connect_with(Socket::from_stream(client), config),
            server.accept_login(),
        );
        (session.unwrap(), server)
    }

    #[tokio::test]
    async fn login_applies_packet_size() {
        let (session, _server) = connect(config()).await;
        assert_eq!(session.packet_size(), 4096);
        assert_eq!(session.state(), State::Ready);
        assert!(session.autocommit());
    }

    #[tokio::test]
    async fn login_rejected() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut server = MockServer { io: server, buf: BytesMut::new() };
        let reject = async {
            server.read().await;
            let mut buf = BytesMut::new();
            error(&mut buf, 18456, 14, "Login failed for user 'sa'.");
            done(&mut buf, tag::DONE, DoneStatus::ERROR, 0);
            server.reply(0, &buf).await;
        };
        let (session, ()) = tokio::join!(Session::connect_with(Socket::from_stream(client), config()), reject);

        let err = session.unwrap_err();
        let ErrorKind::Login(LoginError::Rejected(chain)) = err.kind() else { panic!("{err}") };
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.iter().next().unwrap().number, 18456);
    }

    #[tokio::test]
    async fn output_parameter() {
        let (session, mut server) = connect(config()).await;
        let call = ProcedureCall::new("answer").param(Param::output(SqlType::Int).named("@out"));

        let (stream, request) = tokio::join!(session.execute(call), server.read());
        let mut stream = stream.unwrap();
        assert_eq!(request.kind, PacketType::Rpc);
        assert_eq!(session.state(), State::Executing);

        let mut buf = BytesMut::new();
        return_int(&mut buf, "@out", 42);
        respond(&mut server, request.channel, buf).await;

        stream.finish().await.unwrap();
        let param = stream.param_by_name("out").unwrap();
        assert_eq!(param.output_value(), &ColumnValue::Value(Value::Int(42)));
        assert!(!param.was_null());
        assert_eq!(session.state(), State::Ready);
    }

    #[tokio::test]
    async fn server_error_keeps_session() {
        let (session, mut server) = connect(config()).await;

        let (stream, request) = tokio::join!(session.execute("select * from missing"), server.read());
        let mut stream = stream.unwrap();
        assert_eq!(request.kind, PacketType::SqlBatch);

        let mut buf = BytesMut::new();
        error(&mut buf, 208, 20, "Invalid object name 'missing'.");
        done(&mut buf, tag::DONE, DoneStatus::ERROR, 0);
        server.reply(request.channel, &buf).await;

        let err = stream.finish().await.unwrap_err();
        assert!(!err.is_fatal());
        let chain = err.server_messages().unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.first_error().unwrap().severity, 20);
        assert_eq!(session.state(), State::Ready);

        let (stream, request) = tokio::join!(session.execute("select 1"), server.read());
        let mut stream = stream.unwrap();
        let mut buf = BytesMut::new();
        done(&mut buf, tag::DONE, DoneStatus::COUNT, 1);
        server.reply(request.channel, &buf).await;
        assert_eq!(stream.finish().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancel_mid_receive() {
        let (session, mut server) = connect(config()).await;

        let (stream, request) = tokio::join!(session.execute("waitfor delay '01:00'"), server.read());
        let mut stream = stream.unwrap();
        let handle = stream.cancel_handle();

        let reading = tokio::spawn(async move { stream.next_token().await.map(|_| ()) });
        handle.cancel().await.unwrap();

        let attention = server.read().await;
        assert_eq!(attention.kind, PacketType::Attention);
        assert_eq!(attention.channel, request.channel);
        let mut buf = BytesMut::new();
        done(&mut buf, tag::DONE, DoneStatus::ATTN, 0);
        server.reply(request.channel, &buf).await;

        let err = reading.await.unwrap().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Cancelled(_)));
        assert_eq!(session.state(), State::Ready);

        let (stream, request) = tokio::join!(session.execute("select 1"), server.read());
        let mut stream = stream.unwrap();
        respond(&mut server, request.channel, BytesMut::new()).await;
        stream.finish().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_discards_pending_tokens() {
        let (session, mut server) = connect(config()).await;

        let (stream, request) = tokio::join!(session.execute("select 1"), server.read());
        let mut stream = stream.unwrap();

        // response arrives complete before the attention is seen
        let mut buf = BytesMut::new();
        error(&mut buf, 5701, 0, "changed database context");
        done(&mut buf, tag::DONE, DoneStatus::COUNT, 1);
        server.reply(request.channel, &buf).await;
        stream.cancel().await.unwrap();

        server.read().await;
        let mut buf = BytesMut::new();
        done(&mut buf, tag::DONE, DoneStatus::ATTN, 0);
        server.reply(request.channel, &buf).await;

        let err = stream.next_token().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Cancelled(_)));
        assert!(!stream.has_more());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_sends_attention() {
        let (session, mut server) = connect(config()).await;

        let (stream, request) = tokio::join!(session.execute("waitfor delay '01:00'"), server.read());
        let mut stream = stream.unwrap();
        stream.set_timeout(Some(Duration::from_millis(100)));

        let ack = async {
            let attention = server.read().await;
            assert_eq!(attention.kind, PacketType::Attention);
            let mut buf = BytesMut::new();
            done(&mut buf, tag::DONE, DoneStatus::ATTN, 0);
            server.reply(request.channel, &buf).await;
        };
        let (result, ()) = tokio::join!(stream.next_token(), ack);

        let err = result.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Timeout(_)));
        assert_eq!(session.state(), State::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_cancel_kills_connection() {
        let (session, mut server) = connect(config().cancel_grace(Duration::from_secs(1))).await;

        let (stream, _request) = tokio::join!(session.execute("select 1"), server.read());
        let mut stream = stream.unwrap();
        stream.cancel().await.unwrap();
        server.read().await;

        let err = stream.next_token().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.state(), State::Disconnected);
    }

    #[tokio::test]
    async fn streams_are_routed_by_channel() {
        let (session, mut server) = connect(config()).await;

        let (a, first) = tokio::join!(session.execute("select 'a'"), server.read());
        let (b, second) = tokio::join!(session.execute("select 'b'"), server.read());
        let (mut a, mut b) = (a.unwrap(), b.unwrap());
        assert_ne!(first.channel, second.channel);

        let mut buf = BytesMut::new();
        done(&mut buf, tag::DONE, DoneStatus::COUNT, 2);
        server.reply(second.channel, &buf).await;
        let mut buf = BytesMut::new();
        done(&mut buf, tag::DONE, DoneStatus::COUNT, 1);
        server.reply(first.channel, &buf).await;

        assert_eq!(a.finish().await.unwrap(), 1);
        assert_eq!(b.finish().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn prepared_handle_is_cached() {
        let (session, mut server) = connect(config()).await;
        let call = || ProcedureCall::prepared("select * from t where id = ?").bind(7);

        let (stream, request) = tokio::join!(session.execute(call()), server.read());
        let mut stream = stream.unwrap();
        // procedure id follows the 0xFFFF marker
        assert_eq!(&request.payload[..4], &[0xFF, 0xFF, 13, 0]);

        let mut buf = BytesMut::new();
        return_int(&mut buf, "@handle", 3);
        respond(&mut server, request.channel, buf).await;
        stream.finish().await.unwrap();
        assert_eq!(session.cached_procedures(), 1);

        let (stream, request) = tokio::join!(session.execute(call()), server.read());
        let mut stream = stream.unwrap();
        assert_eq!(&request.payload[..4], &[0xFF, 0xFF, 12, 0]);
        respond(&mut server, request.channel, BytesMut::new()).await;
        stream.finish().await.unwrap();
    }

    #[tokio::test]
    async fn server_rollback_resets_transaction() {
        let (session, mut server) = connect(config()).await;

        let (result, request) = tokio::join!(session.begin_transaction(), server.read());
        respond(&mut server, request.channel, BytesMut::new()).await;
        result.unwrap();
        assert_eq!(session.transaction_depth(), 1);

        let (stream, request) = tokio::join!(session.execute("select 1/0"), server.read());
        let mut stream = stream.unwrap();
        let mut buf = BytesMut::new();
        buf.put_u8(tag::ENVCHANGE);
        buf.put_u16_le(3);
        buf.put_slice(&[tag::env::ROLLBACK_TRANSACTION, 0, 0]);
        respond(&mut server, request.channel, buf).await;
        stream.finish().await.unwrap();

        assert!(session.autocommit());
    }

    #[tokio::test]
    async fn dropped_stream_is_drained() {
        let (session, mut server) = connect(config()).await;

        let (stream, request) = tokio::join!(session.execute("select 1"), server.read());
        drop(stream.unwrap());

        let attention = server.read().await;
        assert_eq!(attention.kind, PacketType::Attention);
        let mut buf = BytesMut::new();
        done(&mut buf, tag::DONE, DoneStatus::ATTN, 0);
        server.reply(request.channel, &buf).await;

        while session.state() == State::Executing {
            tokio::task::yield_now().await;
        }
        assert_eq!(session.state(), State::Ready);

        let next = session.execute("select 2");
        let (stream, request) = tokio::join!(next, server.read());
        let mut stream = stream.unwrap();
        respond(&mut server, request.channel, BytesMut::new()).await;
        assert!(matches!(stream.next_token().await.unwrap(), Some(Token::Done(_))));
    }
}
