//! Request messages.
//!
//! - [`Request`]
//! - [`Batch`]
//! - [`ProcedureCall`]
use bytes::{BufMut, BytesMut};
use std::sync::Arc;

use super::{Shared, cache::ProcCache, stream::LogicalStream};
use crate::{
    Result,
    codec::RequestStream,
    common::{lock, verbose},
    encode::{self, EncodeContext},
    error::UsageError,
    ext::BufMutExt,
    mux::StreamId,
    param::{Param, SqlType},
    sql,
    tds::{Packet, PacketType, ServerFlavor, token::{proc_id, tm}},
    value::Value,
};

/// One exchange sent with [`Session::execute`][super::Session::execute].
#[derive(Clone, Debug)]
pub enum Request {
    Batch(Batch),
    Rpc(ProcedureCall),
}

impl From<Batch> for Request {
    fn from(value: Batch) -> Self {
        Self::Batch(value)
    }
}

impl From<ProcedureCall> for Request {
    fn from(value: ProcedureCall) -> Self {
        Self::Rpc(value)
    }
}

impl From<&str> for Request {
    fn from(value: &str) -> Self {
        Self::Batch(Batch::new(value))
    }
}

impl From<String> for Request {
    fn from(value: String) -> Self {
        Self::Batch(Batch::new(value))
    }
}

/// SQL text, with `?` placeholders replaced by literals of the bound values.
#[derive(Clone, Debug)]
pub struct Batch {
    sql: String,
    params: Vec<Param>,
}

impl Batch {
    pub fn new(sql: impl Into<String>) -> Batch {
        Batch { sql: sql.into(), params: Vec::new() }
    }

    /// Bind the value of the next placeholder.
    pub fn bind(mut self, value: impl Into<Value>) -> Batch {
        self.params.push(Param::input(value));
        self
    }

    /// Bind NULL to the next placeholder.
    pub fn bind_null(mut self, ty: SqlType) -> Batch {
        self.params.push(Param::null(ty));
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

#[derive(Clone, Debug)]
enum Target {
    Name(String),
    Id(u16),
    Prepared(String),
}

/// Remote procedure call with an ordered parameter list.
#[derive(Clone, Debug)]
pub struct ProcedureCall {
    target: Target,
    params: Vec<Param>,
}

impl ProcedureCall {
    /// Call procedure by name.
    pub fn new(name: impl Into<String>) -> ProcedureCall {
        Self::with_target(Target::Name(name.into()))
    }

    /// Call a well known system procedure by id, SQL Server 7.1 or later.
    pub fn by_id(id: u16) -> ProcedureCall {
        Self::with_target(Target::Id(id))
    }

    /// Prepared statement.
    ///
    /// `?` placeholders are numbered `@P0`, `@P1` and so on. The statement
    /// is prepared on first execution and the server handle reused while the
    /// session keeps it cached.
    pub fn prepared(sql: impl Into<String>) -> ProcedureCall {
        Self::with_target(Target::Prepared(sql.into()))
    }

    fn with_target(target: Target) -> ProcedureCall {
        ProcedureCall { target, params: Vec::new() }
    }

    /// Append a parameter.
    pub fn param(mut self, param: Param) -> ProcedureCall {
        self.params.push(param);
        self
    }

    /// Append an input parameter.
    pub fn bind(self, value: impl Into<Value>) -> ProcedureCall {
        self.param(Param::input(value))
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }
}

/// Transaction control commands.
#[derive(Clone, Debug)]
pub(crate) enum Command {
    Begin,
    Commit,
    Rollback(Option<String>),
    Save(String),
}

impl Command {
    fn sql(&self) -> String {
        match self {
            Self::Begin => "BEGIN TRAN".into(),
            Self::Commit => "COMMIT TRAN".into(),
            Self::Rollback(None) => "ROLLBACK TRAN".into(),
            Self::Rollback(Some(name)) => format!("ROLLBACK TRAN {name}"),
            Self::Save(name) => format!("SAVE TRAN {name}"),
        }
    }
}

/// Encoded message waiting for a stream id.
struct Message {
    kind: PacketType,
    payload: BytesMut,
    params: Vec<Param>,
    /// Cache key of a statement being prepared.
    prepare: Option<String>,
}

impl Message {
    fn new(kind: PacketType, payload: BytesMut, params: Vec<Param>) -> Message {
        Message { kind, payload, params, prepare: None }
    }

    fn packets(&self, channel: StreamId, packet_size: usize) -> Vec<Packet> {
        let mut out = RequestStream::new(self.kind, channel, packet_size);
        out.put_slice(&self.payload);
        out.finish()
    }
}

/// Values of the session environment a message is encoded with.
struct Snapshot {
    ctx: EncodeContext,
    descriptor: [u8; 8],
    packet_size: usize,
}

impl Snapshot {
    fn new(shared: &Shared) -> Snapshot {
        let env = lock(&shared.env);
        let mut ctx = EncodeContext::new(env.dialect);
        ctx.charset = env.charset;
        if let Some(collation) = env.collation {
            ctx.collation = collation;
        }
        Snapshot { ctx, descriptor: env.descriptor, packet_size: env.packet_size }
    }

    fn flavor(&self) -> ServerFlavor {
        self.ctx.dialect.flavor
    }
}

/// Encode `request`, send it on a fresh stream and return the stream.
pub(crate) async fn execute(shared: &Arc<Shared>, request: Request) -> Result<LogicalStream> {
    let snapshot = Snapshot::new(shared);
    let message = match request {
        Request::Batch(batch) => batch_message(&snapshot, batch)?,
        Request::Rpc(call) => rpc_message(shared, &snapshot, call)?,
    };
    send(shared, &snapshot, message).await
}

/// Send a transaction control command.
pub(crate) async fn transaction(shared: &Arc<Shared>, command: Command) -> Result<LogicalStream> {
    let snapshot = Snapshot::new(shared);
    let message = match snapshot.ctx.dialect.has_transaction_manager() {
        true => tm_message(&snapshot, &command),
        false => batch_message(&snapshot, Batch::new(command.sql()))?,
    };
    send(shared, &snapshot, message).await
}

async fn send(shared: &Arc<Shared>, snapshot: &Snapshot, message: Message) -> Result<LogicalStream> {
    let mux = &shared.mux;
    let id = mux.open_stream()?;
    verbose!(id, kind = ?message.kind, len = message.payload.len(), "request");

    let packets = message.packets(id, snapshot.packet_size);
    if let Err(err) = mux.send(packets).await {
        mux.close_stream(id);
        return Err(err);
    }

    Ok(LogicalStream::new(shared.clone(), id, message.params, message.prepare))
}

// ===== Batch =====

fn batch_message(snapshot: &Snapshot, batch: Batch) -> Result<Message> {
    let Batch { sql, params } = batch;
    let text = match params.is_empty() {
        true => sql,
        false => sql::substitute(&sql, &params, &snapshot.ctx.dialect)?,
    };
    verbose!(sql = sql::preview(&text), "batch");

    let mut buf = BytesMut::with_capacity(text.len() * 2 + 22);
    let kind = match snapshot.flavor() {
        ServerFlavor::Sybase => {
            encode::language(&mut buf, &snapshot.ctx, &text);
            PacketType::Normal
        },
        ServerFlavor::SqlServer => {
            all_headers(&mut buf, snapshot);
            buf.put_ucs2(&text);
            PacketType::SqlBatch
        },
    };
    Ok(Message::new(kind, buf, Vec::new()))
}

/// Transaction descriptor header, TDS 7.2.
fn all_headers(buf: &mut BytesMut, snapshot: &Snapshot) {
    if !snapshot.ctx.dialect.has_all_headers() {
        return;
    }
    buf.put_u32_le(22);
    buf.put_u32_le(18);
    buf.put_u16_le(2);
    buf.put_slice(&snapshot.descriptor);
    buf.put_u32_le(1);
}

// ===== Rpc =====

fn rpc_message(shared: &Shared, snapshot: &Snapshot, call: ProcedureCall) -> Result<Message> {
    let ProcedureCall { target, params } = call;
    match target {
        Target::Prepared(sql) => prepared(shared, snapshot, sql, params),
        target => rpc(snapshot, &target, &[], params),
    }
}

fn rpc(snapshot: &Snapshot, target: &Target, prefix: &[Param], params: Vec<Param>) -> Result<Message> {
    let ctx = &snapshot.ctx;
    let mut buf = BytesMut::new();

    let kind = match snapshot.flavor() {
        ServerFlavor::Sybase => {
            let Target::Name(name) = target else {
                return Err(UsageError::new("procedure ids need SQL Server 7.1 or later").into());
            };
            encode::dbrpc(&mut buf, ctx, name, !params.is_empty());
            encode::sybase_params(&mut buf, ctx, &params)?;
            PacketType::Normal
        },
        ServerFlavor::SqlServer => {
            all_headers(&mut buf, snapshot);
            match target {
                Target::Id(id) if ctx.dialect.has_proc_ids() => {
                    buf.put_u16_le(0xFFFF);
                    buf.put_u16_le(*id);
                },
                Target::Id(id) => match proc_name(*id) {
                    Some(name) => buf.put_us_ucs2(name),
                    None => return Err(UsageError::new("procedure ids need SQL Server 7.1 or later").into()),
                },
                Target::Name(name) | Target::Prepared(name) => buf.put_us_ucs2(name),
            }
            // option flags
            buf.put_u16_le(0);
            for param in prefix.iter().chain(&params) {
                encode::rpc_param(&mut buf, ctx, param)?;
            }
            PacketType::Rpc
        },
    };

    Ok(Message::new(kind, buf, params))
}

fn proc_name(id: u16) -> Option<&'static str> {
    match id {
        proc_id::SP_EXECUTE => Some("sp_execute"),
        proc_id::SP_PREPEXEC => Some("sp_prepexec"),
        _ => None,
    }
}

fn prepared(shared: &Shared, snapshot: &Snapshot, sql: String, params: Vec<Param>) -> Result<Message> {
    if snapshot.flavor() == ServerFlavor::Sybase {
        if params.iter().any(Param::is_output) {
            return Err(UsageError::new("output parameters need a procedure call on sybase").into());
        }
        return batch_message(snapshot, Batch { sql, params });
    }

    let (text, count) = sql::number_placeholders(&sql);
    if count > 0 && count != params.len() {
        return Err(UsageError::new("placeholder count does not match parameter count").into());
    }
    let declarations = sql::declarations(&params);
    let key = ProcCache::key(&text, &declarations);
    let cached = lock(&shared.env).cache.get(&key);

    match cached {
        Some(handle) => {
            verbose!(handle, "execute prepared");
            let prefix = [Param::input(handle)];
            rpc(snapshot, &Target::Id(proc_id::SP_EXECUTE), &prefix, params)
        },
        None => {
            verbose!(sql = sql::preview(&text), "prepare");
            let prefix = [
                Param::output(SqlType::Int).named("handle"),
                Param::input(declarations),
                Param::input(text),
            ];
            let mut message = rpc(snapshot, &Target::Id(proc_id::SP_PREPEXEC), &prefix, params)?;
            message.prepare = Some(key);
            Ok(message)
        },
    }
}

// ===== Transaction manager =====

fn tm_message(snapshot: &Snapshot, command: &Command) -> Message {
    let mut buf = BytesMut::with_capacity(64);
    all_headers(&mut buf, snapshot);
    match command {
        Command::Begin => {
            buf.put_u16_le(tm::BEGIN);
            // isolation level unchanged
            buf.put_u8(0);
            buf.put_b_ucs2("");
        },
        Command::Commit => {
            buf.put_u16_le(tm::COMMIT);
            buf.put_b_ucs2("");
            buf.put_u8(0);
        },
        Command::Rollback(name) => {
            buf.put_u16_le(tm::ROLLBACK);
            buf.put_b_ucs2(name.as_deref().unwrap_or_default());
            buf.put_u8(0);
        },
        Command::Save(name) => {
            buf.put_u16_le(tm::SAVE);
            buf.put_b_ucs2(name);
        },
    }
    Message::new(PacketType::TransactionManager, buf, Vec::new())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tds::{Dialect, TdsVersion};

    fn snapshot(flavor: ServerFlavor, version: TdsVersion) -> Snapshot {
        Snapshot {
            ctx: EncodeContext::new(Dialect::new(flavor, version)),
            descriptor: [1, 2, 3, 4, 5, 6, 7, 8],
            packet_size: 4096,
        }
    }

    #[test]
    fn batch_with_all_headers() {
        let s = snapshot(ServerFlavor::SqlServer, TdsVersion::V72);
        let message = batch_message(&s, Batch::new("go")).unwrap();
        assert_eq!(message.kind, PacketType::SqlBatch);
        assert_eq!(
            &message.payload[..],
            &[22, 0, 0, 0, 18, 0, 0, 0, 2, 0, 1, 2, 3, 4, 5, 6, 7, 8, 1, 0, 0, 0, b'g', 0, b'o', 0]
        );

        let s = snapshot(ServerFlavor::SqlServer, TdsVersion::V71);
        let message = batch_message(&s, Batch::new("go")).unwrap();
        assert_eq!(&message.payload[..], &[b'g', 0, b'o', 0]);
    }

    #[test]
    fn sybase_batch_is_language_token() {
        let s = snapshot(ServerFlavor::Sybase, TdsVersion::V50);
        let message = batch_message(&s, Batch::new("select ?").bind(1i32)).unwrap();
        assert_eq!(message.kind, PacketType::Normal);
        assert_eq!(&message.payload[..], b"\x21\x09\x00\x00\x00\x00select 1");
    }

    #[test]
    fn rpc_by_id() {
        let s = snapshot(ServerFlavor::SqlServer, TdsVersion::V71);
        let call = ProcedureCall::by_id(proc_id::SP_EXECUTE).bind(7i32);
        let message = rpc_message_without_cache(&s, call);
        assert_eq!(message.kind, PacketType::Rpc);
        assert_eq!(&message.payload[..6], &[0xFF, 0xFF, 12, 0, 0, 0]);

        let s = snapshot(ServerFlavor::SqlServer, TdsVersion::V70);
        let message = rpc_message_without_cache(&s, ProcedureCall::by_id(proc_id::SP_EXECUTE));
        assert_eq!(message.payload[0], 10);
    }

    fn rpc_message_without_cache(s: &Snapshot, call: ProcedureCall) -> Message {
        let ProcedureCall { target, params } = call;
        rpc(s, &target, &[], params).unwrap()
    }

    #[test]
    fn sybase_rpc_rejects_ids() {
        let s = snapshot(ServerFlavor::Sybase, TdsVersion::V50);
        let ProcedureCall { target, params } = ProcedureCall::by_id(12);
        assert!(rpc(&s, &target, &[], params).is_err());
    }

    #[test]
    fn tm_requests() {
        let s = snapshot(ServerFlavor::SqlServer, TdsVersion::V72);
        let message = tm_message(&s, &Command::Save("sp".into()));
        assert_eq!(message.kind, PacketType::TransactionManager);
        assert_eq!(&message.payload[22..], &[9, 0, 2, b's', 0, b'p', 0]);

        let message = tm_message(&s, &Command::Begin);
        assert_eq!(&message.payload[22..], &[5, 0, 0, 0]);
    }

    #[test]
    fn transaction_sql() {
        assert_eq!(Command::Rollback(Some("tdsro00001".into())).sql(), "ROLLBACK TRAN tdsro00001");
        assert_eq!(Command::Save("tdsro00002".into()).sql(), "SAVE TRAN tdsro00002");
    }
}
