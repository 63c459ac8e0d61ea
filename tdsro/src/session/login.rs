//! Login handshake.
//!
//! TDS 7.x sends a LOGIN7 record, TDS 5.0 the fixed field login record
//! followed by a CAPABILITY token. Either way the response is read as a
//! regular token stream on the control stream, so environment changes land
//! in the session like they do for any later exchange.
use bytes::{BufMut, BytesMut};
use std::{fmt, sync::Arc};

use super::{Config, Shared, stream::LogicalStream};
use crate::{
    ErrorKind, Result,
    codec::RequestStream,
    common::{debug, lock, span, verbose},
    ext::{BufMutExt, StrExt, UsizeExt},
    message::MessageChain,
    mux::CONTROL_STREAM,
    tds::{Charset, Dialect, PacketType, ServerFlavor, TdsVersion, token},
    token::{LoginAck, Token},
};

/// Client program version reported in LOGIN7.
const CLIENT_VERSION: u32 = 7;
/// Use database and language on login, fail when they are unavailable.
const OPTION_FLAGS_1: u8 = 0xE0;
/// Fail when the language is unavailable, ODBC session behavior.
const OPTION_FLAGS_2: u8 = 0x03;
/// `en-US`.
const CLIENT_LCID: u32 = 0x0409;
const LIBRARY_NAME: &str = "tdsro";

/// Width of TDS 5.0 login record string fields.
const FIELD_LEN: usize = 30;
/// Width of the TDS 5.0 remote password field.
const REMOTE_PASSWORD_LEN: usize = 253;

/// TDS 5.0 request and response capabilities.
const CAPABILITIES: [u8; 22] = [
    0x01, 0x09, 0x00, 0x00, 0x06, 0x6D, 0x7F, 0xFF, 0xFF, 0xFF, 0xFE,
    0x02, 0x09, 0x00, 0x00, 0x00, 0x00, 0x02, 0x68, 0x00, 0x00, 0x00,
];

/// Error when the server refuses the session.
pub enum LoginError {
    /// Server rejected the login, with the messages it sent.
    Rejected(MessageChain),
    /// Server answered with a protocol version this client does not speak.
    VersionMismatch {
        requested: TdsVersion,
        reported: u32,
    },
}

impl std::error::Error for LoginError { }

impl fmt::Display for LoginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(chain) => match chain.first_error().or(chain.iter().next()) {
                Some(message) => write!(f, "login rejected: {message}"),
                None => f.write_str("login rejected"),
            },
            Self::VersionMismatch { requested, reported } => write!(
                f,
                "requested TDS {requested}, server reported unsupported version 0x{reported:08X}"
            ),
        }
    }
}

impl fmt::Debug for LoginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Run the handshake on the control stream.
///
/// On failure the connection is killed, the caller drops it.
pub(crate) async fn login(shared: &Arc<Shared>) -> Result<()> {
    let config = &shared.config;
    let payload = match config.version {
        TdsVersion::V50 => tds5_record(config),
        _ => login7_record(config),
    };
    let kind = match config.version {
        TdsVersion::V50 => PacketType::Login,
        _ => PacketType::Login7,
    };

    debug!("login to {}:{} as {} using TDS {}", config.host, config.port, config.user, config.version);

    let mut out = RequestStream::new(kind, CONTROL_STREAM, config.packet_size as usize);
    out.put_slice(&payload);

    let mut stream = LogicalStream::new(shared.clone(), CONTROL_STREAM, Vec::new(), None);
    let result = match shared.mux.send(out.finish()).await {
        Ok(()) => read_response(shared, &mut stream).await,
        Err(err) => Err(err),
    };
    if result.is_err() {
        shared.mux.kill();
    }
    result
}

async fn read_response(shared: &Shared, stream: &mut LogicalStream) -> Result<()> {
    let requested = shared.config.version;
    let flavor = shared.config.flavor;
    let mut ack: Option<LoginAck> = None;

    loop {
        let token = match stream.next_token().await {
            Ok(Some(token)) => token,
            Ok(None) => break,
            Err(err) => {
                return Err(match err.into_kind() {
                    ErrorKind::Server(chain) => LoginError::Rejected(chain).into(),
                    kind => kind.into(),
                });
            },
        };

        if let Token::LoginAck(login_ack) = token {
            let version = negotiated(flavor, requested, &login_ack)?;
            let dialect = Dialect::new(flavor, version);
            lock(&shared.env).dialect = dialect;
            stream.set_dialect(dialect);
            ack = Some(login_ack);
        }
    }

    if let Some(ack) = &ack {
        if flavor == ServerFlavor::Sybase && ack.interface != LoginAck::SYBASE_SUCCEED {
            return Err(LoginError::Rejected(stream.messages().clone()).into());
        }
        verbose!(program = %ack.program, "login acknowledged");
    }

    let env = lock(&shared.env);
    debug!("session ready, {} packet size {} database {:?}", env.dialect, env.packet_size, env.database);
    drop(env);
    Ok(())
}

/// Protocol version the server settled on.
fn negotiated(flavor: ServerFlavor, requested: TdsVersion, ack: &LoginAck) -> Result<TdsVersion, LoginError> {
    let mismatch = LoginError::VersionMismatch { requested, reported: ack.version };
    match (flavor, TdsVersion::from_login_ack(ack.version)) {
        (ServerFlavor::Sybase, Some(TdsVersion::V50)) => Ok(TdsVersion::V50),
        (ServerFlavor::SqlServer, Some(version)) if version != TdsVersion::V50 => Ok(version.min(requested)),
        _ => Err(mismatch),
    }
}

// ===== LOGIN7 =====

/// Swap the nibbles of every byte, then xor with `0xA5`.
fn scramble(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.ucs2_len() * 2);
    out.put_ucs2(password);
    for b in &mut out {
        *b = b.rotate_left(4) ^ 0xA5;
    }
    out
}

fn login7_record(config: &Config) -> BytesMut {
    span!("login7", version = ?config.version);
    let fixed_len: usize = match config.version {
        TdsVersion::V72 => 94,
        _ => 86,
    };

    let password = scramble(&config.pass);
    let fields: [(&str, Option<&[u8]>); 9] = [
        (&config.client_host, None),
        (&config.user, None),
        ("", Some(&password)),
        (&config.app_name, None),
        (&config.host, None),
        // unused
        ("", None),
        (LIBRARY_NAME, None),
        (&config.language, None),
        (&config.database, None),
    ];

    let mut data = BytesMut::new();
    let mut offsets = BytesMut::with_capacity(fields.len() * 4);
    for (string, raw) in fields {
        let offset = fixed_len + data.len();
        offsets.put_u16_le(offset.to_u16_sat());
        match raw {
            Some(bytes) => {
                offsets.put_u16_le((bytes.len() / 2).to_u16_sat());
                data.put_slice(bytes);
            },
            None => {
                offsets.put_u16_le(string.ucs2_len().to_u16_sat());
                data.put_ucs2(string);
            },
        }
    }
    let end = (fixed_len + data.len()).to_u16_sat();

    let mut buf = BytesMut::with_capacity(fixed_len + data.len());
    buf.put_u32_le((fixed_len + data.len()).to_u32_sat());
    buf.put_u32_le(config.version.login7_version());
    buf.put_u32_le(config.packet_size.into());
    buf.put_u32_le(CLIENT_VERSION);
    buf.put_u32_le(std::process::id());
    // connection id
    buf.put_u32_le(0);
    buf.put_u8(OPTION_FLAGS_1);
    buf.put_u8(OPTION_FLAGS_2);
    // type flags, option flags 3
    buf.put_u8(0);
    buf.put_u8(0);
    // client time zone
    buf.put_i32_le(0);
    buf.put_u32_le(CLIENT_LCID);
    buf.put_slice(&offsets);
    // client id
    buf.put_slice(&[0; 6]);
    // sspi, attach db file
    buf.put_u16_le(end);
    buf.put_u16_le(0);
    buf.put_u16_le(end);
    buf.put_u16_le(0);
    if config.version == TdsVersion::V72 {
        // change password, long sspi
        buf.put_u16_le(end);
        buf.put_u16_le(0);
        buf.put_u32_le(0);
    }
    debug_assert_eq!(buf.len(), fixed_len);
    buf.put_slice(&data);
    buf
}

// ===== TDS 5.0 =====

/// Fixed width string field followed by its length byte.
fn put_field(buf: &mut BytesMut, charset: &Charset, value: &str, width: usize) {
    let bytes = charset.encode(value);
    let len = bytes.len().min(width);
    buf.put_slice(&bytes[..len]);
    buf.put_bytes(0, width - len);
    buf.put_u8(len.to_u8_sat());
}

fn tds5_record(config: &Config) -> BytesMut {
    span!("tds5_login", packet_size = config.packet_size);
    let charset = Charset::from_server_name(&config.charset);
    let mut buf = BytesMut::with_capacity(600);
    let pid = std::process::id().to_string();

    put_field(&mut buf, &charset, &config.client_host, FIELD_LEN);
    put_field(&mut buf, &charset, &config.user, FIELD_LEN);
    put_field(&mut buf, &charset, &config.pass, FIELD_LEN);
    put_field(&mut buf, &charset, &pid, FIELD_LEN);

    // int2, int4, char, float and date byte orders, use database
    buf.put_slice(&[0x03, 0x01, 0x06, 0x0A, 0x09, 0x01]);
    // no bulk copy, reserved
    buf.put_u8(0);
    buf.put_bytes(0, 2);
    buf.put_u32(0);
    buf.put_bytes(0, 3);

    put_field(&mut buf, &charset, &config.app_name, FIELD_LEN);
    put_field(&mut buf, &charset, &config.host, FIELD_LEN);

    // remote password: server name length 0, then the password
    let pass = charset.encode(&config.pass);
    let pass_len = pass.len().min(REMOTE_PASSWORD_LEN - 2);
    buf.put_u8(0);
    buf.put_u8(pass_len.to_u8_sat());
    buf.put_slice(&pass[..pass_len]);
    buf.put_bytes(0, REMOTE_PASSWORD_LEN - 2 - pass_len);
    buf.put_u8((pass_len + 2).to_u8_sat());

    // protocol version
    buf.put_slice(&[5, 0, 0, 0]);
    put_field(&mut buf, &charset, LIBRARY_NAME, 10);
    // program version
    buf.put_slice(&[5, 0, 0, 0]);
    // no short conversion, 4 byte float and date
    buf.put_slice(&[0x00, 0x0D, 0x11]);

    put_field(&mut buf, &charset, &config.language, FIELD_LEN);
    // notify language change
    buf.put_u8(1);
    // security label, encryption, reserved
    buf.put_bytes(0, 2);
    buf.put_u8(0);
    buf.put_bytes(0, 10);

    put_field(&mut buf, &charset, &config.charset, FIELD_LEN);
    // notify charset change
    buf.put_u8(1);
    put_field(&mut buf, &charset, &config.packet_size.to_string(), 6);
    buf.put_bytes(0, 4);

    buf.put_u8(token::CAPABILITY);
    buf.put_u16_le(CAPABILITIES.len() as u16);
    buf.put_slice(&CAPABILITIES);
    buf
}
