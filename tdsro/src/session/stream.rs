//! The [`LogicalStream`] type.
//!
//! A logical stream is one request/response exchange. Tokens are pulled
//! lazily, server messages are collected along the way and an error chain is
//! raised once, when the final DONE token arrives.
//!
//! Cancellation is best effort. Once requested, tokens are discarded until
//! the server acknowledges with a DONE token carrying the attention bit. An
//! acknowledgement that does not arrive within the grace period costs the
//! whole connection.
use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};

use super::Shared;
use crate::{
    Cancelled, ConnectionLost, Error, Result, Timeout,
    codec::ResponseStream,
    common::{debug, lock, verbose, warn},
    decode::TokenReader,
    message::{MessageChain, ServerMessage},
    mux::{CONTROL_STREAM, StreamId},
    param::Param,
    row::Row,
    tds::{Dialect, Packet},
    token::{EnvChange, ReturnValue, Token},
    transport::PacketSource,
    value::Value,
};

const RUNNING: u8 = 0;
const USER: u8 = 1;
const TIMEOUT: u8 = 2;
const FINISHED: u8 = 3;

/// Cancellation state shared by a stream and its handles.
#[derive(Debug)]
pub(crate) struct CancelState {
    state: AtomicU8,
    notify: Notify,
}

impl CancelState {
    fn new() -> CancelState {
        CancelState { state: AtomicU8::new(RUNNING), notify: Notify::new() }
    }

    fn get(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// Returns `true` when this call cancelled a running stream.
    fn request(&self, reason: u8) -> bool {
        let ok = self
            .state
            .compare_exchange(RUNNING, reason, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            self.notify.notify_waiters();
        }
        ok
    }

    fn is_requested(&self) -> bool {
        matches!(self.get(), USER | TIMEOUT)
    }

    /// Mark a running stream finished, returns the previous state.
    fn finish(&self) -> u8 {
        match self.state.compare_exchange(RUNNING, FINISHED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => RUNNING,
            Err(state) => state,
        }
    }

    fn acknowledged(&self) -> Error {
        match self.state.swap(FINISHED, Ordering::AcqRel) {
            TIMEOUT => Timeout.into(),
            _ => Cancelled.into(),
        }
    }
}

/// Packets of one logical stream, with timeout and cancellation.
#[derive(Clone)]
pub(crate) struct Channel {
    shared: Arc<Shared>,
    id: StreamId,
    cancel: Arc<CancelState>,
    timeout: Option<Duration>,
    grace: Duration,
}

impl Channel {
    async fn recv(&mut self) -> Result<Packet> {
        let mux = &self.shared.mux;
        let deadline = self.timeout.map(|t| Instant::now() + t);

        loop {
            // registered before the state check, so no wakeup is lost
            let notified = self.cancel.notify.notified();

            if self.cancel.get() != RUNNING {
                return match tokio::time::timeout(self.grace, mux.receive(self.id)).await {
                    Ok(packet) => packet,
                    Err(_) => {
                        warn!("stream {} cancel not acknowledged within {:?}", self.id, self.grace);
                        mux.kill();
                        Err(Error::from(ConnectionLost).context("cancel not acknowledged"))
                    },
                };
            }

            let elapsed = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                packet = mux.receive(self.id) => return packet,
                _ = notified => {},
                _ = elapsed => {
                    if self.cancel.request(TIMEOUT) {
                        debug!("stream {} timed out, sending attention", self.id);
                        mux.cancel(self.id).await?;
                    }
                },
            }
        }
    }
}

impl PacketSource for Channel {
    fn recv_packet(&mut self) -> impl Future<Output = Result<Packet>> + Send {
        self.recv()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Cancel a [`LogicalStream`] from another task.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
    id: StreamId,
    cancel: Arc<CancelState>,
}

impl CancelHandle {
    /// Send the attention signal.
    ///
    /// The stream reports [`Cancelled`] once the server acknowledges. Does
    /// nothing when the stream already finished or is being cancelled.
    pub async fn cancel(&self) -> Result<()> {
        send_attention(&self.shared, self.id, &self.cancel).await
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CancelHandle").field(&self.id).finish()
    }
}

async fn send_attention(shared: &Shared, id: StreamId, cancel: &CancelState) -> Result<()> {
    if cancel.request(USER) {
        debug!("cancelling stream {id}");
        shared.mux.cancel(id).await?;
    }
    Ok(())
}

/// One request/response exchange.
///
/// Dropping an unfinished stream cancels it in the background.
pub struct LogicalStream {
    shared: Arc<Shared>,
    id: StreamId,
    cancel: Arc<CancelState>,
    response: ResponseStream<Channel>,
    reader: TokenReader,
    params: Vec<Param>,
    next_output: usize,
    prepare: Option<String>,
    messages: MessageChain,
    return_status: Option<i32>,
    finished: bool,
}

impl LogicalStream {
    pub(crate) fn new(shared: Arc<Shared>, id: StreamId, params: Vec<Param>, prepare: Option<String>) -> LogicalStream {
        let (dialect, charset) = {
            let env = lock(&shared.env);
            (env.dialect, env.charset)
        };
        let cancel = Arc::new(CancelState::new());
        let channel = Channel {
            shared: shared.clone(),
            id,
            cancel: cancel.clone(),
            timeout: shared.config.timeout,
            grace: shared.config.cancel_grace,
        };
        let reader = TokenReader::new(dialect, shared.config.lazy_lobs);

        LogicalStream {
            shared,
            id,
            cancel,
            response: ResponseStream::new(channel, charset),
            reader,
            params,
            next_output: 0,
            prepare,
            messages: MessageChain::new(),
            return_status: None,
            finished: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Read the next token, `None` once the response is complete.
    ///
    /// When the server reported an error, the final DONE token is replaced by
    /// [`ErrorKind::Server`][crate::ErrorKind::Server] carrying every message
    /// of the exchange.
    pub async fn next_token(&mut self) -> Result<Option<Token>> {
        while !self.finished {
            let token = match self.reader.next_token(&mut self.response).await {
                Ok(token) => token,
                Err(err) => {
                    if err.is_fatal() {
                        self.release();
                    }
                    return Err(err);
                },
            };

            if let Token::Done(done) = &token {
                if done.status.attention() {
                    debug!("stream {} cancel acknowledged", self.id);
                    self.release();
                    return Err(self.cancel.acknowledged());
                }
            }

            if self.cancel.is_requested() {
                self.discard(&token);
                continue;
            }

            if let Token::Done(done) = &token {
                if done.is_final() && self.cancel.finish() != RUNNING {
                    // cancel raced the end of the response, wait for the acknowledgement
                    self.response.next_message();
                    continue;
                }
            }

            return self.accept(token);
        }
        Ok(None)
    }

    /// Token read while cancelling, only session state survives.
    fn discard(&mut self, token: &Token) {
        match token {
            Token::EnvChange(change) => self.apply(change),
            // the acknowledgement follows in its own message
            Token::Done(done) if done.is_final() => self.response.next_message(),
            _ => {},
        }
    }

    fn accept(&mut self, token: Token) -> Result<Option<Token>> {
        match &token {
            Token::Message(message) => self.messages.push(message.clone()),
            Token::EnvChange(change) => self.apply(change),
            Token::ReturnStatus(status) => self.return_status = Some(*status),
            Token::ReturnValues(values) => self.store_outputs(values),
            Token::Done(done) if done.is_final() => {
                self.release();
                if self.messages.has_errors() {
                    return Err(self.messages.clone().into());
                }
            },
            _ => {},
        }
        Ok(Some(token))
    }

    fn apply(&mut self, change: &EnvChange) {
        let charset = lock(&self.shared.env).apply(change);
        self.response.set_charset(charset);
    }

    fn store_outputs(&mut self, values: &[ReturnValue]) {
        for value in values {
            if let Some(key) = self.prepare.take() {
                match value.value.as_value() {
                    Some(Value::Int(handle)) => {
                        verbose!(handle, "prepared");
                        lock(&self.shared.env).cache.insert(key, *handle);
                    },
                    _ => {
                        warn!("prepare returned no handle");
                    },
                }
                continue;
            }

            let slot = self.params.iter_mut().filter(|p| p.is_output()).nth(self.next_output);
            self.next_output += 1;
            match slot {
                Some(param) => param.set_output(value.value.clone()),
                None => {
                    verbose!(name = %value.name, "return value without parameter");
                },
            }
        }
    }

    fn release(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.id != CONTROL_STREAM {
            self.shared.mux.close_stream(self.id);
        }
    }

    /// Skip tokens up to the next row.
    pub async fn next_row(&mut self) -> Result<Option<Row>> {
        while let Some(token) = self.next_token().await? {
            if let Token::Row(row) = token {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Read the rest of the response, returning the affected row count.
    pub async fn finish(&mut self) -> Result<u64> {
        let mut count = 0;
        while let Some(token) = self.next_token().await? {
            if let Token::Done(done) = token {
                count += done.rows_affected().unwrap_or(0);
            }
        }
        Ok(count)
    }

    /// Read the large object columns left unread in `row`.
    ///
    /// `row` must be the last row returned by this stream.
    pub async fn read_remaining(&mut self, row: &mut Row) -> Result<()> {
        self.reader.read_remaining(&mut self.response, row).await
    }

    /// Tokens remain to be read.
    pub fn has_more(&self) -> bool {
        !self.finished
    }

    /// Send the attention signal, the next [`next_token`] reports
    /// [`Cancelled`] once the server acknowledges.
    ///
    /// [`next_token`]: LogicalStream::next_token
    pub async fn cancel(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        send_attention(&self.shared, self.id, &self.cancel).await
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { shared: self.shared.clone(), id: self.id, cancel: self.cancel.clone() }
    }

    /// Cancel what is left of the response and release the stream.
    pub async fn close(mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.cancel().await?;
        loop {
            match self.next_token().await {
                Ok(Some(_)) => {},
                Ok(None) => return Ok(()),
                Err(err) if err.is_fatal() => return Err(err),
                Err(_) if self.finished => return Ok(()),
                Err(_) => {},
            }
        }
    }

    /// Override the timeout of each wait for the server.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.response.source_mut().timeout = timeout;
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn param(&self, index: usize) -> Option<&Param> {
        self.params.get(index)
    }

    /// Parameter by name, with or without the leading `@`.
    pub fn param_by_name(&self, name: &str) -> Option<&Param> {
        let name = name.trim_start_matches('@');
        self.params.iter().find(|p| {
            p.name().is_some_and(|n| n.trim_start_matches('@').eq_ignore_ascii_case(name))
        })
    }

    /// Take the parameters, with returned values, to execute them again.
    pub fn take_params(&mut self) -> Vec<Param> {
        std::mem::take(&mut self.params)
    }

    /// Procedure return status.
    pub fn return_status(&self) -> Option<i32> {
        self.return_status
    }

    /// Informational messages received so far.
    pub fn warnings(&self) -> impl Iterator<Item = &ServerMessage> {
        self.messages.iter().filter(|m| !m.is_error())
    }

    /// Every message received so far, in order.
    pub fn messages(&self) -> &MessageChain {
        &self.messages
    }

    /// Rules used to decode this stream.
    pub fn dialect(&self) -> Dialect {
        self.reader.dialect()
    }

    pub(crate) fn set_dialect(&mut self, dialect: Dialect) {
        self.reader.set_dialect(dialect);
    }
}

impl Drop for LogicalStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.shared.mux.is_dead() {
            self.release();
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("stream {} dropped outside a runtime, connection abandoned", self.id);
            self.shared.mux.kill();
            self.release();
            return;
        };

        // move the exchange into a task which drains it
        let charset = self.response.charset();
        let channel = self.response.source().clone();
        let dialect = self.reader.dialect();
        let detached = LogicalStream {
            shared: self.shared.clone(),
            id: self.id,
            cancel: self.cancel.clone(),
            response: std::mem::replace(&mut self.response, ResponseStream::new(channel, charset)),
            reader: std::mem::replace(&mut self.reader, TokenReader::new(dialect, false)),
            params: Vec::new(),
            next_output: 0,
            prepare: None,
            messages: MessageChain::new(),
            return_status: None,
            finished: false,
        };
        self.finished = true;

        verbose!(id = self.id, "draining dropped stream");
        runtime.spawn(async move {
            if let Err(_err) = detached.close().await {
                debug!("draining dropped stream failed: {_err}");
            }
        });
    }
}

impl std::fmt::Debug for LogicalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalStream")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .field("messages", &self.messages.len())
            .finish()
    }
}
