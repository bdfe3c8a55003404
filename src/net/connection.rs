//! Connection state machine shared by both roles.
//!
//! One read task per connection owns the read half, the decoder and the table
//! of outstanding pings. It reassembles messages into the inbound queue, answers
//! control frames and, when the transfer ends, runs the teardown that closes the
//! transport. Every outbound frame goes through the write gate, so frames never
//! interleave on the wire.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use indexmap::IndexMap;
use log::{debug, error, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::{sleep, timeout};

use crate::config::Config;
use crate::error::{Error, Result, ABNORMAL_CLOSURE};
use crate::net::extension::Extension;
use crate::net::framing::{self, random_bytes, Decoder, Frame, Opcode, Role, MAX_CONTROL_PAYLOAD};
use crate::net::transport::{BoxedReader, BoxedWriter, Transport};

/// Code recorded when a CLOSE frame carried no payload.
pub const NO_STATUS_RCVD: u16 = 1005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }

    fn into_frame(self) -> Frame {
        match self {
            Message::Text(text) => Frame::text(text),
            Message::Binary(data) => Frame::binary(data),
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Message::Binary(data)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(data.into())
    }
}

impl From<&[u8]> for Message {
    fn from(data: &[u8]) -> Self {
        Message::Binary(Bytes::copy_from_slice(data))
    }
}

/// Codes an endpoint may put in a CLOSE frame it sends.
pub fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

/// Serializes a CLOSE payload, rejecting codes that may not go on the wire.
pub fn close_payload(code: u16, reason: &str) -> Result<Bytes> {
    if !is_valid_close_code(code) {
        return Err(Error::protocol(format!("invalid close code {code}")));
    }
    if 2 + reason.len() > MAX_CONTROL_PAYLOAD {
        return Err(Error::protocol("close reason too long"));
    }
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    Ok(payload.into())
}

/// Parses a received CLOSE payload into its code and reason.
pub fn parse_close(payload: &[u8]) -> Result<(u16, Option<String>)> {
    match payload.len() {
        0 => Ok((NO_STATUS_RCVD, None)),
        1 => Err(Error::protocol("close frame payload of 1 byte")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_close_code(code) {
                return Err(Error::protocol(format!("invalid close code {code}")));
            }
            let reason = std::str::from_utf8(&payload[2..]).map_err(|_| Error::InvalidUtf8)?;
            Ok((code, Some(reason.to_string())))
        }
    }
}

enum Command {
    /// Stores a pong waiter and hands back the token that was registered.
    RegisterPing {
        payload: Option<Bytes>,
        reply: oneshot::Sender<(Bytes, oneshot::Receiver<()>)>,
    },
    /// Stop waiting on the peer and drop the transport now.
    Abort,
}

#[derive(Debug, Default)]
struct CloseStatus {
    /// 0 until a code is known.
    code: u16,
    reason: Option<String>,
}

struct Writer {
    io: Option<BoxedWriter>,
    buf: BytesMut,
}

#[derive(Default)]
struct InboxState {
    messages: VecDeque<Message>,
    terminal: Option<(u16, Option<String>)>,
}

/// Inbound message queue. Drops the oldest message when a bound is set and
/// reached. Once terminated, receivers see the terminal error after the
/// remaining messages are drained.
struct Inbox {
    state: Mutex<InboxState>,
    capacity: Option<usize>,
    notify: Notify,
}

impl Inbox {
    fn new(capacity: Option<usize>) -> Self {
        Self { state: Mutex::new(InboxState::default()), capacity, notify: Notify::new() }
    }

    fn push(&self, message: Message) {
        {
            let mut state = self.state.lock();
            if let Some(capacity) = self.capacity {
                while state.messages.len() >= capacity.max(1) {
                    state.messages.pop_front();
                    debug!("inbound queue full, dropped oldest message");
                }
            }
            state.messages.push_back(message);
        }
        self.notify.notify_one();
    }

    fn terminate(&self, code: u16, reason: Option<String>) {
        self.state.lock().terminal.get_or_insert((code, reason));
        self.notify.notify_waiters();
    }

    fn try_pop(&self) -> Result<Option<Message>> {
        let mut state = self.state.lock();
        if let Some(message) = state.messages.pop_front() {
            return Ok(Some(message));
        }
        match &state.terminal {
            Some((code, reason)) => Err(Error::Closed { code: *code, reason: reason.clone() }),
            None => Ok(None),
        }
    }

    async fn pop(&self) -> Result<Message> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(message) = self.try_pop()? {
                return Ok(message);
            }
            notified.await;
        }
    }
}

struct Shared {
    role: Role,
    config: Config,
    extensions: Vec<Arc<dyn Extension>>,
    subprotocol: Option<String>,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    is_secure: bool,
    state: watch::Sender<State>,
    close: Mutex<CloseStatus>,
    writer: tokio::sync::Mutex<Writer>,
    inbox: Inbox,
    commands: mpsc::UnboundedSender<Command>,
    transfer_done: watch::Sender<bool>,
    /// Set once the transport is being dropped; pending writes give up.
    aborted: watch::Sender<bool>,
}

impl Shared {
    fn state(&self) -> State {
        *self.state.borrow()
    }

    fn abort(&self) {
        self.aborted.send_replace(true);
        let _ = self.commands.send(Command::Abort);
    }

    /// Drops the write half without the read task, for when its teardown is
    /// overdue.
    fn abort_transport(&self) {
        let Ok(mut writer) = self.writer.try_lock() else {
            warn!("{:?}: write gate still held, transport left to the read task", self.role);
            return;
        };
        if let Some(mut io) = writer.io.take() {
            if let Err(e) = io.abort() {
                debug!("{:?}: abort failed: {e}", self.role);
            }
        }
    }

    fn closed_error(&self) -> Error {
        let close = self.close.lock();
        let code = if close.code == 0 { ABNORMAL_CLOSURE } else { close.code };
        Error::Closed { code, reason: close.reason.clone() }
    }

    /// Resolves once the connection is CLOSED or `limit` elapsed. Returns
    /// whether it is CLOSED.
    async fn wait_closed(&self, limit: Duration) -> bool {
        let mut state = self.state.subscribe();
        let closed = matches!(timeout(limit, state.wait_for(|s| *s == State::Closed)).await, Ok(Ok(_)));
        closed
    }

    /// Returns `Ok` when frames may still be sent, otherwise the error that
    /// describes how the connection ended, waiting for the end if it is near.
    async fn ensure_open(&self) -> Result<()> {
        match self.state() {
            State::Open => {
                if !*self.transfer_done.borrow() {
                    return Ok(());
                }
                self.wait_closed(self.config.close_timeout).await;
                Err(self.closed_error())
            }
            State::Closing => {
                let unknown = self.close.lock().code == 0;
                if unknown {
                    self.wait_closed(self.config.close_timeout * 3).await;
                }
                Err(self.closed_error())
            }
            State::Closed => Err(self.closed_error()),
            State::Connecting => Err(Error::protocol("connection is not open yet")),
        }
    }

    async fn write_frame(&self, frame: Frame, expected: State) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if self.state() != expected {
            return Err(self.closed_error());
        }
        self.write_locked(&mut writer, frame).await
    }

    /// Sends our CLOSE and moves to CLOSING. A no-op unless OPEN.
    async fn write_close_frame(&self, payload: Bytes) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if self.state() != State::Open {
            return Ok(());
        }
        self.state.send_replace(State::Closing);
        debug!("{:?}: sending close frame", self.role);
        self.write_locked(&mut writer, Frame::new(true, Opcode::Close, payload)).await
    }

    async fn write_locked(&self, writer: &mut Writer, mut frame: Frame) -> Result<()> {
        let mut allowed = 0;
        for ext in &self.extensions {
            frame = ext.encode(frame)?;
            allowed |= ext.reserved_bits();
        }
        frame.check_reserved(allowed)?;

        let Writer { io: slot, buf } = writer;
        let Some(stream) = slot.as_mut() else {
            return Err(self.closed_error());
        };
        buf.clear();
        framing::encode(&frame, self.role, buf)?;

        let mut aborted = self.aborted.subscribe();
        let written = tokio::select! {
            written = async {
                stream.write_all(&buf[..]).await?;
                stream.flush().await
            } => written,
            _ = aborted.wait_for(|aborted| *aborted) => Err(io::ErrorKind::ConnectionAborted.into()),
        };
        if let Err(e) = written {
            debug!("{:?}: write failed: {e}", self.role);
            self.abort();
            return Err(self.closed_error());
        }
        Ok(())
    }
}

/// Handle to an open WebSocket connection. Clones share the connection.
#[derive(Clone)]
pub struct WebSocket {
    shared: Arc<Shared>,
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("role", &self.shared.role)
            .field("state", &self.shared.state())
            .field("peer_addr", &self.shared.peer_addr)
            .finish()
    }
}

impl WebSocket {
    /// Wraps a transport that completed the opening handshake and starts the
    /// read task. `read_buf` holds bytes the handshake read past its head.
    pub(crate) fn open<T: Transport>(
        transport: T,
        role: Role,
        config: Config,
        read_buf: BytesMut,
        extensions: Vec<Arc<dyn Extension>>,
        subprotocol: Option<String>,
    ) -> WebSocket {
        let peer_addr = transport.peer_addr();
        let local_addr = transport.local_addr();
        let is_secure = transport.is_secure();
        let (reader, writer) = transport.into_split();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let reserved = extensions.iter().fold(0, |mask, ext| mask | ext.reserved_bits());

        let shared = Arc::new(Shared {
            role,
            inbox: Inbox::new(config.max_queue),
            config,
            extensions,
            subprotocol,
            peer_addr,
            local_addr,
            is_secure,
            state: watch::channel(State::Connecting).0,
            close: Mutex::new(CloseStatus::default()),
            writer: tokio::sync::Mutex::new(Writer { io: Some(writer), buf: BytesMut::with_capacity(4096) }),
            commands,
            transfer_done: watch::channel(false).0,
            aborted: watch::channel(false).0,
        });

        let task = ReadTask {
            shared: shared.clone(),
            reader,
            buf: read_buf,
            decoder: Decoder::new(role).with_reserved_bits(reserved),
            commands: commands_rx,
            commands_closed: false,
            pings: IndexMap::new(),
            eof: false,
            aborted: false,
        };
        shared.state.send_replace(State::Open);
        debug!("{role:?}: connection open (peer {peer_addr:?})");
        tokio::spawn(task.run());

        WebSocket { shared }
    }

    /// Sends one message as a single frame.
    pub async fn send(&self, message: impl Into<Message>) -> Result<()> {
        self.shared.ensure_open().await?;
        self.shared.write_frame(message.into().into_frame(), State::Open).await
    }

    /// Next inbound message. Once the connection ended and the queue is
    /// drained, returns `Error::Closed` with the terminal code.
    pub async fn receive(&self) -> Result<Message> {
        self.shared.inbox.pop().await
    }

    /// Like `receive` without waiting; `Ok(None)` when nothing is queued.
    pub fn try_receive(&self) -> Result<Option<Message>> {
        self.shared.inbox.try_pop()
    }

    /// Sends a PING and resolves when a PONG acknowledges it. A PONG also
    /// acknowledges every ping sent before the one it answers.
    ///
    /// Without a payload, or when the payload is already awaiting a pong, a
    /// random 4 byte token is used.
    pub async fn ping(&self, payload: Option<Bytes>) -> Result<()> {
        if matches!(&payload, Some(p) if p.len() > MAX_CONTROL_PAYLOAD) {
            return Err(Error::protocol("ping payload too long"));
        }
        self.shared.ensure_open().await?;

        let (reply, registered) = oneshot::channel();
        self.shared
            .commands
            .send(Command::RegisterPing { payload, reply })
            .map_err(|_| self.shared.closed_error())?;
        let (token, waiter) = registered.await.map_err(|_| self.shared.closed_error())?;

        debug!("{:?}: ping {}", self.shared.role, hex::encode(&token));
        self.shared.write_frame(Frame::new(true, Opcode::Ping, token), State::Open).await?;
        waiter.await.map_err(|_| self.shared.closed_error())
    }

    /// Sends an unsolicited PONG.
    pub async fn pong(&self, payload: Option<Bytes>) -> Result<()> {
        let payload = match payload {
            Some(p) if p.len() > MAX_CONTROL_PAYLOAD => return Err(Error::protocol("pong payload too long")),
            Some(p) => p,
            None => Bytes::copy_from_slice(&random_bytes::<4>()?),
        };
        self.shared.ensure_open().await?;
        self.shared.write_frame(Frame::new(true, Opcode::Pong, payload), State::Open).await
    }

    /// Runs the closing handshake and waits for the transport to close.
    ///
    /// An invalid `code` fails before anything is sent. Otherwise this always
    /// completes within three `close_timeout` periods, after which the
    /// transport is dropped even if the peer never cooperated. On an already
    /// closed connection it returns at once.
    pub async fn close(&self, code: u16, reason: &str) -> Result<()> {
        let payload = close_payload(code, reason)?;
        let shared = &self.shared;
        let limit = shared.config.close_timeout;

        match timeout(limit, shared.write_close_frame(payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("{:?}: close frame not sent: {e}", shared.role),
            Err(_) => {
                warn!("{:?}: timed out sending close frame", shared.role);
                shared.abort();
            }
        }

        let mut done = shared.transfer_done.subscribe();
        if timeout(limit, done.wait_for(|done| *done)).await.is_err() {
            debug!("{:?}: no close frame from peer within {limit:?}", shared.role);
            shared.abort();
        }

        if !shared.wait_closed(limit).await {
            warn!("{:?}: transport still open after {limit:?}, aborting", shared.role);
            shared.abort();
            shared.abort_transport();
        }
        Ok(())
    }

    /// Resolves when the connection reaches CLOSED.
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == State::Closed).await;
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// OPEN and still reading. False as soon as the read loop has ended.
    pub fn is_open(&self) -> bool {
        self.shared.state() == State::Open && !*self.shared.transfer_done.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state() == State::Closed
    }

    /// `None` until a close code is known.
    pub fn close_code(&self) -> Option<u16> {
        match self.shared.close.lock().code {
            0 => None,
            code => Some(code),
        }
    }

    pub fn close_reason(&self) -> Option<String> {
        self.shared.close.lock().reason.clone()
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.shared.subprotocol.as_deref()
    }

    pub fn extensions(&self) -> &[Arc<dyn Extension>] {
        &self.shared.extensions
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    pub fn is_secure(&self) -> bool {
        self.shared.is_secure
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Identity of the underlying connection, shared by all clones.
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }
}

enum Event {
    Read(io::Result<usize>),
    Command(Option<Command>),
}

/// Incremental message assembly. Text is validated as fragments arrive, so a
/// bad sequence fails at the fragment that carries it.
struct Reassembler {
    text: bool,
    data: Vec<u8>,
    valid_up_to: usize,
}

impl Reassembler {
    fn new(text: bool) -> Self {
        Self { text, data: Vec::new(), valid_up_to: 0 }
    }

    fn push(&mut self, chunk: &[u8]) -> Result<()> {
        self.data.extend_from_slice(chunk);
        if !self.text {
            return Ok(());
        }
        match std::str::from_utf8(&self.data[self.valid_up_to..]) {
            Ok(_) => self.valid_up_to = self.data.len(),
            // error_len() is None for a sequence cut off at the end of the chunk.
            Err(e) if e.error_len().is_none() => self.valid_up_to += e.valid_up_to(),
            Err(_) => return Err(Error::InvalidUtf8),
        }
        Ok(())
    }

    fn finish(self) -> Result<Message> {
        if !self.text {
            return Ok(Message::Binary(self.data.into()));
        }
        String::from_utf8(self.data).map(Message::Text).map_err(|_| Error::InvalidUtf8)
    }
}

struct ReadTask {
    shared: Arc<Shared>,
    reader: BoxedReader,
    buf: BytesMut,
    decoder: Decoder,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_closed: bool,
    /// Outstanding ping tokens in the order they were sent.
    pings: IndexMap<Bytes, oneshot::Sender<()>>,
    eof: bool,
    aborted: bool,
}

impl ReadTask {
    async fn run(mut self) {
        let role = self.shared.role;
        let (code, reason) = match self.transfer_data().await {
            Ok(()) => {
                let close = self.shared.close.lock();
                (if close.code == 0 { 1000 } else { close.code }, close.reason.clone())
            }
            Err(err) => {
                let code = err.close_code();
                if code == 1011 {
                    error!("{role:?}: read loop failed: {err}");
                } else {
                    debug!("{role:?}: read loop ended: {err}");
                }
                self.fail_connection(code).await;
                (code, None)
            }
        };

        {
            let mut close = self.shared.close.lock();
            if close.code == 0 {
                close.code = code;
            }
        }
        self.shared.inbox.terminate(code, reason);
        self.shared.transfer_done.send_replace(true);

        self.close_connection().await;
    }

    async fn transfer_data(&mut self) -> Result<()> {
        while let Some(message) = self.read_message().await? {
            self.shared.inbox.push(message);
        }
        Ok(())
    }

    /// Reads one whole message. `None` once a CLOSE frame was processed.
    async fn read_message(&mut self) -> Result<Option<Message>> {
        let max_size = self.shared.config.max_frame_payload;
        let Some(mut frame) = self.read_data_frame(max_size).await? else {
            return Ok(None);
        };
        let text = match frame.opcode {
            Opcode::Text => true,
            Opcode::Binary => false,
            other => return Err(Error::protocol(format!("unexpected {other:?} frame, expected a new message"))),
        };

        if frame.fin {
            return Ok(Some(if text {
                let text = std::str::from_utf8(&frame.payload).map_err(|_| Error::InvalidUtf8)?;
                Message::Text(text.to_string())
            } else {
                Message::Binary(frame.payload)
            }));
        }

        let mut remaining = max_size;
        let mut message = Reassembler::new(text);
        loop {
            remaining -= frame.payload.len();
            message.push(&frame.payload)?;
            if frame.fin {
                break;
            }
            frame = match self.read_data_frame(remaining).await? {
                Some(next) if next.opcode == Opcode::Continuation => next,
                Some(next) => {
                    return Err(Error::protocol(format!("unexpected {:?} frame inside a fragmented message", next.opcode)))
                }
                None => return Err(Error::protocol("incomplete fragmented message")),
            };
        }
        message.finish().map(Some)
    }

    /// Next data frame, handling control frames on the way. `None` after CLOSE.
    async fn read_data_frame(&mut self, max_size: usize) -> Result<Option<Frame>> {
        loop {
            let mut frame = self.read_frame(max_size).await?;
            for ext in self.shared.extensions.iter().rev() {
                frame = ext.decode(frame, max_size)?;
            }
            frame.check()?;

            if !frame.opcode.is_control() {
                if frame.payload.len() > max_size {
                    return Err(Error::PayloadTooLarge { size: frame.payload.len() as u64, max: max_size });
                }
                return Ok(Some(frame));
            }
            if !self.process_control_frame(frame).await? {
                return Ok(None);
            }
        }
    }

    /// Returns false once a CLOSE frame ends the transfer.
    async fn process_control_frame(&mut self, frame: Frame) -> Result<bool> {
        match frame.opcode {
            Opcode::Close => {
                let (code, reason) = parse_close(&frame.payload)?;
                debug!("{:?}: received close frame {code} {reason:?}", self.shared.role);
                {
                    let mut close = self.shared.close.lock();
                    close.code = code;
                    close.reason = reason;
                }
                let shared = self.shared.clone();
                self.reply(shared.write_close_frame(frame.payload), "close echo").await?;
                Ok(false)
            }
            Opcode::Ping => {
                if self.shared.state() == State::Open {
                    let shared = self.shared.clone();
                    let pong = Frame::new(true, Opcode::Pong, frame.payload);
                    self.reply(shared.write_frame(pong, State::Open), "pong").await?;
                }
                Ok(true)
            }
            Opcode::Pong => {
                if let Some(index) = self.pings.get_index_of(&frame.payload) {
                    for (token, waiter) in self.pings.drain(..=index) {
                        debug!("{:?}: pong acknowledges {}", self.shared.role, hex::encode(&token));
                        let _ = waiter.send(());
                    }
                }
                Ok(true)
            }
            _ => Ok(true),
        }
    }

    /// Writes a control reply. A peer that stops reading for `close_timeout`
    /// loses the connection.
    async fn reply(&mut self, write: impl Future<Output = Result<()>>, what: &str) -> Result<()> {
        let limit = self.shared.config.close_timeout;
        match timeout(limit, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!("{:?}: {what} not sent: {e}", self.shared.role);
                Ok(())
            }
            Err(_) => {
                warn!("{:?}: {what} not written within {limit:?}, peer stopped reading", self.shared.role);
                self.aborted = true;
                self.shared.abort();
                Err(Error::Transport(io::ErrorKind::TimedOut.into()))
            }
        }
    }

    async fn read_frame(&mut self, max_size: usize) -> Result<Frame> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buf, max_size)? {
                return Ok(frame);
            }
            let event = tokio::select! {
                read = self.reader.read_buf(&mut self.buf) => Event::Read(read),
                command = self.commands.recv(), if !self.commands_closed => Event::Command(command),
            };
            match event {
                Event::Read(Ok(0)) => {
                    self.eof = true;
                    return Err(Error::Transport(io::ErrorKind::UnexpectedEof.into()));
                }
                Event::Read(Ok(_)) => {}
                Event::Read(Err(e)) => {
                    self.eof = true;
                    return Err(e.into());
                }
                Event::Command(command) => self.handle_command(command)?,
            }
        }
    }

    fn handle_command(&mut self, command: Option<Command>) -> Result<()> {
        match command {
            Some(Command::RegisterPing { payload, reply }) => {
                let token = match payload {
                    Some(payload) if !self.pings.contains_key(&payload) => payload,
                    _ => loop {
                        let candidate = Bytes::copy_from_slice(&random_bytes::<4>()?);
                        if !self.pings.contains_key(&candidate) {
                            break candidate;
                        }
                    },
                };
                let (waiter_tx, waiter_rx) = oneshot::channel();
                self.pings.insert(token.clone(), waiter_tx);
                let _ = reply.send((token, waiter_rx));
                Ok(())
            }
            Some(Command::Abort) => {
                self.aborted = true;
                Err(Error::Closed { code: ABNORMAL_CLOSURE, reason: None })
            }
            None => {
                self.commands_closed = true;
                Ok(())
            }
        }
    }

    /// Sends a CLOSE carrying `code` if the protocol still allows one.
    async fn fail_connection(&mut self, code: u16) {
        if code == ABNORMAL_CLOSURE || self.shared.state() != State::Open {
            return;
        }
        let Ok(payload) = close_payload(code, "") else {
            return;
        };
        let limit = self.shared.config.close_timeout;
        match timeout(limit, self.shared.write_close_frame(payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("{:?}: close frame not sent: {e}", self.shared.role),
            Err(_) => warn!("{:?}: timed out sending close frame {code}", self.shared.role),
        }
    }

    /// Waits up to `close_timeout` for the peer to close its side. Returns
    /// whether it did.
    async fn wait_for_eof(&mut self) -> bool {
        if self.eof {
            return true;
        }
        let deadline = sleep(self.shared.config.close_timeout);
        tokio::pin!(deadline);
        loop {
            let event = tokio::select! {
                _ = &mut deadline => return false,
                read = self.reader.read_buf(&mut self.buf) => Event::Read(read),
                command = self.commands.recv(), if !self.commands_closed => Event::Command(command),
            };
            match event {
                Event::Read(Ok(0)) | Event::Read(Err(_)) => {
                    self.eof = true;
                    return true;
                }
                // Anything after the closing handshake is discarded.
                Event::Read(Ok(_)) => self.buf.clear(),
                Event::Command(Some(Command::Abort)) => {
                    self.aborted = true;
                    return false;
                }
                Event::Command(Some(Command::RegisterPing { .. })) => {}
                Event::Command(None) => self.commands_closed = true,
            }
        }
    }

    /// Teardown. The transport is always closed when this returns.
    async fn close_connection(&mut self) {
        let role = self.shared.role;
        let limit = self.shared.config.close_timeout;
        // Dropping the waiters fails every pending ping.
        self.pings.clear();

        // The server closes TCP first; a client gives it the chance to.
        if role == Role::Client && !self.aborted {
            self.wait_for_eof().await;
        }

        if !self.eof && !self.aborted {
            if let Ok(mut writer) = timeout(limit, self.shared.writer.lock()).await {
                if let Some(io) = writer.io.as_mut() {
                    let _ = timeout(limit, io.shutdown()).await;
                }
            }
            self.wait_for_eof().await;
        }

        match timeout(limit, self.shared.writer.lock()).await {
            Ok(mut writer) => {
                if let Some(mut io) = writer.io.take() {
                    if !self.eof {
                        debug!("{role:?}: aborting transport");
                        if let Err(e) = io.abort() {
                            debug!("{role:?}: abort failed: {e}");
                        }
                    }
                }
            }
            Err(_) => warn!("{role:?}: write gate still held at teardown"),
        }
        self.reader = Box::new(tokio::io::empty());

        {
            let mut close = self.shared.close.lock();
            if close.code == 0 {
                close.code = ABNORMAL_CLOSURE;
            }
        }
        self.shared.state.send_replace(State::Closed);
        debug!("{role:?}: connection closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio::io::DuplexStream;

    use super::*;
    use crate::net::extension::testing::Invert;

    const WAIT: Duration = Duration::from_secs(5);

    /// Raw client side of an in-memory connection whose server end is a `WebSocket`.
    struct Peer {
        io: DuplexStream,
        buf: BytesMut,
        decoder: Decoder,
    }

    impl Peer {
        async fn send(&mut self, frame: Frame) {
            let mut out = BytesMut::new();
            framing::encode(&frame, Role::Client, &mut out).unwrap();
            self.io.write_all(&out).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Frame> {
            loop {
                if let Some(frame) = self.decoder.decode(&mut self.buf, usize::MAX).unwrap() {
                    return Some(frame);
                }
                match timeout(WAIT, self.io.read_buf(&mut self.buf)).await {
                    Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return None,
                    Ok(Ok(_)) => {}
                }
            }
        }
    }

    fn server(config: Config, extensions: Vec<Arc<dyn Extension>>) -> (WebSocket, Peer) {
        server_with_buffer(config, extensions, 1 << 16)
    }

    fn server_with_buffer(config: Config, extensions: Vec<Arc<dyn Extension>>, buffer: usize) -> (WebSocket, Peer) {
        let (local, remote) = tokio::io::duplex(buffer);
        let ws = WebSocket::open(local, Role::Server, config, BytesMut::new(), extensions, None);
        let decoder = Decoder::new(Role::Client).with_reserved_bits(framing::RSV1 | framing::RSV2 | framing::RSV3);
        let peer = Peer { io: remote, buf: BytesMut::new(), decoder };
        (ws, peer)
    }

    fn fast() -> Config {
        Config::default().with_close_timeout(Duration::from_millis(200))
    }

    #[test]
    fn test_close_codes() {
        for code in [1000, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011, 3000, 4999] {
            assert!(is_valid_close_code(code), "{code}");
        }
        for code in [0, 999, 1004, 1005, 1006, 1012, 1015, 2999, 5000] {
            assert!(!is_valid_close_code(code), "{code}");
        }
    }

    #[test]
    fn test_parse_close() {
        assert_eq!(parse_close(b"").unwrap(), (1005, None));
        assert!(matches!(parse_close(b"\x03"), Err(Error::Protocol(_))));
        assert_eq!(parse_close(b"\x03\xe8bye").unwrap(), (1000, Some("bye".to_string())));
        assert!(matches!(parse_close(b"\x03\xed"), Err(Error::Protocol(_))));
        assert!(matches!(parse_close(b"\x03\xe8\xff"), Err(Error::InvalidUtf8)));
    }

    #[tokio::test]
    async fn test_fragmented_text_split_inside_code_point() {
        let (ws, mut peer) = server(Config::default(), vec![]);
        let data = "héllo wörld".as_bytes();
        let (head, tail) = data.split_at(9);

        peer.send(Frame::new(false, Opcode::Text, Bytes::copy_from_slice(head))).await;
        peer.send(Frame::new(true, Opcode::Continuation, Bytes::copy_from_slice(tail))).await;

        let message = timeout(WAIT, ws.receive()).await.unwrap().unwrap();
        assert_eq!(message, Message::Text("héllo wörld".to_string()));
    }

    #[tokio::test]
    async fn test_control_frame_between_fragments() {
        let (ws, mut peer) = server(Config::default(), vec![]);
        peer.send(Frame::new(false, Opcode::Binary, &b"ab"[..])).await;
        peer.send(Frame::new(true, Opcode::Ping, &b"mid"[..])).await;
        peer.send(Frame::new(true, Opcode::Continuation, &b"cd"[..])).await;

        let pong = peer.recv().await.unwrap();
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(&pong.payload[..], b"mid");
        let message = timeout(WAIT, ws.receive()).await.unwrap().unwrap();
        assert_eq!(message, Message::Binary(Bytes::from_static(b"abcd")));
    }

    #[tokio::test]
    async fn test_oversized_message_closes_with_1009() {
        let (ws, mut peer) = server(fast().with_max_frame_payload(10), vec![]);
        peer.send(Frame::text(vec![b'x'; 20])).await;

        let err = timeout(WAIT, ws.receive()).await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Closed { code: 1009, .. }));
        let close = peer.recv().await.unwrap();
        assert_eq!(close.opcode, Opcode::Close);
        assert_eq!(&close.payload[..2], &1009u16.to_be_bytes());
        assert_eq!(ws.close_code(), Some(1009));
    }

    #[tokio::test]
    async fn test_fragments_count_against_limit() {
        let (ws, mut peer) = server(fast().with_max_frame_payload(10), vec![]);
        peer.send(Frame::new(false, Opcode::Binary, vec![0u8; 6])).await;
        peer.send(Frame::new(true, Opcode::Continuation, vec![0u8; 6])).await;

        let err = timeout(WAIT, ws.receive()).await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Closed { code: 1009, .. }));
    }

    #[tokio::test]
    async fn test_invalid_utf8_closes_with_1007() {
        let (ws, mut peer) = server(fast(), vec![]);
        peer.send(Frame::text(&b"\xff\xfe"[..])).await;

        let err = timeout(WAIT, ws.receive()).await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Closed { code: 1007, .. }));
    }

    #[tokio::test]
    async fn test_continuation_without_start_closes_with_1002() {
        let (ws, mut peer) = server(fast(), vec![]);
        peer.send(Frame::new(true, Opcode::Continuation, &b"x"[..])).await;

        let err = timeout(WAIT, ws.receive()).await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Closed { code: 1002, .. }));
        assert_eq!(peer.recv().await.unwrap().opcode, Opcode::Close);
    }

    #[tokio::test]
    async fn test_new_message_inside_fragmented_message_closes_with_1002() {
        let (ws, mut peer) = server(fast(), vec![]);
        peer.send(Frame::new(false, Opcode::Text, &b"a"[..])).await;
        peer.send(Frame::text(&b"b"[..])).await;

        let err = timeout(WAIT, ws.receive()).await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Closed { code: 1002, .. }));
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_same_payload() {
        let (_ws, mut peer) = server(Config::default(), vec![]);
        peer.send(Frame::new(true, Opcode::Ping, &b"hello"[..])).await;

        let pong = peer.recv().await.unwrap();
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(&pong.payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_pong_acknowledges_earlier_pings() {
        let (ws, mut peer) = server(Config::default(), vec![]);
        let first = tokio::spawn({
            let ws = ws.clone();
            async move { ws.ping(Some(Bytes::from_static(b"T1"))).await }
        });
        assert_eq!(&peer.recv().await.unwrap().payload[..], b"T1");
        let second = tokio::spawn({
            let ws = ws.clone();
            async move { ws.ping(Some(Bytes::from_static(b"T2"))).await }
        });
        assert_eq!(&peer.recv().await.unwrap().payload[..], b"T2");

        peer.send(Frame::new(true, Opcode::Pong, &b"T2"[..])).await;
        timeout(WAIT, first).await.unwrap().unwrap().unwrap();
        timeout(WAIT, second).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_pong_is_ignored() {
        let (ws, mut peer) = server(Config::default(), vec![]);
        let ping = tokio::spawn({
            let ws = ws.clone();
            async move { ws.ping(Some(Bytes::from_static(b"T1"))).await }
        });
        peer.recv().await.unwrap();
        peer.send(Frame::new(true, Opcode::Pong, &b"other"[..])).await;
        peer.send(Frame::text(&b"after"[..])).await;

        assert_eq!(timeout(WAIT, ws.receive()).await.unwrap().unwrap(), Message::from("after"));
        assert!(!ping.is_finished());
        peer.send(Frame::new(true, Opcode::Pong, &b"T1"[..])).await;
        timeout(WAIT, ping).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ping_without_payload_uses_random_token() {
        let (ws, mut peer) = server(Config::default(), vec![]);
        let ping = tokio::spawn({
            let ws = ws.clone();
            async move { ws.ping(None).await }
        });
        let frame = peer.recv().await.unwrap();
        assert_eq!(frame.payload.len(), 4);
        peer.send(Frame::new(true, Opcode::Pong, frame.payload)).await;
        timeout(WAIT, ping).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_close_code_sends_nothing() {
        let (ws, mut peer) = server(fast(), vec![]);
        for code in [1005, 999, 5000] {
            assert!(matches!(ws.close(code, "").await, Err(Error::Protocol(_))));
        }
        assert_eq!(ws.state(), State::Open);

        ws.send("still open").await.unwrap();
        let frame = peer.recv().await.unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
    }

    #[tokio::test]
    async fn test_close_with_silent_peer_times_out() {
        let (ws, mut peer) = server(fast(), vec![]);
        let started = Instant::now();
        ws.close(1000, "bye").await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(ws.is_closed());
        assert_eq!(ws.close_code(), Some(1006));
        let close = peer.recv().await.unwrap();
        assert_eq!(close.opcode, Opcode::Close);
        assert_eq!(&close.payload[2..], b"bye");
    }

    #[tokio::test]
    async fn test_close_when_peer_pings_but_never_reads() {
        let (ws, mut peer) = server_with_buffer(fast(), vec![], 256);
        // The pongs fill the pipe after a couple of frames and the reply write stalls.
        let flood = tokio::spawn(async move {
            let mut out = BytesMut::new();
            framing::encode(&Frame::new(true, Opcode::Ping, vec![7u8; 125]), Role::Client, &mut out).unwrap();
            for _ in 0..20 {
                if peer.io.write_all(&out).await.is_err() {
                    break;
                }
            }
            peer
        });
        sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        ws.close(1000, "").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1), "close took {:?}", started.elapsed());
        assert!(ws.is_closed());
        assert_eq!(ws.close_code(), Some(1006));
        assert!(matches!(ws.receive().await, Err(Error::Closed { code: 1006, .. })));

        sleep(Duration::from_millis(200)).await;
        assert!(ws.is_closed());
        flood.abort();
    }

    #[tokio::test]
    async fn test_peer_initiated_close() {
        let (ws, mut peer) = server(fast(), vec![]);
        peer.send(Frame::new(true, Opcode::Close, close_payload(1001, "going").unwrap())).await;

        let err = timeout(WAIT, ws.receive()).await.unwrap().unwrap_err();
        match err {
            Error::Closed { code, reason } => {
                assert_eq!(code, 1001);
                assert_eq!(reason.as_deref(), Some("going"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let echo = peer.recv().await.unwrap();
        assert_eq!(echo.opcode, Opcode::Close);
        assert_eq!(&echo.payload[..2], &1001u16.to_be_bytes());

        // The server shuts down its side first.
        assert!(peer.recv().await.is_none());
        drop(peer);
        timeout(WAIT, ws.closed()).await.unwrap();
        assert_eq!(ws.close_code(), Some(1001));
        assert!(matches!(ws.send("late").await, Err(Error::Closed { code: 1001, .. })));
    }

    #[tokio::test]
    async fn test_empty_close_records_1005() {
        let (ws, mut peer) = server(fast(), vec![]);
        peer.send(Frame::new(true, Opcode::Close, Bytes::new())).await;
        let echo = peer.recv().await.unwrap();
        assert!(echo.payload.is_empty());
        drop(peer);
        timeout(WAIT, ws.closed()).await.unwrap();
        assert_eq!(ws.close_code(), Some(1005));
    }

    #[tokio::test]
    async fn test_transport_loss_is_1006() {
        let (ws, peer) = server(fast(), vec![]);
        drop(peer);
        let err = timeout(WAIT, ws.receive()).await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Closed { code: 1006, .. }));
        timeout(WAIT, ws.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_messages_survive_close() {
        let (ws, mut peer) = server(fast(), vec![]);
        peer.send(Frame::text(&b"one"[..])).await;
        peer.send(Frame::new(true, Opcode::Close, close_payload(1000, "").unwrap())).await;
        drop(peer);
        timeout(WAIT, ws.closed()).await.unwrap();

        assert_eq!(ws.receive().await.unwrap(), Message::from("one"));
        assert!(matches!(ws.receive().await, Err(Error::Closed { code: 1000, .. })));
    }

    #[tokio::test]
    async fn test_bounded_queue_drops_oldest() {
        let (ws, mut peer) = server(fast().with_max_queue(Some(2)), vec![]);
        assert!(ws.try_receive().unwrap().is_none());
        for text in ["1", "2", "3"] {
            peer.send(Frame::text(text.as_bytes().to_vec())).await;
        }
        // The pong proves the three messages before it were read.
        peer.send(Frame::new(true, Opcode::Ping, &b"sync"[..])).await;
        peer.recv().await.unwrap();

        assert_eq!(ws.try_receive().unwrap(), Some(Message::from("2")));
        assert_eq!(ws.try_receive().unwrap(), Some(Message::from("3")));
        assert_eq!(ws.try_receive().unwrap(), None);
    }

    #[tokio::test]
    async fn test_extension_chain() {
        let invert: Arc<dyn Extension> = Arc::new(Invert { name: "x-invert" });
        let (ws, mut peer) = server(Config::default(), vec![invert.clone()]);

        peer.send(invert.encode(Frame::text(&b"hi"[..])).unwrap()).await;
        assert_eq!(timeout(WAIT, ws.receive()).await.unwrap().unwrap(), Message::from("hi"));

        ws.send("yo").await.unwrap();
        let frame = peer.recv().await.unwrap();
        assert_eq!(frame.rsv, framing::RSV1);
        assert_eq!(invert.decode(frame, usize::MAX).unwrap().payload, Bytes::from_static(b"yo"));
    }

    #[tokio::test]
    async fn test_reserved_bits_without_extension_close_with_1002() {
        let (ws, mut peer) = server(fast(), vec![]);
        let mut frame = Frame::text(&b"x"[..]);
        frame.rsv = framing::RSV1;
        peer.send(frame).await;

        let err = timeout(WAIT, ws.receive()).await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Closed { code: 1002, .. }));
    }
}
