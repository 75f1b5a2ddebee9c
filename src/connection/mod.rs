// Per-connection protocol state machine.
//
// The reactor drives `on_readable`/`on_writable`; decoded data payloads
// land on the inbound MPMC ring and are drained on executor workers via
// `pump_inbound`. Sends append encoded frames to an outbound batch under
// one mutex, which is what makes per-connection send order total.
//
// Lock hierarchy: recv -> send -> transport. Never acquire upward.

pub mod listener;

pub use listener::{ListenerConfig, WsListener};

use crate::concurrent::{Backoff, MpmcRing};
use crate::error::{Result, WsError};
use crate::memory::{alloc_unpooled, Buffer, PoolManager, SIZE_CLASSES};
use crate::protocol::close_codes;
use crate::protocol::frame::{Frame, FrameCodec, Opcode};
use crate::reactor::OsHandle;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Handshaking = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Handshaking,
            1 => ConnState::Open,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// Kind of a delivered data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// A complete data message ready for the handler. Dropping the payload
/// buffer releases it back to its pool.
#[derive(Debug)]
pub struct InboundMessage {
    pub kind: MessageKind,
    pub payload: Buffer,
}

/// Policy when the inbound ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Producer backs off until a slot frees, aborting when the
    /// connection's done-signal fires.
    Block,
    /// Oldest queued message is dropped to make room.
    DropOldest,
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Per-frame payload ceiling.
    pub max_frame_payload: usize,

    /// Ceiling for a reassembled fragmented message.
    pub max_message_payload: usize,

    /// Inbound ring capacity (messages).
    pub inbound_capacity: usize,

    /// Outbound batch flush threshold in bytes.
    pub batch_max_bytes: usize,

    /// Idle flush window for a non-empty batch.
    pub flush_interval: Duration,

    /// Bytes pulled per transport read.
    pub read_chunk: usize,

    /// Inbound overflow policy.
    pub overflow: OverflowPolicy,

    /// Validate UTF-8 of text payloads (close 1007 on violation).
    pub validate_utf8: bool,

    /// Reject unmasked input frames (server role, close 1002). Clients
    /// leave this off: server frames arrive unmasked.
    pub require_masked_input: bool,

    /// Mask outgoing frames (client role). Servers never mask.
    pub mask_outgoing: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: crate::protocol::DEFAULT_MAX_FRAME_PAYLOAD,
            max_message_payload: 4 << 20,
            inbound_capacity: 256,
            batch_max_bytes: 16 * 1024,
            flush_interval: Duration::from_millis(5),
            read_chunk: 16 * 1024,
            overflow: OverflowPolicy::Block,
            validate_utf8: true,
            require_masked_input: false,
            mask_outgoing: false,
        }
    }
}

/// Lifecycle observations, delivered in connection order.
pub trait ConnectionEvents: Send + Sync {
    fn on_open(&self, _conn_id: u64) {}
    fn on_close(&self, _conn_id: u64, _code: u16) {}
    fn on_error(&self, _conn_id: u64, _error: &WsError) {}
}

/// Events sink that ignores everything.
pub struct NoEvents;

impl ConnectionEvents for NoEvents {}

/// Inbound payload consumer. The handler owns the buffer; dropping it
/// releases it.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, connection: &WsConnection, kind: MessageKind, payload: Buffer);
}

impl<F> MessageHandler for F
where
    F: Fn(&WsConnection, MessageKind, Buffer) + Send + Sync,
{
    fn on_message(&self, connection: &WsConnection, kind: MessageKind, payload: Buffer) {
        self(connection, kind, payload)
    }
}

struct FragmentBuf {
    kind: MessageKind,
    data: Vec<u8>,
}

struct RecvState {
    /// Raw bytes awaiting decode.
    acc: Vec<u8>,
    /// In-flight fragmented message, when inside the Fragmented sub-state.
    fragment: Option<FragmentBuf>,
}

struct SendState {
    batch: Vec<u8>,
    last_flush: Instant,
}

/// A WebSocket connection over an arbitrary transport.
pub struct WsConnection {
    id: u64,
    transport: Mutex<Box<dyn Transport>>,
    pools: Arc<PoolManager>,
    codec: FrameCodec,
    config: ConnectionConfig,
    inbound: MpmcRing<InboundMessage>,
    recv: Mutex<RecvState>,
    send: Mutex<SendState>,
    state: AtomicU8,
    done: Arc<AtomicBool>,
    events: Arc<dyn ConnectionEvents>,
    numa_node: i32,
    last_pong: Mutex<Instant>,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("numa_node", &self.numa_node)
            .finish()
    }
}

impl WsConnection {
    /// Build a connection in the Handshaking state. `leftover` is any
    /// byte run the handshake read past the HTTP head; it is the start of
    /// the frame stream.
    pub fn new(
        id: u64,
        transport: Box<dyn Transport>,
        pools: Arc<PoolManager>,
        config: ConnectionConfig,
        events: Arc<dyn ConnectionEvents>,
        leftover: Vec<u8>,
    ) -> Arc<Self> {
        let codec = FrameCodec::new(config.max_frame_payload);
        let inbound = MpmcRing::new(config.inbound_capacity);
        Arc::new(Self {
            id,
            transport: Mutex::new(transport),
            pools,
            codec,
            config,
            inbound,
            recv: Mutex::new(RecvState {
                acc: leftover,
                fragment: None,
            }),
            send: Mutex::new(SendState {
                batch: Vec::new(),
                last_flush: Instant::now(),
            }),
            state: AtomicU8::new(ConnState::Handshaking as u8),
            done: Arc::new(AtomicBool::new(false)),
            events,
            numa_node: -1,
            last_pong: Mutex::new(Instant::now()),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Done-signal: raised once the connection reaches Closed.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn done_signal(&self) -> Arc<AtomicBool> {
        self.done.clone()
    }

    /// OS handle of the underlying transport, for reactor registration.
    pub fn os_handle(&self) -> OsHandle {
        self.transport.lock().os_handle()
    }

    /// Time since the last pong arrived (liveness clock).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Transition Handshaking -> Open and emit `on_open`. Called by the
    /// listener once the upgrade response is on the wire.
    pub fn open(&self) {
        if self
            .state
            .compare_exchange(
                ConnState::Handshaking as u8,
                ConnState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            tracing::debug!(conn = self.id, "connection open");
            self.events.on_open(self.id);
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Drain the transport and decode. Invoked by the reactor on
    /// readability; with edge-triggered notification this must read until
    /// `WouldBlock`.
    pub fn on_readable(&self) -> Result<()> {
        if matches!(self.state(), ConnState::Closed) {
            return Ok(());
        }

        let mut recv = self.recv.lock();
        loop {
            let mut chunk = self.pools.get(self.config.read_chunk, self.numa_node);
            let read = {
                let mut transport = self.transport.lock();
                transport.recv(chunk.bytes())
            };
            match read {
                Ok(n) => {
                    chunk.truncate(n);
                    recv.acc.extend_from_slice(chunk.as_slice());
                    self.decode_pending(&mut recv)?;
                    if matches!(self.state(), ConnState::Closed) {
                        return Ok(());
                    }
                }
                Err(e) if e.is_would_block() => break,
                Err(e) => {
                    // Abrupt transport failure: no close frame.
                    self.abort(&e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Decode every complete frame buffered in `recv.acc`.
    fn decode_pending(&self, recv: &mut RecvState) -> Result<()> {
        let mut cursor = 0usize;
        let result = loop {
            match self.codec.decode(&recv.acc[cursor..]) {
                Ok((frame, used)) => {
                    cursor += used;
                    if let Err(e) = self.handle_frame(recv, frame) {
                        break Err(e);
                    }
                    if matches!(self.state(), ConnState::Closed) {
                        break Ok(());
                    }
                }
                // An incomplete tail is not an error until EOF.
                Err(WsError::Truncated { .. }) => break Ok(()),
                Err(e @ WsError::PayloadTooLarge { .. }) => {
                    break Err(self.fail(close_codes::MESSAGE_TOO_BIG, e));
                }
                Err(e) => {
                    break Err(self.fail(close_codes::PROTOCOL_ERROR, e));
                }
            }
        };
        recv.acc.drain(..cursor);
        result
    }

    fn handle_frame(&self, recv: &mut RecvState, frame: Frame) -> Result<()> {
        if self.config.require_masked_input && frame.mask.is_none() {
            return Err(self.fail(
                close_codes::PROTOCOL_ERROR,
                WsError::ProtocolError("unmasked frame from client".into()),
            ));
        }
        match frame.opcode {
            Opcode::Ping => {
                // Pong mirrors the ping payload.
                self.send_control(Frame::pong(frame.payload))
            }
            Opcode::Pong => {
                *self.last_pong.lock() = Instant::now();
                Ok(())
            }
            Opcode::Close => self.handle_peer_close(frame.payload),
            Opcode::Text | Opcode::Binary => {
                let kind = if frame.opcode == Opcode::Text {
                    MessageKind::Text
                } else {
                    MessageKind::Binary
                };
                if recv.fragment.is_some() {
                    return Err(self.fail(
                        close_codes::PROTOCOL_ERROR,
                        WsError::ProtocolError(
                            "data frame interleaved with a fragmented message".into(),
                        ),
                    ));
                }
                if frame.fin {
                    self.deliver(kind, frame.payload)
                } else {
                    recv.fragment = Some(FragmentBuf {
                        kind,
                        data: frame.payload,
                    });
                    Ok(())
                }
            }
            Opcode::Continuation => match recv.fragment.take() {
                None => Err(self.fail(
                    close_codes::PROTOCOL_ERROR,
                    WsError::ProtocolError(
                        "continuation without a preceding data frame".into(),
                    ),
                )),
                Some(mut fragment) => {
                    let total = fragment.data.len() + frame.payload.len();
                    if total > self.config.max_message_payload {
                        return Err(self.fail(
                            close_codes::MESSAGE_TOO_BIG,
                            WsError::PayloadTooLarge {
                                len: total as u64,
                                max: self.config.max_message_payload,
                            },
                        ));
                    }
                    fragment.data.extend_from_slice(&frame.payload);
                    if frame.fin {
                        self.deliver(fragment.kind, fragment.data)
                    } else {
                        recv.fragment = Some(fragment);
                        Ok(())
                    }
                }
            },
        }
    }

    /// Publish a complete message onto the inbound ring.
    fn deliver(&self, kind: MessageKind, data: Vec<u8>) -> Result<()> {
        if kind == MessageKind::Text && self.config.validate_utf8 {
            if let Err(e) = std::str::from_utf8(&data) {
                return Err(self.fail(
                    close_codes::INVALID_PAYLOAD,
                    WsError::Encoding(format!("invalid UTF-8 in text message: {e}")),
                ));
            }
        }

        let largest_class = SIZE_CLASSES[SIZE_CLASSES.len() - 1];
        let mut payload = if data.len() > largest_class {
            // Reassembled messages can outgrow the class ceiling.
            alloc_unpooled(data.len(), crate::memory::numa::resolve_hint(self.numa_node))
        } else {
            self.pools.get(data.len(), self.numa_node)
        };
        payload.bytes().copy_from_slice(&data);

        let mut message = InboundMessage { kind, payload };
        let mut backoff = Backoff::new();
        loop {
            match self.inbound.push(message) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    message = back;
                    match self.config.overflow {
                        OverflowPolicy::DropOldest => {
                            if self.inbound.pop().is_some() {
                                tracing::trace!(
                                    conn = self.id,
                                    "inbound ring full; dropped oldest message"
                                );
                            }
                        }
                        OverflowPolicy::Block => {
                            if self.is_done() {
                                return Err(WsError::Closed);
                            }
                            backoff.snooze();
                        }
                    }
                }
            }
        }
    }

    /// Pop one delivered message. `Ok(None)` means the ring is empty but
    /// the connection is alive; a done connection yields `Closed`.
    pub fn recv_message(&self) -> Result<Option<InboundMessage>> {
        match self.inbound.pop() {
            Some(message) => Ok(Some(message)),
            None if self.is_done() => Err(WsError::Closed),
            None => Ok(None),
        }
    }

    /// Drain the inbound ring through `handler`. Returns the number of
    /// messages handled.
    pub fn pump_inbound(&self, handler: &dyn MessageHandler) -> usize {
        let mut handled = 0;
        while let Some(message) = self.inbound.pop() {
            handler.on_message(self, message.kind, message.payload);
            handled += 1;
        }
        handled
    }

    /// Messages currently queued inbound.
    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Queue a text frame.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send_frame(Opcode::Text, text.as_bytes())
    }

    /// Queue a binary frame.
    pub fn send_binary(&self, payload: &[u8]) -> Result<()> {
        self.send_frame(Opcode::Binary, payload)
    }

    /// Queue a ping carrying `payload`.
    pub fn send_ping(&self, payload: &[u8]) -> Result<()> {
        if self.state() != ConnState::Open {
            return Err(WsError::Closed);
        }
        self.send_control(Frame::ping(payload.to_vec()))
    }

    /// Encode and enqueue a data frame. Frames leave the socket in
    /// `send_frame` call order.
    pub fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        if self.state() != ConnState::Open {
            return Err(WsError::Closed);
        }
        let frame = Frame {
            fin: true,
            opcode,
            mask: None,
            payload: payload.to_vec(),
        };

        let mut send = self.send.lock();
        self.codec
            .encode_into(&frame, self.config.mask_outgoing, &mut send.batch)?;
        if send.batch.len() >= self.config.batch_max_bytes {
            self.flush_locked(&mut send)?;
        }
        Ok(())
    }

    /// Control frames bypass batching: they are appended in order and the
    /// batch is flushed immediately.
    fn send_control(&self, frame: Frame) -> Result<()> {
        let mut send = self.send.lock();
        self.codec
            .encode_into(&frame, self.config.mask_outgoing, &mut send.batch)?;
        self.flush_locked(&mut send)
    }

    /// Explicit flush signal.
    pub fn flush(&self) -> Result<()> {
        let mut send = self.send.lock();
        self.flush_locked(&mut send)
    }

    /// Flush when the idle window elapsed with bytes pending. Driven by
    /// the engine's timer tick.
    pub fn maybe_flush_idle(&self) -> Result<()> {
        let mut send = self.send.lock();
        if !send.batch.is_empty() && send.last_flush.elapsed() >= self.config.flush_interval {
            self.flush_locked(&mut send)?;
        }
        Ok(())
    }

    /// Writable-readiness callback: push out any partial batch.
    pub fn on_writable(&self) -> Result<()> {
        self.flush()
    }

    fn flush_locked(&self, send: &mut SendState) -> Result<()> {
        if send.batch.is_empty() {
            return Ok(());
        }

        let mut written = 0usize;
        let result = loop {
            let remaining = &send.batch[written..];
            if remaining.is_empty() {
                break Ok(());
            }
            let outcome = {
                let mut transport = self.transport.lock();
                transport.send_vectored(&[IoSlice::new(remaining)])
            };
            match outcome {
                // A zero-length write cannot make progress; leave the
                // residue for the next writable event.
                Ok(0) => break Ok(()),
                Ok(n) => written += n,
                Err(e) if e.is_would_block() => break Ok(()),
                Err(e) => {
                    self.abort(&e);
                    break Err(e);
                }
            }
        };

        send.batch.drain(..written);
        send.last_flush = Instant::now();
        result
    }

    /// Bytes waiting in the outbound batch.
    pub fn outbound_len(&self) -> usize {
        self.send.lock().batch.len()
    }

    // ------------------------------------------------------------------
    // Close handling
    // ------------------------------------------------------------------

    /// Initiate a close handshake with `code`.
    pub fn close(&self, code: u16, reason: &str) -> Result<()> {
        if self
            .state
            .compare_exchange(
                ConnState::Open as u8,
                ConnState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }
        tracing::debug!(conn = self.id, code, "closing connection");
        self.send_control(Frame::close(code, reason))
    }

    fn handle_peer_close(&self, payload: Vec<u8>) -> Result<()> {
        let code = match payload.len() {
            0 => close_codes::NO_STATUS,
            1 => {
                return Err(self.fail(
                    close_codes::PROTOCOL_ERROR,
                    WsError::ProtocolError("close frame with a one-byte payload".into()),
                ));
            }
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                if !close_codes::is_valid_on_wire(code) {
                    return Err(self.fail(
                        close_codes::PROTOCOL_ERROR,
                        WsError::ProtocolError(format!("invalid close code {code}")),
                    ));
                }
                code
            }
        };

        if self.state() == ConnState::Open {
            // Echo the peer's code (or a codeless close) and finish.
            self.set_state(ConnState::Closing);
            let reply = if payload.is_empty() {
                Frame::close_empty()
            } else {
                Frame::close(code, "")
            };
            let _ = self.send_control(reply);
        }
        self.finish_close(code);
        Ok(())
    }

    /// Protocol-level failure: send Close(code), surface the error, and
    /// tear down.
    fn fail(&self, code: u16, error: WsError) -> WsError {
        if matches!(self.state(), ConnState::Open | ConnState::Handshaking) {
            self.set_state(ConnState::Closing);
            let _ = self.send_control(Frame::close(code, ""));
        }
        self.events.on_error(self.id, &error);
        self.finish_close(code);
        error
    }

    /// Abrupt transport failure: no close frame, straight to Closed.
    fn abort(&self, error: &WsError) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(conn = self.id, error = %error, "transport error; aborting");
        self.events.on_error(self.id, error);
        self.set_state(ConnState::Closed);
        let _ = self.transport.lock().close();
        self.events.on_close(self.id, close_codes::ABNORMAL);
    }

    fn finish_close(&self, code: u16) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ConnState::Closed);
        let _ = self.transport.lock().close();
        tracing::debug!(conn = self.id, code, "connection closed");
        self.events.on_close(self.id, code);
    }
}
