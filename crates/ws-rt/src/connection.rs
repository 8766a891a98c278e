//! One upgraded client connection.
//!
//! A [`Connection`] is shared between its read loop (one OS thread per
//! connection) and any thread that sends to it. Writes go through a single
//! per-connection lock so frames never interleave; the receive buffer and
//! reassembly state live on the read loop's stack and are never shared.

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::close::{close_frame, reply_code, CloseCode};
use crate::config::ServerConfig;
use crate::error::{FrameError, Result, WsError};
use crate::frame::{decode_with_limit, encode_into, Frame, Opcode};
use crate::handler::{CloseReason, DisconnectKind, Handler};
use crate::handshake::HandshakeRequest;
use crate::reassembly::{Event, Reassembler};

pub type ConnectionId = u64;

/// Shared handle to a live (or recently closed) connection.
pub type ConnectionHandle = Arc<Connection>;

/// Floor for the write timeout put on the socket before a close frame.
const MIN_CLOSE_WAIT: Duration = Duration::from_millis(10);

pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    request: HandshakeRequest,
    /// Computed once during the handshake.
    accept_key: String,
    connected_at: Instant,
    writer: Mutex<TcpStream>,
    /// Second handle on the socket so shutdown never waits on the write lock.
    control: TcpStream,
    closed: AtomicBool,
    close_sent: AtomicBool,
    /// How long a close may wait on the write lock, the close frame write and
    /// the peer's reply before the socket is shut down.
    close_timeout: Duration,
    /// Set when the close was started outside the read loop (application
    /// close or server shutdown); reported in preference to whatever the read
    /// loop observes afterwards.
    local_close: Mutex<Option<CloseReason>>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        request: HandshakeRequest,
        accept_key: String,
        stream: &TcpStream,
        close_timeout: Duration,
    ) -> std::io::Result<Connection> {
        Ok(Connection {
            id,
            peer_addr,
            request,
            accept_key,
            connected_at: Instant::now(),
            writer: Mutex::new(stream.try_clone()?),
            control: stream.try_clone()?,
            closed: AtomicBool::new(false),
            close_sent: AtomicBool::new(false),
            close_timeout,
            local_close: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The parsed upgrade request.
    pub fn request(&self) -> &HandshakeRequest {
        &self.request
    }

    /// The client's `Sec-WebSocket-Key`.
    pub fn key(&self) -> &str {
        &self.request.key
    }

    /// The `Sec-WebSocket-Accept` value sent in the upgrade response.
    pub fn accept_key(&self) -> &str {
        &self.accept_key
    }

    pub fn version(&self) -> Option<&str> {
        self.request.version.as_deref()
    }

    pub fn protocols(&self) -> &[String] {
        &self.request.protocols
    }

    pub fn extensions(&self) -> &[String] {
        &self.request.extensions
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// False once a close frame has been sent or the read loop has ended.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.close_sent.load(Ordering::SeqCst)
    }

    /// Send a text message as a single unmasked frame.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send_frame(Opcode::Text, text.as_bytes())
    }

    pub fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.send_frame(Opcode::Binary, data)
    }

    /// Start the close handshake. Sends at most one close frame over the
    /// lifetime of the connection; later calls fail with
    /// [`WsError::ConnectionClosed`].
    ///
    /// A peer that has not answered within the close timeout has its socket
    /// shut down, which ends the read loop with this close as the reason.
    pub fn close(self: &Arc<Self>, code: u16, reason: &str) -> Result<()> {
        let reason = CloseReason::new(DisconnectKind::LocalClose, code, reason);
        if !self.close_with(reason, self.close_timeout) {
            return Err(WsError::ConnectionClosed);
        }
        arm_close_timer(Arc::downgrade(self), self.close_timeout);
        Ok(())
    }

    fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        // Checked under the lock so a send can never follow the close frame.
        if !self.is_open() {
            return Err(WsError::ConnectionClosed);
        }
        encode_into(&mut *writer, opcode, payload, true)?;
        trace!(conn_id = self.id, ?opcode, len = payload.len(), "frame sent");
        Ok(())
    }

    pub(crate) fn send_pong(&self, payload: &[u8]) -> Result<()> {
        self.send_frame(Opcode::Pong, payload)
    }

    /// Record `reason` as the outcome and send its close frame, waiting at
    /// most `wait` for the writer.
    pub(crate) fn close_with(&self, reason: CloseReason, wait: Duration) -> bool {
        {
            let mut local = self.local_close.lock();
            if local.is_none() && !self.close_sent.load(Ordering::SeqCst) {
                *local = Some(reason.clone());
            }
        }
        self.send_close_within(reason.code, &reason.reason, wait)
    }

    pub(crate) fn send_close(&self, code: u16, reason: &str) -> bool {
        self.send_close_within(code, reason, self.close_timeout)
    }

    /// Send a close frame and half-close the write side. Returns false if a
    /// close frame was already sent or the connection is gone.
    ///
    /// A writer stuck on a peer that stopped reading holds the write lock
    /// indefinitely; if the lock is not free within `wait` the socket is shut
    /// down instead, which fails the stuck write.
    pub(crate) fn send_close_within(&self, code: u16, reason: &str, wait: Duration) -> bool {
        let Some(mut writer) = self.writer.try_lock_for(wait) else {
            if self.closed.load(Ordering::SeqCst) || self.close_sent.swap(true, Ordering::SeqCst) {
                return false;
            }
            debug!(conn_id = self.id, code, "writer busy, shutting down socket instead of sending close");
            self.shutdown_socket();
            return true;
        };
        if self.closed.load(Ordering::SeqCst) || self.close_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = writer.set_write_timeout(Some(wait.max(MIN_CLOSE_WAIT))) {
            debug!(conn_id = self.id, error = %e, "failed to set close write timeout");
        }
        let bytes = close_frame(code, reason);
        let result = writer.write_all(&bytes).and_then(|()| writer.flush());
        if let Err(e) = result {
            debug!(conn_id = self.id, code, error = %e, "failed to send close frame");
        }
        let _ = writer.shutdown(Shutdown::Write);
        debug!(conn_id = self.id, code, reason, "close frame sent");
        true
    }

    /// Tear the socket down in both directions, unblocking the read loop.
    pub(crate) fn shutdown_socket(&self) {
        let _ = self.control.shutdown(Shutdown::Both);
    }

    /// Returns true for the first caller only.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    fn take_local_close(&self) -> Option<CloseReason> {
        self.local_close.lock().take()
    }
}

/// Shut the socket down if the read loop is still running after `timeout`.
/// Holds only a weak handle so a finished connection is not kept alive.
fn arm_close_timer(conn: Weak<Connection>, timeout: Duration) {
    let spawned = std::thread::Builder::new()
        .name("ws-close-timer".into())
        .spawn(move || {
            std::thread::sleep(timeout);
            if let Some(conn) = conn.upgrade() {
                if !conn.closed.load(Ordering::SeqCst) {
                    debug!(conn_id = conn.id, "no close reply from peer, shutting down socket");
                    conn.shutdown_socket();
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to spawn close timer");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Growable receive buffer with a read cursor.
///
/// Bytes before the cursor have been decoded; [`ReceiveBuffer::compact`]
/// discards them before the next socket read.
#[derive(Debug, Default)]
pub(crate) struct ReceiveBuffer {
    data: Vec<u8>,
    cursor: usize,
}

impl ReceiveBuffer {
    pub(crate) fn new(initial: Vec<u8>) -> Self {
        ReceiveBuffer {
            data: initial,
            cursor: 0,
        }
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub(crate) fn unread(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Decode the next complete frame at the cursor and advance past it.
    pub(crate) fn next_frame(&mut self, max_payload: u64) -> std::result::Result<Option<Frame>, FrameError> {
        let decoded = decode_with_limit(&self.data[self.cursor..], max_payload)?;
        Ok(decoded.map(|(frame, used)| {
            self.cursor += used;
            frame
        }))
    }

    pub(crate) fn compact(&mut self) {
        if self.cursor > 0 {
            self.data.drain(..self.cursor);
            self.cursor = 0;
        }
    }

    pub(crate) fn release(&mut self) {
        self.data = Vec::new();
        self.cursor = 0;
    }
}

/// Run a handler callback, turning a panic into `false`.
pub(crate) fn guarded<F: FnOnce()>(conn_id: ConnectionId, callback: &str, f: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(_) => {
            warn!(conn_id, callback, "handler panicked");
            false
        }
    }
}

fn protocol_error(conn: &Connection, code: u16, error: &dyn std::error::Error) -> CloseReason {
    warn!(conn_id = conn.id, peer = %conn.peer_addr, code, error = %error, "protocol violation");
    let reason = error.to_string();
    conn.send_close(code, &reason);
    CloseReason::new(DisconnectKind::ProtocolError, code, reason)
}

/// Drive one connection until it ends. Returns the outcome to report to
/// `on_disconnect`; the caller releases the socket.
pub(crate) fn read_loop(
    conn: &ConnectionHandle,
    mut reader: TcpStream,
    leftover: Vec<u8>,
    config: &ServerConfig,
    handler: &dyn Handler,
) -> CloseReason {
    let mut buffer = ReceiveBuffer::new(leftover);
    let mut reassembler = Reassembler::new(config.max_message_size);
    let mut chunk = vec![0u8; config.read_buffer_size];
    let max_frame = config.max_frame_size as u64;

    let outcome = 'conn: loop {
        loop {
            let frame = match buffer.next_frame(max_frame) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => break 'conn protocol_error(conn, e.close_code(), &e),
            };
            if config.require_masked_frames && !frame.masked {
                let e = FrameError::Unmasked;
                break 'conn protocol_error(conn, e.close_code(), &e);
            }
            trace!(
                conn_id = conn.id,
                opcode = ?frame.opcode,
                fin = frame.fin,
                len = frame.payload_length,
                "frame received"
            );

            match reassembler.push(frame) {
                Ok(None) => {}
                Ok(Some(Event::Message(message))) => {
                    debug!(conn_id = conn.id, kind = ?message.kind, len = message.data.len(), "message received");
                    if !guarded(conn.id, "on_message", || handler.on_message(conn, message)) {
                        conn.send_close(CloseCode::INTERNAL_ERROR, "internal error");
                        break 'conn CloseReason::new(
                            DisconnectKind::HandlerPanicked,
                            CloseCode::INTERNAL_ERROR,
                            "handler panicked",
                        );
                    }
                }
                Ok(Some(Event::Ping(payload))) => {
                    if let Err(e) = conn.send_pong(&payload) {
                        debug!(conn_id = conn.id, error = %e, "pong not sent");
                    }
                }
                Ok(Some(Event::Pong(_))) => {
                    trace!(conn_id = conn.id, "pong ignored");
                }
                Ok(Some(Event::Close { code, reason })) => {
                    debug!(conn_id = conn.id, code, reason = %reason, "close frame received");
                    conn.send_close(reply_code(code), "");
                    break 'conn CloseReason::new(DisconnectKind::PeerClosed, code, reason);
                }
                Err(e) => break 'conn protocol_error(conn, e.close_code(), &e),
            }
        }

        buffer.compact();
        match reader.read(&mut chunk) {
            Ok(0) => {
                break CloseReason::new(DisconnectKind::PeerClosed, CloseCode::ABNORMAL, "");
            }
            Ok(n) => buffer.extend(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                debug!(conn_id = conn.id, buffered = buffer.unread(), "idle timeout");
                conn.send_close(CloseCode::GOING_AWAY, "idle timeout");
                break CloseReason::new(DisconnectKind::IdleTimeout, CloseCode::GOING_AWAY, "idle timeout");
            }
            Err(e) => {
                break CloseReason::new(DisconnectKind::Io, CloseCode::ABNORMAL, e.to_string());
            }
        }
    };

    buffer.release();
    reassembler.reset();
    conn.take_local_close().unwrap_or(outcome)
}
