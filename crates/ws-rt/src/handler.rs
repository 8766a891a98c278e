//! Application callbacks.
//!
//! Per connection the callbacks arrive in a fixed order: `on_connect` once,
//! then zero or more `on_message` in arrival order, then `on_disconnect`
//! exactly once. All three run on the connection's own thread, so a slow
//! handler delays only that connection.

use std::fmt;

use crossbeam_channel::{Receiver, Sender};
use tracing::trace;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::reassembly::Message;

/// Callbacks invoked by the server. Every method has a no-op default.
///
/// A panic inside a callback is caught; the connection is closed with 1011.
pub trait Handler: Send + Sync + 'static {
    fn on_connect(&self, _conn: &ConnectionHandle) {}

    fn on_message(&self, _conn: &ConnectionHandle, _message: Message) {}

    fn on_disconnect(&self, _conn: &ConnectionHandle, _reason: CloseReason) {}
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectKind {
    /// Peer sent a close frame, or closed the TCP stream.
    PeerClosed,
    /// Peer violated the protocol; the server sent a close frame with the
    /// matching code.
    ProtocolError,
    /// A read failed.
    Io,
    /// No bytes arrived within the idle timeout.
    IdleTimeout,
    /// `Server::stop` closed the connection.
    ServerShutdown,
    /// The application called `Connection::close`.
    LocalClose,
    /// A handler callback panicked.
    HandlerPanicked,
}

/// The close status reported to `on_disconnect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub kind: DisconnectKind,
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(kind: DisconnectKind, code: u16, reason: impl Into<String>) -> Self {
        CloseReason {
            kind,
            code,
            reason: reason.into(),
        }
    }

    /// True when the peer closed with a close frame or the application /
    /// server closed the connection on purpose.
    pub fn is_clean(&self) -> bool {
        matches!(
            self.kind,
            DisconnectKind::PeerClosed | DisconnectKind::LocalClose | DisconnectKind::ServerShutdown
        ) && self.code != crate::close::CloseCode::ABNORMAL
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self.kind, self.code)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

/// Handler events as values, for consumers that prefer a queue to callbacks.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Connected(ConnectionHandle),
    Message(ConnectionHandle, Message),
    Disconnected(ConnectionHandle, CloseReason),
}

impl ServerEvent {
    pub fn connection(&self) -> &ConnectionHandle {
        match self {
            ServerEvent::Connected(conn)
            | ServerEvent::Message(conn, _)
            | ServerEvent::Disconnected(conn, _) => conn,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection().id()
    }
}

/// Forwards every callback into a channel.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: Sender<ServerEvent>,
}

impl ChannelHandler {
    pub fn new(tx: Sender<ServerEvent>) -> Self {
        ChannelHandler { tx }
    }

    fn forward(&self, event: ServerEvent) {
        if self.tx.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }
}

impl Handler for ChannelHandler {
    fn on_connect(&self, conn: &ConnectionHandle) {
        self.forward(ServerEvent::Connected(conn.clone()));
    }

    fn on_message(&self, conn: &ConnectionHandle, message: Message) {
        self.forward(ServerEvent::Message(conn.clone(), message));
    }

    fn on_disconnect(&self, conn: &ConnectionHandle, reason: CloseReason) {
        self.forward(ServerEvent::Disconnected(conn.clone(), reason));
    }
}

/// An unbounded event channel and the handler feeding it.
pub fn event_channel() -> (ChannelHandler, Receiver<ServerEvent>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (ChannelHandler::new(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reason_display() {
        let reason = CloseReason::new(DisconnectKind::ServerShutdown, 1001, "server shutting down");
        assert_eq!(reason.to_string(), "ServerShutdown (1001): server shutting down");
        assert_eq!(
            CloseReason::new(DisconnectKind::PeerClosed, 1000, "").to_string(),
            "PeerClosed (1000)"
        );
    }

    #[test]
    fn clean_closes() {
        assert!(CloseReason::new(DisconnectKind::PeerClosed, 1000, "").is_clean());
        assert!(CloseReason::new(DisconnectKind::LocalClose, 4000, "").is_clean());
        assert!(!CloseReason::new(DisconnectKind::PeerClosed, 1006, "").is_clean());
        assert!(!CloseReason::new(DisconnectKind::ProtocolError, 1002, "").is_clean());
        assert!(!CloseReason::new(DisconnectKind::Io, 1006, "reset").is_clean());
    }
}
