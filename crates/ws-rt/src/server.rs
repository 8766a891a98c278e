//! Listening socket, accept loop and connection registry.
//!
//! One OS thread runs the accept loop; every accepted socket gets its own
//! thread for the handshake and the read loop. The registry is the only
//! state shared between those threads.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::close::CloseCode;
use crate::config::ServerConfig;
use crate::connection::{guarded, read_loop, Connection, ConnectionHandle, ConnectionId};
use crate::error::{Result, WsError};
use crate::handler::{CloseReason, DisconnectKind, Handler};
use crate::handshake::perform_upgrade;

const WAKE_TIMEOUT: Duration = Duration::from_millis(500);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Outcome of [`Server::broadcast`].
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<(ConnectionId, WsError)>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Default)]
struct RegistryInner {
    live: FxHashMap<ConnectionId, ConnectionHandle>,
    /// Accepted sockets still in the handshake.
    pending: FxHashMap<ConnectionId, TcpStream>,
    /// Connection threads that have not finished their disconnect callback.
    sessions: usize,
    sealed: bool,
}

/// Live connections, guarded by one lock. Waiters are woken whenever a
/// connection thread finishes.
#[derive(Default)]
pub(crate) struct Registry {
    inner: Mutex<RegistryInner>,
    idle: Condvar,
}

impl Registry {
    /// Track a freshly accepted socket. Refused once the server is stopping.
    fn admit(&self, id: ConnectionId, stream: TcpStream) -> bool {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return false;
        }
        inner.pending.insert(id, stream);
        inner.sessions += 1;
        true
    }

    /// Move a handshaken connection into the live set.
    fn promote(&self, conn: &ConnectionHandle) -> bool {
        let mut inner = self.inner.lock();
        inner.pending.remove(&conn.id());
        if inner.sealed {
            return false;
        }
        inner.live.insert(conn.id(), conn.clone());
        true
    }

    fn unregister(&self, id: ConnectionId) {
        let mut inner = self.inner.lock();
        inner.live.remove(&id);
        inner.pending.remove(&id);
    }

    fn finish(&self, id: ConnectionId) {
        let mut inner = self.inner.lock();
        inner.live.remove(&id);
        inner.pending.remove(&id);
        inner.sessions = inner.sessions.saturating_sub(1);
        self.idle.notify_all();
    }

    fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner.lock().live.get(&id).cloned()
    }

    fn snapshot(&self) -> Vec<ConnectionHandle> {
        let mut conns: Vec<_> = self.inner.lock().live.values().cloned().collect();
        conns.sort_by_key(|c| c.id());
        conns
    }

    fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    fn seal(&self) {
        self.inner.lock().sealed = true;
    }

    fn unseal(&self) {
        self.inner.lock().sealed = false;
    }

    fn shutdown_pending(&self) {
        for stream in self.inner.lock().pending.values() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn shutdown_all(&self) {
        let inner = self.inner.lock();
        for stream in inner.pending.values() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        for conn in inner.live.values() {
            conn.shutdown_socket();
        }
    }

    /// Wait until every connection thread has finished. Returns false on
    /// timeout.
    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.sessions > 0 {
            if self.idle.wait_until(&mut inner, deadline).timed_out() {
                return inner.sessions == 0;
            }
        }
        true
    }

    fn sessions(&self) -> usize {
        self.inner.lock().sessions
    }
}

/// Marks a connection thread finished however it exits.
struct Session {
    shared: Arc<Shared>,
    id: ConnectionId,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.registry.finish(self.id);
    }
}

#[derive(Default)]
struct Shared {
    registry: Registry,
    stopping: AtomicBool,
    next_id: AtomicU64,
}

struct AcceptState {
    thread: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// A WebSocket server.
///
/// ```no_run
/// use ws_rt::{event_channel, Server, ServerConfig, ServerEvent};
///
/// let (handler, events) = event_channel();
/// let server = Server::new(ServerConfig::bind("127.0.0.1", 9001), handler);
/// server.start()?;
/// for event in events {
///     if let ServerEvent::Message(conn, msg) = event {
///         conn.send_text(msg.as_text().unwrap_or_default())?;
///     }
/// }
/// # Ok::<(), ws_rt::WsError>(())
/// ```
pub struct Server {
    config: Arc<ServerConfig>,
    handler: Arc<dyn Handler>,
    shared: Arc<Shared>,
    accept: Mutex<Option<AcceptState>>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: impl Handler) -> Server {
        Server::with_handler(config, Arc::new(handler))
    }

    pub fn with_handler(config: ServerConfig, handler: Arc<dyn Handler>) -> Server {
        Server {
            config: Arc::new(config),
            handler,
            shared: Arc::new(Shared::default()),
            accept: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind, listen and start accepting on a background thread.
    ///
    /// Returns the bound address (useful with port 0). A stopped server can
    /// be started again.
    pub fn start(&self) -> Result<SocketAddr> {
        self.config.validate()?;
        let mut accept = self.accept.lock();
        if accept.is_some() {
            return Err(WsError::AlreadyStarted);
        }

        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)?;
        let local_addr = listener.local_addr()?;
        self.shared.stopping.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        let config = self.config.clone();
        let handler = self.handler.clone();
        let thread = std::thread::Builder::new()
            .name(format!("ws-accept-{}", local_addr.port()))
            .spawn(move || accept_loop(listener, shared, config, handler))?;

        info!(addr = %local_addr, "websocket server listening");
        *accept = Some(AcceptState { thread, local_addr });
        Ok(local_addr)
    }

    /// Stop accepting, close every connection with 1001 and wait for their
    /// disconnect callbacks. Sockets that have not finished closing within
    /// the shutdown grace period are shut down forcibly. No-op when the
    /// server is not running.
    pub fn stop(&self) {
        let Some(state) = self.accept.lock().take() else {
            return;
        };
        info!(addr = %state.local_addr, "stopping websocket server");

        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.registry.seal();

        // The accept loop is blocked in accept(); a throwaway connection
        // wakes it so it can observe the stop flag.
        if let Err(e) = TcpStream::connect_timeout(&wake_addr(state.local_addr), WAKE_TIMEOUT) {
            debug!(error = %e, "wake-up connect failed");
        }
        if state.thread.join().is_err() {
            warn!("accept thread panicked");
        }

        let registry = &self.shared.registry;
        registry.shutdown_pending();
        let grace = self.config.shutdown_grace();
        // Every close frame shares one grace period so a stuck writer cannot
        // hold up the rest.
        let deadline = Instant::now() + grace;
        for conn in registry.snapshot() {
            conn.close_with(
                CloseReason::new(DisconnectKind::ServerShutdown, CloseCode::GOING_AWAY, "server shutting down"),
                deadline.saturating_duration_since(Instant::now()),
            );
        }

        if !registry.wait_idle(grace) {
            warn!(
                remaining = registry.sessions(),
                "connections still open after grace period, forcing shutdown"
            );
            registry.shutdown_all();
            if !registry.wait_idle(grace) {
                warn!(remaining = registry.sessions(), "connection threads did not finish");
            }
        }

        registry.unseal();
        info!(addr = %state.local_addr, "websocket server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.accept.lock().is_some()
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.accept.lock().as_ref().map(|s| s.local_addr)
    }

    /// Snapshot of the live connections, ordered by id.
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.shared.registry.snapshot()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.shared.registry.get(id)
    }

    /// Send a text message to one connection.
    pub fn send(&self, id: ConnectionId, text: &str) -> Result<()> {
        let conn = self.get(id).ok_or(WsError::UnknownConnection(id))?;
        conn.send_text(text)
    }

    /// Send a text message to every live connection except `excluding`.
    ///
    /// A failed send is logged and reported; it never stops delivery to the
    /// remaining connections.
    pub fn broadcast(&self, text: &str, excluding: Option<ConnectionId>) -> BroadcastReport {
        let conns = self.shared.registry.snapshot();
        let mut report = BroadcastReport::default();
        for conn in conns.iter().filter(|c| Some(c.id()) != excluding) {
            match conn.send_text(text) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(conn_id = conn.id(), error = %e, "failed to send broadcast to client");
                    report.failed.push((conn.id(), e));
                }
            }
        }
        debug!(
            recipients = report.delivered,
            failed = report.failed.len(),
            "broadcast"
        );
        report
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Where to connect to wake an accept loop bound to `addr`.
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    let mut wake = addr;
    if addr.ip().is_unspecified() {
        match addr {
            SocketAddr::V4(_) => wake.set_ip([127, 0, 0, 1].into()),
            SocketAddr::V6(_) => wake.set_ip(std::net::Ipv6Addr::LOCALHOST.into()),
        }
    }
    wake
}

fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    config: Arc<ServerConfig>,
    handler: Arc<dyn Handler>,
) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if shared.stopping.load(Ordering::SeqCst) {
                    break;
                }
                warn!(error = %e, "accept failed");
                std::thread::sleep(ACCEPT_BACKOFF);
                continue;
            }
        };
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }

        let id = shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let tracked = match stream.try_clone() {
            Ok(clone) => clone,
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed to clone accepted socket");
                continue;
            }
        };
        if !shared.registry.admit(id, tracked) {
            break;
        }
        let session = Session {
            shared: shared.clone(),
            id,
        };
        let config = config.clone();
        let handler = handler.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("ws-conn-{}", id))
            .spawn(move || serve_connection(session, stream, peer, &config, &*handler));
        if let Err(e) = spawned {
            // The closure (and its Session) was dropped, so the slot is freed.
            warn!(conn_id = id, error = %e, "failed to spawn connection thread");
        }
    }
    debug!("accept loop exited");
}

fn serve_connection(
    session: Session,
    mut stream: TcpStream,
    peer: SocketAddr,
    config: &ServerConfig,
    handler: &dyn Handler,
) {
    let id = session.id;
    let registry = &session.shared.registry;

    if let Err(e) = stream.set_read_timeout(Some(config.handshake_timeout())) {
        warn!(conn_id = id, error = %e, "failed to set handshake timeout");
    }
    let upgrade = match perform_upgrade(&mut stream, config.max_handshake_bytes) {
        Ok(upgrade) => upgrade,
        Err(e) => {
            debug!(conn_id = id, peer = %peer, error = %e, "handshake failed");
            return;
        }
    };
    if let Err(e) = stream.set_read_timeout(config.idle_timeout()) {
        warn!(conn_id = id, error = %e, "failed to set idle timeout");
    }
    debug!(
        conn_id = id,
        request = %upgrade.request.request_line,
        version = upgrade.request.version.as_deref().unwrap_or("-"),
        "handshake complete"
    );

    let conn: ConnectionHandle = match Connection::new(
        id,
        peer,
        upgrade.request,
        upgrade.accept_key,
        &stream,
        config.shutdown_grace(),
    ) {
        Ok(conn) => Arc::new(conn),
        Err(e) => {
            warn!(conn_id = id, error = %e, "failed to clone connection socket");
            return;
        }
    };
    if !registry.promote(&conn) {
        conn.send_close(CloseCode::GOING_AWAY, "server shutting down");
        conn.shutdown_socket();
        return;
    }

    info!(conn_id = id, peer = %peer, "client connected");
    let reason = if guarded(id, "on_connect", || handler.on_connect(&conn)) {
        read_loop(&conn, stream, upgrade.leftover, config, handler)
    } else {
        conn.send_close(CloseCode::INTERNAL_ERROR, "internal error");
        CloseReason::new(DisconnectKind::HandlerPanicked, CloseCode::INTERNAL_ERROR, "handler panicked")
    };

    conn.shutdown_socket();
    conn.mark_closed();
    registry.unregister(id);
    info!(conn_id = id, peer = %peer, code = reason.code, kind = ?reason.kind, "client disconnected");
    guarded(id, "on_disconnect", || handler.on_disconnect(&conn, reason));
    // `session` drops here and wakes anyone waiting in `stop`.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::event_channel;
    use std::net::Ipv4Addr;

    #[test]
    fn wake_addr_replaces_unspecified() {
        let any: SocketAddr = (Ipv4Addr::UNSPECIFIED, 9000).into();
        assert_eq!(wake_addr(any), "127.0.0.1:9000".parse().unwrap());
        let v6: SocketAddr = "[::]:9000".parse().unwrap();
        assert_eq!(wake_addr(v6), "[::1]:9000".parse().unwrap());
        let local: SocketAddr = "10.1.2.3:80".parse().unwrap();
        assert_eq!(wake_addr(local), local);
    }

    #[test]
    fn registry_refuses_when_sealed() {
        let registry = Registry::default();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        registry.seal();
        assert!(!registry.admit(1, stream.try_clone().unwrap()));
        registry.unseal();
        assert!(registry.admit(1, stream));
        assert_eq!(registry.sessions(), 1);
        assert!(!registry.wait_idle(Duration::from_millis(10)));
        registry.finish(1);
        assert!(registry.wait_idle(Duration::from_millis(10)));
    }

    #[test]
    fn start_twice_and_stop_idempotent() {
        let (handler, _events) = event_channel();
        let server = Server::new(ServerConfig::bind("127.0.0.1", 0), handler);
        assert!(!server.is_running());
        server.stop();

        let addr = server.start().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert!(matches!(server.start(), Err(WsError::AlreadyStarted)));

        server.stop();
        server.stop();
        assert!(!server.is_running());
        assert_eq!(server.local_addr(), None);

        // Restart after stop.
        assert!(server.start().is_ok());
    }

    #[test]
    fn start_rejects_invalid_config() {
        let (handler, _events) = event_channel();
        let config = ServerConfig {
            read_buffer_size: 0,
            ..ServerConfig::bind("127.0.0.1", 0)
        };
        let server = Server::new(config, handler);
        assert!(matches!(server.start(), Err(WsError::Config(_))));
    }

    #[test]
    fn send_to_unknown_connection() {
        let (handler, _events) = event_channel();
        let server = Server::new(ServerConfig::bind("127.0.0.1", 0), handler);
        assert!(matches!(server.send(42, "x"), Err(WsError::UnknownConnection(42))));
        let report = server.broadcast("nobody", None);
        assert_eq!(report.delivered, 0);
        assert!(report.is_complete());
    }
}
