//! RFC 6455 WebSocket server over plain TCP.
//!
//! Blocking I/O with one OS thread per connection. The protocol layers are
//! usable on their own:
//!
//! - [`frame`] and [`mask`]: the wire codec
//! - [`handshake`]: the HTTP upgrade
//! - [`reassembly`]: fragmented messages
//! - [`close`]: close payloads and status codes
//!
//! [`Server`] ties them together and reports connection lifecycle events
//! through a [`Handler`].

pub mod close;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod mask;
pub mod reassembly;
pub mod server;

pub use close::CloseCode;
pub use config::ServerConfig;
pub use connection::{Connection, ConnectionHandle, ConnectionId};
pub use error::{FrameError, HandshakeError, ReassemblyError, Result, WsError};
pub use frame::{Frame, Opcode};
pub use handler::{event_channel, ChannelHandler, CloseReason, DisconnectKind, Handler, ServerEvent};
pub use reassembly::{Message, MessageKind};
pub use server::{BroadcastReport, Server};
