// ABOUTME: Reusable embeddable network server library over TCP, UDP, and WebSocket-over-TCP
// ABOUTME: Re-exports the public surface: Server, DatagramServer, ConnectionHandle, config, framing, errors

//! `netcore` is a reusable, embeddable network server library. It accepts
//! client connections over TCP, UDP, and WebSocket-over-TCP, delivers framed
//! application messages to user-supplied handlers, and gives callers a
//! non-blocking, back-pressured send path.
//!
//! The event loop and raw socket I/O are provided by the Tokio runtime; this
//! crate owns everything above that: per-connection lifecycle, message
//! framing, the WebSocket handshake/frame codec, and the accept loops that
//! wire sockets into connections.
//!
//! See `SPEC_FULL.md` in the repository root for the full design.

pub mod buffer_pool;
pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod udp;
pub mod websocket;

mod server;

#[cfg(test)]
mod tests;

pub use buffer_pool::{BufferPool, PoolStats};
pub use config::{ServerConfig, ServerConfigBuilder};
pub use connection::ConnectionHandle;
pub use error::Error;
pub use framing::{FrameOutcome, FramingProtocol, LengthPrefixedProtocol, RawProtocol};
pub use server::{MessageHandler, Server};
pub use udp::{DatagramServer, UdpConnectionHandle};
pub use websocket::wrap_frame as websocket_frame;
