// ABOUTME: Defines the Error enum for the handful of boundaries netcore reports faults across
// ABOUTME: Covers bind failure, framing faults, handshake faults, WebSocket protocol faults, transport I/O

//! Error types surfaced at the few boundaries where `netcore` reports
//! something other than "the connection closed" — see spec.md §7.

use thiserror::Error;

/// Errors that cross an API boundary: server startup (`bind`/`listen`) and
/// the internal fault classification used for logging.
///
/// Per spec.md §7, none of these ever reach `on_open`/`on_message`/`on_close`
/// — those callbacks stay infallible. `Server::start`/`DatagramServer::start`
/// report failure synchronously as a plain `bool`; this type is what gets
/// logged via `tracing` at the point of failure, not returned to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Binding or listening on the requested address failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A framing protocol reported a fatal condition (oversize or malformed
    /// frame header).
    #[error("framing error: {0}")]
    Framing(String),

    /// The WebSocket upgrade handshake was missing or malformed.
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// A malformed or disallowed WebSocket frame was received.
    #[error("websocket protocol error: {0}")]
    WebSocketProtocol(String),

    /// Transport-level I/O failure (read or write).
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}
