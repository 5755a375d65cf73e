// ABOUTME: Implements Server, the TCP stream server in raw, length-framed, or WebSocket mode
// ABOUTME: Runs the accept loop, admission control, per-socket options, and the handshake upgrade path

//! The TCP/WebSocket stream server — spec.md §3's `Server`, §4.4's accept
//! loop and admission control, and §4.5's handshake upgrade path.
//!
//! Grounded on `examples/original_source/include/uv_net/tcp_server.h`'s
//! accept-loop-plus-callback-table shape, adapted to a task-per-connection
//! accept loop instead of a thread pool of event loops, and on socket2's
//! `SockRef` for applying `SO_RCVBUF`/`SO_SNDBUF`/`TCP_NODELAY` to an
//! already-accepted `tokio::net::TcpStream` without taking ownership of it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};

use crate::buffer_pool::BufferPool;
use crate::config::ServerConfig;
use crate::connection::{self, ConnectionHandle, FrameCodec, StreamCodec};
use crate::error::Error;
use crate::framing::{FramingProtocol, RawProtocol};
use crate::websocket;

/// The three user-supplied lifecycle callbacks a `Server` dispatches to —
/// spec.md §3's `on_open`/`on_message`/`on_close`.
///
/// Implemented for any `(Fn(&ConnectionHandle), Fn(&ConnectionHandle, &[u8]),
/// Fn(&ConnectionHandle))` triple via the blanket impl below, so embedders
/// can pass three closures instead of writing this trait by hand.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_open(&self, conn: &ConnectionHandle);
    fn on_message(&self, conn: &ConnectionHandle, payload: &[u8]);
    fn on_close(&self, conn: &ConnectionHandle);
}

impl<O, M, C> MessageHandler for (O, M, C)
where
    O: Fn(&ConnectionHandle) + Send + Sync + 'static,
    M: Fn(&ConnectionHandle, &[u8]) + Send + Sync + 'static,
    C: Fn(&ConnectionHandle) + Send + Sync + 'static,
{
    fn on_open(&self, conn: &ConnectionHandle) {
        (self.0)(conn)
    }
    fn on_message(&self, conn: &ConnectionHandle, payload: &[u8]) {
        (self.1)(conn, payload)
    }
    fn on_close(&self, conn: &ConnectionHandle) {
        (self.2)(conn)
    }
}

enum Mode {
    Raw,
    Framed(Arc<dyn FramingProtocol>),
    WebSocket,
}

/// A TCP stream server, in raw, length-framed, or WebSocket mode —
/// spec.md §3/§4.4/§4.5.
pub struct Server {
    config: Arc<ServerConfig>,
    mode: Mode,
    handler: Arc<dyn MessageHandler>,
    buffer_pool: BufferPool,
    next_id: AtomicU32,
    connections: Arc<Mutex<std::collections::HashMap<u32, ConnectionHandle>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// A server that delivers each readable chunk to the handler as-is, with
    /// no framing protocol attached.
    pub fn raw(config: ServerConfig, handler: impl MessageHandler) -> Self {
        Self::new(config, Mode::Raw, handler)
    }

    /// A server that delimits messages using `protocol` (e.g.
    /// [`crate::framing::LengthPrefixedProtocol`]).
    pub fn framed(config: ServerConfig, protocol: Arc<dyn FramingProtocol>, handler: impl MessageHandler) -> Self {
        Self::new(config, Mode::Framed(protocol), handler)
    }

    /// A server that performs the RFC 6455 opening handshake on each
    /// accepted connection before delivering WebSocket message frames.
    pub fn websocket(config: ServerConfig, handler: impl MessageHandler) -> Self {
        Self::new(config, Mode::WebSocket, handler)
    }

    fn new(config: ServerConfig, mode: Mode, handler: impl MessageHandler) -> Self {
        let buffer_pool = BufferPool::new(config.read_buffer_size);
        Self {
            config: Arc::new(config),
            mode,
            handler: Arc::new(handler),
            buffer_pool,
            next_id: AtomicU32::new(1),
            connections: Arc::new(Mutex::new(std::collections::HashMap::new())),
            local_addr: Mutex::new(None),
        }
    }

    /// The address the server is bound to, once [`Server::start`] has bound
    /// its listener. `None` before `start` is called.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local_addr mutex poisoned")
    }

    /// Bind `addr` and run the accept loop until every connection handle
    /// (and the listener itself) is dropped, or [`Server::shutdown`] closes
    /// every live connection.
    ///
    /// Per spec.md §7, startup failures are reported synchronously as
    /// `false`; the underlying [`Error`] is logged via `tracing` but never
    /// returned to the caller.
    pub async fn start(&self, addr: SocketAddr) -> bool {
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(source) => {
                tracing::error!(error = %Error::Bind { addr: addr.to_string(), source }, "failed to start server");
                return false;
            }
        };
        let bound = listener.local_addr().unwrap_or(addr);
        *self.local_addr.lock().expect("local_addr mutex poisoned") = Some(bound);
        tracing::info!(addr = %bound, "server listening");

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };

            if self.connections.lock().expect("connection table poisoned").len() >= self.config.max_connections {
                tracing::warn!(%peer, "max_connections reached, dropping accepted socket");
                drop(socket);
                continue;
            }

            if let Err(e) = apply_socket_options(&socket, &self.config) {
                tracing::warn!(%peer, error = %e, "failed to apply socket options");
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.spawn_connection(id, socket, peer);
        }
    }

    fn spawn_connection(&self, id: u32, socket: TcpStream, peer: SocketAddr) {
        let config = self.config.clone();
        let buffer_pool = self.buffer_pool.clone();
        let handler = self.handler.clone();
        let connections = self.connections.clone();
        let mode_is_ws = matches!(self.mode, Mode::WebSocket);
        let protocol: Arc<dyn FramingProtocol> = match &self.mode {
            Mode::Raw => Arc::new(RawProtocol),
            Mode::Framed(p) => p.clone(),
            Mode::WebSocket => Arc::new(RawProtocol), // unused; FrameParser installed directly below
        };

        tokio::spawn(async move {
            let remote_ip = peer.ip().to_string();
            let remote_port = peer.port();

            let (handle, outbound_rx) = if mode_is_ws {
                connection::new_pair(
                    id,
                    remote_ip,
                    remote_port,
                    config.max_send_queue_size,
                    Box::new(websocket::wrap_frame),
                )
            } else {
                connection::new_pair(
                    id,
                    remote_ip,
                    remote_port,
                    config.max_send_queue_size,
                    Box::new(|p: &[u8]| Bytes::copy_from_slice(p)),
                )
            };

            connections.lock().expect("connection table poisoned").insert(id, handle.clone());

            let mut socket = socket;
            let (codec, initial_recv_buf): (Box<dyn FrameCodec>, bytes::BytesMut) = if mode_is_ws {
                match complete_handshake(&mut socket).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(conn_id = id, error = %e, "websocket handshake failed");
                        connections.lock().expect("connection table poisoned").remove(&id);
                        return;
                    }
                }
            } else {
                (Box::new(StreamCodec::new(protocol)), bytes::BytesMut::with_capacity(config.read_buffer_size))
            };

            handler.on_open(&handle);
            let on_message = {
                let handler = handler.clone();
                Arc::new(move |conn: &ConnectionHandle, payload: &[u8]| handler.on_message(conn, payload))
            };
            connection::drive(
                socket,
                handle.clone(),
                outbound_rx,
                codec,
                config,
                buffer_pool,
                on_message,
                initial_recv_buf,
            )
            .await;
            handler.on_close(&handle);
            connections.lock().expect("connection table poisoned").remove(&id);
        });
    }

    /// Request a graceful close of every currently-live connection.
    pub fn shutdown(&self) {
        for handle in self.connections.lock().expect("connection table poisoned").values() {
            handle.close();
        }
    }

    /// Number of connections currently tracked as open.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("connection table poisoned").len()
    }
}

/// Completes the RFC 6455 opening handshake and returns the frame codec
/// alongside any bytes read past the handshake request (e.g. a WebSocket
/// frame that arrived in the same TCP read) — these must seed the
/// connection's receive buffer rather than being dropped.
async fn complete_handshake(socket: &mut TcpStream) -> Result<(Box<dyn FrameCodec>, bytes::BytesMut), Error> {
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut buf = BytesMut::with_capacity(4 * 1024);
    let key = loop {
        let mut chunk = [0u8; 4096];
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Handshake("connection closed before handshake completed".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(key) = websocket::parse_handshake_request(&mut buf)? {
            break key;
        }
        if buf.len() > 16 * 1024 {
            return Err(Error::Handshake("handshake request too large".into()));
        }
    };

    let response = websocket::handshake_response(&key);
    socket.write_all(&response).await?;
    Ok((Box::new(websocket::FrameParser::new()), buf))
}

fn apply_socket_options(socket: &TcpStream, config: &ServerConfig) -> std::io::Result<()> {
    let sock = SockRef::from(socket);
    sock.set_recv_buffer_size(config.read_buffer_size)?;
    sock.set_send_buffer_size(config.write_buffer_size)?;
    socket.set_nodelay(config.tcp_no_delay)?;
    Ok(())
}
