// ABOUTME: Implements DatagramServer, one socket with a recv loop and an ephemeral reply handle per datagram
// ABOUTME: No send queue, no heartbeat, no persistent per-peer connection state

//! The UDP datagram server — spec.md §4.6.
//!
//! Grounded on `examples/original_source/include/uv_net/udp_server.h` and
//! `udp_connection.h`: one socket, one recv loop, and an ephemeral
//! connection object per received datagram that exists only long enough to
//! carry the source address back to a reply `send`. Unlike
//! [`crate::connection::ConnectionHandle`] this has no send queue, no
//! heartbeat, and no close state — UDP has no connection to keep alive.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;

use crate::config::ServerConfig;
use crate::error::Error;

/// An ephemeral handle carrying the source address of one received
/// datagram, so a handler can reply on the same socket. Dropped once the
/// handler returns; holding onto it past that point is harmless but
/// pointless — it borrows no connection state because UDP has none.
#[derive(Clone)]
pub struct UdpConnectionHandle {
    socket: Arc<UdpSocket>,
    source: SocketAddr,
}

impl UdpConnectionHandle {
    /// The address the datagram arrived from.
    pub fn source(&self) -> SocketAddr {
        self.source
    }

    /// Send `payload` back to the datagram's source address.
    ///
    /// Best-effort: a `sendto` failure is logged and otherwise ignored,
    /// matching spec.md §4.6's "no queue, no close state" — there is nothing
    /// to back-pressure against, and nothing to mark closed.
    pub fn send(&self, payload: impl AsRef<[u8]>) {
        let socket = self.socket.clone();
        let source = self.source;
        let payload = payload.as_ref().to_vec();
        tokio::spawn(async move {
            if let Err(e) = socket.send_to(&payload, source).await {
                tracing::warn!(%source, error = %e, "udp reply send failed");
            }
        });
    }
}

/// A UDP datagram server — spec.md §4.6.
pub struct DatagramServer {
    config: Arc<ServerConfig>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl DatagramServer {
    /// Construct a server with the given config; binding happens in
    /// [`DatagramServer::start`].
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            local_addr: Mutex::new(None),
        }
    }

    /// The address the server is bound to, once [`DatagramServer::start`]
    /// has bound its socket. `None` before `start` is called.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local_addr mutex poisoned")
    }

    /// Bind `addr` with `SO_REUSEADDR` and run the receive loop, calling
    /// `on_message` for each datagram until the task is cancelled.
    ///
    /// Per spec.md §7, bind failures are reported synchronously as `false`.
    pub async fn start(
        &self,
        addr: SocketAddr,
        on_message: impl Fn(UdpConnectionHandle, &[u8]) + Send + Sync + 'static,
    ) -> bool {
        let socket = match bind_reuseaddr(addr) {
            Ok(s) => s,
            Err(source) => {
                tracing::error!(error = %Error::Bind { addr: addr.to_string(), source }, "failed to start datagram server");
                return false;
            }
        };
        let bound = socket.local_addr().unwrap_or(addr);
        *self.local_addr.lock().expect("local_addr mutex poisoned") = Some(bound);
        tracing::info!(addr = %bound, "datagram server listening");

        let socket = Arc::new(socket);
        let mut buf = vec![0u8; self.config.read_buffer_size];
        loop {
            let (n, source) = match socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "udp recv error");
                    continue;
                }
            };
            let handle = UdpConnectionHandle {
                socket: socket.clone(),
                source,
            };
            on_message(handle, &buf[..n]);
        }
    }

    /// The configured read buffer size, which doubles as the maximum
    /// receivable datagram size.
    pub fn max_datagram_size(&self) -> usize {
        self.config.read_buffer_size
    }
}

fn bind_reuseaddr(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn echoes_datagram_back_to_source() {
        let server = DatagramServer::new(ServerConfig::default());
        let received = Arc::new(AtomicBool::new(false));
        let received_clone = received.clone();

        let server_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let bound = bind_reuseaddr(server_addr).unwrap();
        let local_addr = bound.local_addr().unwrap();
        drop(bound);

        tokio::spawn(async move {
            server
                .start(local_addr, move |handle, payload| {
                    received_clone.store(true, Ordering::SeqCst);
                    handle.send(payload);
                })
                .await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"ping", local_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .expect("reply timed out")
            .unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert!(received.load(Ordering::SeqCst));
    }
}
