// ABOUTME: Runs one Tokio task per connection: read/decode/dispatch loop plus outbound queue
// ABOUTME: Defines ConnectionHandle, the FrameCodec trait, and the graceful-close state machine

//! Per-connection lifecycle, receive-buffer framing, and the non-blocking
//! write pipeline — spec.md §3 and §4.3.
//!
//! Generalizes a `read_frame`/`parse_frame`/`write_frame` loop over a
//! `BytesMut` receive buffer and a buffered stream socket into a send
//! *queue* instead of one frame at a time, running as one Tokio task per
//! connection instead of one `async fn` per client call. See
//! `SPEC_FULL.md` §1/§5/§9 for why a task-per-connection model removes the
//! need for the mutex the original C++ source put around its send queue.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

use crate::buffer_pool::BufferPool;
use crate::config::ServerConfig;
use crate::error::Error;
use crate::framing::{FrameOutcome, FramingProtocol};

const OPEN: u8 = 0;
const CLOSING_GRACEFULLY: u8 = 1;
const CLOSED: u8 = 2;

type WrapOutbound = Box<dyn Fn(&[u8]) -> Bytes + Send + Sync>;
type OnMessage = Arc<dyn Fn(&ConnectionHandle, &[u8]) + Send + Sync>;

/// Outcome of one [`FrameCodec::decode`] call.
#[derive(Debug)]
pub(crate) enum Decoded {
    /// Not enough data buffered yet to extract another item.
    None,
    /// A complete application message, ready for the user's handler.
    Message(Bytes),
    /// A reply the codec generated itself (e.g. a WebSocket pong) that
    /// should go straight onto the outbound queue, bypassing `wrap_outbound`.
    ControlReply(Bytes),
    /// The peer asked to close (e.g. a WebSocket close frame). Carries the
    /// echo that must be queued for sending before the connection closes.
    PeerClosing(Bytes),
}

/// The capability-set hook spec.md §9 describes instead of a `Connection`
/// class hierarchy: one hook to turn buffered bytes into messages, one to
/// wrap an outbound payload for the wire. TCP installs an identity
/// `wrap_outbound`; WebSocket installs the handshake/frame codec.
pub(crate) trait FrameCodec: Send {
    fn decode(&mut self, buf: &mut BytesMut, max_frame: usize) -> Result<Decoded, Error>;
}

/// `FrameCodec` for raw and length-framed TCP: delegates to a
/// [`FramingProtocol`] and does not wrap outbound payloads.
pub(crate) struct StreamCodec {
    protocol: Arc<dyn FramingProtocol>,
}

impl StreamCodec {
    pub(crate) fn new(protocol: Arc<dyn FramingProtocol>) -> Self {
        Self { protocol }
    }
}

impl FrameCodec for StreamCodec {
    fn decode(&mut self, buf: &mut BytesMut, max_frame: usize) -> Result<Decoded, Error> {
        match self.protocol.parse(buf) {
            FrameOutcome::Incomplete => Ok(Decoded::None),
            FrameOutcome::Fatal => Err(Error::Framing(format!(
                "protocol reported a fatal frame in a {}-byte window",
                buf.len()
            ))),
            FrameOutcome::Complete {
                frame_len,
                payload_len,
            } => {
                if frame_len > max_frame {
                    return Err(Error::Framing(format!(
                        "frame of {frame_len} bytes exceeds max_package_size {max_frame}"
                    )));
                }
                let mut frame = buf.split_to(frame_len);
                let payload = frame.split_off(frame_len - payload_len);
                Ok(Decoded::Message(payload.freeze()))
            }
        }
    }
}

struct Shared {
    state: AtomicU8,
    outbound_tx: mpsc::Sender<Bytes>,
    close_notify: Notify,
    epoch: Instant,
    last_active_ms: AtomicU64,
    wrap_outbound: WrapOutbound,
}

impl Shared {
    fn touch(&self) {
        self.last_active_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn last_active(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed))
    }
}

/// A handle to a live connection — spec.md §6's connection handle surface.
///
/// Cheap to clone: internally an id, the remote address, and an `Arc` of
/// shared atomics plus the outbound sender. Safe to hold across `.await`
/// points or move into another task; `send`/`close` never block.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u32,
    remote_ip: Arc<str>,
    remote_port: u16,
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// The connection's id, unique for the lifetime of the server that
    /// accepted it.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The peer's IP address, as text.
    pub fn remote_ip(&self) -> &str {
        &self.remote_ip
    }

    /// The peer's port.
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// When this connection last completed a read or a write.
    pub fn last_active(&self) -> Instant {
        self.shared.last_active()
    }

    /// When this connection was accepted.
    pub fn created_at(&self) -> Instant {
        self.shared.epoch
    }

    /// Enqueue `payload` for sending.
    ///
    /// Non-blocking. Dropped (with a warning logged) if the connection isn't
    /// `Open`, or if the outbound queue is already at
    /// `max_send_queue_size` — spec.md §4.3's back-pressure policy favors
    /// connection survival over delivery.
    pub fn send(&self, payload: impl AsRef<[u8]>) {
        if self.shared.state.load(Ordering::Acquire) != OPEN {
            tracing::debug!(conn_id = self.id, "send on a non-open connection, dropping");
            return;
        }
        let bytes = (self.shared.wrap_outbound)(payload.as_ref());
        match self.shared.outbound_tx.try_send(bytes) {
            Ok(()) => self.shared.touch(),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(conn_id = self.id, "send queue full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(conn_id = self.id, "send queue already closed, dropping message");
            }
        }
    }

    /// Request a graceful close: idempotent, drains any queued sends before
    /// the socket actually closes.
    pub fn close(&self) {
        if self
            .shared
            .state
            .compare_exchange(OPEN, CLOSING_GRACEFULLY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.shared.close_notify.notify_one();
        }
    }

    fn is_closing(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == CLOSING_GRACEFULLY
    }

    fn mark_closed(&self) {
        self.shared.state.store(CLOSED, Ordering::Release);
    }
}

/// Build a fresh handle plus the receiver end of its outbound queue. Called
/// once per accepted socket, before the connection's task starts.
pub(crate) fn new_pair(
    id: u32,
    remote_ip: String,
    remote_port: u16,
    max_send_queue_size: usize,
    wrap_outbound: WrapOutbound,
) -> (ConnectionHandle, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(max_send_queue_size.max(1));
    let handle = ConnectionHandle {
        id,
        remote_ip: remote_ip.into(),
        remote_port,
        shared: Arc::new(Shared {
            state: AtomicU8::new(OPEN),
            outbound_tx: tx,
            close_notify: Notify::new(),
            epoch: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            wrap_outbound,
        }),
    };
    (handle, rx)
}

async fn read_chunk<S>(socket: &mut S, recv_buf: &mut BytesMut, pool: &BufferPool) -> std::io::Result<usize>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = pool.acquire();
    let n = socket.read(&mut chunk).await?;
    if n > 0 {
        recv_buf.extend_from_slice(&chunk[..n]);
    }
    Ok(n)
}

/// Run one connection to completion: read/decode/dispatch loop, non-blocking
/// write pipeline, heartbeat, graceful close drain. Returns once the socket
/// has been closed. Shared by the TCP and WebSocket stream servers — the
/// only difference between them is which `FrameCodec` and `wrap_outbound`
/// were installed in `handle`/`codec` before this was called.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn drive<S>(
    mut socket: S,
    handle: ConnectionHandle,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    mut codec: Box<dyn FrameCodec>,
    config: Arc<ServerConfig>,
    buffer_pool: BufferPool,
    on_message: OnMessage,
    initial_recv_buf: BytesMut,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut recv_buf = initial_recv_buf;
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval());
    heartbeat.tick().await; // first tick fires immediately; consume it

    'outer: loop {
        tokio::select! {
            result = read_chunk(&mut socket, &mut recv_buf, &buffer_pool) => {
                match result {
                    Ok(0) => break 'outer,
                    Ok(_) => {
                        handle.shared.touch();
                        loop {
                            match codec.decode(&mut recv_buf, config.max_package_size) {
                                Ok(Decoded::None) => break,
                                Ok(Decoded::Message(payload)) => on_message(&handle, &payload),
                                Ok(Decoded::ControlReply(bytes)) => {
                                    let _ = handle.shared.outbound_tx.try_send(bytes);
                                }
                                Ok(Decoded::PeerClosing(echo)) => {
                                    let _ = handle.shared.outbound_tx.try_send(echo);
                                    handle.close();
                                    break;
                                }
                                Err(e) => {
                                    tracing::error!(conn_id = handle.id(), error = %e, "fatal frame, closing");
                                    handle.close();
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        if e.kind() != std::io::ErrorKind::ConnectionReset
                            && e.kind() != std::io::ErrorKind::UnexpectedEof
                        {
                            tracing::warn!(conn_id = handle.id(), error = %e, "read error, closing");
                        }
                        break 'outer;
                    }
                }
            }
            maybe = outbound_rx.recv() => {
                match maybe {
                    Some(bytes) => {
                        if let Err(e) = socket.write_all(&bytes).await {
                            tracing::debug!(conn_id = handle.id(), error = %e, "write error, closing");
                            break 'outer;
                        }
                        handle.shared.touch();
                    }
                    None => break 'outer,
                }
            }
            _ = heartbeat.tick() => {
                if handle.last_active().elapsed() > config.idle_threshold() {
                    tracing::info!(conn_id = handle.id(), "heartbeat timeout, closing");
                    handle.close();
                }
            }
            _ = handle.shared.close_notify.notified() => {}
        }

        if handle.is_closing() {
            while let Ok(bytes) = outbound_rx.try_recv() {
                if socket.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            handle.mark_closed();
            break 'outer;
        }
    }

    let _ = socket.shutdown().await;
}
