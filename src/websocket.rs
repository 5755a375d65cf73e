// ABOUTME: Implements the RFC 6455 opening handshake and a 4-state WebSocket frame parser
// ABOUTME: Plugs into connection::drive as a FrameCodec; fragmentation across frames is not supported

//! WebSocket-over-TCP transport — spec.md §4.5: the RFC 6455 opening
//! handshake, and a 4-state frame parser/emitter plugged in as a
//! [`FrameCodec`].
//!
//! Grounded on `examples/original_source/include/uv_net/websocket_connection.h`
//! and the `ParseFrame` state machine in the matching `.cpp` (`ReadHeader` →
//! `ReadPayloadLength` → `ReadMaskingKey` → `ReadPayload`), reimplemented
//! without the original's fixed 64KiB `std::vector` scratch buffer — frames
//! accumulate directly in the connection's receive `BytesMut`.

use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::connection::{Decoded, FrameCodec};
use crate::error::Error;

const ACCEPT_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

/// Compute `Sec-WebSocket-Accept` from a client's `Sec-WebSocket-Key`, per
/// RFC 6455 §1.3.
pub(crate) fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(ACCEPT_MAGIC.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Parse an HTTP upgrade request out of `buf` and return the value of its
/// `Sec-WebSocket-Key` header, consuming the request bytes from `buf` on
/// success. Returns `Ok(None)` if the headers aren't fully buffered yet.
pub(crate) fn parse_handshake_request(buf: &mut BytesMut) -> Result<Option<String>, Error> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    let status = req
        .parse(buf)
        .map_err(|e| Error::Handshake(format!("malformed request line or headers: {e}")))?;
    let consumed = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    if req.method != Some("GET") {
        return Err(Error::Handshake(format!(
            "expected GET, got {:?}",
            req.method
        )));
    }

    let header_value = |name: &str| -> Option<String> {
        req.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| String::from_utf8_lossy(h.value).trim().to_string())
    };

    let upgrade = header_value("Upgrade").unwrap_or_default();
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(Error::Handshake(format!("unexpected Upgrade header: {upgrade:?}")));
    }
    let connection = header_value("Connection").unwrap_or_default();
    if !connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(Error::Handshake(format!(
            "Connection header missing 'upgrade': {connection:?}"
        )));
    }
    let version = header_value("Sec-WebSocket-Version").unwrap_or_default();
    if version != "13" {
        return Err(Error::Handshake(format!(
            "unsupported Sec-WebSocket-Version: {version:?}"
        )));
    }
    let key =
        header_value("Sec-WebSocket-Key").ok_or_else(|| Error::Handshake("missing Sec-WebSocket-Key".into()))?;

    buf.advance(consumed);
    Ok(Some(key))
}

/// Render the `101 Switching Protocols` response for a given client key.
pub(crate) fn handshake_response(client_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(client_key)
    )
    .into_bytes()
}

/// Frame a payload as a single unmasked server-to-client WebSocket frame.
/// Text vs. binary is spec.md's choice to always use opcode `Binary`
/// (§4.5's wrap step does not distinguish message types).
pub fn wrap_frame(payload: &[u8]) -> Bytes {
    encode_frame(OP_BINARY, payload)
}

fn encode_frame(opcode: u8, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 10);
    out.extend_from_slice(&[0x80 | (opcode & 0x0F)]);
    let len = payload.len();
    if len < 126 {
        out.extend_from_slice(&[len as u8]);
    } else if len <= u16::MAX as usize {
        out.extend_from_slice(&[126]);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.extend_from_slice(&[127]);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out.freeze()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    ReadHeader,
    ReadPayloadLength { fin: bool, opcode: u8, ext_len: usize },
    ReadMaskingKey { fin: bool, opcode: u8, payload_len: usize },
    ReadPayload {
        fin: bool,
        opcode: u8,
        payload_len: usize,
        mask: Option<[u8; 4]>,
    },
}

/// RFC 6455 frame parser, run after the handshake has completed. A
/// [`FrameCodec`] in its own right: `decode` is fed the connection's receive
/// buffer directly once the handshake has been stripped out of it.
pub(crate) struct FrameParser {
    state: ParseState,
}

impl FrameParser {
    pub(crate) fn new() -> Self {
        Self {
            state: ParseState::ReadHeader,
        }
    }
}

impl FrameCodec for FrameParser {
    fn decode(&mut self, buf: &mut BytesMut, max_frame: usize) -> Result<Decoded, Error> {
        loop {
            match self.state {
                ParseState::ReadHeader => {
                    if buf.len() < 2 {
                        return Ok(Decoded::None);
                    }
                    let first = buf[0];
                    let second = buf[1];
                    let fin = first & 0x80 != 0;
                    let rsv = first & 0x70;
                    let opcode = first & 0x0F;
                    if rsv != 0 {
                        return Err(Error::WebSocketProtocol("reserved bits must be zero".into()));
                    }
                    let masked = second & 0x80 != 0;
                    if !masked {
                        return Err(Error::WebSocketProtocol(
                            "client frames must be masked".into(),
                        ));
                    }
                    let short_len = second & 0x7F;
                    buf.advance(2);
                    if short_len < 126 {
                        self.state = ParseState::ReadMaskingKey {
                            fin,
                            opcode,
                            payload_len: short_len as usize,
                        };
                    } else {
                        let ext_len = if short_len == 126 { 2 } else { 8 };
                        self.state = ParseState::ReadPayloadLength { fin, opcode, ext_len };
                    }
                }
                ParseState::ReadPayloadLength { fin, opcode, ext_len } => {
                    if buf.len() < ext_len {
                        return Ok(Decoded::None);
                    }
                    let payload_len = if ext_len == 2 {
                        u16::from_be_bytes([buf[0], buf[1]]) as usize
                    } else {
                        u64::from_be_bytes(buf[0..8].try_into().unwrap()) as usize
                    };
                    buf.advance(ext_len);
                    self.state = ParseState::ReadMaskingKey {
                        fin,
                        opcode,
                        payload_len,
                    };
                }
                ParseState::ReadMaskingKey {
                    fin,
                    opcode,
                    payload_len,
                } => {
                    if buf.len() < 4 {
                        return Ok(Decoded::None);
                    }
                    if payload_len > max_frame {
                        return Err(Error::WebSocketProtocol(format!(
                            "frame payload {payload_len} exceeds max_package_size {max_frame}"
                        )));
                    }
                    let mask = [buf[0], buf[1], buf[2], buf[3]];
                    buf.advance(4);
                    self.state = ParseState::ReadPayload {
                        fin,
                        opcode,
                        payload_len,
                        mask: Some(mask),
                    };
                }
                ParseState::ReadPayload {
                    fin,
                    opcode,
                    payload_len,
                    mask,
                } => {
                    if buf.len() < payload_len {
                        return Ok(Decoded::None);
                    }
                    let mut payload = buf.split_to(payload_len);
                    if let Some(mask) = mask {
                        for (i, b) in payload.iter_mut().enumerate() {
                            *b ^= mask[i % 4];
                        }
                    }
                    self.state = ParseState::ReadHeader;
                    return self.dispatch(fin, opcode, payload.freeze());
                }
            }
        }
    }
}

impl FrameParser {
    fn dispatch(&mut self, fin: bool, opcode: u8, payload: Bytes) -> Result<Decoded, Error> {
        match opcode {
            OP_CONTINUATION => Err(Error::WebSocketProtocol(
                "fragmentation is not supported, continuation frame with no start frame".into(),
            )),
            OP_TEXT | OP_BINARY => {
                if fin {
                    Ok(Decoded::Message(payload))
                } else {
                    Err(Error::WebSocketProtocol(
                        "fragmentation is not supported, FIN=0 on a data frame is fatal".into(),
                    ))
                }
            }
            OP_PING => Ok(Decoded::ControlReply(encode_frame(OP_PONG, &payload))),
            OP_PONG => Ok(Decoded::None),
            OP_CLOSE => Ok(Decoded::PeerClosing(encode_frame(OP_CLOSE, &payload))),
            _ => Err(Error::WebSocketProtocol(format!("unknown opcode {opcode}"))),
        }
    }
}
