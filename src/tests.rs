// ABOUTME: End-to-end tests driving Server/DatagramServer over real sockets
// ABOUTME: One test per scenario in the spec's scenario list

//! End-to-end integration tests driving the server over real sockets —
//! spec.md §8's scenario list.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::{DatagramServer, FramingProtocol, LengthPrefixedProtocol, Server, ServerConfig};

async fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("could not connect to {addr}");
}

#[tokio::test]
async fn fixed_size_echo_over_length_prefixed_framing() {
    let config = ServerConfig::default();
    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();

    let on_open = |_: &crate::ConnectionHandle| {};
    let on_message = move |conn: &crate::ConnectionHandle, payload: &[u8]| {
        received_clone.lock().unwrap().push(payload.to_vec());
        conn.send(LengthPrefixedProtocol::encode(payload));
    };
    let on_close = |_: &crate::ConnectionHandle| {};

    let protocol: Arc<dyn FramingProtocol> = Arc::new(LengthPrefixedProtocol);
    let server = Arc::new(Server::framed(config, protocol, (on_open, on_message, on_close)));
    let server_clone = server.clone();
    tokio::spawn(async move {
        server_clone.start("127.0.0.1:0".parse().unwrap()).await;
    });

    let addr = wait_for_bind(&server).await;
    let mut client = connect_with_retry(addr).await;

    let frame = LengthPrefixedProtocol::encode(b"hello");
    client.write_all(&frame).await.unwrap();

    let mut reply = vec![0u8; frame.len()];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, frame);
    assert_eq!(received.lock().unwrap().as_slice(), &[b"hello".to_vec()]);
}

#[tokio::test]
async fn fragmented_frame_arrival_still_yields_one_message() {
    let config = ServerConfig::default();
    let count = Arc::new(AtomicUsize::new(0));
    let count_clone = count.clone();

    let on_open = |_: &crate::ConnectionHandle| {};
    let on_message = move |_: &crate::ConnectionHandle, _: &[u8]| {
        count_clone.fetch_add(1, Ordering::SeqCst);
    };
    let on_close = |_: &crate::ConnectionHandle| {};

    let protocol: Arc<dyn FramingProtocol> = Arc::new(LengthPrefixedProtocol);
    let server = Arc::new(Server::framed(config, protocol, (on_open, on_message, on_close)));
    let server_clone = server.clone();
    tokio::spawn(async move {
        server_clone.start("127.0.0.1:0".parse().unwrap()).await;
    });

    let addr = wait_for_bind(&server).await;
    let mut client = connect_with_retry(addr).await;

    let frame = LengthPrefixedProtocol::encode(b"split across writes");
    for byte in &frame {
        client.write_all(&[*byte]).await.unwrap();
    }
    drop(client);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn back_pressure_drops_excess_sends_without_closing() {
    let config = ServerConfig::builder().max_send_queue_size(2).build();

    let on_open = move |conn: &crate::ConnectionHandle| {
        for i in 0u8..10 {
            conn.send([i]);
        }
    };
    let on_message = |_: &crate::ConnectionHandle, _: &[u8]| {};
    let on_close = |_: &crate::ConnectionHandle| {};

    let server = Arc::new(Server::raw(config, (on_open, on_message, on_close)));
    let server_clone = server.clone();
    tokio::spawn(async move {
        server_clone.start("127.0.0.1:0".parse().unwrap()).await;
    });

    let addr = wait_for_bind(&server).await;
    let mut client = connect_with_retry(addr).await;

    let mut buf = Vec::new();
    let _ = tokio::time::timeout(Duration::from_millis(200), client.read_to_end(&mut buf)).await;

    // Only the first max_send_queue_size sends survive the burst; the
    // connection itself must not have been closed by the overflow.
    assert!(buf.len() <= 2);
}

#[tokio::test]
async fn graceful_close_drains_pending_sends_over_real_socket() {
    let config = ServerConfig::default();

    let on_open = move |conn: &crate::ConnectionHandle| {
        conn.send(b"A");
        conn.send(b"B");
        conn.close();
    };
    let on_message = |_: &crate::ConnectionHandle, _: &[u8]| {};
    let on_close = |_: &crate::ConnectionHandle| {};

    let server = Arc::new(Server::raw(config, (on_open, on_message, on_close)));
    let server_clone = server.clone();
    tokio::spawn(async move {
        server_clone.start("127.0.0.1:0".parse().unwrap()).await;
    });

    let addr = wait_for_bind(&server).await;
    let mut client = connect_with_retry(addr).await;

    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"AB");
}

#[tokio::test]
async fn websocket_handshake_then_echo() {
    let config = ServerConfig::default();
    let on_open = |_: &crate::ConnectionHandle| {};
    let on_message = |conn: &crate::ConnectionHandle, payload: &[u8]| conn.send(payload);
    let on_close = |_: &crate::ConnectionHandle| {};

    let server = Arc::new(Server::websocket(config, (on_open, on_message, on_close)));
    let server_clone = server.clone();
    tokio::spawn(async move {
        server_clone.start("127.0.0.1:0".parse().unwrap()).await;
    });

    let addr = wait_for_bind(&server).await;
    let mut client = connect_with_retry(addr).await;

    let request = "GET / HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n";
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = vec![0u8; 256];
    let n = client.read(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response[..n]);
    assert!(response.contains("101 Switching Protocols"));
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    // Masked client text frame: "hi"
    let mask = [0x11u8, 0x22, 0x33, 0x44];
    let payload = b"hi";
    let masked: Vec<u8> = payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]).collect();
    let mut frame = vec![0x81, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend_from_slice(&masked);
    client.write_all(&frame).await.unwrap();

    let mut reply = [0u8; 16];
    let n = client.read(&mut reply).await.unwrap();
    // server replies unmasked: 0x82 opcode=binary fin=1, len=2, then payload
    assert_eq!(&reply[..2], &[0x82, 0x02]);
    assert_eq!(&reply[2..n], payload);
}

#[tokio::test]
async fn websocket_close_frame_closes_connection() {
    let config = ServerConfig::default();
    let on_open = |_: &crate::ConnectionHandle| {};
    let on_message = |_: &crate::ConnectionHandle, _: &[u8]| {};
    let on_close = |_: &crate::ConnectionHandle| {};

    let server = Arc::new(Server::websocket(config, (on_open, on_message, on_close)));
    let server_clone = server.clone();
    tokio::spawn(async move {
        server_clone.start("127.0.0.1:0".parse().unwrap()).await;
    });

    let addr = wait_for_bind(&server).await;
    let mut client = connect_with_retry(addr).await;

    let request = "GET / HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n";
    client.write_all(request.as_bytes()).await.unwrap();
    let mut response = vec![0u8; 256];
    let n = client.read(&mut response).await.unwrap();
    assert!(n > 0);

    let mask = [0x11u8, 0x22, 0x33, 0x44];
    let payload = b"done";
    let masked: Vec<u8> = payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]).collect();
    let mut close_frame = vec![0x88u8, 0x80 | payload.len() as u8];
    close_frame.extend_from_slice(&mask);
    close_frame.extend_from_slice(&masked);
    client.write_all(&close_frame).await.unwrap();

    let mut buf = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut buf)).await;
    assert!(result.is_ok(), "server should close the socket after a close frame");
    assert!(buf.len() >= 2 + payload.len(), "expected an echoed close frame, got {buf:?}");
    assert_eq!(buf[0] & 0x0F, 0x8, "echo must carry opcode 0x8 (close)");
    assert_eq!(&buf[2..2 + payload.len()], payload, "echo must carry the same close payload");
}

#[tokio::test]
async fn udp_datagram_echo() {
    let config = ServerConfig::default();
    let server = DatagramServer::new(config);
    let server = Arc::new(server);
    let server_clone = server.clone();

    tokio::spawn(async move {
        server_clone
            .start("127.0.0.1:0".parse().unwrap(), |handle, payload| {
                handle.send(payload);
            })
            .await;
    });

    let addr = loop {
        if let Some(addr) = server.local_addr() {
            break addr;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"hello-udp", addr).await.unwrap();

    let mut buf = [0u8; 32];
    let (n, _) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"hello-udp");
}

#[tokio::test]
async fn raw_mode_has_no_framing_imposed() {
    let config = ServerConfig::default();
    let on_open = |_: &crate::ConnectionHandle| {};
    let on_message = |conn: &crate::ConnectionHandle, payload: &[u8]| conn.send(payload);
    let on_close = |_: &crate::ConnectionHandle| {};

    let server = Arc::new(Server::raw(config, (on_open, on_message, on_close)));
    let server_clone = server.clone();
    tokio::spawn(async move {
        server_clone.start("127.0.0.1:0".parse().unwrap()).await;
    });

    let addr = wait_for_bind(&server).await;
    let mut client = connect_with_retry(addr).await;

    client.write_all(b"no-framing-here").await.unwrap();
    let mut buf = [0u8; 32];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"no-framing-here");
}

async fn wait_for_bind(server: &Server) -> SocketAddr {
    for _ in 0..50 {
        if let Some(addr) = server.local_addr() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never bound");
}
