//! A raw-frame HTTP/2 client for driving the server under test.
//!
//! The client end of a `tokio::io::duplex` pair speaks the wire format
//! directly: frames are built and parsed by hand here so the tests observe
//! exactly what crosses the transport. Header blocks use the literal
//! never-indexed HPACK subset, matching the server's built-in codec.

#![allow(dead_code)]

use std::time::Duration;

use h2mux::server::Builder;
use h2mux::{RecvBody, Responder};
use http::Request;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const DATA: u8 = 0x0;
pub const HEADERS: u8 = 0x1;
pub const PRIORITY: u8 = 0x2;
pub const RST_STREAM: u8 = 0x3;
pub const SETTINGS: u8 = 0x4;
pub const PUSH_PROMISE: u8 = 0x5;
pub const PING: u8 = 0x6;
pub const GOAWAY: u8 = 0x7;
pub const WINDOW_UPDATE: u8 = 0x8;
pub const CONTINUATION: u8 = 0x9;

pub const END_STREAM: u8 = 0x1;
pub const ACK: u8 = 0x1;
pub const END_HEADERS: u8 = 0x4;

pub const SETTING_MAX_CONCURRENT_STREAMS: u16 = 3;
pub const SETTING_INITIAL_WINDOW_SIZE: u16 = 4;

/// A parsed frame as it came off the wire.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

pub struct TestClient {
    io: DuplexStream,
}

/// Build one frame: 24-bit length, type, flags, 31-bit stream id, payload.
pub fn frame(kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + payload.len());
    let len = payload.len() as u32;
    out.extend_from_slice(&len.to_be_bytes()[1..]);
    out.push(kind);
    out.push(flags);
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// A SETTINGS payload: 6 byte entries of id and value.
pub fn settings_payload(entries: &[(u16, u32)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * 6);
    for &(id, value) in entries {
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&value.to_be_bytes());
    }
    out
}

/// Encode a header list as literal never-indexed fields.
pub fn header_block(fields: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for &(name, value) in fields {
        assert!(name.len() < 127 && value.len() < 127);
        out.push(0x10);
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.push(value.len() as u8);
        out.extend_from_slice(value.as_bytes());
    }
    out
}

/// Decode a literal never-indexed header block back into pairs.
pub fn parse_header_block(mut payload: &[u8]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    while !payload.is_empty() {
        assert_eq!(payload[0], 0x10, "not a literal never-indexed field");
        payload = &payload[1..];

        let name_len = payload[0] as usize;
        let name = String::from_utf8(payload[1..1 + name_len].to_vec()).unwrap();
        payload = &payload[1 + name_len..];

        let value_len = payload[0] as usize;
        let value = String::from_utf8(payload[1..1 + value_len].to_vec()).unwrap();
        payload = &payload[1 + value_len..];

        out.push((name, value));
    }
    out
}

/// The standard request head used throughout the tests.
pub fn get_request(path: &str) -> Vec<u8> {
    header_block(&[
        (":method", "GET"),
        (":scheme", "https"),
        (":authority", "h"),
        (":path", path),
    ])
}

/// Start a server with the given builder and handler and perform the
/// client side of the handshake, consuming the server's SETTINGS, its ack
/// of ours, and the RTT-seeding PING (which is acked).
pub async fn connect<F, Fut>(
    mut builder: Builder,
    handler: F,
) -> (TestClient, JoinHandle<Result<(), h2mux::Error>>)
where
    F: Fn(Request<RecvBody>, Responder) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    // Keep the tests quick to fail when an expectation is wrong.
    builder.read_timeout(Duration::from_secs(2));
    builder.keep_alive_timeout(Duration::from_secs(10));

    let (client_io, server_io) = tokio::io::duplex(1 << 20);

    let server = tokio::spawn(async move { builder.serve(server_io, handler).await });

    let mut client = TestClient { io: client_io };
    client.handshake().await;

    (client, server)
}

impl TestClient {
    pub fn from_io(io: DuplexStream) -> TestClient {
        TestClient { io }
    }

    /// Send the preface and drain the server's handshake frames.
    pub async fn handshake(&mut self) {
        self.send(PREFACE).await;
        self.send(&frame(SETTINGS, 0, 0, &[])).await;

        let settings = self.recv_frame().await;
        assert_eq!(settings.kind, SETTINGS);
        assert_eq!(settings.flags & ACK, 0);

        // Ack the server's settings.
        self.send(&frame(SETTINGS, ACK, 0, &[])).await;

        let ack = self.recv_frame().await;
        assert_eq!(ack.kind, SETTINGS);
        assert_eq!(ack.flags & ACK, ACK);

        let ping = self.recv_frame().await;
        assert_eq!(ping.kind, PING);
        self.send(&frame(PING, ACK, 0, &ping.payload)).await;
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.expect("client write failed");
    }

    /// Read the next frame, failing loudly rather than hanging.
    pub async fn recv_frame(&mut self) -> RawFrame {
        timeout(Duration::from_secs(5), self.read_frame())
            .await
            .expect("timed out waiting for a frame")
    }

    async fn read_frame(&mut self) -> RawFrame {
        let mut head = [0u8; 9];
        self.io
            .read_exact(&mut head)
            .await
            .expect("client read failed");

        let len = u32::from_be_bytes([0, head[0], head[1], head[2]]) as usize;
        let mut payload = vec![0u8; len];
        self.io
            .read_exact(&mut payload)
            .await
            .expect("client read failed");

        RawFrame {
            kind: head[3],
            flags: head[4],
            stream_id: u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & !(1 << 31),
            payload,
        }
    }

    /// Read frames until one of `kind` arrives. Liveness PINGs are acked
    /// and skipped, PING acks are skipped; anything else unexpected fails.
    pub async fn recv_frame_of(&mut self, kind: u8) -> RawFrame {
        self.recv_frame_skipping(kind, &[]).await
    }

    /// Like [`recv_frame_of`](Self::recv_frame_of), also skipping the
    /// listed frame kinds.
    pub async fn recv_frame_skipping(&mut self, kind: u8, skip: &[u8]) -> RawFrame {
        loop {
            let frame = self.recv_frame().await;
            if frame.kind == kind {
                return frame;
            }
            if frame.kind == PING {
                if frame.flags & ACK == 0 {
                    let payload = frame.payload.clone();
                    self.send(&crate::support::frame(PING, ACK, 0, &payload))
                        .await;
                }
                continue;
            }
            if skip.contains(&frame.kind) {
                continue;
            }
            panic!("unexpected frame while waiting for kind {kind}: {frame:?}");
        }
    }

    /// Collect DATA payloads until END_STREAM, asserting the stream id.
    pub async fn recv_body(&mut self, stream_id: u32) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            let frame = self.recv_frame().await;
            assert_eq!(frame.kind, DATA, "expected DATA, got {frame:?}");
            assert_eq!(frame.stream_id, stream_id);
            body.extend_from_slice(&frame.payload);
            if frame.flags & END_STREAM == END_STREAM {
                return body;
            }
        }
    }

    /// Expect the connection to be closed by the server.
    pub async fn recv_eof(&mut self) {
        let mut byte = [0u8; 1];
        let n = timeout(Duration::from_secs(5), self.io.read(&mut byte))
            .await
            .expect("timed out waiting for close")
            .expect("read failed");
        assert_eq!(n, 0, "expected EOF, got more data");
    }
}
