mod support;

use bytes::Bytes;
use h2mux::server::Builder;
use http::Response;

use support::*;

/// A handler that streams `n` bytes of body on every request.
fn body_handler(
    n: usize,
) -> impl Fn(
    http::Request<h2mux::RecvBody>,
    h2mux::Responder,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
+ Send
+ Sync
+ 'static {
    move |_request, responder| {
        Box::pin(async move {
            let response = Response::builder().status(200).body(()).unwrap();
            let mut body = responder.send_response(response, false).await.unwrap();
            let payload = Bytes::from(vec![0x42; n]);
            let _ = body.send_data(payload, true).await;
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
    }
}

/// Collect DATA payload bytes until `total` have arrived, without requiring
/// END_STREAM. Panics on any non-DATA frame.
async fn recv_data_bytes(client: &mut TestClient, stream_id: u32, total: usize) -> bool {
    let mut got = 0;
    let mut end = false;
    while got < total {
        let frame = client.recv_frame().await;
        assert_eq!(frame.kind, DATA, "expected DATA, got {frame:?}");
        assert_eq!(frame.stream_id, stream_id);
        got += frame.payload.len();
        end = frame.flags & END_STREAM == END_STREAM;
    }
    assert_eq!(got, total, "more DATA than expected");
    end
}

#[tokio::test]
async fn big_body_stalls_on_both_windows_then_finishes() {
    let (mut client, _server) = connect(Builder::new(), body_handler(100_000)).await;

    client
        .send(&frame(HEADERS, END_HEADERS | END_STREAM, 1, &get_request("/big")))
        .await;

    let response = client.recv_frame_of(HEADERS).await;
    assert_eq!(response.flags & END_STREAM, 0);

    // Both windows start at 65_535: exactly that much is transmitted, the
    // remainder is held back.
    let end = recv_data_bytes(&mut client, 1, 65_535).await;
    assert!(!end);

    // No more DATA until credit arrives: a PING round trip proves the
    // stream is quiet.
    client.send(&frame(PING, 0, 0, &[7; 8])).await;
    let pong = client.recv_frame_of(PING).await;
    assert_eq!(pong.payload, [7; 8]);

    // Credit on the connection and on the stream releases the remainder.
    let increment = 50_000u32.to_be_bytes();
    client.send(&frame(WINDOW_UPDATE, 0, 0, &increment)).await;
    client.send(&frame(WINDOW_UPDATE, 0, 1, &increment)).await;

    let end = recv_data_bytes(&mut client, 1, 100_000 - 65_535).await;
    assert!(end, "the last DATA frame carries END_STREAM");
}

#[tokio::test]
async fn connection_credit_is_split_by_weight() {
    let (mut client, _server) = connect(Builder::new(), body_handler(200_000)).await;

    // Stream 1 at weight 16 (the default), stream 3 at weight 8, both
    // depending on the connection.
    client
        .send(&frame(HEADERS, END_HEADERS | END_STREAM, 1, &get_request("/a")))
        .await;

    // Drain stream 1's share of the connection window: headers, then
    // 65_535 bytes (its stream window also allows no more).
    client.recv_frame_of(HEADERS).await;
    let end = recv_data_bytes(&mut client, 1, 65_535).await;
    assert!(!end);

    // Generous stream-level credit so only the connection window gates
    // stream 1; its remainder enters the backlog.
    client
        .send(&frame(WINDOW_UPDATE, 0, 1, &200_000u32.to_be_bytes()))
        .await;

    // Open stream 3 with an explicit weight of 8 (wire value 7) on its
    // HEADERS priority fields: exclusive=0, dependency=0, weight byte 7.
    let mut payload = Vec::new();
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.push(7);
    payload.extend_from_slice(&get_request("/b"));
    // 0x20 = PRIORITY flag
    client
        .send(&frame(HEADERS, END_HEADERS | END_STREAM | 0x20, 3, &payload))
        .await;

    client.recv_frame_of(HEADERS).await;
    client
        .send(&frame(WINDOW_UPDATE, 0, 3, &200_000u32.to_be_bytes()))
        .await;

    // Neither stream can move: the connection window is empty and both
    // workers sit in the backlog.
    client.send(&frame(PING, 0, 0, &[8; 8])).await;
    client.recv_frame_of(PING).await;

    // 1_500 fresh connection bytes split 16:8 along the tree.
    client
        .send(&frame(WINDOW_UPDATE, 0, 0, &1_500u32.to_be_bytes()))
        .await;

    let mut got_1 = 0usize;
    let mut got_3 = 0usize;
    while got_1 + got_3 < 1_500 {
        let frame = client.recv_frame().await;
        assert_eq!(frame.kind, DATA);
        match frame.stream_id {
            1 => got_1 += frame.payload.len(),
            3 => got_3 += frame.payload.len(),
            other => panic!("DATA on unexpected stream {other}"),
        }
    }

    assert_eq!(got_1, 1_000);
    assert_eq!(got_3, 500);
}

#[tokio::test]
async fn initial_window_size_delta_fans_out_to_live_streams() {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);

    let server = tokio::spawn(async move {
        Builder::new().serve(server_io, body_handler(5)).await
    });

    let mut client = TestClient::from_io(client_io);

    // Handshake with INITIAL_WINDOW_SIZE = 0: response bodies cannot move.
    client.send(PREFACE).await;
    client
        .send(&frame(
            SETTINGS,
            0,
            0,
            &settings_payload(&[(SETTING_INITIAL_WINDOW_SIZE, 0)]),
        ))
        .await;

    let settings = client.recv_frame_of(SETTINGS).await;
    assert_eq!(settings.flags & ACK, 0);
    client.send(&frame(SETTINGS, ACK, 0, &[])).await;

    let ack = client.recv_frame_of(SETTINGS).await;
    assert_eq!(ack.flags & ACK, ACK);

    client
        .send(&frame(HEADERS, END_HEADERS | END_STREAM, 1, &get_request("/")))
        .await;

    // The head comes through; the 5 byte body is stuck on a zero window.
    let response = client.recv_frame_of(HEADERS).await;
    assert_eq!(response.flags & END_STREAM, 0);

    client.send(&frame(PING, 0, 0, &[5; 8])).await;
    client.recv_frame_of(PING).await;

    // Raising INITIAL_WINDOW_SIZE applies the delta to the live stream's
    // window, releasing the body.
    client
        .send(&frame(
            SETTINGS,
            0,
            0,
            &settings_payload(&[(SETTING_INITIAL_WINDOW_SIZE, 5)]),
        ))
        .await;
    let ack = client.recv_frame_of(SETTINGS).await;
    assert_eq!(ack.flags & ACK, ACK);

    let body = client.recv_body(1).await;
    assert_eq!(body, [0x42; 5]);

    drop(server);
}

#[tokio::test]
async fn data_padding_credit_is_restored() {
    // A handler that reads the body to completion before responding.
    let handler = |mut request: http::Request<h2mux::RecvBody>, responder: h2mux::Responder| {
        Box::pin(async move {
            while let Some(chunk) = request.body_mut().data().await {
                let _ = chunk.unwrap();
            }
            let response = Response::builder().status(200).body(()).unwrap();
            let _ = responder.send_response(response, true).await;
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
    };

    let (mut client, _server) = connect(Builder::new(), handler).await;

    client
        .send(&frame(HEADERS, END_HEADERS, 1, &get_request("/padded")))
        .await;

    // A padded DATA frame: pad length 3, five real bytes, three pad bytes.
    let mut payload = vec![3u8];
    payload.extend_from_slice(b"hello");
    payload.extend_from_slice(&[0; 3]);
    // 0x8 = PADDED
    client.send(&frame(DATA, END_STREAM | 0x8, 1, &payload)).await;

    // The padding credit (pad bytes + the length octet) comes back on the
    // stream and the connection without waiting for the application.
    let mut stream_credit = 0u32;
    let mut conn_credit = 0u32;
    loop {
        let frame = client.recv_frame_skipping(WINDOW_UPDATE, &[HEADERS]).await;
        let increment = u32::from_be_bytes(frame.payload[..4].try_into().unwrap());
        match frame.stream_id {
            0 => conn_credit += increment,
            1 => stream_credit += increment,
            other => panic!("credit on unexpected stream {other}"),
        }

        // 4 for the padding (3 + length octet), 5 for the consumed body.
        if conn_credit >= 4 + 5 {
            break;
        }
    }

    assert!(stream_credit >= 4);
    assert_eq!(conn_credit, 9);
}
