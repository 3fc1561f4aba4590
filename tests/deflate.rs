use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use ws_gate::codec::Decompressor;
use ws_gate::handshake::{client_request, gen_key};
use ws_gate::http::buffer::HeadBuffer;
use ws_gate::{AcceptOptions, ClientBuilder, HttpListener, WsEvent};

const WAIT: Duration = Duration::from_secs(5);

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn start_deflate_echo(port: u16) -> HttpListener {
    let listener = HttpListener::new();
    listener
        .add_prefix(&format!("http://127.0.0.1:{port}/ws/"))
        .unwrap();
    listener.start().unwrap();
    let accept = listener.clone();
    tokio::spawn(async move {
        let options = AcceptOptions {
            protocols: vec![],
            enable_deflate: true,
        };
        while let Ok(context) = accept.get_context().await {
            let options = options.clone();
            tokio::spawn(async move {
                let Ok(mut session) = context.accept_websocket(&options).await else {
                    return;
                };
                while let Some(event) = session.next_event().await {
                    match event {
                        WsEvent::Message { data, is_text: true } => {
                            let text = String::from_utf8_lossy(&data).to_string();
                            let _ = session.send_text(&text).await;
                        }
                        WsEvent::Message { data, is_text: false } => {
                            let _ = session.send(&data[..]).await;
                        }
                        _ => {}
                    }
                }
            });
        }
    });
    listener
}

#[tokio::test]
async fn repetitive_text_roundtrips_byte_identical() {
    let port = free_port();
    let listener = start_deflate_echo(port);

    let mut client = ClientBuilder::new()
        .deflate(true)
        .deflate_required(true)
        .connect(&format!("ws://127.0.0.1:{port}/ws/"))
        .await
        .unwrap();

    match timeout(WAIT, client.next_event()).await.unwrap().unwrap() {
        WsEvent::Open => {}
        other => panic!("expected open, got {other:?}"),
    }
    let message = "a".repeat(2000);
    client.send_text(&message).await.unwrap();
    match timeout(WAIT, client.next_event()).await.unwrap().unwrap() {
        WsEvent::Message { data, is_text } => {
            assert!(is_text);
            assert_eq!(&data[..], message.as_bytes());
        }
        other => panic!("expected echo, got {other:?}"),
    }
    listener.stop();
}

#[tokio::test]
async fn compressed_wire_frame_is_small_and_flagged() {
    let port = free_port();
    let listener = start_deflate_echo(port);

    // manual handshake so the wire bytes of the echo are observable
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let key = gen_key();
    let uri: http::Uri = format!("ws://127.0.0.1:{port}/ws/").parse().unwrap();
    let request = client_request(
        &uri,
        &key,
        &[],
        &["permessage-deflate; client_max_window_bits".to_string()],
        13,
        &Default::default(),
        None,
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut head_buf = HeadBuffer::new();
    let head = head_buf.read_head(&mut stream).await.unwrap();
    let head_text = String::from_utf8_lossy(&head).to_string();
    assert!(head_text.contains("Sec-WebSocket-Extensions: permessage-deflate"));

    // send a compressed 2000 byte text message by hand
    let message = "a".repeat(2000);
    let mut compressor = ws_gate::codec::Compressor::new();
    let mut compressed = Vec::new();
    compressor.compress(message.as_bytes(), &mut compressed).unwrap();
    compressed.truncate(compressed.len() - 4);
    let mask: [u8; 4] = rand::random();
    let mut payload = compressed.clone();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
    // FIN + RSV1 + text opcode, masked, 7-bit length
    assert!(payload.len() < 126);
    let mut frame = vec![0xC1u8, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend_from_slice(&payload);
    stream.write_all(&frame).await.unwrap();

    // the echo must come back compressed: rsv1 set, payload < 200 bytes
    let mut leftover = head_buf.take_leftover().to_vec();
    while leftover.len() < 2 {
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed early");
        leftover.extend_from_slice(&buf[..n]);
    }
    assert_eq!(leftover[0], 0xC1, "FIN and RSV1 set on a text frame");
    let wire_len = (leftover[1] & 0x7F) as usize;
    assert!(wire_len < 126, "length fits the 7-bit form");
    assert!(wire_len < 200, "2000 bytes of 'a' compress well below 200");
    while leftover.len() < 2 + wire_len {
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed early");
        leftover.extend_from_slice(&buf[..n]);
    }

    // inflating the wire payload recovers the original message
    let mut decompressor = Decompressor::new();
    let mut wire_payload = leftover[2..2 + wire_len].to_vec();
    wire_payload.extend_from_slice(&[0x00, 0x00, 0xFF, 0xFF]);
    let mut plain = Vec::new();
    decompressor.decompress(&wire_payload, &mut plain).unwrap();
    assert_eq!(plain, message.as_bytes());
    listener.stop();
}
