// End-to-end tests over a live TCP socket: raw handshake bytes, masked
// client frames in, unmasked server frames back.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use swiftsock::memory::Buffer;
use swiftsock::{Engine, EngineConfig, MessageHandler, MessageKind, WsConnection};

const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

/// Echoes every data message back on the same connection.
struct Echo;

impl MessageHandler for Echo {
    fn on_message(&self, connection: &WsConnection, kind: MessageKind, payload: Buffer) {
        let sent = match kind {
            MessageKind::Text => {
                connection.send_frame(swiftsock::Opcode::Text, payload.as_slice())
            }
            MessageKind::Binary => connection.send_binary(payload.as_slice()),
        };
        if sent.is_ok() {
            let _ = connection.flush();
        }
    }
}

fn start_echo_engine() -> (Engine, std::net::SocketAddr) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let engine = Engine::with_handler(EngineConfig::default(), Arc::new(Echo)).unwrap();
    let addr = engine.serve("127.0.0.1:0".parse().unwrap()).unwrap();
    (engine, addr)
}

/// Send the RFC 6455 sample upgrade request and return the stream plus
/// any bytes read past the response head.
fn raw_handshake(addr: std::net::SocketAddr) -> (TcpStream, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let request = format!(
        "GET /echo HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
        assert!(head.len() < 8192, "response head never terminated");
    }

    let text = String::from_utf8(head).unwrap();
    assert!(text.contains("HTTP/1.1 101 Switching Protocols"));
    assert!(text.contains("Upgrade: websocket"));
    assert!(text.contains("Connection: Upgrade"));
    assert!(text.contains(&format!("Sec-WebSocket-Accept: {SAMPLE_ACCEPT}")));

    (stream, Vec::new())
}

fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

#[test]
fn test_handshake_and_masked_text_echo() {
    let (engine, addr) = start_echo_engine();
    let (mut stream, _) = raw_handshake(addr);

    // "Hello" masked with key 37 fa 21 3d.
    let key = [0x37u8, 0xFA, 0x21, 0x3D];
    let mut frame = vec![0x81, 0x85];
    frame.extend_from_slice(&key);
    frame.extend(
        b"Hello"
            .iter()
            .enumerate()
            .map(|(i, &b)| b ^ key[i & 3]),
    );
    stream.write_all(&frame).unwrap();

    // The echo comes back unmasked: exactly 81 05 "Hello".
    let echo = read_exact(&mut stream, 7);
    assert_eq!(echo, [0x81, 0x05, 0x48, 0x65, 0x6C, 0x6C, 0x6F]);

    engine.shutdown();
}

#[test]
fn test_masked_binary_echo() {
    let (engine, addr) = start_echo_engine();
    let (mut stream, _) = raw_handshake(addr);

    let key = [0x37u8, 0xFA, 0x21, 0x3D];
    let payload = [0x01u8, 0x02, 0x03, 0x04];
    let mut frame = vec![0x82, 0x84];
    frame.extend_from_slice(&key);
    frame.extend(payload.iter().enumerate().map(|(i, &b)| b ^ key[i & 3]));
    // Masked bytes on the wire are 36 f8 22 39.
    assert_eq!(&frame[6..], &[0x36, 0xF8, 0x22, 0x39]);
    stream.write_all(&frame).unwrap();

    let echo = read_exact(&mut stream, 6);
    assert_eq!(echo, [0x82, 0x04, 0x01, 0x02, 0x03, 0x04]);

    engine.shutdown();
}

#[test]
fn test_ping_answered_with_pong() {
    let (engine, addr) = start_echo_engine();
    let (mut stream, _) = raw_handshake(addr);

    let key = [9u8, 8, 7, 6];
    let mut frame = vec![0x89, 0x82];
    frame.extend_from_slice(&key);
    frame.extend(b"hi".iter().enumerate().map(|(i, &b)| b ^ key[i & 3]));
    stream.write_all(&frame).unwrap();

    let pong = read_exact(&mut stream, 4);
    assert_eq!(pong, [0x8A, 0x02, b'h', b'i']);

    engine.shutdown();
}

#[test]
fn test_fragmented_message_echoed_whole() {
    let (engine, addr) = start_echo_engine();
    let (mut stream, _) = raw_handshake(addr);

    let key = [1u8, 2, 3, 4];
    let mask = |data: &[u8]| -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, &b)| b ^ key[i & 3])
            .collect()
    };

    // text(fin=0, "Hel"), continuation(fin=0, "lo "), continuation(fin=1, "World")
    for (header, body) in [
        (0x01u8, &b"Hel"[..]),
        (0x00, &b"lo "[..]),
        (0x80, &b"World"[..]),
    ] {
        let mut frame = vec![header, 0x80 | body.len() as u8];
        frame.extend_from_slice(&key);
        frame.extend(mask(body));
        stream.write_all(&frame).unwrap();
    }

    let echo = read_exact(&mut stream, 13);
    assert_eq!(echo[0], 0x81);
    assert_eq!(echo[1], 11);
    assert_eq!(&echo[2..], b"Hello World");

    engine.shutdown();
}

#[test]
fn test_close_handshake_completes() {
    let (engine, addr) = start_echo_engine();
    let (mut stream, _) = raw_handshake(addr);

    // Masked close with code 1000.
    let key = [5u8, 6, 7, 8];
    let body = 1000u16.to_be_bytes();
    let mut frame = vec![0x88, 0x82];
    frame.extend_from_slice(&key);
    frame.extend(body.iter().enumerate().map(|(i, &b)| b ^ key[i & 3]));
    stream.write_all(&frame).unwrap();

    // The server echoes a close carrying the same code, then the socket
    // reaches EOF.
    let reply = read_exact(&mut stream, 4);
    assert_eq!(reply[0], 0x88);
    assert_eq!(reply[1], 2);
    assert_eq!(&reply[2..4], &body);

    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);
    assert!(rest.is_empty());

    engine.shutdown();
}
