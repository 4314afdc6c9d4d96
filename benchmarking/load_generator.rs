//! Load generator driving a running `WebSocketServer` from many concurrent
//! plain-TCP clients. There is no outbound client mode to reuse here, so
//! this tool speaks just enough of the handshake and frame codec by hand to
//! round-trip messages and measure latency.

use ferroskt::frame::{Frame, OpCode};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    let addr = "127.0.0.1:9002";
    let connection_count = 100;
    let message_count = 1000;
    let message_size = 16384;

    let (tx, mut rx) = mpsc::unbounded_channel();

    for i in 0..connection_count {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.expect("connect");
            perform_client_handshake(&mut stream).await.expect("handshake");

            let payload = vec![b'a'; message_size];
            let mut mask_seed = 0x9E3779B9u32.wrapping_add(i as u32);
            let start = Instant::now();

            for _ in 0..message_count {
                let key = next_mask(&mut mask_seed);
                let frame = Frame::masked(true, OpCode::Text, key, payload.clone());
                stream.write_all(&frame.encode().unwrap()).await.expect("send");
                Frame::decode(&mut stream, 1 << 20).await.expect("recv");
            }

            let duration = start.elapsed();
            let _ = tx.send(duration);
        });
    }

    drop(tx);

    let mut total_duration = Duration::new(0, 0);
    let mut completed = 0u32;
    while let Some(duration) = rx.recv().await {
        total_duration += duration;
        completed += 1;
    }

    if completed > 0 {
        let avg_latency = total_duration / (completed * message_count as u32);
        println!("Average Latency: {:?}", avg_latency);
    }
}

/// A deterministic (non-cryptographic) mask generator. The masking key has
/// no confidentiality role in RFC 6455 — it exists to stop naive
/// byte-pattern caching of client payloads on shared proxies, so a simple
/// stream cipher is fine for load-testing traffic.
fn next_mask(seed: &mut u32) -> [u8; 4] {
    *seed ^= *seed << 13;
    *seed ^= *seed >> 17;
    *seed ^= *seed << 5;
    seed.to_le_bytes()
}

async fn perform_client_handshake(stream: &mut TcpStream) -> std::io::Result<()> {
    let key = base64::Engine::encode(&base64::prelude::BASE64_STANDARD, b"load-generator-key-16b");
    let request = format!(
        "GET /bench?run=1 HTTP/1.1\r\n\
         Host: 127.0.0.1\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = stream.read(&mut chunk).await?;
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || n == 0 {
            break;
        }
    }
    Ok(())
}
