#![no_main]

use ferroskt::config::WebSocketConfig;
use ferroskt::handshake::negotiate;
use libfuzzer_sys::fuzz_target;
use tokio::runtime::Runtime;

/// Feeds arbitrary bytes straight into the handshake negotiator. `negotiate`
/// never panics on malformed input — every failure path returns `Error` and
/// writes a rejection response — so the only thing this target can catch is
/// a panic or a hang (bounded by `handshake_timeout`).
fuzz_target!(|data: &[u8]| {
    let runtime = Runtime::new().unwrap();
    let data = data.to_vec();

    runtime.block_on(async move {
        let (mut client, server) = tokio::io::duplex(8192);
        let _ = tokio::io::AsyncWriteExt::write_all(&mut client, &data).await;
        drop(client);

        let (read_half, mut writer) = tokio::io::split(server);
        let mut reader = tokio::io::BufReader::new(read_half);
        let config = WebSocketConfig {
            handshake_timeout: std::time::Duration::from_millis(200),
            ..WebSocketConfig::default()
        };
        let _ = negotiate(&mut reader, &mut writer, &config).await;
    });
});
