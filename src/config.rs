use std::time::Duration;

/// Tunables for a single WebSocket connection: the handshake reader and the
/// receive loop's reassembly ceiling. Defaults match RFC 6455 practice and
/// the numeric defaults called out for this core specifically.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum number of bytes the handshake negotiator will buffer while
    /// looking for the end of the request headers.
    pub handshake_buffer_size: usize,
    /// Capacity of the buffered reader the handshake and the receive loop
    /// share: roughly the size of each individual read performed while
    /// filling the handshake buffer, and the amount of headroom available
    /// for bytes a client pipelines right after the handshake request
    /// before the receive loop takes over reading from the same buffer.
    pub handshake_read_chunk_size: usize,
    /// Total time budget for completing the handshake, from accept to the
    /// 101 response being written.
    pub handshake_timeout: Duration,
    /// Ceiling on a single frame's payload length, and therefore also the
    /// ceiling for a non-fragmented message (whose one frame *is* the whole
    /// message).
    pub max_frame_size: usize,
    /// Ceiling on a reassembled message's total payload length across all
    /// of its fragments.
    pub max_message_size: usize,
    /// How long `Connection::close` waits for the peer's Close reply before
    /// giving up and releasing the transport anyway.
    pub close_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            handshake_buffer_size: 2048,
            handshake_read_chunk_size: 1024,
            handshake_timeout: Duration::from_secs(5),
            max_frame_size: 16 << 20,
            max_message_size: 16 << 20,
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Server-wide configuration: the per-connection `WebSocketConfig`, the TCP
/// accept backlog, and the bound on how many handshakes may be negotiated
/// concurrently before the accept loop backs off spawning new ones.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub web_socket_config: WebSocketConfig,
    pub accept_backlog: u32,
    pub max_concurrent_handshakes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            web_socket_config: WebSocketConfig::default(),
            accept_backlog: 1024,
            max_concurrent_handshakes: 256,
        }
    }
}
