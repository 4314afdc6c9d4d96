//! The server: the listening socket, the accept loop, the client registry,
//! and the three application-visible event sinks (on-connect, on-message,
//! on-disconnect).

use crate::config::ServerConfig;
use crate::connection::{ConnectionHandle, ConnectionId, ConnectionState};
use crate::error::Error;
use crate::handshake::negotiate;
use crate::message::Message;
use crate::receive::{self, DisconnectCause};
use socket2::{Domain, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

type Writer = tokio::io::WriteHalf<TcpStream>;
pub type Handle = ConnectionHandle<Writer>;

type ConnectSink = Arc<dyn Fn(Handle) + Send + Sync>;
type MessageSink = Arc<dyn Fn(Handle, Message) + Send + Sync>;
type DisconnectSink = Arc<dyn Fn(ConnectionId, Option<DisconnectCause>) + Send + Sync>;

/// The server-wide client registry: bounded only by how many connections
/// are actually open. Critical sections are limited to insertion/removal.
#[derive(Clone, Default)]
struct ClientRegistry {
    clients: Arc<Mutex<HashMap<ConnectionId, Handle>>>,
}

impl ClientRegistry {
    async fn insert(&self, handle: Handle) {
        self.clients.lock().await.insert(handle.id(), handle);
    }

    async fn remove(&self, id: ConnectionId) -> Option<Handle> {
        self.clients.lock().await.remove(&id)
    }

    async fn all(&self) -> Vec<Handle> {
        self.clients.lock().await.values().cloned().collect()
    }
}

/// Server-side WebSocket endpoint core. Owns the listening socket, the
/// accept loop, and the client registry; `start`/`stop` are the only
/// lifecycle calls.
pub struct WebSocketServer {
    config: ServerConfig,
    on_connect: Option<ConnectSink>,
    on_message: Option<MessageSink>,
    on_disconnect: Option<DisconnectSink>,
    clients: ClientRegistry,
    stopping: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl WebSocketServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            on_connect: None,
            on_message: None,
            on_disconnect: None,
            clients: ClientRegistry::default(),
            stopping: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(Notify::new()),
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// The address the listening socket is actually bound to, once `start`
    /// has completed — useful when `start` was called with port 0 and the
    /// caller needs the ephemeral port the OS assigned.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    pub fn on_connect<F>(&mut self, f: F)
    where
        F: Fn(Handle) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(f));
    }

    pub fn on_message<F>(&mut self, f: F)
    where
        F: Fn(Handle, Message) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(f));
    }

    pub fn on_disconnect<F>(&mut self, f: F)
    where
        F: Fn(ConnectionId, Option<DisconnectCause>) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(f));
    }

    /// Bind, listen with the configured backlog, and spawn the accept
    /// loop. Binding failure is propagated directly rather than retried.
    pub async fn start(&mut self, addr: impl ToSocketAddrs) -> Result<(), Error> {
        let listener = bind_listener(addr, self.config.accept_backlog).await?;
        let bound_addr = listener.local_addr().ok();
        info!(local_addr = ?bound_addr, "server listening");
        *self.local_addr.lock().await = bound_addr;

        let config = self.config.clone();
        let clients = self.clients.clone();
        let stopping = Arc::clone(&self.stopping);
        let stop_signal = Arc::clone(&self.stop_signal);
        let on_connect = self.on_connect.clone();
        let on_message = self.on_message.clone();
        let on_disconnect = self.on_disconnect.clone();
        let handshake_permits = Arc::new(Semaphore::new(config.max_concurrent_handshakes));

        let accept_task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    biased;
                    _ = stop_signal.notified() => break,
                    // `notify_waiters()` only wakes waiters registered at the
                    // instant it's called; it doesn't latch for a `notified()`
                    // future constructed afterward. A `stop()` that races the
                    // narrow window between this `select!` returning and the
                    // next iteration's `notified()` being (re)constructed
                    // could be missed, leaving this loop parked in
                    // `accept()` with nothing left to wake it. Re-checking
                    // the flag on a short tick bounds how long that can last.
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {
                        if stopping.load(Ordering::Acquire) {
                            break;
                        }
                        continue;
                    }
                    accepted = listener.accept() => accepted,
                };

                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                };

                if stopping.load(Ordering::Acquire) {
                    break;
                }

                debug!(%peer_addr, "accepted connection");

                let config = config.clone();
                let clients = clients.clone();
                let on_connect = on_connect.clone();
                let on_message = on_message.clone();
                let on_disconnect = on_disconnect.clone();
                let permit = Arc::clone(&handshake_permits);

                tokio::spawn(async move {
                    let Ok(_permit) = permit.acquire_owned().await else {
                        return;
                    };
                    negotiate_and_serve(
                        stream,
                        config,
                        clients,
                        on_connect,
                        on_message,
                        on_disconnect,
                    )
                    .await;
                });
            }
        });

        *self.accept_task.lock().await = Some(accept_task);
        Ok(())
    }

    /// Request a graceful shutdown: the accept loop exits after its
    /// current `accept` call returns, and every live connection is asked
    /// to close. Awaits the accept task and gives live connections a
    /// bounded window to actually disconnect before returning, so that
    /// once `stop()` returns no further `on_message` call is in flight.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.stop_signal.notify_waiters();

        for handle in self.clients.all().await {
            handle.request_shutdown();
        }

        if let Some(accept_task) = self.accept_task.lock().await.take() {
            let _ = accept_task.await;
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.clients.all().await.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        info!("server stopped");
    }
}

/// Bind via `socket2` so the listen backlog is actually under our control —
/// `tokio::net::TcpListener::bind` always listens with a platform-chosen
/// default, with no way to pass `backlog` through. `SO_REUSEADDR` is set so
/// a restart doesn't fail on a socket still draining in `TIME_WAIT`.
async fn bind_listener(addr: impl ToSocketAddrs, backlog: u32) -> Result<TcpListener, Error> {
    let addr = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no addresses to bind"))?;

    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;

    let listener = std::net::TcpListener::from(socket);
    Ok(TcpListener::from_std(listener)?)
}

async fn negotiate_and_serve(
    stream: TcpStream,
    config: ServerConfig,
    clients: ClientRegistry,
    on_connect: Option<ConnectSink>,
    on_message: Option<MessageSink>,
    on_disconnect: Option<DisconnectSink>,
) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    // A single buffered reader spans both the handshake and the receive
    // loop. The handshake only ever consumes up through the blank line that
    // ends the request headers; anything the client pipelined straight
    // after (the first WebSocket frame, in the same `read()`/TCP segment)
    // stays in this buffer for the receive loop to pick up, instead of being
    // silently dropped.
    let mut reader = tokio::io::BufReader::with_capacity(
        config.web_socket_config.handshake_read_chunk_size,
        read_half,
    );
    let negotiated = negotiate(&mut reader, &mut write_half, &config.web_socket_config).await;

    let request = match negotiated {
        Ok(request) => request,
        Err(err) => {
            debug!(%err, "handshake failed, connection disposed silently");
            return;
        }
    };

    let handle = ConnectionHandle::new(
        write_half,
        request.query_string,
        request.headers,
        config.web_socket_config.clone(),
    );
    handle.set_state(ConnectionState::Open);

    clients.insert(handle.clone()).await;
    if let Some(on_connect) = &on_connect {
        on_connect(handle.clone());
    }

    let connection_id = handle.id();
    let on_message_for_loop = on_message.clone();
    let cause = receive::run(
        reader,
        handle.clone(),
        config.web_socket_config,
        move |handle, message| {
            if let Some(on_message) = &on_message_for_loop {
                on_message(handle.clone(), message);
            }
        },
    )
    .await;

    clients.remove(connection_id).await;
    if let Some(on_disconnect) = &on_disconnect {
        on_disconnect(connection_id, Some(cause));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::close::{decode_close_payload, encode_close_payload, CloseCode};
    use crate::frame::{Frame, OpCode};
    use base64::prelude::BASE64_STANDARD;
    use base64::Engine;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Hand-rolled client handshake, the same shape as
    /// `benchmarking/load_generator.rs` — there is no client mode in this
    /// crate to borrow one from.
    async fn client_handshake(stream: &mut TcpStream) {
        let key = BASE64_STANDARD.encode(b"integration-test-key-16");
        let request = format!(
            "GET /chat?x=1 HTTP/1.1\r\n\
             Host: 127.0.0.1\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&buf).starts_with("HTTP/1.1 101 Switching Protocols"));
    }

    #[tokio::test]
    async fn start_and_stop_without_connections() {
        let mut server = WebSocketServer::new(ServerConfig::default());
        server.start("127.0.0.1:0").await.unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn connect_message_disconnect_round_trip() {
        let mut server = WebSocketServer::new(ServerConfig::default());

        let connected = Arc::new(StdMutex::new(Vec::new()));
        let messages = Arc::new(StdMutex::new(Vec::new()));
        let disconnected = Arc::new(StdMutex::new(Vec::new()));

        let connected_clone = Arc::clone(&connected);
        server.on_connect(move |handle| {
            connected_clone.lock().unwrap().push(handle.query_string().to_string());
        });
        let messages_clone = Arc::clone(&messages);
        server.on_message(move |_handle, message| {
            messages_clone.lock().unwrap().push(message);
        });
        let disconnected_clone = Arc::clone(&disconnected);
        server.on_disconnect(move |id, _cause| {
            disconnected_clone.lock().unwrap().push(id);
        });

        server.start("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client_handshake(&mut client).await;

        let key = [0x11, 0x22, 0x33, 0x44];
        let frame = Frame::masked(true, OpCode::Text, key, b"hello".to_vec());
        client.write_all(&frame.encode().unwrap()).await.unwrap();

        // Poll until the message sink observes it; the receive loop runs on a
        // separate spawned task.
        for _ in 0..200 {
            if !messages.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            messages.lock().unwrap().as_slice(),
            &[crate::message::Message::Text("hello".to_string())]
        );
        assert_eq!(connected.lock().unwrap().as_slice(), &["x=1".to_string()]);

        let close_payload = encode_close_payload(Some(CloseCode::NormalClosure), "");
        let close_frame = Frame::masked(true, OpCode::Close, key, close_payload);
        client.write_all(&close_frame.encode().unwrap()).await.unwrap();

        let mut header = [0u8; 2];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0] & 0x0F, OpCode::Close.as_u8());
        let len = (header[1] & 0x7F) as usize;
        let mut reply_payload = vec![0u8; len];
        client.read_exact(&mut reply_payload).await.unwrap();
        let (code, _) = decode_close_payload(&reply_payload).unwrap();
        assert_eq!(code, Some(CloseCode::NormalClosure));

        for _ in 0..200 {
            if !disconnected.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(disconnected.lock().unwrap().len(), 1);

        server.stop().await;
    }
}
