//! A single accepted peer: the write path, connection metadata, and the
//! `open -> closing -> closed` state machine. The read half is owned
//! exclusively by the receive loop in `receive.rs`; this module only ever
//! touches the write half, serialized behind a mutex so concurrent senders
//! (the application and the receive loop's own control replies) never
//! interleave partial frames on the wire.

use crate::close::{encode_close_payload, CloseCode};
use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::frame::{Frame, OpCode};
use crate::headers::HeaderMap;
use crate::message::Message;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// `handshaking -> open -> closing -> closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Handshaking => 0,
            ConnectionState::Open => 1,
            ConnectionState::Closing => 2,
            ConnectionState::Closed => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Handshaking,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

struct Inner<W> {
    id: ConnectionId,
    created_at: Instant,
    query_string: String,
    headers: HeaderMap,
    writer: Mutex<W>,
    state: AtomicU8,
    config: WebSocketConfig,
    closed: Notify,
    shutdown: Notify,
}

/// The cloneable, `Send + Sync` application-facing handle to a connection:
/// everything an application or the receive loop needs to talk back to
/// the peer, without needing access to the read half.
pub struct ConnectionHandle<W> {
    inner: Arc<Inner<W>>,
}

impl<W> Clone for ConnectionHandle<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W> ConnectionHandle<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        writer: W,
        query_string: String,
        headers: HeaderMap,
        config: WebSocketConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                created_at: Instant::now(),
                query_string,
                headers,
                writer: Mutex::new(writer),
                state: AtomicU8::new(ConnectionState::Handshaking.to_u8()),
                config,
                closed: Notify::new(),
                shutdown: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn query_string(&self) -> &str {
        &self.inner.query_string
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.inner.state.store(state.to_u8(), Ordering::Release);
    }

    /// Serialize via `Frame::encode` and write atomically. Never invoked
    /// with `masked=true` by any path in this crate — server-originated
    /// frames are always unmasked.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), Error> {
        let bytes = frame.encode()?;
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Wrap `message` in a single `fin=1` frame. Fragmentation is exposed
    /// separately via `send_message_fragmented` but never applied here.
    pub async fn send_message(&self, message: Message) -> Result<(), Error> {
        self.send_frame(Frame::new(true, message.opcode(), message.into_bytes()))
            .await
    }

    pub async fn send_message_fragmented(
        &self,
        message: Message,
        fragment_size: usize,
    ) -> Result<(), Error> {
        for frame in message.to_frames(fragment_size) {
            self.send_frame(frame).await?;
        }
        Ok(())
    }

    pub async fn send_control(&self, opcode: OpCode, payload: Vec<u8>) -> Result<(), Error> {
        if payload.len() > 125 {
            return Err(Error::ControlFramePayloadTooLarge);
        }
        self.send_frame(Frame::new(true, opcode, payload)).await
    }

    /// Transition to `closing`, send a Close frame, and wait up to
    /// `close_timeout` for the receive loop to observe the peer's reply (or
    /// the transport dying) and signal teardown. The transport is not
    /// released here — that happens in `dispose`, called by the receive
    /// loop once it actually stops reading.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), Error> {
        self.set_state(ConnectionState::Closing);
        let payload = encode_close_payload(Some(code), reason);
        self.send_frame(Frame::new(true, OpCode::Close, payload))
            .await?;

        let _ = timeout(self.inner.config.close_timeout, self.inner.closed.notified()).await;
        Ok(())
    }

    /// Ask the receive loop driving this connection to stop, used by
    /// `Server::stop` to cancel every live connection without waiting for
    /// a close handshake.
    pub(crate) fn request_shutdown(&self) {
        self.inner.shutdown.notify_waiters();
    }

    pub(crate) async fn wait_for_shutdown(&self) {
        self.inner.shutdown.notified().await;
    }

    /// Idempotent transport release, called once the receive loop has
    /// fully stopped (peer close reply observed, transport error, or close
    /// timeout elapsed). Wakes anyone blocked in `close`.
    pub async fn dispose(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.set_state(ConnectionState::Closed);
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
        drop(writer);
        self.inner.closed.notify_waiters();
        debug!(id = %self.id(), "connection disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderMap;
    use tokio::io::AsyncReadExt;

    fn handle(writer: tokio::io::DuplexStream) -> ConnectionHandle<tokio::io::DuplexStream> {
        ConnectionHandle::new(
            writer,
            "x=1".to_string(),
            HeaderMap::new(),
            WebSocketConfig::default(),
        )
    }

    #[tokio::test]
    async fn starts_handshaking_and_transitions() {
        let (_client, server) = tokio::io::duplex(64);
        let handle = handle(server);
        assert_eq!(handle.state(), ConnectionState::Handshaking);
        handle.set_state(ConnectionState::Open);
        assert_eq!(handle.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn send_frame_writes_unmasked_bytes() {
        let (mut client, server) = tokio::io::duplex(4096);
        let handle = handle(server);
        handle
            .send_frame(Frame::new(true, OpCode::Text, b"hi".to_vec()))
            .await
            .unwrap();

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x81, 0x02, b'h', b'i']);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let (_client, server) = tokio::io::duplex(64);
        let handle = handle(server);
        handle.dispose().await;
        handle.dispose().await;
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn close_sends_unmasked_close_frame_and_transitions_to_closing() {
        let (mut client, server) = tokio::io::duplex(4096);
        let config = WebSocketConfig {
            close_timeout: std::time::Duration::from_millis(50),
            ..WebSocketConfig::default()
        };
        let handle = ConnectionHandle::new(server, "x=1".to_string(), HeaderMap::new(), config);

        handle.close(CloseCode::GoingAway, "bye").await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Closing);

        let mut header = [0u8; 2];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(header, [0x88, (2 + 3) as u8]);
        assert_eq!(header[1] & 0x80, 0, "server frames are never masked");

        let mut payload = [0u8; 5];
        client.read_exact(&mut payload).await.unwrap();
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1001);
        assert_eq!(&payload[2..], b"bye");
    }
}
