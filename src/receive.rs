//! The per-connection receive loop and the message reassembler
//! encapsulated inside its state. Reads frames one at a time off the read
//! half, answers control frames itself, and surfaces completed data
//! messages to the caller-supplied sink.

use crate::close::CloseCode;
use crate::config::WebSocketConfig;
use crate::connection::ConnectionHandle;
use crate::error::Error;
use crate::frame::{Frame, OpCode};
use crate::message::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{trace, warn};

/// Why a connection's receive loop ended, handed to `OnDisconnect`.
#[derive(Debug)]
pub enum DisconnectCause {
    /// The peer sent a Close frame; carries the code/reason it sent, if
    /// any (an empty Close payload yields `None`/empty reason).
    PeerClosed(Option<CloseCode>, String),
    /// An RFC 6455 violation was detected; the mapped Close was sent
    /// before the loop exited.
    Protocol(Error),
    /// An I/O failure on the transport.
    Transport(Error),
    /// `Server::stop` asked every connection to shut down.
    ServerShutdown,
}

/// In-progress reassembly of a fragmented message: the opcode of the
/// initiating frame and the payload accumulated from it and any
/// `Continuation` frames seen so far. Private to the receive loop — there
/// is no standalone public reassembler type.
struct Reassembly {
    opcode: OpCode,
    buf: Vec<u8>,
}

/// Drive one connection's receive loop to completion. Calls `on_message`
/// synchronously on this task for every completed message. Returns once
/// the connection has been disposed.
pub async fn run<R, W, F>(
    mut reader: R,
    handle: ConnectionHandle<W>,
    config: WebSocketConfig,
    on_message: F,
) -> DisconnectCause
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Fn(&ConnectionHandle<W>, Message),
{
    let mut reassembly: Option<Reassembly> = None;

    let cause = loop {
        let decoded = tokio::select! {
            biased;
            _ = handle.wait_for_shutdown() => {
                break DisconnectCause::ServerShutdown;
            }
            decoded = Frame::decode(&mut reader, config.max_frame_size) => decoded,
        };

        match decoded {
            Ok(frame) => {
                if !frame.masked {
                    break close_with(&handle, Error::UnmaskedClientFrame).await;
                }

                match handle_frame(frame, &mut reassembly, &config) {
                    Ok(Some(Outcome::Message(message))) => on_message(&handle, message),
                    Ok(Some(Outcome::Ping(payload))) => {
                        if let Err(err) = handle.send_control(OpCode::Pong, payload).await {
                            break DisconnectCause::Transport(err);
                        }
                    }
                    Ok(Some(Outcome::Close(code, reason))) => {
                        let reply_code = code.unwrap_or(CloseCode::NormalClosure);
                        let _ = reply_close(&handle, reply_code).await;
                        break DisconnectCause::PeerClosed(code, reason);
                    }
                    Ok(None) => {}
                    Err(err) => break close_with(&handle, err).await,
                }
            }
            Err(Error::Io { source }) => break DisconnectCause::Transport(Error::Io { source }),
            Err(err) => break close_with(&handle, err).await,
        }
    };

    handle.dispose().await;
    cause
}

enum Outcome {
    Message(Message),
    Ping(Vec<u8>),
    Close(Option<CloseCode>, String),
}

fn handle_frame(
    frame: Frame,
    reassembly: &mut Option<Reassembly>,
    config: &WebSocketConfig,
) -> Result<Option<Outcome>, Error> {
    match frame.opcode {
        OpCode::Close => {
            let (code, reason) = crate::close::decode_close_payload(&frame.payload)?;
            Ok(Some(Outcome::Close(code, reason)))
        }
        OpCode::Ping => Ok(Some(Outcome::Ping(frame.payload))),
        OpCode::Pong => Ok(None),
        OpCode::Continuation => {
            let active = reassembly.as_mut().ok_or(Error::UnexpectedContinuation)?;
            let total = active.buf.len() + frame.payload.len();
            if total > config.max_message_size {
                return Err(Error::MessageTooLarge(total));
            }
            active.buf.extend_from_slice(&frame.payload);
            if frame.fin {
                let finished = reassembly.take().unwrap();
                let message = Message::from_parts(finished.opcode, finished.buf)?;
                Ok(Some(Outcome::Message(message)))
            } else {
                Ok(None)
            }
        }
        OpCode::Text | OpCode::Binary => {
            if reassembly.is_some() {
                return Err(Error::UnexpectedDataFrame);
            }
            if frame.fin {
                if frame.payload.len() > config.max_message_size {
                    return Err(Error::MessageTooLarge(frame.payload.len()));
                }
                let message = Message::from_parts(frame.opcode, frame.payload)?;
                Ok(Some(Outcome::Message(message)))
            } else {
                *reassembly = Some(Reassembly {
                    opcode: frame.opcode,
                    buf: frame.payload,
                });
                Ok(None)
            }
        }
    }
}

/// Send a Close frame with `code` and transition to `closing`. This is the
/// receive loop's own reply path — it must not go through
/// `ConnectionHandle::close`, which blocks waiting for the teardown signal
/// that only `dispose` (called once this loop actually exits) raises.
async fn reply_close<W>(handle: &ConnectionHandle<W>, code: CloseCode) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    use crate::connection::ConnectionState;
    handle.set_state(ConnectionState::Closing);
    let payload = crate::close::encode_close_payload(Some(code), "");
    handle
        .send_frame(Frame::new(true, OpCode::Close, payload))
        .await
}

/// Send the Close frame mapped from `err`'s `close_code` (falling back to
/// `ProtocolError` for anything without one, since this helper is only
/// reached for post-handshake failures) and report the cause.
async fn close_with<W>(handle: &ConnectionHandle<W>, err: Error) -> DisconnectCause
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let code = err.close_code().unwrap_or(CloseCode::ProtocolError);
    warn!(%err, code = code.as_u16(), "closing connection after protocol error");
    if let Err(send_err) = reply_close(handle, code).await {
        trace!(%send_err, "failed to send close frame after protocol error");
    }
    DisconnectCause::Protocol(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;
    use crate::headers::HeaderMap;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncWriteExt;

    /// `Frame::encode` masks in place, so the helper hands it the plaintext
    /// payload directly rather than pre-masking it (which would cancel out).
    fn masked_frame(fin: bool, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        let key = [0x11, 0x22, 0x33, 0x44];
        Frame::masked(fin, opcode, key, payload.to_vec()).encode().unwrap()
    }

    #[tokio::test]
    async fn surfaces_single_frame_message() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(&masked_frame(true, OpCode::Text, b"hello"))
            .await
            .unwrap();
        drop(client);

        let (reader, writer) = tokio::io::split(server);
        let handle = ConnectionHandle::new(
            writer,
            String::new(),
            HeaderMap::new(),
            WebSocketConfig::default(),
        );

        let messages = Arc::new(Mutex::new(Vec::new()));
        let messages_clone = Arc::clone(&messages);
        let cause = run(reader, handle, WebSocketConfig::default(), move |_h, m| {
            messages_clone.lock().unwrap().push(m);
        })
        .await;

        assert_eq!(messages.lock().unwrap().as_slice(), &[Message::Text("hello".into())]);
        assert!(matches!(cause, DisconnectCause::Transport(_)));
    }

    #[tokio::test]
    async fn reassembles_fragmented_binary_message() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(&masked_frame(false, OpCode::Binary, &[0x01, 0x02]))
            .await
            .unwrap();
        client
            .write_all(&masked_frame(false, OpCode::Continuation, &[0x03]))
            .await
            .unwrap();
        client
            .write_all(&masked_frame(true, OpCode::Continuation, &[0x04]))
            .await
            .unwrap();
        drop(client);

        let (reader, writer) = tokio::io::split(server);
        let handle = ConnectionHandle::new(
            writer,
            String::new(),
            HeaderMap::new(),
            WebSocketConfig::default(),
        );

        let messages = Arc::new(Mutex::new(Vec::new()));
        let messages_clone = Arc::clone(&messages);
        run(reader, handle, WebSocketConfig::default(), move |_h, m| {
            messages_clone.lock().unwrap().push(m);
        })
        .await;

        assert_eq!(
            messages.lock().unwrap().as_slice(),
            &[Message::Binary(vec![0x01, 0x02, 0x03, 0x04])]
        );
    }

    #[tokio::test]
    async fn unmasked_client_frame_is_a_protocol_error() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(&Frame::new(true, OpCode::Text, b"hi".to_vec()).encode().unwrap())
            .await
            .unwrap();

        let (reader, writer) = tokio::io::split(server);
        let handle = ConnectionHandle::new(
            writer,
            String::new(),
            HeaderMap::new(),
            WebSocketConfig::default(),
        );

        let cause = run(reader, handle, WebSocketConfig::default(), |_h, _m| {}).await;
        assert!(matches!(
            cause,
            DisconnectCause::Protocol(Error::UnmaskedClientFrame)
        ));
    }

    #[tokio::test]
    async fn continuation_without_active_reassembly_is_protocol_error() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(&masked_frame(true, OpCode::Continuation, b"x"))
            .await
            .unwrap();

        let (reader, writer) = tokio::io::split(server);
        let handle = ConnectionHandle::new(
            writer,
            String::new(),
            HeaderMap::new(),
            WebSocketConfig::default(),
        );

        let cause = run(reader, handle, WebSocketConfig::default(), |_h, _m| {}).await;
        assert!(matches!(
            cause,
            DisconnectCause::Protocol(Error::UnexpectedContinuation)
        ));
    }

    #[tokio::test]
    async fn ping_gets_unmasked_pong_reply() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(&masked_frame(true, OpCode::Ping, b"abc"))
            .await
            .unwrap();

        let (reader, writer) = tokio::io::split(server);
        let handle = ConnectionHandle::new(
            writer,
            String::new(),
            HeaderMap::new(),
            WebSocketConfig::default(),
        );

        let join = tokio::spawn(run(reader, handle, WebSocketConfig::default(), |_h, _m| {}));

        let mut header = [0u8; 2];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut header)
            .await
            .unwrap();
        assert_eq!(header, [0x8A, 0x03]);
        let mut payload = [0u8; 3];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut payload)
            .await
            .unwrap();
        assert_eq!(&payload, b"abc");

        drop(client);
        join.await.unwrap();
    }

    #[tokio::test]
    async fn peer_close_gets_echoed_and_fires_disconnect_once() {
        let (mut client, server) = tokio::io::duplex(4096);
        let close_payload = crate::close::encode_close_payload(Some(CloseCode::GoingAway), "");
        client
            .write_all(&masked_frame(true, OpCode::Close, &close_payload))
            .await
            .unwrap();

        let (reader, writer) = tokio::io::split(server);
        let handle = ConnectionHandle::new(
            writer,
            String::new(),
            HeaderMap::new(),
            WebSocketConfig::default(),
        );

        let cause = run(reader, handle, WebSocketConfig::default(), |_h, _m| {}).await;
        assert!(matches!(
            cause,
            DisconnectCause::PeerClosed(Some(CloseCode::GoingAway), _)
        ));
    }
}
