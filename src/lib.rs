//! A server-side WebSocket (RFC 6455) core for Tokio.
//!
//! This crate accepts plain TCP connections, performs the HTTP/1.1 Upgrade
//! handshake without a general-purpose HTTP parser, and carries a
//! bidirectional stream of framed messages between the network and
//! application-level event handlers installed on a [`server::WebSocketServer`].
//!
//! Out of scope: TLS termination (terminate upstream if needed), HTTP/2,
//! the Hixie drafts, outbound client mode, and compression extensions —
//! `Sec-WebSocket-Extensions` is never inspected, so a peer offering
//! permessage-deflate gets a handshake response without it.

pub mod close;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod headers;
pub mod message;
pub mod receive;
pub mod server;

pub use close::CloseCode;
pub use config::{ServerConfig, WebSocketConfig};
pub use connection::{ConnectionId, ConnectionState};
pub use error::Error;
pub use frame::{Frame, OpCode};
pub use message::Message;
pub use receive::DisconnectCause;
pub use server::{Handle as ConnectionHandle, WebSocketServer};
