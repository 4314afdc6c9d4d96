use crate::close::CloseCode;
use thiserror::Error;

/// All failure modes the core distinguishes, spanning the handshake,
/// the frame codec, the receive loop and the underlying transport.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("{source}")]
    Timeout {
        #[from]
        source: tokio::time::error::Elapsed,
    },

    #[error("text payload is not valid UTF-8: {source}")]
    InvalidUtf8 {
        #[from]
        source: std::string::FromUtf8Error,
    },

    // --- Handshake errors, surfaced as 400/401 responses, never reach the application ---
    #[error("handshake request did not contain a query-string separator")]
    MissingQueryString,

    #[error("handshake headers exceeded the maximum buffer size before a blank line was seen")]
    HandshakeTooLarge,

    #[error("handshake request line is malformed")]
    MalformedRequestLine,

    #[error("handshake header line is malformed")]
    MalformedHeaderLine,

    #[error("Host header missing from the handshake request")]
    MissingHost,

    #[error("Sec-WebSocket-Key header missing from the handshake request")]
    MissingSecWebSocketKey,

    #[error("Upgrade header missing or not equal to \"websocket\"")]
    MissingUpgradeHeader,

    #[error("Connection header missing or does not contain \"Upgrade\"")]
    MissingConnectionHeader,

    #[error("Sec-WebSocket-Version header missing or not equal to \"13\"")]
    UnsupportedVersion,

    // --- Protocol errors, surfaced by sending a Close frame with the mapped code ---
    #[error("reserved bits are set on the frame header")]
    ReservedBitsSet,

    #[error("opcode {0:#x} is reserved and not one of the defined frame types")]
    InvalidOpcode(u8),

    #[error("control frames must not be fragmented")]
    ControlFrameFragmented,

    #[error("control frame payload exceeds 125 bytes")]
    ControlFramePayloadTooLarge,

    #[error("payload length used a wider size class than necessary")]
    InvalidSizeClass,

    #[error("frame payload of {0} bytes exceeds the configured maximum")]
    FrameTooLarge(usize),

    #[error("assembled message of {0} bytes exceeds the configured maximum")]
    MessageTooLarge(usize),

    #[error("continuation frame received with no fragmented message in progress")]
    UnexpectedContinuation,

    #[error("data frame received while a fragmented message was already in progress")]
    UnexpectedDataFrame,

    #[error("client frame was not masked")]
    UnmaskedClientFrame,

    #[error("close frame payload carried a single byte, too short for a status code")]
    TruncatedCloseCode,

    #[error("peer closed the connection")]
    PeerClosed,

    // --- Application-facing errors, never sent as a Close code ---
    #[error("message is Binary, not Text")]
    NotTextMessage,
}

impl Error {
    /// The RFC 6455 status code a server should close with when this error is
    /// detected after a successful handshake. Handshake and transport errors
    /// have no corresponding close code, since the connection never reaches
    /// `open`, or the transport is already gone.
    pub fn close_code(&self) -> Option<CloseCode> {
        use Error::*;
        match self {
            ReservedBitsSet
            | InvalidOpcode(_)
            | ControlFrameFragmented
            | ControlFramePayloadTooLarge
            | InvalidSizeClass
            | UnexpectedContinuation
            | UnexpectedDataFrame
            | UnmaskedClientFrame
            | TruncatedCloseCode => Some(CloseCode::ProtocolError),
            FrameTooLarge(_) | MessageTooLarge(_) => Some(CloseCode::MessageSizeExceeded),
            InvalidUtf8 { .. } => Some(CloseCode::InconsistentDataType),
            _ => None,
        }
    }
}
