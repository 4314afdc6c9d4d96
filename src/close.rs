//! RFC 6455 close-code enumeration and the wire layout of a Close frame's
//! payload (status code + optional UTF-8 reason).

use crate::error::Error;

/// Status codes a server may legitimately *send* in a Close frame.
///
/// `NoStatusReceived`, `AbnormalClosure` and `TlsHandshakeFailure` are
/// observed-only per RFC 6455 and therefore have no constructor reachable
/// from application code — they only show up when parsing a Close frame
/// that arrived from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    NormalClosure,
    GoingAway,
    ProtocolError,
    UnacceptableDataType,
    NoStatusReceived,
    AbnormalClosure,
    InconsistentDataType,
    PolicyViolation,
    MessageSizeExceeded,
    ExtensionNegotiationFailure,
    UnexpectedCondition,
    TlsHandshakeFailure,
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::NormalClosure => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnacceptableDataType => 1003,
            CloseCode::NoStatusReceived => 1005,
            CloseCode::AbnormalClosure => 1006,
            CloseCode::InconsistentDataType => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageSizeExceeded => 1009,
            CloseCode::ExtensionNegotiationFailure => 1010,
            CloseCode::UnexpectedCondition => 1011,
            CloseCode::TlsHandshakeFailure => 1015,
            CloseCode::Other(code) => code,
        }
    }

    /// Parse a close code observed on the wire. Reserved codes (1004,
    /// 1012-1014) and anything outside the valid range still decode, as
    /// `Other`, since rejecting them is a higher-level policy decision than
    /// the codec should make on behalf of the caller.
    pub fn from_u16(code: u16) -> CloseCode {
        match code {
            1000 => CloseCode::NormalClosure,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::UnacceptableDataType,
            1005 => CloseCode::NoStatusReceived,
            1006 => CloseCode::AbnormalClosure,
            1007 => CloseCode::InconsistentDataType,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageSizeExceeded,
            1010 => CloseCode::ExtensionNegotiationFailure,
            1011 => CloseCode::UnexpectedCondition,
            1015 => CloseCode::TlsHandshakeFailure,
            other => CloseCode::Other(other),
        }
    }
}

/// Encode a Close frame payload: a 16-bit big-endian status code optionally
/// followed by a UTF-8 reason. An empty payload (no code given) is valid and
/// distinct from a payload carrying `NormalClosure` explicitly.
pub fn encode_close_payload(code: Option<CloseCode>, reason: &str) -> Vec<u8> {
    let Some(code) = code else {
        return Vec::new();
    };
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.as_u16().to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Decode a Close frame payload. An empty payload yields `(None, "")`; a
/// payload of a single byte is malformed (the status code is truncated).
pub fn decode_close_payload(payload: &[u8]) -> Result<(Option<CloseCode>, String), Error> {
    if payload.is_empty() {
        return Ok((None, String::new()));
    }
    if payload.len() == 1 {
        return Err(Error::TruncatedCloseCode);
    }
    let code = CloseCode::from_u16(u16::from_be_bytes([payload[0], payload[1]]));
    let reason = String::from_utf8(payload[2..].to_vec())?;
    Ok((Some(code), reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_code_and_reason() {
        let payload = encode_close_payload(Some(CloseCode::GoingAway), "bye");
        let (code, reason) = decode_close_payload(&payload).unwrap();
        assert_eq!(code, Some(CloseCode::GoingAway));
        assert_eq!(reason, "bye");
    }

    #[test]
    fn empty_payload_has_no_code() {
        let (code, reason) = decode_close_payload(&[]).unwrap();
        assert_eq!(code, None);
        assert_eq!(reason, "");
    }

    #[test]
    fn observed_only_codes_still_parse() {
        assert_eq!(CloseCode::from_u16(1006), CloseCode::AbnormalClosure);
        assert_eq!(CloseCode::from_u16(4000), CloseCode::Other(4000));
    }
}
