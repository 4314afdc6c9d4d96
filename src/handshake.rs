//! The handshake negotiator: reads a raw HTTP/1.1 Upgrade request directly
//! off the accepted socket (no general-purpose HTTP parser), validates it,
//! and writes the 101 response.

use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::headers::HeaderMap;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The parts of the request the rest of the crate cares about: the
/// query-string portion of the request target, and the header map.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub query_string: String,
    pub headers: HeaderMap,
    key: Vec<u8>,
}

/// Read the request off `reader` into a bounded buffer, parse it, validate
/// the upgrade, and write the 101 response to `writer`. Returns the parsed
/// request on success; any failure has already written a 400/401 response
/// before returning its `Error`.
///
/// `reader` must be a buffered reader (`tokio::io::BufReader` or similar)
/// that the caller keeps using afterward for the receive loop. Only the
/// bytes making up the request line and headers are ever consumed from it
/// here — anything the client pipelined immediately after the trailing
/// `\r\n\r\n` (most commonly the first WebSocket frame, arriving in the same
/// `read()`/TCP segment as the handshake) is left sitting in `reader`'s
/// internal buffer rather than being read and discarded.
pub async fn negotiate<R, W>(
    reader: &mut R,
    writer: &mut W,
    config: &WebSocketConfig,
) -> Result<HandshakeRequest, Error>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = timeout(
        config.handshake_timeout,
        read_request(reader, config.handshake_buffer_size),
    )
    .await;

    let buf = match result {
        Ok(Ok(buf)) => buf,
        Ok(Err(err)) => {
            reject(writer, &err).await;
            return Err(err);
        }
        Err(_) => {
            let err = Error::HandshakeTooLarge;
            reject(writer, &err).await;
            return Err(err);
        }
    };

    match parse_and_validate(&buf) {
        Ok(request) => {
            let accept_value = compute_accept_value(&request.key);
            write_switching_protocols(writer, &accept_value).await?;
            debug!(query = %request.query_string, "handshake negotiated");
            Ok(request)
        }
        Err(err) => {
            reject(writer, &err).await;
            Err(err)
        }
    }
}

async fn reject<W: AsyncWrite + Unpin>(writer: &mut W, err: &Error) {
    let status = match err {
        Error::MissingQueryString => "HTTP/1.1 401\r\n\r\n",
        _ => "HTTP/1.1 400\r\n\r\n",
    };
    warn!(%err, "handshake rejected");
    let _ = writer.write_all(status.as_bytes()).await;
    let _ = writer.flush().await;
}

/// Read chunks off `reader` into a buffer bounded by `max_buffer`, until a
/// `\r\n\r\n` blank line is seen. Never re-scans bytes already confirmed
/// clean of the delimiter, and never consumes more from `reader` than the
/// header bytes themselves — anything `fill_buf` hands back past the blank
/// line is left unconsumed, so it stays buffered for whatever reads
/// `reader` next.
async fn read_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_buffer: usize,
) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(max_buffer.min(4096));
    let mut scanned = 0usize;

    loop {
        let chunk_len = {
            let chunk = reader.fill_buf().await?;
            if chunk.is_empty() {
                return Err(Error::MalformedRequestLine);
            }
            buf.extend_from_slice(chunk);
            chunk.len()
        };

        if let Some(pos) = find_blank_line(&buf, scanned) {
            let header_len = pos + 4;
            // Only the bytes up through the blank line belong to the
            // request; consume exactly those from this chunk and leave the
            // rest (pipelined frame bytes, if any) in `reader`'s buffer.
            let consumed_from_chunk = chunk_len - (buf.len() - header_len);
            reader.consume(consumed_from_chunk);
            buf.truncate(header_len);
            return Ok(buf);
        }

        reader.consume(chunk_len);
        scanned = buf.len().saturating_sub(3);

        if buf.len() >= max_buffer {
            return Err(Error::HandshakeTooLarge);
        }
    }
}

fn find_blank_line(buf: &[u8], scanned_from: usize) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    buf[scanned_from..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + scanned_from)
}

fn parse_and_validate(buf: &[u8]) -> Result<HandshakeRequest, Error> {
    let text = String::from_utf8_lossy(buf);
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(Error::MalformedRequestLine)?;
    let query_string = extract_query_string(request_line)?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or(Error::MalformedHeaderLine)?;
        headers.insert(name.trim(), value.trim_start().as_bytes().to_vec());
    }

    let key = validate_upgrade(&headers)?;
    Ok(HandshakeRequest {
        query_string,
        headers,
        key,
    })
}

/// First pass: scan the request line for `?` followed by the target-ending
/// space, extracting everything between as the query string. The method
/// and path themselves are not interpreted beyond this.
fn extract_query_string(request_line: &str) -> Result<String, Error> {
    let question = request_line.find('?').ok_or(Error::MissingQueryString)?;
    let rest = &request_line[question + 1..];
    let end = rest.find(' ').unwrap_or(rest.len());
    Ok(rest[..end].to_string())
}

fn validate_upgrade(headers: &HeaderMap) -> Result<Vec<u8>, Error> {
    if headers.get("Host").is_none() {
        return Err(Error::MissingHost);
    }
    if !headers.equals_ignore_case("Upgrade", "websocket") {
        return Err(Error::MissingUpgradeHeader);
    }
    if !headers.contains_token("Connection", "upgrade") {
        return Err(Error::MissingConnectionHeader);
    }
    if !headers.equals_ignore_case("Sec-WebSocket-Version", "13") {
        return Err(Error::UnsupportedVersion);
    }
    headers
        .get("Sec-WebSocket-Key")
        .map(|key| key.to_vec())
        .ok_or(Error::MissingSecWebSocketKey)
}

/// Base64(SHA-1(key ∥ GUID)). Uses the full trimmed key value, unlike an
/// off-by-one variant that drops the key's trailing byte before hashing
/// (see DESIGN.md).
fn compute_accept_value(key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

async fn write_switching_protocols<W: AsyncWrite + Unpin>(
    writer: &mut W,
    accept_value: &str,
) -> Result<(), Error> {
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept_value}\r\n\
         \r\n"
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
