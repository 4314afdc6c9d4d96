//! RFC 6455 frame layout: the opcode enumeration, the `Frame` value, the
//! masking primitive, and the encode/decode pair that turns a `Frame` into
//! its wire bytes and back. No I/O beyond reading from the `AsyncRead`
//! handed to `Frame::decode` — everything else here is a pure transform.

use crate::error::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// The six opcodes RFC 6455 defines. Reserved values (0x3-0x7, 0xB-0xF) are
/// rejected at parse time and never constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(Error::InvalidOpcode(other)),
        }
    }
}

/// Apply the RFC 6455 XOR mask in place. `ApplyMask(ApplyMask(x, k), k) ==
/// x` holds for any length, since XOR with the same key byte is its own
/// inverse.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// A single RFC 6455 frame. `masking_key` is only meaningful when `masked`
/// is set; the payload is stored already unmasked once `decode` returns.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub fin: bool,
    pub masked: bool,
    pub opcode: OpCode,
    pub masking_key: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(fin: bool, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin,
            masked: false,
            opcode,
            masking_key: None,
            payload,
        }
    }

    pub fn masked(fin: bool, opcode: OpCode, masking_key: [u8; 4], payload: Vec<u8>) -> Self {
        Self {
            fin,
            masked: true,
            opcode,
            masking_key: Some(masking_key),
            payload,
        }
    }

    /// UTF-8 decode of the payload, computed on demand rather than cached
    /// alongside the bytes.
    pub fn as_text(&self) -> Result<String, Error> {
        Ok(String::from_utf8(self.payload.clone())?)
    }

    fn validate_control(&self) -> Result<(), Error> {
        if self.opcode.is_control() {
            if !self.fin {
                return Err(Error::ControlFrameFragmented);
            }
            if self.payload.len() > 125 {
                return Err(Error::ControlFramePayloadTooLarge);
            }
        }
        Ok(())
    }

    /// Serialize this frame to its wire layout. The caller is responsible
    /// for setting `masked`/`masking_key` correctly — `masked` must be
    /// false for every frame the server sends.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        self.validate_control()?;

        let payload_len = self.payload.len();
        let len_bytes = if payload_len <= 125 {
            0
        } else if payload_len <= u16::MAX as usize {
            2
        } else {
            8
        };

        let mut buf =
            Vec::with_capacity(2 + len_bytes + if self.masked { 4 } else { 0 } + payload_len);

        let first_byte = ((self.fin as u8) << 7) | self.opcode.as_u8();
        buf.push(first_byte);

        let mask_bit = (self.masked as u8) << 7;
        if len_bytes == 0 {
            buf.push(mask_bit | payload_len as u8);
        } else if len_bytes == 2 {
            buf.push(mask_bit | 126);
            buf.extend_from_slice(&(payload_len as u16).to_be_bytes());
        } else {
            buf.push(mask_bit | 127);
            buf.extend_from_slice(&(payload_len as u64).to_be_bytes());
        }

        if self.masked {
            let key = self.masking_key.ok_or(Error::UnmaskedClientFrame)?;
            buf.extend_from_slice(&key);
            let start = buf.len();
            buf.extend_from_slice(&self.payload);
            apply_mask(&mut buf[start..], key);
        } else {
            buf.extend_from_slice(&self.payload);
        }

        Ok(buf)
    }

    /// Parse one frame off `reader`. `max_frame_size` bounds the payload
    /// length read from the wire, independent of the receive loop's
    /// whole-message ceiling.
    pub async fn decode<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_frame_size: usize,
    ) -> Result<Frame, Error> {
        let mut header = [0u8; 2];
        reader.read_exact(&mut header).await?;

        let fin = (header[0] & 0b1000_0000) != 0;
        let rsv = header[0] & 0b0111_0000;
        if rsv != 0 {
            return Err(Error::ReservedBitsSet);
        }
        let opcode = OpCode::try_from(header[0] & 0b0000_1111)?;

        let masked = (header[1] & 0b1000_0000) != 0;
        let indicator = header[1] & 0b0111_1111;

        let length = match indicator {
            0..=125 => indicator as u64,
            126 => {
                let mut be = [0u8; 2];
                reader.read_exact(&mut be).await?;
                let len = u16::from_be_bytes(be);
                if len <= 125 {
                    return Err(Error::InvalidSizeClass);
                }
                len as u64
            }
            127 => {
                let mut be = [0u8; 8];
                reader.read_exact(&mut be).await?;
                let len = u64::from_be_bytes(be);
                if len >> 63 != 0 || len <= u16::MAX as u64 {
                    return Err(Error::InvalidSizeClass);
                }
                len
            }
            _ => unreachable!("7-bit indicator"),
        };

        if length as usize > max_frame_size {
            return Err(Error::FrameTooLarge(length as usize));
        }

        let masking_key = if masked {
            let mut key = [0u8; 4];
            reader.read_exact(&mut key).await?;
            Some(key)
        } else {
            None
        };

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).await?;
        if let Some(key) = masking_key {
            apply_mask(&mut payload, key);
        }

        let frame = Frame {
            fin,
            masked,
            opcode,
            masking_key,
            payload,
        };
        frame.validate_control()?;
        Ok(frame)
    }
}
