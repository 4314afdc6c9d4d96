//! The application-visible `Message`: a reassembled logical message, typed
//! Text or Binary. This is what `OnMessage` hands to the application and
//! what `Connection::send_message` accepts — the frame-splitting and
//! reassembly machinery around it lives in `frame.rs` and `receive.rs`.

use crate::error::Error;
use crate::frame::{Frame, OpCode};

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        }
    }

    pub fn as_binary(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }

    pub fn as_text(&self) -> Result<&str, Error> {
        match self {
            Message::Text(text) => Ok(text),
            Message::Binary(_) => Err(Error::NotTextMessage),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
        }
    }

    /// Build a message from the opcode and accumulated payload of a
    /// completed reassembly. `opcode` must be `Text` or `Binary` — the
    /// receive loop never calls this with a control opcode.
    pub fn from_parts(opcode: OpCode, payload: Vec<u8>) -> Result<Self, Error> {
        match opcode {
            OpCode::Text => Ok(Message::Text(String::from_utf8(payload)?)),
            OpCode::Binary => Ok(Message::Binary(payload)),
            other => Err(Error::InvalidOpcode(other.as_u8())),
        }
    }

    /// Split into one or more frames no larger than `fragment_size`. A
    /// single `fin=1` frame is the common case; this is only reached from
    /// `Connection::send_message_fragmented` — fragmentation is never
    /// applied internally.
    pub fn to_frames(self, fragment_size: usize) -> Vec<Frame> {
        let opcode = self.opcode();
        let payload = self.into_bytes();

        if payload.is_empty() {
            return vec![Frame::new(true, opcode, payload)];
        }

        let mut frames: Vec<Frame> = payload
            .chunks(fragment_size)
            .enumerate()
            .map(|(i, chunk)| {
                let frame_opcode = if i == 0 {
                    opcode
                } else {
                    OpCode::Continuation
                };
                Frame::new(false, frame_opcode, chunk.to_vec())
            })
            .collect();

        if let Some(last) = frames.last_mut() {
            last.fin = true;
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_for_small_message() {
        let frames = Message::Text("hi".to_string()).to_frames(1024);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].fin);
        assert_eq!(frames[0].opcode, OpCode::Text);
    }

    #[test]
    fn fragments_large_message() {
        let frames = Message::Binary(vec![0u8; 10]).to_frames(4);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].opcode, OpCode::Binary);
        assert!(!frames[0].fin);
        assert_eq!(frames[1].opcode, OpCode::Continuation);
        assert!(!frames[1].fin);
        assert_eq!(frames[2].opcode, OpCode::Continuation);
        assert!(frames[2].fin);
    }

    #[test]
    fn from_parts_rejects_control_opcode() {
        assert!(Message::from_parts(OpCode::Ping, vec![]).is_err());
    }
}
