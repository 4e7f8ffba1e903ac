//! Wire framing for the bridge transport
//!
//! Every frame on the wire is `<continuation-char><payload>`: `'1'` when more
//! frames of the same message follow, `'0'` for the last frame. A message is
//! the ordered sequence of frame payloads up to and including the terminal
//! frame.

use thiserror::Error;

/// Continuation character marking a non-terminal frame
pub const MORE_FRAMES: char = '1';
/// Continuation character marking the last frame of a message
pub const LAST_FRAME: char = '0';

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("empty wire frame")]
    Empty,
    #[error("unknown continuation character {0:?}")]
    Continuation(char),
}

/// One wire-level chunk of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Opaque frame payload, typically JSON
    pub payload: String,
    /// Whether more frames of the same message follow
    pub more: bool,
}

impl Frame {
    pub fn new(payload: impl Into<String>, more: bool) -> Self {
        Self {
            payload: payload.into(),
            more,
        }
    }

    /// Encode for the wire, prefixing the continuation character
    pub fn encode(&self) -> String {
        let mut wire = String::with_capacity(self.payload.len() + 1);
        wire.push(if self.more { MORE_FRAMES } else { LAST_FRAME });
        wire.push_str(&self.payload);
        wire
    }

    /// Decode one wire frame
    pub fn decode(wire: &str) -> Result<Self, FrameError> {
        let mut chars = wire.chars();
        let more = match chars.next() {
            Some(MORE_FRAMES) => true,
            Some(LAST_FRAME) => false,
            Some(other) => return Err(FrameError::Continuation(other)),
            None => return Err(FrameError::Empty),
        };
        Ok(Self {
            payload: chars.as_str().to_string(),
            more,
        })
    }
}

/// A terminated sequence of frame payloads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub frames: Vec<String>,
}

impl Message {
    /// Message consisting of a single frame
    pub fn single(payload: impl Into<String>) -> Self {
        Self {
            frames: vec![payload.into()],
        }
    }

    pub fn from_frames(frames: Vec<String>) -> Self {
        Self { frames }
    }

    /// Payload frame of a bridge message. Subscription channels may carry the
    /// topic in a leading frame; the payload is always the terminal frame.
    pub fn payload(&self) -> Option<&str> {
        self.frames.last().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Reassembles inbound frames into messages.
///
/// Frames from one transport connection arrive in send order; a non-terminal
/// frame is buffered and the terminal frame yields the complete message.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    partial: Vec<String>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded frame; returns the message once complete
    pub fn push(&mut self, frame: Frame) -> Option<Message> {
        self.partial.push(frame.payload);
        if frame.more {
            None
        } else {
            Some(Message {
                frames: std::mem::take(&mut self.partial),
            })
        }
    }

    /// Feed one raw wire frame
    pub fn push_wire(&mut self, wire: &str) -> Result<Option<Message>, FrameError> {
        Ok(self.push(Frame::decode(wire)?))
    }

    /// Discard any partially assembled message
    pub fn reset(&mut self) {
        self.partial.clear();
    }
}
