//! Per-connection reassembly: turn arbitrary read chunks into complete messages.
//!
//! A message moves through `TagPending -> (LengthPending) -> BodyPending`; the
//! bytes received so far are kept between calls, so a short read simply
//! suspends the message until more input arrives.

use crate::protocol::{Layout, Message, MessageKind, TAG_LEN};
use crate::wire::{self, DecodeError};

/// Where the in-flight message stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    /// No message in progress.
    Idle,
    /// Waiting for the 2-byte tag.
    TagPending,
    /// Tag known; waiting for the length/count field of a variable-size kind.
    LengthPending { kind: MessageKind, field_len: usize },
    /// Total length known; waiting for the rest of the message.
    BodyPending { kind: MessageKind, target: usize },
}

/// Result of feeding input.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Complete(Message),
    /// Input exhausted mid-message; call again when more bytes arrive.
    WouldBlock,
}

/// Reassembly state for one connection. At most one message in flight.
#[derive(Debug)]
pub struct Reassembler {
    state: ReassemblyState,
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            state: ReassemblyState::Idle,
            buf: Vec::new(),
        }
    }

    pub fn state(&self) -> ReassemblyState {
        self.state
    }

    /// Bytes of the in-flight message received so far.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Abandon any partial message.
    pub fn reset(&mut self) {
        self.state = ReassemblyState::Idle;
        self.buf.clear();
    }

    /// Consume bytes from the front of `input`, never past the end of the current message.
    /// On error the partial message is dropped; the connection should be closed.
    pub fn feed(&mut self, input: &mut &[u8]) -> Result<Progress, DecodeError> {
        let r = self.advance(input);
        if r.is_err() {
            self.reset();
        }
        r
    }

    fn advance(&mut self, input: &mut &[u8]) -> Result<Progress, DecodeError> {
        loop {
            match self.state {
                ReassemblyState::Idle => {
                    self.buf.clear();
                    self.state = ReassemblyState::TagPending;
                }
                ReassemblyState::TagPending => {
                    if !self.fill_to(TAG_LEN, input) {
                        return Ok(Progress::WouldBlock);
                    }
                    let tag = u16::from_ne_bytes([self.buf[0], self.buf[1]]);
                    let kind =
                        MessageKind::from_tag(tag).ok_or(DecodeError::UnknownMessageType(tag))?;
                    self.state = match kind.layout() {
                        Layout::Fixed(target) => ReassemblyState::BodyPending { kind, target },
                        Layout::Prefixed(field_len) => {
                            ReassemblyState::LengthPending { kind, field_len }
                        }
                    };
                }
                ReassemblyState::LengthPending { kind, field_len } => {
                    if !self.fill_to(TAG_LEN + field_len, input) {
                        return Ok(Progress::WouldBlock);
                    }
                    let field = &self.buf[TAG_LEN..TAG_LEN + field_len];
                    let value = match field_len {
                        2 => u32::from(u16::from_ne_bytes([field[0], field[1]])),
                        _ => u32::from_ne_bytes([field[0], field[1], field[2], field[3]]),
                    };
                    let target = kind
                        .prefixed_len(value)
                        .ok_or(DecodeError::InvalidValue("length field out of range"))?;
                    self.state = ReassemblyState::BodyPending { kind, target };
                }
                ReassemblyState::BodyPending { target, .. } => {
                    if !self.fill_to(target, input) {
                        return Ok(Progress::WouldBlock);
                    }
                    let msg = wire::decode(&self.buf)?;
                    self.reset();
                    return Ok(Progress::Complete(msg));
                }
            }
        }
    }

    /// Move bytes from `input` until the buffer holds `target` bytes. True when it does.
    fn fill_to(&mut self, target: usize, input: &mut &[u8]) -> bool {
        let missing = target.saturating_sub(self.buf.len());
        let n = missing.min(input.len());
        self.buf.extend_from_slice(&input[..n]);
        *input = &input[n..];
        self.buf.len() >= target
    }

    /// Feed a whole read chunk; returns every message completed by it, in order.
    pub fn drain(&mut self, mut bytes: &[u8]) -> Result<Vec<Message>, DecodeError> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            match self.feed(&mut bytes)? {
                Progress::Complete(msg) => out.push(msg),
                Progress::WouldBlock => break,
            }
        }
        Ok(out)
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
