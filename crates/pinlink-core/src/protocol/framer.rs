//! Line framing
//!
//! Splits the raw byte stream from a board into carriage-return terminated
//! frames. At most one partial frame is buffered between calls, so the frame
//! sequence does not depend on how the input was chunked.

use bytes::{Bytes, BytesMut};
use std::borrow::Cow;
use tracing::warn;

use super::{MAX_FRAME_SIZE, TERMINATOR};

/// One complete message from the board, terminator removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    /// Raw frame bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Two-byte category prefix (shorter if the frame is shorter)
    pub fn prefix(&self) -> &[u8] {
        &self.0[..self.0.len().min(2)]
    }

    /// Frame decoded as text
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<&str> for Frame {
    fn from(s: &str) -> Self {
        Frame(Bytes::copy_from_slice(s.as_bytes()))
    }
}

/// Accumulates bytes and yields complete frames
#[derive(Debug, Default)]
pub struct MessageFramer {
    buffer: BytesMut,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        if self.buffer.len() > MAX_FRAME_SIZE && !self.buffer.contains(&TERMINATOR) {
            warn!(
                "Discarding {} buffered bytes without a frame terminator",
                self.buffer.len()
            );
            self.buffer.clear();
        }
    }

    /// Take the next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Option<Frame> {
        let pos = self.buffer.iter().position(|&b| b == TERMINATOR)?;
        let mut line = self.buffer.split_to(pos + 1);
        line.truncate(pos);
        Some(Frame(line.freeze()))
    }

    /// Append bytes and drain every complete frame
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        self.push(data);
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Number of bytes held as a partial frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
