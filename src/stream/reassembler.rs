//! Brace/quote/escape scanner that cuts complete JSON objects out of an
//! arbitrarily chunked byte stream.
//!
//! The wire carries no length prefix; a frame ends when the brace depth opened
//! by its first `{` returns to zero. Braces inside string literals are ignored,
//! and a backslash inside a string suppresses interpretation of the next byte.
//! Everything seen at depth zero other than `{` is noise between frames.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{trace, warn};

use crate::error::{LighthouseError, Result};
use crate::generic_types::{ConnectionId, Frame};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Per-connection reassembly state. Lives as long as the connection.
pub struct StreamReassembler {
    connection: ConnectionId,
    buffer: BytesMut,
    // Bytes of `buffer` already scanned. While a frame is open the frame
    // always starts at offset 0.
    scanned: usize,
    depth: u32,
    in_string: bool,
    escape_pending: bool,
    max_frame_bytes: usize,
    framing_errors: u64,
}

impl StreamReassembler {
    pub fn new(connection: ConnectionId) -> Self {
        Self::with_max_frame_bytes(connection, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(connection: ConnectionId, max_frame_bytes: usize) -> Self {
        Self {
            connection,
            buffer: BytesMut::with_capacity(8192),
            scanned: 0,
            depth: 0,
            in_string: false,
            escape_pending: false,
            max_frame_bytes: max_frame_bytes.max(2),
            framing_errors: 0,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Append a chunk and return every frame it completes, in stream order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(bytes) = self.next_span() {
            trace!(connection = %self.connection, len = bytes.len(), "frame complete");
            frames.push(Frame::new(self.connection, bytes));
        }
        frames
    }

    /// Called once the peer has closed. A frame still open at this point is
    /// dropped and reported rather than silently lost.
    pub fn finish(&mut self) -> Result<()> {
        let open = self.depth > 0;
        let buffered = self.buffer.len();
        self.reset();
        self.buffer.clear();

        if open {
            return Err(LighthouseError::TruncatedInput { connection: self.connection, buffered });
        }
        Ok(())
    }

    /// Framing errors seen so far (stray `}` or oversize frames).
    pub fn framing_errors(&self) -> u64 {
        self.framing_errors
    }

    /// Bytes held for a frame that has not completed yet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    fn next_span(&mut self) -> Option<Bytes> {
        while self.scanned < self.buffer.len() {
            let pos = self.scanned;
            let byte = self.buffer[pos];
            self.scanned += 1;

            if self.depth == 0 {
                match byte {
                    b'{' => {
                        // Drop the noise in front of the new frame.
                        self.buffer.advance(pos);
                        self.scanned = 1;
                        self.depth = 1;
                    }
                    b'}' => self.resync("unbalanced '}' outside any object"),
                    _ => {}
                }
                continue;
            }

            if self.in_string {
                if self.escape_pending {
                    self.escape_pending = false;
                } else if byte == b'\\' {
                    self.escape_pending = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
            } else {
                match byte {
                    b'"' => self.in_string = true,
                    b'{' => self.depth += 1,
                    b'}' => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            let span = self.buffer.split_to(self.scanned).freeze();
                            self.scanned = 0;
                            return Some(span);
                        }
                    }
                    _ => {}
                }
            }

            if self.scanned > self.max_frame_bytes {
                let reason = format!("frame exceeds {} bytes", self.max_frame_bytes);
                self.resync(&reason);
            }
        }

        if self.depth == 0 {
            self.buffer.clear();
            self.scanned = 0;
        }
        None
    }

    /// Discard everything scanned so far and look for the next `{` at depth 0.
    fn resync(&mut self, reason: &str) {
        self.framing_errors += 1;
        let err = LighthouseError::Framing { connection: self.connection, reason: reason.to_string() };
        warn!(discarded = self.scanned, "{}", err);

        self.buffer.advance(self.scanned);
        self.reset();
    }

    fn reset(&mut self) {
        self.scanned = 0;
        self.depth = 0;
        self.in_string = false;
        self.escape_pending = false;
    }
}
