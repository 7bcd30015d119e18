//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management and a tiny state
//! machine for fragmented frames:
//! - `WaitingForLength`: need the 4-byte length prefix
//! - `WaitingForBody`: length known, filling the frame to `length` bytes
//!
//! The length field counts the whole frame including itself, so a chunk may
//! complete zero or many frames and leave at most one partial frame behind.
//!
//! # Example
//!
//! ```ignore
//! use rsocket_client::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//! let frames = buffer.push(&chunk)?;
//! for frame in frames {
//!     println!("got {:?} on stream {}", frame.frame_type(), frame.stream_id);
//! }
//! ```

use bytes::BytesMut;

use super::frame::Frame;
use super::wire_format::{decode_frame, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};
use crate::error::{RSocketError, Result};

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the 4-byte length prefix.
    WaitingForLength,
    /// Length known; waiting until `length` total bytes are buffered.
    WaitingForBody { length: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// All data is stored in a single `BytesMut`; every extracted frame slice
/// begins with its original length prefix.
pub struct FrameBuffer {
    /// Accumulated bytes from transport reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed frame length.
    max_frame_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default max frame size (16 MB).
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom max frame size.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            state: State::WaitingForLength,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data stays buffered for the next push. A malformed length or
    /// an undecodable frame is connection-fatal and surfaces as an error.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        if let State::WaitingForLength = self.state {
            if self.buffer.len() < 4 {
                return Ok(None);
            }
            let length =
                u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]);

            if (length as usize) < FRAME_HEADER_SIZE {
                return Err(RSocketError::Frame(format!(
                    "Frame length {length} shorter than header"
                )));
            }
            if length > self.max_frame_size {
                return Err(RSocketError::Frame(format!(
                    "Frame length {} exceeds maximum {}",
                    length, self.max_frame_size
                )));
            }

            self.state = State::WaitingForBody {
                length: length as usize,
            };
        }

        let State::WaitingForBody { length } = self.state else {
            return Ok(None);
        };
        if self.buffer.len() < length {
            return Ok(None);
        }

        // Split the frame off, length prefix included.
        let frame_bytes = self.buffer.split_to(length).freeze();
        self.state = State::WaitingForLength;

        decode_frame(&frame_bytes).map(Some)
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForLength;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
