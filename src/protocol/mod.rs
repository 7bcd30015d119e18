//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary protocol:
//! - 12-byte header encoding/decoding (length prefix included)
//! - typed per-kind frame bodies
//! - frame buffer for accumulating partial reads

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{Frame, FrameBody, Payload};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    decode_frame, encode_frame, flags, frame_length, ErrorCode, FrameType, CONNECTION_STREAM_ID,
    DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, MAX_STREAM_ID, VERSION,
};
