//! Wire format encoding and decoding.
//!
//! Implements the 12-byte frame header:
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┐
//! │ Length   │ Type     │ Flags    │ Stream ID│
//! │ 4 bytes  │ 2 bytes  │ 2 bytes  │ 4 bytes  │
//! │ uint32 BE│ uint16 BE│ uint16 BE│ uint32 BE│
//! └──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. The length field counts the whole
//! frame, including the length field itself. Kind-specific fields follow the
//! header, then an optional metadata block, then data to the end of the frame.
//!
//! The metadata block is prefixed by a `u32` length that **includes the four
//! length bytes themselves**. This inclusivity is part of the wire contract
//! and must not be normalized away.

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::{Frame, FrameBody};
use crate::error::{RSocketError, Result};

/// Frame header size in bytes (fixed, exactly 12, length field included).
pub const FRAME_HEADER_SIZE: usize = 12;

/// Protocol version emitted in SETUP frames.
pub const VERSION: u32 = 0;

/// Highest assignable stream id (2^31 - 1); exhaustion is connection-fatal.
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// Stream id reserved for the SETUP/connection stream.
pub const CONNECTION_STREAM_ID: u32 = 0;

/// Default maximum frame length accepted from the wire (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Flag constants for the protocol.
pub mod flags {
    /// No flags set.
    pub const NONE: u16 = 0x0000;
    /// A metadata block is present (derived from the frame, never stored).
    pub const METADATA: u16 = 0x4000;
    /// More fragments of this payload follow.
    pub const FOLLOWS: u16 = 0x2000;
    /// SETUP: the client honors server-issued leases.
    pub const LEASE: u16 = 0x1000;
    /// SETUP: strict interpretation of the protocol.
    pub const STRICT: u16 = 0x0800;
    /// KEEPALIVE: the receiver must mirror this frame back.
    pub const KEEPALIVE_RESPONSE: u16 = 0x0400;

    /// Bits with no assigned meaning; must be zero on the wire.
    pub const RESERVED_MASK: u16 = !(METADATA | FOLLOWS | LEASE | STRICT | KEEPALIVE_RESPONSE);

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u16, flag: u16) -> bool {
        flags & flag != 0
    }
}

/// Frame type identifiers (u16 on the wire).
///
/// The full v0 type space is represented; only the subset used by
/// request/response interactions is encodable and decodable. The rest is
/// reserved and reported as unsupported when seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameType {
    Setup = 0x0001,
    Lease = 0x0002,
    Keepalive = 0x0003,
    RequestResponse = 0x0004,
    RequestFnf = 0x0005,
    RequestStream = 0x0006,
    RequestSub = 0x0007,
    RequestChannel = 0x0008,
    RequestN = 0x0009,
    Cancel = 0x000A,
    Response = 0x000B,
    Error = 0x000C,
    MetadataPush = 0x000D,
    Next = 0x000E,
    Complete = 0x000F,
    NextComplete = 0x0010,
    Ext = 0xFFFF,
}

impl FrameType {
    /// Decode a wire value; `None` for values outside the type space.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(FrameType::Setup),
            0x0002 => Some(FrameType::Lease),
            0x0003 => Some(FrameType::Keepalive),
            0x0004 => Some(FrameType::RequestResponse),
            0x0005 => Some(FrameType::RequestFnf),
            0x0006 => Some(FrameType::RequestStream),
            0x0007 => Some(FrameType::RequestSub),
            0x0008 => Some(FrameType::RequestChannel),
            0x0009 => Some(FrameType::RequestN),
            0x000A => Some(FrameType::Cancel),
            0x000B => Some(FrameType::Response),
            0x000C => Some(FrameType::Error),
            0x000D => Some(FrameType::MetadataPush),
            0x000E => Some(FrameType::Next),
            0x000F => Some(FrameType::Complete),
            0x0010 => Some(FrameType::NextComplete),
            0xFFFF => Some(FrameType::Ext),
            _ => None,
        }
    }

    /// Whether this type is implemented by the request/response core.
    pub fn is_supported(self) -> bool {
        matches!(
            self,
            FrameType::Setup
                | FrameType::Lease
                | FrameType::Keepalive
                | FrameType::RequestResponse
                | FrameType::Cancel
                | FrameType::Response
                | FrameType::Error
        )
    }
}

/// Wire error codes (u32) carried by ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    InvalidSetup = 0x0000_0001,
    UnsupportedSetup = 0x0000_0002,
    RejectedSetup = 0x0000_0003,
    ConnectionError = 0x0000_0101,
    ApplicationError = 0x0000_0201,
    Rejected = 0x0000_0202,
    Canceled = 0x0000_0203,
    Invalid = 0x0000_0204,
    Reserved = 0xFFFF_FFFF,
}

impl ErrorCode {
    /// Decode a wire value; unknown values map to [`ErrorCode::Reserved`].
    pub fn from_u32(value: u32) -> Self {
        match value {
            0x0000_0001 => ErrorCode::InvalidSetup,
            0x0000_0002 => ErrorCode::UnsupportedSetup,
            0x0000_0003 => ErrorCode::RejectedSetup,
            0x0000_0101 => ErrorCode::ConnectionError,
            0x0000_0201 => ErrorCode::ApplicationError,
            0x0000_0202 => ErrorCode::Rejected,
            0x0000_0203 => ErrorCode::Canceled,
            0x0000_0204 => ErrorCode::Invalid,
            _ => ErrorCode::Reserved,
        }
    }

    /// Whether this code terminates the whole connection rather than one stream.
    pub fn is_connection_scoped(self) -> bool {
        matches!(
            self,
            ErrorCode::InvalidSetup
                | ErrorCode::UnsupportedSetup
                | ErrorCode::RejectedSetup
                | ErrorCode::ConnectionError
        )
    }
}

/// Encode a frame into a contiguous buffer, length prefix included.
///
/// The METADATA flag is derived from the presence of a metadata block; all
/// other flags are taken from the frame as-is.
pub fn encode_frame(frame: &Frame) -> Bytes {
    let mut flags = frame.flags;
    if frame.metadata.is_some() {
        flags |= flags::METADATA;
    }

    let length = frame_length(frame);
    let mut buf = BytesMut::with_capacity(length);

    buf.put_u32(length as u32);
    buf.put_u16(frame.frame_type() as u16);
    buf.put_u16(flags);
    buf.put_u32(frame.stream_id);

    match &frame.body {
        FrameBody::Setup {
            version,
            keepalive_ms,
            max_lifetime_ms,
            metadata_encoding,
            data_encoding,
        } => {
            buf.put_u32(*version);
            buf.put_u32(*keepalive_ms);
            buf.put_u32(*max_lifetime_ms);
            buf.put_u8(metadata_encoding.len() as u8);
            buf.put_slice(metadata_encoding.as_bytes());
            buf.put_u8(data_encoding.len() as u8);
            buf.put_slice(data_encoding.as_bytes());
        }
        FrameBody::Lease { ttl_ms, budget } => {
            buf.put_u32(*ttl_ms);
            buf.put_u32(*budget);
        }
        FrameBody::Error { code } => {
            buf.put_u32(*code as u32);
        }
        FrameBody::Keepalive
        | FrameBody::RequestResponse
        | FrameBody::Response
        | FrameBody::Cancel => {}
    }

    if let Some(metadata) = &frame.metadata {
        // Length field counts itself: payload bytes + 4.
        buf.put_u32(metadata.len() as u32 + 4);
        buf.put_slice(metadata);
    }
    if let Some(data) = &frame.data {
        buf.put_slice(data);
    }

    debug_assert_eq!(buf.len(), length);
    buf.freeze()
}

/// Total encoded length of a frame, length prefix included.
pub fn frame_length(frame: &Frame) -> usize {
    let fixed = match &frame.body {
        FrameBody::Setup {
            metadata_encoding,
            data_encoding,
            ..
        } => 12 + 1 + metadata_encoding.len() + 1 + data_encoding.len(),
        FrameBody::Lease { .. } => 8,
        FrameBody::Error { .. } => 4,
        _ => 0,
    };
    let metadata = frame.metadata.as_ref().map_or(0, |m| 4 + m.len());
    let data = frame.data.as_ref().map_or(0, |d| d.len());
    FRAME_HEADER_SIZE + fixed + metadata + data
}

/// Decode one complete frame (length prefix included) from a buffer.
///
/// The framer guarantees `buf` holds exactly one frame; this function
/// re-validates the header and rejects unknown or unimplemented types.
/// Failure here is connection-fatal.
pub fn decode_frame(buf: &[u8]) -> Result<Frame> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(RSocketError::Frame(format!(
            "Frame shorter than header: {} bytes",
            buf.len()
        )));
    }

    let length = read_u32(buf, 0) as usize;
    if length != buf.len() {
        return Err(RSocketError::Frame(format!(
            "Length field {} does not match buffer of {} bytes",
            length,
            buf.len()
        )));
    }

    let raw_type = read_u16(buf, 4);
    let frame_type = FrameType::from_u16(raw_type)
        .ok_or_else(|| RSocketError::Frame(format!("Unknown frame type 0x{raw_type:04X}")))?;
    if !frame_type.is_supported() {
        return Err(RSocketError::Frame(format!(
            "Unsupported frame type {frame_type:?}"
        )));
    }

    let wire_flags = read_u16(buf, 6);
    if wire_flags & flags::RESERVED_MASK != 0 {
        return Err(RSocketError::Frame(format!(
            "Reserved flag bits set: 0x{wire_flags:04X}"
        )));
    }
    let stream_id = read_u32(buf, 8);

    let mut offset = FRAME_HEADER_SIZE;
    let body = match frame_type {
        FrameType::Setup => {
            let version = read_u32_checked(buf, &mut offset)?;
            let keepalive_ms = read_u32_checked(buf, &mut offset)?;
            let max_lifetime_ms = read_u32_checked(buf, &mut offset)?;
            let metadata_encoding = read_name(buf, &mut offset)?;
            let data_encoding = read_name(buf, &mut offset)?;
            FrameBody::Setup {
                version,
                keepalive_ms,
                max_lifetime_ms,
                metadata_encoding,
                data_encoding,
            }
        }
        FrameType::Lease => {
            let ttl_ms = read_u32_checked(buf, &mut offset)?;
            let budget = read_u32_checked(buf, &mut offset)?;
            FrameBody::Lease { ttl_ms, budget }
        }
        FrameType::Error => {
            let code = ErrorCode::from_u32(read_u32_checked(buf, &mut offset)?);
            FrameBody::Error { code }
        }
        FrameType::Keepalive => FrameBody::Keepalive,
        FrameType::RequestResponse => FrameBody::RequestResponse,
        FrameType::Response => FrameBody::Response,
        FrameType::Cancel => FrameBody::Cancel,
        _ => unreachable!("unsupported types rejected above"),
    };

    let metadata = if flags::has_flag(wire_flags, flags::METADATA) {
        let md_len = read_u32_checked(buf, &mut offset)? as usize;
        if md_len < 4 {
            return Err(RSocketError::Frame(format!(
                "Metadata length {md_len} smaller than its own length field"
            )));
        }
        let body_len = md_len - 4;
        if offset + body_len > buf.len() {
            return Err(RSocketError::Frame("Metadata overruns frame".to_string()));
        }
        let metadata = Bytes::copy_from_slice(&buf[offset..offset + body_len]);
        offset += body_len;
        Some(metadata)
    } else {
        None
    };

    let data = if offset < buf.len() {
        Some(Bytes::copy_from_slice(&buf[offset..]))
    } else {
        None
    };

    Ok(Frame {
        stream_id,
        // METADATA is represented by the Option, never stored.
        flags: wire_flags & !flags::METADATA,
        body,
        metadata,
        data,
    })
}

#[inline]
fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn read_u32_checked(buf: &[u8], offset: &mut usize) -> Result<u32> {
    if *offset + 4 > buf.len() {
        return Err(RSocketError::Frame("Truncated frame body".to_string()));
    }
    let value = read_u32(buf, *offset);
    *offset += 4;
    Ok(value)
}

fn read_name(buf: &[u8], offset: &mut usize) -> Result<String> {
    if *offset >= buf.len() {
        return Err(RSocketError::Frame("Truncated encoding name".to_string()));
    }
    let len = buf[*offset] as usize;
    *offset += 1;
    if *offset + len > buf.len() {
        return Err(RSocketError::Frame("Truncated encoding name".to_string()));
    }
    let name = std::str::from_utf8(&buf[*offset..*offset + len])
        .map_err(|_| RSocketError::Frame("Encoding name is not ASCII".to_string()))?
        .to_string();
    *offset += len;
    Ok(name)
}
