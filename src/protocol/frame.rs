//! Frame struct with typed bodies and accessors.
//!
//! Represents a complete protocol frame. Payload blocks use `bytes::Bytes`
//! for zero-copy sharing between the codec, the connection, and callers.
//!
//! # Example
//!
//! ```
//! use rsocket_client::protocol::{flags, Frame, FrameType, Payload};
//!
//! let frame = Frame::request_response(2, flags::NONE, Payload::from_str(None, Some("hello")));
//! assert_eq!(frame.frame_type(), FrameType::RequestResponse);
//! assert_eq!(frame.data.as_deref(), Some(&b"hello"[..]));
//! ```

use bytes::Bytes;

use super::wire_format::{flags, ErrorCode, FrameType, VERSION};

/// A request or response payload: optional metadata plus optional data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// Metadata block, encoded per the negotiated metadata encoding.
    pub metadata: Option<Bytes>,
    /// Data block, encoded per the negotiated data encoding.
    pub data: Option<Bytes>,
}

impl Payload {
    /// Create a payload from raw blocks.
    pub fn new(metadata: Option<Bytes>, data: Option<Bytes>) -> Self {
        Self { metadata, data }
    }

    /// Create an empty payload (no metadata, no data).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a payload from UTF-8 strings.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(metadata: Option<&str>, data: Option<&str>) -> Self {
        Self {
            metadata: metadata.map(|m| Bytes::copy_from_slice(m.as_bytes())),
            data: data.map(|d| Bytes::copy_from_slice(d.as_bytes())),
        }
    }

    /// Whether both blocks are absent.
    pub fn is_empty(&self) -> bool {
        self.metadata.is_none() && self.data.is_none()
    }
}

/// Kind-specific frame fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Setup {
        version: u32,
        keepalive_ms: u32,
        max_lifetime_ms: u32,
        metadata_encoding: String,
        data_encoding: String,
    },
    Lease {
        ttl_ms: u32,
        budget: u32,
    },
    Error {
        code: ErrorCode,
    },
    Keepalive,
    RequestResponse,
    Response,
    Cancel,
}

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream this frame belongs to (0 = connection stream).
    pub stream_id: u32,
    /// Caller-supplied flags (FOLLOWS, LEASE, STRICT, KEEPALIVE_RESPONSE).
    /// METADATA is derived from `metadata` at encode time and never stored.
    pub flags: u16,
    /// Kind-specific fields.
    pub body: FrameBody,
    /// Optional metadata block.
    pub metadata: Option<Bytes>,
    /// Optional data block.
    pub data: Option<Bytes>,
}

impl Frame {
    /// Build a SETUP frame for the connection stream.
    pub fn setup(
        keepalive_ms: u32,
        max_lifetime_ms: u32,
        metadata_encoding: &str,
        data_encoding: &str,
        setup_flags: u16,
        payload: Payload,
    ) -> Self {
        Self {
            stream_id: 0,
            flags: setup_flags,
            body: FrameBody::Setup {
                version: VERSION,
                keepalive_ms,
                max_lifetime_ms,
                metadata_encoding: metadata_encoding.to_string(),
                data_encoding: data_encoding.to_string(),
            },
            metadata: payload.metadata,
            data: payload.data,
        }
    }

    /// Build a LEASE frame for the connection stream.
    pub fn lease(ttl_ms: u32, budget: u32, metadata: Option<Bytes>) -> Self {
        Self {
            stream_id: 0,
            flags: flags::NONE,
            body: FrameBody::Lease { ttl_ms, budget },
            metadata,
            data: None,
        }
    }

    /// Build a KEEPALIVE frame, optionally echoing data.
    pub fn keepalive(keepalive_flags: u16, data: Option<Bytes>) -> Self {
        Self {
            stream_id: 0,
            flags: keepalive_flags,
            body: FrameBody::Keepalive,
            metadata: None,
            data,
        }
    }

    /// Build a REQUEST_RESPONSE frame.
    pub fn request_response(stream_id: u32, request_flags: u16, payload: Payload) -> Self {
        Self {
            stream_id,
            flags: request_flags,
            body: FrameBody::RequestResponse,
            metadata: payload.metadata,
            data: payload.data,
        }
    }

    /// Build a RESPONSE frame.
    pub fn response(stream_id: u32, response_flags: u16, payload: Payload) -> Self {
        Self {
            stream_id,
            flags: response_flags,
            body: FrameBody::Response,
            metadata: payload.metadata,
            data: payload.data,
        }
    }

    /// Build an ERROR frame; the message travels in the data block.
    pub fn error(stream_id: u32, code: ErrorCode, message: &str) -> Self {
        Self {
            stream_id,
            flags: flags::NONE,
            body: FrameBody::Error { code },
            metadata: None,
            data: if message.is_empty() {
                None
            } else {
                Some(Bytes::copy_from_slice(message.as_bytes()))
            },
        }
    }

    /// Build a CANCEL frame.
    pub fn cancel(stream_id: u32) -> Self {
        Self {
            stream_id,
            flags: flags::NONE,
            body: FrameBody::Cancel,
            metadata: None,
            data: None,
        }
    }

    /// The wire type of this frame.
    #[inline]
    pub fn frame_type(&self) -> FrameType {
        match self.body {
            FrameBody::Setup { .. } => FrameType::Setup,
            FrameBody::Lease { .. } => FrameType::Lease,
            FrameBody::Error { .. } => FrameType::Error,
            FrameBody::Keepalive => FrameType::Keepalive,
            FrameBody::RequestResponse => FrameType::RequestResponse,
            FrameBody::Response => FrameType::Response,
            FrameBody::Cancel => FrameType::Cancel,
        }
    }

    /// Check if more fragments of this payload follow.
    #[inline]
    pub fn has_follows(&self) -> bool {
        flags::has_flag(self.flags, flags::FOLLOWS)
    }

    /// Check if the receiver must mirror this keepalive back.
    #[inline]
    pub fn wants_keepalive_response(&self) -> bool {
        flags::has_flag(self.flags, flags::KEEPALIVE_RESPONSE)
    }

    /// Take the metadata/data blocks as a [`Payload`].
    pub fn payload(&self) -> Payload {
        Payload {
            metadata: self.metadata.clone(),
            data: self.data.clone(),
        }
    }

    /// The error message of an ERROR frame (empty when the frame carried none).
    pub fn error_message(&self) -> String {
        self.data
            .as_ref()
            .map(|d| String::from_utf8_lossy(d).into_owned())
            .unwrap_or_default()
    }
}
