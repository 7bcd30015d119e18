//! Transport contract and TCP binding.
//!
//! The core consumes any bidirectional byte channel implementing tokio's
//! `AsyncRead + AsyncWrite`. TCP is the default realization; tests use
//! `tokio::io::duplex` loopbacks. Message-oriented transports (for example
//! a WebSocket adapter) deliver whole frames per chunk and run with
//! [`FramingMode::Messages`], which bypasses the incremental framer.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::Result;

/// A bidirectional byte channel usable as a connection transport.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// How inbound bytes map to frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingMode {
    /// Byte stream; frames are delimited by their length prefix.
    #[default]
    Framed,
    /// Each read chunk is exactly one complete frame (message transports).
    Messages,
}

/// Open a TCP transport to `host:port` with Nagle disabled.
pub async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
