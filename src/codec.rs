//! Frame codecs for TCP streams.
//!
//! A codec splits the inbound byte stream into the frames handed to
//! `react`, and wraps outbound payloads before they hit the socket. The
//! default [`Passthrough`] does neither: whatever is readable is one frame.

use bytes::BytesMut;

use crate::connection::Conn;
use crate::errors::Result;

/// Stream framing, applied symmetrically to both directions.
pub trait Codec: Send + Sync + 'static {
    /// Wrap one outbound payload into its wire form.
    fn encode(&self, conn: &Conn, buf: Vec<u8>) -> Result<Vec<u8>>;

    /// Split one frame off the front of `inbound`, or return `None` when
    /// the buffered bytes do not yet form a complete frame.
    fn decode(&self, inbound: &mut BytesMut) -> Result<Option<BytesMut>>;
}

/// No framing: every readable chunk is a frame, payloads go out verbatim.
#[derive(Debug, Default)]
pub struct Passthrough;

impl Codec for Passthrough {
    fn encode(&self, _conn: &Conn, buf: Vec<u8>) -> Result<Vec<u8>> {
        Ok(buf)
    }

    fn decode(&self, inbound: &mut BytesMut) -> Result<Option<BytesMut>> {
        if inbound.is_empty() {
            return Ok(None);
        }
        Ok(Some(inbound.split()))
    }
}

/// Newline-delimited frames. The delimiter is stripped on decode and
/// appended on encode; a trailing `\r` before the newline is dropped too.
#[derive(Debug, Default)]
pub struct LineBasedFrameCodec;

impl Codec for LineBasedFrameCodec {
    fn encode(&self, _conn: &Conn, mut buf: Vec<u8>) -> Result<Vec<u8>> {
        buf.push(b'\n');
        Ok(buf)
    }

    fn decode(&self, inbound: &mut BytesMut) -> Result<Option<BytesMut>> {
        let Some(pos) = inbound.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let mut frame = inbound.split_to(pos + 1);
        frame.truncate(pos);
        if frame.last() == Some(&b'\r') {
            frame.truncate(frame.len() - 1);
        }
        Ok(Some(frame))
    }
}

/// Frames prefixed with a big-endian `u32` payload length.
#[derive(Debug, Default)]
pub struct LengthFieldFrameCodec;

impl Codec for LengthFieldFrameCodec {
    fn encode(&self, _conn: &Conn, buf: Vec<u8>) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(4 + buf.len());
        out.extend_from_slice(&(buf.len() as u32).to_be_bytes());
        out.extend_from_slice(&buf);
        Ok(out)
    }

    fn decode(&self, inbound: &mut BytesMut) -> Result<Option<BytesMut>> {
        if inbound.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([inbound[0], inbound[1], inbound[2], inbound[3]]) as usize;
        if inbound.len() < 4 + len {
            return Ok(None);
        }
        let mut frame = inbound.split_to(4 + len);
        let _ = frame.split_to(4);
        Ok(Some(frame))
    }
}
