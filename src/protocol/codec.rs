//! Length-delimited JSON framing
//!
//! Every frame on the wire is a 4-byte big-endian length followed by the JSON
//! encoding of a [`Frame`]. The codec plugs into `tokio_util::codec::Framed` so
//! any `AsyncRead + AsyncWrite` stream can act as a transport.

use bytes::{Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

use super::frame::Frame;
use super::topic::TopicError;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024;

/// A byte stream carrying frames
pub type Transport<T> = Framed<T, FrameCodec>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("Invalid topic: {0}")]
    Topic(#[from] TopicError),

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Timed out waiting for peer")]
    Timeout,
}

#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_size)
                .new_codec(),
            max_frame_size,
        }
    }

    /// Wraps a byte stream into a frame transport
    pub fn framed<T>(io: T, max_frame_size: usize) -> Transport<T>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite,
    {
        Framed::new(io, Self::new(max_frame_size))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let bytes = match self.inner.decode(src) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            // LengthDelimitedCodec reports oversized frames as InvalidData
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(ProtocolError::FrameTooLarge {
                    size: declared_length(src),
                    max: self.max_frame_size,
                })
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

/// Length announced by the prefix at the head of `src`
fn declared_length(src: &[u8]) -> usize {
    match src {
        [a, b, c, d, ..] => u32::from_be_bytes([*a, *b, *c, *d]) as usize,
        _ => 0,
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let encoded = serde_json::to_vec(&frame)?;
        if encoded.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: encoded.len(),
                max: self.max_frame_size,
            });
        }
        self.inner.encode(Bytes::from(encoded), dst)?;
        Ok(())
    }
}
