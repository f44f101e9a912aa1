//! Codec for carrying datagrams over a byte stream
//!
//! Format: [length: u16 big-endian][payload: length bytes], repeated.
//! One frame carries exactly one datagram; a zero-length frame is an empty datagram.

use crate::{FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::trace;

/// Codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Payload too large: {0} bytes (max 65535)")]
    PayloadTooLarge(usize),
}

/// Encode a single datagram payload as a length-prefixed frame.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, CodecError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.extend_from_slice(payload);

    Ok(buf.freeze())
}

#[derive(Debug)]
enum DecodeState {
    /// Waiting for the length header; `filled` bytes of it arrived so far
    Header { buf: [u8; FRAME_HEADER_SIZE], filled: usize },
    /// Inside a frame body
    Payload { remaining: usize },
}

/// Stream decode cursor
///
/// Turns arbitrarily split byte chunks back into the datagrams that were
/// framed with [`encode_frame`]. One decoder belongs to exactly one stream;
/// it is never reset, only dropped with the connection.
///
/// Only the frame currently in progress is buffered. A length header that is
/// split across two chunks is held until its second byte arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    payload: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header {
                buf: [0u8; FRAME_HEADER_SIZE],
                filled: 0,
            },
            payload: BytesMut::new(),
        }
    }

    /// Bytes still expected before the next header (0 while reading a header)
    pub fn bytes_remaining(&self) -> usize {
        match self.state {
            DecodeState::Header { .. } => 0,
            DecodeState::Payload { remaining } => remaining,
        }
    }

    /// True when the decoder sits exactly on a frame boundary
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::Header { filled: 0, .. })
    }

    /// Consume one chunk and return every payload it completes, in order.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let mut frames = Vec::new();
        let mut read_index = 0;

        while read_index < chunk.len() {
            match &mut self.state {
                DecodeState::Header { buf, filled } => {
                    let take = (FRAME_HEADER_SIZE - *filled).min(chunk.len() - read_index);
                    buf[*filled..*filled + take]
                        .copy_from_slice(&chunk[read_index..read_index + take]);
                    *filled += take;
                    read_index += take;

                    if *filled < FRAME_HEADER_SIZE {
                        trace!("Partial frame header buffered ({} byte)", filled);
                        break;
                    }

                    let length = u16::from_be_bytes(*buf) as usize;
                    if length == 0 {
                        frames.push(Bytes::new());
                        *filled = 0;
                    } else {
                        self.payload.reserve(length);
                        self.state = DecodeState::Payload { remaining: length };
                    }
                }
                DecodeState::Payload { remaining } => {
                    let take = (*remaining).min(chunk.len() - read_index);
                    self.payload
                        .extend_from_slice(&chunk[read_index..read_index + take]);
                    *remaining -= take;
                    read_index += take;

                    if *remaining == 0 {
                        frames.push(self.payload.split().freeze());
                        self.state = DecodeState::Header {
                            buf: [0u8; FRAME_HEADER_SIZE],
                            filled: 0,
                        };
                    }
                }
            }
        }

        frames
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
