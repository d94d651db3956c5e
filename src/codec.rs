//! `tokio_util` codec for STOMP frames.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::StompError;
use crate::frame::{encode_frame_into, try_decode_frame, DecodedFrame, DEFAULT_MAX_FRAME_SIZE};
use crate::types::Frame;

/// Frame codec for use with `Framed`, `FramedRead` and `FramedWrite`.
///
/// Decoding yields [`DecodedFrame`] items: malformed frames come through as
/// `Err(FrameError)` values and the stream keeps going. The stream itself
/// only fails on I/O errors, truncation at end of stream, or an oversized
/// frame.
#[derive(Debug, Clone)]
pub struct StompFrameCodec {
    max_frame_size: usize,
}

impl StompFrameCodec {
    /// Creates a codec that fails on frames larger than `max_frame_size` bytes.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for StompFrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for StompFrameCodec {
    type Item = DecodedFrame;
    type Error = StompError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        try_decode_frame(src, self.max_frame_size)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                src.clear();
                Err(StompError::FrameTruncated)
            }
        }
    }
}

impl Encoder<Frame> for StompFrameCodec {
    type Error = StompError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame_into(&frame, dst)?;
        Ok(())
    }
}
