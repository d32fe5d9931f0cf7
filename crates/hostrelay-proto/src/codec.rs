//! Frame codec for async streams
//!
//! Wire layout: a big-endian `u32` length, then the frame body (`u32`
//! channel id, `u8` flags, payload). The length counts the body only.

use crate::{Frame, ProtocolError};
use crate::frame::FRAME_HEADER_LEN;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bytes taken by the length prefix
const LENGTH_PREFIX_LEN: usize = 4;

/// Initial capacity of the read buffer
const INITIAL_READ_CAPACITY: usize = 8 * 1024;

/// Reads and writes length-prefixed frames
///
/// `read_frame` keeps partial input in an internal buffer, so a read
/// cancelled by `select!` loses nothing.
#[derive(Debug)]
pub struct FrameCodec {
    pending: BytesMut,
    limit: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec enforcing [`MAX_FRAME_SIZE`]
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Codec enforcing a custom body size limit
    pub fn with_max_frame_size(limit: usize) -> Self {
        Self {
            pending: BytesMut::with_capacity(INITIAL_READ_CAPACITY),
            limit,
        }
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.limit {
            return Err(ProtocolError::FrameTooLarge { size, max: self.limit });
        }
        Ok(())
    }

    /// Serialize `frame` including its length prefix
    pub fn encode_frame(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        let body_len = frame.encoded_len();
        self.check_size(body_len)?;

        let mut out = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body_len);
        out.put_u32(body_len as u32);
        frame.encode_body(&mut out);
        Ok(out.freeze())
    }

    /// Write one frame and flush
    pub async fn write_frame<W>(&self, writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let wire = self.encode_frame(frame)?;
        writer.write_all(&wire).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next frame
    ///
    /// `Ok(None)` means the peer closed the stream cleanly between frames;
    /// EOF inside a frame is [`ProtocolError::InvalidFrame`].
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Frame>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        while self.pending_frame_len()?.is_none_or_incomplete(self.pending.len()) {
            if reader.read_buf(&mut self.pending).await? == 0 {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::InvalidFrame);
            }
        }
        self.try_decode_frame()
    }

    /// Body length announced by the buffered prefix, once four bytes are in
    fn pending_frame_len(&self) -> Result<Pending, ProtocolError> {
        if self.pending.len() < LENGTH_PREFIX_LEN {
            return Ok(Pending::NeedPrefix);
        }
        let body_len = (&self.pending[..LENGTH_PREFIX_LEN]).get_u32() as usize;
        self.check_size(body_len)?;
        if body_len < FRAME_HEADER_LEN {
            return Err(ProtocolError::InvalidFrame);
        }
        Ok(Pending::Body(body_len))
    }

    /// Decode one frame from already buffered input, if complete
    pub fn try_decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let body_len = match self.pending_frame_len()? {
            Pending::NeedPrefix => return Ok(None),
            Pending::Body(len) => len,
        };

        let total = LENGTH_PREFIX_LEN + body_len;
        if self.pending.len() < total {
            self.pending.reserve(total - self.pending.len());
            return Ok(None);
        }

        self.pending.advance(LENGTH_PREFIX_LEN);
        let body = self.pending.split_to(body_len).freeze();
        Frame::decode_body(body).map(Some)
    }

    /// Bytes received but not yet decoded
    pub fn buffer_size(&self) -> usize {
        self.pending.len()
    }
}

/// Progress of the frame at the head of the read buffer
enum Pending {
    NeedPrefix,
    Body(usize),
}

impl Pending {
    fn is_none_or_incomplete(&self, buffered: usize) -> bool {
        match self {
            Self::NeedPrefix => true,
            Self::Body(len) => buffered < LENGTH_PREFIX_LEN + len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CONTROL_CHANNEL;
    use proptest::prelude::*;
    use std::io::Cursor;

    async fn decode_all(wire: Vec<u8>) -> Vec<Frame> {
        let mut codec = FrameCodec::new();
        let mut cursor = Cursor::new(wire);
        let mut frames = Vec::new();
        while let Some(frame) = codec.read_frame(&mut cursor).await.unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_wire_layout() {
        let wire = FrameCodec::new().encode_frame(&Frame::data(7, Bytes::from("hi"))).unwrap();

        // length (5 + 2), channel 7, no flags, payload
        assert_eq!(&wire[..], &[0, 0, 0, 7, 0, 0, 0, 7, 0, b'h', b'i']);
    }

    #[tokio::test]
    async fn test_session_frames_survive_the_wire() {
        let codec = FrameCodec::new();
        let sent = vec![
            Frame::data(CONTROL_CHANNEL, Bytes::from_static(b"\x81\xa5token")),
            Frame::open(1, Bytes::from_static(b"open")),
            Frame::window_update(1, 4096),
            Frame::error(1, "unsupported channel kind: x"),
            Frame::end_stream(3),
        ];

        let mut wire = Vec::new();
        for frame in &sent {
            codec.write_frame(&mut wire, frame).await.unwrap();
        }

        let received = decode_all(wire).await;
        assert_eq!(received, sent);
        assert_eq!(received[2].window_delta(), Some(4096));
        assert_eq!(received[3].error_reason(), "unsupported channel kind: x");
    }

    #[test]
    fn test_partial_input_waits() {
        let wire = FrameCodec::new().encode_frame(&Frame::data(1, Bytes::from("abcd"))).unwrap();
        let mut codec = FrameCodec::new();

        codec.pending.extend_from_slice(&wire[..3]);
        assert!(codec.try_decode_frame().unwrap().is_none());
        codec.pending.extend_from_slice(&wire[3..wire.len() - 1]);
        assert!(codec.try_decode_frame().unwrap().is_none());
        codec.pending.extend_from_slice(&wire[wire.len() - 1..]);

        let frame = codec.try_decode_frame().unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"abcd");
        assert_eq!(codec.buffer_size(), 0);
    }

    #[test]
    fn test_oversized_outbound_frame() {
        let codec = FrameCodec::with_max_frame_size(100);
        let result = codec.encode_frame(&Frame::data(1, Bytes::from(vec![0u8; 200])));
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { size: 205, max: 100 })));
    }

    #[tokio::test]
    async fn test_oversized_length_prefix() {
        let mut wire = BytesMut::new();
        wire.put_u32(1_000);
        wire.put_slice(&[0u8; 16]);

        let mut codec = FrameCodec::with_max_frame_size(100);
        let result = codec.read_frame(&mut Cursor::new(wire.freeze())).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { size: 1_000, max: 100 })));
    }

    #[tokio::test]
    async fn test_length_shorter_than_header() {
        let mut wire = BytesMut::new();
        wire.put_u32(2);
        wire.put_slice(&[0xFF, 0xFF]);

        let result = FrameCodec::new().read_frame(&mut Cursor::new(wire.freeze())).await;
        assert!(matches!(result, Err(ProtocolError::InvalidFrame)));
    }

    #[tokio::test]
    async fn test_eof_inside_frame() {
        let wire = FrameCodec::new().encode_frame(&Frame::data(9, Bytes::from("abcdef"))).unwrap();
        let truncated = wire[..wire.len() - 2].to_vec();

        let result = FrameCodec::new().read_frame(&mut Cursor::new(truncated)).await;
        assert!(matches!(result, Err(ProtocolError::InvalidFrame)));
    }

    #[tokio::test]
    async fn test_clean_eof() {
        assert!(decode_all(Vec::new()).await.is_empty());
    }

    proptest! {
        #[test]
        fn prop_any_chunking_yields_the_same_frames(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..8),
            chunk in 1usize..64
        ) {
            let codec = FrameCodec::new();
            let mut wire = Vec::new();
            for (i, payload) in payloads.iter().enumerate() {
                let frame = Frame::data(i as u32 + 1, Bytes::from(payload.clone()));
                wire.extend_from_slice(&codec.encode_frame(&frame)?);
            }

            let decoded = tokio_test::block_on(async {
                let (mut tx, mut rx) = tokio::io::duplex(chunk);
                let writer = tokio::spawn(async move {
                    tokio::io::AsyncWriteExt::write_all(&mut tx, &wire).await.unwrap();
                });
                let mut decoder = FrameCodec::new();
                let mut frames = Vec::new();
                while let Some(frame) = decoder.read_frame(&mut rx).await.unwrap() {
                    frames.push(frame);
                }
                writer.await.unwrap();
                frames
            });

            prop_assert_eq!(decoded.len(), payloads.len());
            for (i, frame) in decoded.iter().enumerate() {
                prop_assert_eq!(frame.channel_id, i as u32 + 1);
                prop_assert_eq!(&frame.payload[..], &payloads[i][..]);
            }
        }
    }
}
