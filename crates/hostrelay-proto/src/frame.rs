//! Frame structure and serialization

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::ProtocolError;

/// Size of the per-frame header following the length prefix (channel ID + flags)
pub const FRAME_HEADER_LEN: usize = 5;

/// Channel reserved for the handshake and session control messages
pub const CONTROL_CHANNEL: u32 = 0;

/// Frame flag bits; a frame may combine several
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    /// Plain data frame
    pub const NONE: Self = Self(0);
    /// Opens a channel; payload describes the channel
    pub const OPEN: Self = Self(1);
    /// End of stream flag
    pub const END_STREAM: Self = Self(2);
    /// Error flag; payload is a UTF-8 reason
    pub const ERROR: Self = Self(4);
    /// Flow control credit grant; payload is a big-endian u32 delta
    pub const WINDOW_UPDATE: Self = Self(8);

    const DEFINED_BITS: u8 = 0x0F;

    /// Check if a flag is set
    pub fn has_flag(self, flag: FrameFlags) -> bool {
        (self.0 & flag.0) != 0
    }

    /// True when no bit outside the four defined flags is set
    pub fn is_defined(self) -> bool {
        self.0 & !Self::DEFINED_BITS == 0
    }
}

/// One unit on the wire: a payload addressed to a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Channel identifier
    pub channel_id: u32,
    /// Frame flags
    pub flags: FrameFlags,
    /// Frame payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(channel_id: u32, flags: FrameFlags, payload: Bytes) -> Self {
        Self {
            channel_id,
            flags,
            payload,
        }
    }

    /// Create a data frame
    pub fn data(channel_id: u32, payload: Bytes) -> Self {
        Self::new(channel_id, FrameFlags::NONE, payload)
    }

    /// Create a channel-open frame
    pub fn open(channel_id: u32, payload: Bytes) -> Self {
        Self::new(channel_id, FrameFlags::OPEN, payload)
    }

    /// Create an end-of-stream frame
    pub fn end_stream(channel_id: u32) -> Self {
        Self::new(channel_id, FrameFlags::END_STREAM, Bytes::new())
    }

    /// Create an error frame
    pub fn error(channel_id: u32, reason: &str) -> Self {
        Self::new(channel_id, FrameFlags::ERROR, Bytes::copy_from_slice(reason.as_bytes()))
    }

    /// Create a window update granting `delta` more bytes of credit
    pub fn window_update(channel_id: u32, delta: u32) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(delta);
        Self::new(channel_id, FrameFlags::WINDOW_UPDATE, buf.freeze())
    }

    /// Encoded size of this frame without the length prefix
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    /// Write the header and payload (no length prefix) into `buf`
    pub fn encode_body(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32(self.channel_id);
        buf.put_u8(self.flags.0);
        buf.put_slice(&self.payload);
    }

    /// Parse a frame body produced by [`Frame::encode_body`]
    pub fn decode_body(mut body: Bytes) -> Result<Self, ProtocolError> {
        if body.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::InvalidFrame);
        }

        let channel_id = body.get_u32();
        let flags = FrameFlags(body.get_u8());
        Ok(Self::new(channel_id, flags, body))
    }

    /// Check if this is a channel-open frame
    pub fn is_open(&self) -> bool {
        self.flags.has_flag(FrameFlags::OPEN)
    }

    /// Check if this is an end-of-stream frame
    pub fn is_end_stream(&self) -> bool {
        self.flags.has_flag(FrameFlags::END_STREAM)
    }

    /// Check if this is an error frame
    pub fn is_error(&self) -> bool {
        self.flags.has_flag(FrameFlags::ERROR)
    }

    /// Credit delta carried by a window update, if this is one
    pub fn window_delta(&self) -> Option<u32> {
        if !self.flags.has_flag(FrameFlags::WINDOW_UPDATE) || self.payload.len() != 4 {
            return None;
        }
        Some((&self.payload[..]).get_u32())
    }

    /// Error reason carried by an error frame
    pub fn error_reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_constructors_set_one_flag() {
        let open = Frame::open(1, Bytes::from_static(b"kind"));
        assert!(open.is_open() && !open.is_end_stream() && !open.is_error());

        let data = Frame::data(1, Bytes::from("payload"));
        assert_eq!(data.flags, FrameFlags::NONE);
        assert!(!data.is_open() && !data.is_end_stream() && !data.is_error());

        let end = Frame::end_stream(1);
        assert!(end.is_end_stream() && end.payload.is_empty());
    }

    #[test]
    fn test_error_frame_reason() {
        let frame = Frame::error(7, "host terminated");
        assert!(frame.is_error());
        assert_eq!(frame.error_reason(), "host terminated");
    }

    #[test]
    fn test_window_update_delta() {
        let frame = Frame::window_update(3, 65536);
        assert_eq!(frame.window_delta(), Some(65536));
        assert_eq!(Frame::data(3, Bytes::from_static(b"abcd")).window_delta(), None);
    }

    #[test]
    fn test_defined_flag_bits() {
        assert!(FrameFlags(0x0F).is_defined());
        assert!(FrameFlags::NONE.is_defined());
        assert!(!FrameFlags(0x10).is_defined());
        assert!(!FrameFlags(0x81).is_defined());
    }

    #[test]
    fn test_body_layout() {
        let frame = Frame::open(0x01020304, Bytes::from_static(b"xy"));
        let mut buf = BytesMut::new();
        frame.encode_body(&mut buf);

        assert_eq!(&buf[..], &[1, 2, 3, 4, 1, b'x', b'y']);
        assert_eq!(buf.len(), frame.encoded_len());
    }

    #[test]
    fn test_truncated_body_rejected() {
        let result = Frame::decode_body(Bytes::from_static(&[0, 0, 1]));
        assert!(matches!(result, Err(ProtocolError::InvalidFrame)));
    }

    proptest! {
        #[test]
        fn prop_window_delta_only_on_window_updates(
            channel_id in 1u32..,
            flags in any::<u8>(),
            payload in prop::collection::vec(any::<u8>(), 0..8)
        ) {
            let frame = Frame::new(channel_id, FrameFlags(flags), Bytes::from(payload.clone()));
            let expected = (flags & FrameFlags::WINDOW_UPDATE.0 != 0 && payload.len() == 4)
                .then(|| u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]));
            prop_assert_eq!(frame.window_delta(), expected);
        }
    }
}
