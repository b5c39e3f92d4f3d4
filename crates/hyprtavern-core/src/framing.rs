//! Length-prefixed frame codec for tavern connections.
//!
//! Each frame is a 4-byte big-endian length followed by the payload:
//!
//! ```text
//! +----------------------+------------------+
//! | Length (4 bytes, BE) | Payload          |
//! +----------------------+------------------+
//! ```
//!
//! The length is validated against [`MAX_FRAME_SIZE`] before any allocation
//! happens, so a peer cannot make the daemon allocate from a forged prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{WireError, WireResult};

pub use crate::error::MAX_FRAME_SIZE;

/// Length of the frame header.
const HEADER_LEN: usize = 4;

/// Length-prefixed frame codec.
///
/// Usable with [`tokio_util::codec::Framed`] directly, and by
/// [`crate::connection::WireConnection`] which drives it by hand so that
/// ancillary descriptor data stays associated with the frame it rode in on.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a codec with the protocol-wide frame limit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a tighter frame limit.
    ///
    /// # Panics
    ///
    /// Panics if `max_size` exceeds [`MAX_FRAME_SIZE`].
    #[must_use]
    pub fn with_max_size(max_size: usize) -> Self {
        assert!(
            max_size <= MAX_FRAME_SIZE,
            "max_size {max_size} exceeds protocol limit {MAX_FRAME_SIZE}"
        );
        Self {
            max_frame_size: max_size,
        }
    }

    /// The frame limit this codec enforces.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> WireResult<Option<Bytes>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        // Validate before reserving anything.
        if length > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> WireResult<()> {
        if item.len() > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // validated above
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);

        Ok(())
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> WireResult<()> {
        self.encode(Bytes::copy_from_slice(item), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let mut codec = FrameCodec::new();
        let payload = Bytes::from_static(b"one ale please");

        let mut buf = BytesMut::new();
        codec.encode(payload.clone(), &mut buf).unwrap();

        assert_eq!(buf.len(), HEADER_LEN + payload.len());
        assert_eq!(&buf[..4], &[0, 0, 0, 14]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_header_waits() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn partial_payload_waits() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 10, 1, 2, 3][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn oversized_prefix_rejected_before_allocation() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(u32::try_from(MAX_FRAME_SIZE + 1).unwrap());
        buf.extend_from_slice(&[0u8; 16]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::FrameTooLarge { size, max })
                if size == MAX_FRAME_SIZE + 1 && max == MAX_FRAME_SIZE
        ));
    }

    #[test]
    fn oversized_payload_rejected_on_encode() {
        let mut codec = FrameCodec::with_max_size(64);
        let mut buf = BytesMut::new();

        assert!(matches!(
            codec.encode(Bytes::from(vec![0u8; 65]), &mut buf),
            Err(WireError::FrameTooLarge { size: 65, max: 64 })
        ));
    }

    #[test]
    fn empty_frame_is_valid() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::new(), &mut buf).unwrap();

        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn back_to_back_frames() {
        let mut codec = FrameCodec::new();
        let first = Bytes::from_static(b"first");
        let second = Bytes::from_static(b"second");

        let mut buf = BytesMut::new();
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(buf.is_empty());
    }
}
