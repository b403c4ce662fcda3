//! Tokio codec adapter for the engine's fixed-header frame format.
//!
//! Implements [`Decoder`]/[`Encoder`] so a connection can be driven through
//! [`tokio_util::codec::Framed`], the same pairing the teacher uses for its
//! own fixed-header protocol in `wireframe/codec.rs`. Unlike the Hotline
//! protocol, frames here are never fragmented: `size` is the complete
//! payload length for the message.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Frame, HEADER_LEN, MessageKind};
use crate::{
    error::FrameError,
    ids::{ClientThreadId, RequestId},
};

/// Default ceiling on a single frame's payload size. Guards against a
/// corrupt or hostile peer making the codec allocate without bound.
pub const DEFAULT_MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

/// Codec translating the wire byte stream to and from [`Frame`] values.
#[derive(Debug)]
pub struct FrameCodec {
    max_payload: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl FrameCodec {
    /// Create a codec using the default maximum payload size.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Create a codec that rejects any frame whose declared payload exceeds
    /// `max_payload` bytes.
    #[must_use]
    pub const fn with_max_payload(max_payload: u32) -> Self { Self { max_payload } }

    #[expect(clippy::indexing_slicing, reason = "length is checked before indexing")]
    fn peek_header(src: &BytesMut) -> Option<RawHeader> {
        if src.len() < HEADER_LEN {
            return None;
        }
        let kind_byte = src[0];
        let client_thread_id = u64::from_be_bytes([
            src[1], src[2], src[3], src[4], src[5], src[6], src[7], src[8],
        ]);
        let request_id = u32::from_be_bytes([src[9], src[10], src[11], src[12]]);
        let size = u32::from_be_bytes([src[13], src[14], src[15], src[16]]);
        Some(RawHeader {
            kind_byte,
            client_thread_id: ClientThreadId(client_thread_id),
            request_id: RequestId(request_id),
            size,
        })
    }
}

struct RawHeader {
    kind_byte: u8,
    client_thread_id: ClientThreadId,
    request_id: RequestId,
    size: u32,
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let Some(header) = Self::peek_header(src) else {
            if !src.is_empty() {
                src.reserve(HEADER_LEN - src.len());
            }
            return Ok(None);
        };
        let Some(kind) = MessageKind::from_wire_byte(header.kind_byte) else {
            return Err(FrameError::UnknownKind(header.kind_byte));
        };
        if header.size > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: header.size,
                max: self.max_payload,
            });
        }

        let frame_len = HEADER_LEN + header.size as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(header.size as usize).to_vec();
        Ok(Some(Frame::new(
            kind,
            header.client_thread_id,
            header.request_id,
            payload,
        )))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let size = u32::try_from(frame.payload.len()).map_err(|_| FrameError::PayloadTooLarge {
            size: u32::MAX,
            max: self.max_payload,
        })?;
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u8(frame.kind.wire_byte());
        dst.put_u64(frame.client_thread_id.0);
        dst.put_u32(frame.request_id.0);
        dst.put_u32(size);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn header_bytes(kind: u8, client_thread_id: u64, request_id: u32, size: u32) -> Vec<u8> {
        let mut buf = vec![kind];
        buf.extend_from_slice(&client_thread_id.to_be_bytes());
        buf.extend_from_slice(&request_id.to_be_bytes());
        buf.extend_from_slice(&size.to_be_bytes());
        buf
    }

    #[test]
    fn decodes_a_complete_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&header_bytes(b'M', 42, 7, 3)[..]);
        buf.extend_from_slice(b"abc");

        let frame = codec.decode(&mut buf).unwrap().expect("frame present");
        assert_eq!(frame.kind, MessageKind::MethodCall);
        assert_eq!(frame.client_thread_id, ClientThreadId(42));
        assert_eq!(frame.request_id, RequestId(7));
        assert_eq!(frame.payload, b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_more_bytes_on_short_header() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"M"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn waits_for_more_bytes_on_short_payload() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&header_bytes(b'M', 1, 1, 5)[..]);
        buf.extend_from_slice(b"ab");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_unknown_kind_byte() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&header_bytes(0x00, 1, 1, 0)[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::UnknownKind(0x00)));
    }

    #[test]
    fn rejects_oversized_payload() {
        let mut codec = FrameCodec::with_max_payload(4);
        let mut buf = BytesMut::from(&header_bytes(b'M', 1, 1, 5)[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 5, max: 4 }));
    }

    #[rstest]
    #[case(MessageKind::Exception, ClientThreadId(0), RequestId(0), vec![])]
    #[case(MessageKind::MethodCall, ClientThreadId(u64::MAX), RequestId(9), vec![1, 2, 3, 4])]
    fn encode_then_decode_round_trips(
        #[case] kind: MessageKind,
        #[case] client_thread_id: ClientThreadId,
        #[case] request_id: RequestId,
        #[case] payload: Vec<u8>,
    ) {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(kind, client_thread_id, request_id, payload.clone());
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().expect("frame present");
        assert_eq!(decoded.kind, kind);
        assert_eq!(decoded.client_thread_id, client_thread_id);
        assert_eq!(decoded.request_id, request_id);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn two_frames_back_to_back_both_decode() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::new(MessageKind::Lock, ClientThreadId(1), RequestId(1), b"A".to_vec()),
                &mut buf,
            )
            .unwrap();
        codec
            .encode(
                Frame::new(MessageKind::Unlock, ClientThreadId(1), RequestId(2), b"A".to_vec()),
                &mut buf,
            )
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().expect("first frame");
        assert_eq!(first.kind, MessageKind::Lock);
        let second = codec.decode(&mut buf).unwrap().expect("second frame");
        assert_eq!(second.kind, MessageKind::Unlock);
        assert!(buf.is_empty());
    }
}
