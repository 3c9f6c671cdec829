//! Frame codec.
//!
//! Every unit on the wire is framed as (protocol section 2.3.5):
//! - A 1-byte frame type (method, header, body, heartbeat)
//! - A 2-byte big-endian channel id for multiplexing
//! - A 4-byte big-endian payload size
//! - The payload
//! - A 1-byte frame end octet (0xCE) for stream synchronization
//!
//! No partial reads, no buffer management in user code: `decode_frame`
//! consumes complete frames and leaves trailing partial bytes in place.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::content::ContentHeader;
use crate::error::{ProtoError, Result};
use crate::method::Method;

pub const FRAME_METHOD: u8 = 1;
pub const FRAME_HEADER: u8 = 2;
pub const FRAME_BODY: u8 = 3;
pub const FRAME_HEARTBEAT: u8 = 8;
pub const FRAME_END: u8 = 0xCE;

/// Frame metadata: type (1) + channel (2) + size (4) + end octet (1).
pub const FRAME_OVERHEAD: usize = 8;

/// Smallest frame-max value a peer may negotiate.
pub const FRAME_MIN_SIZE: u32 = 4096;

/// Protocol preamble sent by the client before any frame.
pub const PROTOCOL_HEADER: [u8; 8] = *b"AMQP\x00\x00\x09\x01";

/// A decoded frame, tagged with the sub-channel it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub channel_id: u16,
    pub payload: FramePayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    Method(Method),
    Header(ContentHeader),
    Body(Bytes),
    Heartbeat,
}

impl Frame {
    pub fn method(channel_id: u16, method: Method) -> Self {
        Self {
            channel_id,
            payload: FramePayload::Method(method),
        }
    }

    /// Serialize this frame into the wire format.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let mut payload = BytesMut::new();
        let frame_type = match &self.payload {
            FramePayload::Method(method) => {
                method.encode(&mut payload)?;
                FRAME_METHOD
            }
            FramePayload::Header(header) => {
                header.encode(&mut payload)?;
                FRAME_HEADER
            }
            FramePayload::Body(body) => {
                payload.put_slice(body);
                FRAME_BODY
            }
            FramePayload::Heartbeat => FRAME_HEARTBEAT,
        };

        dst.reserve(FRAME_OVERHEAD + payload.len());
        dst.put_u8(frame_type);
        dst.put_u16(self.channel_id);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        dst.put_u8(FRAME_END);
        Ok(())
    }
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_frame: usize) -> Result<Option<Frame>> {
    if src.len() < FRAME_OVERHEAD - 1 {
        return Ok(None); // Need more data
    }

    let frame_type = src[0];
    let channel_id = u16::from_be_bytes([src[1], src[2]]);
    let payload_len = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;

    if payload_len + FRAME_OVERHEAD > max_frame {
        return Err(ProtoError::FrameTooLarge {
            size: payload_len + FRAME_OVERHEAD,
            max: max_frame,
        });
    }

    let total = FRAME_OVERHEAD + payload_len;
    if src.len() < total {
        return Ok(None); // Need more data
    }

    src.advance(FRAME_OVERHEAD - 1);
    let payload = src.split_to(payload_len).freeze();
    let end = src.split_to(1)[0];
    if end != FRAME_END {
        return Err(ProtoError::BadFrameEnd(end));
    }

    let payload = match frame_type {
        FRAME_METHOD => FramePayload::Method(Method::decode(payload)?),
        FRAME_HEADER => FramePayload::Header(ContentHeader::decode(payload)?),
        FRAME_BODY => FramePayload::Body(payload),
        FRAME_HEARTBEAT => FramePayload::Heartbeat,
        other => return Err(ProtoError::UnknownFrameType(other)),
    };

    Ok(Some(Frame {
        channel_id,
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Method;

    const MAX: usize = FRAME_MIN_SIZE as usize;

    #[test]
    fn method_frame_roundtrip() {
        let frame = Frame::method(
            7,
            Method::QueueDeclare {
                queue: "q1".into(),
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                no_wait: false,
            },
        );

        let mut wire = BytesMut::new();
        frame.encode(&mut wire).unwrap();

        let decoded = decode_frame(&mut wire, MAX).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(wire.is_empty());
    }

    #[test]
    fn body_frame_roundtrip() {
        let frame = Frame {
            channel_id: 1,
            payload: FramePayload::Body(Bytes::from_static(b"hello")),
        };

        let mut wire = BytesMut::new();
        frame.encode(&mut wire).unwrap();

        let decoded = decode_frame(&mut wire, MAX).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn heartbeat_roundtrip() {
        let frame = Frame {
            channel_id: 0,
            payload: FramePayload::Heartbeat,
        };

        let mut wire = BytesMut::new();
        frame.encode(&mut wire).unwrap();

        let decoded = decode_frame(&mut wire, MAX).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn incomplete_header_needs_more_data() {
        let mut wire = BytesMut::from(&[FRAME_METHOD, 0x00, 0x01][..]);
        assert!(decode_frame(&mut wire, MAX).unwrap().is_none());
        assert_eq!(wire.len(), 3);
    }

    #[test]
    fn incomplete_payload_needs_more_data() {
        let frame = Frame {
            channel_id: 2,
            payload: FramePayload::Body(Bytes::from_static(b"partial")),
        };
        let mut wire = BytesMut::new();
        frame.encode(&mut wire).unwrap();
        wire.truncate(wire.len() - 3);

        assert!(decode_frame(&mut wire, MAX).unwrap().is_none());
    }

    #[test]
    fn bad_frame_end_rejected() {
        let frame = Frame {
            channel_id: 0,
            payload: FramePayload::Heartbeat,
        };
        let mut wire = BytesMut::new();
        frame.encode(&mut wire).unwrap();
        let last = wire.len() - 1;
        wire[last] = 0x00;

        let err = decode_frame(&mut wire, MAX).unwrap_err();
        assert!(matches!(err, ProtoError::BadFrameEnd(0x00)));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut wire = BytesMut::new();
        wire.put_u8(FRAME_BODY);
        wire.put_u16(1);
        wire.put_u32(FRAME_MIN_SIZE * 2);

        let err = decode_frame(&mut wire, MAX).unwrap_err();
        assert!(matches!(err, ProtoError::FrameTooLarge { .. }));
    }

    #[test]
    fn unknown_frame_type_rejected() {
        let mut wire = BytesMut::new();
        wire.put_u8(9);
        wire.put_u16(0);
        wire.put_u32(0);
        wire.put_u8(FRAME_END);

        let err = decode_frame(&mut wire, MAX).unwrap_err();
        assert!(matches!(err, ProtoError::UnknownFrameType(9)));
    }

    #[test]
    fn multiple_frames_decode_in_order() {
        let mut wire = BytesMut::new();
        Frame {
            channel_id: 1,
            payload: FramePayload::Body(Bytes::from_static(b"first")),
        }
        .encode(&mut wire)
        .unwrap();
        Frame {
            channel_id: 2,
            payload: FramePayload::Body(Bytes::from_static(b"second")),
        }
        .encode(&mut wire)
        .unwrap();

        let f1 = decode_frame(&mut wire, MAX).unwrap().unwrap();
        let f2 = decode_frame(&mut wire, MAX).unwrap().unwrap();
        assert_eq!(f1.channel_id, 1);
        assert_eq!(f2.channel_id, 2);
        assert!(wire.is_empty());
    }
}
