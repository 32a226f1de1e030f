//! The 24-byte binary frame header and its `tokio_util` codec (§4.4).
//!
//! Layout, all integers big-endian:
//! `magic(1) opcode(1) key-len(2) extras-len(1) datatype(1) vbucket-or-status(2)
//! total-body-len(4) opaque(4) cas(8)`, followed by a body of
//! `extras | key | value` whose component lengths are declared in the header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CoreError;
use crate::protocol::opcode::Opcode;
use crate::protocol::status::Status;

pub const HEADER_LEN: usize = 24;

const MAGIC_REQUEST: u8 = 0x80;
const MAGIC_RESPONSE: u8 = 0x81;

/// Protects against a corrupt or hostile length field demanding an unbounded
/// allocation; no legitimate document or subdoc payload in this protocol approaches it.
const MAX_BODY_LEN: u32 = 20 * 1024 * 1024;

/// Which half of a request/response pair this frame represents. The vbucket-or-status
/// field means something different depending on direction, so frames carry their
/// direction explicitly rather than requiring callers to track it out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Request,
    Response,
}

/// A single request or response frame (`OperationFrame` in the data model).
///
/// `vbucket_or_status` holds the partition id the client stamped a request with, or
/// the 2-byte status a server responded with; which it is follows from `magic`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub magic: Magic,
    pub opcode: Opcode,
    pub datatype: u8,
    pub vbucket_or_status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Frame {
    pub fn request(opcode: Opcode, partition: u16, opaque: u32, cas: u64) -> Self {
        Frame {
            magic: Magic::Request,
            opcode,
            datatype: 0,
            vbucket_or_status: partition,
            opaque,
            cas,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn partition(&self) -> Option<u16> {
        matches!(self.magic, Magic::Request).then_some(self.vbucket_or_status)
    }

    pub fn status(&self) -> Option<Status> {
        matches!(self.magic, Magic::Response).then(|| Status::from_u16(self.vbucket_or_status))
    }

    fn total_body_len(&self) -> usize {
        self.extras.len() + self.key.len() + self.value.len()
    }
}

/// Stateless `tokio_util::codec::{Encoder,Decoder}` over `Frame`, used both by the
/// pooled and multiplexed `IoService` implementations and by `ConnectionPool`'s
/// handshake helpers.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = CoreError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total_body_len = item.total_body_len();
        if total_body_len > MAX_BODY_LEN as usize {
            return Err(CoreError::Serialization(format!(
                "body of {total_body_len} bytes exceeds the {MAX_BODY_LEN} byte limit"
            )));
        }
        if item.key.len() > u16::MAX as usize || item.extras.len() > u8::MAX as usize {
            return Err(CoreError::Serialization(
                "key or extras length exceeds protocol limits".into(),
            ));
        }

        dst.reserve(HEADER_LEN + total_body_len);
        dst.put_u8(match item.magic {
            Magic::Request => MAGIC_REQUEST,
            Magic::Response => MAGIC_RESPONSE,
        });
        dst.put_u8(item.opcode.to_byte());
        dst.put_u16(item.key.len() as u16);
        dst.put_u8(item.extras.len() as u8);
        dst.put_u8(item.datatype);
        dst.put_u16(item.vbucket_or_status);
        dst.put_u32(total_body_len as u32);
        dst.put_u32(item.opaque);
        dst.put_u64(item.cas);
        dst.extend_from_slice(&item.extras);
        dst.extend_from_slice(&item.key);
        dst.extend_from_slice(&item.value);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CoreError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let magic_byte = src[0];
        let magic = match magic_byte {
            MAGIC_REQUEST => Magic::Request,
            MAGIC_RESPONSE => Magic::Response,
            other => {
                return Err(CoreError::Serialization(format!(
                    "unrecognized frame magic byte 0x{other:02x}"
                )));
            }
        };
        let opcode_byte = src[1];
        let opcode = Opcode::from_byte(opcode_byte).ok_or_else(|| {
            CoreError::Serialization(format!("unrecognized opcode byte 0x{opcode_byte:02x}"))
        })?;
        let key_len = u16::from_be_bytes([src[2], src[3]]) as usize;
        let extras_len = src[4] as usize;
        let datatype = src[5];
        let vbucket_or_status = u16::from_be_bytes([src[6], src[7]]);
        let total_body_len = u32::from_be_bytes([src[8], src[9], src[10], src[11]]);
        if total_body_len > MAX_BODY_LEN {
            return Err(CoreError::Serialization(format!(
                "declared body length {total_body_len} exceeds the {MAX_BODY_LEN} byte limit"
            )));
        }
        let opaque = u32::from_be_bytes([src[12], src[13], src[14], src[15]]);
        let cas = u64::from_be_bytes(src[16..24].try_into().unwrap());

        if key_len + extras_len > total_body_len as usize {
            return Err(CoreError::Serialization(
                "key + extras length exceeds total body length".into(),
            ));
        }

        let frame_len = HEADER_LEN + total_body_len as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let mut body = src.split_to(total_body_len as usize).freeze();
        let extras = body.split_to(extras_len);
        let key = body.split_to(key_len);
        let value = body;

        Ok(Some(Frame {
            magic,
            opcode,
            datatype,
            vbucket_or_status,
            opaque,
            cas,
            extras,
            key,
            value,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame {
                magic: Magic::Request,
                opcode: Opcode::Get,
                datatype: 0,
                vbucket_or_status: 42,
                opaque: 7,
                cas: 0,
                extras: Bytes::new(),
                key: Bytes::from_static(b"user:123"),
                value: Bytes::new(),
            },
            Frame {
                magic: Magic::Response,
                opcode: Opcode::Set,
                datatype: 1,
                vbucket_or_status: Status::Success.to_u16(),
                opaque: 99,
                cas: 0xdead_beef_0000_0001,
                extras: Bytes::from_static(&[0, 0, 0, 0]),
                key: Bytes::new(),
                value: Bytes::from_static(b"{}"),
            },
            Frame {
                magic: Magic::Response,
                opcode: Opcode::Get,
                datatype: 0,
                vbucket_or_status: Status::NotMyVBucket.to_u16(),
                opaque: 1,
                cas: 0,
                extras: Bytes::new(),
                key: Bytes::new(),
                value: Bytes::from_static(b"{\"rev\":12}"),
            },
        ]
    }

    #[test]
    fn round_trip_law_holds_for_every_sample_frame() {
        for frame in sample_frames() {
            let mut buf = BytesMut::new();
            FrameCodec.encode(frame.clone(), &mut buf).unwrap();
            let decoded = FrameCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, frame);
            assert!(buf.is_empty(), "decoder must consume the whole frame");
        }
    }

    #[test]
    fn decode_returns_none_on_partial_header() {
        let mut buf = BytesMut::from(&[0x80, 0x00, 0x00][..]);
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_returns_none_until_full_body_arrives() {
        let mut buf = BytesMut::new();
        FrameCodec
            .encode(
                Frame {
                    magic: Magic::Request,
                    opcode: Opcode::Set,
                    datatype: 0,
                    vbucket_or_status: 0,
                    opaque: 1,
                    cas: 0,
                    extras: Bytes::new(),
                    key: Bytes::new(),
                    value: Bytes::from_static(b"0123456789"),
                },
                &mut buf,
            )
            .unwrap();
        let mut truncated = buf.split_to(HEADER_LEN + 3);
        assert!(FrameCodec.decode(&mut truncated).unwrap().is_none());
        truncated.unsplit(buf);
        assert!(FrameCodec.decode(&mut truncated).unwrap().is_some());
    }

    #[test]
    fn rejects_unrecognized_magic_byte() {
        let mut buf = BytesMut::from(&[0x00u8; HEADER_LEN][..]);
        assert!(FrameCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn not_my_vbucket_status_carries_topology_body() {
        let frame = &sample_frames()[2];
        assert_eq!(frame.status(), Some(Status::NotMyVBucket));
        assert_eq!(&frame.value[..], b"{\"rev\":12}");
    }
}
