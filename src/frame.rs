use bytes::{Buf, BufMut};

use thiserror::Error;

use crate::settings::Settings;
use crate::varint::{VarInt, VarIntUnexpectedEnd};

/// Stream type prefix of a server push stream: a push stream starts with
/// this varint followed by the push id, then ordinary frames.
pub const PUSH_STREAM_TYPE: u64 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameKind(pub VarInt);

impl FrameKind {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntUnexpectedEnd> {
        Ok(FrameKind(VarInt::decode(buf)?))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf)
    }

    pub fn is_known(&self) -> bool {
        matches!(
            *self,
            FrameKind::DATA
                | FrameKind::HEADERS
                | FrameKind::PRIORITY
                | FrameKind::CANCEL_PUSH
                | FrameKind::SETTINGS
                | FrameKind::PUSH_PROMISE
                | FrameKind::GOAWAY
                | FrameKind::MAX_PUSH_ID
        )
    }
}

macro_rules! frames {
    {$($name:ident = $val:expr,)*} => {
        impl FrameKind {
            $(pub const $name: FrameKind = FrameKind(VarInt::from_u32($val));)*
        }
    }
}

frames! {
    DATA = 0x0,
    HEADERS = 0x1,
    PRIORITY = 0x2,
    CANCEL_PUSH = 0x3,
    SETTINGS = 0x4,
    PUSH_PROMISE = 0x5,
    GOAWAY = 0x7,
    MAX_PUSH_ID = 0xD,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("unknown frame type {0:?}")]
    UnknownType(FrameKind),

    #[error("frame payload does not match its declared length")]
    InvalidPayload,
}

impl From<VarIntUnexpectedEnd> for FrameError {
    fn from(_: VarIntUnexpectedEnd) -> Self {
        FrameError::UnexpectedEnd
    }
}

/// The generic frame header: a varint type followed by a varint payload
/// length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub header_len: usize,
    pub payload_len: usize,
}

impl FrameHeader {
    /// Decode a frame header from the front of `buf`. `None` means more
    /// bytes are needed before the header can be read.
    pub fn decode(buf: &[u8]) -> Option<FrameHeader> {
        let mut cur = buf;
        let kind = FrameKind::decode(&mut cur).ok()?;
        let len = VarInt::decode(&mut cur).ok()?;

        Some(FrameHeader {
            kind,
            header_len: buf.len() - cur.len(),
            payload_len: len.into_inner() as usize,
        })
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.kind.encode(buf);
        VarInt::try_from(self.payload_len)
            .expect("frame payload too large")
            .encode(buf);
    }

    /// Total frame size on the wire, header included.
    pub fn total_len(&self) -> usize {
        self.header_len + self.payload_len
    }
}

/// PRIORITY frame body.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub flags: u8,
    pub element_id: u64,
    pub dependency_id: u64,
    pub weight: u8,
}

/// A fully parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data { payload: Vec<u8> },
    Headers { block: Vec<u8> },
    Priority(Priority),
    CancelPush { push_id: u64 },
    Settings(Settings),
    PushPromise { push_id: u64, block: Vec<u8> },
    Goaway { last_stream_id: u64 },
    MaxPushId { push_id: u64 },
}

impl Frame {
    /// Parse a complete frame, header included. The whole frame must be
    /// present: reassembly guarantees that before dispatch.
    pub fn parse(buf: &[u8]) -> Result<Frame, FrameError> {
        let header = FrameHeader::decode(buf).ok_or(FrameError::UnexpectedEnd)?;
        if buf.len() != header.total_len() {
            return Err(FrameError::InvalidPayload);
        }
        let mut payload = &buf[header.header_len..];

        let frame = match header.kind {
            FrameKind::DATA => Frame::Data {
                payload: payload.to_vec(),
            },
            FrameKind::HEADERS => Frame::Headers {
                block: payload.to_vec(),
            },
            FrameKind::PRIORITY => {
                if payload.remaining() < 1 {
                    return Err(FrameError::UnexpectedEnd);
                }
                let flags = payload.get_u8();
                let element_id = VarInt::decode(&mut payload)?.into_inner();
                let dependency_id = VarInt::decode(&mut payload)?.into_inner();
                if payload.remaining() < 1 {
                    return Err(FrameError::UnexpectedEnd);
                }
                let weight = payload.get_u8();
                Frame::Priority(Priority {
                    flags,
                    element_id,
                    dependency_id,
                    weight,
                })
            }
            FrameKind::CANCEL_PUSH => Frame::CancelPush {
                push_id: VarInt::decode(&mut payload)?.into_inner(),
            },
            FrameKind::SETTINGS => {
                Frame::Settings(Settings::decode_payload(&mut payload)?)
            }
            FrameKind::PUSH_PROMISE => Frame::PushPromise {
                push_id: VarInt::decode(&mut payload)?.into_inner(),
                block: payload.to_vec(),
            },
            FrameKind::GOAWAY => Frame::Goaway {
                last_stream_id: VarInt::decode(&mut payload)?.into_inner(),
            },
            FrameKind::MAX_PUSH_ID => Frame::MaxPushId {
                push_id: VarInt::decode(&mut payload)?.into_inner(),
            },
            kind => return Err(FrameError::UnknownType(kind)),
        };

        Ok(frame)
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Data { .. } => FrameKind::DATA,
            Frame::Headers { .. } => FrameKind::HEADERS,
            Frame::Priority(_) => FrameKind::PRIORITY,
            Frame::CancelPush { .. } => FrameKind::CANCEL_PUSH,
            Frame::Settings(_) => FrameKind::SETTINGS,
            Frame::PushPromise { .. } => FrameKind::PUSH_PROMISE,
            Frame::Goaway { .. } => FrameKind::GOAWAY,
            Frame::MaxPushId { .. } => FrameKind::MAX_PUSH_ID,
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        // Encode the body first so the header carries an exact length.
        let mut body = Vec::new();
        match self {
            Frame::Data { payload } => body.extend_from_slice(payload),
            Frame::Headers { block } => body.extend_from_slice(block),
            Frame::Priority(p) => {
                body.put_u8(p.flags);
                VarInt::from_u64(p.element_id).unwrap().encode(&mut body);
                VarInt::from_u64(p.dependency_id).unwrap().encode(&mut body);
                body.put_u8(p.weight);
            }
            Frame::CancelPush { push_id } => {
                VarInt::from_u64(*push_id).unwrap().encode(&mut body)
            }
            Frame::Settings(settings) => settings.encode_payload(&mut body),
            Frame::PushPromise { push_id, block } => {
                VarInt::from_u64(*push_id).unwrap().encode(&mut body);
                body.extend_from_slice(block);
            }
            Frame::Goaway { last_stream_id } => {
                VarInt::from_u64(*last_stream_id).unwrap().encode(&mut body)
            }
            Frame::MaxPushId { push_id } => {
                VarInt::from_u64(*push_id).unwrap().encode(&mut body)
            }
        }

        FrameHeader {
            kind: self.kind(),
            header_len: 0, // recomputed by encode
            payload_len: body.len(),
        }
        .encode(buf);
        buf.put_slice(&body);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// The prefix a server writes at the start of each push stream: the push
/// stream type followed by the promise's push id.
pub fn push_stream_header(push_id: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    VarInt::from_u64(PUSH_STREAM_TYPE).unwrap().encode(&mut buf);
    VarInt::from_u64(push_id).unwrap().encode(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_bytes() {
        let frame = Frame::Data {
            payload: b"hello".to_vec(),
        };
        assert_eq!(frame.to_vec(), b"\x00\x05hello");
    }

    #[test]
    fn header_decode_needs_more() {
        assert_eq!(FrameHeader::decode(&[]), None);
        // 2-byte length varint cut short.
        assert_eq!(FrameHeader::decode(&[0x01, 0x41]), None);
    }

    #[test]
    fn header_decode_partial_payload() {
        // A header is decodable even when the payload has not arrived yet.
        let header = FrameHeader::decode(&[0x01, 0x14, 0xaa]).unwrap();
        assert_eq!(header.kind, FrameKind::HEADERS);
        assert_eq!(header.header_len, 2);
        assert_eq!(header.payload_len, 0x14);
    }

    #[test]
    fn parse_roundtrips() {
        let frames = vec![
            Frame::Data {
                payload: b"body bytes".to_vec(),
            },
            Frame::Headers {
                block: vec![0x00, 0x00, 0xc8],
            },
            Frame::Priority(Priority {
                flags: 0x80,
                element_id: 5,
                dependency_id: 0,
                weight: 16,
            }),
            Frame::CancelPush { push_id: 3 },
            Frame::Settings(Settings::default()),
            Frame::PushPromise {
                push_id: 77,
                block: vec![0x00, 0x00, 0xc8, 0xc9],
            },
            Frame::Goaway { last_stream_id: 4 },
            Frame::MaxPushId { push_id: 1024 },
        ];

        for frame in frames {
            let bytes = frame.to_vec();
            assert_eq!(Frame::parse(&bytes).unwrap(), frame, "frame {bytes:02x?}");
        }
    }

    #[test]
    fn unknown_type_rejected() {
        let bytes = [0x21, 0x00];
        assert_eq!(
            Frame::parse(&bytes),
            Err(FrameError::UnknownType(FrameKind(VarInt::from_u32(0x21)))),
        );
    }

    #[test]
    fn length_mismatch_rejected() {
        // DATA declaring 5 payload bytes but carrying 4.
        let bytes = [0x00, 0x05, b'a', b'b', b'c', b'd'];
        assert_eq!(Frame::parse(&bytes), Err(FrameError::InvalidPayload));
    }

    #[test]
    fn push_stream_prefix() {
        assert_eq!(push_stream_header(0), vec![0x01, 0x00]);
        assert_eq!(push_stream_header(64), vec![0x01, 0x40, 0x40]);
    }
}
