use bytes::{Buf, BufMut};

use thiserror::Error;

/// An integer less than 2^62, as used by the QUIC wire encoding.
///
/// The encoded size depends on the value: the top two bits of the first byte
/// select a 1, 2, 4 or 8 byte encoding.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInt(u64);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unexpected end of input")]
pub struct VarIntUnexpectedEnd;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("value too large for varint encoding")]
pub struct VarIntBoundsExceeded;

impl VarInt {
    pub const MAX: VarInt = VarInt((1u64 << 62) - 1);

    pub const fn from_u32(value: u32) -> Self {
        VarInt(value as u64)
    }

    pub fn from_u64(value: u64) -> Result<Self, VarIntBoundsExceeded> {
        if value > Self::MAX.0 {
            return Err(VarIntBoundsExceeded);
        }

        Ok(VarInt(value))
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// The number of bytes the value occupies on the wire.
    pub const fn size(self) -> usize {
        let x = self.0;
        if x < (1 << 6) {
            1
        } else if x < (1 << 14) {
            2
        } else if x < (1 << 30) {
            4
        } else {
            8
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntUnexpectedEnd> {
        if !buf.has_remaining() {
            return Err(VarIntUnexpectedEnd);
        }

        // 0b00 = 1, 0b01 = 2, 0b10 = 4, 0b11 = 8
        let size = 1usize << (buf.chunk()[0] >> 6);
        if buf.remaining() < size {
            return Err(VarIntUnexpectedEnd);
        }

        let mut bytes = [0u8; 8];
        buf.copy_to_slice(&mut bytes[..size]);
        bytes[0] &= 0x3f;

        let mut value = 0u64;
        for byte in &bytes[..size] {
            value = (value << 8) | *byte as u64;
        }

        Ok(VarInt(value))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let x = self.0;
        if x < (1 << 6) {
            buf.put_u8(x as u8);
        } else if x < (1 << 14) {
            buf.put_u16(0b01 << 14 | x as u16);
        } else if x < (1 << 30) {
            buf.put_u32(0b10 << 30 | x as u32);
        } else {
            buf.put_u64(0b11 << 62 | x);
        }
    }
}

impl From<VarInt> for u64 {
    fn from(v: VarInt) -> u64 {
        v.0
    }
}

impl From<u32> for VarInt {
    fn from(v: u32) -> VarInt {
        VarInt(v as u64)
    }
}

impl TryFrom<u64> for VarInt {
    type Error = VarIntBoundsExceeded;

    fn try_from(v: u64) -> Result<VarInt, VarIntBoundsExceeded> {
        VarInt::from_u64(v)
    }
}

impl TryFrom<usize> for VarInt {
    type Error = VarIntBoundsExceeded;

    fn try_from(v: usize) -> Result<VarInt, VarIntBoundsExceeded> {
        VarInt::from_u64(v as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        VarInt::from_u64(value).unwrap().encode(&mut buf);

        let mut read = buf.as_slice();
        let decoded = VarInt::decode(&mut read).unwrap();
        assert_eq!(decoded.into_inner(), value);
        assert_eq!(read.len(), 0);

        buf
    }

    #[test]
    fn encoding_widths() {
        assert_eq!(roundtrip(0).len(), 1);
        assert_eq!(roundtrip(63).len(), 1);
        assert_eq!(roundtrip(64).len(), 2);
        assert_eq!(roundtrip(16383).len(), 2);
        assert_eq!(roundtrip(16384).len(), 4);
        assert_eq!(roundtrip(1_073_741_823).len(), 4);
        assert_eq!(roundtrip(1_073_741_824).len(), 8);
        assert_eq!(roundtrip(VarInt::MAX.into_inner()).len(), 8);
    }

    #[test]
    fn known_encodings() {
        // Examples from RFC 9000 appendix A.1.
        assert_eq!(roundtrip(151_288_809_941_952_652), b"\xc2\x19\x7c\x5e\xff\x14\xe8\x8c");
        assert_eq!(roundtrip(494_878_333), b"\x9d\x7f\x3e\x7d");
        assert_eq!(roundtrip(15_293), b"\x7b\xbd");
        assert_eq!(roundtrip(37), b"\x25");
    }

    #[test]
    fn need_more() {
        let mut buf: &[u8] = &[];
        assert_eq!(VarInt::decode(&mut buf), Err(VarIntUnexpectedEnd));

        // A 4-byte encoding truncated after 2 bytes.
        let mut buf: &[u8] = &[0x9d, 0x7f];
        assert_eq!(VarInt::decode(&mut buf), Err(VarIntUnexpectedEnd));
    }

    #[test]
    fn bounds() {
        assert!(VarInt::from_u64(1 << 62).is_err());
        assert_eq!(VarInt::from_u64((1 << 62) - 1).unwrap(), VarInt::MAX);
    }
}
