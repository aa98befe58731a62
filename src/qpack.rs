//! Header-compression glue. The session only ever calls [`Context::compress`]
//! and [`Context::decompress`]; the block format is a QPACK-style codec
//! restricted to the static table and string literals, so no encoder/decoder
//! stream state needs to be kept in sync with the peer.

use bytes::{Buf, BufMut};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompressionError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("prefix integer bounds exceeded")]
    BoundsExceeded,

    #[error("dynamic table references not supported")]
    DynamicEntry,

    #[error("unknown static table entry")]
    UnknownEntry,

    #[error("huffman-coded strings not supported")]
    Huffman,
}

/// One HTTP header field. Names and values are raw bytes; HTTP does not
/// require them to be UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Header {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is(&self, name: &str, value: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.as_bytes()) && self.value == value.as_bytes()
    }

    pub fn name_is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.as_bytes())
    }
}

/// Opaque per-session compression context.
///
/// Static-table-only QPACK carries no cross-block state, but every session
/// owns its own context so a stateful codec can be swapped in behind the
/// same two calls.
#[derive(Debug, Default)]
pub struct Context {}

impl Context {
    pub fn new() -> Self {
        Context {}
    }

    pub fn compress(&mut self, headers: &[Header]) -> Vec<u8> {
        let mut buf = Vec::new();

        // Required insert count and delta base; both zero without a dynamic
        // table.
        encode_prefix(&mut buf, 8, 0, 0);
        encode_prefix(&mut buf, 7, 0, 0);

        for header in headers {
            if let Some(index) = StaticTable::find(&header.name, &header.value) {
                // Indexed field line.
                encode_prefix(&mut buf, 6, 0b11, index);
            } else if let Some(index) = StaticTable::find_name(&header.name) {
                // Literal with static name reference.
                encode_prefix(&mut buf, 4, 0b0101, index);
                encode_prefix(&mut buf, 7, 0, header.value.len());
                buf.put_slice(&header.value);
            } else {
                // Literal name and value.
                encode_prefix(&mut buf, 3, 0b00100, header.name.len());
                buf.put_slice(&header.name);
                encode_prefix(&mut buf, 7, 0, header.value.len());
                buf.put_slice(&header.value);
            }
        }

        buf
    }

    pub fn decompress(&mut self, block: &[u8]) -> Result<Vec<Header>, CompressionError> {
        let mut buf = block;

        let _ = decode_prefix(&mut buf, 8)?;
        let _ = decode_prefix(&mut buf, 7)?;

        let mut headers = Vec::new();
        while buf.has_remaining() {
            let peek = buf.chunk()[0];

            let header = match peek & 0b1100_0000 {
                // Indexed field line, static table.
                0b1100_0000 => {
                    let (_, index) = decode_prefix(&mut buf, 6)?;
                    let (name, value) = StaticTable::get(index)?;
                    Header::new(name, value)
                }

                // Indexed field line, dynamic table.
                0b1000_0000 => return Err(CompressionError::DynamicEntry),

                _ => match peek & 0b1101_0000 {
                    // Literal with static name reference.
                    0b0101_0000 => {
                        let (_, index) = decode_prefix(&mut buf, 4)?;
                        let (name, _) = StaticTable::get(index)?;
                        let value = decode_string(&mut buf, 8)?;
                        Header::new(name, value)
                    }

                    // Literal with dynamic name reference.
                    0b0100_0000 => return Err(CompressionError::DynamicEntry),

                    _ if peek & 0b1110_0000 == 0b0010_0000 => {
                        // Literal name and value.
                        let name = decode_string(&mut buf, 4)?;
                        let value = decode_string(&mut buf, 8)?;
                        Header::new(name, value)
                    }

                    // Post-base forms all require the dynamic table.
                    _ => return Err(CompressionError::DynamicEntry),
                },
            };

            headers.push(header);
        }

        Ok(headers)
    }
}

#[cfg(target_pointer_width = "64")]
const MAX_POWER: usize = 10 * 7;

#[cfg(target_pointer_width = "32")]
const MAX_POWER: usize = 5 * 7;

/// Prefix integer of RFC 7541 section 5.1: `size` bits in the first byte,
/// continuation bytes of 7 bits each after that.
pub fn decode_prefix<B: Buf>(buf: &mut B, size: u8) -> Result<(u8, usize), CompressionError> {
    assert!(size > 0 && size <= 8);

    if !buf.has_remaining() {
        return Err(CompressionError::UnexpectedEnd);
    }

    let mut first = buf.get_u8();

    // The usize casts sidestep shift overflow when size == 8.
    let flags = ((first as usize) >> size) as u8;
    let mask = 0xFF >> (8 - size);
    first &= mask;

    if first < mask {
        return Ok((flags, first as usize));
    }

    let mut value = mask as usize;
    let mut power = 0usize;
    loop {
        if !buf.has_remaining() {
            return Err(CompressionError::UnexpectedEnd);
        }

        let byte = buf.get_u8() as usize;
        value += (byte & 127) << power;
        power += 7;

        if byte & 128 == 0 {
            break;
        }

        if power >= MAX_POWER {
            return Err(CompressionError::BoundsExceeded);
        }
    }

    Ok((flags, value))
}

pub fn encode_prefix<B: BufMut>(buf: &mut B, size: u8, flags: u8, value: usize) {
    assert!(size > 0 && size <= 8);

    let mask = (0xFFu32 >> (8 - size)) as usize;
    let flags = ((flags as usize) << size) as u8;

    if value < mask {
        buf.put_u8(flags | value as u8);
        return;
    }

    buf.put_u8(flags | mask as u8);
    let mut remaining = value - mask;

    while remaining >= 128 {
        buf.put_u8((remaining % 128) as u8 + 128);
        remaining /= 128;
    }

    buf.put_u8(remaining as u8);
}

fn decode_string<B: Buf>(buf: &mut B, size: u8) -> Result<Vec<u8>, CompressionError> {
    let (flags, len) = decode_prefix(buf, size - 1)?;

    // The compress side never emits huffman strings, so the decoder does not
    // carry the tables either.
    if flags & 1 != 0 {
        return Err(CompressionError::Huffman);
    }

    if buf.remaining() < len {
        return Err(CompressionError::UnexpectedEnd);
    }

    let mut value = vec![0u8; len];
    buf.copy_to_slice(&mut value);
    Ok(value)
}

// The slice of the QPACK static table this profile actually hits: request
// pseudo-headers, common statuses, and the handful of fields the multicast
// goaway exchange uses. Everything else goes out as a literal.
const STATIC_TABLE: &[(&str, &str)] = &[
    (":authority", ""),
    (":path", "/"),
    ("content-length", "0"),
    ("date", ""),
    ("last-modified", ""),
    ("location", ""),
    (":method", "CONNECT"),
    (":method", "DELETE"),
    (":method", "GET"),
    (":method", "HEAD"),
    (":method", "OPTIONS"),
    (":method", "POST"),
    (":method", "PUT"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "103"),
    (":status", "200"),
    (":status", "304"),
    (":status", "404"),
    (":status", "503"),
    ("accept", "*/*"),
    ("accept-encoding", "gzip, deflate, br"),
    ("accept-ranges", "bytes"),
    ("cache-control", "no-cache"),
    ("cache-control", "no-store"),
    ("content-type", "application/octet-stream"),
    ("content-type", "text/html; charset=utf-8"),
    ("content-type", "text/plain"),
    ("range", "bytes=0-"),
    ("trailer", ""),
    ("connection", "close"),
];

struct StaticTable {}

impl StaticTable {
    fn get(index: usize) -> Result<(&'static str, &'static str), CompressionError> {
        match STATIC_TABLE.get(index) {
            Some(entry) => Ok(*entry),
            None => Err(CompressionError::UnknownEntry),
        }
    }

    fn find(name: &[u8], value: &[u8]) -> Option<usize> {
        STATIC_TABLE
            .iter()
            .position(|(n, v)| n.as_bytes() == name && v.as_bytes() == value)
    }

    fn find_name(name: &[u8]) -> Option<usize> {
        STATIC_TABLE.iter().position(|(n, _)| n.as_bytes() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_mixed_forms() {
        let headers = vec![
            Header::new(":method", "GET"),              // indexed
            Header::new(":path", "/video/segment-4"),   // name reference
            Header::new("x-mcast-session", "7f3a"),     // literal
            Header::new("trailer", "x-checksum"),       // name reference
        ];

        let mut ctx = Context::new();
        let block = ctx.compress(&headers);
        let decoded = ctx.decompress(&block).unwrap();

        assert_eq!(headers, decoded);
    }

    #[test]
    fn order_and_duplicates_preserved() {
        let headers = vec![
            Header::new("set-cookie", "a=1"),
            Header::new("set-cookie", "b=2"),
        ];

        let mut ctx = Context::new();
        let block = ctx.compress(&headers);
        let decoded = ctx.decompress(&block).unwrap();
        assert_eq!(headers, decoded);
    }

    #[test]
    fn indexed_entry_is_one_byte() {
        let mut ctx = Context::new();
        let block = ctx.compress(&[Header::new(":method", "GET")]);

        // Two prefix bytes plus a single indexed field line.
        assert_eq!(block.len(), 3);
        assert_eq!(block[2] & 0b1100_0000, 0b1100_0000);
    }

    #[test]
    fn rejects_dynamic_references() {
        // Prefix bytes then an indexed field line with the static bit clear.
        let block = [0x00, 0x00, 0b1000_0001];
        let mut ctx = Context::new();
        assert_eq!(
            ctx.decompress(&block),
            Err(CompressionError::DynamicEntry),
        );
    }

    #[test]
    fn rejects_truncated_literal() {
        let mut ctx = Context::new();
        let mut block = ctx.compress(&[Header::new("x-long-name", "value")]);
        block.truncate(block.len() - 2);
        assert_eq!(
            ctx.decompress(&block),
            Err(CompressionError::UnexpectedEnd),
        );
    }

    #[test]
    fn prefix_integer_continuation() {
        let mut buf = Vec::new();
        encode_prefix(&mut buf, 5, 0b101, 1337);
        let (flags, value) = decode_prefix(&mut buf.as_slice(), 5).unwrap();
        assert_eq!(flags, 0b101);
        assert_eq!(value, 1337);
    }
}
