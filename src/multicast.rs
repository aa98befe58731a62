//! Handshake synthesis for the multicast profile.
//!
//! A multicast receiver never exchanges packets with the sender, and a
//! multicast sender never hears from its receivers. Each side instead
//! fabricates the packets a real peer would have produced, installs fixed
//! keys at every encryption level (the cipher is effectively disabled), and
//! acknowledges its own transmissions so the transport's loss detection
//! stays quiescent.

use bytes::BufMut;

use crate::session::Role;
use crate::transport::TransportParams;
use crate::varint::VarInt;

/// Fixed key material installed at the initial, handshake and application
/// levels. Identical for iv, hp and packet keys on both sides.
pub const QUIC_MCAST_MAGIC: [u8; 16] = *b"quic-mcast-magic";

/// Destination connection id on the well-known client initial.
pub const FAKE_CLIENT_INITIAL_DCID: [u8; 8] = [0x6d, 0x63, 0x61, 0x73, 0x74, 0x2d, 0x63, 0x31];

/// Source connection id the fabricated server uses from the handshake on.
pub const FAKE_SERVER_HANDSHAKE_SCID: [u8; 8] = [0x6d, 0x63, 0x61, 0x73, 0x74, 0x2d, 0x73, 0x31];

/// draft-22, the QUIC version this profile is pinned to.
pub const QUIC_VERSION: u32 = 0xff00_0016;

const FIRST_BYTE_INITIAL: u8 = 0xc0;
const FIRST_BYTE_HANDSHAKE: u8 = 0xe0;
const FRAME_CRYPTO: u8 = 0x06;
const FRAME_STREAM_WITH_LEN: u8 = 0x0a;

/// The smallest packet the header protection sampler will accept.
const MIN_ACK_PAYLOAD: usize = 16;

fn crypto_payload(params: &TransportParams) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&QUIC_MCAST_MAGIC);
    params.encode(&mut data);

    let mut payload = Vec::new();
    payload.put_u8(FRAME_CRYPTO);
    VarInt::from_u32(0).encode(&mut payload); // offset
    VarInt::try_from(data.len()).unwrap().encode(&mut payload);
    payload.extend_from_slice(&data);
    payload
}

fn long_header_packet(
    first_byte: u8,
    dcid: &[u8],
    scid: &[u8],
    token: bool,
    pkt_num: u32,
    payload: &[u8],
) -> Vec<u8> {
    let mut pkt = Vec::new();
    pkt.put_u8(first_byte | 0x03); // 4-byte packet number
    pkt.put_u32(QUIC_VERSION);
    pkt.put_u8(dcid.len() as u8);
    pkt.extend_from_slice(dcid);
    pkt.put_u8(scid.len() as u8);
    pkt.extend_from_slice(scid);
    if token {
        VarInt::from_u32(0).encode(&mut pkt); // empty token
    }
    VarInt::try_from(4 + payload.len()).unwrap().encode(&mut pkt);
    pkt.put_u32(pkt_num);
    pkt.extend_from_slice(payload);
    pkt
}

/// The well-known client initial a multicast server injects into its own
/// transport to begin the one-sided handshake.
pub fn fake_client_initial_packet(session_id: &[u8], pkt_num: u32, params: &TransportParams) -> Vec<u8> {
    long_header_packet(
        FIRST_BYTE_INITIAL,
        &FAKE_CLIENT_INITIAL_DCID,
        session_id,
        true,
        pkt_num,
        &crypto_payload(params),
    )
}

/// The server initial a multicast receiver fabricates in reply to its own
/// client initial.
pub fn fake_server_initial_packet(session_id: &[u8], pkt_num: u32, params: &TransportParams) -> Vec<u8> {
    long_header_packet(
        FIRST_BYTE_INITIAL,
        session_id,
        &FAKE_SERVER_HANDSHAKE_SCID,
        true,
        pkt_num,
        &crypto_payload(params),
    )
}

pub fn fake_server_handshake_packet(
    session_id: &[u8],
    pkt_num: u32,
    params: &TransportParams,
) -> Vec<u8> {
    long_header_packet(
        FIRST_BYTE_HANDSHAKE,
        session_id,
        &FAKE_SERVER_HANDSHAKE_SCID,
        false,
        pkt_num,
        &crypto_payload(params),
    )
}

/// A short-header packet carrying a zero-length frame on stream 0, fed to a
/// multicast server so it sees the client's request stream open.
pub fn fake_client_stream0_packet(pkt_num: u8) -> Vec<u8> {
    let mut pkt = Vec::new();
    pkt.put_u8(0x40); // short header, 1-byte packet number
    pkt.extend_from_slice(&FAKE_SERVER_HANDSHAKE_SCID);
    pkt.put_u8(pkt_num);

    pkt.put_u8(FRAME_STREAM_WITH_LEN);
    VarInt::from_u32(0).encode(&mut pkt); // stream 0
    VarInt::from_u32(2).encode(&mut pkt);
    pkt.extend_from_slice(&[0x0a, 0x00]);

    // Pad out to the header protection minimum.
    while pkt.len() < 1 + FAKE_SERVER_HANDSHAKE_SCID.len() + 1 + MIN_ACK_PAYLOAD {
        pkt.put_u8(0x00);
    }
    pkt
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortHeader {
    pub pkt_num: u64,
    pub pkt_num_len: usize,
}

/// Decode the header of an outgoing short-header packet far enough to learn
/// its packet number.
pub fn decode_short_header(pkt: &[u8], dcid_len: usize) -> Option<ShortHeader> {
    let first = *pkt.first()?;
    if first & 0x80 != 0 || first & 0x40 == 0 {
        return None;
    }

    let pkt_num_len = (first & 0x03) as usize + 1;
    let pkt_num_at = 1 + dcid_len;
    if pkt.len() < pkt_num_at + pkt_num_len {
        return None;
    }

    let mut pkt_num = 0u64;
    for &byte in &pkt[pkt_num_at..pkt_num_at + pkt_num_len] {
        pkt_num = (pkt_num << 8) | byte as u64;
    }

    Some(ShortHeader {
        pkt_num,
        pkt_num_len,
    })
}

/// Expand a truncated wire packet number to its full value: take the high
/// bits from the last full number seen and move up one window if the result
/// still went backwards.
pub fn reconstruct_pkt_num(last: u64, truncated: u64, pkt_num_len: usize) -> u64 {
    let mask = if pkt_num_len >= 8 {
        u64::MAX
    } else {
        (1u64 << (pkt_num_len * 8)) - 1
    };

    let mut num = truncated & mask;
    if num < last {
        num |= last & !mask;
        if num < last {
            num = num.wrapping_add(mask.wrapping_add(1));
        }
    }
    num
}

/// Build the ACK packet a multicast endpoint feeds back into its own
/// receive queue for every packet it emits.
pub fn fake_ack_packet(role: Role, session_id: &[u8], local_pkt_num: u8, largest: u64) -> Vec<u8> {
    let mut ack = Vec::new();
    ack.put_u8(0x02); // frame type: ACK
    VarInt::from_u64(largest).unwrap().encode(&mut ack);
    VarInt::from_u32(0).encode(&mut ack); // ack delay
    VarInt::from_u32(0).encode(&mut ack); // ack range count
    VarInt::from_u32(0).encode(&mut ack); // first ack range

    let mut pkt = Vec::new();
    pkt.put_u8(0x40);
    match role {
        Role::Server => pkt.extend_from_slice(&FAKE_SERVER_HANDSHAKE_SCID),
        Role::Client => pkt.extend_from_slice(session_id),
    }
    pkt.put_u8(local_pkt_num);
    pkt.extend_from_slice(&ack);

    // Trailing zeros are PADDING frames, bringing the payload up to the
    // header protection minimum.
    let payload_len = ack.len().max(MIN_ACK_PAYLOAD);
    pkt.resize(pkt.len() + payload_len - ack.len(), 0);
    pkt
}
