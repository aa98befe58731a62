//! A sans-IO session engine for the multicast-capable profile of HTTP/3
//! (draft-pardue-quic-http-mcast) layered on an external QUIC transport.
//!
//! The engine owns the HTTP-layer framing, the per-stream state machines,
//! the request and server-push lifecycle, and a receive-side reassembler
//! that tolerates out-of-order and overlapping stream bytes. In multicast
//! mode it synthesises the missing half of the QUIC handshake locally so a
//! single sender can feed many receivers over a one-way bearer.
//!
//! Everything runs on the caller's thread: the host pushes packets in with
//! [`Session::recv`], pulls packets out with [`Session::send`], and gets
//! HTTP events back through its [`SessionEvents`] implementation.

pub mod alpn;
mod buffer;
mod error;
mod frame;
mod multicast;
pub mod qpack;
mod reassembly;
mod session;
mod session_id;
mod settings;
mod stream;
mod timer;
mod transport;
mod varint;

pub use error::*;
pub use frame::*;
pub use multicast::{
    decode_short_header, fake_ack_packet, reconstruct_pkt_num, ShortHeader,
    FAKE_CLIENT_INITIAL_DCID, FAKE_SERVER_HANDSHAKE_SCID, QUIC_MCAST_MAGIC,
};
pub use qpack::{CompressionError, Header};
pub use session::*;
pub use session_id::*;
pub use settings::*;
pub use stream::{RequestId, StreamState};
pub use timer::{TimerArm, TimerHandle, TimerHost, TimerKind};
pub use transport::*;
pub use varint::*;
