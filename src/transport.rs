use bytes::{Buf, BufMut};

use thiserror::Error;

use crate::varint::{VarInt, VarIntUnexpectedEnd};

/// Timestamp sentinel meaning "no expiry armed".
pub const TIMESTAMP_NEVER: u64 = u64::MAX;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The stream is flow-control blocked; retry later.
    #[error("stream data blocked")]
    StreamBlocked,

    /// The stream has been shut down for writing.
    #[error("stream shut for writing")]
    StreamShutWrite,

    #[error("stream not found")]
    StreamNotFound,

    #[error("packet decryption failed")]
    Decrypt,

    #[error("protocol violation")]
    Proto,

    #[error("invalid connection state")]
    InvalidState,

    #[error("packet number space exhausted")]
    PktNumExhausted,

    #[error("transport failure: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Recoverable errors make the send loop yield rather than fail.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::StreamBlocked
                | TransportError::StreamShutWrite
                | TransportError::StreamNotFound
        )
    }
}

/// What a processed packet did to the connection, surfaced to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    StreamOpened {
        stream_id: u64,
    },
    StreamData {
        stream_id: u64,
        offset: u64,
        data: Vec<u8>,
        fin: bool,
    },
    StreamClosed {
        stream_id: u64,
        app_error_code: u64,
    },
    HandshakeCompleted,
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoLevel {
    Initial,
    Handshake,
    Application,
}

/// Result of packetising stream data: the packet produced and how much of
/// the supplied stream data it consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamWrite {
    pub pkt_len: usize,
    pub consumed: usize,
}

/// The QUIC connection this engine drives.
///
/// The transport is a black box: congestion control, crypto and loss
/// detection live behind it. The engine only moves packets and stream bytes
/// across this boundary and reads the two expiry timestamps back out.
///
/// The `install_*_key`, `submit_crypto_data`, `complete_handshake`,
/// `accept_initial` and `set_aead_overhead` hooks exist for the multicast
/// profile, where the session fabricates a handshake locally instead of
/// performing one with a live peer.
pub trait Transport {
    /// Process one incoming packet, returning what it did to the connection.
    fn read_pkt(&mut self, pkt: &[u8], now: u64) -> Result<Vec<TransportEvent>, TransportError>;

    /// Write a standalone packet (usually an ACK) into `buf`. Returns the
    /// packet length, 0 when there is nothing to send.
    fn write_pkt(&mut self, buf: &mut [u8], now: u64) -> Result<usize, TransportError>;

    /// Packetise stream data into `buf`.
    fn write_stream(
        &mut self,
        buf: &mut [u8],
        stream_id: u64,
        fin: bool,
        data: &[u8],
        now: u64,
    ) -> Result<StreamWrite, TransportError>;

    fn open_bidi_stream(&mut self) -> Result<u64, TransportError>;

    fn open_uni_stream(&mut self) -> Result<u64, TransportError>;

    fn shutdown_stream(&mut self, stream_id: u64, app_error_code: u64)
        -> Result<(), TransportError>;

    fn bytes_in_flight(&self) -> usize;

    /// When the loss detection timer fires, or [`TIMESTAMP_NEVER`].
    fn loss_detection_expiry(&self) -> u64;

    /// When a delayed ACK must go out, or [`TIMESTAMP_NEVER`].
    fn ack_delay_expiry(&self) -> u64;

    fn on_loss_detection_timer(&mut self, now: u64) -> Result<(), TransportError>;

    fn is_handshake_completed(&self) -> bool;

    fn is_draining(&self) -> bool;

    fn local_transport_params(&self) -> TransportParams;

    fn set_remote_transport_params(
        &mut self,
        params: &TransportParams,
    ) -> Result<(), TransportError>;

    /// Write a CONNECTION_CLOSE packet into `buf`.
    fn write_connection_close(
        &mut self,
        buf: &mut [u8],
        error_code: u64,
        now: u64,
    ) -> Result<usize, TransportError>;

    fn install_initial_key(&mut self, key: &[u8]) -> Result<(), TransportError>;

    fn install_handshake_key(&mut self, key: &[u8]) -> Result<(), TransportError>;

    fn install_application_key(&mut self, key: &[u8]) -> Result<(), TransportError>;

    fn submit_crypto_data(&mut self, level: CryptoLevel, data: &[u8])
        -> Result<(), TransportError>;

    /// Force the handshake to the completed state without a peer.
    fn complete_handshake(&mut self);

    /// Validate a client initial packet before processing it (server only).
    fn accept_initial(&mut self, pkt: &[u8]) -> Result<(), TransportError>;

    fn set_aead_overhead(&mut self, overhead: usize);
}

// Transport parameter ids, from the QUIC transport draft.
const PARAM_IDLE_TIMEOUT: u32 = 0x01;
const PARAM_MAX_PACKET_SIZE: u32 = 0x03;
const PARAM_INITIAL_MAX_DATA: u32 = 0x04;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u32 = 0x05;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u32 = 0x06;
const PARAM_INITIAL_MAX_STREAM_DATA_UNI: u32 = 0x07;
const PARAM_INITIAL_MAX_STREAMS_BIDI: u32 = 0x08;
const PARAM_INITIAL_MAX_STREAMS_UNI: u32 = 0x09;
const PARAM_ACK_DELAY_EXPONENT: u32 = 0x0a;
const PARAM_MAX_ACK_DELAY: u32 = 0x0b;
const PARAM_DISABLE_ACTIVE_MIGRATION: u32 = 0x0c;
const PARAM_ACTIVE_CONNECTION_ID_LIMIT: u32 = 0x0e;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportParamsError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("parameter length does not match value")]
    InvalidLength,
}

impl From<VarIntUnexpectedEnd> for TransportParamsError {
    fn from(_: VarIntUnexpectedEnd) -> Self {
        TransportParamsError::UnexpectedEnd
    }
}

/// The negotiated QUIC transport parameters, as a sequence of
/// (varint id, varint length, value) entries on the wire.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransportParams {
    pub idle_timeout: u64,
    pub max_packet_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
}

impl TransportParams {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        Self::put(buf, PARAM_IDLE_TIMEOUT, self.idle_timeout);
        Self::put(buf, PARAM_MAX_PACKET_SIZE, self.max_packet_size);
        Self::put(buf, PARAM_INITIAL_MAX_DATA, self.initial_max_data);
        Self::put(
            buf,
            PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        );
        Self::put(
            buf,
            PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        );
        Self::put(
            buf,
            PARAM_INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
        );
        Self::put(
            buf,
            PARAM_INITIAL_MAX_STREAMS_BIDI,
            self.initial_max_streams_bidi,
        );
        Self::put(
            buf,
            PARAM_INITIAL_MAX_STREAMS_UNI,
            self.initial_max_streams_uni,
        );
        Self::put(buf, PARAM_ACK_DELAY_EXPONENT, self.ack_delay_exponent);
        Self::put(buf, PARAM_MAX_ACK_DELAY, self.max_ack_delay);
        if self.disable_active_migration {
            VarInt::from_u32(PARAM_DISABLE_ACTIVE_MIGRATION).encode(buf);
            VarInt::from_u32(0).encode(buf);
        }
        Self::put(
            buf,
            PARAM_ACTIVE_CONNECTION_ID_LIMIT,
            self.active_connection_id_limit,
        );
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, TransportParamsError> {
        let mut params = TransportParams::default();

        while buf.has_remaining() {
            let id = VarInt::decode(buf)?.into_inner();
            let len = VarInt::decode(buf)?.into_inner() as usize;
            if buf.remaining() < len {
                return Err(TransportParamsError::UnexpectedEnd);
            }

            if id == PARAM_DISABLE_ACTIVE_MIGRATION as u64 {
                if len != 0 {
                    return Err(TransportParamsError::InvalidLength);
                }
                params.disable_active_migration = true;
                continue;
            }

            let slot = match id as u32 {
                PARAM_IDLE_TIMEOUT => Some(&mut params.idle_timeout),
                PARAM_MAX_PACKET_SIZE => Some(&mut params.max_packet_size),
                PARAM_INITIAL_MAX_DATA => Some(&mut params.initial_max_data),
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    Some(&mut params.initial_max_stream_data_bidi_local)
                }
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    Some(&mut params.initial_max_stream_data_bidi_remote)
                }
                PARAM_INITIAL_MAX_STREAM_DATA_UNI => {
                    Some(&mut params.initial_max_stream_data_uni)
                }
                PARAM_INITIAL_MAX_STREAMS_BIDI => Some(&mut params.initial_max_streams_bidi),
                PARAM_INITIAL_MAX_STREAMS_UNI => Some(&mut params.initial_max_streams_uni),
                PARAM_ACK_DELAY_EXPONENT => Some(&mut params.ack_delay_exponent),
                PARAM_MAX_ACK_DELAY => Some(&mut params.max_ack_delay),
                PARAM_ACTIVE_CONNECTION_ID_LIMIT => {
                    Some(&mut params.active_connection_id_limit)
                }
                _ => None,
            };

            match slot {
                Some(slot) => {
                    let mut value = buf.take(len);
                    *slot = VarInt::decode(&mut value)
                        .map_err(|_| TransportParamsError::InvalidLength)?
                        .into_inner();
                    if value.has_remaining() {
                        return Err(TransportParamsError::InvalidLength);
                    }
                }
                // unknown parameters are skipped whole
                None => buf.advance(len),
            }
        }

        Ok(params)
    }

    fn put<B: BufMut>(buf: &mut B, id: u32, value: u64) {
        let value = VarInt::from_u64(value).unwrap_or(VarInt::MAX);
        VarInt::from_u32(id).encode(buf);
        VarInt::from_u64(value.size() as u64).unwrap().encode(buf);
        value.encode(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_roundtrip() {
        let params = TransportParams {
            idle_timeout: 30_000,
            max_packet_size: 1350,
            initial_max_data: 1024 * 1024,
            initial_max_stream_data_bidi_local: 256 * 1024,
            initial_max_stream_data_bidi_remote: 256 * 1024,
            initial_max_stream_data_uni: 256 * 1024,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 0x3fffffff,
            ack_delay_exponent: 3,
            max_ack_delay: 0,
            disable_active_migration: true,
            active_connection_id_limit: 0,
        };

        let mut buf = Vec::new();
        params.encode(&mut buf);

        let decoded = TransportParams::decode(&mut buf.as_slice()).unwrap();
        assert_eq!(params, decoded);
    }

    #[test]
    fn unknown_params_skipped() {
        let mut buf = Vec::new();
        VarInt::from_u32(0x7f).encode(&mut buf); // unknown id
        VarInt::from_u32(1).encode(&mut buf);
        VarInt::from_u32(7).encode(&mut buf);
        VarInt::from_u32(PARAM_ACK_DELAY_EXPONENT).encode(&mut buf);
        VarInt::from_u32(1).encode(&mut buf);
        VarInt::from_u32(9).encode(&mut buf);

        let decoded = TransportParams::decode(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.ack_delay_exponent, 9);
    }

    #[test]
    fn truncated_params() {
        let mut buf = Vec::new();
        VarInt::from_u32(PARAM_INITIAL_MAX_DATA).encode(&mut buf);
        VarInt::from_u32(4).encode(&mut buf);
        buf.push(0x80); // 4-byte varint, 3 bytes missing

        assert_eq!(
            TransportParams::decode(&mut buf.as_slice()),
            Err(TransportParamsError::UnexpectedEnd),
        );
    }
}
