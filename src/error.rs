use thiserror::Error;

use crate::frame::FrameError;
use crate::qpack::CompressionError;
use crate::transport::TransportError;

/// Non-error sentinels returned by the session recv/send loops.
///
/// `NoMoreData` means there was nothing to do; `Blocked` means the transport
/// is applying backpressure and the caller should retry once its event loop
/// has drained. Neither is a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    NoMoreData,
    Blocked,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer is gone or we closed; the session must be freed.
    #[error("session is closed")]
    SessionClosed,

    /// Fatal QUIC-layer failure.
    #[error("transport failure: {0}")]
    Transport(TransportError),

    /// The peer violated the QUIC protocol.
    #[error("transport protocol violation")]
    TransportProtocol,

    #[error("unsupported transport version")]
    TransportVersion,

    /// Packet decryption failed.
    #[error("decryption failed")]
    Crypto,

    /// The peer violated the HTTP/QUIC framing rules.
    #[error("malformed frame")]
    MalformedFrame,

    /// A connection-level frame arrived on the wrong stream.
    #[error("frame received on the wrong stream")]
    WrongStream,

    /// The header compression state is out of sync with the peer.
    #[error("header compression failure")]
    HeaderCompression,

    #[error("push limit reached")]
    PushLimitReached,

    #[error("push limit may not shrink")]
    InvalidPushLimit,

    #[error("pushed resource already cached")]
    PushAlreadyInCache,

    #[error("push refused")]
    PushRefused,

    #[error("duplicate push")]
    DuplicatePush,

    #[error("receiver not interested")]
    NotInterested,

    #[error("connect failed")]
    HttpConnect,

    #[error("no supported protocol offered")]
    AlpnFailed,

    /// No stream or promise matches the supplied request handle.
    #[error("unknown request handle")]
    BadUserData,

    #[error("request already closed")]
    RequestClosed,

    /// Trailing headers were sent without a `trailer` header announcing them.
    #[error("trailers were not promised")]
    TrailersNotPromised,

    #[error("too many open requests")]
    TooManyRequests,

    #[error("operation is client-only")]
    ClientOnly,

    #[error("operation is server-only")]
    ServerOnly,

    /// An internal invariant was violated; fatal for the session.
    #[error("internal error")]
    Internal,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether this error resets the offending stream while the session
    /// carries on, as opposed to tearing the whole session down.
    pub fn is_stream_reset(&self) -> bool {
        matches!(
            self,
            Error::MalformedFrame
                | Error::WrongStream
                | Error::HeaderCompression
                | Error::TrailersNotPromised
                | Error::RequestClosed
                | Error::NotInterested
        )
    }
}

impl From<FrameError> for Error {
    fn from(err: FrameError) -> Error {
        match err {
            // Unknown frame types are an internal failure of the receiving
            // stream rather than a framing error.
            FrameError::UnknownType(_) => Error::Internal,
            _ => Error::MalformedFrame,
        }
    }
}

impl From<CompressionError> for Error {
    fn from(_: CompressionError) -> Error {
        Error::HeaderCompression
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Error {
        match err {
            TransportError::Decrypt => Error::Crypto,
            TransportError::Proto => Error::TransportProtocol,
            other => Error::Transport(other),
        }
    }
}
