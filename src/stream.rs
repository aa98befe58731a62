use std::collections::VecDeque;

use crate::buffer::{RecvBuffers, SendBuf};
use crate::error::Error;
use crate::qpack::Header;
use crate::reassembly::ActiveFrame;

/// Opaque application handle for a request or promise, standing in for the
/// traditional `void *user_data`. The engine reserves the top bit for
/// handles it mints itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl RequestId {
    const INTERNAL: u64 = 1 << 63;

    pub(crate) fn internal(n: u64) -> Self {
        RequestId(n | Self::INTERNAL)
    }
}

/// Progress of one half of a stream. Transitions are monotonic; the only
/// jump allowed is skipping the body on a bodyless exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamState {
    Open,
    Headers,
    Body,
    Trailers,
    Done,
}

/// Per-transfer state: one entry in the session's stream table, or a pending
/// promise awaiting its unidirectional stream.
#[derive(Debug)]
pub struct Stream {
    pub stream_id: Option<u64>,
    pub push_id: Option<u64>,

    pub recv_state: StreamState,
    pub send_state: StreamState,
    /// Cleared when the stream is reset; bytes arriving afterwards are
    /// rejected instead of reopening the id.
    pub started: bool,
    pub trailers_promised: bool,

    pub user_data: RequestId,
    /// Terminal status reported through `on_request_close`.
    pub status: Option<Error>,
    /// `on_request_close` has fired; it must fire exactly once per request.
    pub close_reported: bool,

    pub recv_bufs: RecvBuffers,
    pub send_queue: VecDeque<SendBuf>,
    pub active_frames: VecDeque<ActiveFrame>,

    /// Stream offset at which the next frame header is expected.
    pub next_recv_offset: u64,
    /// Sum of DATA payload bytes accounted so far, for mapping stream
    /// offsets onto HTTP body offsets.
    pub data_frames_total: u64,
}

impl Stream {
    pub fn new(user_data: RequestId) -> Self {
        Stream {
            stream_id: None,
            push_id: None,
            recv_state: StreamState::Open,
            send_state: StreamState::Open,
            started: true,
            trailers_promised: false,
            user_data,
            status: None,
            close_reported: false,
            recv_bufs: RecvBuffers::new(),
            send_queue: VecDeque::new(),
            active_frames: VecDeque::new(),
            next_recv_offset: 0,
            data_frames_total: 0,
        }
    }

    pub fn with_id(stream_id: u64, user_data: RequestId) -> Self {
        let mut stream = Stream::new(user_data);
        stream.stream_id = Some(stream_id);
        stream
    }

    /// A promise record: no stream yet, keyed by push id until the
    /// unidirectional stream opens.
    pub fn promise(push_id: u64, user_data: RequestId) -> Self {
        let mut stream = Stream::new(user_data);
        stream.push_id = Some(push_id);
        stream
    }

    /// Record a `trailer` header so a later trailing HEADERS is legal.
    pub fn note_trailer_header(&mut self, headers: &[Header]) {
        if headers.iter().any(|h| h.name_is("trailer")) {
            self.trailers_promised = true;
        }
    }

    pub fn queue(&mut self, data: Vec<u8>, fin: bool) {
        self.send_queue.push_back(SendBuf::new(data, fin));
    }
}
