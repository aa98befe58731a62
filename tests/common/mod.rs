//! Shared test fixtures: a scriptable transport and a recording event sink.

use std::collections::VecDeque;

use hqmcast::{
    CryptoLevel, DataFlags, Error, Header, HeaderFlags, RequestId, Result, SessionEvents,
    StreamWrite, TimerHost, Transport, TransportError, TransportEvent, TransportParams,
    TIMESTAMP_NEVER,
};

pub const MARKER: u8 = 0xee;

/// A QUIC transport stub. Packets fed in with a leading [`MARKER`] byte pop
/// the next scripted event batch; everything else is recorded and ignored.
/// Stream writes are captured verbatim and wrapped in a minimal
/// short-header packet so the multicast fake-ACK path has something to
/// decode.
pub struct MockTransport {
    pub scripted: VecDeque<Vec<TransportEvent>>,
    pub read_log: Vec<Vec<u8>>,
    pub written: Vec<(u64, Vec<u8>, bool)>,
    pub shutdowns: Vec<(u64, u64)>,
    pub remote_params: Option<TransportParams>,
    pub local_params: TransportParams,

    session_id_len: usize,
    next_bidi: u64,
    next_uni: u64,
    next_pkt_num: u8,
    pending_pkt_writes: usize,
    handshake_done: bool,
}

impl MockTransport {
    pub fn client(session_id_len: usize) -> Self {
        Self::new(session_id_len, 4, 2)
    }

    pub fn server(session_id_len: usize) -> Self {
        Self::new(session_id_len, 1, 3)
    }

    fn new(session_id_len: usize, next_bidi: u64, next_uni: u64) -> Self {
        MockTransport {
            scripted: VecDeque::new(),
            read_log: Vec::new(),
            written: Vec::new(),
            shutdowns: Vec::new(),
            remote_params: None,
            local_params: TransportParams {
                idle_timeout: 30_000,
                max_packet_size: 1350,
                initial_max_data: 1024 * 1024,
                initial_max_stream_data_bidi_local: 256 * 1024,
                initial_max_stream_data_bidi_remote: 256 * 1024,
                initial_max_stream_data_uni: 256 * 1024,
                initial_max_streams_bidi: 16,
                initial_max_streams_uni: 16,
                ack_delay_exponent: 3,
                max_ack_delay: 0,
                disable_active_migration: true,
                active_connection_id_limit: 0,
            },
            session_id_len,
            next_bidi,
            next_uni,
            next_pkt_num: 0,
            pending_pkt_writes: 4,
            handshake_done: false,
        }
    }
}

impl Transport for MockTransport {
    fn read_pkt(&mut self, pkt: &[u8], _now: u64) -> std::result::Result<Vec<TransportEvent>, TransportError> {
        self.read_log.push(pkt.to_vec());
        if pkt.first() == Some(&MARKER) {
            return Ok(self.scripted.pop_front().unwrap_or_default());
        }
        Ok(Vec::new())
    }

    fn write_pkt(&mut self, buf: &mut [u8], _now: u64) -> std::result::Result<usize, TransportError> {
        if self.pending_pkt_writes == 0 {
            return Ok(0);
        }
        self.pending_pkt_writes -= 1;

        // A long-header dummy; the fake-ACK path ignores these.
        let len = 20.min(buf.len());
        buf[..len].fill(0);
        buf[0] = 0xc0;
        Ok(len)
    }

    fn write_stream(
        &mut self,
        buf: &mut [u8],
        stream_id: u64,
        fin: bool,
        data: &[u8],
        _now: u64,
    ) -> std::result::Result<StreamWrite, TransportError> {
        self.written.push((stream_id, data.to_vec(), fin));

        // Short header: flags, dcid, 1-byte packet number, then the data.
        let header_len = 1 + self.session_id_len + 1;
        let pkt_len = (header_len + data.len()).min(buf.len());
        buf[0] = 0x40;
        buf[1..1 + self.session_id_len].fill(0xaa);
        buf[1 + self.session_id_len] = self.next_pkt_num;
        self.next_pkt_num = self.next_pkt_num.wrapping_add(1);
        let body = pkt_len - header_len;
        buf[header_len..pkt_len].copy_from_slice(&data[..body]);

        Ok(StreamWrite {
            pkt_len,
            consumed: data.len(),
        })
    }

    fn open_bidi_stream(&mut self) -> std::result::Result<u64, TransportError> {
        let id = self.next_bidi;
        self.next_bidi += 4;
        Ok(id)
    }

    fn open_uni_stream(&mut self) -> std::result::Result<u64, TransportError> {
        let id = self.next_uni;
        self.next_uni += 4;
        Ok(id)
    }

    fn shutdown_stream(
        &mut self,
        stream_id: u64,
        app_error_code: u64,
    ) -> std::result::Result<(), TransportError> {
        self.shutdowns.push((stream_id, app_error_code));
        Ok(())
    }

    fn bytes_in_flight(&self) -> usize {
        0
    }

    fn loss_detection_expiry(&self) -> u64 {
        TIMESTAMP_NEVER
    }

    fn ack_delay_expiry(&self) -> u64 {
        TIMESTAMP_NEVER
    }

    fn on_loss_detection_timer(&mut self, _now: u64) -> std::result::Result<(), TransportError> {
        Ok(())
    }

    fn is_handshake_completed(&self) -> bool {
        self.handshake_done
    }

    fn is_draining(&self) -> bool {
        false
    }

    fn local_transport_params(&self) -> TransportParams {
        self.local_params
    }

    fn set_remote_transport_params(
        &mut self,
        params: &TransportParams,
    ) -> std::result::Result<(), TransportError> {
        self.remote_params = Some(*params);
        Ok(())
    }

    fn write_connection_close(
        &mut self,
        buf: &mut [u8],
        _error_code: u64,
        _now: u64,
    ) -> std::result::Result<usize, TransportError> {
        let len = 24.min(buf.len());
        buf[..len].fill(0);
        buf[0] = 0xc0;
        Ok(len)
    }

    fn install_initial_key(&mut self, _key: &[u8]) -> std::result::Result<(), TransportError> {
        Ok(())
    }

    fn install_handshake_key(&mut self, _key: &[u8]) -> std::result::Result<(), TransportError> {
        Ok(())
    }

    fn install_application_key(&mut self, _key: &[u8]) -> std::result::Result<(), TransportError> {
        Ok(())
    }

    fn submit_crypto_data(
        &mut self,
        _level: CryptoLevel,
        _data: &[u8],
    ) -> std::result::Result<(), TransportError> {
        Ok(())
    }

    fn complete_handshake(&mut self) {
        self.handshake_done = true;
    }

    fn accept_initial(&mut self, _pkt: &[u8]) -> std::result::Result<(), TransportError> {
        Ok(())
    }

    fn set_aead_overhead(&mut self, _overhead: usize) {}
}

/// Event sink that records every callback and feeds scripted socket reads.
#[derive(Default)]
pub struct Recording {
    pub incoming: VecDeque<Vec<u8>>,
    pub sent: Vec<Vec<u8>>,

    pub begins: Vec<RequestId>,
    pub promises: Vec<(RequestId, RequestId)>,
    pub headers: Vec<(HeaderFlags, Header, RequestId)>,
    pub data: Vec<(DataFlags, Vec<u8>, u64, RequestId)>,
    pub push_cancels: Vec<RequestId>,
    pub closes: Vec<(Option<Error>, RequestId)>,

    pub refuse_promises: bool,
}

impl Recording {
    /// All body bytes delivered for `request`, in delivery order.
    pub fn body(&self, request: RequestId) -> Vec<u8> {
        self.data
            .iter()
            .filter(|(_, _, _, r)| *r == request)
            .flat_map(|(_, bytes, _, _)| bytes.iter().copied())
            .collect()
    }
}

impl TimerHost for Recording {}

impl SessionEvents for Recording {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.incoming.pop_front() {
            Some(pkt) => {
                buf[..pkt.len()].copy_from_slice(&pkt);
                Ok(pkt.len())
            }
            None => Ok(0),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.sent.push(data.to_vec());
        Ok(data.len())
    }

    fn on_begin_headers(&mut self, request: RequestId) -> Result<()> {
        self.begins.push(request);
        Ok(())
    }

    fn on_begin_promise(&mut self, request: RequestId, promised: RequestId) -> Result<()> {
        if self.refuse_promises {
            return Err(Error::NotInterested);
        }
        self.promises.push((request, promised));
        Ok(())
    }

    fn on_headers(&mut self, flags: HeaderFlags, header: &Header, request: RequestId) -> Result<()> {
        self.headers.push((flags, header.clone(), request));
        Ok(())
    }

    fn on_data_recv(&mut self, flags: DataFlags, data: &[u8], offset: u64, request: RequestId) {
        self.data.push((flags, data.to_vec(), offset, request));
    }

    fn on_push_cancel(&mut self, request: RequestId) {
        self.push_cancels.push(request);
    }

    fn on_request_close(&mut self, status: Option<Error>, request: RequestId) {
        self.closes.push((status, request));
    }
}

pub type TestSession = hqmcast::Session<MockTransport, Recording>;

/// Feed one scripted batch of transport events through the session's
/// receive path.
pub fn feed(session: &mut TestSession, events: Vec<TransportEvent>) -> Result<hqmcast::Status> {
    session.events_mut().incoming.push_back(vec![MARKER]);
    session.transport_mut().scripted.push_back(events);
    session.recv()
}
