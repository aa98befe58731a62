//! The session: one HTTP/QUIC connection context. Owns the stream tables,
//! the transport handle, the send and receive packet queues, the header
//! compression context and the timer state, and runs the receive-side frame
//! reassembler and the send-side packetiser.

use std::collections::{BTreeMap, VecDeque};

use crate::alpn;
use crate::error::{Error, Result, Status};
use crate::frame::{self, Frame, FrameHeader, FrameKind};
use crate::multicast;
use crate::qpack::{self, Header};
use crate::reassembly::ActiveFrame;
use crate::settings::Settings;
use crate::stream::{RequestId, Stream, StreamState};
use crate::timer::{timestamp_now, TimerHost, TimerKind, Timers};
use crate::transport::{CryptoLevel, Transport, TransportEvent, TransportParams};
use crate::varint::VarInt;

/// Stream 0 carries the handshake; it exists from session creation.
pub const HANDSHAKE_STREAM_ID: u64 = 0;

/// Unidirectional control stream each side sends connection-level frames on.
pub const CONTROL_CLIENT: u64 = 2;
pub const CONTROL_SERVER: u64 = 3;

/// The synthetic initial request stream of the multicast profile. The
/// sender also carries its PUSH_PROMISE frames here, so receivers watch
/// this stream for new pushes.
pub const INIT_REQUEST_STREAM_ID: u64 = 4;

/// Stream and push-id ceiling handed out in multicast mode, where the
/// sender pushes an effectively unbounded sequence.
pub const MULTICAST_MAX_UNI_STREAM_ID: u64 = 0x3fff_ffff;

/// Stop handing packets to the transport once this much is unacknowledged.
const MAX_BYTES_IN_FLIGHT: usize = 1460 * 10;

/// Minimum byte overhead for a stream frame packet (quic pkt header + quic
/// stream frame header + http/quic data header).
const MIN_STREAM_PACKET_OVERHEAD: usize = 27;

const BUFFER_READ_SIZE: usize = 4096;

/// QUIC application error codes of the HTTP/QUIC draft.
pub mod app_error {
    pub const STOPPING: u64 = 0x00;
    pub const HTTP_NO_ERROR: u64 = 0x01;
    pub const HTTP_PUSH_REFUSED: u64 = 0x02;
    pub const HTTP_INTERNAL_ERROR: u64 = 0x03;
    pub const HTTP_PUSH_ALREADY_IN_CACHE: u64 = 0x04;
    pub const HTTP_REQUEST_CANCELLED: u64 = 0x05;
    pub const HTTP_CONNECT_ERROR: u64 = 0x07;
    pub const HTTP_EXCESSIVE_LOAD: u64 = 0x08;
    pub const HTTP_VERSION_FALLBACK: u64 = 0x09;
    pub const HTTP_WRONG_STREAM: u64 = 0x0a;
    pub const HTTP_PUSH_LIMIT_EXCEEDED: u64 = 0x0b;
    pub const HTTP_DUPLICATE_PUSH: u64 = 0x0c;
    pub const HTTP_HPACK_DECOMPRESSION_FAILED: u64 = 0x0d;
    /// Malformed-frame codes are this base ORed with the frame type.
    pub const HTTP_MALFORMED_FRAME: u64 = 0x0100;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Unicast,
    Multicast,
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub mode: Mode,
    pub session_id: Vec<u8>,
    pub max_open_requests: u64,
    pub max_open_server_pushes: u64,
    /// Milliseconds of silence before the transport gives up.
    pub idle_timeout: u64,
    pub max_packet_size: u64,
    pub max_data: u64,
    pub max_stream_data: u64,
    pub ack_delay_exponent: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            mode: Mode::Unicast,
            session_id: vec![0; 8],
            max_open_requests: 16,
            max_open_server_pushes: 16,
            idle_timeout: 30_000,
            max_packet_size: 1350,
            max_data: 1024 * 1024,
            max_stream_data: 256 * 1024,
            ack_delay_exponent: 3,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFlags {
    /// This header block ends the request or response.
    pub end_request: bool,
    /// These are trailing headers.
    pub trailers: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DataFlags {
    /// No body bytes follow these.
    pub end_data: bool,
}

/// Host callbacks. Everything is invoked synchronously from the engine
/// thread and must not re-enter the session; timer arming is the one edge
/// with special treatment, see the timer module.
pub trait SessionEvents: TimerHost {
    /// Pull received packet bytes into `buf`. Returns 0 when the socket has
    /// nothing more, `Err(SessionClosed)` on EOF.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Push one packet to the socket. Returns 0 when the socket would
    /// block, `Err(SessionClosed)` on EOF.
    fn send(&mut self, data: &[u8]) -> Result<usize>;

    fn on_begin_headers(&mut self, request: RequestId) -> Result<()> {
        let _ = request;
        Ok(())
    }

    /// A push promise arrived on `request`. Returning an error refuses the
    /// push; `NotInterested` refuses it without resetting the stream.
    fn on_begin_promise(&mut self, request: RequestId, promised: RequestId) -> Result<()> {
        let _ = (request, promised);
        Err(Error::NotInterested)
    }

    fn on_headers(&mut self, flags: HeaderFlags, header: &Header, request: RequestId)
        -> Result<()>;

    fn on_data_recv(&mut self, flags: DataFlags, data: &[u8], offset: u64, request: RequestId);

    fn on_push_cancel(&mut self, request: RequestId) {
        let _ = request;
    }

    fn on_request_close(&mut self, status: Option<Error>, request: RequestId) {
        let _ = (status, request);
    }
}

pub struct Session<T: Transport, E: SessionEvents> {
    transport: T,
    events: E,

    role: Role,
    mode: Mode,
    session_id: Vec<u8>,
    settings: Settings,
    transport_settings: TransportSettings,

    transfers: BTreeMap<u64, Stream>,
    promises: BTreeMap<u64, Stream>,
    hdr_ctx: qpack::Context,

    recv_buf: VecDeque<Vec<u8>>,
    send_buf: VecDeque<Vec<u8>>,

    timers: Timers,
    handshake_complete: bool,
    closed: bool,

    max_open_requests: u64,
    max_open_server_pushes: u64,
    highest_bidi_stream_id: u64,
    highest_uni_stream_id: u64,
    next_push_promise: u64,
    max_push_promise: u64,

    /// Packet number stamped onto fabricated ACKs; increments per ACK.
    remote_pktnum: u8,
    /// Largest packet number seen from our own transmissions, for
    /// packet-number reconstruction.
    last_remote_pkt_num: u64,

    next_internal_request: u64,
}

impl<T: Transport, E: SessionEvents> Session<T, E> {
    pub fn new_client(
        transport: T,
        events: E,
        settings: Settings,
        transport_settings: TransportSettings,
    ) -> Result<Self> {
        let mut session = Self::new_common(
            transport,
            events,
            settings,
            transport_settings,
            Role::Client,
        );

        if session.mode == Mode::Multicast {
            session.start_multicast_client()?;
        } else {
            // The control stream carries CANCEL_PUSH and MAX_PUSH_ID later.
            let stream_id = session.transport.open_uni_stream()?;
            if stream_id != CONTROL_CLIENT {
                log::error!("client control stream opened as {stream_id}, must be {CONTROL_CLIENT}");
                return Err(Error::Internal);
            }
            session.insert_stream(stream_id);
        }

        Ok(session)
    }

    pub fn new_server(
        transport: T,
        events: E,
        settings: Settings,
        transport_settings: TransportSettings,
    ) -> Result<Self> {
        let mut session = Self::new_common(
            transport,
            events,
            settings,
            transport_settings,
            Role::Server,
        );

        if session.mode == Mode::Multicast {
            session.start_multicast_server()?;
        }

        let stream_id = session.transport.open_uni_stream()?;
        if stream_id != CONTROL_SERVER {
            // The server control MUST be on 3.
            log::error!("server control stream opened as {stream_id}, must be {CONTROL_SERVER}");
            return Err(Error::Internal);
        }
        session.insert_stream(stream_id);

        Ok(session)
    }

    fn new_common(
        transport: T,
        events: E,
        settings: Settings,
        transport_settings: TransportSettings,
        role: Role,
    ) -> Self {
        let mode = transport_settings.mode;

        let mut session = Session {
            transport,
            events,
            role,
            mode,
            session_id: transport_settings.session_id.clone(),
            settings,
            max_open_requests: transport_settings.max_open_requests,
            max_open_server_pushes: transport_settings.max_open_server_pushes,
            transport_settings,
            transfers: BTreeMap::new(),
            promises: BTreeMap::new(),
            hdr_ctx: qpack::Context::new(),
            recv_buf: VecDeque::new(),
            send_buf: VecDeque::new(),
            timers: Timers::new(),
            handshake_complete: false,
            closed: false,
            highest_bidi_stream_id: 0,
            highest_uni_stream_id: 0,
            next_push_promise: 0,
            max_push_promise: 0,
            remote_pktnum: 2,
            last_remote_pkt_num: 0,
            next_internal_request: 1,
        };

        session.insert_stream(HANDSHAKE_STREAM_ID);

        match mode {
            Mode::Multicast => {
                log::debug!("starting a new multicast session");
                session.highest_bidi_stream_id = INIT_REQUEST_STREAM_ID;
                session.highest_uni_stream_id = MULTICAST_MAX_UNI_STREAM_ID;
                session.max_push_promise = MULTICAST_MAX_UNI_STREAM_ID;
                session.insert_stream(INIT_REQUEST_STREAM_ID);
            }
            Mode::Unicast => {
                log::debug!("starting a new unicast session");
                session.highest_bidi_stream_id = MULTICAST_MAX_UNI_STREAM_ID;
                session.highest_uni_stream_id = MULTICAST_MAX_UNI_STREAM_ID;
                session.max_push_promise = 0;
            }
        }

        session
    }

    fn insert_stream(&mut self, stream_id: u64) -> &mut Stream {
        let user_data = self.mint_request_id();
        self.transfers
            .entry(stream_id)
            .or_insert_with(|| Stream::with_id(stream_id, user_data))
    }

    fn mint_request_id(&mut self) -> RequestId {
        let id = RequestId::internal(self.next_internal_request);
        self.next_internal_request += 1;
        id
    }

    /// Fabricate the server half of the handshake so the transport believes
    /// a sender exists, then kick stream 0 so packets start flowing.
    fn start_multicast_client(&mut self) -> Result<()> {
        let now = timestamp_now();
        let magic = &multicast::QUIC_MCAST_MAGIC;

        self.transport.install_initial_key(magic)?;
        self.transport.install_handshake_key(magic)?;
        self.transport.submit_crypto_data(CryptoLevel::Initial, magic)?;

        // Flush our own client initial; it never reaches a wire.
        let mut init = vec![0u8; self.transport_settings.max_packet_size as usize];
        let written = self.transport.write_pkt(&mut init, now)?;
        if written == 0 {
            log::error!("failed to write the client initial packet");
            return Err(Error::Internal);
        }

        let params = self.transport.local_transport_params();
        let server_initial = multicast::fake_server_initial_packet(&self.session_id, 1, &params);
        self.feed_fake_packet(&server_initial, now)?;

        let server_handshake =
            multicast::fake_server_handshake_packet(&self.session_id, 1, &params);
        self.feed_fake_packet(&server_handshake, now)?;

        self.transport.submit_crypto_data(CryptoLevel::Handshake, magic)?;
        self.transport.complete_handshake();
        self.transport.install_application_key(magic)?;

        // A zero-length frame on stream 0 provokes the transport into
        // emitting packets even though we have nothing to say.
        self.kick_handshake_stream();
        self.send()?;

        if !self.transport.is_handshake_completed() {
            log::error!("multicast client handshake did not complete");
            return Err(Error::Internal);
        }
        self.handshake_complete = true;

        Ok(())
    }

    /// Mirror image: inject the well-known client initial, force the
    /// handshake complete, and acknowledge the fake client's stream 0.
    fn start_multicast_server(&mut self) -> Result<()> {
        let now = timestamp_now();
        let magic = &multicast::QUIC_MCAST_MAGIC;
        let params = self.transport.local_transport_params();

        let client_initial = multicast::fake_client_initial_packet(&self.session_id, 0, &params);
        self.transport.accept_initial(&client_initial)?;
        self.feed_fake_packet(&client_initial, now)?;

        self.transport.install_handshake_key(magic)?;
        self.transport.install_application_key(magic)?;
        self.transport.submit_crypto_data(CryptoLevel::Initial, magic)?;
        self.transport.submit_crypto_data(CryptoLevel::Handshake, magic)?;

        // Drain the handshake flights the transport wants to emit.
        let mut pkt = vec![0u8; 1000];
        loop {
            let written = self.transport.write_pkt(&mut pkt, now)?;
            if written == 0 {
                break;
            }
        }

        self.transport.complete_handshake();
        self.transport.set_aead_overhead(0);

        let stream0 = multicast::fake_client_stream0_packet(1);
        self.feed_fake_packet(&stream0, now)?;

        if !self.transport.is_handshake_completed() {
            log::error!("multicast server handshake did not complete");
            return Err(Error::Internal);
        }

        self.kick_handshake_stream();
        self.send()?;
        self.handshake_complete = true;

        // The initial request stream opens with the push stream prefix so
        // receivers can key promises off it; it goes out with the first
        // real flush.
        if let Some(init) = self.transfers.get_mut(&INIT_REQUEST_STREAM_ID) {
            init.queue(frame::push_stream_header(0), false);
        }

        Ok(())
    }

    fn feed_fake_packet(&mut self, pkt: &[u8], now: u64) -> Result<()> {
        let events = self.transport.read_pkt(pkt, now)?;
        for event in events {
            self.handle_transport_event(event)?;
        }
        Ok(())
    }

    fn kick_handshake_stream(&mut self) {
        if let Some(stream0) = self.transfers.get_mut(&HANDSHAKE_STREAM_ID) {
            // A zero-length frame; never actually hits the wire.
            stream0.queue(vec![0x0a, 0x00], false);
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut E {
        &mut self.events
    }

    /// Pull everything the socket has, feed it through the transport, and
    /// run the per-stream reassemblers on whatever falls out.
    pub fn recv(&mut self) -> Result<Status> {
        if self.closed {
            return Err(Error::SessionClosed);
        }

        let mut status = Status::NoMoreData;

        loop {
            let mut buf = vec![0u8; BUFFER_READ_SIZE];
            let read = self.events.recv(&mut buf)?;
            if read == 0 {
                break;
            }
            buf.truncate(read);
            self.recv_buf.push_back(buf);
        }

        while let Some(pkt) = self.recv_buf.pop_front() {
            let now = timestamp_now();
            let events = self.transport.read_pkt(&pkt, now).map_err(Error::from)?;
            for event in events {
                self.handle_transport_event(event)?;
                if self.closed {
                    return Ok(Status::Ok);
                }
            }

            self.update_timers()?;
            status = Status::Ok;

            if self.transport.is_draining() {
                return Err(Error::SessionClosed);
            }
        }

        Ok(status)
    }

    fn handle_transport_event(&mut self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::StreamOpened { stream_id } => {
                if stream_id % 4 < 2 {
                    self.highest_bidi_stream_id = self.highest_bidi_stream_id.max(stream_id);
                } else {
                    self.highest_uni_stream_id = self.highest_uni_stream_id.max(stream_id);
                }
                self.insert_stream(stream_id);
                Ok(())
            }
            TransportEvent::StreamData {
                stream_id,
                offset,
                data,
                fin,
            } => self.recv_stream_data(stream_id, &data, offset, fin),
            TransportEvent::StreamClosed {
                stream_id,
                app_error_code,
            } => self.stream_closed(stream_id, app_error_code),
            TransportEvent::HandshakeCompleted => {
                self.handshake_complete = true;
                Ok(())
            }
            TransportEvent::Draining => Ok(()),
        }
    }

    /// A push stream carries a stream-type prefix and its push id before
    /// the first frame; so does the initial request stream in multicast.
    fn is_push_prefixed(&self, stream_id: u64) -> bool {
        (stream_id == INIT_REQUEST_STREAM_ID && self.mode == Mode::Multicast)
            || (stream_id % 4 == 3 && stream_id != CONTROL_SERVER)
    }

    /// Receive-side entry point for stream bytes from the transport.
    /// Errors that only concern this stream reset it; the session lives on.
    fn recv_stream_data(
        &mut self,
        stream_id: u64,
        data: &[u8],
        offset: u64,
        fin: bool,
    ) -> Result<()> {
        // Stream 0 carries handshake filler, never HTTP frames.
        if stream_id == HANDSHAKE_STREAM_ID {
            return Ok(());
        }

        let mut stream = match self.transfers.remove(&stream_id) {
            Some(stream) => stream,
            None => {
                let user_data = self.mint_request_id();
                Stream::with_id(stream_id, user_data)
            }
        };

        match self.pump_stream(&mut stream, stream_id, data, offset, fin) {
            Ok(()) => {
                if self.closed {
                    // A goaway close tore the table down while this stream
                    // was detached; give it its close callback and drop it.
                    if !stream.close_reported {
                        self.events
                            .on_request_close(Some(Error::NotInterested), stream.user_data);
                    }
                } else {
                    self.transfers.insert(stream_id, stream);
                }
                Ok(())
            }
            Err(err) if err.is_stream_reset() => {
                log::debug!("resetting stream {stream_id}: {err}");
                let code = app_error_code(&err);
                let _ = self.transport.shutdown_stream(stream_id, code);
                stream.status = Some(err);
                if !stream.close_reported {
                    stream.close_reported = true;
                    self.events
                        .on_request_close(stream.status.clone(), stream.user_data);
                }

                // Keep the carcass in the table so late bytes on this id
                // are rejected rather than reopening it under a fresh
                // handle.
                stream.started = false;
                stream.recv_state = StreamState::Done;
                stream.send_state = StreamState::Done;
                self.transfers.insert(stream_id, stream);
                Ok(())
            }
            Err(fatal) => Err(fatal),
        }
    }

    fn pump_stream(
        &mut self,
        stream: &mut Stream,
        stream_id: u64,
        data: &[u8],
        offset: u64,
        fin: bool,
    ) -> Result<()> {
        if !stream.started {
            return Err(Error::RequestClosed);
        }

        stream.recv_bufs.insert(offset, data, fin);

        // The multicast promise stream is unbounded and receivers may join
        // mid-broadcast: extraction tracks the earliest bytes actually
        // held, abandoning frames the sender has moved past.
        if stream_id == INIT_REQUEST_STREAM_ID && self.mode == Mode::Multicast {
            if let Some(first) = stream.recv_bufs.first_offset() {
                if first > stream.next_recv_offset {
                    stream.next_recv_offset = first;
                    // Frames whose leading bytes were never received cannot
                    // complete any more.
                    stream.active_frames.retain(|f| f.offset >= first);
                }
            }
        }

        self.extract_frames(stream, stream_id)?;
        self.drain_stream_frames(stream, stream_id)
    }

    /// Stage 2: decode frame headers at `next_recv_offset` and register
    /// active frames for them.
    fn extract_frames(&mut self, stream: &mut Stream, stream_id: u64) -> Result<()> {
        loop {
            let at = stream.next_recv_offset;

            if self.is_push_prefixed(stream_id) && at == 0 {
                let Some((available, _)) = stream.recv_bufs.read_at(0) else {
                    return Ok(());
                };
                let mut cur = available;
                let Ok(stream_type) = VarInt::decode(&mut cur) else {
                    return Ok(());
                };
                if stream_type.into_inner() != frame::PUSH_STREAM_TYPE {
                    log::error!(
                        "expected the beginning of a server push stream on {stream_id}"
                    );
                    return Err(Error::MalformedFrame);
                }
                let Ok(push_id) = VarInt::decode(&mut cur) else {
                    return Ok(());
                };
                let consumed = available.len() - cur.len();

                stream.recv_bufs.pop(0, consumed);
                stream.next_recv_offset = consumed as u64;
                self.adopt_promise(stream, push_id.into_inner());
                continue;
            }

            let Some((available, _)) = stream.recv_bufs.read_at(at) else {
                return Ok(());
            };
            let Some(header) = FrameHeader::decode(available) else {
                return Ok(());
            };
            if !header.kind.is_known() {
                log::error!("unknown frame type {:?} on stream {stream_id}", header.kind);
                return Err(Error::Internal);
            }

            let frame = if header.kind == FrameKind::DATA {
                // Body bytes after the trailing headers started are illegal.
                if stream.recv_state >= StreamState::Trailers {
                    return Err(Error::MalformedFrame);
                }
                let frame = ActiveFrame::data(header, at, stream.data_frames_total);
                stream.data_frames_total += header.payload_len as u64;
                // The header bytes are fully decoded; only body bytes remain
                // to be streamed out.
                stream.recv_bufs.pop(at, header.header_len);
                frame
            } else {
                ActiveFrame::control(header, at)
            };

            stream.next_recv_offset = at + frame.len;
            stream.active_frames.push_back(frame);
        }
    }

    /// A promised stream opened: transfer the promise record's identity
    /// onto it.
    fn adopt_promise(&mut self, stream: &mut Stream, push_id: u64) {
        stream.push_id = Some(push_id);
        if let Some(promise) = self.promises.remove(&push_id) {
            log::debug!("push id {push_id} adopted by stream");
            stream.user_data = promise.user_data;
            stream.recv_state = stream.recv_state.max(promise.recv_state);
            stream.trailers_promised |= promise.trailers_promised;
        }
    }

    /// Stages 3 and 4: move received bytes into active frames and dispatch
    /// the ones that complete, in stream order. A non-DATA frame under
    /// assembly blocks later non-DATA frames; DATA neither blocks nor
    /// waits, beyond body bytes staying in offset order.
    fn drain_stream_frames(&mut self, stream: &mut Stream, stream_id: u64) -> Result<()> {
        loop {
            let mut progress = fill_control_frames(stream);

            let mut blocked = false;
            let mut idx = 0;
            while idx < stream.active_frames.len() {
                if stream.active_frames[idx].kind == FrameKind::DATA {
                    progress |= self.deliver_data_frame(stream, idx)?;

                    let frame = &stream.active_frames[idx];
                    let fin_here = stream.recv_bufs.fin_offset() == Some(frame.end());
                    if frame.is_ready() && (!fin_here || frame.fin_signalled) {
                        let _ = stream.active_frames.remove(idx);
                        if fin_here {
                            self.finish_recv(stream);
                        }
                        progress = true;
                        continue;
                    }
                    idx += 1;
                } else if stream.active_frames[idx].is_ready() && !blocked {
                    let frame = stream.active_frames.remove(idx).unwrap();
                    self.dispatch_frame(stream, stream_id, frame)?;
                    if self.closed {
                        return Ok(());
                    }
                    progress = true;
                } else {
                    if !stream.active_frames[idx].is_ready() {
                        blocked = true;
                    }
                    idx += 1;
                }
            }

            if !progress {
                return Ok(());
            }
        }
    }

    /// Stream the contiguous body prefix of a DATA frame to the
    /// application. Bytes beyond a gap stay buffered until the gap fills,
    /// keeping delivery monotonic in body offset.
    fn deliver_data_frame(&mut self, stream: &mut Stream, idx: usize) -> Result<bool> {
        if stream.recv_state == StreamState::Open {
            // No headers yet: hang onto the body for now.
            return Ok(false);
        }
        if stream.recv_state == StreamState::Headers {
            stream.recv_state = StreamState::Body;
        }

        let Stream {
            active_frames,
            recv_bufs,
            user_data,
            ..
        } = stream;
        let frame = &mut active_frames[idx];
        let fin_here = recv_bufs.fin_offset() == Some(frame.offset + frame.len);

        let mut made_progress = false;
        loop {
            let local = frame.delivered;
            if local >= frame.len {
                break;
            }
            let stream_off = frame.offset + local;
            let Some((available, _)) = recv_bufs.read_at(stream_off) else {
                break;
            };

            let take = (available.len() as u64).min(frame.len - local) as usize;
            let body_offset = stream_off - frame.data_offset_adjust;
            let end_data = fin_here && local + take as u64 == frame.len;

            self.events.on_data_recv(
                DataFlags { end_data },
                &available[..take],
                body_offset,
                *user_data,
            );

            recv_bufs.pop(stream_off, take);
            frame.delivered = local + take as u64;
            if end_data {
                frame.fin_signalled = true;
            }
            made_progress = true;
        }

        // An empty body, or a fin that arrived after the last byte, still
        // owes the application an end-of-data signal.
        if frame.delivered >= frame.len && fin_here && !frame.fin_signalled {
            let body_offset = frame.offset + frame.len - frame.data_offset_adjust;
            self.events.on_data_recv(
                DataFlags { end_data: true },
                &[],
                body_offset,
                *user_data,
            );
            frame.fin_signalled = true;
            made_progress = true;
        }

        Ok(made_progress)
    }

    fn finish_recv(&mut self, stream: &mut Stream) {
        stream.recv_state = StreamState::Done;
        if !stream.close_reported {
            stream.close_reported = true;
            self.events
                .on_request_close(stream.status.clone(), stream.user_data);
        }
    }

    fn dispatch_frame(
        &mut self,
        stream: &mut Stream,
        stream_id: u64,
        frame: ActiveFrame,
    ) -> Result<()> {
        let fin = stream.recv_bufs.fin_offset() == Some(frame.end());

        match Frame::parse(&frame.payload)? {
            Frame::Data { .. } => Ok(()), // streamed during assembly
            Frame::Headers { block } => self.on_headers_frame(stream, &block, fin),
            Frame::Priority(priority) => {
                // Only valid on the peer's control stream.
                let peer_control = match self.role {
                    Role::Client => CONTROL_SERVER,
                    Role::Server => CONTROL_CLIENT,
                };
                if stream_id != peer_control {
                    return Err(Error::WrongStream);
                }
                log::debug!("ignoring PRIORITY for element {}", priority.element_id);
                Ok(())
            }
            Frame::CancelPush { push_id } => {
                if let Some(promise) = self.promises.remove(&push_id) {
                    self.events.on_push_cancel(promise.user_data);
                }
                Ok(())
            }
            Frame::Settings(peer) => {
                self.settings.merge(&peer);
                Ok(())
            }
            Frame::PushPromise { push_id, block } => {
                self.on_push_promise_frame(stream, push_id, &block, fin)
            }
            Frame::Goaway { last_stream_id } => {
                log::debug!("peer going away after stream {last_stream_id}");
                Ok(())
            }
            Frame::MaxPushId { push_id } => {
                if self.role != Role::Server {
                    return Err(Error::MalformedFrame);
                }
                if self.max_push_promise > push_id {
                    return Err(Error::MalformedFrame);
                }
                self.max_push_promise = push_id;
                Ok(())
            }
        }
    }

    fn on_headers_frame(&mut self, stream: &mut Stream, block: &[u8], fin: bool) -> Result<()> {
        let mut first_headers = false;
        match stream.recv_state {
            StreamState::Open => {
                stream.recv_state = StreamState::Headers;
                first_headers = true;
            }
            StreamState::Headers => {}
            StreamState::Body => {
                if !stream.trailers_promised {
                    return Err(Error::TrailersNotPromised);
                }
                stream.recv_state = StreamState::Trailers;
            }
            StreamState::Trailers => {}
            StreamState::Done => {
                log::error!("received HEADERS but receive state is done");
                return Err(Error::RequestClosed);
            }
        }

        let headers = self.hdr_ctx.decompress(block)?;

        if first_headers {
            self.events.on_begin_headers(stream.user_data)?;
        }

        let trailers = stream.recv_state == StreamState::Trailers;
        if !trailers {
            stream.note_trailer_header(&headers);
        }

        let flags = HeaderFlags {
            end_request: fin,
            trailers,
        };
        self.deliver_headers(flags, &headers, stream.user_data)?;

        if fin {
            self.finish_recv(stream);
        }

        Ok(())
    }

    fn on_push_promise_frame(
        &mut self,
        stream: &mut Stream,
        push_id: u64,
        block: &[u8],
        fin: bool,
    ) -> Result<()> {
        if stream.recv_state == StreamState::Done {
            return Err(Error::RequestClosed);
        }

        let headers = self.hdr_ctx.decompress(block)?;

        if push_id > self.max_push_promise {
            return Err(Error::MalformedFrame);
        }

        if self.role == Role::Client
            && self.mode == Mode::Multicast
            && headers.iter().any(|h| h.is(":path", "goaway"))
            && headers.iter().any(|h| h.is("connection", "close"))
        {
            // The sender is done; close up and flush whatever packets are
            // still queued behind this one.
            log::debug!("multicast goaway detected");
            self.close(None)?;
            self.recv_buf.clear();
            self.closed = true;
            return Ok(());
        }

        let promised_user_data = self.mint_request_id();
        match self
            .events
            .on_begin_promise(stream.user_data, promised_user_data)
        {
            Ok(()) => {}
            Err(Error::NotInterested) => {
                log::debug!("push {push_id} declined");
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let mut promise = Stream::promise(push_id, promised_user_data);
        promise.recv_state = StreamState::Headers;
        promise.note_trailer_header(&headers);
        self.promises.insert(push_id, promise);

        let flags = HeaderFlags {
            end_request: fin,
            trailers: false,
        };
        self.deliver_headers(flags, &headers, promised_user_data)?;

        log::debug!("received push promise with push id {push_id}");

        Ok(())
    }

    /// Hand a header list to the application one field at a time, with the
    /// end-of-request flag held back until the last field.
    fn deliver_headers(
        &mut self,
        flags: HeaderFlags,
        headers: &[Header],
        request: RequestId,
    ) -> Result<()> {
        for (i, header) in headers.iter().enumerate() {
            let flags = HeaderFlags {
                end_request: flags.end_request && i == headers.len() - 1,
                trailers: flags.trailers,
            };
            self.events.on_headers(flags, header, request)?;
        }
        Ok(())
    }

    fn stream_closed(&mut self, stream_id: u64, app_error_code: u64) -> Result<()> {
        log::debug!("stream {stream_id} is closing with code {app_error_code:#06x}");
        let Some(mut stream) = self.transfers.remove(&stream_id) else {
            return Ok(());
        };

        let status = status_from_app_error(app_error_code);
        if !stream.close_reported {
            stream.close_reported = true;
            self.events.on_request_close(status, stream.user_data);
        }

        Ok(())
    }

    /// Walk the stream table in id order and hand queued frames to the
    /// transport packetiser.
    pub fn send(&mut self) -> Result<Status> {
        if self.transport.bytes_in_flight() >= MAX_BYTES_IN_FLIGHT {
            log::debug!("too many bytes in flight, session blocked");
            return Ok(Status::Blocked);
        }

        let mut status = self.write_send_buffer()?;

        let pending: Vec<u64> = self
            .transfers
            .iter()
            .filter(|(_, stream)| !stream.send_queue.is_empty())
            .map(|(&id, _)| id)
            .collect();

        for stream_id in pending {
            loop {
                if self.transport.bytes_in_flight() >= MAX_BYTES_IN_FLIGHT {
                    return Ok(Status::Blocked);
                }

                let max_packet = self.transport_settings.max_packet_size as usize;
                let budget = max_packet.saturating_sub(MIN_STREAM_PACKET_OVERHEAD);

                // Pack consecutive queued buffers into one transport write.
                let (data, fin) = {
                    let Some(stream) = self.transfers.get(&stream_id) else {
                        break;
                    };
                    if stream.send_queue.is_empty() {
                        break;
                    }

                    let mut data = Vec::new();
                    let mut fin = false;
                    for buf in &stream.send_queue {
                        if !data.is_empty() && data.len() + buf.remaining().len() > budget {
                            break;
                        }
                        data.extend_from_slice(buf.remaining());
                        fin |= buf.fin;
                        if data.len() >= budget {
                            break;
                        }
                    }
                    (data, fin)
                };

                let now = timestamp_now();
                let mut pkt = vec![0u8; max_packet];
                let write = match self
                    .transport
                    .write_stream(&mut pkt, stream_id, fin, &data, now)
                {
                    Ok(write) => write,
                    Err(err) if err.is_recoverable() => return Ok(status),
                    Err(err) => {
                        log::error!("write_stream failed: {err}");
                        return Err(Error::Transport(err));
                    }
                };
                if write.pkt_len == 0 {
                    return Ok(Status::Blocked);
                }

                // Retire queued buffers the transport consumed; a partially
                // consumed buffer keeps its cursor and fin flag.
                let mut fin_sent = false;
                {
                    let stream = self.transfers.get_mut(&stream_id).ok_or(Error::Internal)?;
                    let mut consumed = write.consumed;
                    while consumed > 0 {
                        let Some(front) = stream.send_queue.front_mut() else {
                            log::error!("transport consumed more than was queued");
                            return Err(Error::Internal);
                        };
                        let remaining = front.remaining().len();
                        if consumed >= remaining {
                            consumed -= remaining;
                            fin_sent |= front.fin;
                            stream.send_queue.pop_front();
                        } else {
                            front.advance(consumed);
                            consumed = 0;
                        }
                    }
                }

                pkt.truncate(write.pkt_len);
                self.send_buf.push_back(pkt);
                self.update_timers()?;
                status = self.write_send_buffer()?;

                if fin_sent {
                    log::debug!("ending stream {stream_id}");
                    let stream = self.transfers.get_mut(&stream_id).ok_or(Error::Internal)?;
                    stream.send_state = StreamState::Done;
                    if !stream.close_reported {
                        stream.close_reported = true;
                        let close_status = stream.status.clone();
                        let user_data = stream.user_data;
                        self.events.on_request_close(close_status, user_data);
                    }
                }

                // A packet that consumed no stream bytes means the stream
                // is stalled at the transport; move on.
                if write.consumed == 0 {
                    break;
                }
            }
        }

        Ok(status)
    }

    /// Flush queued packets to the socket callback. A multicast sender also
    /// fabricates an ACK for each packet it emits.
    fn write_send_buffer(&mut self) -> Result<Status> {
        let mut status = Status::NoMoreData;

        while let Some(pkt) = self.send_buf.pop_front() {
            if self.handshake_complete {
                let written = match self.events.send(&pkt) {
                    Ok(written) => written,
                    Err(err) => {
                        self.send_buf.push_front(pkt);
                        return Err(err);
                    }
                };
                if written == 0 {
                    self.send_buf.push_front(pkt);
                    return Ok(Status::Blocked);
                }
                if written != pkt.len() {
                    log::error!("socket accepted a partial packet");
                    self.send_buf.push_front(pkt);
                    return Err(Error::Internal);
                }
            }

            if self.mode == Mode::Multicast && self.role == Role::Server {
                if let Some(header) = multicast::decode_short_header(&pkt, self.session_id.len())
                {
                    self.fake_ack(header);
                }
            }

            status = Status::Ok;
        }

        Ok(status)
    }

    /// Feed an ACK for our own transmission back into the receive queue so
    /// the transport's loss detection stays quiet.
    fn fake_ack(&mut self, header: multicast::ShortHeader) {
        let largest = multicast::reconstruct_pkt_num(
            self.last_remote_pkt_num,
            header.pkt_num,
            header.pkt_num_len,
        );
        self.last_remote_pkt_num = largest;

        let pkt =
            multicast::fake_ack_packet(self.role, &self.session_id, self.remote_pktnum, largest);
        self.remote_pktnum = self.remote_pktnum.wrapping_add(1);
        self.recv_buf.push_back(pkt);
    }

    /// Submit a request (client only). In multicast mode there is exactly
    /// one synthetic request; submitting binds the caller's handle to it.
    pub fn submit_request(
        &mut self,
        headers: &[Header],
        body: Option<&[u8]>,
        fin: bool,
        request: RequestId,
    ) -> Result<()> {
        if self.role != Role::Client {
            return Err(Error::ClientOnly);
        }

        if self.mode == Mode::Multicast {
            if let Some(stream) = self.transfers.get_mut(&INIT_REQUEST_STREAM_ID) {
                stream.user_data = request;
            }
            return Ok(());
        }

        if self.max_open_requests <= self.open_request_count() {
            return Err(Error::TooManyRequests);
        }

        let stream_id = self.transport.open_bidi_stream()?;
        self.highest_bidi_stream_id = self.highest_bidi_stream_id.max(stream_id);
        self.transfers
            .insert(stream_id, Stream::with_id(stream_id, request));

        if let Err(err) = self.feed_headers(headers, fin && body.is_none(), request) {
            self.transfers.remove(&stream_id);
            return Err(err);
        }

        if let Some(body) = body {
            self.feed_payload_data(body, fin, request)?;
        }

        Ok(())
    }

    /// Announce a pushed response (server only). The promised stream opens
    /// later, on the first `feed_headers` addressed at `promised`.
    pub fn submit_push_promise(
        &mut self,
        init_request: RequestId,
        headers: &[Header],
        promised: RequestId,
    ) -> Result<()> {
        if self.role != Role::Server {
            return Err(Error::ServerOnly);
        }

        if self.next_push_promise >= self.max_push_promise {
            return Err(Error::PushLimitReached);
        }

        // Push promises are announced on a request stream; multicast mode
        // pins that to the initial request stream.
        let init_stream_id = if self.mode == Mode::Multicast {
            INIT_REQUEST_STREAM_ID
        } else {
            self.find_transfer(init_request).ok_or(Error::BadUserData)?
        };

        let push_id = self.next_push_promise;
        log::debug!("creating push promise {push_id} with {} headers", headers.len());

        let block = self.hdr_ctx.compress(headers);
        let frame = Frame::PushPromise {
            push_id,
            block,
        };

        let init_stream = self
            .transfers
            .get_mut(&init_stream_id)
            .ok_or(Error::BadUserData)?;
        init_stream.queue(frame.to_vec(), false);

        self.next_push_promise += 1;
        self.promises.insert(push_id, Stream::promise(push_id, promised));

        Ok(())
    }

    /// Queue a HEADERS frame for a request, a response, or the first frame
    /// of a promised push stream.
    pub fn feed_headers(&mut self, headers: &[Header], fin: bool, request: RequestId) -> Result<()> {
        if let Some(stream_id) = self.find_transfer(request) {
            let block = self.hdr_ctx.compress(headers);
            let stream = self.transfers.get_mut(&stream_id).ok_or(Error::Internal)?;

            match stream.send_state {
                StreamState::Open => {
                    stream.note_trailer_header(headers);
                    stream.send_state = StreamState::Headers;
                }
                StreamState::Headers => stream.note_trailer_header(headers),
                StreamState::Body => {
                    if !stream.trailers_promised {
                        return Err(Error::TrailersNotPromised);
                    }
                    stream.send_state = StreamState::Trailers;
                }
                StreamState::Trailers => {}
                StreamState::Done => {
                    log::error!("tried to send headers on a closed stream");
                    return Err(Error::RequestClosed);
                }
            }

            stream.queue(Frame::Headers { block }.to_vec(), fin);
            return Ok(());
        }

        let Some(push_id) = self.find_promise(request) else {
            return Err(Error::BadUserData);
        };

        // First headers of a push: open the unidirectional stream now.
        log::debug!("feeding {} headers for push promise {push_id}", headers.len());
        if self.max_open_server_pushes <= self.open_push_count() {
            return Err(Error::TooManyRequests);
        }

        let stream_id = self.transport.open_uni_stream()?;
        self.highest_uni_stream_id = self.highest_uni_stream_id.max(stream_id);

        let mut stream = self.promises.remove(&push_id).ok_or(Error::Internal)?;
        stream.stream_id = Some(stream_id);
        stream.send_state = StreamState::Headers;
        stream.note_trailer_header(headers);

        let block = self.hdr_ctx.compress(headers);
        let mut data = frame::push_stream_header(push_id);
        Frame::Headers { block }.encode(&mut data);
        stream.queue(data, fin);

        log::debug!("push promise {push_id} will be sent on stream {stream_id}");
        self.transfers.insert(stream_id, stream);

        Ok(())
    }

    /// Queue a DATA frame. Returns the number of payload bytes accepted.
    pub fn feed_payload_data(
        &mut self,
        data: &[u8],
        fin: bool,
        request: RequestId,
    ) -> Result<usize> {
        let stream_id = self.find_transfer(request).ok_or(Error::BadUserData)?;
        let stream = self.transfers.get_mut(&stream_id).ok_or(Error::Internal)?;

        log::debug!(
            "feeding {}{} bytes of payload data for stream {stream_id}",
            if fin { "final " } else { "" },
            data.len(),
        );

        if stream.send_state > StreamState::Body {
            return Err(Error::RequestClosed);
        }
        stream.send_state = StreamState::Body;

        let frame = Frame::Data {
            payload: data.to_vec(),
        };
        stream.queue(frame.to_vec(), fin);

        Ok(data.len())
    }

    /// Finish a request early. A started stream shuts down cleanly; a
    /// not-yet-started promise is withdrawn with CANCEL_PUSH on our
    /// control stream.
    pub fn end_request(&mut self, request: RequestId) -> Result<()> {
        if let Some(stream_id) = self.find_transfer(request) {
            self.transport
                .shutdown_stream(stream_id, app_error::HTTP_NO_ERROR)?;
            return Ok(());
        }

        let Some(push_id) = self.find_promise(request) else {
            return Err(Error::RequestClosed);
        };
        self.promises.remove(&push_id);

        let control = match self.role {
            Role::Client => CONTROL_CLIENT,
            Role::Server => CONTROL_SERVER,
        };
        self.queue_send_frame(control, Frame::CancelPush { push_id }.to_vec())
    }

    /// Rebind the application handle of a live request or pending promise.
    pub fn set_request_user_data(&mut self, current: RequestId, new: RequestId) -> Result<()> {
        if let Some(stream_id) = self.find_transfer(current) {
            log::debug!("setting request user data for stream {stream_id}");
            self.transfers.get_mut(&stream_id).ok_or(Error::Internal)?.user_data = new;
            return Ok(());
        }

        let push_id = self.find_promise(current).ok_or(Error::BadUserData)?;
        log::debug!("setting request user data for push promise {push_id}");
        self.promises.get_mut(&push_id).ok_or(Error::Internal)?.user_data = new;
        Ok(())
    }

    pub fn max_client_requests(&self) -> u64 {
        self.max_open_requests
    }

    pub fn set_max_client_requests(&mut self, max: u64) -> Result<()> {
        self.max_open_requests = max;
        Ok(())
    }

    pub fn max_pushed(&self) -> u64 {
        self.max_open_server_pushes
    }

    pub fn set_max_pushed(&mut self, max: u64) -> Result<()> {
        self.max_open_server_pushes = max;
        Ok(())
    }

    /// Remaining promise budget.
    pub fn max_promises(&self) -> u64 {
        self.max_push_promise - self.next_push_promise
    }

    /// Raise the peer's push budget by `extra` promises (client only).
    pub fn set_max_promises(&mut self, extra: u64) -> Result<()> {
        if self.role != Role::Client {
            return Err(Error::ClientOnly);
        }
        if self.next_push_promise + extra < self.max_push_promise {
            return Err(Error::InvalidPushLimit);
        }

        self.max_push_promise = self.next_push_promise + extra;

        let frame = Frame::MaxPushId {
            push_id: self.max_push_promise,
        };
        self.queue_send_frame(CONTROL_CLIENT, frame.to_vec())
    }

    /// Encode our transport parameters for out-of-band delivery to peers.
    pub fn transport_params(&self) -> Result<Vec<u8>> {
        let mut params = self.transport.local_transport_params();

        if self.mode == Mode::Multicast {
            params.initial_max_streams_uni = MULTICAST_MAX_UNI_STREAM_ID;
            params.initial_max_streams_bidi = INIT_REQUEST_STREAM_ID;
            params.active_connection_id_limit = 0;
        }

        let mut buf = Vec::new();
        params.encode(&mut buf);
        Ok(buf)
    }

    /// Apply a peer's out-of-band transport parameters.
    pub fn feed_transport_params(&mut self, buf: &[u8]) -> Result<()> {
        let params = TransportParams::decode(&mut &buf[..]).map_err(|err| {
            log::error!("decoding transport params failed: {err}");
            Error::TransportProtocol
        })?;

        log::debug!("applying remote transport parameters: {params:?}");
        self.transport
            .set_remote_transport_params(&params)
            .map_err(Error::from)
    }

    /// Pick our protocol out of a client's length-prefixed ALPN offer
    /// (server only).
    pub fn select_alpn<'a>(&self, offered: &'a [u8]) -> Result<&'a [u8]> {
        if self.role != Role::Server {
            return Err(Error::ServerOnly);
        }
        alpn::select(offered)
    }

    /// Close the session. Running requests are cancelled; a multicast
    /// sender additionally announces a goaway push so receivers notice.
    pub fn close(&mut self, reason: Option<Error>) -> Result<()> {
        log::debug!("closing session: {reason:?}");

        let open: Vec<u64> = self
            .transfers
            .range(INIT_REQUEST_STREAM_ID + 1..)
            .map(|(&id, _)| id)
            .collect();
        for stream_id in open {
            self.cancel_stream(stream_id, app_error::HTTP_REQUEST_CANCELLED);
        }

        match (self.mode, self.role) {
            (Mode::Multicast, Role::Server) => {
                if self.transfers.contains_key(&INIT_REQUEST_STREAM_ID) {
                    self.submit_goaway_push()?;
                }
            }
            (Mode::Multicast, Role::Client) => {
                self.cancel_stream(INIT_REQUEST_STREAM_ID, app_error::HTTP_REQUEST_CANCELLED);
            }
            (Mode::Unicast, _) => {
                let now = timestamp_now();
                let mut pkt = vec![0u8; self.transport_settings.max_packet_size as usize];
                let written = self
                    .transport
                    .write_connection_close(&mut pkt, app_error::HTTP_NO_ERROR, now)
                    .map_err(Error::from)?;
                pkt.truncate(written);
                self.send_buf.push_back(pkt);
            }
        }

        Ok(())
    }

    /// The goaway exchange of the multicast profile: a push promise for
    /// `:path goaway` with `connection: close`, plus its response.
    fn submit_goaway_push(&mut self) -> Result<()> {
        let init_user_data = self
            .transfers
            .get(&INIT_REQUEST_STREAM_ID)
            .map(|s| s.user_data)
            .ok_or(Error::Internal)?;

        let request = [
            Header::new(":method", "GET"),
            Header::new(":scheme", "http"),
            Header::new(":path", "goaway"),
            Header::new("connection", "close"),
        ];
        let response = [
            Header::new(":status", "200"),
            Header::new("connection", "close"),
        ];

        let goaway_handle = self.mint_request_id();
        self.submit_push_promise(init_user_data, &request, goaway_handle)?;
        self.feed_headers(&response, true, goaway_handle)
    }

    fn cancel_stream(&mut self, stream_id: u64, code: u64) {
        let Some(mut stream) = self.transfers.remove(&stream_id) else {
            return;
        };

        log::debug!("cancelling stream {stream_id} with code {code:#06x}");
        let status = status_from_app_error(code);
        if !stream.close_reported {
            stream.close_reported = true;
            self.events.on_request_close(status, stream.user_data);
        }
    }

    /// Host-driven timer expiry.
    pub fn timer_expired(&mut self, kind: TimerKind) -> Result<()> {
        self.timers.expired(kind);
        self.dispatch_timer(kind)
    }

    /// Reconcile the transport's expiry timestamps with the host timers,
    /// dispatching any deadline that has already passed. A timer that fires
    /// while being armed is dispatched here too, after the reconciliation
    /// pass, never from inside the arming callback.
    fn update_timers(&mut self) -> Result<()> {
        if !self.handshake_complete {
            return Ok(());
        }

        let now = timestamp_now();
        let mut due = Vec::new();

        let loss = self.transport.loss_detection_expiry();
        if self
            .timers
            .adjust(&mut self.events, TimerKind::LossDetection, loss, now)
        {
            due.push(TimerKind::LossDetection);
        }

        let ack = self.transport.ack_delay_expiry();
        if self
            .timers
            .adjust(&mut self.events, TimerKind::AckDelay, ack, now)
        {
            due.push(TimerKind::AckDelay);
        }

        for kind in due {
            self.dispatch_timer(kind)?;
        }

        Ok(())
    }

    fn dispatch_timer(&mut self, kind: TimerKind) -> Result<()> {
        let now = timestamp_now();
        match kind {
            TimerKind::LossDetection => self
                .transport
                .on_loss_detection_timer(now)
                .map_err(Error::from),
            TimerKind::AckDelay => {
                let mut pkt = vec![0u8; self.transport_settings.max_packet_size as usize];
                let written = self.transport.write_pkt(&mut pkt, now).map_err(Error::from)?;
                if written > 0 {
                    pkt.truncate(written);
                    self.send_buf.push_back(pkt);
                    self.write_send_buffer()?;
                }
                Ok(())
            }
        }
    }

    fn queue_send_frame(&mut self, stream_id: u64, data: Vec<u8>) -> Result<()> {
        let stream = self.transfers.get_mut(&stream_id).ok_or(Error::Internal)?;
        stream.queue(data, false);
        Ok(())
    }

    fn find_transfer(&self, request: RequestId) -> Option<u64> {
        self.transfers
            .iter()
            .find(|(_, stream)| stream.user_data == request)
            .map(|(&id, _)| id)
    }

    fn find_promise(&self, request: RequestId) -> Option<u64> {
        self.promises
            .iter()
            .find(|(_, stream)| stream.user_data == request)
            .map(|(&id, _)| id)
    }

    fn open_request_count(&self) -> u64 {
        self.transfers
            .iter()
            .filter(|(&id, stream)| {
                id % 4 == 0 && id != HANDSHAKE_STREAM_ID && stream.started
            })
            .count() as u64
    }

    fn open_push_count(&self) -> u64 {
        self.transfers
            .values()
            .filter(|stream| stream.push_id.is_some() && stream.started)
            .count() as u64
    }
}

/// Map a QUIC application error code onto the terminal status reported to
/// the application. `None` is a clean close.
fn status_from_app_error(code: u64) -> Option<Error> {
    match code {
        app_error::STOPPING | app_error::HTTP_NO_ERROR => None,
        app_error::HTTP_PUSH_REFUSED => Some(Error::PushRefused),
        app_error::HTTP_INTERNAL_ERROR => Some(Error::Internal),
        app_error::HTTP_PUSH_ALREADY_IN_CACHE => Some(Error::PushAlreadyInCache),
        app_error::HTTP_REQUEST_CANCELLED => Some(Error::NotInterested),
        app_error::HTTP_HPACK_DECOMPRESSION_FAILED => Some(Error::HeaderCompression),
        app_error::HTTP_CONNECT_ERROR => Some(Error::HttpConnect),
        app_error::HTTP_EXCESSIVE_LOAD => None,
        app_error::HTTP_VERSION_FALLBACK => Some(Error::TransportVersion),
        app_error::HTTP_WRONG_STREAM => Some(Error::WrongStream),
        app_error::HTTP_PUSH_LIMIT_EXCEEDED => Some(Error::PushLimitReached),
        app_error::HTTP_DUPLICATE_PUSH => Some(Error::DuplicatePush),
        code if code & app_error::HTTP_MALFORMED_FRAME != 0 => Some(Error::MalformedFrame),
        _ => {
            log::error!("unknown HTTP/QUIC error code {code:#06x}");
            Some(Error::Internal)
        }
    }
}

/// The application error code used when resetting a stream over `err`.
fn app_error_code(err: &Error) -> u64 {
    match err {
        Error::MalformedFrame => app_error::HTTP_MALFORMED_FRAME,
        Error::WrongStream => app_error::HTTP_WRONG_STREAM,
        Error::HeaderCompression => app_error::HTTP_HPACK_DECOMPRESSION_FAILED,
        Error::NotInterested | Error::RequestClosed => app_error::HTTP_REQUEST_CANCELLED,
        Error::PushLimitReached => app_error::HTTP_PUSH_LIMIT_EXCEEDED,
        Error::PushRefused => app_error::HTTP_PUSH_REFUSED,
        Error::PushAlreadyInCache => app_error::HTTP_PUSH_ALREADY_IN_CACHE,
        _ => app_error::HTTP_INTERNAL_ERROR,
    }
}

/// Copy received bytes into the non-DATA frames whose gaps they fill.
fn fill_control_frames(stream: &mut Stream) -> bool {
    let Stream {
        active_frames,
        recv_bufs,
        ..
    } = stream;

    let mut progress = false;
    for frame in active_frames.iter_mut() {
        if frame.kind == FrameKind::DATA {
            continue;
        }

        loop {
            let mut filled = false;
            for gap in frame.gaps.clone() {
                let stream_off = frame.offset + gap.begin;
                let Some((available, _)) = recv_bufs.read_at(stream_off) else {
                    continue;
                };
                let want = ((gap.end - gap.begin) as usize).min(available.len());
                let taken = frame.fill(gap.begin, &available[..want]);
                recv_bufs.pop(stream_off, taken);
                filled = true;
                progress = true;
            }
            if !filled {
                break;
            }
        }
    }

    progress
}
