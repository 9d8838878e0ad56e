#![allow(dead_code)]

//! Shared test plumbing: an in-memory transport the session can be
//! driven against deterministically, plus a recording handler whose
//! callbacks land in a shared log.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};

use quicmux::codec::Frame;
use quicmux::compress::{decode_fields, encode_field_section, split_field_section};
use quicmux::consts::*;
use quicmux::transport::{
    QuicTransport, ReadChunk, StreamId, TransportError, TransportEvent, TransportInfo,
};
use quicmux::types::WireVariant;
use quicmux::varint::encode_varint;
use quicmux::{
    ByteEventKind, Handler, HandlerProvider, Header, Message, Priority, Session, SessionConfig,
    SessionError, Transaction,
};

/// Client-initiated stream ids by QUIC convention: bidirectional
/// 0, 4, 8, ...; unidirectional 2, 6, 10, ...
pub const PEER_CONTROL: StreamId = 2;
pub const PEER_ENCODER: StreamId = 6;
pub const PEER_DECODER: StreamId = 10;

#[derive(Debug, Default)]
pub struct MockStream {
    pub read_buf: BytesMut,
    pub read_fin: bool,
    pub written: BytesMut,
    pub write_fin: bool,
    pub send_window: u64,
    pub recv_window: Option<u64>,
    pub reset: Option<u64>,
    pub stop: Option<u64>,
    pub priority: Option<Priority>,
    pub registered: Vec<u64>,
}

#[derive(Debug)]
struct Inner {
    streams: HashMap<StreamId, MockStream>,
    conn_window: u64,
    default_stream_window: u64,
    next_uni: StreamId,
    opened_uni: Vec<StreamId>,
    info: TransportInfo,
    fail_registration: bool,
    /// Per-call cap on how many bytes `write_chain` accepts.
    write_limit: Option<usize>,
}

/// Deterministic in-memory transport. Clones share state so a test can
/// keep a handle after the session takes ownership.
#[derive(Clone)]
pub struct MockTransport {
    inner: Rc<RefCell<Inner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_windows(1 << 20, 1 << 20)
    }

    pub fn with_windows(conn_window: u64, stream_window: u64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                streams: HashMap::new(),
                conn_window,
                default_stream_window: stream_window,
                // Server-initiated unidirectional ids.
                next_uni: 3,
                opened_uni: Vec::new(),
                info: TransportInfo {
                    rtt_micros: 25_000,
                    congestion_window: 14_520,
                    packets_retransmitted: 0,
                },
                fail_registration: false,
                write_limit: None,
            })),
        }
    }

    fn ensure<'a>(inner: &'a mut Inner, id: StreamId) -> &'a mut MockStream {
        let window = inner.default_stream_window;
        inner.streams.entry(id).or_insert_with(|| MockStream {
            send_window: window,
            ..MockStream::default()
        })
    }

    pub fn push_read(&self, id: StreamId, data: &[u8], fin: bool) {
        let mut inner = self.inner.borrow_mut();
        let stream = Self::ensure(&mut inner, id);
        stream.read_buf.extend_from_slice(data);
        if fin {
            stream.read_fin = true;
        }
    }

    pub fn written(&self, id: StreamId) -> Bytes {
        self.inner
            .borrow()
            .streams
            .get(&id)
            .map(|s| Bytes::copy_from_slice(&s.written))
            .unwrap_or_default()
    }

    pub fn written_len(&self, id: StreamId) -> u64 {
        self.inner
            .borrow()
            .streams
            .get(&id)
            .map(|s| s.written.len() as u64)
            .unwrap_or(0)
    }

    pub fn write_fin(&self, id: StreamId) -> bool {
        self.inner
            .borrow()
            .streams
            .get(&id)
            .map(|s| s.write_fin)
            .unwrap_or(false)
    }

    pub fn reset_code(&self, id: StreamId) -> Option<u64> {
        self.inner.borrow().streams.get(&id).and_then(|s| s.reset)
    }

    pub fn stop_code(&self, id: StreamId) -> Option<u64> {
        self.inner.borrow().streams.get(&id).and_then(|s| s.stop)
    }

    pub fn priority_of(&self, id: StreamId) -> Option<Priority> {
        self.inner
            .borrow()
            .streams
            .get(&id)
            .and_then(|s| s.priority)
    }

    pub fn registered_offsets(&self, id: StreamId) -> Vec<u64> {
        self.inner
            .borrow()
            .streams
            .get(&id)
            .map(|s| s.registered.clone())
            .unwrap_or_default()
    }

    pub fn opened_uni(&self) -> Vec<StreamId> {
        self.inner.borrow().opened_uni.clone()
    }

    pub fn set_stream_window(&self, id: StreamId, window: u64) {
        let mut inner = self.inner.borrow_mut();
        Self::ensure(&mut inner, id).send_window = window;
    }

    pub fn set_conn_window(&self, window: u64) {
        self.inner.borrow_mut().conn_window = window;
    }

    pub fn set_fail_registration(&self, fail: bool) {
        self.inner.borrow_mut().fail_registration = fail;
    }

    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.inner.borrow_mut().write_limit = limit;
    }

    /// Bytes pushed for reading that the session has not consumed.
    pub fn unread_len(&self, id: StreamId) -> usize {
        self.inner
            .borrow()
            .streams
            .get(&id)
            .map(|s| s.read_buf.len())
            .unwrap_or(0)
    }
}

impl QuicTransport for MockTransport {
    fn read(&mut self, id: StreamId, max: usize) -> Result<ReadChunk, TransportError> {
        let mut inner = self.inner.borrow_mut();
        let stream = inner
            .streams
            .get_mut(&id)
            .ok_or(TransportError::UnknownStream)?;
        let take = stream.read_buf.len().min(max);
        let data = stream.read_buf.split_to(take).freeze();
        let fin = stream.read_fin && stream.read_buf.is_empty();
        Ok(ReadChunk { data, fin })
    }

    fn write_chain(
        &mut self,
        id: StreamId,
        data: Bytes,
        eom: bool,
    ) -> Result<usize, TransportError> {
        let mut inner = self.inner.borrow_mut();
        let limit = inner.write_limit;
        let stream = Self::ensure(&mut inner, id);
        let take = limit.map_or(data.len(), |l| data.len().min(l));
        stream.written.extend_from_slice(&data[..take]);
        if eom && take == data.len() {
            stream.write_fin = true;
        }
        Ok(take)
    }

    fn notify_pending_write(&mut self, _id: StreamId) {}

    fn reset_stream(&mut self, id: StreamId, error_code: u64) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        Self::ensure(&mut inner, id).reset = Some(error_code);
        Ok(())
    }

    fn stop_sending(&mut self, id: StreamId, error_code: u64) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        Self::ensure(&mut inner, id).stop = Some(error_code);
        Ok(())
    }

    fn set_stream_priority(
        &mut self,
        id: StreamId,
        priority: Priority,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        Self::ensure(&mut inner, id).priority = Some(priority);
        Ok(())
    }

    fn stream_send_window(&self, id: StreamId) -> Result<u64, TransportError> {
        let mut inner = self.inner.borrow_mut();
        Ok(Self::ensure(&mut inner, id).send_window)
    }

    fn set_stream_receive_window(
        &mut self,
        id: StreamId,
        window: u64,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        Self::ensure(&mut inner, id).recv_window = Some(window);
        Ok(())
    }

    fn connection_send_window(&self) -> u64 {
        self.inner.borrow().conn_window
    }

    fn written_offset(&self, id: StreamId) -> Result<u64, TransportError> {
        self.inner
            .borrow()
            .streams
            .get(&id)
            .map(|s| s.written.len() as u64)
            .ok_or(TransportError::UnknownStream)
    }

    fn register_delivery_callback(
        &mut self,
        id: StreamId,
        offset: u64,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_registration {
            return Err(TransportError::InvalidOperation(
                "registration disabled".to_string(),
            ));
        }
        Self::ensure(&mut inner, id).registered.push(offset);
        Ok(())
    }

    fn open_uni_stream(&mut self) -> Result<StreamId, TransportError> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_uni;
        inner.next_uni += 4;
        Self::ensure(&mut inner, id);
        inner.opened_uni.push(id);
        Ok(id)
    }

    fn transport_info(&self) -> TransportInfo {
        self.inner.borrow().info
    }
}

// ---- handler plumbing ----

#[derive(Debug, Clone, PartialEq)]
pub enum Ev {
    Headers(Message),
    Body(Bytes),
    ChunkHeader(u64),
    ChunkComplete,
    Eom,
    Error(String),
    EgressPaused,
    EgressResumed,
    Byte(ByteEventKind),
    BodyRejected(u64),
    Detach,
}

pub type Log = Rc<RefCell<Vec<(StreamId, Ev)>>>;

pub fn new_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

pub fn events_for(log: &Log, id: StreamId) -> Vec<Ev> {
    log.borrow()
        .iter()
        .filter(|(s, _)| *s == id)
        .map(|(_, e)| e.clone())
        .collect()
}

pub fn count(log: &Log, id: StreamId, matcher: impl Fn(&Ev) -> bool) -> usize {
    events_for(log, id).iter().filter(|e| matcher(e)).count()
}

/// Canned response a [`RecordingHandler`] sends back on headers.
#[derive(Debug, Clone)]
pub struct Respond {
    pub status: u16,
    pub body: Bytes,
    pub declare_length: bool,
}

impl Respond {
    pub fn ok(body: &'static [u8]) -> Self {
        Self {
            status: 200,
            body: Bytes::from_static(body),
            declare_length: true,
        }
    }
}

/// Logs every callback under the stream id it fired on; optionally sends
/// a canned response when the request headers arrive.
pub struct RecordingHandler {
    log: Log,
    stream: StreamId,
    respond: Option<Respond>,
}

impl RecordingHandler {
    pub fn new(log: Log, respond: Option<Respond>) -> Self {
        Self {
            log,
            stream: u64::MAX,
            respond,
        }
    }

    fn push(&self, ev: Ev) {
        self.log.borrow_mut().push((self.stream, ev));
    }
}

impl Handler for RecordingHandler {
    fn on_headers_complete(&mut self, txn: &mut Transaction<'_>, msg: Message) {
        self.stream = txn.stream_id().unwrap_or(u64::MAX);
        self.push(Ev::Headers(msg));
        if let Some(respond) = self.respond.clone() {
            let mut head = Message::response(respond.status);
            if respond.declare_length {
                head = head.header("content-length", respond.body.len().to_string());
            }
            txn.send_headers(&head).expect("send headers");
            if !respond.body.is_empty() {
                txn.send_body(respond.body).expect("send body");
            }
            txn.send_eom().expect("send eom");
        }
    }

    fn on_body(&mut self, _txn: &mut Transaction<'_>, chunk: Bytes) {
        self.push(Ev::Body(chunk));
    }

    fn on_body_rejected(&mut self, _txn: &mut Transaction<'_>, offset: u64) {
        self.push(Ev::BodyRejected(offset));
    }

    fn on_chunk_header(&mut self, _txn: &mut Transaction<'_>, len: u64) {
        self.push(Ev::ChunkHeader(len));
    }

    fn on_chunk_complete(&mut self, _txn: &mut Transaction<'_>) {
        self.push(Ev::ChunkComplete);
    }

    fn on_eom(&mut self, _txn: &mut Transaction<'_>) {
        self.push(Ev::Eom);
    }

    fn on_error(&mut self, _txn: &mut Transaction<'_>, error: &SessionError) {
        self.push(Ev::Error(error.to_string()));
    }

    fn on_egress_paused(&mut self, _txn: &mut Transaction<'_>) {
        self.push(Ev::EgressPaused);
    }

    fn on_egress_resumed(&mut self, _txn: &mut Transaction<'_>) {
        self.push(Ev::EgressResumed);
    }

    fn on_byte_event(&mut self, _txn: &mut Transaction<'_>, event: ByteEventKind) {
        self.push(Ev::Byte(event));
    }

    fn on_detach(&mut self) {
        self.push(Ev::Detach);
    }
}

/// Provider built from a closure, so tests can hand out arbitrary
/// handlers per request.
pub struct FnProvider<F>(pub F);

impl<F> HandlerProvider for FnProvider<F>
where
    F: FnMut(&Message) -> Box<dyn Handler>,
{
    fn new_handler(&mut self, msg: &Message) -> Box<dyn Handler> {
        (self.0)(msg)
    }
}

pub fn provider<F>(f: F) -> Box<dyn HandlerProvider>
where
    F: FnMut(&Message) -> Box<dyn Handler> + 'static,
{
    Box::new(FnProvider(f))
}

/// Provider whose handlers log into `log` and answer every request with
/// `respond`.
pub fn responder(log: Log, respond: Respond) -> Box<dyn HandlerProvider> {
    provider(move |_| Box::new(RecordingHandler::new(log.clone(), Some(respond.clone()))))
}

/// Provider whose handlers only log; no response is ever sent.
pub fn silent(log: Log) -> Box<dyn HandlerProvider> {
    provider(move |_| Box::new(RecordingHandler::new(log.clone(), None)))
}

// ---- session setup ----

pub fn session(
    variant: WireVariant,
    transport: MockTransport,
    provider: Box<dyn HandlerProvider>,
) -> Session<MockTransport> {
    session_with_config(SessionConfig::new(variant), transport, provider)
}

pub fn session_with_config(
    config: SessionConfig,
    transport: MockTransport,
    provider: Box<dyn HandlerProvider>,
) -> Session<MockTransport> {
    let mut session = Session::new(transport, config, provider);
    session.start().expect("session start");
    session
}

/// Deliver bytes on a stream and turn the loop once.
pub fn deliver(
    session: &mut Session<MockTransport>,
    transport: &MockTransport,
    id: StreamId,
    data: &[u8],
    fin: bool,
) {
    transport.push_read(id, data, fin);
    session.on_transport_event(TransportEvent::Readable(id));
    session.run_loop_turn();
}

// ---- wire builders ----

pub fn varint_bytes(value: u64) -> Bytes {
    let mut buf = BytesMut::new();
    encode_varint(&mut buf, value);
    buf.freeze()
}

pub fn request_fields(method: &str, path: &str) -> Vec<Header> {
    vec![
        Header::new(":method", method),
        Header::new(":path", path),
    ]
}

pub fn headers_frame(required_insert_count: u64, fields: &[Header]) -> Bytes {
    Frame::new(
        FRAME_HEADERS,
        encode_field_section(required_insert_count, fields),
    )
    .to_bytes()
}

pub fn get_request(path: &str) -> Bytes {
    headers_frame(0, &request_fields("GET", path))
}

pub fn data_frame(payload: &[u8]) -> Bytes {
    Frame::new(FRAME_DATA, Bytes::copy_from_slice(payload)).to_bytes()
}

/// Control stream opening: type preface plus a SETTINGS frame.
pub fn control_opening(settings: &[(u64, u64)]) -> Bytes {
    let mut buf = BytesMut::new();
    encode_varint(&mut buf, STREAM_TYPE_CONTROL);
    Frame::settings(settings).serialize(&mut buf);
    buf.freeze()
}

pub fn uni_preface(stream_type: u64) -> Bytes {
    varint_bytes(stream_type)
}

// ---- wire inspection ----

pub fn parse_frames(buf: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        match Frame::parse(&buf[offset..]) {
            Some((frame, consumed)) => {
                frames.push(frame);
                offset += consumed;
            }
            None => break,
        }
    }
    frames
}

/// Decode the field list of a HEADERS frame payload.
pub fn decode_headers_frame(frame: &Frame) -> Vec<Header> {
    assert_eq!(frame.frame_type, FRAME_HEADERS, "not a HEADERS frame");
    let section = split_field_section(&frame.payload).expect("well-formed section");
    decode_fields(&section.payload).expect("well-formed fields")
}

pub fn status_of(fields: &[Header]) -> Option<u16> {
    fields
        .iter()
        .find(|h| h.name == ":status")
        .and_then(|h| h.value.parse().ok())
}

/// Status of the first HEADERS frame written on a stream.
pub fn response_status(transport: &MockTransport, id: StreamId) -> Option<u16> {
    let written = transport.written(id);
    let frames = parse_frames(&written);
    frames
        .iter()
        .find(|f| f.frame_type == FRAME_HEADERS)
        .and_then(|f| status_of(&decode_headers_frame(f)))
}

/// Concatenated DATA payloads written on a stream.
pub fn response_body(transport: &MockTransport, id: StreamId) -> Bytes {
    let written = transport.written(id);
    let mut body = BytesMut::new();
    for frame in parse_frames(&written) {
        if frame.frame_type == FRAME_DATA {
            body.extend_from_slice(&frame.payload);
        }
    }
    body.freeze()
}
