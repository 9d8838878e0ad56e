//! The session dispatcher: one instance per accepted connection.
//!
//! The session owns the stream table and drives everything from
//! transport events: it admits new streams, feeds ingress to the
//! per-stream codec, routes decoded events to the bound transaction
//! handlers, and flushes generated egress under flow control. All state
//! is driven by `&mut self` from a single loop; handler callbacks that
//! re-enter the session (including `drop_connection`) are made safe by
//! taking the handler out of its record for the duration of the call and
//! deferring stream removal until the dispatch stack unwinds.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::{BufMut, Bytes, BytesMut};
use slab::Slab;
use tracing::{debug, info, trace, warn};

use crate::codec::{CodecError, CodecEvent, FilterChain, Frame, IngressFilter};
use crate::compress::{encode_field_section, DecodeOutcome, HeaderCoordinator};
use crate::consts::*;
use crate::drain::{DrainController, DrainState};
use crate::egress::{validate_rejection, ByteEventKind, DeliveryLedger, EgressBuffer, SegmentKind};
use crate::flow::FlowAccountant;
use crate::push::PushManager;
use crate::stream::{StreamKind, StreamRecord, StreamState};
use crate::transport::{
    QuicTransport, StreamId, TransportError, TransportEvent, TransportInfo,
};
use crate::txn::{Handler, HandlerProvider, PushInfo, Transaction, TxnId, TxnTransport};
use crate::types::{
    ConnectionFatalKind, Header, Message, Priority, SessionError, StreamFatalKind, WireVariant,
};
use crate::varint::{decode_varint, encode_varint};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub variant: WireVariant,
    /// Streams visited per loop turn before yielding, so one busy stream
    /// cannot starve the rest.
    pub max_reads_per_loop: usize,
    pub read_chunk: usize,
    pub ingress_buffer_limit: usize,
    pub qpack_max_table_capacity: u64,
    pub max_field_section_size: u64,
    pub qpack_blocked_streams: u64,
}

impl SessionConfig {
    pub fn new(variant: WireVariant) -> Self {
        Self {
            variant,
            max_reads_per_loop: DEFAULT_MAX_READS_PER_LOOP,
            read_chunk: DEFAULT_READ_CHUNK,
            ingress_buffer_limit: DEFAULT_INGRESS_BUFFER_LIMIT,
            qpack_max_table_capacity: DEFAULT_QPACK_MAX_TABLE_CAPACITY,
            max_field_section_size: DEFAULT_MAX_FIELD_SECTION_SIZE,
            qpack_blocked_streams: DEFAULT_QPACK_BLOCKED_STREAMS,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(WireVariant::H3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UniKind {
    /// Preface varint not complete yet.
    Pending,
    Control,
    Encoder,
    Decoder,
    /// Grease or otherwise unknown type; bytes are discarded.
    Ignored,
}

#[derive(Debug)]
struct UniStream {
    kind: UniKind,
    buf: BytesMut,
}

impl UniStream {
    fn new() -> Self {
        Self {
            kind: UniKind::Pending,
            buf: BytesMut::new(),
        }
    }
}

/// Client-initiated unidirectional stream, by QUIC stream id convention.
fn is_peer_uni(id: StreamId) -> bool {
    id & 0x3 == 0x2
}

fn stale_txn() -> SessionError {
    SessionError::StreamFatal(StreamFatalKind::WriteError(
        "transaction is no longer attached".to_string(),
    ))
}

/// Flatten a message head into the on-wire field list, pseudo-fields
/// first.
fn field_list(msg: &Message) -> Vec<Header> {
    let mut fields = Vec::with_capacity(msg.headers.len() + 2);
    if let Some(status) = msg.status {
        fields.push(Header::new(":status", status.to_string()));
    }
    if let Some(method) = &msg.method {
        fields.push(Header::new(":method", method.clone()));
    }
    if let Some(path) = &msg.path {
        fields.push(Header::new(":path", path.clone()));
    }
    fields.extend(msg.headers.iter().cloned());
    fields
}

fn message_from_fields(fields: Vec<Header>) -> Message {
    let mut msg = Message::default();
    for field in fields {
        match field.name.as_str() {
            ":method" => msg.method = Some(field.value),
            ":path" => msg.path = Some(field.value),
            ":status" => msg.status = field.value.parse().ok(),
            _ => msg.headers.push(field),
        }
    }
    msg
}

pub struct Session<T: QuicTransport> {
    transport: T,
    config: SessionConfig,
    provider: Box<dyn HandlerProvider>,

    streams: Slab<StreamRecord>,
    by_id: HashMap<StreamId, usize>,
    next_generation: u64,

    flow: FlowAccountant,
    compress: HeaderCoordinator,
    drain: DrainController,
    pushes: PushManager,
    filters: FilterChain,

    /// Peer-initiated unidirectional streams (control, instruction,
    /// grease), outside the transaction stream table.
    uni_ingress: HashMap<StreamId, UniStream>,
    control_seen: bool,
    encoder_seen: bool,
    decoder_seen: bool,
    our_control: Option<StreamId>,
    our_encoder: Option<StreamId>,
    our_decoder: Option<StreamId>,
    settings_received: bool,
    peer_max_field_section: Option<u64>,

    /// Rotation of streams with pending transport data; serviced in
    /// arrival order, re-queued at the back when data remains.
    readable: VecDeque<StreamId>,
    readable_set: HashSet<StreamId>,

    /// Legacy variant carries the whole connection on one stream.
    legacy_stream: Option<StreamId>,
    /// Highest request-stream id admitted and serviced; names the hard
    /// GOAWAY cutoff.
    highest_serviced: Option<StreamId>,

    pending_resume: Vec<(usize, u64)>,
    deferred_removals: Vec<(usize, u64)>,
    callback_depth: usize,
    pending_drop: bool,
    close_on_idle: bool,
    closed: bool,
}

impl<T: QuicTransport> Session<T> {
    pub fn new(transport: T, config: SessionConfig, provider: Box<dyn HandlerProvider>) -> Self {
        let connection_window = transport.connection_send_window();
        let table_capacity = match config.variant {
            WireVariant::H3 => config.qpack_max_table_capacity,
            _ => 0,
        };
        Self {
            transport,
            flow: FlowAccountant::new(connection_window),
            compress: HeaderCoordinator::new(table_capacity),
            drain: DrainController::new(config.variant),
            pushes: PushManager::new(),
            filters: FilterChain::new(),
            provider,
            streams: Slab::new(),
            by_id: HashMap::new(),
            next_generation: 1,
            uni_ingress: HashMap::new(),
            control_seen: false,
            encoder_seen: false,
            decoder_seen: false,
            our_control: None,
            our_encoder: None,
            our_decoder: None,
            settings_received: false,
            peer_max_field_section: None,
            readable: VecDeque::new(),
            readable_set: HashSet::new(),
            legacy_stream: None,
            highest_serviced: None,
            pending_resume: Vec::new(),
            deferred_removals: Vec::new(),
            callback_depth: 0,
            pending_drop: false,
            close_on_idle: false,
            closed: false,
            config,
        }
    }

    /// Open the local control and instruction streams and send SETTINGS.
    /// No-op for the legacy variant.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if !self.config.variant.uses_control_stream() {
            return Ok(());
        }
        let control = self
            .transport
            .open_uni_stream()
            .map_err(SessionError::from_connection_transport)?;
        let mut buf = BytesMut::new();
        encode_varint(&mut buf, STREAM_TYPE_CONTROL);
        Frame::settings(&self.local_settings()).serialize(&mut buf);
        self.transport
            .write_chain(control, buf.freeze(), false)
            .map_err(SessionError::from_connection_transport)?;
        self.our_control = Some(control);
        self.drain.mark_settings_sent().map_err(SessionError::from)?;

        if self.config.variant == WireVariant::H3 {
            let encoder = self
                .transport
                .open_uni_stream()
                .map_err(SessionError::from_connection_transport)?;
            let mut buf = BytesMut::new();
            encode_varint(&mut buf, STREAM_TYPE_QPACK_ENCODER);
            self.transport
                .write_chain(encoder, buf.freeze(), false)
                .map_err(SessionError::from_connection_transport)?;
            self.our_encoder = Some(encoder);

            let decoder = self
                .transport
                .open_uni_stream()
                .map_err(SessionError::from_connection_transport)?;
            let mut buf = BytesMut::new();
            encode_varint(&mut buf, STREAM_TYPE_QPACK_DECODER);
            self.transport
                .write_chain(decoder, buf.freeze(), false)
                .map_err(SessionError::from_connection_transport)?;
            self.our_decoder = Some(decoder);
        }
        info!(variant = ?self.config.variant, "session started");
        Ok(())
    }

    pub fn variant(&self) -> WireVariant {
        self.config.variant
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn add_filter(&mut self, filter: Box<dyn IngressFilter>) {
        self.filters.push(filter);
    }

    pub fn num_outgoing_streams(&self) -> usize {
        let pushes = self
            .streams
            .iter()
            .filter(|(_, r)| r.kind == StreamKind::Push)
            .count();
        let locals = [self.our_control, self.our_encoder, self.our_decoder]
            .iter()
            .flatten()
            .count();
        pushes + locals
    }

    pub fn current_transport_info(&self) -> TransportInfo {
        self.transport.transport_info()
    }

    pub fn drain_state(&self) -> DrainState {
        self.drain.state()
    }

    pub fn max_allowed_push_id(&self) -> Option<u64> {
        self.pushes.max_allowed_push_id()
    }

    /// Begin a graceful drain: an unbounded soft GOAWAY now, then a hard
    /// GOAWAY naming the highest serviced stream id once every open
    /// stream finishes. On the legacy variant this announces
    /// `Connection: close` on the next response instead.
    pub fn notify_pending_shutdown(&mut self) {
        self.initiate_shutdown();
    }

    /// Close the connection as soon as no streams remain.
    pub fn close_when_idle(&mut self) {
        self.close_on_idle = true;
        self.maybe_close_idle();
    }

    /// Tear the connection down now, delivering one error per open
    /// transaction. Deferred when called from inside a callback.
    pub fn drop_connection(&mut self) {
        self.initiate_drop();
    }

    /// Priority hint for a request stream.
    pub fn on_priority(&mut self, id: StreamId, priority: Priority) {
        if self.by_id.contains_key(&id) {
            if let Err(e) = self.transport.set_stream_priority(id, priority) {
                warn!(stream = id, error = %e, "priority update failed");
            }
        } else {
            warn!(stream = id, "priority update for unknown stream, ignoring");
        }
    }

    /// Priority hint addressed by push id. Push streams carry no implicit
    /// priority until one is set this way or through the transaction.
    pub fn on_push_priority(&mut self, push_id: u64, priority: Priority) {
        match self.pushes.stream_for(push_id) {
            Some(stream) => {
                if let Err(e) = self.transport.set_stream_priority(stream, priority) {
                    warn!(push_id, error = %e, "push priority update failed");
                }
            }
            None => warn!(push_id, "priority update for unknown push id, ignoring"),
        }
    }

    /// Feed one transport event. Processing that needs the loop (reads,
    /// flushes, resumes) happens on the next `run_loop_turn`.
    pub fn on_transport_event(&mut self, event: TransportEvent) {
        if self.closed {
            return;
        }
        match event {
            TransportEvent::Readable(id) => self.mark_readable(id),
            TransportEvent::WriteReady(id) => {
                if let Some(&slot) = self.by_id.get(&id) {
                    self.flush_stream(slot);
                }
            }
            TransportEvent::FlowControlUpdate(id) => {
                let window = self.transport.stream_send_window(id).unwrap_or(0);
                self.flow.on_window_update(id, window);
            }
            TransportEvent::ConnectionFlowControlUpdate => {
                let window = self.transport.connection_send_window();
                self.flow.on_connection_window_update(window);
            }
            TransportEvent::StreamReset(id, code) => self.on_stream_reset(id, code),
            TransportEvent::StopSending(id, code) => self.on_stop_sending(id, code),
            TransportEvent::ConnectionError(err) => {
                self.teardown(SessionError::from_connection_transport(err));
            }
            TransportEvent::DeliveryAck(id, offset) => self.on_delivery(id, offset, false),
            TransportEvent::DeliveryCancel(id, offset) => self.on_delivery(id, offset, true),
            TransportEvent::DataRejected(id, offset) => self.on_data_rejected(id, offset),
            TransportEvent::TransactionTimeout(id) => self.on_txn_timeout(id),
        }
    }

    /// One turn of the connection loop: drain deferred ingress resumes,
    /// service readable streams under the per-turn read budget, flush
    /// egress, coalesce flow-control resumes, apply deferred removals.
    pub fn run_loop_turn(&mut self) {
        if self.closed {
            return;
        }
        self.drain_pending_resume();
        if self.closed {
            return;
        }
        let mut reads = 0;
        while reads < self.config.max_reads_per_loop {
            let id = match self.readable.pop_front() {
                Some(id) => id,
                None => break,
            };
            self.readable_set.remove(&id);
            reads += 1;
            let more = self.service_readable(id);
            if self.closed {
                return;
            }
            if more && self.readable_set.insert(id) {
                self.readable.push_back(id);
            }
        }
        self.flush_all();
        if self.closed {
            return;
        }
        self.resume_flow_paused();
        if self.closed {
            return;
        }
        self.apply_deferred_actions();
        // Close-out ordering matters: a hard GOAWAY emitted this turn
        // leaves the session in Closing until the next turn, so late
        // streams are still refused with a reset instead of silence.
        self.finish_closing();
        self.check_drain_progress();
        self.maybe_close_idle();
    }

    fn local_settings(&self) -> Vec<(u64, u64)> {
        vec![
            (
                SETTINGS_QPACK_MAX_TABLE_CAPACITY,
                self.config.qpack_max_table_capacity,
            ),
            (
                SETTINGS_MAX_FIELD_SECTION_SIZE,
                self.config.max_field_section_size,
            ),
            (
                SETTINGS_QPACK_BLOCKED_STREAMS,
                self.config.qpack_blocked_streams,
            ),
        ]
    }

    fn slot_live(&self, slot: usize, generation: u64) -> bool {
        self.streams
            .get(slot)
            .map(|r| r.generation == generation)
            .unwrap_or(false)
    }

    fn valid_slot(&self, txn: TxnId) -> Option<usize> {
        if self.closed {
            return None;
        }
        self.streams
            .get(txn.slot)
            .filter(|r| r.generation == txn.generation && !r.detached)
            .map(|_| txn.slot)
    }

    // ---- stream admission and ingress ----

    fn mark_readable(&mut self, id: StreamId) {
        if self.closed {
            return;
        }
        if id & 0x1 == 0x1 && !self.by_id.contains_key(&id) {
            // Locally-initiated ids never carry peer-initiated data.
            trace!(stream = id, "readable on a local stream id, ignoring");
            return;
        }
        if !self.by_id.contains_key(&id) && !self.uni_ingress.contains_key(&id) {
            if is_peer_uni(id) {
                if self.config.variant.uses_control_stream() {
                    self.uni_ingress.insert(id, UniStream::new());
                } else {
                    warn!(stream = id, "unidirectional stream on legacy connection, refusing");
                    let _ = self.transport.stop_sending(id, H3_STREAM_CREATION_ERROR);
                    return;
                }
            } else if !self.admit_request_stream(id) {
                return;
            }
        }
        if self.readable_set.insert(id) {
            self.readable.push_back(id);
        }
    }

    fn admit_request_stream(&mut self, id: StreamId) -> bool {
        if self.config.variant == WireVariant::Legacy {
            match self.legacy_stream {
                Some(existing) if existing != id => {
                    warn!(stream = id, "legacy connection already bound to a stream, rejecting");
                    let _ = self.transport.reset_stream(id, H3_REQUEST_REJECTED);
                    let _ = self.transport.stop_sending(id, H3_REQUEST_REJECTED);
                    return false;
                }
                None => self.legacy_stream = Some(id),
                _ => {}
            }
        }
        if !self.drain.accepts_stream(id) {
            debug!(stream = id, "stream beyond GOAWAY cutoff, rejecting");
            let _ = self.transport.reset_stream(id, H3_REQUEST_REJECTED);
            let _ = self.transport.stop_sending(id, H3_REQUEST_REJECTED);
            return false;
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let record = StreamRecord::new(
            id,
            generation,
            StreamKind::Request,
            self.config.variant,
            self.config.ingress_buffer_limit,
        );
        let window = self.transport.stream_send_window(id).unwrap_or(0);
        let slot = self.streams.insert(record);
        self.by_id.insert(id, slot);
        self.flow.register_stream(id, window);
        if let Err(e) = self
            .transport
            .set_stream_receive_window(id, self.config.ingress_buffer_limit as u64)
        {
            warn!(stream = id, error = %e, "could not announce receive window");
        }
        self.highest_serviced = Some(self.highest_serviced.map_or(id, |h| h.max(id)));
        trace!(stream = id, slot, "request stream admitted");
        true
    }

    fn service_readable(&mut self, id: StreamId) -> bool {
        if self.uni_ingress.contains_key(&id) {
            self.service_uni(id)
        } else if let Some(&slot) = self.by_id.get(&id) {
            self.service_request(slot)
        } else {
            false
        }
    }

    fn service_request(&mut self, slot: usize) -> bool {
        let (id, paused, budget) = match self.streams.get(slot) {
            Some(rec) => (rec.id, rec.ingress_paused, rec.ingress_budget()),
            None => return false,
        };
        let max = if paused {
            budget.min(self.config.read_chunk)
        } else {
            self.config.read_chunk
        };
        if max == 0 {
            // Ingress buffer full; reads restart when the transaction
            // resumes.
            return false;
        }
        let chunk = match self.transport.read(id, max) {
            Ok(chunk) => chunk,
            Err(TransportError::WouldBlock) | Err(TransportError::UnknownStream) => return false,
            Err(e) => {
                self.stream_error(slot, SessionError::from_stream_transport(e));
                return false;
            }
        };
        let full = chunk.data.len() == max;
        if paused {
            match self.streams.get_mut(slot) {
                Some(rec) => {
                    rec.ingress_buf.extend_from_slice(&chunk.data);
                    if chunk.fin {
                        rec.fin_buffered = true;
                    }
                    return full && !chunk.fin && rec.ingress_budget() > 0;
                }
                None => return false,
            }
        }
        if chunk.data.is_empty() && !chunk.fin {
            return false;
        }
        self.feed_codec(slot, &chunk.data, chunk.fin);
        full && !chunk.fin && !self.closed
    }

    fn feed_codec(&mut self, slot: usize, data: &[u8], fin: bool) {
        let (generation, result, events) = match self.streams.get_mut(slot) {
            Some(rec) => {
                if fin {
                    rec.fin_seen = true;
                }
                let mut events = Vec::new();
                let result = rec.codec.on_ingress(data, fin, &mut events);
                (rec.generation, result, events)
            }
            None => return,
        };
        // Events decoded before a parse failure are still delivered.
        for event in events {
            if self.closed || !self.slot_live(slot, generation) {
                return;
            }
            self.dispatch_codec_event(slot, event);
        }
        if let Err(err) = result {
            if !self.closed && self.slot_live(slot, generation) {
                self.on_codec_error(slot, err);
            }
        }
    }

    fn dispatch_codec_event(&mut self, slot: usize, event: CodecEvent) {
        let id = match self.streams.get(slot) {
            Some(rec) => rec.id,
            None => return,
        };
        let event = match self.filters.apply(id, event) {
            Some(event) => event,
            None => return,
        };
        let blocked = self
            .streams
            .get(slot)
            .map(|r| r.blocked_on_headers)
            .unwrap_or(false);
        if blocked {
            // Per-stream order: everything behind a blocked header block
            // waits with it.
            if let Some(rec) = self.streams.get_mut(slot) {
                rec.pending_events.push_back(event);
            }
            return;
        }
        self.handle_codec_event(slot, event);
    }

    fn handle_codec_event(&mut self, slot: usize, event: CodecEvent) {
        match event {
            CodecEvent::MessageBegin => {}
            CodecEvent::HeadersComplete(msg) => self.bind_and_deliver(slot, msg),
            CodecEvent::EncodedHeaders(section) => {
                let id = match self.streams.get(slot) {
                    Some(rec) => rec.id,
                    None => return,
                };
                match self.compress.decode_or_queue(id, section) {
                    Ok(DecodeOutcome::Ready(fields)) => {
                        let msg = message_from_fields(fields);
                        self.bind_and_deliver(slot, msg);
                    }
                    Ok(DecodeOutcome::Blocked) => {
                        if let Some(rec) = self.streams.get_mut(slot) {
                            rec.blocked_on_headers = true;
                        }
                    }
                    Err(e) => self.stream_error(
                        slot,
                        SessionError::StreamFatal(StreamFatalKind::ParseError(e.to_string())),
                    ),
                }
            }
            CodecEvent::Body(chunk) => {
                self.with_handler(slot, move |h, txn| h.on_body(txn, chunk));
            }
            CodecEvent::ChunkHeader(len) => {
                self.with_handler(slot, move |h, txn| h.on_chunk_header(txn, len));
            }
            CodecEvent::ChunkComplete => {
                self.with_handler(slot, |h, txn| h.on_chunk_complete(txn));
            }
            CodecEvent::MessageComplete => {
                if let Some(rec) = self.streams.get_mut(slot) {
                    rec.close_ingress();
                }
                self.with_handler(slot, |h, txn| h.on_eom(txn));
                self.check_stream_done(slot);
            }
        }
    }

    fn bind_and_deliver(&mut self, slot: usize, msg: Message) {
        if self.config.variant == WireVariant::Legacy && msg.wants_connection_close() {
            self.close_on_idle = true;
            self.drain.on_close_echoed();
        }
        if let Some(len) = msg.content_length() {
            if let Some(rec) = self.streams.get_mut(slot) {
                rec.codec.set_expected_body_length(len);
            }
        }
        let handler = self.provider.new_handler(&msg);
        if let Some(rec) = self.streams.get_mut(slot) {
            rec.handler = Some(handler);
            rec.handler_bound = true;
        }
        self.with_handler(slot, move |h, txn| h.on_headers_complete(txn, msg));
    }

    fn on_codec_error(&mut self, slot: usize, err: CodecError) {
        let err = match (self.config.variant, err) {
            // The legacy variant answers malformed messages with a plain
            // HTTP error; the framed variants treat the same condition as
            // a fatal stream error.
            (WireVariant::Legacy, err @ CodecError::BodyLengthMismatch { .. })
            | (WireVariant::Legacy, err @ CodecError::BadMessage(_)) => SessionError::Recoverable {
                status: Some(400),
                message: err.to_string(),
            },
            (_, CodecError::UnexpectedFrame(frame_type)) => {
                SessionError::ConnectionFatal(ConnectionFatalKind::FrameUnexpected(format!(
                    "frame type 0x{:x} on a request stream",
                    frame_type
                )))
            }
            (_, err) => SessionError::StreamFatal(StreamFatalKind::ParseError(err.to_string())),
        };
        self.stream_error(slot, err);
    }

    // ---- unidirectional streams ----

    fn service_uni(&mut self, id: StreamId) -> bool {
        let max = self.config.read_chunk;
        let chunk = match self.transport.read(id, max) {
            Ok(chunk) => chunk,
            Err(TransportError::WouldBlock) | Err(TransportError::UnknownStream) => return false,
            Err(e) => {
                self.teardown(SessionError::from_connection_transport(e));
                return false;
            }
        };
        let full = chunk.data.len() == max;
        let fin = chunk.fin;
        match self.uni_ingress.get_mut(&id) {
            Some(uni) => uni.buf.extend_from_slice(&chunk.data),
            None => return false,
        }
        self.process_uni(id, fin);
        full && !fin && !self.closed
    }

    fn process_uni(&mut self, id: StreamId, fin: bool) {
        let mut drop_pending = false;
        let preface = match self.uni_ingress.get_mut(&id) {
            Some(uni) if uni.kind == UniKind::Pending => match decode_varint(&uni.buf) {
                Some((stream_type, consumed)) => {
                    let _ = uni.buf.split_to(consumed);
                    Some(stream_type)
                }
                None => {
                    if fin {
                        drop_pending = true;
                    }
                    None
                }
            },
            Some(_) => None,
            None => return,
        };
        if drop_pending {
            self.uni_ingress.remove(&id);
            return;
        }
        if let Some(stream_type) = preface {
            if !self.classify_uni(id, stream_type) {
                return;
            }
        }
        let kind = match self.uni_ingress.get(&id) {
            Some(uni) => uni.kind,
            None => return,
        };
        match kind {
            UniKind::Pending => {}
            UniKind::Control => self.process_control(id, fin),
            UniKind::Encoder => self.process_encoder_instructions(id, fin),
            UniKind::Decoder => self.process_decoder_instructions(id, fin),
            UniKind::Ignored => {
                if let Some(uni) = self.uni_ingress.get_mut(&id) {
                    uni.buf.clear();
                }
                if fin {
                    self.uni_ingress.remove(&id);
                }
            }
        }
    }

    fn classify_uni(&mut self, id: StreamId, stream_type: u64) -> bool {
        let kind = match stream_type {
            STREAM_TYPE_CONTROL => {
                if self.control_seen {
                    self.teardown(SessionError::ConnectionFatal(
                        ConnectionFatalKind::StreamCreation(
                            "duplicate control stream".to_string(),
                        ),
                    ));
                    return false;
                }
                self.control_seen = true;
                UniKind::Control
            }
            STREAM_TYPE_QPACK_ENCODER if self.config.variant == WireVariant::H3 => {
                if self.encoder_seen {
                    self.teardown(SessionError::ConnectionFatal(
                        ConnectionFatalKind::StreamCreation(
                            "duplicate encoder stream".to_string(),
                        ),
                    ));
                    return false;
                }
                self.encoder_seen = true;
                UniKind::Encoder
            }
            STREAM_TYPE_QPACK_DECODER if self.config.variant == WireVariant::H3 => {
                if self.decoder_seen {
                    self.teardown(SessionError::ConnectionFatal(
                        ConnectionFatalKind::StreamCreation(
                            "duplicate decoder stream".to_string(),
                        ),
                    ));
                    return false;
                }
                self.decoder_seen = true;
                UniKind::Decoder
            }
            other => {
                debug!(stream = id, stream_type = other, "ignoring unknown unidirectional stream");
                let _ = self.transport.stop_sending(id, H3_STREAM_CREATION_ERROR);
                UniKind::Ignored
            }
        };
        if let Some(uni) = self.uni_ingress.get_mut(&id) {
            uni.kind = kind;
        }
        true
    }

    fn process_control(&mut self, id: StreamId, fin: bool) {
        loop {
            let frame = {
                let uni = match self.uni_ingress.get_mut(&id) {
                    Some(uni) => uni,
                    None => return,
                };
                match Frame::parse(&uni.buf) {
                    Some((frame, consumed)) => {
                        let _ = uni.buf.split_to(consumed);
                        frame
                    }
                    None => break,
                }
            };
            self.on_control_frame(frame);
            if self.closed {
                return;
            }
        }
        if fin {
            self.teardown(SessionError::ConnectionFatal(
                ConnectionFatalKind::ClosedCriticalStream(
                    "peer control stream closed".to_string(),
                ),
            ));
        }
    }

    fn on_control_frame(&mut self, frame: Frame) {
        if !self.settings_received && frame.frame_type != FRAME_SETTINGS {
            self.teardown(SessionError::ConnectionFatal(
                ConnectionFatalKind::FrameUnexpected(
                    "first control frame is not SETTINGS".to_string(),
                ),
            ));
            return;
        }
        match frame.frame_type {
            FRAME_SETTINGS => {
                if self.settings_received {
                    self.teardown(SessionError::ConnectionFatal(
                        ConnectionFatalKind::FrameUnexpected("duplicate SETTINGS".to_string()),
                    ));
                    return;
                }
                self.settings_received = true;
                match Frame::parse_settings(&frame.payload) {
                    Ok(settings) => self.apply_peer_settings(settings),
                    Err(e) => self.teardown(SessionError::ConnectionFatal(
                        ConnectionFatalKind::FrameUnexpected(e.to_string()),
                    )),
                }
            }
            FRAME_GOAWAY => match Frame::parse_varint_payload(&frame.payload) {
                Ok(push_limit) => {
                    info!(push_limit, "peer GOAWAY");
                    self.pushes.on_peer_goaway(push_limit);
                }
                Err(e) => self.teardown(SessionError::ConnectionFatal(
                    ConnectionFatalKind::FrameUnexpected(e.to_string()),
                )),
            },
            FRAME_MAX_PUSH_ID => match Frame::parse_varint_payload(&frame.payload) {
                Ok(limit) => self.pushes.on_max_push_id(limit),
                Err(e) => self.teardown(SessionError::ConnectionFatal(
                    ConnectionFatalKind::FrameUnexpected(e.to_string()),
                )),
            },
            FRAME_CANCEL_PUSH => match Frame::parse_varint_payload(&frame.payload) {
                Ok(push_id) => self.on_cancel_push(push_id),
                Err(e) => self.teardown(SessionError::ConnectionFatal(
                    ConnectionFatalKind::FrameUnexpected(e.to_string()),
                )),
            },
            FRAME_DATA | FRAME_HEADERS | FRAME_PUSH_PROMISE => {
                self.teardown(SessionError::ConnectionFatal(
                    ConnectionFatalKind::FrameUnexpected(format!(
                        "frame type 0x{:x} on the control stream",
                        frame.frame_type
                    )),
                ));
            }
            other => trace!(frame_type = other, "ignoring unknown control frame"),
        }
    }

    fn apply_peer_settings(&mut self, settings: Vec<(u64, u64)>) {
        for &(setting, value) in &settings {
            match setting {
                SETTINGS_QPACK_MAX_TABLE_CAPACITY => {
                    let capacity = value.min(self.config.qpack_max_table_capacity);
                    if let Err(e) = self.compress.set_table_capacity(capacity) {
                        warn!(capacity, error = %e, "table capacity change refused");
                    }
                }
                SETTINGS_MAX_FIELD_SECTION_SIZE => {
                    self.peer_max_field_section = Some(value);
                }
                SETTINGS_QPACK_BLOCKED_STREAMS => {}
                other => trace!(setting = other, value, "ignoring unknown setting"),
            }
        }
        debug!(count = settings.len(), "peer settings applied");
    }

    /// Peer encoder instructions: each varint announces newly arrived
    /// table insertions, advancing the ack horizon that releases blocked
    /// header blocks. The increment is echoed on our decoder stream.
    fn process_encoder_instructions(&mut self, id: StreamId, fin: bool) {
        loop {
            let increment = {
                let uni = match self.uni_ingress.get_mut(&id) {
                    Some(uni) => uni,
                    None => return,
                };
                match decode_varint(&uni.buf) {
                    Some((value, consumed)) => {
                        let _ = uni.buf.split_to(consumed);
                        value
                    }
                    None => break,
                }
            };
            let horizon = self.compress.horizon() + increment;
            self.compress.on_decoder_ack(horizon);
            if let Some(decoder) = self.our_decoder {
                let mut buf = BytesMut::new();
                encode_varint(&mut buf, increment);
                let _ = self.transport.write_chain(decoder, buf.freeze(), false);
            }
        }
        self.process_released();
        if fin && !self.closed {
            self.teardown(SessionError::ConnectionFatal(
                ConnectionFatalKind::ClosedCriticalStream(
                    "peer encoder stream closed".to_string(),
                ),
            ));
        }
    }

    /// Peer decoder instructions: each varint names a stream whose egress
    /// header block was acknowledged, unpinning its table references.
    fn process_decoder_instructions(&mut self, id: StreamId, fin: bool) {
        loop {
            let stream = {
                let uni = match self.uni_ingress.get_mut(&id) {
                    Some(uni) => uni,
                    None => return,
                };
                match decode_varint(&uni.buf) {
                    Some((value, consumed)) => {
                        let _ = uni.buf.split_to(consumed);
                        value
                    }
                    None => break,
                }
            };
            self.compress.on_block_acknowledged(stream);
        }
        if fin {
            self.teardown(SessionError::ConnectionFatal(
                ConnectionFatalKind::ClosedCriticalStream(
                    "peer decoder stream closed".to_string(),
                ),
            ));
        }
    }

    fn process_released(&mut self) {
        let released = match self.compress.release_ready() {
            Ok(released) => released,
            Err(e) => {
                self.teardown(SessionError::ConnectionFatal(
                    ConnectionFatalKind::FrameUnexpected(e.to_string()),
                ));
                return;
            }
        };
        for block in released {
            let slot = match self.by_id.get(&block.stream).copied() {
                Some(slot) => slot,
                None => continue,
            };
            if let Some(rec) = self.streams.get_mut(slot) {
                rec.blocked_on_headers = false;
            }
            let fields = match block.headers {
                Some(fields) => fields,
                // Cancelled while blocked: drained, no callback.
                None => continue,
            };
            let generation = match self.streams.get(slot) {
                Some(rec) => rec.generation,
                None => continue,
            };
            self.bind_and_deliver(slot, message_from_fields(fields));
            // Drain the events that were parked behind the block, unless
            // a later block re-blocks the stream.
            loop {
                if self.closed || !self.slot_live(slot, generation) {
                    break;
                }
                if self
                    .streams
                    .get(slot)
                    .map(|r| r.blocked_on_headers)
                    .unwrap_or(true)
                {
                    break;
                }
                let event = match self
                    .streams
                    .get_mut(slot)
                    .and_then(|r| r.pending_events.pop_front())
                {
                    Some(event) => event,
                    None => break,
                };
                self.handle_codec_event(slot, event);
            }
        }
    }

    fn on_cancel_push(&mut self, push_id: u64) {
        match self.pushes.stream_for(push_id) {
            Some(stream) => {
                if let Some(&slot) = self.by_id.get(&stream) {
                    self.stream_error(
                        slot,
                        SessionError::StreamFatal(StreamFatalKind::StopSending(
                            H3_REQUEST_CANCELLED,
                        )),
                    );
                }
            }
            None => debug!(push_id, "CANCEL_PUSH for unknown push id, ignoring"),
        }
    }

    // ---- egress ----

    fn flush_all(&mut self) {
        let targets: Vec<(usize, u64)> = self
            .streams
            .iter()
            .filter(|(_, r)| !r.egress.is_drained())
            .map(|(slot, r)| (slot, r.generation))
            .collect();
        for (slot, generation) in targets {
            if self.closed {
                return;
            }
            if self.slot_live(slot, generation) {
                self.flush_stream(slot);
            }
        }
    }

    fn flush_stream(&mut self, slot: usize) {
        loop {
            if self.closed {
                return;
            }
            let (id, len, kind) = match self.streams.get(slot) {
                Some(rec) => match rec.egress.next_segment_len() {
                    Some((len, kind)) => (rec.id, len, kind),
                    None => break,
                },
                None => return,
            };
            let pull_max = if len == 0 {
                // Empty terminal framing needs no window, only the fin.
                1
            } else {
                let window = self.flow.sendable(id, len);
                // Terminal framing is all-or-nothing: a message whose
                // final bytes do not fit the window stays open.
                if window == 0 || (kind == SegmentKind::Eom && window < len) {
                    if self.flow.mark_paused(id) {
                        self.with_handler(slot, |h, txn| h.on_egress_paused(txn));
                    }
                    return;
                }
                window
            };
            let (data, eom) = match self.streams.get_mut(slot) {
                Some(rec) => match rec.egress.pull(pull_max) {
                    Some(pulled) => pulled,
                    None => break,
                },
                None => return,
            };
            let n = data.len() as u64;
            // A recyclable legacy stream outlives the message; the
            // transport fin is withheld so the next pipelined exchange
            // can reuse it.
            let wire_fin = eom && !self.legacy_keepalive(slot);
            let accepted = match self.transport.write_chain(id, data.clone(), wire_fin) {
                Ok(accepted) => (accepted as u64).min(n),
                Err(e) => {
                    self.stream_error(slot, SessionError::from_stream_transport(e));
                    return;
                }
            };
            if accepted > 0 {
                self.flow.consume_send_window(id, accepted);
            }
            let short = accepted < n;
            if short {
                // The transport took only a prefix; the tail returns to
                // the front of the queue and the fin is not committed
                // until every byte is accepted.
                let tail = data.slice(accepted as usize..);
                match self.streams.get_mut(slot) {
                    Some(rec) => rec.egress.unpull(tail, kind, eom),
                    None => return,
                }
            }
            let first = match self.streams.get_mut(slot) {
                Some(rec) if accepted > 0 && !rec.first_byte_flushed => {
                    rec.first_byte_flushed = true;
                    true
                }
                Some(_) => false,
                None => return,
            };
            if first {
                self.with_handler(slot, |h, txn| {
                    h.on_byte_event(txn, ByteEventKind::FirstByteFlushed)
                });
            }
            if short {
                self.transport.notify_pending_write(id);
                break;
            }
            if eom {
                self.register_last_byte(slot, id);
                if let Some(rec) = self.streams.get_mut(slot) {
                    rec.close_egress();
                }
            }
        }
        self.check_stream_done(slot);
    }

    /// Whether this stream stays open for further pipelined exchanges
    /// after the current message ends.
    fn legacy_keepalive(&self, slot: usize) -> bool {
        if self.config.variant != WireVariant::Legacy {
            return false;
        }
        match self.streams.get(slot) {
            Some(rec) => {
                rec.kind == StreamKind::Request
                    && !rec.fin_seen
                    && !self.close_on_idle
                    && !self.drain.close_announced()
            }
            None => false,
        }
    }

    fn register_last_byte(&mut self, slot: usize, id: StreamId) {
        let offset = match self.transport.written_offset(id) {
            Ok(offset) => offset,
            Err(e) => {
                self.stream_error(
                    slot,
                    SessionError::StreamFatal(StreamFatalKind::DeliveryRegistration(
                        e.to_string(),
                    )),
                );
                return;
            }
        };
        match self.transport.register_delivery_callback(id, offset) {
            Ok(()) => {
                if let Some(rec) = self.streams.get_mut(slot) {
                    rec.ledger.register(offset, ByteEventKind::LastByteAcked);
                }
            }
            Err(e) => self.stream_error(
                slot,
                SessionError::StreamFatal(StreamFatalKind::DeliveryRegistration(e.to_string())),
            ),
        }
    }

    fn resume_flow_paused(&mut self) {
        let resumed = self.flow.take_resumable();
        for id in resumed {
            let slot = match self.by_id.get(&id).copied() {
                Some(slot) => slot,
                None => continue,
            };
            self.with_handler(slot, |h, txn| h.on_egress_resumed(txn));
            if self.closed {
                return;
            }
            self.flush_stream(slot);
        }
    }

    fn send_error_response(&mut self, slot: usize, status: u16) {
        let id = match self.streams.get(slot) {
            Some(rec) => rec.id,
            None => return,
        };
        let msg = Message::response(status).header("content-length", "0");
        let encoded = self.encode_for_variant(id, &msg);
        if let Some(rec) = self.streams.get_mut(slot) {
            let head = rec.codec.generate_header(&msg, encoded);
            rec.egress.enqueue_framing(head);
            let eom = rec.codec.generate_eom();
            rec.egress.enqueue_eom(eom);
        }
        self.transport.notify_pending_write(id);
    }

    fn encode_for_variant(&mut self, id: StreamId, msg: &Message) -> Option<Bytes> {
        match self.config.variant {
            WireVariant::Legacy => None,
            WireVariant::Framed => Some(encode_field_section(0, &field_list(msg))),
            WireVariant::H3 => {
                let (block, _) = self.compress.encode_headers(id, &field_list(msg));
                Some(block)
            }
        }
    }

    // ---- errors, detach, teardown ----

    fn stream_error(&mut self, slot: usize, err: SessionError) {
        if err.is_connection_fatal() {
            self.teardown(err);
            return;
        }
        let (id, bound, egress_open) = match self.streams.get_mut(slot) {
            Some(rec) => {
                if rec.error_delivered {
                    return;
                }
                rec.error_delivered = true;
                (
                    rec.id,
                    rec.handler_bound,
                    !rec.first_byte_flushed && !rec.egress.eom_queued(),
                )
            }
            None => return,
        };
        warn!(stream = id, error = %err, "stream error");
        match &err {
            SessionError::Recoverable { status, .. } => {
                if bound {
                    let delivered = err.clone();
                    self.with_handler(slot, move |h, txn| h.on_error(txn, &delivered));
                } else if egress_open {
                    self.send_error_response(slot, status.unwrap_or(400));
                    if self.config.variant == WireVariant::Legacy {
                        // A broken legacy parse poisons the rest of the
                        // pipeline; close once the response drains.
                        self.close_on_idle = true;
                    }
                } else {
                    self.detach(slot);
                }
                if let Some(rec) = self.streams.get_mut(slot) {
                    rec.ingress_paused = true;
                }
            }
            SessionError::StreamFatal(kind) => {
                let code = match kind {
                    StreamFatalKind::ParseError(_) => H3_MESSAGE_ERROR,
                    _ => H3_REQUEST_CANCELLED,
                };
                if bound {
                    let delivered = err.clone();
                    self.with_handler(slot, move |h, txn| h.on_error(txn, &delivered));
                }
                let _ = self.transport.reset_stream(id, code);
                let _ = self.transport.stop_sending(id, code);
                self.compress.on_stream_cancelled(id);
                self.detach(slot);
            }
            SessionError::ConnectionFatal(_) => {}
        }
    }

    fn detach(&mut self, slot: usize) {
        let handler = match self.streams.get_mut(slot) {
            Some(rec) => {
                if rec.detached {
                    None
                } else {
                    rec.detached = true;
                    rec.handler.take()
                }
            }
            None => None,
        };
        if let Some(mut handler) = handler {
            handler.on_detach();
        }
        self.defer_remove(slot);
    }

    fn defer_remove(&mut self, slot: usize) {
        let generation = match self.streams.get(slot) {
            Some(rec) => rec.generation,
            None => return,
        };
        if self.callback_depth > 0 {
            self.deferred_removals.push((slot, generation));
        } else {
            self.remove_stream_now(slot);
        }
    }

    fn remove_stream_now(&mut self, slot: usize) {
        if let Some(rec) = self.streams.try_remove(slot) {
            self.by_id.remove(&rec.id);
            self.flow.unregister_stream(rec.id);
            if let Some(push_id) = rec.push_id {
                self.pushes.complete(push_id);
            }
            trace!(stream = rec.id, "stream removed");
        }
        self.check_drain_progress();
        self.maybe_close_idle();
    }

    fn apply_deferred_actions(&mut self) {
        if self.pending_drop {
            self.pending_drop = false;
            self.teardown(SessionError::ConnectionFatal(ConnectionFatalKind::Dropped));
            return;
        }
        while let Some((slot, generation)) = self.deferred_removals.pop() {
            if self.slot_live(slot, generation) {
                self.remove_stream_now(slot);
            }
            if self.closed {
                return;
            }
        }
    }

    fn teardown(&mut self, err: SessionError) {
        if self.closed {
            return;
        }
        self.closed = true;
        warn!(error = %err, "connection teardown");
        // One error per open transaction, in stable slot order.
        let slots: Vec<usize> = self.streams.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            let deliver = match self.streams.get_mut(slot) {
                Some(rec) if !rec.error_delivered => {
                    rec.error_delivered = true;
                    rec.handler_bound
                }
                _ => false,
            };
            if deliver {
                let delivered = err.clone();
                self.with_handler(slot, move |h, txn| h.on_error(txn, &delivered));
            }
            let handler = match self.streams.get_mut(slot) {
                Some(rec) => {
                    rec.detached = true;
                    rec.handler.take()
                }
                None => None,
            };
            if let Some(mut handler) = handler {
                handler.on_detach();
            }
        }
        self.streams.clear();
        self.by_id.clear();
        self.uni_ingress.clear();
        self.deferred_removals.clear();
        self.pending_resume.clear();
        self.pending_drop = false;
        self.drain.mark_closed();
    }

    fn check_drain_progress(&mut self) {
        if self.closed || self.drain.state() != DrainState::GoawaySentSoft {
            return;
        }
        if !self.streams.is_empty() {
            return;
        }
        let serviced = self.highest_serviced.unwrap_or(0);
        if let Some(hard) = self.drain.on_streams_drained(serviced) {
            let _ = self.send_control_frame(&Frame::goaway(hard));
            self.drain.mark_closing();
            info!(cutoff = hard, "hard GOAWAY sent, closing");
        }
    }

    /// A closing session still refuses late streams past the final
    /// cutoff; it reports closed once its stream table stays empty for a
    /// full loop turn.
    fn finish_closing(&mut self) {
        if self.closed || self.drain.state() != DrainState::Closing {
            return;
        }
        if self.streams.is_empty() {
            self.closed = true;
            self.drain.mark_closed();
            info!("drain complete, connection closed");
        }
    }

    fn maybe_close_idle(&mut self) {
        if self.closed || !self.close_on_idle {
            return;
        }
        if self.streams.is_empty() {
            self.closed = true;
            self.drain.mark_closed();
            info!("connection closed when idle");
        }
    }

    fn send_control_frame(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let id = self.our_control.ok_or(SessionError::ConnectionFatal(
            ConnectionFatalKind::FrameUnexpected("no local control stream".to_string()),
        ))?;
        self.transport
            .write_chain(id, frame.to_bytes(), false)
            .map_err(SessionError::from_connection_transport)?;
        Ok(())
    }

    fn initiate_shutdown(&mut self) {
        if self.closed || self.drain.is_draining() {
            return;
        }
        if self.config.variant.uses_control_stream() {
            if let Err(kind) = self.drain.goaway_permitted() {
                self.teardown(SessionError::ConnectionFatal(kind));
                return;
            }
            if let Some(soft) = self.drain.request_shutdown(MAX_CLIENT_BIDI_STREAM_ID) {
                if let Err(err) = self.send_control_frame(&Frame::goaway(soft)) {
                    self.teardown(err);
                    return;
                }
            }
            self.check_drain_progress();
        } else {
            self.drain.request_shutdown(0);
            self.close_on_idle = true;
            self.maybe_close_idle();
        }
    }

    fn initiate_drop(&mut self) {
        if self.closed {
            return;
        }
        if self.callback_depth > 0 {
            self.pending_drop = true;
        } else {
            self.teardown(SessionError::ConnectionFatal(ConnectionFatalKind::Dropped));
        }
    }

    // ---- peer-driven stream events ----

    fn on_stream_reset(&mut self, id: StreamId, code: u64) {
        if let Some(uni) = self.uni_ingress.get(&id) {
            match uni.kind {
                UniKind::Control | UniKind::Encoder | UniKind::Decoder => {
                    self.teardown(SessionError::ConnectionFatal(
                        ConnectionFatalKind::ClosedCriticalStream(format!(
                            "critical stream reset with 0x{:x}",
                            code
                        )),
                    ));
                }
                _ => {
                    self.uni_ingress.remove(&id);
                }
            }
            return;
        }
        match self.by_id.get(&id).copied() {
            Some(slot) => {
                self.stream_error(slot, SessionError::StreamFatal(StreamFatalKind::Reset(code)));
            }
            None => trace!(stream = id, "reset for unknown stream, ignoring"),
        }
    }

    fn on_stop_sending(&mut self, id: StreamId, code: u64) {
        match self.by_id.get(&id).copied() {
            Some(slot) => self.stream_error(
                slot,
                SessionError::StreamFatal(StreamFatalKind::StopSending(code)),
            ),
            None => trace!(stream = id, "STOP_SENDING for unknown stream, ignoring"),
        }
    }

    fn on_delivery(&mut self, id: StreamId, offset: u64, cancelled: bool) {
        let slot = match self.by_id.get(&id).copied() {
            Some(slot) => slot,
            None => return,
        };
        let generation = match self.streams.get(slot) {
            Some(rec) => rec.generation,
            None => return,
        };
        let fired = match self.streams.get_mut(slot) {
            Some(rec) => rec.ledger.take_through(offset),
            None => return,
        };
        for (_, kind) in fired {
            let kind = match (cancelled, kind) {
                (true, ByteEventKind::BodyDelivered(body)) => ByteEventKind::BodyCancelled(body),
                // A cancelled last byte surfaces through the reset error
                // path, not as a byte event.
                (true, ByteEventKind::LastByteAcked) => continue,
                (_, kind) => kind,
            };
            if !self.slot_live(slot, generation) {
                return;
            }
            self.with_handler(slot, move |h, txn| h.on_byte_event(txn, kind));
        }
        if self.slot_live(slot, generation) {
            self.check_stream_done(slot);
        }
    }

    fn on_data_rejected(&mut self, id: StreamId, offset: u64) {
        let slot = match self.by_id.get(&id).copied() {
            Some(slot) => slot,
            None => return,
        };
        let aligned = match self.streams.get(slot) {
            Some(rec) => {
                rec.egress.is_partially_reliable() && validate_rejection(&rec.egress, offset)
            }
            None => return,
        };
        if !aligned {
            return;
        }
        let applied = match self.streams.get_mut(slot) {
            Some(rec) => rec.egress.skip_to(offset),
            None => return,
        };
        if let Err(e) = applied {
            // Races with a local skip past the declared length.
            warn!(stream = id, offset, error = %e, "data rejection not applied");
            return;
        }
        self.with_handler(slot, move |h, txn| h.on_body_rejected(txn, offset));
        self.transport.notify_pending_write(id);
    }

    fn on_txn_timeout(&mut self, id: StreamId) {
        let slot = match self.by_id.get(&id).copied() {
            Some(slot) => slot,
            None => return,
        };
        let bound = self
            .streams
            .get(slot)
            .map(|r| r.handler_bound)
            .unwrap_or(false);
        if bound {
            self.stream_error(slot, SessionError::StreamFatal(StreamFatalKind::Timeout));
            return;
        }
        if let Some(handler) = self.provider.error_handler() {
            if let Some(rec) = self.streams.get_mut(slot) {
                rec.handler = Some(handler);
                rec.handler_bound = true;
            }
            self.stream_error(slot, SessionError::StreamFatal(StreamFatalKind::Timeout));
        } else {
            // No binding exists; answer with a plain timeout response.
            if let Some(rec) = self.streams.get_mut(slot) {
                rec.error_delivered = true;
            }
            self.send_error_response(slot, 408);
        }
    }

    // ---- transaction lifecycle plumbing ----

    fn drain_pending_resume(&mut self) {
        let pending = std::mem::take(&mut self.pending_resume);
        for (slot, generation) in pending {
            if !self.slot_live(slot, generation) {
                continue;
            }
            let (data, fin, id) = match self.streams.get_mut(slot) {
                Some(rec) => {
                    let data = rec.ingress_buf.split().freeze();
                    let fin = rec.fin_buffered;
                    rec.fin_buffered = false;
                    (data, fin, rec.id)
                }
                None => continue,
            };
            if !data.is_empty() || fin {
                self.feed_codec(slot, &data, fin);
            }
            if self.closed {
                return;
            }
            if self.slot_live(slot, generation) {
                self.mark_readable(id);
            }
        }
    }

    fn check_stream_done(&mut self, slot: usize) {
        #[derive(PartialEq)]
        enum Next {
            Nothing,
            Recycle,
            Detach,
        }
        let next = {
            let rec = match self.streams.get(slot) {
                Some(rec) => rec,
                None => return,
            };
            let egress_done =
                rec.egress.eom_queued() && rec.egress.is_drained() && rec.ledger.is_empty();
            if !egress_done {
                Next::Nothing
            } else if rec.error_delivered {
                Next::Detach
            } else {
                let ingress_done = rec.ingress_done || rec.kind == StreamKind::Push;
                if !ingress_done {
                    Next::Nothing
                } else if self.config.variant == WireVariant::Legacy
                    && rec.kind == StreamKind::Request
                    && !rec.fin_seen
                    && !self.close_on_idle
                    && !self.drain.close_announced()
                {
                    Next::Recycle
                } else {
                    Next::Detach
                }
            }
        };
        match next {
            Next::Nothing => {}
            Next::Recycle => self.recycle_legacy(slot),
            Next::Detach => self.detach(slot),
        }
    }

    /// Legacy streams carry pipelined exchanges; the record survives the
    /// exchange, only the per-message state resets.
    fn recycle_legacy(&mut self, slot: usize) {
        let handler = match self.streams.get_mut(slot) {
            Some(rec) => rec.handler.take(),
            None => return,
        };
        if let Some(mut handler) = handler {
            handler.on_detach();
        }
        if let Some(rec) = self.streams.get_mut(slot) {
            rec.handler_bound = false;
            rec.ingress_done = false;
            rec.state = StreamState::Open;
            rec.egress = EgressBuffer::new(false);
            rec.ledger = DeliveryLedger::new();
            rec.first_byte_flushed = false;
            rec.error_delivered = false;
            trace!(stream = rec.id, "legacy exchange complete, stream recycled");
        }
    }

    /// Run one handler callback with the handler taken out of its record.
    /// If the record was detached (or removed) while the callback ran,
    /// the handler gets its detach notification here instead of being
    /// restored.
    fn with_handler<F>(&mut self, slot: usize, f: F)
    where
        F: FnOnce(&mut dyn Handler, &mut Transaction<'_>),
    {
        let (generation, mut handler) = match self.streams.get_mut(slot) {
            Some(rec) => {
                let generation = rec.generation;
                match rec.handler.take() {
                    Some(handler) => (generation, handler),
                    None => return,
                }
            }
            None => return,
        };
        self.callback_depth += 1;
        {
            let id = TxnId {
                slot,
                generation,
            };
            let mut txn = Transaction::new(self, id);
            f(handler.as_mut(), &mut txn);
        }
        self.callback_depth -= 1;

        let mut leftover = Some(handler);
        if let Some(rec) = self.streams.get_mut(slot) {
            if rec.generation == generation && !rec.detached {
                rec.handler = leftover.take();
            }
        }
        if let Some(mut handler) = leftover {
            handler.on_detach();
        }
        if self.callback_depth == 0 {
            self.apply_deferred_actions();
        }
    }
}

impl<T: QuicTransport> TxnTransport for Session<T> {
    fn stream_id(&self, txn: TxnId) -> Option<StreamId> {
        self.valid_slot(txn)
            .and_then(|slot| self.streams.get(slot))
            .map(|rec| rec.id)
    }

    fn send_headers(&mut self, txn: TxnId, msg: &Message) -> Result<(), SessionError> {
        let slot = self.valid_slot(txn).ok_or_else(stale_txn)?;
        let id = match self.streams.get(slot) {
            Some(rec) => rec.id,
            None => return Err(stale_txn()),
        };
        let mut msg = msg.clone();
        if self.config.variant == WireVariant::Legacy
            && (self.drain.close_announced() || self.close_on_idle)
            && !msg.wants_connection_close()
        {
            msg.headers.push(Header::new("connection", "close"));
        }
        let encoded = self.encode_for_variant(id, &msg);
        if let (Some(block), Some(max)) = (&encoded, self.peer_max_field_section) {
            if block.len() as u64 > max {
                return Err(SessionError::Recoverable {
                    status: None,
                    message: format!(
                        "header block of {} bytes exceeds peer limit {}",
                        block.len(),
                        max
                    ),
                });
            }
        }
        if let Some(rec) = self.streams.get_mut(slot) {
            let head = rec.codec.generate_header(&msg, encoded);
            if let Some(len) = msg.content_length() {
                rec.egress.set_declared_body_length(len);
            }
            rec.egress.enqueue_framing(head);
        }
        self.transport.notify_pending_write(id);
        Ok(())
    }

    fn send_body(
        &mut self,
        txn: TxnId,
        data: Bytes,
        skippable: bool,
    ) -> Result<(), SessionError> {
        let slot = self.valid_slot(txn).ok_or_else(stale_txn)?;
        let id = match self.streams.get_mut(slot) {
            Some(rec) => {
                if rec.egress.eom_queued() {
                    return Err(SessionError::Recoverable {
                        status: None,
                        message: "body after end of message".to_string(),
                    });
                }
                let head = rec.codec.generate_chunk_header(data.len() as u64);
                rec.egress.enqueue_framing(head);
                rec.egress.enqueue_body(data, skippable);
                let terminator = rec.codec.generate_chunk_terminator();
                rec.egress.enqueue_framing(terminator);
                rec.id
            }
            None => return Err(stale_txn()),
        };
        self.transport.notify_pending_write(id);
        Ok(())
    }

    fn send_eom(&mut self, txn: TxnId) -> Result<(), SessionError> {
        let slot = self.valid_slot(txn).ok_or_else(stale_txn)?;
        let id = match self.streams.get_mut(slot) {
            Some(rec) => {
                if rec.egress.eom_queued() {
                    return Err(SessionError::Recoverable {
                        status: None,
                        message: "end of message already queued".to_string(),
                    });
                }
                let eom = rec.codec.generate_eom();
                rec.egress.enqueue_eom(eom);
                rec.id
            }
            None => return Err(stale_txn()),
        };
        self.transport.notify_pending_write(id);
        Ok(())
    }

    fn send_abort(&mut self, txn: TxnId, error_code: u64) -> Result<(), SessionError> {
        let slot = self.valid_slot(txn).ok_or_else(stale_txn)?;
        let id = match self.streams.get(slot) {
            Some(rec) => rec.id,
            None => return Err(stale_txn()),
        };
        let _ = self.transport.reset_stream(id, error_code);
        let _ = self.transport.stop_sending(id, error_code);
        self.compress.on_stream_cancelled(id);
        if let Some(rec) = self.streams.get_mut(slot) {
            rec.error_delivered = true;
        }
        self.detach(slot);
        Ok(())
    }

    fn skip_body_to(&mut self, txn: TxnId, offset: u64) -> Result<u64, SessionError> {
        let slot = self.valid_slot(txn).ok_or_else(stale_txn)?;
        let (id, applied) = match self.streams.get_mut(slot) {
            Some(rec) => (rec.id, rec.egress.skip_to(offset)),
            None => return Err(stale_txn()),
        };
        match applied {
            Ok(applied) => {
                self.transport.notify_pending_write(id);
                Ok(applied)
            }
            Err(e) => Err(SessionError::Recoverable {
                status: None,
                message: e.to_string(),
            }),
        }
    }

    fn enable_partial_reliability(&mut self, txn: TxnId) {
        if let Some(slot) = self.valid_slot(txn) {
            if let Some(rec) = self.streams.get_mut(slot) {
                rec.egress.set_partially_reliable(true);
            }
        }
    }

    fn track_body_delivery(&mut self, txn: TxnId, body_offset: u64) -> Result<(), SessionError> {
        let slot = self.valid_slot(txn).ok_or_else(stale_txn)?;
        let (id, wire_offset) = match self.streams.get(slot) {
            Some(rec) => (rec.id, rec.egress.wire_offset_for_body(body_offset)),
            None => return Err(stale_txn()),
        };
        let wire_offset = wire_offset.ok_or(SessionError::Recoverable {
            status: None,
            message: format!("body offset {} not generated yet", body_offset),
        })?;
        self.transport
            .register_delivery_callback(id, wire_offset)
            .map_err(|e| {
                SessionError::StreamFatal(StreamFatalKind::DeliveryRegistration(e.to_string()))
            })?;
        if let Some(rec) = self.streams.get_mut(slot) {
            rec.ledger
                .register(wire_offset, ByteEventKind::BodyDelivered(body_offset));
        }
        Ok(())
    }

    fn pause_ingress(&mut self, txn: TxnId) {
        if let Some(slot) = self.valid_slot(txn) {
            if let Some(rec) = self.streams.get_mut(slot) {
                if !rec.ingress_paused {
                    rec.ingress_paused = true;
                    trace!(stream = rec.id, "ingress paused");
                }
            }
        }
    }

    fn resume_ingress(&mut self, txn: TxnId) {
        if let Some(slot) = self.valid_slot(txn) {
            if let Some(rec) = self.streams.get_mut(slot) {
                if rec.ingress_paused {
                    rec.ingress_paused = false;
                    trace!(stream = rec.id, "ingress resumed");
                    self.pending_resume.push((slot, txn.generation));
                }
            }
        }
    }

    fn set_priority(&mut self, txn: TxnId, priority: Priority) {
        if let Some(slot) = self.valid_slot(txn) {
            let id = match self.streams.get(slot) {
                Some(rec) => rec.id,
                None => return,
            };
            if let Err(e) = self.transport.set_stream_priority(id, priority) {
                warn!(stream = id, error = %e, "priority update failed");
            }
        }
    }

    fn create_push(
        &mut self,
        parent: TxnId,
        promise: &Message,
        handler: Box<dyn Handler>,
    ) -> Result<PushInfo, SessionError> {
        let parent_slot = self.valid_slot(parent).ok_or_else(stale_txn)?;
        if !self.config.variant.uses_control_stream() {
            return Err(SessionError::Recoverable {
                status: None,
                message: "push is not available on this variant".to_string(),
            });
        }
        let push_id = self.pushes.allocate().map_err(|e| SessionError::Recoverable {
            status: None,
            message: e.to_string(),
        })?;
        let stream_id = self
            .transport
            .open_uni_stream()
            .map_err(|e| SessionError::Recoverable {
                status: None,
                message: e.to_string(),
            })?;

        let generation = self.next_generation;
        self.next_generation += 1;
        let mut record = StreamRecord::new(
            stream_id,
            generation,
            StreamKind::Push,
            self.config.variant,
            self.config.ingress_buffer_limit,
        );
        record.push_id = Some(push_id);
        record.handler = Some(handler);
        record.handler_bound = true;
        let mut preface = BytesMut::new();
        encode_varint(&mut preface, STREAM_TYPE_PUSH);
        encode_varint(&mut preface, push_id);
        record.egress.enqueue_framing(preface.freeze());

        let window = self.transport.stream_send_window(stream_id).unwrap_or(0);
        let slot = self.streams.insert(record);
        self.by_id.insert(stream_id, slot);
        self.flow.register_stream(stream_id, window);
        self.pushes.bind(push_id, stream_id);

        // The promise rides the parent request stream.
        let mut payload = BytesMut::new();
        encode_varint(&mut payload, push_id);
        payload.put_slice(&encode_field_section(0, &field_list(promise)));
        let frame = Frame::new(FRAME_PUSH_PROMISE, payload.freeze());
        let parent_id = match self.streams.get_mut(parent_slot) {
            Some(rec) => {
                rec.egress.enqueue_framing(frame.to_bytes());
                Some(rec.id)
            }
            None => None,
        };
        if let Some(parent_id) = parent_id {
            self.transport.notify_pending_write(parent_id);
        }
        self.transport.notify_pending_write(stream_id);
        debug!(push_id, stream = stream_id, "push transaction created");

        // The push handler opens with the promised request; this is the
        // callback it sends the pushed response from.
        let promised = promise.clone();
        self.with_handler(slot, move |h, txn| h.on_headers_complete(txn, promised));
        Ok(PushInfo {
            stream_id,
            push_id,
        })
    }

    fn transport_info(&self) -> TransportInfo {
        self.transport.transport_info()
    }

    fn drop_connection(&mut self) {
        self.initiate_drop();
    }

    fn notify_pending_shutdown(&mut self) {
        self.initiate_shutdown();
    }
}
