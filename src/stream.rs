//! Per-stream bookkeeping for the session's stream table.
//!
//! Records live in a slab; handlers refer to them by slot index plus a
//! generation counter, never by reference, so a record can be removed
//! while callbacks are still on the stack without leaving a dangling
//! back-pointer.

use std::collections::VecDeque;

use bytes::BytesMut;

use crate::codec::{make_codec, CodecEvent, MessageCodec};
use crate::egress::{DeliveryLedger, EgressBuffer};
use crate::transport::StreamId;
use crate::txn::Handler;
use crate::types::WireVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Peer-initiated bidirectional request stream.
    Request,
    /// Locally-initiated unidirectional push stream.
    Push,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    /// Ingress finished, egress still open.
    HalfClosedRemote,
    /// Egress finished, ingress still open.
    HalfClosedLocal,
    Closed,
}

pub struct StreamRecord {
    pub id: StreamId,
    pub generation: u64,
    pub kind: StreamKind,
    pub state: StreamState,
    pub push_id: Option<u64>,
    pub codec: Box<dyn MessageCodec>,
    /// Taken before each callback and restored after, so a handler
    /// invoked re-entrantly never aliases the record.
    pub handler: Option<Box<dyn Handler>>,
    pub handler_bound: bool,
    pub egress: EgressBuffer,
    pub ledger: DeliveryLedger,
    /// Raw ingress bytes parked while the transaction has ingress paused.
    pub ingress_buf: BytesMut,
    pub ingress_limit: usize,
    pub ingress_paused: bool,
    /// Transport fin parked behind paused bytes.
    pub fin_buffered: bool,
    /// Transport fin has been fed through the codec.
    pub fin_seen: bool,
    /// MessageComplete delivered upward.
    pub ingress_done: bool,
    /// Header block queued at the compression coordinator; later codec
    /// events wait in `pending_events` so per-stream order holds.
    pub blocked_on_headers: bool,
    pub pending_events: VecDeque<CodecEvent>,
    pub first_byte_flushed: bool,
    pub error_delivered: bool,
    /// The transaction binding is gone; the handler must not be restored
    /// or invoked again.
    pub detached: bool,
}

impl StreamRecord {
    pub fn new(
        id: StreamId,
        generation: u64,
        kind: StreamKind,
        variant: WireVariant,
        ingress_limit: usize,
    ) -> Self {
        Self {
            id,
            generation,
            kind,
            state: StreamState::Open,
            push_id: None,
            codec: make_codec(variant),
            handler: None,
            handler_bound: false,
            egress: EgressBuffer::new(false),
            ledger: DeliveryLedger::new(),
            ingress_buf: BytesMut::new(),
            ingress_limit,
            ingress_paused: false,
            fin_buffered: false,
            fin_seen: false,
            ingress_done: false,
            blocked_on_headers: false,
            pending_events: VecDeque::new(),
            first_byte_flushed: false,
            error_delivered: false,
            detached: false,
        }
    }

    pub fn close_ingress(&mut self) {
        self.ingress_done = true;
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal | StreamState::Closed => StreamState::Closed,
            StreamState::HalfClosedRemote => StreamState::HalfClosedRemote,
        };
    }

    pub fn close_egress(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote | StreamState::Closed => StreamState::Closed,
            StreamState::HalfClosedLocal => StreamState::HalfClosedLocal,
        };
    }

    /// Push streams have no ingress direction to wait for.
    pub fn is_finished(&self) -> bool {
        let ingress_ok = self.ingress_done || self.kind == StreamKind::Push;
        ingress_ok && self.egress.eom_queued() && self.egress.is_drained()
    }

    /// Room left before parked ingress must stop transport reads.
    pub fn ingress_budget(&self) -> usize {
        self.ingress_limit.saturating_sub(self.ingress_buf.len())
    }
}
