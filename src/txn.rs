//! Transaction surface exposed to application handlers.
//!
//! A handler never holds a reference into session-owned state. It is
//! handed a short-lived [`Transaction`] — a slot index plus a generation
//! counter — valid only for the duration of the callback; every
//! operation goes back through the session, which validates the
//! generation before touching the stream record.

use bytes::Bytes;

use crate::egress::ByteEventKind;
use crate::transport::{StreamId, TransportInfo};
use crate::types::{Message, Priority, SessionError};

/// Identity of a bound transaction: slot in the session's stream table
/// plus the generation the slot had at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnId {
    pub slot: usize,
    pub generation: u64,
}

/// Outcome of creating a push transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushInfo {
    pub stream_id: StreamId,
    pub push_id: u64,
}

/// The session operations a transaction may invoke. Object-safe so the
/// `Transaction` handle can stay concrete while the session is generic
/// over its transport.
pub trait TxnTransport {
    fn stream_id(&self, txn: TxnId) -> Option<StreamId>;

    fn send_headers(&mut self, txn: TxnId, msg: &Message) -> Result<(), SessionError>;
    fn send_body(&mut self, txn: TxnId, data: Bytes, skippable: bool)
        -> Result<(), SessionError>;
    fn send_eom(&mut self, txn: TxnId) -> Result<(), SessionError>;
    fn send_abort(&mut self, txn: TxnId, error_code: u64) -> Result<(), SessionError>;

    /// Partial reliability: drop queued body bytes below `offset`.
    fn skip_body_to(&mut self, txn: TxnId, offset: u64) -> Result<u64, SessionError>;

    /// Opt the stream into partially-reliable egress. Only meaningful
    /// before body bytes are generated.
    fn enable_partial_reliability(&mut self, txn: TxnId);

    /// Register a delivery acknowledgment for the given absolute body
    /// offset.
    fn track_body_delivery(&mut self, txn: TxnId, body_offset: u64) -> Result<(), SessionError>;

    fn pause_ingress(&mut self, txn: TxnId);
    fn resume_ingress(&mut self, txn: TxnId);

    fn set_priority(&mut self, txn: TxnId, priority: Priority);

    fn create_push(
        &mut self,
        parent: TxnId,
        promise: &Message,
        handler: Box<dyn Handler>,
    ) -> Result<PushInfo, SessionError>;

    fn transport_info(&self) -> TransportInfo;

    /// Deferred when called from inside a callback; the connection comes
    /// down once the current dispatch unwinds.
    fn drop_connection(&mut self);

    fn notify_pending_shutdown(&mut self);
}

/// Borrow-scoped handle given to handler callbacks.
pub struct Transaction<'a> {
    session: &'a mut dyn TxnTransport,
    id: TxnId,
}

impl<'a> Transaction<'a> {
    pub fn new(session: &'a mut dyn TxnTransport, id: TxnId) -> Self {
        Self { session, id }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.session.stream_id(self.id)
    }

    pub fn send_headers(&mut self, msg: &Message) -> Result<(), SessionError> {
        self.session.send_headers(self.id, msg)
    }

    pub fn send_body(&mut self, data: Bytes) -> Result<(), SessionError> {
        self.session.send_body(self.id, data, true)
    }

    pub fn send_body_reliable(&mut self, data: Bytes) -> Result<(), SessionError> {
        self.session.send_body(self.id, data, false)
    }

    pub fn send_eom(&mut self) -> Result<(), SessionError> {
        self.session.send_eom(self.id)
    }

    pub fn send_abort(&mut self, error_code: u64) -> Result<(), SessionError> {
        self.session.send_abort(self.id, error_code)
    }

    pub fn skip_body_to(&mut self, offset: u64) -> Result<u64, SessionError> {
        self.session.skip_body_to(self.id, offset)
    }

    pub fn enable_partial_reliability(&mut self) {
        self.session.enable_partial_reliability(self.id)
    }

    pub fn track_body_delivery(&mut self, body_offset: u64) -> Result<(), SessionError> {
        self.session.track_body_delivery(self.id, body_offset)
    }

    pub fn pause_ingress(&mut self) {
        self.session.pause_ingress(self.id)
    }

    pub fn resume_ingress(&mut self) {
        self.session.resume_ingress(self.id)
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.session.set_priority(self.id, priority)
    }

    pub fn create_push(
        &mut self,
        promise: &Message,
        handler: Box<dyn Handler>,
    ) -> Result<PushInfo, SessionError> {
        self.session.create_push(self.id, promise, handler)
    }

    pub fn transport_info(&self) -> TransportInfo {
        self.session.transport_info()
    }

    pub fn drop_connection(&mut self) {
        self.session.drop_connection()
    }

    pub fn notify_pending_shutdown(&mut self) {
        self.session.notify_pending_shutdown()
    }
}

/// Application collaborator bound to one transaction. All callbacks run
/// on the connection's loop; re-entrant session calls made through the
/// provided [`Transaction`] are safe and may be deferred.
pub trait Handler {
    fn on_headers_complete(&mut self, txn: &mut Transaction<'_>, msg: Message);

    fn on_body(&mut self, _txn: &mut Transaction<'_>, _chunk: Bytes) {}

    /// Partial reliability: the peer rejected body bytes up to `offset`.
    fn on_body_rejected(&mut self, _txn: &mut Transaction<'_>, _offset: u64) {}

    fn on_chunk_header(&mut self, _txn: &mut Transaction<'_>, _len: u64) {}

    fn on_chunk_complete(&mut self, _txn: &mut Transaction<'_>) {}

    fn on_eom(&mut self, _txn: &mut Transaction<'_>) {}

    /// Delivered exactly once per failed transaction.
    fn on_error(&mut self, _txn: &mut Transaction<'_>, _error: &SessionError) {}

    fn on_egress_paused(&mut self, _txn: &mut Transaction<'_>) {}

    fn on_egress_resumed(&mut self, _txn: &mut Transaction<'_>) {}

    fn on_byte_event(&mut self, _txn: &mut Transaction<'_>, _event: ByteEventKind) {}

    /// The binding is gone after this returns; the handler must not
    /// retain any way to reach the stream.
    fn on_detach(&mut self) {}
}

/// Produces a handler for each new ingress request. Supplied by the
/// embedding server at session construction.
pub trait HandlerProvider {
    fn new_handler(&mut self, msg: &Message) -> Box<dyn Handler>;

    /// Handler for a transaction that errored before its headers
    /// completed (synthetic timeout/error bindings). Default: none.
    fn error_handler(&mut self) -> Option<Box<dyn Handler>> {
        None
    }
}
