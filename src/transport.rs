//! Interface to the QUIC-like transport underneath the session.
//!
//! The transport owns the sockets, congestion control and retransmission;
//! the session only consumes this surface and translates its local error
//! taxonomy into session errors.

use bytes::Bytes;

use crate::types::Priority;

pub type StreamId = u64;

/// Local error taxonomy of the transport collaborator. The session never
/// propagates these raw; they are classified in `SessionError`.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    UnknownStream,
    InvalidOperation(String),
    WouldBlock,
    Internal(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::UnknownStream => write!(f, "stream does not exist"),
            TransportError::InvalidOperation(msg) => write!(f, "invalid operation: {}", msg),
            TransportError::WouldBlock => write!(f, "would block"),
            TransportError::Internal(msg) => write!(f, "internal transport error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// One readable chunk plus whether the peer finished the stream.
#[derive(Debug, Default)]
pub struct ReadChunk {
    pub data: Bytes,
    pub fin: bool,
}

/// Point-in-time transport statistics surfaced through the transaction
/// info queries.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportInfo {
    pub rtt_micros: u64,
    pub congestion_window: u64,
    pub packets_retransmitted: u64,
}

/// Events produced by the transport (and the loop's timers) and fed into
/// the session dispatcher. All delivery is serialized through the single
/// connection loop.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Readable(StreamId),
    WriteReady(StreamId),
    /// Peer enlarged a stream-level send window.
    FlowControlUpdate(StreamId),
    /// Peer enlarged the connection-level send window.
    ConnectionFlowControlUpdate,
    StreamReset(StreamId, u64),
    StopSending(StreamId, u64),
    ConnectionError(TransportError),
    /// Bytes up to `offset` confirmed received by the peer.
    DeliveryAck(StreamId, u64),
    /// Bytes up to `offset` will never be delivered (stream reset under a
    /// registered byte event).
    DeliveryCancel(StreamId, u64),
    /// Partial reliability: peer rejected body bytes up to `offset`.
    DataRejected(StreamId, u64),
    /// Loop-scheduled transaction timeout.
    TransactionTimeout(StreamId),
}

/// The transport surface the session consumes. One implementation per
/// QUIC stack; tests drive the session with an in-memory one.
pub trait QuicTransport {
    /// Pull up to `max` readable bytes from `id`.
    fn read(&mut self, id: StreamId, max: usize) -> Result<ReadChunk, TransportError>;

    /// Queue bytes on `id`, returning how many the transport accepted.
    /// `eom` marks the stream finished after this chain and takes effect
    /// only once every byte of it has been accepted.
    fn write_chain(&mut self, id: StreamId, data: Bytes, eom: bool)
        -> Result<usize, TransportError>;

    /// Tell the transport the session has pending egress for `id`.
    fn notify_pending_write(&mut self, id: StreamId);

    fn reset_stream(&mut self, id: StreamId, error_code: u64) -> Result<(), TransportError>;

    fn stop_sending(&mut self, id: StreamId, error_code: u64) -> Result<(), TransportError>;

    fn set_stream_priority(&mut self, id: StreamId, priority: Priority)
        -> Result<(), TransportError>;

    /// Remaining stream-level send window.
    fn stream_send_window(&self, id: StreamId) -> Result<u64, TransportError>;

    /// Announce our per-stream ingress limit.
    fn set_stream_receive_window(&mut self, id: StreamId, window: u64)
        -> Result<(), TransportError>;

    /// Remaining connection-level send window, shared by every stream.
    fn connection_send_window(&self) -> u64;

    /// Bytes of `id` already handed to the transport.
    fn written_offset(&self, id: StreamId) -> Result<u64, TransportError>;

    /// Register an acknowledgment callback for the byte at `offset`.
    /// Offsets the peer has already acknowledged must be refused with
    /// `InvalidOperation`.
    fn register_delivery_callback(&mut self, id: StreamId, offset: u64)
        -> Result<(), TransportError>;

    /// Open a locally-initiated unidirectional stream (control, instruction
    /// and push streams).
    fn open_uni_stream(&mut self) -> Result<StreamId, TransportError>;

    fn transport_info(&self) -> TransportInfo;
}
