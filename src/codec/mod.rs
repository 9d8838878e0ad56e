//! Wire codec collaborators.
//!
//! The session never parses wire bytes itself; it feeds ingress to the
//! codec selected once at connection setup and reacts to the events the
//! codec emits, and drives the codec's generate calls for egress.

pub mod h1;
pub mod h3;

pub use h3::Frame;

use bytes::Bytes;

use crate::compress::FieldSection;
use crate::transport::StreamId;
use crate::types::{Message, WireVariant};

#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    BadMessage(String),
    /// Received body did not match the declared length. Classified
    /// per-variant by the session: the legacy codec's mismatch carries an
    /// HTTP status, the framed codecs' is a generic parse error.
    BodyLengthMismatch { expected: u64, got: u64 },
    /// A frame type that must not appear on this stream kind.
    UnexpectedFrame(u64),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::BadMessage(msg) => write!(f, "bad message: {}", msg),
            CodecError::BodyLengthMismatch { expected, got } => {
                write!(f, "body length mismatch: declared {}, got {}", expected, got)
            }
            CodecError::UnexpectedFrame(ftype) => {
                write!(f, "unexpected frame type 0x{:x}", ftype)
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Decoded units surfaced from ingress bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecEvent {
    MessageBegin,
    /// The legacy codec parses its own headers.
    HeadersComplete(Message),
    /// Framed variants surface the encoded section; the compression
    /// coordinator decides when it can be decoded.
    EncodedHeaders(FieldSection),
    Body(Bytes),
    ChunkHeader(u64),
    ChunkComplete,
    MessageComplete,
}

/// A request/response codec bound to one stream.
pub trait MessageCodec {
    fn variant(&self) -> WireVariant;

    /// Consume ingress bytes, appending decoded events to `out`. `eom`
    /// marks the transport-level end of the ingress direction.
    fn on_ingress(
        &mut self,
        data: &[u8],
        eom: bool,
        out: &mut Vec<CodecEvent>,
    ) -> Result<(), CodecError>;

    /// Declared ingress body length, once known, so the codec can check
    /// it against what actually arrives.
    fn set_expected_body_length(&mut self, len: u64);

    /// Frame a header block. `encoded` carries the coordinator's wire
    /// block for framed variants and is absent for the legacy codec.
    fn generate_header(&mut self, msg: &Message, encoded: Option<Bytes>) -> Bytes;

    /// Framing preceding a body chunk of `len` bytes.
    fn generate_chunk_header(&mut self, len: u64) -> Bytes;

    /// Framing closing a body chunk.
    fn generate_chunk_terminator(&mut self) -> Bytes;

    /// Terminal framing. May be empty when the transport fin carries the
    /// end-of-message by itself.
    fn generate_eom(&mut self) -> Bytes;
}

/// Codec strategy selected once per connection from the negotiated
/// variant.
pub fn make_codec(variant: WireVariant) -> Box<dyn MessageCodec> {
    match variant {
        WireVariant::Legacy => Box::new(h1::H1Codec::new()),
        WireVariant::Framed | WireVariant::H3 => Box::new(h3::FramedCodec::new(variant)),
    }
}

/// An observer/rewriter in the ingress event path. Filters are composed
/// into an ordered chain at session construction; returning `None` drops
/// the event.
pub trait IngressFilter {
    fn on_event(&mut self, stream: StreamId, event: CodecEvent) -> Option<CodecEvent>;
}

#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn IngressFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Box<dyn IngressFilter>) {
        self.filters.push(filter);
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run `event` through the chain in insertion order.
    pub fn apply(&mut self, stream: StreamId, event: CodecEvent) -> Option<CodecEvent> {
        let mut current = event;
        for filter in &mut self.filters {
            match filter.on_event(stream, current) {
                Some(next) => current = next,
                None => return None,
            }
        }
        Some(current)
    }
}
