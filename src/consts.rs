//! Wire constants shared by the framed and H3 variants.

// Frame types (RFC 9114 Section 7.2)
pub const FRAME_DATA: u64 = 0x0;
pub const FRAME_HEADERS: u64 = 0x1;
pub const FRAME_CANCEL_PUSH: u64 = 0x3;
pub const FRAME_SETTINGS: u64 = 0x4;
pub const FRAME_PUSH_PROMISE: u64 = 0x5;
pub const FRAME_GOAWAY: u64 = 0x7;
pub const FRAME_MAX_PUSH_ID: u64 = 0x0d;

// Unidirectional stream type prefaces (RFC 9114 Section 6.2)
pub const STREAM_TYPE_CONTROL: u64 = 0x00;
pub const STREAM_TYPE_PUSH: u64 = 0x01;
pub const STREAM_TYPE_QPACK_ENCODER: u64 = 0x02;
pub const STREAM_TYPE_QPACK_DECODER: u64 = 0x03;

// Settings identifiers (RFC 9114 Section 7.2.4.1)
pub const SETTINGS_QPACK_MAX_TABLE_CAPACITY: u64 = 0x1;
pub const SETTINGS_MAX_FIELD_SECTION_SIZE: u64 = 0x6;
pub const SETTINGS_QPACK_BLOCKED_STREAMS: u64 = 0x7;

pub const DEFAULT_QPACK_MAX_TABLE_CAPACITY: u64 = 4_096;
pub const DEFAULT_MAX_FIELD_SECTION_SIZE: u64 = 8_192;
pub const DEFAULT_QPACK_BLOCKED_STREAMS: u64 = 100;

/// Largest client-initiated bidirectional stream id a varint can carry.
/// Used as the soft GOAWAY cutoff so in-flight streams delivered out of
/// order after shutdown are still serviced.
pub const MAX_CLIENT_BIDI_STREAM_ID: u64 = (1 << 62) - 4;

// Application error codes (RFC 9114 Section 8.1)
pub const H3_NO_ERROR: u64 = 0x100;
pub const H3_INTERNAL_ERROR: u64 = 0x102;
pub const H3_STREAM_CREATION_ERROR: u64 = 0x103;
pub const H3_CLOSED_CRITICAL_STREAM: u64 = 0x104;
pub const H3_FRAME_UNEXPECTED: u64 = 0x105;
pub const H3_REQUEST_REJECTED: u64 = 0x10b;
pub const H3_REQUEST_CANCELLED: u64 = 0x10c;
pub const H3_MESSAGE_ERROR: u64 = 0x10e;

/// Streams visited per dispatcher loop turn before yielding.
pub const DEFAULT_MAX_READS_PER_LOOP: usize = 16;

/// Bytes pulled from one stream per visit.
pub const DEFAULT_READ_CHUNK: usize = 8_192;

/// Default per-stream ingress buffer limit before back-pressure pauses
/// transport reads for that stream.
pub const DEFAULT_INGRESS_BUFFER_LIMIT: usize = 65_536;
