//! Header-compression coordination.
//!
//! The compression algorithm itself (table eviction heuristics, wire
//! instruction encoding) lives in the codec collaborators; this module
//! owns the session-level contract that depends on its observable
//! behavior: the shared dynamic table is a single ordered log, so a
//! header block that references insertions the decoder side has not yet
//! acknowledged is buffered, and blocked blocks are released in arrival
//! order across all streams once the acknowledgment horizon catches up.

use std::collections::{HashSet, VecDeque};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::transport::StreamId;
use crate::types::Header;
use crate::varint::{decode_varint, encode_varint};

/// Per-entry overhead used for table size accounting (RFC 9204 §3.2.1).
const ENTRY_OVERHEAD: u64 = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum CompressError {
    /// A capacity change would evict entries referenced by a block still
    /// in flight on the named stream, whose cancellation has not been
    /// confirmed.
    EvictionBlocked(StreamId),
    Malformed(String),
}

impl std::fmt::Display for CompressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressError::EvictionBlocked(stream) => write!(
                f,
                "capacity change would evict entries referenced by stream {}",
                stream
            ),
            CompressError::Malformed(msg) => write!(f, "malformed field section: {}", msg),
        }
    }
}

impl std::error::Error for CompressError {}

/// An encoded field section as surfaced by the framed codecs: the
/// required insert count it depends on plus the literal field payload.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSection {
    pub required_insert_count: u64,
    pub payload: Bytes,
}

#[derive(Debug)]
pub enum DecodeOutcome {
    Ready(Vec<Header>),
    /// Held until the horizon reaches the block's dependency, or until an
    /// earlier-arrived blocked block releases (FIFO across streams).
    Blocked,
}

/// A block released from the blocked queue. `headers` is `None` when the
/// owning stream was cancelled while the block waited; the entry is still
/// drained so no table state leaks, but no callback may fire for it.
#[derive(Debug)]
pub struct ReleasedBlock {
    pub stream: StreamId,
    pub headers: Option<Vec<Header>>,
}

#[derive(Debug)]
struct TableEntry {
    name: String,
    value: String,
}

impl TableEntry {
    fn size(&self) -> u64 {
        self.name.len() as u64 + self.value.len() as u64 + ENTRY_OVERHEAD
    }
}

#[derive(Debug)]
struct BlockedBlock {
    stream: StreamId,
    required_insert_count: u64,
    payload: Bytes,
    cancelled: bool,
}

/// Egress block still unacknowledged by the peer decoder, pinning the
/// table entries it references.
#[derive(Debug)]
struct InFlightRef {
    stream: StreamId,
    max_insert_index: u64,
}

#[derive(Debug)]
pub struct HeaderCoordinator {
    table_capacity: u64,
    table_size: u64,
    /// Entries still resident. Insert counts are 1-based and absolute;
    /// `evicted` entries have fallen off the front.
    entries: VecDeque<TableEntry>,
    evicted: u64,
    insert_count: u64,
    /// Insert-count horizon acknowledged by the decoder side. Gates the
    /// release of blocked ingress blocks.
    horizon: u64,
    blocked: VecDeque<BlockedBlock>,
    in_flight: Vec<InFlightRef>,
    cancellation_confirmed: HashSet<StreamId>,
}

impl HeaderCoordinator {
    pub fn new(table_capacity: u64) -> Self {
        Self {
            table_capacity,
            table_size: 0,
            entries: VecDeque::new(),
            evicted: 0,
            insert_count: 0,
            horizon: 0,
            blocked: VecDeque::new(),
            in_flight: Vec::new(),
            cancellation_confirmed: HashSet::new(),
        }
    }

    pub fn insert_count(&self) -> u64 {
        self.insert_count
    }

    pub fn horizon(&self) -> u64 {
        self.horizon
    }

    pub fn blocked_len(&self) -> usize {
        self.blocked.len()
    }

    /// Encode an egress header list, inserting new entries into the
    /// dynamic table while capacity allows. Returns the full wire block
    /// (insert-count prefix plus literal fields) and the insert count the
    /// block depends on.
    pub fn encode_headers(&mut self, stream: StreamId, headers: &[Header]) -> (Bytes, u64) {
        let mut max_ref = 0u64;
        for header in headers {
            match self.lookup(header) {
                Some(index) => max_ref = max_ref.max(index),
                None => {
                    if let Some(index) = self.insert(header) {
                        max_ref = max_ref.max(index);
                    }
                }
            }
        }
        if max_ref > 0 {
            self.in_flight.push(InFlightRef {
                stream,
                max_insert_index: max_ref,
            });
        }
        let block = encode_field_section(max_ref, headers);
        trace!(stream, required = max_ref, "encoded header block");
        (block, max_ref)
    }

    fn lookup(&self, header: &Header) -> Option<u64> {
        self.entries
            .iter()
            .position(|e| e.name == header.name && e.value == header.value)
            .map(|pos| self.evicted + pos as u64 + 1)
    }

    fn insert(&mut self, header: &Header) -> Option<u64> {
        let entry = TableEntry {
            name: header.name.clone(),
            value: header.value.clone(),
        };
        if entry.size() > self.table_capacity {
            return None;
        }
        while self.table_size + entry.size() > self.table_capacity {
            let evicted = self.entries.pop_front()?;
            self.table_size -= evicted.size();
            self.evicted += 1;
        }
        self.table_size += entry.size();
        self.entries.push_back(entry);
        self.insert_count += 1;
        Some(self.insert_count)
    }

    /// Peer decoder acknowledged one of our egress blocks; its table
    /// references are no longer pinned.
    pub fn on_block_acknowledged(&mut self, stream: StreamId) {
        self.in_flight.retain(|r| r.stream != stream);
    }

    /// The decoder-ack horizon advanced. Monotone; stale acks are
    /// harmless.
    pub fn on_decoder_ack(&mut self, insert_count: u64) {
        if insert_count > self.horizon {
            debug!(from = self.horizon, to = insert_count, "decoder ack horizon advanced");
            self.horizon = insert_count;
        }
    }

    /// Decode an ingress block now if the shared-log ordering allows it,
    /// otherwise queue it. A block must queue whenever any earlier block
    /// is still queued, even if its own dependency is already satisfied.
    pub fn decode_or_queue(
        &mut self,
        stream: StreamId,
        section: FieldSection,
    ) -> Result<DecodeOutcome, CompressError> {
        if self.blocked.is_empty() && section.required_insert_count <= self.horizon {
            return Ok(DecodeOutcome::Ready(decode_fields(&section.payload)?));
        }
        debug!(
            stream,
            required = section.required_insert_count,
            horizon = self.horizon,
            "header block blocked on undelivered table state"
        );
        self.blocked.push_back(BlockedBlock {
            stream,
            required_insert_count: section.required_insert_count,
            payload: section.payload,
            cancelled: false,
        });
        Ok(DecodeOutcome::Blocked)
    }

    /// Release every block at the head of the queue whose dependency the
    /// horizon now covers, preserving arrival order. Cancelled blocks are
    /// drained with `headers: None`.
    pub fn release_ready(&mut self) -> Result<Vec<ReleasedBlock>, CompressError> {
        let mut released = Vec::new();
        while let Some(front) = self.blocked.front() {
            if front.required_insert_count > self.horizon {
                break;
            }
            let block = match self.blocked.pop_front() {
                Some(b) => b,
                None => break,
            };
            let headers = if block.cancelled {
                None
            } else {
                Some(decode_fields(&block.payload)?)
            };
            released.push(ReleasedBlock {
                stream: block.stream,
                headers,
            });
        }
        Ok(released)
    }

    /// A stream carrying blocked blocks was reset. The blocks stay queued
    /// so the shared log drains in order, but their decode results are
    /// discarded on release.
    pub fn on_stream_cancelled(&mut self, stream: StreamId) {
        for block in self.blocked.iter_mut() {
            if block.stream == stream {
                block.cancelled = true;
            }
        }
        self.cancellation_confirmed.insert(stream);
        self.in_flight.retain(|r| r.stream != stream);
    }

    /// Apply a table capacity change. Fails when the shrink would evict
    /// entries still referenced by an unacknowledged egress block whose
    /// stream has not confirmed cancellation.
    pub fn set_table_capacity(&mut self, capacity: u64) -> Result<(), CompressError> {
        if capacity < self.table_size {
            // Find the absolute index of the last entry that must go.
            let mut size = self.table_size;
            let mut evict_through = self.evicted;
            for entry in &self.entries {
                if size <= capacity {
                    break;
                }
                size -= entry.size();
                evict_through += 1;
            }
            for r in &self.in_flight {
                if r.max_insert_index <= evict_through
                    && !self.cancellation_confirmed.contains(&r.stream)
                {
                    return Err(CompressError::EvictionBlocked(r.stream));
                }
            }
            while self.evicted < evict_through {
                if let Some(entry) = self.entries.pop_front() {
                    self.table_size -= entry.size();
                }
                self.evicted += 1;
            }
        }
        self.table_capacity = capacity;
        Ok(())
    }
}

/// Wire form of a field section: insert-count prefix, then literal
/// name/value pairs, all length-prefixed with varints.
pub fn encode_field_section(required_insert_count: u64, headers: &[Header]) -> Bytes {
    let mut buf = BytesMut::new();
    encode_varint(&mut buf, required_insert_count);
    for header in headers {
        encode_varint(&mut buf, header.name.len() as u64);
        buf.put_slice(header.name.as_bytes());
        encode_varint(&mut buf, header.value.len() as u64);
        buf.put_slice(header.value.as_bytes());
    }
    buf.freeze()
}

/// Split the insert-count prefix off a wire block.
pub fn split_field_section(block: &[u8]) -> Result<FieldSection, CompressError> {
    let (required_insert_count, consumed) = decode_varint(block)
        .ok_or_else(|| CompressError::Malformed("truncated insert-count prefix".to_string()))?;
    Ok(FieldSection {
        required_insert_count,
        payload: Bytes::copy_from_slice(&block[consumed..]),
    })
}

/// Decode the literal name/value pairs of a field-section payload.
pub fn decode_fields(payload: &[u8]) -> Result<Vec<Header>, CompressError> {
    let mut headers = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let (name_len, consumed) = decode_varint(&payload[offset..])
            .ok_or_else(|| CompressError::Malformed("truncated name length".to_string()))?;
        offset += consumed;
        let name_end = offset + name_len as usize;
        if name_end > payload.len() {
            return Err(CompressError::Malformed("truncated name".to_string()));
        }
        let name = String::from_utf8(payload[offset..name_end].to_vec())
            .map_err(|_| CompressError::Malformed("header name not utf-8".to_string()))?;
        offset = name_end;

        let (value_len, consumed) = decode_varint(&payload[offset..])
            .ok_or_else(|| CompressError::Malformed("truncated value length".to_string()))?;
        offset += consumed;
        let value_end = offset + value_len as usize;
        if value_end > payload.len() {
            return Err(CompressError::Malformed("truncated value".to_string()));
        }
        let value = String::from_utf8(payload[offset..value_end].to_vec())
            .map_err(|_| CompressError::Malformed("header value not utf-8".to_string()))?;
        offset = value_end;

        headers.push(Header { name, value });
    }
    Ok(headers)
}
