//! Per-stream egress buffering, delivery acknowledgment bookkeeping and
//! the partially-reliable skip machinery.
//!
//! Generated bytes queue here until flow control lets them reach the
//! transport. Body segments carry their absolute body-offset range so a
//! later `skip_to` can drop or truncate segments that have not been
//! flushed yet; bytes already handed to the transport are beyond reach
//! and skipping them is a no-op for that portion.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Header or chunk framing bytes.
    Framing,
    Body,
    /// Terminal framing. Held back unless it can be flushed whole.
    Eom,
}

#[derive(Debug)]
struct Segment {
    data: Bytes,
    kind: SegmentKind,
    skippable: bool,
    /// Absolute body-offset range covered by this segment (body segments
    /// only).
    body_start: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipError {
    /// Requested offset lies beyond the declared body length.
    BeyondBodyLength { requested: u64, declared: u64 },
    NotEnabled,
}

impl std::fmt::Display for SkipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipError::BeyondBodyLength {
                requested,
                declared,
            } => write!(
                f,
                "skip to {} beyond declared body length {}",
                requested, declared
            ),
            SkipError::NotEnabled => write!(f, "stream is not partially reliable"),
        }
    }
}

impl std::error::Error for SkipError {}

/// Byte events a transaction can observe through the delivery ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteEventKind {
    FirstByteFlushed,
    LastByteAcked,
    /// Delivery of body bytes up to the tagged absolute body offset.
    BodyDelivered(u64),
    /// The tracked body bytes will never be delivered (stream reset under
    /// a registered byte event).
    BodyCancelled(u64),
}

#[derive(Debug)]
pub struct EgressBuffer {
    segments: VecDeque<Segment>,
    /// Wire bytes already handed to the transport.
    flushed_offset: u64,
    /// Wire bytes generated so far (flushed + queued).
    queued_offset: u64,
    /// Body bytes generated so far.
    body_generated: u64,
    /// Body bytes already handed to the transport.
    body_flushed: u64,
    /// Highest applied skip offset; only ever moves forward.
    applied_skip: u64,
    /// Ends of generated body chunks, for reject-alignment checks.
    chunk_boundaries: Vec<u64>,
    /// Body-end to wire-end offset pairs, one per body chunk, so a body
    /// offset can be mapped back to the transport offset it flushes at.
    body_wire_map: Vec<(u64, u64)>,
    declared_body_length: Option<u64>,
    partially_reliable: bool,
    eom_queued: bool,
    eom_flushed: bool,
}

impl EgressBuffer {
    pub fn new(partially_reliable: bool) -> Self {
        Self {
            segments: VecDeque::new(),
            flushed_offset: 0,
            queued_offset: 0,
            body_generated: 0,
            body_flushed: 0,
            applied_skip: 0,
            chunk_boundaries: Vec::new(),
            body_wire_map: Vec::new(),
            declared_body_length: None,
            partially_reliable,
            eom_queued: false,
            eom_flushed: false,
        }
    }

    pub fn set_declared_body_length(&mut self, len: u64) {
        self.declared_body_length = Some(len);
    }

    /// Opt into partially-reliable egress. Only meaningful before body
    /// bytes are generated; earlier chunks were enqueued unskippable.
    pub fn set_partially_reliable(&mut self, enabled: bool) {
        self.partially_reliable = enabled;
    }

    pub fn is_partially_reliable(&self) -> bool {
        self.partially_reliable
    }

    pub fn flushed_offset(&self) -> u64 {
        self.flushed_offset
    }

    pub fn body_generated(&self) -> u64 {
        self.body_generated
    }

    /// Body bytes already handed to the transport.
    pub fn body_flushed(&self) -> u64 {
        self.body_flushed
    }

    pub fn applied_skip(&self) -> u64 {
        self.applied_skip
    }

    pub fn pending_bytes(&self) -> u64 {
        self.queued_offset - self.flushed_offset
    }

    pub fn has_pending(&self) -> bool {
        self.pending_bytes() > 0
    }

    pub fn eom_queued(&self) -> bool {
        self.eom_queued
    }

    /// Everything generated has been flushed, including the terminal
    /// framing.
    pub fn is_drained(&self) -> bool {
        !self.has_pending() && (!self.eom_queued || self.eom_flushed)
    }

    pub fn enqueue_framing(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.queued_offset += data.len() as u64;
        self.segments.push_back(Segment {
            data,
            kind: SegmentKind::Framing,
            skippable: false,
            body_start: 0,
        });
    }

    pub fn enqueue_body(&mut self, data: Bytes, skippable: bool) {
        if data.is_empty() {
            return;
        }
        let body_start = self.body_generated;
        self.queued_offset += data.len() as u64;
        self.body_generated += data.len() as u64;
        self.chunk_boundaries.push(self.body_generated);
        self.body_wire_map.push((self.body_generated, self.queued_offset));
        self.segments.push_back(Segment {
            data,
            kind: SegmentKind::Body,
            skippable: skippable && self.partially_reliable,
            body_start,
        });
    }

    /// Queue the terminal framing. `data` may be empty (pure-fin
    /// variants); the EOM mark is still held until flush.
    pub fn enqueue_eom(&mut self, data: Bytes) {
        self.queued_offset += data.len() as u64;
        self.segments.push_back(Segment {
            data,
            kind: SegmentKind::Eom,
            skippable: false,
            body_start: 0,
        });
        self.eom_queued = true;
        if self.declared_body_length.is_none() {
            self.declared_body_length = Some(self.body_generated);
        }
    }

    /// Bytes the next flush would need to also cover the terminal framing
    /// if only the EOM segment remains. The dispatcher refuses to flush a
    /// terminal segment partially; a stream whose final framing does not
    /// fit the window stays open and unflushed.
    pub fn next_segment_len(&self) -> Option<(u64, SegmentKind)> {
        self.segments
            .front()
            .map(|s| (s.data.len() as u64, s.kind))
    }

    /// Pull up to `max` bytes for the transport. Returns the bytes and
    /// whether they end the message. Terminal segments are all-or-
    /// nothing; other segments may split.
    pub fn pull(&mut self, max: u64) -> Option<(Bytes, bool)> {
        if max == 0 {
            return None;
        }
        let front = self.segments.front_mut()?;
        let len = front.data.len() as u64;

        if front.kind == SegmentKind::Eom && len > max {
            return None;
        }

        if len <= max {
            let seg = match self.segments.pop_front() {
                Some(s) => s,
                None => return None,
            };
            self.flushed_offset += len;
            if seg.kind == SegmentKind::Body {
                self.body_flushed = seg.body_start + len;
            }
            let eom = seg.kind == SegmentKind::Eom
                || (self.eom_queued && self.segments.is_empty());
            if eom {
                self.eom_flushed = true;
            }
            return Some((seg.data, eom));
        }

        // Split a non-terminal segment.
        let taken = front.data.split_to(max as usize);
        if front.kind == SegmentKind::Body {
            front.body_start += max;
            self.body_flushed = front.body_start;
        }
        self.flushed_offset += max;
        Some((taken, false))
    }

    /// Return the unaccepted tail of a pulled segment to the front of
    /// the queue, rolling back the flush bookkeeping for those bytes.
    /// `was_eom` must echo what the pull reported so the terminal flush
    /// mark rolls back with them.
    pub fn unpull(&mut self, data: Bytes, kind: SegmentKind, was_eom: bool) {
        if data.is_empty() {
            return;
        }
        let len = data.len() as u64;
        self.flushed_offset -= len;
        let body_start = if kind == SegmentKind::Body {
            self.body_flushed -= len;
            self.body_flushed
        } else {
            0
        };
        if was_eom {
            self.eom_flushed = false;
        }
        self.segments.push_front(Segment {
            data,
            kind,
            skippable: false,
            body_start,
        });
    }

    /// Move the skip cursor forward to `offset` (absolute body offset),
    /// dropping queued skippable body bytes below it. Bytes already
    /// flushed are unaffected. Returns the offset actually applied, which
    /// never decreases and never exceeds the body bytes generated so far.
    pub fn skip_to(&mut self, offset: u64) -> Result<u64, SkipError> {
        if !self.partially_reliable {
            return Err(SkipError::NotEnabled);
        }
        if let Some(declared) = self.declared_body_length {
            if offset > declared {
                return Err(SkipError::BeyondBodyLength {
                    requested: offset,
                    declared,
                });
            }
        }

        let target = offset.min(self.body_generated);
        if target <= self.applied_skip {
            // Cursors only move forward; a lower offset is accepted but
            // produces no observable change.
            return Ok(self.applied_skip);
        }
        self.applied_skip = target;

        let mut kept = VecDeque::with_capacity(self.segments.len());
        let mut dropped = 0u64;
        for mut seg in self.segments.drain(..) {
            if seg.kind != SegmentKind::Body || !seg.skippable {
                kept.push_back(seg);
                continue;
            }
            let seg_len = seg.data.len() as u64;
            let seg_end = seg.body_start + seg_len;
            if seg_end <= target {
                dropped += seg_len;
                continue;
            }
            if seg.body_start < target {
                let cut = target - seg.body_start;
                let _ = seg.data.split_to(cut as usize);
                seg.body_start = target;
                dropped += cut;
            }
            kept.push_back(seg);
        }
        self.segments = kept;
        self.queued_offset -= dropped;
        debug!(applied = target, dropped, "body skip applied");
        Ok(self.applied_skip)
    }

    /// Whether `offset` lands on a previously generated chunk boundary.
    pub fn is_chunk_boundary(&self, offset: u64) -> bool {
        offset == 0 || self.chunk_boundaries.binary_search(&offset).is_ok()
    }

    /// Transport offset at which the body byte at `body_offset` is
    /// written, or `None` for body bytes not generated yet. Body bytes
    /// are contiguous within each chunk.
    pub fn wire_offset_for_body(&self, body_offset: u64) -> Option<u64> {
        if body_offset > self.body_generated {
            return None;
        }
        for &(body_end, wire_end) in &self.body_wire_map {
            if body_offset <= body_end {
                return Some(wire_end - (body_end - body_offset));
            }
        }
        None
    }
}

/// Per-stream ledger of registered acknowledgment callbacks, keyed by
/// transport byte offset. Several events may share one offset (a tracked
/// body offset can coincide with the terminal byte when the terminal
/// framing is empty).
#[derive(Debug, Default)]
pub struct DeliveryLedger {
    pending: BTreeMap<u64, Vec<ByteEventKind>>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn register(&mut self, offset: u64, kind: ByteEventKind) {
        self.pending.entry(offset).or_default().push(kind);
    }

    /// All events at or below `offset`, in offset order; registration
    /// order within an offset.
    pub fn take_through(&mut self, offset: u64) -> Vec<(u64, ByteEventKind)> {
        let mut fired = Vec::new();
        let keys: Vec<u64> = self
            .pending
            .range(..=offset)
            .map(|(&k, _)| k)
            .collect();
        for key in keys {
            if let Some(kinds) = self.pending.remove(&key) {
                fired.extend(kinds.into_iter().map(|kind| (key, kind)));
            }
        }
        fired
    }
}

/// Validate a peer-driven data rejection against the chunk boundaries the
/// buffer generated. Misaligned rejections race with local skips and are
/// soft errors.
pub fn validate_rejection(buffer: &EgressBuffer, offset: u64) -> bool {
    if buffer.is_chunk_boundary(offset) {
        true
    } else {
        warn!(offset, "data rejection not aligned with a chunk boundary, ignoring");
        false
    }
}
