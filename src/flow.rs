//! Send-side flow-control accounting.
//!
//! Tracks the connection-level window shared by every stream and the
//! per-stream windows, and decides when egress must pause and when paused
//! streams may resume. The connection window is consumed before the
//! stream window is checked. Resume notifications are coalesced: the
//! session drains `take_resumable` once per loop turn, so a transaction
//! is told `egress_resumed` at most once even when several partial window
//! updates land in the same turn.

use std::collections::HashMap;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::transport::StreamId;

#[derive(Debug)]
struct StreamFlow {
    window: u64,
    paused: bool,
}

#[derive(Debug)]
pub struct FlowAccountant {
    connection_window: u64,
    streams: HashMap<StreamId, StreamFlow>,
    /// Paused streams in the order they paused. Resume follows this order.
    paused_order: Vec<StreamId>,
}

impl FlowAccountant {
    pub fn new(connection_window: u64) -> Self {
        Self {
            connection_window,
            streams: HashMap::new(),
            paused_order: Vec::new(),
        }
    }

    pub fn register_stream(&mut self, id: StreamId, window: u64) {
        self.streams.insert(id, StreamFlow {
            window,
            paused: false,
        });
    }

    pub fn unregister_stream(&mut self, id: StreamId) {
        self.streams.remove(&id);
        self.paused_order.retain(|&p| p != id);
    }

    pub fn connection_window(&self) -> u64 {
        self.connection_window
    }

    pub fn stream_window(&self, id: StreamId) -> u64 {
        self.streams.get(&id).map(|s| s.window).unwrap_or(0)
    }

    /// How many of `want` bytes may be sent on `id` right now.
    pub fn sendable(&self, id: StreamId, want: u64) -> u64 {
        let stream = match self.streams.get(&id) {
            Some(s) => s,
            None => return 0,
        };
        want.min(self.connection_window).min(stream.window)
    }

    pub fn can_send(&self, id: StreamId, n_bytes: u64) -> bool {
        self.sendable(id, n_bytes) >= n_bytes
    }

    /// Debit `n_bytes` from both windows. Callers must have checked
    /// `sendable`; a window is never driven negative.
    pub fn consume_send_window(&mut self, id: StreamId, n_bytes: u64) {
        debug_assert!(self.can_send(id, n_bytes));
        self.connection_window = self.connection_window.saturating_sub(n_bytes);
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.window = stream.window.saturating_sub(n_bytes);
        }
    }

    /// Record that egress for `id` is blocked on flow control. Returns
    /// true on the pause edge so the transaction is only notified once.
    pub fn mark_paused(&mut self, id: StreamId) -> bool {
        match self.streams.get_mut(&id) {
            Some(stream) if !stream.paused => {
                stream.paused = true;
                self.paused_order.push(id);
                debug!(stream = id, "egress paused on flow control");
                true
            }
            _ => false,
        }
    }

    pub fn is_paused(&self, id: StreamId) -> bool {
        self.streams.get(&id).map(|s| s.paused).unwrap_or(false)
    }

    /// Stream-level window update. Updates for unknown streams are logged
    /// and ignored, not treated as errors.
    pub fn on_window_update(&mut self, id: StreamId, new_window: u64) {
        match self.streams.get_mut(&id) {
            Some(stream) => stream.window = new_window,
            None => {
                warn!(stream = id, "window update for unknown stream, ignoring");
            }
        }
    }

    pub fn on_connection_window_update(&mut self, new_window: u64) {
        if new_window > self.connection_window {
            self.connection_window = new_window;
        }
    }

    /// Drain the streams eligible to resume, in the order they paused.
    /// Called once per loop turn after every update in that turn has been
    /// applied, which is what coalesces resume notifications.
    pub fn take_resumable(&mut self) -> SmallVec<[StreamId; 4]> {
        if self.connection_window == 0 {
            return SmallVec::new();
        }
        let mut resumed = SmallVec::new();
        let mut still_paused = Vec::new();
        for id in self.paused_order.drain(..) {
            let eligible = self
                .streams
                .get(&id)
                .map(|s| s.window > 0)
                .unwrap_or(false);
            if eligible {
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.paused = false;
                }
                resumed.push(id);
            } else {
                still_paused.push(id);
            }
        }
        self.paused_order = still_paused;
        resumed
    }
}
