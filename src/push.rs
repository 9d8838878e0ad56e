//! Server push accounting.
//!
//! Push ids are allocated sequentially and may only be used while they
//! stay at or below the peer's advertised MAX_PUSH_ID limit. A GOAWAY
//! from the peer lowers the usable range further. The limit only ever
//! grows from MAX_PUSH_ID; a smaller advertisement is ignored.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::transport::StreamId;

#[derive(Debug, Clone, PartialEq)]
pub enum PushError {
    /// No MAX_PUSH_ID received yet, or the next id exceeds the limit.
    LimitExceeded { next: u64, max: Option<u64> },
    /// The peer's GOAWAY excludes this push id.
    PeerGoaway { next: u64, goaway: u64 },
}

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushError::LimitExceeded { next, max } => match max {
                Some(max) => write!(f, "push id {} exceeds peer limit {}", next, max),
                None => write!(f, "push id {} but peer never sent MAX_PUSH_ID", next),
            },
            PushError::PeerGoaway { next, goaway } => {
                write!(f, "push id {} refused by peer GOAWAY at {}", next, goaway)
            }
        }
    }
}

impl std::error::Error for PushError {}

#[derive(Debug, Default)]
pub struct PushManager {
    next_push_id: u64,
    max_allowed: Option<u64>,
    peer_goaway: Option<u64>,
    active: HashMap<u64, StreamId>,
}

impl PushManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_allowed_push_id(&self) -> Option<u64> {
        self.max_allowed
    }

    pub fn num_active(&self) -> usize {
        self.active.len()
    }

    /// MAX_PUSH_ID from the peer. Monotone.
    pub fn on_max_push_id(&mut self, id: u64) {
        match self.max_allowed {
            Some(current) if id <= current => {
                warn!(id, current, "MAX_PUSH_ID did not raise the limit, ignoring");
            }
            _ => {
                debug!(id, "push id limit raised");
                self.max_allowed = Some(id);
            }
        }
    }

    /// Peer GOAWAY carrying the first refused push id.
    pub fn on_peer_goaway(&mut self, id: u64) {
        self.peer_goaway = Some(match self.peer_goaway {
            Some(current) => current.min(id),
            None => id,
        });
    }

    pub fn allocate(&mut self) -> Result<u64, PushError> {
        let next = self.next_push_id;
        match self.max_allowed {
            Some(max) if next <= max => {}
            max => return Err(PushError::LimitExceeded { next, max }),
        }
        if let Some(goaway) = self.peer_goaway {
            if next >= goaway {
                return Err(PushError::PeerGoaway { next, goaway });
            }
        }
        self.next_push_id += 1;
        Ok(next)
    }

    pub fn bind(&mut self, push_id: u64, stream: StreamId) {
        self.active.insert(push_id, stream);
    }

    pub fn stream_for(&self, push_id: u64) -> Option<StreamId> {
        self.active.get(&push_id).copied()
    }

    pub fn complete(&mut self, push_id: u64) {
        self.active.remove(&push_id);
    }
}
