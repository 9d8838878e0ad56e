//! Graceful-drain state machine.
//!
//! Framed variants drain with a two-phase GOAWAY: an effectively
//! unbounded soft cutoff emitted as soon as shutdown is requested (after
//! SETTINGS, never before), then a hard cutoff naming the highest stream
//! id actually serviced, emitted only once every stream open at drain
//! time has finished. The legacy variant has no GOAWAY; it drains by a
//! `Connection: close` header echo.

use tracing::{debug, info};

use crate::transport::StreamId;
use crate::types::{ConnectionFatalKind, WireVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Active,
    ShutdownRequested,
    GoawaySentSoft,
    GoawaySentHard,
    Closing,
    Closed,
}

#[derive(Debug)]
pub struct DrainController {
    variant: WireVariant,
    state: DrainState,
    settings_sent: bool,
    soft_cutoff: Option<StreamId>,
    hard_cutoff: Option<StreamId>,
    /// Legacy variant: we announced `Connection: close`.
    close_announced: bool,
}

impl DrainController {
    pub fn new(variant: WireVariant) -> Self {
        Self {
            variant,
            state: DrainState::Active,
            settings_sent: false,
            soft_cutoff: None,
            hard_cutoff: None,
            close_announced: false,
        }
    }

    pub fn state(&self) -> DrainState {
        self.state
    }

    pub fn is_draining(&self) -> bool {
        !matches!(self.state, DrainState::Active)
    }

    pub fn settings_sent(&self) -> bool {
        self.settings_sent
    }

    /// At most one SETTINGS may ever be sent; a second is a protocol
    /// violation that kills the connection.
    pub fn mark_settings_sent(&mut self) -> Result<(), ConnectionFatalKind> {
        if self.settings_sent {
            return Err(ConnectionFatalKind::FrameUnexpected(
                "duplicate SETTINGS".to_string(),
            ));
        }
        self.settings_sent = true;
        Ok(())
    }

    /// Begin draining. For framed variants, returns the soft GOAWAY
    /// cutoff to emit (callers must have sent SETTINGS first; emitting a
    /// GOAWAY before SETTINGS is checked by `goaway_permitted`). The soft
    /// cutoff is effectively unbounded so in-flight streams delivered out
    /// of order are still serviced. Returns `None` when already draining
    /// or when the variant drains by header echo.
    pub fn request_shutdown(&mut self, soft_cutoff: StreamId) -> Option<StreamId> {
        if self.is_draining() {
            return None;
        }
        self.state = DrainState::ShutdownRequested;
        if !self.variant.uses_control_stream() {
            self.close_announced = true;
            debug!("legacy drain: announcing Connection: close");
            return None;
        }
        self.state = DrainState::GoawaySentSoft;
        self.soft_cutoff = Some(soft_cutoff);
        info!(cutoff = soft_cutoff, "soft GOAWAY");
        Some(soft_cutoff)
    }

    pub fn goaway_permitted(&self) -> Result<(), ConnectionFatalKind> {
        if !self.settings_sent {
            return Err(ConnectionFatalKind::FrameUnexpected(
                "GOAWAY before SETTINGS".to_string(),
            ));
        }
        Ok(())
    }

    /// Every stream that was open at drain time has detached: emit the
    /// hard GOAWAY. The hard cutoff is the highest id actually serviced
    /// and never exceeds the soft cutoff.
    pub fn on_streams_drained(&mut self, highest_serviced: StreamId) -> Option<StreamId> {
        if self.state != DrainState::GoawaySentSoft {
            return None;
        }
        let soft = self.soft_cutoff.unwrap_or(highest_serviced);
        let hard = highest_serviced.min(soft);
        self.hard_cutoff = Some(hard);
        self.state = DrainState::GoawaySentHard;
        info!(cutoff = hard, "hard GOAWAY");
        Some(hard)
    }

    pub fn mark_closing(&mut self) {
        if self.state != DrainState::Closed {
            self.state = DrainState::Closing;
        }
    }

    pub fn mark_closed(&mut self) {
        self.state = DrainState::Closed;
    }

    /// Legacy variant: the peer echoed `Connection: close`.
    pub fn on_close_echoed(&mut self) -> bool {
        if self.close_announced {
            self.state = DrainState::Closing;
            return true;
        }
        false
    }

    pub fn close_announced(&self) -> bool {
        self.close_announced
    }

    /// Whether a newly observed stream id may still be admitted. The
    /// cutoffs are inclusive: an id at or below the announced cutoff is
    /// serviced, anything above it is refused.
    pub fn accepts_stream(&self, id: StreamId) -> bool {
        match self.state {
            DrainState::Active | DrainState::ShutdownRequested => true,
            DrainState::GoawaySentSoft => self.soft_cutoff.map(|c| id <= c).unwrap_or(true),
            DrainState::GoawaySentHard | DrainState::Closing => {
                self.hard_cutoff.map(|c| id <= c).unwrap_or(false)
            }
            DrainState::Closed => false,
        }
    }

    pub fn hard_cutoff(&self) -> Option<StreamId> {
        self.hard_cutoff
    }

    pub fn soft_cutoff(&self) -> Option<StreamId> {
        self.soft_cutoff
    }
}
