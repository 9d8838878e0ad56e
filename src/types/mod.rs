pub mod error;
pub mod header;
pub mod message;
pub mod priority;

pub use error::*;
pub use header::*;
pub use message::*;
pub use priority::*;

/// Wire variant negotiated once per connection. Selects the codec strategy
/// and the drain protocol (GOAWAY for framed variants, `Connection: close`
/// echo for the legacy single-stream variant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireVariant {
    /// HTTP/1.1 text framing over a single bidirectional stream.
    Legacy,
    /// Varint frames plus a control stream, no dynamic header table.
    Framed,
    /// HTTP/3 proper: framed plus encoder/decoder instruction streams.
    H3,
}

impl WireVariant {
    /// The legacy variant serializes exchanges on one stream; the framed
    /// variants multiplex.
    pub fn supports_parallel_requests(&self) -> bool {
        !matches!(self, WireVariant::Legacy)
    }

    pub fn uses_control_stream(&self) -> bool {
        !matches!(self, WireVariant::Legacy)
    }
}
