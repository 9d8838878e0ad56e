use crate::transport::TransportError;

/// Session-level error taxonomy.
///
/// The session is solely responsible for classifying raw transport and
/// codec failures into one of these classes and for choosing whether the
/// failure is scoped to one stream or to the whole connection. Soft errors
/// (skip-offset misalignment, unknown-stream window updates, duplicate
/// grease-stream data) are logged where they occur and never reach this
/// type.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Per-stream recoverable: the bound transaction is told, the peer
    /// gets a normal HTTP error response when egress still permits one,
    /// and the stream lives on until detach.
    Recoverable { status: Option<u16>, message: String },

    /// Per-stream fatal: delivered once to the transaction, then the
    /// stream is torn down. No retry.
    StreamFatal(StreamFatalKind),

    /// Connection fatal: every still-open transaction receives exactly
    /// one error callback, in stable order, before the session reports
    /// itself closed.
    ConnectionFatal(ConnectionFatalKind),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFatalKind {
    Reset(u64),
    StopSending(u64),
    WriteError(String),
    ParseError(String),
    DeliveryRegistration(String),
    Timeout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionFatalKind {
    /// Duplicate SETTINGS, or GOAWAY sequenced before SETTINGS.
    FrameUnexpected(String),
    /// A second control-stream preface of the same direction.
    StreamCreation(String),
    /// A control or instruction stream closed or reset underneath us.
    ClosedCriticalStream(String),
    Transport(String),
    Dropped,
}

impl SessionError {
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, SessionError::ConnectionFatal(_))
    }

    /// HTTP status to answer the peer with, when one applies.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            SessionError::Recoverable { status, .. } => *status,
            _ => None,
        }
    }

    /// Scope a raw transport failure to one stream.
    pub fn from_stream_transport(err: TransportError) -> Self {
        match err {
            TransportError::UnknownStream => {
                SessionError::StreamFatal(StreamFatalKind::WriteError(
                    "stream does not exist at transport".to_string(),
                ))
            }
            TransportError::InvalidOperation(msg) => {
                SessionError::StreamFatal(StreamFatalKind::WriteError(msg))
            }
            TransportError::WouldBlock => SessionError::StreamFatal(
                StreamFatalKind::WriteError("transport rejected write".to_string()),
            ),
            TransportError::Internal(msg) => {
                SessionError::StreamFatal(StreamFatalKind::WriteError(msg))
            }
        }
    }

    /// Scope a raw transport failure to the whole connection.
    pub fn from_connection_transport(err: TransportError) -> Self {
        SessionError::ConnectionFatal(ConnectionFatalKind::Transport(err.to_string()))
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Recoverable { status, message } => match status {
                Some(code) => write!(f, "recoverable error (HTTP {}): {}", code, message),
                None => write!(f, "recoverable error: {}", message),
            },
            SessionError::StreamFatal(kind) => write!(f, "stream error: {}", kind),
            SessionError::ConnectionFatal(kind) => write!(f, "connection error: {}", kind),
        }
    }
}

impl std::error::Error for SessionError {}

impl std::fmt::Display for StreamFatalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamFatalKind::Reset(code) => write!(f, "stream reset with code 0x{:x}", code),
            StreamFatalKind::StopSending(code) => {
                write!(f, "peer sent STOP_SENDING with code 0x{:x}", code)
            }
            StreamFatalKind::WriteError(msg) => write!(f, "write failed: {}", msg),
            StreamFatalKind::ParseError(msg) => write!(f, "parse error: {}", msg),
            StreamFatalKind::DeliveryRegistration(msg) => {
                write!(f, "delivery callback registration failed: {}", msg)
            }
            StreamFatalKind::Timeout => write!(f, "transaction timed out"),
        }
    }
}

impl std::fmt::Display for ConnectionFatalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionFatalKind::FrameUnexpected(msg) => {
                write!(f, "frame unexpected: {}", msg)
            }
            ConnectionFatalKind::StreamCreation(msg) => {
                write!(f, "stream creation error: {}", msg)
            }
            ConnectionFatalKind::ClosedCriticalStream(msg) => {
                write!(f, "critical stream closed: {}", msg)
            }
            ConnectionFatalKind::Transport(msg) => write!(f, "transport error: {}", msg),
            ConnectionFatalKind::Dropped => write!(f, "connection dropped"),
        }
    }
}

impl From<StreamFatalKind> for SessionError {
    fn from(kind: StreamFatalKind) -> Self {
        SessionError::StreamFatal(kind)
    }
}

impl From<ConnectionFatalKind> for SessionError {
    fn from(kind: ConnectionFatalKind) -> Self {
        SessionError::ConnectionFatal(kind)
    }
}
