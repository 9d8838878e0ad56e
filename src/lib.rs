//! Server-side session layer multiplexing HTTP exchanges over a
//! QUIC-like transport.
//!
//! A [`session::Session`] sits between a transport (anything
//! implementing [`transport::QuicTransport`]) and the application's
//! request handlers. It is sans-I/O: the embedder feeds it
//! [`transport::TransportEvent`]s and turns the loop with
//! [`session::Session::run_loop_turn`]; the session never blocks and
//! never spawns.
//!
//! Three wire variants share one session: `Legacy` (HTTP/1.1 text
//! framing on a single stream), `Framed` (varint frames plus a control
//! stream) and `H3` (framed plus encoder/decoder instruction streams
//! and a shared dynamic header table).

pub mod codec;
pub mod compress;
pub mod consts;
pub mod drain;
pub mod egress;
pub mod flow;
pub mod push;
pub mod session;
pub mod stream;
pub mod transport;
pub mod txn;
pub mod types;
pub mod varint;

pub use egress::ByteEventKind;
pub use session::{Session, SessionConfig};
pub use transport::{QuicTransport, ReadChunk, StreamId, TransportError, TransportEvent, TransportInfo};
pub use txn::{Handler, HandlerProvider, PushInfo, Transaction, TxnId, TxnTransport};
pub use types::{
    ConnectionFatalKind, Header, Message, Priority, SessionError, StreamFatalKind, WireVariant,
};
