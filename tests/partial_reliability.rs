mod common;

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use common::*;
use quicmux::codec::Frame;
use quicmux::transport::TransportEvent;
use quicmux::types::WireVariant;
use quicmux::{ByteEventKind, Handler, Message, Transaction};

/// Responds with two 50-byte skippable chunks and tracks delivery of the
/// final body byte.
struct PartialResponder {
    log: Log,
    stream: u64,
}

impl PartialResponder {
    fn new(log: Log) -> Self {
        Self {
            log,
            stream: u64::MAX,
        }
    }
}

impl Handler for PartialResponder {
    fn on_headers_complete(&mut self, txn: &mut Transaction<'_>, _msg: Message) {
        self.stream = txn.stream_id().unwrap_or(u64::MAX);
        txn.enable_partial_reliability();
        let head = Message::response(200).header("content-length", "100");
        txn.send_headers(&head).expect("head");
        txn.send_body(Bytes::from(vec![b'a'; 50])).expect("chunk 1");
        txn.send_body(Bytes::from(vec![b'b'; 50])).expect("chunk 2");
        txn.send_eom().expect("eom");
        txn.track_body_delivery(100).expect("track final body byte");
    }

    fn on_body_rejected(&mut self, _txn: &mut Transaction<'_>, offset: u64) {
        self.log.borrow_mut().push((self.stream, Ev::BodyRejected(offset)));
    }

    fn on_byte_event(&mut self, _txn: &mut Transaction<'_>, event: ByteEventKind) {
        self.log.borrow_mut().push((self.stream, Ev::Byte(event)));
    }

    fn on_egress_paused(&mut self, _txn: &mut Transaction<'_>) {}

    fn on_detach(&mut self) {
        self.log.borrow_mut().push((self.stream, Ev::Detach));
    }
}

fn partial_session(transport: MockTransport, log: Log) -> quicmux::Session<MockTransport> {
    session(
        WireVariant::H3,
        transport.clone(),
        provider(move |_| Box::new(PartialResponder::new(log.clone()))),
    )
}

/// Length of the response HEADERS frame written on a stream.
fn head_len(transport: &MockTransport, id: u64) -> u64 {
    let written = transport.written(id);
    let (_, consumed) = Frame::parse(&written).expect("response head");
    consumed as u64
}

#[test]
fn aligned_rejection_skips_the_queued_chunk() {
    // Window starts closed so the whole response is still queued when
    // the rejection lands.
    let transport = MockTransport::with_windows(1 << 20, 0);
    let log = new_log();
    let mut session = partial_session(transport.clone(), log.clone());

    deliver(&mut session, &transport, 0, &get_request("/video"), true);
    assert_eq!(transport.written_len(0), 0);

    session.on_transport_event(TransportEvent::DataRejected(0, 50));
    assert_eq!(count(&log, 0, |e| *e == Ev::BodyRejected(50)), 1);

    transport.set_stream_window(0, 1 << 16);
    session.on_transport_event(TransportEvent::FlowControlUpdate(0));
    session.run_loop_turn();

    // First chunk's 50 body bytes were dropped; both 2-byte DATA frame
    // headers and the second chunk still went out.
    assert_eq!(transport.written_len(0), head_len(&transport, 0) + 2 + 2 + 50);
    assert!(transport.write_fin(0));
}

#[test]
fn misaligned_rejection_is_ignored() {
    let transport = MockTransport::with_windows(1 << 20, 0);
    let log = new_log();
    let mut session = partial_session(transport.clone(), log.clone());

    deliver(&mut session, &transport, 0, &get_request("/video"), true);
    session.on_transport_event(TransportEvent::DataRejected(0, 37));
    assert_eq!(count(&log, 0, |e| matches!(e, Ev::BodyRejected(_))), 0);

    transport.set_stream_window(0, 1 << 16);
    session.on_transport_event(TransportEvent::FlowControlUpdate(0));
    session.run_loop_turn();

    assert_eq!(transport.written_len(0), head_len(&transport, 0) + 2 + 50 + 2 + 50);
}

#[test]
fn tracked_body_delivery_fires_with_the_last_byte_ack() {
    let transport = MockTransport::new();
    let log = new_log();
    let mut session = partial_session(transport.clone(), log.clone());

    deliver(&mut session, &transport, 0, &get_request("/video"), true);

    // The tracked body offset and the terminal byte coincide here: the
    // terminal framing is empty on this variant.
    let end = transport.written_len(0);
    assert_eq!(transport.registered_offsets(0), vec![end, end]);

    session.on_transport_event(TransportEvent::DeliveryAck(0, end));
    assert_eq!(
        events_for(&log, 0),
        vec![
            Ev::Byte(ByteEventKind::BodyDelivered(100)),
            Ev::Byte(ByteEventKind::LastByteAcked),
            Ev::Detach,
        ]
    );
}

#[test]
fn delivery_cancel_surfaces_as_body_cancelled() {
    let transport = MockTransport::new();
    let log = new_log();
    let mut session = partial_session(transport.clone(), log.clone());

    deliver(&mut session, &transport, 0, &get_request("/video"), true);
    let end = transport.written_len(0);
    session.on_transport_event(TransportEvent::DeliveryCancel(0, end));

    // The cancelled last byte is not reported as a byte event; the body
    // registration flips to its cancelled form.
    assert_eq!(
        events_for(&log, 0),
        vec![Ev::Byte(ByteEventKind::BodyCancelled(100)), Ev::Detach]
    );
}

/// Skips part of its own response before anything is flushed.
struct SkippingResponder {
    applied: Rc<RefCell<Vec<Result<u64, String>>>>,
}

impl Handler for SkippingResponder {
    fn on_headers_complete(&mut self, txn: &mut Transaction<'_>, _msg: Message) {
        txn.enable_partial_reliability();
        let head = Message::response(200).header("content-length", "100");
        txn.send_headers(&head).expect("head");
        txn.send_body(Bytes::from(vec![b'a'; 50])).expect("chunk 1");
        txn.send_body(Bytes::from(vec![b'b'; 50])).expect("chunk 2");
        let mut applied = self.applied.borrow_mut();
        for offset in [150u64, 60, 10] {
            applied.push(txn.skip_body_to(offset).map_err(|e| e.to_string()));
        }
        drop(applied);
        txn.send_eom().expect("eom");
    }
}

#[test]
fn local_skip_is_monotone_and_bounded_by_declared_length() {
    let transport = MockTransport::new();
    let applied = Rc::new(RefCell::new(Vec::new()));
    let results = applied.clone();
    let mut session = session(
        WireVariant::H3,
        transport.clone(),
        provider(move |_| {
            Box::new(SkippingResponder {
                applied: results.clone(),
            })
        }),
    );

    deliver(&mut session, &transport, 0, &get_request("/video"), true);

    let applied = applied.borrow();
    assert!(applied[0].is_err(), "skip beyond declared length refused");
    assert_eq!(applied[1], Ok(60));
    // A lower offset is accepted but the cursor never moves back.
    assert_eq!(applied[2], Ok(60));
    drop(applied);

    // Chunk 1 dropped whole, chunk 2 truncated to its last 40 bytes.
    assert_eq!(transport.written_len(0), head_len(&transport, 0) + 2 + 2 + 40);
    assert!(transport.write_fin(0));
}
